use serde::{Deserialize, Serialize};

use crate::config::MAX_ROUND_DURATION_SECS;
use crate::event::state::SettingsUpdate;
use crate::matching::{Participant, ParticipantId, ParticipantStatus, Profile, Source};

/// A participant as registered ahead of time or at the door.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub colocation_group: Option<String>,
    #[serde(default)]
    pub source: Option<Source>,
    #[serde(default)]
    pub profile: Profile,
}

impl Registration {
    /// Registered participants start checked out until they arrive.
    pub fn into_participant(self, default_source: Source) -> Participant {
        Participant {
            id: ParticipantId::new(self.id),
            name: self.name.trim().to_string(),
            status: ParticipantStatus::CheckedOut,
            colocation_group: self.colocation_group.filter(|g| !g.trim().is_empty()),
            source: self.source.unwrap_or(default_source),
            profile: self.profile,
            pit_stops: Default::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateEventRequest {
    pub event_id: String,
    #[serde(default)]
    pub participants: Vec<Registration>,
    #[serde(default)]
    pub scores: Vec<PairScore>,
    /// Check everyone in right away.
    #[serde(default)]
    pub check_in_all: bool,
}

#[derive(Debug, Deserialize)]
pub struct CheckInRequest {
    pub participant_id: String,
    /// Present for walk-ins that were never registered.
    #[serde(default)]
    pub registration: Option<Registration>,
}

#[derive(Debug, Deserialize)]
pub struct CheckOutRequest {
    pub participant_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SwapRequest {
    pub round_number: u32,
    pub participant_a: String,
    pub participant_b: String,
}

#[derive(Debug, Deserialize)]
pub struct SignalRequest {
    pub round_number: u32,
    pub from_participant: String,
    pub to_participant: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairScore {
    pub a: String,
    pub b: String,
    pub score: f64,
}

#[derive(Debug, Deserialize)]
pub struct ScoresRequest {
    pub scores: Vec<PairScore>,
}

#[derive(Debug, Deserialize)]
pub struct SettingsRequest {
    pub round_duration_minutes: Option<u64>,
    pub total_rounds: Option<u32>,
    pub lookahead_rounds: Option<u32>,
}

impl SettingsRequest {
    pub fn to_update(&self) -> SettingsUpdate {
        SettingsUpdate {
            round_duration_secs: self.round_duration_minutes.map(|m| m.saturating_mul(60)),
            total_rounds: self.total_rounds,
            lookahead_rounds: self.lookahead_rounds,
        }
    }
}

/// Largest magnitude accepted for an imported pair score.
pub const MAX_PAIR_SCORE: f64 = 1_000_000.0;

/// Event ids name files on disk, so only a conservative character set is allowed.
pub fn validate_event_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("Event id is required".to_string());
    }
    if id.len() > 64 {
        return Err("Event id must be at most 64 characters".to_string());
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err("Event id may only contain letters, digits, '-' and '_'".to_string());
    }
    Ok(())
}

/// Participant ids become halves of "a:b" pair keys, so ':' is reserved.
pub fn validate_participant_id(id: &str) -> Result<(), String> {
    if id.trim().is_empty() {
        return Err("Participant id is required".to_string());
    }
    if id.trim() != id {
        return Err(format!("Participant id '{}' has surrounding whitespace", id));
    }
    if id.contains(':') {
        return Err(format!("Participant id '{}' must not contain ':'", id));
    }
    if id.len() > 128 {
        return Err("Participant id must be at most 128 characters".to_string());
    }
    Ok(())
}

pub fn validate_registration(reg: &Registration) -> Result<(), String> {
    validate_participant_id(&reg.id)?;
    if reg.name.trim().is_empty() {
        return Err(format!("Name is required for participant '{}'", reg.id));
    }
    Ok(())
}

pub fn validate_scores(req: &ScoresRequest) -> Result<(), String> {
    for entry in &req.scores {
        validate_participant_id(&entry.a)?;
        validate_participant_id(&entry.b)?;
        if entry.a == entry.b {
            return Err(format!("Cannot score '{}' against themselves", entry.a));
        }
        if !entry.score.is_finite() || entry.score.abs() > MAX_PAIR_SCORE {
            return Err(format!(
                "Score for {}:{} must be a number between -{MAX_PAIR_SCORE} and {MAX_PAIR_SCORE}",
                entry.a, entry.b
            ));
        }
    }
    Ok(())
}

pub fn validate_swap(req: &SwapRequest) -> Result<(), String> {
    validate_participant_id(&req.participant_a)?;
    validate_participant_id(&req.participant_b)?;
    if req.participant_a == req.participant_b {
        return Err("Swap needs two different participants".to_string());
    }
    Ok(())
}

pub fn validate_settings(req: &SettingsRequest) -> Result<(), String> {
    if req.round_duration_minutes == Some(0) {
        return Err("Round duration must be at least one minute".to_string());
    }
    if req.round_duration_minutes.is_some_and(|m| m > MAX_ROUND_DURATION_SECS / 60) {
        return Err(format!("Round duration must be at most {} minutes", MAX_ROUND_DURATION_SECS / 60));
    }
    if req.lookahead_rounds == Some(0) {
        return Err("Lookahead must be at least one round".to_string());
    }
    Ok(())
}
