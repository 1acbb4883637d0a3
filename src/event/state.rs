use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{EngineConfig, ScoringConfig, MAX_ROUND_DURATION_SECS};
use crate::error::EngineError;
use crate::matching::compatibility::{score_with_repeat_override, InterestSignals, ScoreSource, ScoringContext, Verdict};
use crate::matching::types::average;
use crate::matching::{
    PairKey, Pairing, PairingHistory, Participant, ParticipantId, ParticipantStatus, PitStopLedger, PlannedRound,
    RoundResult, Signal,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    NotStarted,
    InProgress,
    Paused,
    BetweenRounds,
    /// Terminal: rounds are over, attendees mingle freely.
    OpenNetworking,
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RoundStatus::NotStarted => "not started",
            RoundStatus::InProgress => "in progress",
            RoundStatus::Paused => "paused",
            RoundStatus::BetweenRounds => "between rounds",
            RoundStatus::OpenNetworking => "in open networking",
        };
        f.write_str(label)
    }
}

/// Countdown for the current round. Running timers carry `ends_at`, paused ones
/// carry `remaining_secs`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundTimer {
    pub ends_at: Option<DateTime<Utc>>,
    pub remaining_secs: Option<u64>,
}

fn ends_after(now: DateTime<Utc>, secs: u64) -> Result<DateTime<Utc>, EngineError> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|span| now.checked_add_signed(span))
        .ok_or_else(|| EngineError::ConstraintViolation(format!("round duration of {secs}s is out of range")))
}

impl RoundTimer {
    pub fn start(&mut self, now: DateTime<Utc>, duration_secs: u64) -> Result<(), EngineError> {
        self.ends_at = Some(ends_after(now, duration_secs)?);
        self.remaining_secs = None;
        Ok(())
    }

    pub fn pause(&mut self, now: DateTime<Utc>) {
        if let Some(end) = self.ends_at.take() {
            self.remaining_secs = Some((end - now).num_seconds().max(0) as u64);
        }
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        if let Some(remaining) = self.remaining_secs {
            self.ends_at = Some(ends_after(now, remaining)?);
            self.remaining_secs = None;
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.ends_at = None;
        self.remaining_secs = None;
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Option<u64> {
        match (self.ends_at, self.remaining_secs) {
            (Some(end), _) => Some((end - now).num_seconds().max(0) as u64),
            (None, remaining) => remaining,
        }
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.ends_at.is_some_and(|end| end <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSettings {
    pub round_duration_secs: u64,
    pub total_rounds: u32,
    pub lookahead_rounds: u32,
}

impl EventSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        EventSettings {
            round_duration_secs: config.event.round_duration_secs,
            total_rounds: config.event.total_rounds,
            lookahead_rounds: config.solver.lookahead_rounds.max(1),
        }
    }
}

/// Partial settings change; absent fields stay as they are.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsUpdate {
    pub round_duration_secs: Option<u64>,
    pub total_rounds: Option<u32>,
    pub lookahead_rounds: Option<u32>,
}

/// Authoritative state of one event. Every method here is a pure transition:
/// the engine applies it to a copy and installs the copy only once it is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventState {
    pub event_id: String,
    /// Last committed round; 0 before the first round.
    pub round_number: u32,
    pub status: RoundStatus,
    pub participants: BTreeMap<ParticipantId, Participant>,
    pub rounds: Vec<RoundResult>,
    pub history: PairingHistory,
    pub settings: EventSettings,
    pub timer: RoundTimer,
    pub signals: Vec<Signal>,
    /// Mutual matches and the round they happened in.
    pub mutual_matches: BTreeMap<PairKey, u32>,
    /// Bumped on every stored change.
    pub version: u64,
}

impl EventState {
    pub fn new(event_id: impl Into<String>, settings: EventSettings) -> Self {
        EventState {
            event_id: event_id.into(),
            round_number: 0,
            status: RoundStatus::NotStarted,
            participants: BTreeMap::new(),
            rounds: Vec::new(),
            history: PairingHistory::new(),
            settings,
            timer: RoundTimer::default(),
            signals: Vec::new(),
            mutual_matches: BTreeMap::new(),
            version: 0,
        }
    }

    pub fn active_pool(&self) -> Vec<&Participant> {
        self.participants.values().filter(|p| p.is_active()).collect()
    }

    pub fn current_round(&self) -> Option<&RoundResult> {
        self.rounds.last()
    }

    pub fn pit_stop_ledger(&self) -> PitStopLedger {
        PitStopLedger::from_participants(self.participants.values())
    }

    pub fn interest_signals(&self) -> InterestSignals {
        InterestSignals::from_signals(&self.signals)
    }

    pub fn rounds_remaining(&self) -> u32 {
        self.settings.total_rounds.saturating_sub(self.round_number)
    }

    /// Lookahead for the next solve: never past the last round, never below one.
    pub fn horizon(&self) -> u32 {
        self.settings.lookahead_rounds.min(self.rounds_remaining()).max(1)
    }

    fn require(&self, operation: &'static str, allowed: &[RoundStatus]) -> Result<(), EngineError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(EngineError::InvalidTransition { operation, status: self.status })
        }
    }

    pub fn ensure_can_advance(&self) -> Result<(), EngineError> {
        self.require("advance the round", &[RoundStatus::NotStarted, RoundStatus::BetweenRounds])?;
        if self.round_number >= self.settings.total_rounds {
            return Err(EngineError::RoundsExhausted { total: self.settings.total_rounds });
        }
        Ok(())
    }

    /// Commits a solved round: history, pit stop, round counter and timer move
    /// together.
    pub fn apply_round(
        &mut self,
        planned: &PlannedRound,
        degraded: bool,
        now: DateTime<Utc>,
    ) -> Result<RoundResult, EngineError> {
        self.ensure_can_advance()?;
        let mut timer = RoundTimer::default();
        timer.start(now, self.settings.round_duration_secs)?;
        let round_number = self.round_number + 1;
        if planned.round_number != round_number {
            return Err(EngineError::ConstraintViolation(format!(
                "planned round {} does not follow round {}",
                planned.round_number, self.round_number
            )));
        }

        let mut seated = BTreeSet::new();
        for pairing in &planned.pairings {
            for id in [&pairing.a, &pairing.b] {
                self.require_active(id)?;
                if !seated.insert(id.clone()) {
                    return Err(EngineError::ConstraintViolation(format!("{id} is seated twice")));
                }
            }
            if self.history.contains(&pairing.key()) {
                return Err(EngineError::ConstraintViolation(format!(
                    "{} already met in an earlier round",
                    pairing.key()
                )));
            }
        }
        if let Some(pit) = &planned.pit_stop {
            self.require_active(pit)?;
            if seated.contains(pit) {
                return Err(EngineError::ConstraintViolation(format!("{pit} is both seated and sitting out")));
            }
        }

        let introduced: Vec<PairKey> = planned
            .pairings
            .iter()
            .map(Pairing::key)
            .filter(|key| self.history.insert(key.clone()))
            .collect();
        if let Some(pit) = &planned.pit_stop {
            if let Some(participant) = self.participants.get_mut(pit) {
                participant.pit_stops.insert(round_number);
            }
        }

        let mut result = RoundResult {
            round_number,
            pairings: planned.pairings.clone(),
            pit_stop: planned.pit_stop.clone(),
            average_score: 0.0,
            provisional_pairs: 0,
            degraded,
            introduced,
            created_at: now,
        };
        result.recompute_average();

        self.rounds.push(result.clone());
        self.round_number = round_number;
        self.status = RoundStatus::InProgress;
        self.timer = timer;
        Ok(result)
    }

    pub fn finish_round(&mut self) -> Result<(), EngineError> {
        self.require("finish the round", &[RoundStatus::InProgress, RoundStatus::Paused])?;
        self.status = RoundStatus::BetweenRounds;
        self.timer.clear();
        Ok(())
    }

    /// Finishes a running round whose timer has run out. Returns whether it did.
    pub fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == RoundStatus::InProgress && self.timer.expired(now) {
            self.status = RoundStatus::BetweenRounds;
            self.timer.clear();
            true
        } else {
            false
        }
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.require("pause", &[RoundStatus::InProgress])?;
        self.timer.pause(now);
        self.status = RoundStatus::Paused;
        Ok(())
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.require("resume", &[RoundStatus::Paused])?;
        self.timer.resume(now)?;
        self.status = RoundStatus::InProgress;
        Ok(())
    }

    /// Removes the last round and everything it added.
    pub fn undo_last_round(&mut self) -> Result<RoundResult, EngineError> {
        self.require(
            "undo the last round",
            &[RoundStatus::InProgress, RoundStatus::Paused, RoundStatus::BetweenRounds],
        )?;
        let undone = self
            .rounds
            .pop()
            .ok_or_else(|| EngineError::ConstraintViolation("no round to undo".into()))?;

        for key in &undone.introduced {
            self.history.remove(key);
        }
        if let Some(pit) = &undone.pit_stop {
            if let Some(participant) = self.participants.get_mut(pit) {
                participant.pit_stops.remove(&undone.round_number);
            }
        }
        self.signals.retain(|s| s.round_number != undone.round_number);
        self.mutual_matches.retain(|_, round| *round != undone.round_number);

        self.round_number = undone.round_number - 1;
        self.status = RoundStatus::BetweenRounds;
        self.timer.clear();
        Ok(undone)
    }

    /// Exchanges the partners of `x` and `y` in the current round. The no-repeat
    /// rule is waived; every other hard constraint still applies.
    pub fn swap_partners(
        &mut self,
        round_number: u32,
        x: &ParticipantId,
        y: &ParticipantId,
        source: &dyn ScoreSource,
        scoring: &ScoringConfig,
    ) -> Result<RoundResult, EngineError> {
        self.require(
            "swap partners",
            &[RoundStatus::InProgress, RoundStatus::Paused, RoundStatus::BetweenRounds],
        )?;
        if round_number == 0 || round_number != self.round_number {
            return Err(EngineError::ConstraintViolation(format!(
                "only the current round ({}) can be changed",
                self.round_number
            )));
        }
        let participant = |id: &ParticipantId| {
            self.participants
                .get(id)
                .cloned()
                .ok_or_else(|| EngineError::UnknownParticipant(id.to_string()))
        };
        let (px, py) = (participant(x)?, participant(y)?);

        let round = self
            .rounds
            .last()
            .ok_or_else(|| EngineError::ConstraintViolation("no round to change".into()))?;
        let seat = |id: &ParticipantId| {
            round
                .pairings
                .iter()
                .position(|p| p.involves(id))
                .ok_or_else(|| EngineError::ConstraintViolation(format!("{id} is not seated this round")))
        };
        let (ix, iy) = (seat(x)?, seat(y)?);
        if ix == iy {
            return Err(EngineError::ConstraintViolation(format!("{x} and {y} already share a table")));
        }
        let partner = |index: usize, id: &ParticipantId| -> Result<Participant, EngineError> {
            let other = round.pairings[index]
                .partner_of(id)
                .ok_or_else(|| EngineError::Internal(format!("{id} lost their table")))?;
            participant(other)
        };
        let (partner_x, partner_y) = (partner(ix, x)?, partner(iy, y)?);

        let signals = self.interest_signals();
        let ctx = ScoringContext { source, history: &self.history, signals: &signals, config: scoring };
        let rescore = |a: &Participant, b: &Participant, table_number: u32| match score_with_repeat_override(a, b, &ctx) {
            Verdict::Scored(scored) => {
                let key = PairKey::new(&a.id, &b.id);
                Ok(Pairing {
                    table_number,
                    a: key.low().clone(),
                    b: key.high().clone(),
                    score: scored.value,
                    provisional: scored.provisional,
                })
            }
            Verdict::Blocked(reason) => Err(EngineError::ConstraintViolation(format!(
                "{} and {} cannot be paired: {reason:?}",
                a.id, b.id
            ))),
        };
        let new_x = rescore(&px, &partner_y, round.pairings[ix].table_number)?;
        let new_y = rescore(&py, &partner_x, round.pairings[iy].table_number)?;
        let old_keys = [round.pairings[ix].key(), round.pairings[iy].key()];

        let mut round = round.clone();
        for key in &old_keys {
            if let Some(pos) = round.introduced.iter().position(|k| k == key) {
                round.introduced.remove(pos);
                self.history.remove(key);
            }
        }
        for pairing in [&new_x, &new_y] {
            if self.history.insert(pairing.key()) {
                round.introduced.push(pairing.key());
            }
        }
        round.pairings[ix] = new_x;
        round.pairings[iy] = new_y;
        round.recompute_average();

        // Signals name a partner; the broken pairs' ones no longer hold.
        self.signals
            .retain(|s| s.round_number != round_number || !old_keys.contains(&PairKey::new(&s.from, &s.to)));
        self.mutual_matches
            .retain(|key, at| *at != round_number || !old_keys.contains(key));

        if let Some(last) = self.rounds.last_mut() {
            *last = round.clone();
        }
        Ok(round)
    }

    /// Activates a known participant, or registers `walk_in` when the id is new.
    /// Returns true for a new registration.
    pub fn check_in(&mut self, id: &ParticipantId, walk_in: Option<Participant>) -> Result<bool, EngineError> {
        if let Some(existing) = self.participants.get_mut(id) {
            existing.status = ParticipantStatus::Active;
            return Ok(false);
        }
        let mut participant = walk_in.ok_or_else(|| EngineError::UnknownParticipant(id.to_string()))?;
        if &participant.id != id {
            return Err(EngineError::InvalidRequest(format!(
                "registration for {} does not match {id}",
                participant.id
            )));
        }
        participant.status = ParticipantStatus::Active;
        self.participants.insert(id.clone(), participant);
        Ok(true)
    }

    pub fn check_out(&mut self, id: &ParticipantId) -> Result<(), EngineError> {
        let participant = self
            .participants
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownParticipant(id.to_string()))?;
        participant.status = ParticipantStatus::CheckedOut;
        Ok(())
    }

    pub fn end_event(&mut self) -> Result<(), EngineError> {
        self.require("end the event", &[RoundStatus::BetweenRounds])?;
        self.status = RoundStatus::OpenNetworking;
        self.timer.clear();
        Ok(())
    }

    pub fn update_settings(&mut self, update: &SettingsUpdate) -> Result<(), EngineError> {
        if let Some(total) = update.total_rounds {
            if total < self.round_number {
                return Err(EngineError::ConstraintViolation(format!(
                    "total rounds ({total}) cannot drop below the current round ({})",
                    self.round_number
                )));
            }
        }
        if update.round_duration_secs == Some(0) {
            return Err(EngineError::ConstraintViolation("round duration must be positive".into()));
        }
        if update.round_duration_secs.is_some_and(|secs| secs > MAX_ROUND_DURATION_SECS) {
            return Err(EngineError::ConstraintViolation(format!(
                "round duration cannot exceed {MAX_ROUND_DURATION_SECS} seconds"
            )));
        }
        if let Some(secs) = update.round_duration_secs {
            self.settings.round_duration_secs = secs;
        }
        if let Some(total) = update.total_rounds {
            self.settings.total_rounds = total;
        }
        if let Some(lookahead) = update.lookahead_rounds {
            self.settings.lookahead_rounds = lookahead.max(1);
        }
        Ok(())
    }

    /// Records follow-up interest from `from` in their partner of `round_number`.
    /// Returns true when the signal completes a mutual match.
    pub fn record_signal(
        &mut self,
        round_number: u32,
        from: &ParticipantId,
        to: &ParticipantId,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        if !matches!(
            self.status,
            RoundStatus::InProgress | RoundStatus::Paused | RoundStatus::BetweenRounds
        ) || round_number == 0
            || round_number != self.round_number
        {
            return Err(EngineError::SignalRejected(format!(
                "round {round_number} is not open for signals"
            )));
        }
        let round = self
            .current_round()
            .ok_or_else(|| EngineError::SignalRejected("no round has been played".into()))?;
        let pairing = round
            .pairing_of(from)
            .ok_or_else(|| EngineError::SignalRejected(format!("{from} was not seated in round {round_number}")))?;
        if pairing.partner_of(from) != Some(to) {
            return Err(EngineError::SignalRejected(format!(
                "{to} was not {from}'s partner in round {round_number}"
            )));
        }

        let already = self
            .signals
            .iter()
            .any(|s| s.round_number == round_number && &s.from == from && &s.to == to);
        if !already {
            self.signals.push(Signal {
                round_number,
                from: from.clone(),
                to: to.clone(),
                recorded_at: now,
            });
        }

        let mutual = self
            .signals
            .iter()
            .any(|s| s.round_number == round_number && &s.from == to && &s.to == from);
        if mutual {
            self.mutual_matches.entry(PairKey::new(from, to)).or_insert(round_number);
        }
        Ok(mutual)
    }

    /// Active pairs that have not met and still lack a base score.
    pub fn pending_scoring(&self, source: &dyn ScoreSource) -> Vec<PairKey> {
        let pool = self.active_pool();
        let mut pending = Vec::new();
        for (i, a) in pool.iter().enumerate() {
            for b in &pool[i + 1..] {
                let key = PairKey::new(&a.id, &b.id);
                if !self.history.contains(&key) && source.base_score(&key).is_none() {
                    pending.push(key);
                }
            }
        }
        pending
    }

    pub fn average_score(&self) -> f64 {
        self.current_round().map_or(0.0, |round| average(&round.pairings))
    }

    fn require_active(&self, id: &ParticipantId) -> Result<(), EngineError> {
        match self.participants.get(id) {
            Some(p) if p.is_active() => Ok(()),
            Some(_) => Err(EngineError::ConstraintViolation(format!("{id} has checked out"))),
            None => Err(EngineError::UnknownParticipant(id.to_string())),
        }
    }
}
