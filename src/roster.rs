use std::path::Path;

use csv::Reader;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::matching::{
    Arrangement, CompatibilityMatrix, Lane, Participant, ParticipantStatus, Profile, Role, Source,
};
use crate::requests::{validate_registration, validate_scores, PairScore, Registration, ScoresRequest};

/// Attendees and precomputed pair scores for one event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Roster {
    #[serde(default)]
    pub participants: Vec<Registration>,
    #[serde(default)]
    pub scores: Vec<PairScore>,
}

impl Roster {
    /// Validates the roster and turns it into engine inputs. Later registrations
    /// with a repeated id replace earlier ones.
    pub fn into_event_parts(self, check_in_all: bool) -> Result<(Vec<Participant>, CompatibilityMatrix), String> {
        let mut participants: Vec<Participant> = Vec::with_capacity(self.participants.len());
        for registration in self.participants {
            validate_registration(&registration)?;
            let mut participant = registration.into_participant(Source::Application);
            if check_in_all {
                participant.status = ParticipantStatus::Active;
            }
            match participants.iter_mut().find(|p| p.id == participant.id) {
                Some(existing) => *existing = participant,
                None => participants.push(participant),
            }
        }

        let scores = ScoresRequest { scores: self.scores };
        validate_scores(&scores)?;
        Ok((participants, matrix_from_scores(&scores.scores)))
    }
}

pub fn matrix_from_scores(scores: &[PairScore]) -> CompatibilityMatrix {
    let mut matrix = CompatibilityMatrix::new();
    for entry in scores {
        matrix.insert(&entry.a.as_str().into(), &entry.b.as_str().into(), entry.score);
    }
    matrix
}

/// Loads a JSON roster file.
pub fn load_roster<P: AsRef<Path>>(path: P) -> Result<Roster, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Loads pair scores from a CSV with `a,b,score` columns. Blank rows and rows
/// with an unparsable score are skipped.
pub fn load_scores_csv<P: AsRef<Path>>(path: P) -> Result<Vec<PairScore>, Box<dyn std::error::Error>> {
    let mut rdr = Reader::from_path(path)?;
    let mut scores = Vec::new();
    for result in rdr.records() {
        let record = result?;
        let a = record.get(0).unwrap_or("").trim();
        let b = record.get(1).unwrap_or("").trim();
        if a.is_empty() || b.is_empty() {
            continue;
        }
        let Ok(score) = record.get(2).unwrap_or("").trim().parse::<f64>() else {
            tracing::warn!(a, b, "skipping row with unreadable score");
            continue;
        };
        scores.push(PairScore { a: a.to_string(), b: b.to_string(), score });
    }
    Ok(scores)
}

const ROLES: [Role; 6] = [Role::Engineering, Role::Product, Role::Gtm, Role::Science, Role::Ops, Role::Policy];
const LANES: [Lane; 3] = [Lane::Idea, Lane::Joiner, Lane::Flexible];
const TOPICS: [&str; 8] = [
    "grid-storage",
    "carbon-removal",
    "ag-tech",
    "mobility",
    "buildings",
    "climate-fintech",
    "water",
    "industrial-heat",
];
const CITIES: [&str; 3] = ["San Francisco", "New York", "Boston"];
const FIRST_NAMES: [&str; 12] = [
    "Ada", "Bo", "Chen", "Dara", "Eli", "Fatima", "Gus", "Hana", "Ivo", "Juno", "Kai", "Lena",
];

/// A reproducible synthetic roster with a few same-company pairs
/// and base scores for roughly nine pairs in ten.
pub fn demo_roster(size: usize, seed: u64) -> Roster {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut participants = Vec::with_capacity(size);

    for i in 0..size {
        let topic_count = rng.gen_range(1..=3);
        let mut topics: Vec<String> = TOPICS
            .choose_multiple(&mut rng, topic_count)
            .map(|t| t.to_string())
            .collect();
        topics.sort();
        let colocated = rng.gen_bool(0.3);
        let profile = Profile {
            role: ROLES.choose(&mut rng).copied(),
            role_needed: ROLES.choose(&mut rng).copied(),
            lane: LANES.choose(&mut rng).copied().unwrap_or_default(),
            top_topic: topics.first().cloned(),
            topics,
            arrangement: if colocated { Arrangement::Colocated } else { Arrangement::RemoteOpen },
            location: if colocated {
                CITIES.choose(&mut rng).copied().unwrap_or_default().to_string()
            } else {
                String::new()
            },
        };
        // every seventh attendee shares a company with the next one
        let colocation_group = (i % 7 == 0 && i + 1 < size).then(|| format!("team-{i}"));
        let colocation_group = colocation_group.or_else(|| (i % 7 == 1 && i > 0).then(|| format!("team-{}", i - 1)));

        participants.push(Registration {
            id: format!("p{:03}", i + 1),
            name: format!("{} {}", FIRST_NAMES[i % FIRST_NAMES.len()], i + 1),
            colocation_group,
            source: Some(if i % 10 == 9 { Source::Waitlist } else { Source::Application }),
            profile,
        });
    }

    let mut scores = Vec::new();
    for (i, a) in participants.iter().enumerate() {
        for b in &participants[i + 1..] {
            if rng.gen_bool(0.9) {
                let score = (rng.gen_range(20.0..95.0_f64) * 10.0).round() / 10.0;
                scores.push(PairScore { a: a.id.clone(), b: b.id.clone(), score });
            }
        }
    }

    Roster { participants, scores }
}
