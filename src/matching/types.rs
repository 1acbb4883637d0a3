use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable, opaque participant identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        ParticipantId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        ParticipantId(id.to_string())
    }
}

/// Order-independent key for a participant pair. The two ids are stored sorted,
/// so `PairKey::new(a, b) == PairKey::new(b, a)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PairKey {
    low: ParticipantId,
    high: ParticipantId,
}

impl PairKey {
    pub fn new(a: &ParticipantId, b: &ParticipantId) -> Self {
        if a <= b {
            PairKey { low: a.clone(), high: b.clone() }
        } else {
            PairKey { low: b.clone(), high: a.clone() }
        }
    }

    pub fn low(&self) -> &ParticipantId {
        &self.low
    }

    pub fn high(&self) -> &ParticipantId {
        &self.high
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        &self.low == id || &self.high == id
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.low, self.high)
    }
}

impl From<PairKey> for String {
    fn from(key: PairKey) -> String {
        key.to_string()
    }
}

impl TryFrom<String> for PairKey {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        match raw.split_once(':') {
            Some((a, b)) if !a.is_empty() && !b.is_empty() && !b.contains(':') => {
                Ok(PairKey::new(&ParticipantId::from(a), &ParticipantId::from(b)))
            }
            _ => Err(format!("malformed pair key: {raw}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParticipantStatus {
    Active,
    CheckedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Engineering,
    Product,
    Gtm,
    Science,
    Ops,
    Policy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Lane {
    Idea,
    Joiner,
    #[default]
    Flexible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Arrangement {
    Colocated,
    #[default]
    RemoteOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    #[default]
    Application,
    Waitlist,
    WalkUp,
}

/// Profile fields feeding the deterministic bonuses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub role: Option<Role>,
    pub role_needed: Option<Role>,
    pub lane: Lane,
    pub topics: Vec<String>,
    pub top_topic: Option<String>,
    pub arrangement: Arrangement,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub status: ParticipantStatus,
    #[serde(default)]
    pub colocation_group: Option<String>,
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub profile: Profile,
    /// Round numbers in which this participant sat out.
    #[serde(default)]
    pub pit_stops: BTreeSet<u32>,
}

impl Participant {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Participant {
            id: ParticipantId::new(id),
            name: name.into(),
            status: ParticipantStatus::Active,
            colocation_group: None,
            source: Source::Application,
            profile: Profile::default(),
            pit_stops: BTreeSet::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ParticipantStatus::Active
    }
}

/// Pair keys assigned in committed rounds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairingHistory(BTreeSet<PairKey>);

impl PairingHistory {
    pub fn new() -> Self {
        PairingHistory(BTreeSet::new())
    }

    pub fn contains(&self, key: &PairKey) -> bool {
        self.0.contains(key)
    }

    /// Returns false when the key was already present.
    pub fn insert(&mut self, key: PairKey) -> bool {
        self.0.insert(key)
    }

    pub fn remove(&mut self, key: &PairKey) -> bool {
        self.0.remove(key)
    }

    /// Number of distinct pairs that have met.
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Externally produced base scores. A missing entry means "not scored yet".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompatibilityMatrix(BTreeMap<PairKey, f64>);

impl CompatibilityMatrix {
    pub fn new() -> Self {
        CompatibilityMatrix(BTreeMap::new())
    }

    pub fn insert(&mut self, a: &ParticipantId, b: &ParticipantId, score: f64) {
        self.0.insert(PairKey::new(a, b), score);
    }

    pub fn get(&self, key: &PairKey) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// One seated pair of a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pairing {
    pub table_number: u32,
    pub a: ParticipantId,
    pub b: ParticipantId,
    pub score: f64,
    /// Base score was missing and the neutral default was used.
    pub provisional: bool,
}

impl Pairing {
    pub fn key(&self) -> PairKey {
        PairKey::new(&self.a, &self.b)
    }

    pub fn involves(&self, id: &ParticipantId) -> bool {
        &self.a == id || &self.b == id
    }

    pub fn partner_of(&self, id: &ParticipantId) -> Option<&ParticipantId> {
        if &self.a == id {
            Some(&self.b)
        } else if &self.b == id {
            Some(&self.a)
        } else {
            None
        }
    }
}

/// A committed round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundResult {
    pub round_number: u32,
    pub pairings: Vec<Pairing>,
    pub pit_stop: Option<ParticipantId>,
    pub average_score: f64,
    pub provisional_pairs: usize,
    /// Produced without lookahead after the solver budget ran out.
    pub degraded: bool,
    /// History entries this round added; undo removes exactly these.
    pub introduced: Vec<PairKey>,
    pub created_at: DateTime<Utc>,
}

impl RoundResult {
    pub fn pairing_of(&self, id: &ParticipantId) -> Option<&Pairing> {
        self.pairings.iter().find(|p| p.involves(id))
    }

    pub fn total_score(&self) -> f64 {
        self.pairings.iter().map(|p| p.score).sum()
    }

    pub fn recompute_average(&mut self) {
        self.average_score = average(&self.pairings);
        self.provisional_pairs = self.pairings.iter().filter(|p| p.provisional).count();
    }
}

pub(crate) fn average(pairings: &[Pairing]) -> f64 {
    if pairings.is_empty() {
        return 0.0;
    }
    let mean = pairings.iter().map(|p| p.score).sum::<f64>() / pairings.len() as f64;
    (mean * 10.0).round() / 10.0
}

/// Follow-up interest sent by one participant about their partner in a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub round_number: u32,
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_key_is_symmetric() {
        let ids = ["a", "b", "zed", "A", "10", "9"];
        for x in ids {
            for y in ids {
                let a = ParticipantId::from(x);
                let b = ParticipantId::from(y);
                assert_eq!(PairKey::new(&a, &b), PairKey::new(&b, &a));
            }
        }
    }

    #[test]
    fn test_pair_key_string_form() {
        let key = PairKey::new(&"bob".into(), &"alice".into());
        assert_eq!(key.to_string(), "alice:bob");

        let parsed = PairKey::try_from("bob:alice".to_string()).unwrap();
        assert_eq!(parsed, key);
        assert!(PairKey::try_from("nocolon".to_string()).is_err());
        assert!(PairKey::try_from("a:b:c".to_string()).is_err());
    }

    #[test]
    fn test_matrix_serializes_with_string_keys() {
        let mut matrix = CompatibilityMatrix::new();
        matrix.insert(&"b".into(), &"a".into(), 72.0);
        let json = serde_json::to_string(&matrix).unwrap();
        assert_eq!(json, r#"{"a:b":72.0}"#);

        let back: CompatibilityMatrix = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get(&PairKey::new(&"a".into(), &"b".into())), Some(72.0));
    }

    #[test]
    fn test_partner_lookup() {
        let pairing = Pairing {
            table_number: 1,
            a: "a".into(),
            b: "b".into(),
            score: 10.0,
            provisional: false,
        };
        assert_eq!(pairing.partner_of(&"a".into()), Some(&ParticipantId::from("b")));
        assert_eq!(pairing.partner_of(&"c".into()), None);
    }
}
