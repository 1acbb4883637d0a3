use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::matching::types::PairKey;

/// Weights of the compatibility model and its hard constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Base score used when the matrix has no entry for a pair.
    pub neutral_base_score: f64,
    pub role_bonus: f64,
    pub lane_bonus: f64,
    pub topic_overlap_bonus: f64,
    pub top_topic_bonus: f64,
    pub signal_bonus: f64,
    /// Base score above which a signalled participant counts as "similar".
    pub signal_similarity_threshold: f64,
    pub block_same_group: bool,
    pub enforce_colocation: bool,
    pub must_not_pair: BTreeSet<PairKey>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        ScoringConfig {
            neutral_base_score: 50.0,
            role_bonus: 15.0,
            lane_bonus: 10.0,
            topic_overlap_bonus: 5.0,
            top_topic_bonus: 10.0,
            signal_bonus: 5.0,
            signal_similarity_threshold: 70.0,
            block_same_group: true,
            enforce_colocation: true,
            must_not_pair: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Upper bound on the lookahead horizon, including the committed round.
    pub lookahead_rounds: u32,
    /// Wall-clock budget for a full horizon solve.
    pub budget_ms: u64,
    /// Estimated matching work (pool³ × horizon) above which lookahead is skipped.
    pub max_matching_ops: u64,
    /// Re-plans the relaxation pass may try before shortening the horizon.
    pub max_replans: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            lookahead_rounds: 10,
            budget_ms: 2_000,
            max_matching_ops: 50_000_000,
            max_replans: 64,
        }
    }
}

/// Longest round an event may run: one day.
pub const MAX_ROUND_DURATION_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub round_duration_secs: u64,
    pub total_rounds: u32,
}

impl Default for EventConfig {
    fn default() -> Self {
        EventConfig {
            round_duration_secs: 8 * 60,
            total_rounds: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scoring: ScoringConfig,
    pub solver: SolverConfig,
    pub event: EventConfig,
    /// Directory for the JSON event store; in-memory storage when unset.
    pub data_dir: Option<PathBuf>,
}

impl EngineConfig {
    /// Loads the optional JSON file named by `MATCHER_CONFIG`, then applies
    /// environment overrides.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = match std::env::var("MATCHER_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => EngineConfig::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        let secs = self.event.round_duration_secs;
        if secs == 0 || secs > MAX_ROUND_DURATION_SECS {
            return Err(format!(
                "round duration must be between 1 and {MAX_ROUND_DURATION_SECS} seconds, got {secs}"
            ));
        }
        Ok(())
    }

    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn apply_env(&mut self) {
        if let Some(minutes) = env_parse::<u64>("ROUND_DURATION_MINUTES") {
            match duration_from_minutes(minutes) {
                Some(secs) => self.event.round_duration_secs = secs,
                None => tracing::warn!(minutes, "ignoring out-of-range ROUND_DURATION_MINUTES"),
            }
        }
        if let Some(rounds) = env_parse::<u32>("TOTAL_ROUNDS") {
            self.event.total_rounds = rounds;
        }
        if let Some(rounds) = env_parse::<u32>("LOOKAHEAD_ROUNDS") {
            self.solver.lookahead_rounds = rounds.max(1);
        }
        if let Some(ms) = env_parse::<u64>("SOLVER_BUDGET_MS") {
            self.solver.budget_ms = ms;
        }
        if let Ok(dir) = std::env::var("DATA_DIR") {
            if !dir.trim().is_empty() {
                self.data_dir = Some(PathBuf::from(dir));
            }
        }
    }
}

/// Minutes to seconds, `None` outside `1..=MAX_ROUND_DURATION_SECS`.
pub fn duration_from_minutes(minutes: u64) -> Option<u64> {
    minutes
        .checked_mul(60)
        .filter(|secs| (1..=MAX_ROUND_DURATION_SECS).contains(secs))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_event_format() {
        let config = EngineConfig::default();
        assert_eq!(config.event.round_duration_secs, 480);
        assert_eq!(config.event.total_rounds, 10);
        assert_eq!(config.scoring.neutral_base_score, 50.0);
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn test_round_duration_is_bounded() {
        assert_eq!(duration_from_minutes(8), Some(480));
        assert_eq!(duration_from_minutes(24 * 60), Some(MAX_ROUND_DURATION_SECS));
        assert_eq!(duration_from_minutes(0), None);
        assert_eq!(duration_from_minutes(24 * 60 + 1), None);
        assert_eq!(duration_from_minutes(1_000_000_000_000_000), None);
        assert_eq!(duration_from_minutes(u64::MAX), None);

        let mut config = EngineConfig::default();
        assert!(config.validate().is_ok());
        config.event.round_duration_secs = u64::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let raw = r#"{
            "scoring": { "role_bonus": 20.0, "must_not_pair": ["b:a"] },
            "event": { "total_rounds": 6 }
        }"#;
        let config: EngineConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.scoring.role_bonus, 20.0);
        assert_eq!(config.scoring.lane_bonus, 10.0);
        assert_eq!(config.event.total_rounds, 6);
        assert_eq!(config.event.round_duration_secs, 480);
        assert!(config
            .scoring
            .must_not_pair
            .contains(&PairKey::new(&"a".into(), &"b".into())));
    }
}
