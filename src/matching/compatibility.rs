use std::collections::{BTreeMap, HashSet};

use crate::config::ScoringConfig;
use super::types::{
    Arrangement, CompatibilityMatrix, Lane, PairKey, PairingHistory, Participant, ParticipantId,
    Signal,
};

/// Where base scores come from. The model only ever sees this trait, so the
/// external pipeline, a local scorer, or nothing at all can back it.
pub trait ScoreSource: Send + Sync {
    fn base_score(&self, key: &PairKey) -> Option<f64>;
}

impl ScoreSource for CompatibilityMatrix {
    fn base_score(&self, key: &PairKey) -> Option<f64> {
        self.get(key)
    }
}

/// Source that has scored nothing yet; every pair is provisional.
#[cfg(test)]
pub struct Unscored;

#[cfg(test)]
impl ScoreSource for Unscored {
    fn base_score(&self, _key: &PairKey) -> Option<f64> {
        None
    }
}

/// Signals grouped by sender: who each participant asked to follow up with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InterestSignals(BTreeMap<ParticipantId, Vec<ParticipantId>>);

impl InterestSignals {
    pub fn from_signals(signals: &[Signal]) -> Self {
        let mut by_sender: BTreeMap<ParticipantId, Vec<ParticipantId>> = BTreeMap::new();
        for signal in signals {
            by_sender.entry(signal.from.clone()).or_default().push(signal.to.clone());
        }
        InterestSignals(by_sender)
    }

    pub fn sent_by(&self, id: &ParticipantId) -> &[ParticipantId] {
        self.0.get(id).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scored {
    pub value: f64,
    /// The neutral default stood in for a missing base score.
    pub provisional: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    AlreadyPaired,
    SameColocationGroup,
    LocationMismatch,
    MustNotPair,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Scored(Scored),
    Blocked(BlockReason),
}

impl Verdict {
    pub fn scored(self) -> Option<Scored> {
        match self {
            Verdict::Scored(scored) => Some(scored),
            Verdict::Blocked(_) => None,
        }
    }
}

/// Read-only inputs of one scoring pass.
#[derive(Clone, Copy)]
pub struct ScoringContext<'a> {
    pub source: &'a dyn ScoreSource,
    pub history: &'a PairingHistory,
    pub signals: &'a InterestSignals,
    pub config: &'a ScoringConfig,
}

impl<'a> ScoringContext<'a> {
    /// Same inputs against a different (usually simulated) history.
    pub fn with_history<'b>(&self, history: &'b PairingHistory) -> ScoringContext<'b>
    where
        'a: 'b,
    {
        ScoringContext {
            source: self.source,
            history,
            signals: self.signals,
            config: self.config,
        }
    }
}

/// Scores a candidate pair, honoring the no-repeat rule.
pub fn score(a: &Participant, b: &Participant, ctx: &ScoringContext<'_>) -> Verdict {
    evaluate(a, b, ctx, false)
}

/// Scores a pair an admin is forcing together: every hard constraint except
/// the no-repeat rule still applies.
pub fn score_with_repeat_override(
    a: &Participant,
    b: &Participant,
    ctx: &ScoringContext<'_>,
) -> Verdict {
    evaluate(a, b, ctx, true)
}

fn evaluate(a: &Participant, b: &Participant, ctx: &ScoringContext<'_>, allow_repeat: bool) -> Verdict {
    let key = PairKey::new(&a.id, &b.id);
    if let Some(reason) = hard_block(a, b, &key, ctx, allow_repeat) {
        return Verdict::Blocked(reason);
    }

    let config = ctx.config;
    let (base, provisional) = match ctx.source.base_score(&key) {
        Some(base) => (base, false),
        None => (config.neutral_base_score, true),
    };

    let value = base
        + role_bonus(a, b, config)
        + lane_bonus(a, b, config)
        + topic_bonus(a, b, config)
        + signal_boost(&a.id, &b.id, ctx)
        + signal_boost(&b.id, &a.id, ctx);

    Verdict::Scored(Scored { value, provisional })
}

fn hard_block(
    a: &Participant,
    b: &Participant,
    key: &PairKey,
    ctx: &ScoringContext<'_>,
    allow_repeat: bool,
) -> Option<BlockReason> {
    let config = ctx.config;
    if !allow_repeat && ctx.history.contains(key) {
        return Some(BlockReason::AlreadyPaired);
    }
    if config.block_same_group {
        if let (Some(ga), Some(gb)) = (&a.colocation_group, &b.colocation_group) {
            if ga == gb {
                return Some(BlockReason::SameColocationGroup);
            }
        }
    }
    if config.enforce_colocation
        && a.profile.arrangement == Arrangement::Colocated
        && b.profile.arrangement == Arrangement::Colocated
        && !a.profile.location.is_empty()
        && !b.profile.location.is_empty()
        && !a.profile.location.eq_ignore_ascii_case(&b.profile.location)
    {
        return Some(BlockReason::LocationMismatch);
    }
    if config.must_not_pair.contains(key) {
        return Some(BlockReason::MustNotPair);
    }
    None
}

fn role_bonus(a: &Participant, b: &Participant, config: &ScoringConfig) -> f64 {
    let (pa, pb) = (&a.profile, &b.profile);
    if pa.role.is_none() || pb.role.is_none() || pa.role == pb.role {
        return 0.0;
    }
    let mut bonus = 0.0;
    if pa.role_needed.is_some() && pa.role_needed == pb.role {
        bonus += config.role_bonus;
    }
    if pb.role_needed.is_some() && pb.role_needed == pa.role {
        bonus += config.role_bonus;
    }
    bonus
}

fn lane_bonus(a: &Participant, b: &Participant, config: &ScoringConfig) -> f64 {
    match (a.profile.lane, b.profile.lane) {
        (Lane::Idea, Lane::Joiner) | (Lane::Joiner, Lane::Idea) => config.lane_bonus,
        _ => 0.0,
    }
}

fn topic_bonus(a: &Participant, b: &Participant, config: &ScoringConfig) -> f64 {
    let mine: HashSet<&str> = a.profile.topics.iter().map(String::as_str).collect();
    let shared = b
        .profile
        .topics
        .iter()
        .map(String::as_str)
        .collect::<HashSet<_>>()
        .intersection(&mine)
        .count();
    let top_match = match (&a.profile.top_topic, &b.profile.top_topic) {
        (Some(ta), Some(tb)) if !ta.is_empty() && ta == tb => config.top_topic_bonus,
        _ => 0.0,
    };
    shared as f64 * config.topic_overlap_bonus + top_match
}

/// Revealed preference: if `from` signalled interest in someone who scores
/// highly with `candidate`, the pair gets a boost.
fn signal_boost(from: &ParticipantId, candidate: &ParticipantId, ctx: &ScoringContext<'_>) -> f64 {
    let config = ctx.config;
    ctx.signals
        .sent_by(from)
        .iter()
        .filter(|liked| *liked != candidate)
        .filter_map(|liked| ctx.source.base_score(&PairKey::new(candidate, liked)))
        .filter(|similarity| *similarity > config.signal_similarity_threshold)
        .count() as f64
        * config.signal_bonus
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::types::{Profile, Role};

    fn person(id: &str) -> Participant {
        Participant::new(id, format!("Person {id}"))
    }

    fn with_profile(id: &str, profile: Profile) -> Participant {
        Participant { profile, ..person(id) }
    }

    fn value_of(verdict: Verdict) -> f64 {
        verdict.scored().expect("pair should be scored").value
    }

    struct Fixture {
        matrix: CompatibilityMatrix,
        history: PairingHistory,
        signals: InterestSignals,
        config: ScoringConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                matrix: CompatibilityMatrix::new(),
                history: PairingHistory::new(),
                signals: InterestSignals::default(),
                config: ScoringConfig::default(),
            }
        }

        fn ctx(&self) -> ScoringContext<'_> {
            ScoringContext {
                source: &self.matrix,
                history: &self.history,
                signals: &self.signals,
                config: &self.config,
            }
        }
    }

    #[test]
    fn test_already_paired_is_blocked() {
        let mut fx = Fixture::new();
        let (a, b) = (person("a"), person("b"));
        fx.history.insert(PairKey::new(&a.id, &b.id));
        assert_eq!(score(&a, &b, &fx.ctx()), Verdict::Blocked(BlockReason::AlreadyPaired));
        assert!(score_with_repeat_override(&a, &b, &fx.ctx()).scored().is_some());
    }

    #[test]
    fn test_history_block_wins_over_high_score() {
        let mut fx = Fixture::new();
        let (a, b) = (person("a"), person("b"));
        fx.matrix.insert(&a.id, &b.id, 100.0);
        fx.history.insert(PairKey::new(&b.id, &a.id));
        assert!(score(&a, &b, &fx.ctx()).scored().is_none());
    }

    #[test]
    fn test_same_colocation_group_is_blocked() {
        let fx = Fixture::new();
        let mut a = person("a");
        let mut b = person("b");
        a.colocation_group = Some("acme".into());
        b.colocation_group = Some("acme".into());
        assert_eq!(score(&a, &b, &fx.ctx()), Verdict::Blocked(BlockReason::SameColocationGroup));
        // the override only lifts the no-repeat rule
        assert!(score_with_repeat_override(&a, &b, &fx.ctx()).scored().is_none());

        b.colocation_group = Some("globex".into());
        assert!(score(&a, &b, &fx.ctx()).scored().is_some());
    }

    #[test]
    fn test_colocated_in_different_cities_is_blocked() {
        let fx = Fixture::new();
        let colocated = |id: &str, city: &str| {
            with_profile(
                id,
                Profile {
                    arrangement: Arrangement::Colocated,
                    location: city.into(),
                    ..Profile::default()
                },
            )
        };
        let a = colocated("a", "SF");
        assert_eq!(
            score(&a, &colocated("b", "NYC"), &fx.ctx()),
            Verdict::Blocked(BlockReason::LocationMismatch)
        );
        assert!(score(&a, &colocated("c", "sf"), &fx.ctx()).scored().is_some());

        let remote = with_profile("d", Profile { location: "NYC".into(), ..Profile::default() });
        assert!(score(&a, &remote, &fx.ctx()).scored().is_some());
    }

    #[test]
    fn test_must_not_pair_is_blocked() {
        let mut fx = Fixture::new();
        let (a, b) = (person("a"), person("b"));
        fx.config.must_not_pair.insert(PairKey::new(&b.id, &a.id));
        assert_eq!(score(&a, &b, &fx.ctx()), Verdict::Blocked(BlockReason::MustNotPair));
    }

    #[test]
    fn test_missing_base_score_is_neutral_and_provisional() {
        let mut fx = Fixture::new();
        let (a, b, c) = (person("a"), person("b"), person("c"));
        fx.matrix.insert(&a.id, &c.id, 0.0);

        let unscored = score(&a, &b, &fx.ctx()).scored().unwrap();
        assert!(unscored.provisional);
        assert_eq!(unscored.value, 50.0);

        // zero is a real score, not a gap
        let zero = score(&a, &c, &fx.ctx()).scored().unwrap();
        assert!(!zero.provisional);
        assert_eq!(zero.value, 0.0);
    }

    #[test]
    fn test_unscored_source_marks_everything_provisional() {
        let fx = Fixture::new();
        let ctx = ScoringContext { source: &Unscored, ..fx.ctx() };
        let verdict = score(&person("a"), &person("b"), &ctx).scored().unwrap();
        assert!(verdict.provisional);
    }

    #[test]
    fn test_role_complement_counts_each_direction() {
        let mut fx = Fixture::new();
        let eng = |id: &str, needed: Role| {
            with_profile(
                id,
                Profile { role: Some(Role::Engineering), role_needed: Some(needed), ..Profile::default() },
            )
        };
        let gtm = with_profile(
            "g",
            Profile { role: Some(Role::Gtm), role_needed: Some(Role::Engineering), ..Profile::default() },
        );
        let a = eng("a", Role::Gtm);
        fx.matrix.insert(&a.id, &gtm.id, 50.0);
        assert_eq!(value_of(score(&a, &gtm, &fx.ctx())), 80.0);

        let b = eng("b", Role::Gtm);
        fx.matrix.insert(&a.id, &b.id, 50.0);
        assert_eq!(value_of(score(&a, &b, &fx.ctx())), 50.0);
    }

    #[test]
    fn test_lane_and_topic_bonuses() {
        let mut fx = Fixture::new();
        let a = with_profile(
            "a",
            Profile {
                lane: Lane::Idea,
                topics: vec!["energy".into(), "transport".into(), "carbon".into()],
                top_topic: Some("energy".into()),
                ..Profile::default()
            },
        );
        let b = with_profile(
            "b",
            Profile {
                lane: Lane::Joiner,
                topics: vec!["energy".into(), "transport".into()],
                top_topic: Some("energy".into()),
                ..Profile::default()
            },
        );
        fx.matrix.insert(&a.id, &b.id, 40.0);
        // 40 + lane 10 + two shared topics 10 + top topic 10
        assert_eq!(value_of(score(&a, &b, &fx.ctx())), 70.0);
    }

    #[test]
    fn test_signal_boost_uses_revealed_preference() {
        let mut fx = Fixture::new();
        let (a, b, c) = (person("a"), person("b"), person("c"));
        fx.matrix.insert(&a.id, &b.id, 50.0);
        // a liked c, and c is very similar to b
        fx.matrix.insert(&b.id, &c.id, 85.0);
        fx.signals = InterestSignals::from_signals(&[Signal {
            round_number: 1,
            from: a.id.clone(),
            to: c.id.clone(),
            recorded_at: chrono::Utc::now(),
        }]);
        assert_eq!(value_of(score(&a, &b, &fx.ctx())), 55.0);

        fx.matrix.insert(&b.id, &c.id, 60.0);
        assert_eq!(value_of(score(&a, &b, &fx.ctx())), 50.0);
    }

    #[test]
    fn test_scoring_is_repeatable() {
        let mut fx = Fixture::new();
        let (a, b) = (person("a"), person("b"));
        fx.matrix.insert(&a.id, &b.id, 61.5);
        let first = score(&a, &b, &fx.ctx());
        for _ in 0..10 {
            assert_eq!(score(&b, &a, &fx.ctx()), first);
        }
    }
}
