use std::collections::{BTreeSet, HashSet, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SolverConfig;
use crate::error::SolverError;

use super::blossom::max_weight_matching;
use super::compatibility::{score, score_with_repeat_override, Scored, ScoringContext};
use super::pit_stop::{choose_pit_stop, PitStopLedger};
use super::types::{average, PairKey, Pairing, PairingHistory, Participant, ParticipantId};

/// Scaled scores are kept well inside `i64` so matching sums cannot overflow.
const MAX_SCALED_SCORE: f64 = 1e12;

/// One round of a plan: who sits where and who sits out.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedRound {
    pub round_number: u32,
    pub pairings: Vec<Pairing>,
    pub pit_stop: Option<ParticipantId>,
}

impl PlannedRound {
    pub fn total_score(&self) -> f64 {
        self.pairings.iter().map(|p| p.score).sum()
    }

    pub fn average_score(&self) -> f64 {
        average(&self.pairings)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DegradeReason {
    /// Estimated matching work exceeded `max_matching_ops`.
    CostEstimate,
    /// The wall-clock budget ran out while planning ahead.
    Deadline,
}

/// Solver output. Only `committed` is meant to be stored; `advisory` is the
/// lookahead that justified it and is recomputed on the next call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundPlan {
    pub committed: PlannedRound,
    pub advisory: Vec<PlannedRound>,
    /// Rounds actually planned, including the committed one.
    pub horizon: u32,
    /// History pairs an advisory round was allowed to repeat, by round number.
    /// Never contains the committed round.
    pub relaxed: Vec<(u32, PairKey)>,
    pub degraded: Option<DegradeReason>,
}

pub struct SolveRequest<'a> {
    pub pool: &'a [&'a Participant],
    /// Scoring inputs; `history` is the committed pairing history.
    pub scoring: ScoringContext<'a>,
    pub pit_stops: &'a PitStopLedger,
    /// Number the committed round will carry.
    pub round_number: u32,
    /// Requested horizon, normally `min(lookahead, rounds remaining)`.
    pub horizon: u32,
    pub config: &'a SolverConfig,
}

/// Picks the next round's pairing and plans up to `horizon` rounds ahead.
///
/// The committed round is always a maximum-weight matching under the hard
/// constraints. The lookahead only chooses between equally good round-1
/// matchings and shapes the advisory rounds.
pub fn solve(request: SolveRequest<'_>) -> Result<RoundPlan, SolverError> {
    let mut pool: Vec<&Participant> = request.pool.iter().copied().filter(|p| p.is_active()).collect();
    pool.sort_by(|x, y| x.id.cmp(&y.id));
    pool.dedup_by(|x, y| x.id == y.id);
    if pool.len() < 2 {
        return Err(SolverError::Infeasible {
            reason: format!("{} eligible participant(s), at least two are needed", pool.len()),
        });
    }

    let config = request.config;
    let horizon = request.horizon.max(1) as usize;
    let planner = Planner {
        pool,
        scoring: request.scoring,
        pit_stops: request.pit_stops,
        first_round: request.round_number,
        deadline: Instant::now() + Duration::from_millis(config.budget_ms),
        max_replans: config.max_replans,
    };

    let size = planner.pool.len() as u64;
    let estimate = size.saturating_pow(3).saturating_mul(horizon as u64);
    if estimate > config.max_matching_ops {
        warn!(
            round = request.round_number,
            pool = size,
            estimate,
            limit = config.max_matching_ops,
            "matching cost over budget, planning a single round"
        );
        return planner.single_round(DegradeReason::CostEstimate);
    }

    let mut span = horizon;
    loop {
        match planner.search(span) {
            Ok(found) => {
                let plan = found.into_plan(span, planner.first_round);
                info!(
                    round = request.round_number,
                    horizon = span,
                    total = plan.committed.total_score(),
                    repeats = plan.relaxed.len(),
                    "round planned"
                );
                return Ok(plan);
            }
            Err(SearchFailure::Infeasible(reason)) => return Err(SolverError::Infeasible { reason }),
            Err(SearchFailure::OutOfTime) => {
                warn!(round = request.round_number, horizon = span, "solver deadline reached, dropping lookahead");
                return planner.single_round(DegradeReason::Deadline);
            }
            Err(SearchFailure::Exhausted) if span > 1 => {
                debug!(round = request.round_number, horizon = span, "relaxation exhausted, shortening horizon");
                span -= 1;
            }
            Err(SearchFailure::Exhausted) => {
                return Err(SolverError::Infeasible {
                    reason: "no complete matching covers every seated participant".into(),
                })
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Strategy {
    Exact,
    Greedy,
}

/// A planned round with the matching weight that produced it.
struct Planned {
    round: PlannedRound,
    weight: i64,
}

/// Plans one round on top of `ctx.history`. Pairs in `banned` are skipped and
/// history pairs in `repeats` may meet again. `None` when some seated
/// participant cannot be paired.
fn plan_round(
    pool: &[&Participant],
    ctx: &ScoringContext<'_>,
    ledger: &PitStopLedger,
    round_number: u32,
    banned: &BTreeSet<PairKey>,
    repeats: &BTreeSet<PairKey>,
    strategy: Strategy,
) -> Option<Planned> {
    let pit_stop = choose_pit_stop(pool, ledger);
    let seated = seated_for(pool, pit_stop.as_ref());

    let mut candidates: Vec<(usize, usize, Scored)> = Vec::new();
    for i in 0..seated.len() {
        for j in (i + 1)..seated.len() {
            let key = PairKey::new(&seated[i].id, &seated[j].id);
            if banned.contains(&key) {
                continue;
            }
            let verdict = if repeats.contains(&key) {
                score_with_repeat_override(seated[i], seated[j], ctx)
            } else {
                score(seated[i], seated[j], ctx)
            };
            if let Some(scored) = verdict.scored() {
                candidates.push((i, j, scored));
            }
        }
    }

    // Ties between equal scores go to the matching with more provisional pairs.
    let tie_scale = (seated.len() / 2 + 1) as i64;
    let edges: Vec<(usize, usize, i64)> = candidates
        .iter()
        .map(|&(i, j, s)| (i, j, edge_weight(s, tie_scale)))
        .collect();
    let mates = match strategy {
        Strategy::Exact => max_weight_matching(seated.len(), &edges, true),
        Strategy::Greedy => greedy_matching(seated.len(), &edges),
    };
    if mates.iter().any(Option::is_none) {
        return None;
    }

    let chosen: Vec<usize> = (0..candidates.len())
        .filter(|&c| mates[candidates[c].0] == Some(candidates[c].1))
        .collect();
    let weight = chosen.iter().map(|&c| edges[c].2).sum();
    let pairings = chosen
        .iter()
        .zip(1u32..)
        .map(|(&c, table_number)| {
            let (i, j, s) = candidates[c];
            Pairing {
                table_number,
                a: seated[i].id.clone(),
                b: seated[j].id.clone(),
                score: s.value,
                provisional: s.provisional,
            }
        })
        .collect();

    Some(Planned {
        round: PlannedRound { round_number, pairings, pit_stop },
        weight,
    })
}

fn seated_for<'p>(pool: &[&'p Participant], pit_stop: Option<&ParticipantId>) -> Vec<&'p Participant> {
    pool.iter().copied().filter(|p| Some(&p.id) != pit_stop).collect()
}

fn edge_weight(scored: Scored, tie_scale: i64) -> i64 {
    let scaled = (scored.value * 100.0).round().clamp(-MAX_SCALED_SCORE, MAX_SCALED_SCORE) as i64;
    scaled * tie_scale + i64::from(scored.provisional)
}

/// Heaviest edge first; cheap, but may leave participants unmatched.
fn greedy_matching(vertex_count: usize, edges: &[(usize, usize, i64)]) -> Vec<Option<usize>> {
    let mut order: Vec<&(usize, usize, i64)> = edges.iter().collect();
    order.sort_by(|x, y| y.2.cmp(&x.2).then_with(|| (x.0, x.1).cmp(&(y.0, y.1))));
    let mut mates = vec![None; vertex_count];
    for &&(i, j, _) in &order {
        if mates[i].is_none() && mates[j].is_none() {
            mates[i] = Some(j);
            mates[j] = Some(i);
        }
    }
    mates
}

/// Adds a planned round to a simulated history.
fn absorb(history: &mut PairingHistory, ledger: &mut PitStopLedger, round: &PlannedRound) {
    for pairing in &round.pairings {
        history.insert(pairing.key());
    }
    if let Some(pit) = &round.pit_stop {
        ledger.record(pit, round.round_number);
    }
}

type PairsByRound = BTreeSet<(usize, PairKey)>;

fn keys_at(set: &PairsByRound, index: usize) -> BTreeSet<PairKey> {
    set.iter().filter(|(at, _)| *at == index).map(|(_, key)| key.clone()).collect()
}

/// Deviations from the plain round-by-round horizon, tried after a later
/// round strands. Both sets are keyed by horizon index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
struct Relaxation {
    /// Tentative pairs a round must route around. Round 1 only accepts this
    /// while it keeps its best weight.
    bans: PairsByRound,
    /// History pairs a round after the first may repeat.
    repeats: PairsByRound,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Exclude tentative pairs, never giving up round-1 weight.
    Steer,
    /// Let stranded advisory rounds repeat history pairs.
    Repeat,
}

enum Outcome {
    Complete,
    /// Horizon round `index` could not seat everyone. `repeatable` lists the
    /// history pairs that round could fall back on, in relaxation order.
    Stranded { index: usize, repeatable: Vec<PairKey> },
    /// Round 1 lost weight to a ban.
    BelowBest,
    OutOfTime,
}

struct Attempt {
    rounds: Vec<PlannedRound>,
    outcome: Outcome,
}

enum SearchFailure {
    Infeasible(String),
    Exhausted,
    OutOfTime,
}

struct Found {
    rounds: Vec<PlannedRound>,
    relaxation: Relaxation,
}

impl Found {
    fn into_plan(self, span: usize, first_round: u32) -> RoundPlan {
        let mut rounds = self.rounds.into_iter();
        let committed = rounds.next().unwrap_or(PlannedRound {
            round_number: first_round,
            pairings: Vec::new(),
            pit_stop: None,
        });
        RoundPlan {
            committed,
            advisory: rounds.collect(),
            horizon: span as u32,
            relaxed: self
                .relaxation
                .repeats
                .into_iter()
                .map(|(index, key)| (first_round + index as u32, key))
                .collect(),
            degraded: None,
        }
    }
}

type Worklist = VecDeque<(Relaxation, Vec<PlannedRound>)>;

struct Planner<'a> {
    /// Active participants in identifier order.
    pool: Vec<&'a Participant>,
    scoring: ScoringContext<'a>,
    pit_stops: &'a PitStopLedger,
    first_round: u32,
    deadline: Instant,
    max_replans: usize,
}

impl<'a> Planner<'a> {
    /// Plans rounds `prefix.len()..horizon` on top of an already planned prefix.
    /// `best` is the weight of the best unrestricted round 1.
    fn extend(&self, prefix: Vec<PlannedRound>, horizon: usize, relaxation: &Relaxation, best: i64) -> Attempt {
        let mut history = self.scoring.history.clone();
        let mut ledger = self.pit_stops.clone();
        for round in &prefix {
            absorb(&mut history, &mut ledger, round);
        }

        let mut rounds = prefix;
        while rounds.len() < horizon {
            let index = rounds.len();
            if index > 0 && Instant::now() >= self.deadline {
                return Attempt { rounds, outcome: Outcome::OutOfTime };
            }
            let banned = keys_at(&relaxation.bans, index);
            let repeats = if index == 0 { BTreeSet::new() } else { keys_at(&relaxation.repeats, index) };
            let ctx = self.scoring.with_history(&history);
            let round_number = self.first_round + index as u32;
            match plan_round(&self.pool, &ctx, &ledger, round_number, &banned, &repeats, Strategy::Exact) {
                Some(planned) if index == 0 && planned.weight < best => {
                    return Attempt { rounds, outcome: Outcome::BelowBest };
                }
                Some(planned) => {
                    absorb(&mut history, &mut ledger, &planned.round);
                    rounds.push(planned.round);
                }
                None if index == 0 => return Attempt { rounds, outcome: Outcome::BelowBest },
                None => {
                    let repeatable = self.repeatable_pairs(&rounds, &ctx, &ledger, &repeats);
                    return Attempt { rounds, outcome: Outcome::Stranded { index, repeatable } };
                }
            }
        }
        Attempt { rounds, outcome: Outcome::Complete }
    }

    /// History pairs among the next round's seated participants that only the
    /// no-repeat rule keeps apart. Most recent exclusion first (tentative rounds
    /// from the latest back, then committed history), lowest value first.
    fn repeatable_pairs(
        &self,
        planned: &[PlannedRound],
        ctx: &ScoringContext<'_>,
        ledger: &PitStopLedger,
        already: &BTreeSet<PairKey>,
    ) -> Vec<PairKey> {
        let pit_stop = choose_pit_stop(&self.pool, ledger);
        let seated = seated_for(&self.pool, pit_stop.as_ref());

        let mut found: Vec<(usize, f64, PairKey)> = Vec::new();
        for i in 0..seated.len() {
            for j in (i + 1)..seated.len() {
                let key = PairKey::new(&seated[i].id, &seated[j].id);
                if !ctx.history.contains(&key) || already.contains(&key) {
                    continue;
                }
                let Some(scored) = score_with_repeat_override(seated[i], seated[j], ctx).scored() else {
                    continue;
                };
                // 0 is committed history, otherwise one past the tentative round index
                let recency = planned
                    .iter()
                    .rposition(|round| round.pairings.iter().any(|p| p.key() == key))
                    .map_or(0, |index| index + 1);
                found.push((recency, scored.value, key));
            }
        }
        found.sort_by(|x, y| {
            y.0.cmp(&x.0)
                .then_with(|| x.1.total_cmp(&y.1))
                .then_with(|| x.2.cmp(&y.2))
        });
        found.into_iter().map(|(_, _, key)| key).collect()
    }

    /// Plans the full horizon on top of the exact best round 1. When a later
    /// round strands it first steers around tentative pairs, then lets the
    /// stranded advisory rounds repeat history. Each phase is breadth-first and
    /// bounded by `max_replans`.
    fn search(&self, horizon: usize) -> Result<Found, SearchFailure> {
        let none = BTreeSet::new();
        let Some(first) =
            plan_round(&self.pool, &self.scoring, self.pit_stops, self.first_round, &none, &none, Strategy::Exact)
        else {
            return Err(SearchFailure::Infeasible(
                "no complete matching covers every seated participant".into(),
            ));
        };
        let best = first.weight;

        let root = Relaxation::default();
        let attempt = self.extend(vec![first.round], horizon, &root, best);
        let (failed_at, repeatable) = match attempt.outcome {
            Outcome::Complete => return Ok(Found { rounds: attempt.rounds, relaxation: root }),
            Outcome::OutOfTime => return Err(SearchFailure::OutOfTime),
            Outcome::BelowBest => return Err(SearchFailure::Exhausted),
            Outcome::Stranded { index, repeatable } => (index, repeatable),
        };

        let mut worklist = Worklist::new();
        let mut seen = HashSet::new();
        enqueue_bans(&mut worklist, &mut seen, &attempt.rounds, failed_at, &root);
        if let Some(found) = self.drain(worklist, seen, horizon, best, Phase::Steer)? {
            return Ok(found);
        }

        let mut worklist = Worklist::new();
        let mut seen = HashSet::new();
        enqueue_repeats(&mut worklist, &mut seen, &attempt.rounds, failed_at, repeatable, &root);
        self.drain(worklist, seen, horizon, best, Phase::Repeat)?
            .ok_or(SearchFailure::Exhausted)
    }

    fn drain(
        &self,
        mut worklist: Worklist,
        mut seen: HashSet<Relaxation>,
        horizon: usize,
        best: i64,
        phase: Phase,
    ) -> Result<Option<Found>, SearchFailure> {
        let mut replans = 0;
        while let Some((relaxation, prefix)) = worklist.pop_front() {
            if replans >= self.max_replans {
                break;
            }
            if Instant::now() >= self.deadline {
                return Err(SearchFailure::OutOfTime);
            }
            replans += 1;

            let attempt = self.extend(prefix, horizon, &relaxation, best);
            match attempt.outcome {
                Outcome::Complete => {
                    debug!(
                        replans,
                        bans = relaxation.bans.len(),
                        repeats = relaxation.repeats.len(),
                        "relaxation found a complete horizon"
                    );
                    return Ok(Some(Found { rounds: attempt.rounds, relaxation }));
                }
                Outcome::OutOfTime => return Err(SearchFailure::OutOfTime),
                Outcome::BelowBest => {}
                Outcome::Stranded { index, repeatable } => match phase {
                    Phase::Steer => enqueue_bans(&mut worklist, &mut seen, &attempt.rounds, index, &relaxation),
                    Phase::Repeat => {
                        enqueue_repeats(&mut worklist, &mut seen, &attempt.rounds, index, repeatable, &relaxation)
                    }
                },
            }
        }
        Ok(None)
    }

    /// Round 1 only, greedy first and exact if greedy leaves someone out.
    fn single_round(&self, reason: DegradeReason) -> Result<RoundPlan, SolverError> {
        let none = BTreeSet::new();
        let plan = |strategy| plan_round(&self.pool, &self.scoring, self.pit_stops, self.first_round, &none, &none, strategy);
        let committed = plan(Strategy::Greedy)
            .or_else(|| plan(Strategy::Exact))
            .ok_or_else(|| SolverError::Infeasible {
                reason: "no complete matching covers every seated participant".into(),
            })?
            .round;
        Ok(RoundPlan {
            committed,
            advisory: Vec::new(),
            horizon: 1,
            relaxed: Vec::new(),
            degraded: Some(reason),
        })
    }
}

/// Queues one child per tentative pair before the stranded round: most recent
/// round first, lowest score first within a round.
fn enqueue_bans(
    worklist: &mut Worklist,
    seen: &mut HashSet<Relaxation>,
    rounds: &[PlannedRound],
    failed_at: usize,
    parent: &Relaxation,
) {
    for index in (0..failed_at.min(rounds.len())).rev() {
        let mut pairs: Vec<&Pairing> = rounds[index].pairings.iter().collect();
        pairs.sort_by(|x, y| x.score.total_cmp(&y.score).then_with(|| x.key().cmp(&y.key())));
        for pairing in pairs {
            let mut next = parent.clone();
            next.bans.insert((index, pairing.key()));
            if seen.insert(next.clone()) {
                worklist.push_back((next, rounds[..index].to_vec()));
            }
        }
    }
}

/// Queues one child per repeatable pair of the stranded round, keeping the
/// rounds before it.
fn enqueue_repeats(
    worklist: &mut Worklist,
    seen: &mut HashSet<Relaxation>,
    rounds: &[PlannedRound],
    failed_at: usize,
    repeatable: Vec<PairKey>,
    parent: &Relaxation,
) {
    for key in repeatable {
        let mut next = parent.clone();
        next.repeats.insert((failed_at, key));
        if seen.insert(next.clone()) {
            worklist.push_back((next, rounds[..failed_at].to_vec()));
        }
    }
}
