use std::collections::BTreeMap;

use super::types::{Participant, ParticipantId, Source};

/// Rounds each participant has sat out, in ascending order. The solver keeps a
/// scratch copy of this while planning ahead.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PitStopLedger(BTreeMap<ParticipantId, Vec<u32>>);

impl PitStopLedger {
    pub fn from_participants<'a>(participants: impl IntoIterator<Item = &'a Participant>) -> Self {
        PitStopLedger(
            participants
                .into_iter()
                .map(|p| (p.id.clone(), p.pit_stops.iter().copied().collect()))
                .collect(),
        )
    }

    pub fn count(&self, id: &ParticipantId) -> usize {
        self.0.get(id).map_or(0, Vec::len)
    }

    pub fn last(&self, id: &ParticipantId) -> Option<u32> {
        self.0.get(id).and_then(|rounds| rounds.last().copied())
    }

    pub fn record(&mut self, id: &ParticipantId, round: u32) {
        let rounds = self.0.entry(id.clone()).or_default();
        rounds.push(round);
        rounds.sort_unstable();
        rounds.dedup();
    }
}

/// Picks who sits out when the pool is odd; `None` for even pools.
///
/// Fewest pit stops first, then whoever sat out longest ago (never counts as
/// longest), then non-walk-ups, then identifier order. Deterministic for a
/// given ledger.
pub fn choose_pit_stop(pool: &[&Participant], ledger: &PitStopLedger) -> Option<ParticipantId> {
    if pool.len() % 2 == 0 {
        return None;
    }
    pool.iter()
        .min_by_key(|p| {
            (
                ledger.count(&p.id),
                ledger.last(&p.id).unwrap_or(0),
                p.source == Source::WalkUp,
                p.id.clone(),
            )
        })
        .map(|p| p.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn pool(ids: &[&str]) -> Vec<Participant> {
        ids.iter().map(|id| Participant::new(*id, *id)).collect()
    }

    fn refs(people: &[Participant]) -> Vec<&Participant> {
        people.iter().collect()
    }

    #[test]
    fn test_even_pool_has_no_pit_stop() {
        let people = pool(&["a", "b", "c", "d"]);
        assert_eq!(choose_pit_stop(&refs(&people), &PitStopLedger::default()), None);
    }

    #[test]
    fn test_fewest_pit_stops_sits_out() {
        let mut people = pool(&["a", "b", "c"]);
        people[0].pit_stops = BTreeSet::from([1]);
        people[2].pit_stops = BTreeSet::from([2]);
        let ledger = PitStopLedger::from_participants(&people);
        assert_eq!(choose_pit_stop(&refs(&people), &ledger), Some(ParticipantId::from("b")));
    }

    #[test]
    fn test_tie_goes_to_longest_since_last_pit_stop() {
        let mut people = pool(&["a", "b", "c"]);
        people[0].pit_stops = BTreeSet::from([4]);
        people[1].pit_stops = BTreeSet::from([2]);
        people[2].pit_stops = BTreeSet::from([3]);
        let ledger = PitStopLedger::from_participants(&people);
        assert_eq!(choose_pit_stop(&refs(&people), &ledger), Some(ParticipantId::from("b")));
    }

    #[test]
    fn test_walk_ups_are_spared_on_ties() {
        let mut people = pool(&["a", "b", "c"]);
        people[0].source = Source::WalkUp;
        let ledger = PitStopLedger::from_participants(&people);
        assert_eq!(choose_pit_stop(&refs(&people), &ledger), Some(ParticipantId::from("b")));
    }

    #[test]
    fn test_rotation_is_fair_over_a_stable_pool() {
        for size in [3usize, 5, 7, 9] {
            let ids: Vec<String> = (0..size).map(|i| format!("p{i:02}")).collect();
            let people: Vec<Participant> = ids.iter().map(|id| Participant::new(id.as_str(), id.as_str())).collect();
            let mut ledger = PitStopLedger::from_participants(&people);
            let mut seen = BTreeSet::new();

            for round in 1..=size as u32 {
                let chosen = choose_pit_stop(&refs(&people), &ledger).unwrap();
                assert!(seen.insert(chosen.clone()), "{chosen} sat out twice in a window of {size}");
                ledger.record(&chosen, round);
            }
            assert_eq!(seen.len(), size);
        }
    }

    #[test]
    fn test_counts_survive_pool_changes() {
        let people = pool(&["a", "b", "c", "d", "e"]);
        let mut ledger = PitStopLedger::from_participants(&people);
        ledger.record(&"a".into(), 1);
        ledger.record(&"b".into(), 2);

        // "c" leaves and "f" walks in: pool is odd again
        let mut shrunk: Vec<Participant> = people.iter().filter(|p| p.id.as_str() != "c").cloned().collect();
        shrunk.extend(pool(&["f"]).into_iter().map(|mut p| {
            p.source = Source::WalkUp;
            p
        }));
        let chosen = choose_pit_stop(&refs(&shrunk), &ledger).unwrap();
        assert_eq!(chosen, ParticipantId::from("d"));
        assert_eq!(ledger.count(&"a".into()), 1);
    }
}
