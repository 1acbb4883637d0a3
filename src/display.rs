use std::io;
use std::path::Path;

use csv::WriterBuilder;

use crate::event::{AdvanceOutcome, EventState};
use crate::matching::{ParticipantId, RoundResult};

/// Formats a participant as "Name (id)", or just the id when unknown.
pub fn participant_label(state: &EventState, id: &ParticipantId) -> String {
    match state.participants.get(id) {
        Some(p) if !p.name.is_empty() => format!("{} ({})", p.name, id),
        _ => id.to_string(),
    }
}

/// Prints one committed round, table by table.
pub fn print_round(state: &EventState, round: &RoundResult) {
    let flag = if round.degraded { " [degraded]" } else { "" };
    println!("\n=== Round {}{} ===", round.round_number, flag);
    println!(
        "{} tables, average score {:.1}, {} provisional",
        round.pairings.len(),
        round.average_score,
        round.provisional_pairs
    );
    for pairing in &round.pairings {
        let marker = if pairing.provisional { " *" } else { "" };
        println!(
            "  Table {:>2}: {} <-> {}  ({:.1}{})",
            pairing.table_number,
            participant_label(state, &pairing.a),
            participant_label(state, &pairing.b),
            pairing.score,
            marker
        );
    }
    if let Some(pit) = &round.pit_stop {
        println!("  Pit stop: {}", participant_label(state, pit));
    }
}

/// Prints the lookahead that came with an advance.
pub fn print_advisory(state: &EventState, outcome: &AdvanceOutcome) {
    if outcome.advisory.is_empty() {
        return;
    }
    println!("  Lookahead ({} rounds planned):", outcome.horizon);
    for planned in &outcome.advisory {
        let pit = planned
            .pit_stop
            .as_ref()
            .map(|id| format!(", pit stop {}", participant_label(state, id)))
            .unwrap_or_default();
        println!(
            "    round {}: {} pairs, average {:.1}{}",
            planned.round_number,
            planned.pairings.len(),
            planned.average_score(),
            pit
        );
    }
    if !outcome.relaxed.is_empty() {
        println!("    {} repeat pair(s) allowed in later rounds", outcome.relaxed.len());
    }
}

/// Prints pit-stop counts and mutual matches at the end of a run.
pub fn print_summary(state: &EventState) {
    println!("\n=== Summary: {} rounds, event {} ===", state.round_number, state.status);
    println!("Unique pairs met: {}", state.history.len());
    let mut benched: Vec<_> = state
        .participants
        .values()
        .filter(|p| !p.pit_stops.is_empty())
        .collect();
    benched.sort_by(|a, b| b.pit_stops.len().cmp(&a.pit_stops.len()).then(a.id.cmp(&b.id)));
    for p in benched {
        println!("  {} sat out {} time(s)", participant_label(state, &p.id), p.pit_stops.len());
    }
    if !state.mutual_matches.is_empty() {
        println!("Mutual matches:");
        for (key, round) in &state.mutual_matches {
            println!(
                "  {} & {} (round {})",
                participant_label(state, key.low()),
                participant_label(state, key.high()),
                round
            );
        }
    }
}

/// Writes every committed round as CSV: one row per table plus one for the pit stop.
pub fn write_rounds_csv<W: io::Write>(state: &EventState, writer: W) -> Result<(), Box<dyn std::error::Error>> {
    let mut wtr = WriterBuilder::new().has_headers(true).from_writer(writer);
    wtr.write_record(["round", "table", "participant_a", "name_a", "participant_b", "name_b", "score", "provisional"])?;

    let name = |id: &ParticipantId| state.participants.get(id).map(|p| p.name.clone()).unwrap_or_default();
    for round in &state.rounds {
        for pairing in &round.pairings {
            wtr.write_record([
                round.round_number.to_string(),
                pairing.table_number.to_string(),
                pairing.a.to_string(),
                name(&pairing.a),
                pairing.b.to_string(),
                name(&pairing.b),
                format!("{:.1}", pairing.score),
                pairing.provisional.to_string(),
            ])?;
        }
        if let Some(pit) = &round.pit_stop {
            wtr.write_record([
                round.round_number.to_string(),
                "pit-stop".to_string(),
                pit.to_string(),
                name(pit),
                String::new(),
                String::new(),
                String::new(),
                String::new(),
            ])?;
        }
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_rounds_to_file<P: AsRef<Path>>(state: &EventState, path: P) -> Result<(), Box<dyn std::error::Error>> {
    let file = std::fs::File::create(path)?;
    write_rounds_csv(state, file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::event::state::EventSettings;
    use crate::event::RoundStatus;
    use crate::matching::{Pairing, Participant};
    use chrono::Utc;

    fn played_state() -> EventState {
        let mut state = EventState::new("csv", EventSettings::from_config(&EngineConfig::default()));
        for (id, name) in [("a", "Ada"), ("b", "Bo"), ("c", "Chen")] {
            state.participants.insert(id.into(), Participant::new(id, name));
        }
        state.rounds.push(RoundResult {
            round_number: 1,
            pairings: vec![Pairing { table_number: 1, a: "a".into(), b: "b".into(), score: 72.4, provisional: false }],
            pit_stop: Some("c".into()),
            average_score: 72.4,
            provisional_pairs: 0,
            degraded: false,
            introduced: Vec::new(),
            created_at: Utc::now(),
        });
        state.round_number = 1;
        state.status = RoundStatus::BetweenRounds;
        state
    }

    #[test]
    fn test_rounds_csv_layout() {
        let state = played_state();
        let mut out = Vec::new();
        write_rounds_csv(&state, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "round,table,participant_a,name_a,participant_b,name_b,score,provisional");
        assert_eq!(lines[1], "1,1,a,Ada,b,Bo,72.4,false");
        assert_eq!(lines[2], "1,pit-stop,c,Chen,,,,");
    }

    #[test]
    fn test_label_falls_back_to_id() {
        let state = played_state();
        assert_eq!(participant_label(&state, &"a".into()), "Ada (a)");
        assert_eq!(participant_label(&state, &"zz".into()), "zz");
    }

    #[test]
    fn test_write_rounds_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rounds.csv");
        write_rounds_to_file(&played_state(), &path).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().starts_with("round,table"));
    }
}
