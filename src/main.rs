mod config;
mod display;
mod error;
mod event;
mod matching;
mod requests;
mod roster;
mod web;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::EngineConfig;
use display::{print_advisory, print_round, print_summary, write_rounds_to_file};
use event::{EventRegistry, EventStore, FileStore, MemoryStore, RoundStatus};
use roster::{demo_roster, load_roster, load_scores_csv, Roster};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}

fn print_usage() {
    println!("Usage:");
    println!("  round-matcher web [port]                      serve the JSON API");
    println!("  round-matcher simulate <roster.json> [rounds] [scores.csv]");
    println!("                                                play a roster offline");
    println!("  round-matcher demo [size] [rounds] [seed]     play a generated roster");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let config = EngineConfig::load()?;
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("web") => {
            let port = args.get(2).and_then(|p| p.parse::<u16>().ok()).unwrap_or(8080);
            let password = std::env::var("ADMIN_PASSWORD").unwrap_or_else(|_| "admin123".to_string());
            run_server(config, port, password).await?;
        }
        Some("simulate") => {
            let Some(path) = args.get(2) else {
                print_usage();
                return Ok(());
            };
            let rounds = args.get(3).and_then(|r| r.parse::<u32>().ok());
            let mut roster = load_roster(path)?;
            if let Some(scores_path) = args.get(4) {
                let extra = load_scores_csv(scores_path)?;
                println!("Merging {} pair scores from {}", extra.len(), scores_path);
                roster.scores.extend(extra);
            }
            println!("Loaded {} participants and {} pair scores", roster.participants.len(), roster.scores.len());
            simulate(config, roster, rounds).await?;
        }
        Some("demo") => {
            let size = args.get(2).and_then(|s| s.parse::<usize>().ok()).unwrap_or(24);
            let rounds = args.get(3).and_then(|r| r.parse::<u32>().ok());
            let seed = args.get(4).and_then(|s| s.parse::<u64>().ok()).unwrap_or(42);
            println!("Generating a demo roster of {} (seed {})", size, seed);
            simulate(config, demo_roster(size, seed), rounds).await?;
        }
        _ => print_usage(),
    }
    Ok(())
}

async fn run_server(config: EngineConfig, port: u16, password: String) -> Result<(), Box<dyn std::error::Error>> {
    let store: Arc<dyn EventStore> = match &config.data_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "using file store");
            Arc::new(FileStore::open(dir.clone())?)
        }
        None => {
            warn!("DATA_DIR not set, events live in memory only");
            Arc::new(MemoryStore::new())
        }
    };
    let registry = Arc::new(EventRegistry::new(config, store));
    let restored = registry.restore_all()?;
    if restored > 0 {
        info!(count = restored, "restored events");
    }

    let sweeper = Arc::clone(&registry);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            sweeper.sweep_timers(chrono::Utc::now()).await;
        }
    });

    let mut notifications = registry.notifier().subscribe();
    tokio::spawn(async move {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match notifications.recv().await {
                Ok(n) => info!(kind = n.name(), payload = %serde_json::to_string(&n).unwrap_or_default(), "notification"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "notification log fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    println!("Starting web server on port {}...", port);
    println!("Access the API at http://localhost:{}/api/health", port);
    web::start_server(port, password, registry).await?;
    Ok(())
}

/// Plays every round of a roster against an in-memory store and writes the
/// result to `rounds_<event>.csv`.
async fn simulate(mut config: EngineConfig, roster: Roster, rounds: Option<u32>) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(rounds) = rounds {
        config.event.total_rounds = rounds;
    }
    let total = config.event.total_rounds;
    let (participants, matrix) = roster.into_event_parts(true)?;
    let registry = EventRegistry::new(config, Arc::new(MemoryStore::new()));
    let event = registry.create_event("simulation", participants, matrix).await?;

    let pending = event.pending_scoring()?.len();
    if pending > 0 {
        println!("{} pairs have no base score and start provisional", pending);
    }

    for _ in 0..total {
        let outcome = match event.advance_round().await {
            Ok(outcome) => outcome,
            Err(e) => {
                println!("\nStopping: {}", e);
                break;
            }
        };
        let snapshot = event.snapshot()?;
        print_round(&snapshot, &outcome.round);
        print_advisory(&snapshot, &outcome);
        event.finish_round().await?;
    }
    if event.snapshot()?.status == RoundStatus::BetweenRounds {
        event.end_event().await?;
    }

    let snapshot = event.snapshot()?;
    print_summary(&snapshot);
    let filename = format!("rounds_{}.csv", snapshot.event_id);
    write_rounds_to_file(&snapshot, &filename)?;
    println!("\nRounds saved to {}", filename);
    Ok(())
}
