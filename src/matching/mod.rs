//! Pairing core: the compatibility model, pit-stop rotation and the round solver.
//! Nothing in here holds state between calls.

pub mod blossom;
pub mod compatibility;
pub mod pit_stop;
pub mod solver;
pub mod types;

pub use compatibility::ScoringContext;
pub use pit_stop::PitStopLedger;
pub use solver::{solve, DegradeReason, PlannedRound, SolveRequest};
pub use types::*;
