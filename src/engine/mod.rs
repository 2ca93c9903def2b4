//! Analysis orchestration: per-subject run slots, a worker pool, and the
//! phase pipeline each worker drives.

pub mod orchestrator;
mod run;

pub use orchestrator::{EnqueueOutcome, Enqueued, Orchestrator, OrchestratorConfig, RunHandle};
