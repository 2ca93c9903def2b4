//! Core data model.
//!
//! An analysis record is one unit of work: a tender reference driven through
//! the phase pipeline. A ledger entry is the persisted proof that an ingestion
//! candidate was already evaluated.

pub mod analysis;
pub mod ledger;

pub use analysis::*;
pub use ledger::*;
