//! # rpval-daemon
//!
//! The iteration loop around the rpval validation engine.
//!
//! The daemon sequences the four stages of each iteration (RRDP sync,
//! TAL fetch, rsync sync, validation), maintains the fetch sets that
//! connect them, detects when repository discovery has reached a fixed
//! point, and publishes the resulting ROA snapshot for the serving
//! collaborator.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod http;
pub mod orchestrator;
pub mod snapshot;

pub use orchestrator::{FatalError, Orchestrator};
pub use snapshot::{SharedSnapshot, Snapshot};
