//! Staged job tracking for strategy research runs.
//!
//! A job walks through an ordered stage plan under a turn/token budget.
//! When the budget runs out the job parks in `NEEDS_CONFIRM` until a human
//! grants more, and clients follow it by polling consistent snapshots.

pub mod config;
pub mod error;
pub mod executor;
pub mod gate;
pub mod logging;
pub mod orchestrator;
pub mod poller;
pub mod registry;
pub mod state_machine;

pub use config::RunledgerConfig;
pub use error::{JobError, PollError};
pub use executor::{StageExecutor, StageReport, StageRequest};
pub use gate::GateEvaluator;
pub use orchestrator::JobOrchestrator;
pub use poller::{JobPoller, PollConfig, PollEvent, PollOutcome};
pub use registry::{JobFilter, JobRegistry};
