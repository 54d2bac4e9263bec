//! CLI command implementations.

pub mod backfill;
pub mod maintenance;

pub use backfill::{BackfillCommand, BatchOrchestrator, Pacing};
pub use maintenance::MaintenanceCommand;
