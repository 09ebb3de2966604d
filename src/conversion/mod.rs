//! Running one conversion job as an external pipeline process.
//!
//! The pipeline is any program that takes the job's positional arguments and
//! speaks the line protocol on stdout. This module owns:
//!
//! - Starting it in its own process group with a scrubbed environment
//! - Turning its stdout into typed protocol events
//! - Cooperative stop: SIGTERM to the group, a bounded grace period, SIGKILL
//! - Removing hidden temp artifacts on every non-success exit

mod cleanup;
mod supervisor;

pub use cleanup::{remove_temp_artifacts, reset_temp_dir, TempArtifacts};
pub use supervisor::{
    ConversionProcess, ExitOutcome, ProcessExit, ProcessSupervisor, SupervisorConfig,
};
