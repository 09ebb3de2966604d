//! Encodeforge - sequential AV1 conversion queue
//!
//! This library crate exposes the job engine for the binary and for
//! integration testing: the job table and state machine, the single-worker
//! queue, pipeline process supervision, the observer event hub, and the
//! built-in conversion pipeline.

pub mod config;
pub mod conversion;
pub mod events;
pub mod pipeline;
pub mod probe;
pub mod queue;
pub mod shutdown;
pub mod state;
