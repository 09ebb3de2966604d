//! The steps of the built-in conversion pipeline.

mod crop;
mod encode;
mod finalize;
mod loudness;

pub use crop::{cropdetect_command, detect_crop};
pub use encode::{encode_command, muxer_for, run_encode, EncodePlan};
pub use finalize::{finalize, finalize_command, ENCODER_COMMAND_TAG};
pub use loudness::{measure_loudness, measurement_command};
