//! Encodeforge-Common: Shared types, constants, and utilities.
//!
//! This crate provides common functionality used across encodeforge:
//!
//! - **Typed IDs**: Type-safe UUID wrappers for jobs and observers
//! - **Path Conventions**: Output path derivation and the hidden temp-file naming
//!   scheme shared by the supervisor and the conversion pipeline
//! - **Error Handling**: The unified error type and result alias
//!
//! # Examples
//!
//! ```
//! use encodeforge_common::{JobId, Error, Result};
//! use encodeforge_common::paths::{output_path_for, temp_output_path};
//! use std::path::Path;
//!
//! let job_id = JobId::new();
//!
//! let output = output_path_for(Path::new("/videos/movie.mkv"), "_conv");
//! assert_eq!(output, Path::new("/videos/movie_conv.mkv"));
//! assert_eq!(temp_output_path(&output), Path::new("/videos/.movie_conv.mkv.tmp"));
//!
//! fn example() -> Result<()> {
//!     Err(Error::not_found("job", JobId::new()))
//! }
//! ```

pub mod error;
pub mod ids;
pub mod paths;

pub use error::{Error, Result};
pub use ids::*;
