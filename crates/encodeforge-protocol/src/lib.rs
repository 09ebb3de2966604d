//! # encodeforge-protocol
//!
//! The line-oriented contract between the job engine and a conversion
//! pipeline process, parsed into a closed set of typed events at the boundary.
//!
//! A pipeline writes one directive per line on standard output:
//!
//! | Line                     | Meaning                                        |
//! |--------------------------|------------------------------------------------|
//! | `total_frames=<int>`     | denominator for percent-complete               |
//! | `STAGE:<name>`           | pipeline phase change                          |
//! | `STATUS:<text>`          | human-readable narration                       |
//! | `CMD:<text>`             | the reconstructed encode invocation            |
//! | `ERROR:<text>`           | fatal failure; nothing after it is read        |
//! | `frame=…`, `fps=…`, …    | ffmpeg `-progress` keys, closed by `progress=` |
//!
//! ## Quick Start
//!
//! ```
//! use encodeforge_protocol::{parse_lines, ProtocolEvent};
//!
//! let lines = ["total_frames=100", "frame=50", "fps=25.0", "progress=continue"];
//! let progress = parse_lines(lines)
//!     .find_map(|event| match event {
//!         ProtocolEvent::Progress(sample) => Some(sample),
//!         _ => None,
//!     })
//!     .unwrap();
//!
//! assert_eq!(progress.percent, Some(50.0));
//! assert_eq!(progress.eta_seconds, Some(2.0));
//! ```
//!
//! The crate also carries the two decisions the pipeline makes on its own:
//! the crop-consensus vote ([`crop`]) and the two-pass loudness measurement
//! hand-off ([`loudnorm`]).

pub mod crop;
pub mod error;
pub mod line;
pub mod loudnorm;
mod parser;
pub mod stage;

pub use crop::{consensus, CropRect};
pub use error::ParseError;
pub use line::ProtocolLine;
pub use loudnorm::{LoudnormMeasurement, LoudnormTarget};
pub use parser::{parse_lines, Events, ProgressSample, ProtocolEvent, ProtocolParser};
pub use stage::Stage;
