//! Error types for encodeforge-protocol.

/// Errors produced while decoding tool output that the protocol depends on.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    /// A crop rectangle did not have the `w:h:x:y` shape.
    #[error("invalid crop rectangle: {0}")]
    InvalidCrop(String),

    /// No loudness report was found in the measurement output.
    #[error("loudness measurement not found in output")]
    MissingMeasurement,

    /// The loudness report was present but could not be decoded.
    #[error("failed to parse loudness measurement: {0}")]
    InvalidMeasurement(String),
}
