//! Pipeline stages.
//!
//! Stages give log and UI context only. They never drive the job status
//! state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A named phase within one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Initializing,
    CropDetect,
    AudioMeasure,
    Encoding,
    Finalizing,
    Complete,
    /// A stage name this version does not know about.
    #[serde(untagged)]
    Other(String),
}

impl Stage {
    /// The wire name of the stage.
    pub fn as_str(&self) -> &str {
        match self {
            Stage::Initializing => "initializing",
            Stage::CropDetect => "crop_detect",
            Stage::AudioMeasure => "audio_measure",
            Stage::Encoding => "encoding",
            Stage::Finalizing => "finalizing",
            Stage::Complete => "complete",
            Stage::Other(name) => name,
        }
    }

    /// Whether this is the terminal `complete` stage.
    pub fn is_complete(&self) -> bool {
        matches!(self, Stage::Complete)
    }
}

impl FromStr for Stage {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "initializing" => Stage::Initializing,
            "crop_detect" => Stage::CropDetect,
            "audio_measure" => Stage::AudioMeasure,
            "encoding" => Stage::Encoding,
            "finalizing" => Stage::Finalizing,
            "complete" => Stage::Complete,
            other => Stage::Other(other.to_string()),
        })
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_stages_round_trip_through_their_names() {
        for stage in [
            Stage::Initializing,
            Stage::CropDetect,
            Stage::AudioMeasure,
            Stage::Encoding,
            Stage::Finalizing,
            Stage::Complete,
        ] {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
    }

    #[test]
    fn unknown_stage_is_preserved() {
        let stage: Stage = "subtitle_extract".parse().unwrap();
        assert_eq!(stage, Stage::Other("subtitle_extract".into()));
        assert_eq!(stage.to_string(), "subtitle_extract");
        assert!(!stage.is_complete());
    }

    #[test]
    fn stage_serializes_as_wire_name() {
        assert_eq!(
            serde_json::to_string(&Stage::AudioMeasure).unwrap(),
            "\"audio_measure\""
        );
        assert_eq!(
            serde_json::to_string(&Stage::Other("x".into())).unwrap(),
            "\"x\""
        );
    }
}
