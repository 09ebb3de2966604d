//! Two-pass loudness normalization.
//!
//! The first pass runs `loudnorm` in analysis mode and prints a JSON report;
//! the second pass feeds the measured values back so the filter can normalize
//! linearly instead of guessing dynamically.

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Normalization targets shared by both passes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoudnormTarget {
    /// Integrated loudness, LUFS.
    pub integrated: f64,
    /// Maximum true peak, dBTP.
    pub true_peak: f64,
    /// Loudness range, LU.
    pub lra: f64,
}

impl Default for LoudnormTarget {
    fn default() -> Self {
        Self {
            integrated: -16.0,
            true_peak: -1.5,
            lra: 11.0,
        }
    }
}

impl LoudnormTarget {
    /// Filter for the measurement pass.
    ///
    /// ```
    /// use encodeforge_protocol::LoudnormTarget;
    ///
    /// assert_eq!(
    ///     LoudnormTarget::default().first_pass_filter(),
    ///     "loudnorm=I=-16:TP=-1.5:LRA=11:print_format=json"
    /// );
    /// ```
    pub fn first_pass_filter(&self) -> String {
        format!(
            "loudnorm=I={}:TP={}:LRA={}:print_format=json",
            self.integrated, self.true_peak, self.lra
        )
    }

    /// Filter for the encode pass, seeded with a first-pass measurement.
    pub fn second_pass_filter(&self, measured: &LoudnormMeasurement) -> String {
        format!(
            "loudnorm=I={}:TP={}:LRA={}:measured_I={}:measured_TP={}:measured_LRA={}:measured_thresh={}:offset={}:linear=true",
            self.integrated,
            self.true_peak,
            self.lra,
            measured.input_i,
            measured.input_tp,
            measured.input_lra,
            measured.input_thresh,
            measured.target_offset,
        )
    }
}

/// Values measured by the first pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoudnormMeasurement {
    pub input_i: f64,
    pub input_tp: f64,
    pub input_lra: f64,
    pub input_thresh: f64,
    pub target_offset: f64,
}

/// ffmpeg prints every value as a JSON string.
#[derive(Deserialize)]
struct RawReport {
    input_i: String,
    input_tp: String,
    input_lra: String,
    input_thresh: String,
    target_offset: String,
}

impl LoudnormMeasurement {
    /// Extract the measurement from first-pass output.
    ///
    /// The report is the last `{ … }` block in the text; anything ffmpeg logs
    /// before it is skipped.
    pub fn parse(output: &str) -> Result<Self, ParseError> {
        let start = output.rfind('{').ok_or(ParseError::MissingMeasurement)?;
        let len = output[start..]
            .find('}')
            .ok_or(ParseError::MissingMeasurement)?;
        let block = &output[start..=start + len];

        let raw: RawReport = serde_json::from_str(block)
            .map_err(|e| ParseError::InvalidMeasurement(e.to_string()))?;

        Ok(Self {
            input_i: number("input_i", &raw.input_i)?,
            input_tp: number("input_tp", &raw.input_tp)?,
            input_lra: number("input_lra", &raw.input_lra)?,
            input_thresh: number("input_thresh", &raw.input_thresh)?,
            target_offset: number("target_offset", &raw.target_offset)?,
        })
    }
}

fn number(field: &str, value: &str) -> Result<f64, ParseError> {
    match value.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(ParseError::InvalidMeasurement(format!(
            "{field} is not a finite number: {value:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"
[Parsed_loudnorm_0 @ 0x55d0c8a4a2c0]
{
	"input_i" : "-27.61",
	"input_tp" : "-4.47",
	"input_lra" : "18.06",
	"input_thresh" : "-39.20",
	"output_i" : "-16.58",
	"output_tp" : "-1.50",
	"output_lra" : "14.78",
	"output_thresh" : "-27.71",
	"normalization_type" : "dynamic",
	"target_offset" : "0.58"
}
"#;

    #[test]
    fn parses_report_after_log_noise() {
        let text = format!("Input #0, matroska,webm, from 'a.mkv':\n  Duration: 00:42:00\n{REPORT}");
        let m = LoudnormMeasurement::parse(&text).unwrap();
        assert_eq!(m.input_i, -27.61);
        assert_eq!(m.input_tp, -4.47);
        assert_eq!(m.input_lra, 18.06);
        assert_eq!(m.input_thresh, -39.20);
        assert_eq!(m.target_offset, 0.58);
    }

    #[test]
    fn second_pass_carries_measurement() {
        let m = LoudnormMeasurement::parse(REPORT).unwrap();
        let filter = LoudnormTarget::default().second_pass_filter(&m);
        assert_eq!(
            filter,
            "loudnorm=I=-16:TP=-1.5:LRA=11:measured_I=-27.61:measured_TP=-4.47:\
             measured_LRA=18.06:measured_thresh=-39.2:offset=0.58:linear=true"
        );
    }

    #[test]
    fn missing_report_is_reported() {
        assert_eq!(
            LoudnormMeasurement::parse("no json here"),
            Err(ParseError::MissingMeasurement)
        );
    }

    #[test]
    fn silent_input_is_rejected() {
        let report = REPORT.replace("\"-27.61\"", "\"-inf\"");
        assert!(matches!(
            LoudnormMeasurement::parse(&report),
            Err(ParseError::InvalidMeasurement(msg)) if msg.contains("input_i")
        ));
    }

    #[test]
    fn truncated_report_is_invalid() {
        let report = "{ \"input_i\" : \"-20.0\" }";
        assert!(matches!(
            LoudnormMeasurement::parse(report),
            Err(ParseError::InvalidMeasurement(_))
        ));
    }
}
