//! Crop detection hand-off and the consensus vote.
//!
//! ffmpeg's `cropdetect` filter is run over several short windows spread
//! across the source. Each window yields one candidate rectangle; a rectangle
//! is applied only if enough windows agree on it, so a single dark scene
//! cannot crop the whole film.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Windows that must agree before a crop is applied.
pub const DEFAULT_MIN_AGREEMENT: usize = 3;

/// Number of windows sampled by default.
pub const DEFAULT_SAMPLE_COUNT: usize = 8;

/// A crop rectangle in `cropdetect` terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CropRect {
    pub width: u32,
    pub height: u32,
    pub x: u32,
    pub y: u32,
}

impl CropRect {
    /// The ffmpeg filter that applies this crop.
    pub fn filter(&self) -> String {
        format!("crop={self}")
    }

    /// Whether the rectangle covers the whole `width`x`height` frame.
    pub fn is_full_frame(&self, width: u32, height: u32) -> bool {
        self.x == 0 && self.y == 0 && self.width >= width && self.height >= height
    }
}

impl fmt::Display for CropRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.width, self.height, self.x, self.y)
    }
}

impl FromStr for CropRect {
    type Err = ParseError;

    /// Accepts `w:h:x:y`, optionally prefixed with `crop=`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let body = s.strip_prefix("crop=").unwrap_or(s);
        let parts: Vec<&str> = body.split(':').collect();
        let [w, h, x, y] = parts.as_slice() else {
            return Err(ParseError::InvalidCrop(s.to_string()));
        };
        let num = |v: &str| {
            v.trim()
                .parse::<u32>()
                .map_err(|_| ParseError::InvalidCrop(s.to_string()))
        };
        Ok(CropRect {
            width: num(w)?,
            height: num(h)?,
            x: num(x)?,
            y: num(y)?,
        })
    }
}

fn crop_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"crop=(\d+:\d+:\d+:\d+)").expect("valid crop pattern"))
}

/// The settled rectangle of one `cropdetect` run: the last one it reports.
///
/// ```
/// use encodeforge_protocol::crop::parse_cropdetect_output;
///
/// let stderr = "\
/// [Parsed_cropdetect_0 @ 0x5] x1:0 x2:1919 y1:132 y2:947 w:1920 h:816 x:0 y:132 crop=1920:816:0:132
/// [Parsed_cropdetect_0 @ 0x5] x1:0 x2:1919 y1:138 y2:941 w:1920 h:800 x:0 y:140 crop=1920:800:0:140";
///
/// let rect = parse_cropdetect_output(stderr).unwrap();
/// assert_eq!(rect.filter(), "crop=1920:800:0:140");
/// ```
pub fn parse_cropdetect_output(output: &str) -> Option<CropRect> {
    crop_regex()
        .captures_iter(output)
        .filter_map(|caps| caps.get(1)?.as_str().parse().ok())
        .last()
}

/// Start offsets for `count` windows spread evenly over `duration` seconds,
/// staying clear of the very start and end.
pub fn sample_offsets(duration: f64, count: usize) -> Vec<f64> {
    if duration <= 0.0 || !duration.is_finite() {
        return Vec::new();
    }
    let step = duration / (count as f64 + 1.0);
    (1..=count).map(|i| step * i as f64).collect()
}

/// Majority vote across sampled candidates.
///
/// The candidate seen most often wins if it was seen at least
/// `min_agreement` times. Equal counts go to the candidate seen first, so the
/// result is deterministic for a given sample order. `None` means no crop.
///
/// ```
/// use encodeforge_protocol::consensus;
///
/// assert_eq!(consensus(&["a", "b", "a", "c", "a"], 3), Some("a"));
/// assert_eq!(consensus(&["a", "b", "a", "c"], 3), None);
/// ```
pub fn consensus<T: PartialEq + Clone>(samples: &[T], min_agreement: usize) -> Option<T> {
    // (candidate, votes) in first-seen order
    let mut tally: Vec<(&T, usize)> = Vec::new();
    for sample in samples {
        match tally.iter_mut().find(|(candidate, _)| *candidate == sample) {
            Some((_, votes)) => *votes += 1,
            None => tally.push((sample, 1)),
        }
    }

    let mut best: Option<(&T, usize)> = None;
    for (candidate, votes) in tally {
        if best.map_or(true, |(_, best_votes)| votes > best_votes) {
            best = Some((candidate, votes));
        }
    }

    best.filter(|(_, votes)| *votes >= min_agreement.max(1))
        .map(|(candidate, _)| candidate.clone())
}
