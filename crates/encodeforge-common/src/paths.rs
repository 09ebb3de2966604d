//! Path conventions shared by the scheduler, the supervisor, and the pipeline.
//!
//! The output of a conversion lives next to its source with a fixed suffix
//! inserted before the extension. While a conversion runs, everything it writes
//! goes to hidden `*.tmp` siblings of the output path, so a partial encode is
//! never visible at the final path and can always be found again for cleanup.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// List of supported video file extensions.
const VIDEO_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "m4v", "ts", "webm", "mov", "wmv", "flv",
];

/// Extension used by every temporary artifact of a running conversion.
const TEMP_EXTENSION: &str = "tmp";

/// Check if a path has a video file extension.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use encodeforge_common::paths::is_video_file;
///
/// assert!(is_video_file(Path::new("movie.mkv")));
/// assert!(is_video_file(Path::new("/path/to/video.MP4")));
/// assert!(!is_video_file(Path::new("subtitle.srt")));
/// ```
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| VIDEO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Derive the output path for a source: `<dir>/<stem><suffix>.<ext>`.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use encodeforge_common::paths::output_path_for;
///
/// assert_eq!(
///     output_path_for(Path::new("/videos/show/ep01.mkv"), "_conv"),
///     Path::new("/videos/show/ep01_conv.mkv"),
/// );
/// assert_eq!(
///     output_path_for(Path::new("/videos/raw"), "_conv"),
///     Path::new("/videos/raw_conv"),
/// );
/// ```
pub fn output_path_for(source: &Path, suffix: &str) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_default();

    let mut name = stem;
    name.push(suffix);
    if let Some(ext) = source.extension() {
        name.push(".");
        name.push(ext);
    }

    match source.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Hidden temp path a conversion encodes into: `<dir>/.<output name>.tmp`.
pub fn temp_output_path(output: &Path) -> PathBuf {
    hidden_sibling(output, None)
}

/// Hidden temp path used while finalizing: `<dir>/.<output name>.<tag>.tmp`.
pub fn tagged_temp_path(output: &Path, tag: &str) -> PathBuf {
    hidden_sibling(output, Some(tag))
}

/// Whether `candidate` is one of the hidden temp artifacts belonging to `output`.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use encodeforge_common::paths::is_temp_artifact_of;
///
/// let output = Path::new("/videos/a_conv.mkv");
/// assert!(is_temp_artifact_of(output, Path::new("/videos/.a_conv.mkv.tmp")));
/// assert!(is_temp_artifact_of(output, Path::new("/videos/.a_conv.mkv.finalize.tmp")));
/// assert!(!is_temp_artifact_of(output, Path::new("/videos/a_conv.mkv")));
/// assert!(!is_temp_artifact_of(output, Path::new("/other/.a_conv.mkv.tmp")));
/// ```
pub fn is_temp_artifact_of(output: &Path, candidate: &Path) -> bool {
    candidate.parent() == output.parent() && is_temp_name_of(output, candidate)
}

/// List the temp artifacts of `output` that currently exist on disk.
pub fn existing_temp_artifacts(output: &Path) -> Vec<PathBuf> {
    let dir = match output.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| is_temp_name_of(output, path))
        .collect()
}

fn is_temp_name_of(output: &Path, candidate: &Path) -> bool {
    let (Some(name), Some(candidate_name)) = (
        output.file_name().and_then(|n| n.to_str()),
        candidate.file_name().and_then(|n| n.to_str()),
    ) else {
        return false;
    };

    candidate_name.starts_with(&format!(".{name}."))
        && candidate_name.ends_with(&format!(".{TEMP_EXTENSION}"))
}

fn hidden_sibling(output: &Path, tag: Option<&str>) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(output.file_name().unwrap_or_default());
    if let Some(tag) = tag {
        name.push(".");
        name.push(tag);
    }
    name.push(".");
    name.push(TEMP_EXTENSION);

    match output.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}
