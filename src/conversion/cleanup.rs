//! Temp-file hygiene for conversions.

use encodeforge_common::paths::existing_temp_artifacts;
use std::path::{Path, PathBuf};

/// Delete the hidden temp artifacts of `output`. Returns how many were removed.
pub fn remove_temp_artifacts(output: &Path) -> usize {
    let mut removed = 0;
    for path in existing_temp_artifacts(output) {
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "Removed temp artifact");
                removed += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove temp artifact");
            }
        }
    }
    removed
}

/// Empty `dir`, creating it first if needed. Anything inside is an orphan of
/// an earlier run. Returns how many entries were removed.
pub fn reset_temp_dir(dir: &Path) -> std::io::Result<usize> {
    std::fs::create_dir_all(dir)?;

    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let result = if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match result {
            Ok(()) => {
                tracing::info!(path = %path.display(), "Cleaned orphaned temp entry");
                removed += 1;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to clean temp entry");
            }
        }
    }
    Ok(removed)
}

/// Ownership of the temp artifacts a running conversion may leave behind.
///
/// Unless [`keep`](Self::keep) is called, the artifacts are deleted when this
/// is dropped.
#[derive(Debug)]
pub struct TempArtifacts {
    output: PathBuf,
    armed: bool,
}

impl TempArtifacts {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            armed: true,
        }
    }

    /// The conversion succeeded; leave the filesystem as it is.
    pub fn keep(&mut self) {
        self.armed = false;
    }

    /// Delete the artifacts now.
    pub fn cleanup(&mut self) -> usize {
        self.armed = false;
        remove_temp_artifacts(&self.output)
    }
}

impl Drop for TempArtifacts {
    fn drop(&mut self) {
        if self.armed {
            remove_temp_artifacts(&self.output);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encodeforge_common::paths::{tagged_temp_path, temp_output_path};

    #[test]
    fn test_remove_temp_artifacts_leaves_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("a_conv.mkv");
        std::fs::write(temp_output_path(&output), b"partial").unwrap();
        std::fs::write(tagged_temp_path(&output, "finalize"), b"partial").unwrap();
        std::fs::write(dir.path().join("a.mkv"), b"source").unwrap();

        assert_eq!(remove_temp_artifacts(&output), 2);
        assert!(dir.path().join("a.mkv").exists());
        assert_eq!(remove_temp_artifacts(&output), 0);
    }

    #[test]
    fn test_reset_temp_dir_creates_and_empties() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("work");
        assert_eq!(reset_temp_dir(&temp).unwrap(), 0);
        assert!(temp.is_dir());

        std::fs::write(temp.join("loudnorm.json"), b"{}").unwrap();
        std::fs::create_dir(temp.join("nested")).unwrap();
        std::fs::write(temp.join("nested").join("x"), b"").unwrap();

        assert_eq!(reset_temp_dir(&temp).unwrap(), 2);
        assert_eq!(std::fs::read_dir(&temp).unwrap().count(), 0);
    }

    #[test]
    fn test_guard_cleans_on_drop_unless_kept() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("b_conv.mkv");
        let temp = temp_output_path(&output);

        std::fs::write(&temp, b"partial").unwrap();
        drop(TempArtifacts::new(&output));
        assert!(!temp.exists());

        std::fs::write(&temp, b"partial").unwrap();
        let mut guard = TempArtifacts::new(&output);
        guard.keep();
        drop(guard);
        assert!(temp.exists());
    }
}
