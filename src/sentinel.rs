use std::path::{Path, PathBuf};

use crate::models::ArtifactState;

/// Decides job completion from the presence of a single artifact file.
#[derive(Debug, Clone)]
pub struct Sentinel {
    artifact: PathBuf,
}

impl Sentinel {
    pub fn new(artifact: impl Into<PathBuf>) -> Self {
        Self {
            artifact: artifact.into(),
        }
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    pub fn artifact_path(&self, result_dir: &Path) -> PathBuf {
        result_dir.join(&self.artifact)
    }

    pub fn classify(&self, result_dir: &Path) -> ArtifactState {
        if !result_dir.exists() {
            return ArtifactState::Unstarted;
        }
        if self.artifact_path(result_dir).is_file() {
            ArtifactState::Completed
        } else {
            ArtifactState::Partial
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn classifies_by_directory_and_artifact() {
        let tmp = TempDir::new().expect("tempdir");
        let sentinel = Sentinel::new("index.html");
        let dir = tmp.path().join("Result_A");

        assert_eq!(sentinel.classify(&dir), ArtifactState::Unstarted);

        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("regions.js"), "partial output").expect("write");
        assert_eq!(sentinel.classify(&dir), ArtifactState::Partial);

        fs::write(dir.join("index.html"), "<html></html>").expect("write");
        assert_eq!(sentinel.classify(&dir), ArtifactState::Completed);
    }

    #[test]
    fn nested_artifact_path_and_directory_named_like_artifact() {
        let tmp = TempDir::new().expect("tempdir");
        let sentinel = Sentinel::new("report/done.txt");
        let dir = tmp.path().join("Result_B");
        fs::create_dir_all(dir.join("report/done.txt")).expect("mkdir");
        assert_eq!(sentinel.classify(&dir), ArtifactState::Partial);

        fs::remove_dir(dir.join("report/done.txt")).expect("rmdir");
        fs::write(dir.join("report/done.txt"), "ok").expect("write");
        assert_eq!(sentinel.classify(&dir), ArtifactState::Completed);
    }
}
