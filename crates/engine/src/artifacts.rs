use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use csvforge_core::ArtifactRef;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact store unavailable: {0}")]
    Unavailable(String),

    #[error("failed to remove artifact {reference}: {reason}")]
    Remove { reference: ArtifactRef, reason: String },
}

/// Blob store holding job inputs and outputs.
///
/// The scheduler only ever passes references through; removal on job deletion
/// is the one operation it needs.
pub trait ArtifactStore: Send + Sync + 'static {
    fn remove(&self, reference: &ArtifactRef) -> Result<(), ArtifactError>;
}

/// Artifact store that keeps everything (artifacts managed elsewhere).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopArtifactStore;

impl ArtifactStore for NoopArtifactStore {
    fn remove(&self, _reference: &ArtifactRef) -> Result<(), ArtifactError> {
        Ok(())
    }
}

/// Artifacts kept as files under one root directory.
///
/// A reference is a path relative to the root; references that would leave
/// the root are refused.
#[derive(Debug, Clone)]
pub struct DirArtifactStore {
    root: PathBuf,
}

impl DirArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, reference: &ArtifactRef) -> Result<PathBuf, ArtifactError> {
        let relative = Path::new(reference.as_str());
        let contained = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !contained {
            return Err(ArtifactError::Remove {
                reference: reference.clone(),
                reason: "reference points outside the artifact root".to_string(),
            });
        }
        Ok(self.root.join(relative))
    }
}

impl ArtifactStore for DirArtifactStore {
    /// Already missing files count as removed.
    fn remove(&self, reference: &ArtifactRef) -> Result<(), ArtifactError> {
        if !self.root.is_dir() {
            return Err(ArtifactError::Unavailable(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        let path = self.path_of(reference)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ArtifactError::Remove {
                reference: reference.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(s: &str) -> ArtifactRef {
        ArtifactRef::new(s).unwrap()
    }

    #[test]
    fn removes_files_and_tolerates_missing_ones() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("client")).unwrap();
        fs::write(dir.path().join("client/input.csv"), b"a,b\n1,2\n").unwrap();
        let store = DirArtifactStore::new(dir.path());

        store.remove(&artifact("client/input.csv")).unwrap();
        assert!(!dir.path().join("client/input.csv").exists());
        store.remove(&artifact("client/input.csv")).unwrap();
        store.remove(&artifact("never-written.py")).unwrap();
    }

    #[test]
    fn references_outside_the_root_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("artifacts");
        fs::create_dir(&root).unwrap();
        fs::write(dir.path().join("keep.csv"), b"x").unwrap();
        let store = DirArtifactStore::new(&root);

        for reference in ["../keep.csv", "nested/../../keep.csv"] {
            let err = store.remove(&artifact(reference)).unwrap_err();
            assert!(matches!(err, ArtifactError::Remove { .. }), "{reference}: {err}");
        }
        let absolute = dir.path().join("keep.csv");
        let err = store
            .remove(&artifact(&absolute.to_string_lossy()))
            .unwrap_err();
        assert!(matches!(err, ArtifactError::Remove { .. }));
        assert!(dir.path().join("keep.csv").exists());
    }

    #[test]
    fn directory_in_place_of_a_file_is_a_removal_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("result.csv")).unwrap();
        let store = DirArtifactStore::new(dir.path());

        let err = store.remove(&artifact("result.csv")).unwrap_err();
        assert!(matches!(
            err,
            ArtifactError::Remove { ref reference, .. } if reference.as_str() == "result.csv"
        ));
    }

    #[test]
    fn missing_root_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirArtifactStore::new(dir.path().join("gone"));
        let err = store.remove(&artifact("input.csv")).unwrap_err();
        assert!(matches!(err, ArtifactError::Unavailable(_)));
    }
}
