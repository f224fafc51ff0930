//! Scoped ownership of transient local files.

use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// A transient local file with a single owner. Removed when the guard is
/// dropped unless it was already removed with [`LocalArtifact::remove`] or
/// kept with [`LocalArtifact::disarm`].
#[derive(Debug)]
pub struct LocalArtifact {
    path: PathBuf,
    armed: bool,
}

impl LocalArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file now. A file that was never created counts as removed.
    pub async fn remove(mut self) -> io::Result<()> {
        self.armed = false;
        match fs::remove_file(&self.path).await {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    /// Keep the file, typically because it was renamed into place.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for LocalArtifact {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = std::fs::remove_file(&self.path)
            && err.kind() != ErrorKind::NotFound
        {
            debug!("failed to remove {}: {}", self.path.display(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.dat");
        std::fs::write(&path, b"x").unwrap();

        drop(LocalArtifact::new(&path));
        assert!(!path.exists());
    }

    #[test]
    fn disarmed_file_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kept.dat");
        std::fs::write(&path, b"x").unwrap();

        LocalArtifact::new(&path).disarm();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn remove_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = LocalArtifact::new(dir.path().join("never-written.dat"));
        artifact.remove().await.unwrap();
    }

    #[tokio::test]
    async fn remove_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.dat");
        std::fs::write(&path, b"x").unwrap();

        LocalArtifact::new(&path).remove().await.unwrap();
        assert!(!path.exists());
    }
}
