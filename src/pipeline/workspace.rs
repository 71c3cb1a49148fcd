use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::error::{Error, IoResultExt, Result};

const WORKSPACE_PREFIX: &str = "stemforge-";

/// exclusively owned scratch directory for one pipeline run.
///
/// created on first use, removed by [`Workspace::remove`] or on drop.
#[derive(Debug, Default)]
pub struct Workspace {
    dir: Option<TempDir>,
    parent: Option<PathBuf>,
}

impl Workspace {
    /// workspace created under the system temp directory
    pub fn new() -> Self {
        Self::default()
    }

    /// workspace created under `parent`
    pub fn in_dir(parent: impl Into<PathBuf>) -> Self {
        Self {
            dir: None,
            parent: Some(parent.into()),
        }
    }

    /// path of the workspace, creating it on first call.
    ///
    /// fails with `WorkspaceMissing` if the directory was removed behind
    /// our back.
    pub fn path(&mut self) -> Result<&Path> {
        if self.dir.is_none() {
            let mut builder = tempfile::Builder::new();
            builder.prefix(WORKSPACE_PREFIX);
            let dir = match &self.parent {
                Some(parent) => builder.tempdir_in(parent).with_path(parent)?,
                None => builder.tempdir().with_path(std::env::temp_dir())?,
            };
            tracing::debug!(path = %dir.path().display(), "created workspace");
            self.dir = Some(dir);
        }

        let dir = self.dir.as_ref().map(TempDir::path).ok_or_else(|| {
            Error::Invariant("workspace vanished after creation".to_string())
        })?;
        if !dir.is_dir() {
            tracing::debug!(path = %dir.display(), "workspace no longer exists");
            return Err(Error::WorkspaceMissing(dir.to_path_buf()));
        }
        Ok(dir)
    }

    /// path of `name` inside the workspace
    pub fn join(&mut self, name: impl AsRef<Path>) -> Result<PathBuf> {
        Ok(self.path()?.join(name))
    }

    /// path of the workspace if it has been created
    pub fn existing(&self) -> Option<&Path> {
        self.dir.as_ref().map(TempDir::path)
    }

    /// delete the workspace. safe to call repeatedly and after the
    /// directory has already disappeared.
    pub fn remove(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        let path = dir.path().to_path_buf();
        match dir.close() {
            Ok(()) => tracing::debug!(path = %path.display(), "deleted workspace"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), "failed to delete workspace: {}", e),
        }
    }

    /// stop managing the directory and leave it on disk
    pub fn persist(&mut self) -> Option<PathBuf> {
        self.dir.take().map(TempDir::keep)
    }
}
