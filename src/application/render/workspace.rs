use std::{
    io,
    path::{Component, Path, PathBuf},
};

use tempfile::TempDir;
use tracing::{debug, warn};

const WORKSPACE_PREFIX: &str = "latex";

/// Allocates one private scratch directory per render.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceManager {
    root: Option<PathBuf>,
}

impl WorkspaceManager {
    /// Workspaces are created under `root`, or the system temp directory when unset.
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    pub fn create(&self) -> io::Result<Workspace> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(WORKSPACE_PREFIX);
        let dir = match self.root.as_ref() {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        debug!(
            target = "application::render::workspace",
            path = %dir.path().display(),
            "workspace created"
        );
        Ok(Workspace {
            path: dir.path().to_path_buf(),
            dir: Some(dir),
        })
    }
}

/// An exclusively owned directory removed exactly once, either through
/// [`Workspace::destroy`] or when dropped on an early exit.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    dir: Option<TempDir>,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_input(&self, name: &str, bytes: &[u8]) -> io::Result<()> {
        let path = self.resolve(name)?;
        tokio::fs::write(path, bytes).await
    }

    pub async fn read_output(&self, name: &str) -> io::Result<Vec<u8>> {
        let path = self.resolve(name)?;
        tokio::fs::read(path).await
    }

    /// Remove the directory. Failures are logged and swallowed; the caller has
    /// already decided the response.
    pub fn destroy(mut self) {
        self.remove();
    }

    fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(file)), None) => Ok(self.path.join(file)),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("`{name}` is not a plain file name"),
            )),
        }
    }

    fn remove(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        match dir.close() {
            Ok(()) => debug!(
                target = "application::render::workspace",
                path = %self.path.display(),
                "workspace removed"
            ),
            Err(err) => warn!(
                target = "application::render::workspace",
                path = %self.path.display(),
                error = %err,
                "failed to remove workspace"
            ),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.remove();
    }
}
