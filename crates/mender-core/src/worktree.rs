//! The working file tree agents mutate.
//!
//! Backups read from it and rollbacks write back to it. Paths are always
//! relative to the tree root.

use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

#[async_trait]
pub trait WorkTree: Send + Sync {
    /// `Ok(None)` when the file does not exist.
    async fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>>;

    async fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    /// Removing a missing file is not an error.
    async fn remove(&self, path: &Path) -> io::Result<()>;
}

/// Directory-backed tree.
#[derive(Debug, Clone)]
pub struct FsWorkTree {
    root: PathBuf,
}

impl FsWorkTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &Path) -> io::Result<PathBuf> {
        let escapes = path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path {} escapes the work tree", path.display()),
            ));
        }
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl WorkTree for FsWorkTree {
    async fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.resolve(path)?).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(full, data).await
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        match tokio::fs::remove_file(self.resolve(path)?).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// In-memory tree for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryWorkTree {
    files: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
}

impl MemoryWorkTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: impl Into<PathBuf>, data: impl Into<Vec<u8>>) -> Self {
        if let Ok(mut files) = self.files.lock() {
            files.insert(path.into(), data.into());
        }
        self
    }

    /// Current content as UTF-8, lossy.
    pub fn contents(&self, path: impl AsRef<Path>) -> Option<String> {
        self.files
            .lock()
            .ok()?
            .get(path.as_ref())
            .map(|d| String::from_utf8_lossy(d).into_owned())
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.files
            .lock()
            .map(|f| f.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn poisoned() -> io::Error {
        io::Error::new(io::ErrorKind::Other, "memory work tree lock poisoned")
    }
}

#[async_trait]
impl WorkTree for MemoryWorkTree {
    async fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        let files = self.files.lock().map_err(|_| Self::poisoned())?;
        Ok(files.get(path).cloned())
    }

    async fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut files = self.files.lock().map_err(|_| Self::poisoned())?;
        files.insert(path.to_path_buf(), data.to_vec());
        Ok(())
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        let mut files = self.files.lock().map_err(|_| Self::poisoned())?;
        files.remove(path);
        Ok(())
    }
}
