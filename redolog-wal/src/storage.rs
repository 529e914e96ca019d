//! External storage mirror for redo files.
//!
//! Segments and meta files are always written to a local directory first.
//! When a mirror is configured, flushed and closed segments and every flushed
//! meta file are uploaded to it, and readers download from it before opening
//! files.

use crate::error::{RedoError, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Object store holding copies of redo files, addressed by file name.
pub trait ExternalStorage: Send + Sync + fmt::Debug {
    /// Stores `data` under `name`, replacing any previous object.
    fn put(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Returns the object stored under `name`.
    fn get(&self, name: &str) -> Result<Vec<u8>>;

    /// Lists every object name.
    fn list(&self) -> Result<Vec<String>>;

    /// Deletes `name`; deleting a missing object is not an error.
    fn delete(&self, name: &str) -> Result<()>;
}

/// Parsed storage URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageUri {
    /// `file:///absolute/path`
    Local(PathBuf),
}

impl StorageUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| RedoError::InvalidConfig(format!("storage uri '{uri}' has no scheme")))?;

        match scheme.to_ascii_lowercase().as_str() {
            "file" | "local" => {
                if rest.is_empty() {
                    return Err(RedoError::InvalidConfig(format!(
                        "storage uri '{uri}' has no path"
                    )));
                }
                Ok(StorageUri::Local(PathBuf::from(rest)))
            }
            other => Err(RedoError::InvalidConfig(format!(
                "storage scheme '{other}' is not supported by this build"
            ))),
        }
    }

    /// Opens the storage backend for this URI.
    pub fn open(&self) -> Result<Arc<dyn ExternalStorage>> {
        match self {
            StorageUri::Local(path) => Ok(Arc::new(LocalStorage::open(path)?)),
        }
    }
}

/// Directory-backed mirror.
#[derive(Debug)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|e| RedoError::file_op("create", &root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name == ".." {
            return Err(RedoError::Storage(format!("invalid object name '{name}'")));
        }
        Ok(self.root.join(name))
    }
}

impl ExternalStorage for LocalStorage {
    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.path(name)?;
        let tmp = self.root.join(format!(".{name}.upload"));
        std::fs::write(&tmp, data).map_err(|e| RedoError::file_op("write", &tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| RedoError::file_op("rename", &path, e))?;
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path(name)?;
        match std::fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RedoError::NotFound(format!("object '{name}' in external storage")))
            }
            Err(e) => Err(RedoError::file_op("read", &path, e)),
        }
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = std::fs::read_dir(&self.root)
            .map_err(|e| RedoError::file_op("read directory", &self.root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| RedoError::file_op("read directory", &self.root, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.path(name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RedoError::file_op("delete", &path, e)),
        }
    }
}

/// Uploads a local file to the mirror under its own file name.
pub(crate) fn upload_file(storage: &dyn ExternalStorage, path: &Path) -> Result<()> {
    let name = file_name(path)?;
    let data = std::fs::read(path).map_err(|e| RedoError::file_op("read", path, e))?;
    storage.put(&name, &data)
}

/// When an existing local copy of a mirrored object is replaced.
#[derive(Clone, Copy)]
pub(crate) enum Refresh {
    /// The object never changes once written: fetched only when missing.
    Never,
    /// Append-only object: replaced when the mirror copy is longer.
    WhenLonger,
    /// Object rewritten in place: replaced when `newer(local, remote)` holds.
    WhenNewer(fn(&[u8], &[u8]) -> bool),
}

/// Downloads the objects `policy` selects into `dir`. Returns the number of
/// files written.
///
/// A local copy is never replaced by a mirror copy that is behind it, so
/// `dir` may also be the directory a writer works in.
pub(crate) fn download_matching(
    storage: &dyn ExternalStorage,
    dir: &Path,
    policy: impl Fn(&str) -> Option<Refresh>,
) -> Result<usize> {
    std::fs::create_dir_all(dir).map_err(|e| RedoError::file_op("create", dir, e))?;
    let mut fetched = 0;
    for name in storage.list()? {
        let Some(refresh) = policy(&name) else {
            continue;
        };
        let target = dir.join(&name);
        let exists = target.exists();
        if exists && matches!(refresh, Refresh::Never) {
            continue;
        }

        let data = match storage.get(&name) {
            Ok(data) => data,
            // Deleted from the mirror since it was listed
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        };
        if exists {
            let local =
                std::fs::read(&target).map_err(|e| RedoError::file_op("read", &target, e))?;
            let replace = match refresh {
                Refresh::Never => false,
                Refresh::WhenLonger => data.len() > local.len(),
                Refresh::WhenNewer(newer) => newer(&local, &data),
            };
            if !replace {
                continue;
            }
        }

        let tmp = dir.join(format!("{name}.download"));
        std::fs::write(&tmp, &data).map_err(|e| RedoError::file_op("write", &tmp, e))?;
        std::fs::rename(&tmp, &target).map_err(|e| RedoError::file_op("rename", &target, e))?;
        fetched += 1;
    }
    Ok(fetched)
}

pub(crate) fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| RedoError::Storage(format!("'{}' has no file name", path.display())))
}
