//! Object-store interface and the local filesystem implementation.
//!
//! Staging is expressed against the [`Store`] trait so the orchestration
//! code never talks to a concrete backend. The filesystem store resolves
//! `file://` URLs and bare paths on the host; a cloud object-store client
//! would implement the same trait for its scheme. Network clients are out
//! of scope here, so an unregistered scheme surfaces as
//! [`StorageError::UnsupportedScheme`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use glob::Pattern;

/// Errors from staging operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("no store registered for '{0}'")]
    UnsupportedScheme(String),

    #[error("invalid wildcard pattern '{0}'")]
    BadPattern(String),

    #[error("IO error for '{uri}': {source}")]
    Io {
        uri: String,
        source: std::io::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// How an object or set of objects is transferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// A single object, copied verbatim.
    Single,
    /// A single-component wildcard; every match is copied by basename.
    Wildcard,
    /// A directory tree, synced in bulk.
    Recursive,
}

/// A pluggable storage backend for one URI scheme.
#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    /// Whether this store can resolve the given URI.
    fn handles(&self, uri: &str) -> bool;

    /// Whether at least one object matches the URI under the given
    /// transfer kind. Used by the skip-if-outputs-exist check.
    async fn any_match(&self, uri: &str, kind: TransferKind) -> StorageResult<bool>;

    /// Copies remote object(s) to a local destination.
    ///
    /// For `Single` the destination is the target file path; for
    /// `Wildcard` and `Recursive` it is the target directory.
    async fn fetch(&self, uri: &str, dest: &Path, kind: TransferKind) -> StorageResult<()>;

    /// Copies local file(s) out to the remote URI.
    ///
    /// For `Single` the source is a file; for `Wildcard` it is a pattern
    /// expanded against the local filesystem; for `Recursive` it is a
    /// directory synced to the remote prefix.
    async fn store(&self, src: &Path, uri: &str, kind: TransferKind) -> StorageResult<()>;
}

/// An ordered set of stores, consulted per-URI.
#[derive(Clone, Default)]
pub struct StoreSet {
    stores: Vec<Arc<dyn Store>>,
}

impl StoreSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, store: Arc<dyn Store>) -> Self {
        self.stores.push(store);
        self
    }

    /// Resolves the store responsible for a URI.
    pub fn for_uri(&self, uri: &str) -> StorageResult<&dyn Store> {
        self.stores
            .iter()
            .find(|s| s.handles(uri))
            .map(|s| s.as_ref())
            .ok_or_else(|| StorageError::UnsupportedScheme(uri.to_string()))
    }
}

/// Store backed by the host filesystem, for `file://` URLs and bare paths.
#[derive(Debug, Default, Clone)]
pub struct FileStore;

impl FileStore {
    pub fn new() -> Self {
        Self
    }

    /// Maps a URI onto a host path.
    fn to_path(uri: &str) -> StorageResult<PathBuf> {
        if let Some(rest) = uri.strip_prefix("file://") {
            Ok(PathBuf::from(format!(
                "/{}",
                rest.trim_start_matches('/')
            )))
        } else if uri.contains("://") {
            Err(StorageError::UnsupportedScheme(uri.to_string()))
        } else {
            Ok(PathBuf::from(uri))
        }
    }
}

#[async_trait]
impl Store for FileStore {
    fn handles(&self, uri: &str) -> bool {
        uri.starts_with("file://") || !uri.contains("://")
    }

    async fn any_match(&self, uri: &str, kind: TransferKind) -> StorageResult<bool> {
        let path = Self::to_path(uri)?;
        spawn_fs(uri, move || match kind {
            TransferKind::Single => Ok(path.is_file()),
            TransferKind::Wildcard => Ok(!expand_pattern(&path)?.is_empty()),
            TransferKind::Recursive => {
                if !path.is_dir() {
                    return Ok(false);
                }
                Ok(std::fs::read_dir(&path)
                    .map(|mut d| d.next().is_some())
                    .unwrap_or(false))
            }
        })
        .await
    }

    async fn fetch(&self, uri: &str, dest: &Path, kind: TransferKind) -> StorageResult<()> {
        let src = Self::to_path(uri)?;
        let dest = dest.to_path_buf();
        let uri_owned = uri.to_string();
        spawn_fs(uri, move || match kind {
            TransferKind::Single => {
                if !src.is_file() {
                    return Err(StorageError::NotFound(uri_owned));
                }
                copy_file(&src, &dest)
            }
            TransferKind::Wildcard => {
                let matches = expand_pattern(&src)?;
                if matches.is_empty() {
                    return Err(StorageError::NotFound(uri_owned));
                }
                for m in matches {
                    let name = m.file_name().unwrap_or_default();
                    copy_file(&m, &dest.join(name))?;
                }
                Ok(())
            }
            TransferKind::Recursive => {
                if !src.is_dir() {
                    return Err(StorageError::NotFound(uri_owned));
                }
                copy_tree(&src, &dest)
            }
        })
        .await
    }

    async fn store(&self, src: &Path, uri: &str, kind: TransferKind) -> StorageResult<()> {
        let dest = Self::to_path(uri)?;
        let src = src.to_path_buf();
        spawn_fs(uri, move || match kind {
            TransferKind::Single => {
                if !src.is_file() {
                    return Err(StorageError::NotFound(src.display().to_string()));
                }
                copy_file(&src, &dest)
            }
            TransferKind::Wildcard => {
                // Both sides end in the same wildcard component; matches
                // land in the remote parent by basename.
                let matches = expand_pattern(&src)?;
                let dest_dir = dest.parent().map(Path::to_path_buf).unwrap_or(dest);
                for m in matches {
                    let name = m.file_name().unwrap_or_default();
                    copy_file(&m, &dest_dir.join(name))?;
                }
                Ok(())
            }
            TransferKind::Recursive => {
                if !src.is_dir() {
                    return Err(StorageError::NotFound(src.display().to_string()));
                }
                copy_tree(&src, &dest)
            }
        })
        .await
    }
}

/// Runs a blocking filesystem closure off the async runtime.
async fn spawn_fs<T: Send + 'static>(
    uri: &str,
    f: impl FnOnce() -> StorageResult<T> + Send + 'static,
) -> StorageResult<T> {
    let uri = uri.to_string();
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Io {
            uri,
            source: std::io::Error::other(e),
        })?
}

/// Expands a single-component trailing wildcard against the filesystem.
fn expand_pattern(pattern: &Path) -> StorageResult<Vec<PathBuf>> {
    let text = pattern.to_string_lossy();
    let parent = pattern
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));
    let component = pattern
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| StorageError::BadPattern(text.to_string()))?;
    let matcher =
        Pattern::new(&component).map_err(|_| StorageError::BadPattern(text.to_string()))?;

    let mut matches = Vec::new();
    let entries = match std::fs::read_dir(&parent) {
        Ok(e) => e,
        Err(_) => return Ok(matches),
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if matcher.matches(&name.to_string_lossy()) && entry.path().is_file() {
            matches.push(entry.path());
        }
    }
    matches.sort();
    Ok(matches)
}

fn io_err(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        uri: path.display().to_string(),
        source,
    }
}

fn copy_file(src: &Path, dest: &Path) -> StorageResult<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    std::fs::copy(src, dest).map_err(|e| io_err(dest, e))?;
    Ok(())
}

fn copy_tree(src: &Path, dest: &Path) -> StorageResult<()> {
    std::fs::create_dir_all(dest).map_err(|e| io_err(dest, e))?;
    for entry in std::fs::read_dir(src).map_err(|e| io_err(src, e))?.flatten() {
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if from.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            std::fs::copy(&from, &to).map_err(|e| io_err(&to, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn single_fetch_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src/a.txt");
        write(&src, "hello");
        let dest = dir.path().join("dest/a.txt");

        let store = FileStore::new();
        let uri = format!("file://{}", src.display());
        assert!(store.any_match(&uri, TransferKind::Single).await.unwrap());
        store.fetch(&uri, &dest, TransferKind::Single).await.unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "hello");
    }

    #[tokio::test]
    async fn wildcard_fetch_copies_matches_by_basename() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.bam", "b.bam", "c.bam", "d.txt"] {
            write(&dir.path().join("src").join(name), name);
        }
        let dest = dir.path().join("dest");

        let store = FileStore::new();
        let uri = format!("{}/src/*.bam", dir.path().display());
        store.fetch(&uri, &dest, TransferKind::Wildcard).await.unwrap();

        let mut names: Vec<_> = std::fs::read_dir(&dest)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names, ["a.bam", "b.bam", "c.bam"]);
    }

    #[tokio::test]
    async fn recursive_fetch_copies_tree() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("src/x/deep/f.txt"), "f");
        write(&dir.path().join("src/top.txt"), "t");
        let dest = dir.path().join("dest");

        let store = FileStore::new();
        let uri = dir.path().join("src").display().to_string();
        store.fetch(&uri, &dest, TransferKind::Recursive).await.unwrap();
        assert!(dest.join("x/deep/f.txt").is_file());
        assert!(dest.join("top.txt").is_file());
    }

    #[tokio::test]
    async fn wildcard_store_lands_in_remote_parent() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("out/r1.txt"), "1");
        write(&dir.path().join("out/r2.txt"), "2");

        let store = FileStore::new();
        let pattern = dir.path().join("out/*.txt");
        let uri = format!("{}/remote/*.txt", dir.path().display());
        store.store(&pattern, &uri, TransferKind::Wildcard).await.unwrap();
        assert!(dir.path().join("remote/r1.txt").is_file());
        assert!(dir.path().join("remote/r2.txt").is_file());
    }

    #[tokio::test]
    async fn missing_single_fetch_is_not_found() {
        let store = FileStore::new();
        let err = store
            .fetch("file:///does/not/exist", Path::new("/tmp/x"), TransferKind::Single)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn any_match_wildcard() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("d/one.vcf"), "x");
        let store = FileStore::new();
        let hit = format!("{}/d/*.vcf", dir.path().display());
        let miss = format!("{}/d/*.bam", dir.path().display());
        assert!(store.any_match(&hit, TransferKind::Wildcard).await.unwrap());
        assert!(!store.any_match(&miss, TransferKind::Wildcard).await.unwrap());
    }

    #[test]
    fn store_set_resolves_by_scheme() {
        let set = StoreSet::new().register(Arc::new(FileStore::new()));
        assert!(set.for_uri("file:///x").is_ok());
        assert!(set.for_uri("/plain/path").is_ok());
        let err = set.for_uri("gs://bucket/obj").unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedScheme(_)));
    }
}
