//! Path model for job inputs, outputs, and mounts.
//!
//! User-supplied paths are classified at construction time and carry enough
//! information to derive both their canonical remote form and the path they
//! will occupy inside the task container. The container layout places every
//! staged object under a fixed data-disk root:
//!
//! ```text
//! /mnt/data
//! ├── input/gs/<bucket>/<path>     remote inputs
//! ├── input/file/<path>            file:// inputs
//! ├── output/gs/<bucket>/<path>    remote outputs
//! ├── mount/<name>                 read-only mounts (attached, not copied)
//! ├── script/<filename>            the wrapped user command
//! ├── tmp/                         TMPDIR
//! └── workingdir/                  the user command's cwd
//! ```
//!
//! Wildcards are permitted only as the final filename component and only on
//! non-recursive files; `**` is always rejected. Recursive parameters name
//! directory trees and are synced in bulk.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Root of the data disk inside the task container.
pub const DATA_MOUNT_POINT: &str = "/mnt/data";

/// Subdirectory of the data root holding the wrapped user script.
pub const SCRIPT_SUBDIR: &str = "script";

/// Subdirectory of the data root that `TMPDIR` points at.
pub const TMP_SUBDIR: &str = "tmp";

/// Subdirectory of the data root used as the user command's cwd.
pub const WORKINGDIR_SUBDIR: &str = "workingdir";

/// Errors produced while classifying a user-supplied path.
#[derive(Debug, thiserror::Error)]
pub enum PathError {
    /// `**` is rejected everywhere.
    #[error("invalid path '{0}': recursive wildcards '**' are not supported")]
    DoubleWildcard(String),

    /// A `*` appeared somewhere other than the final filename component.
    #[error("invalid path '{0}': wildcards are only allowed in the final path component")]
    MidPathWildcard(String),

    /// A wildcard on a recursive parameter or a mount.
    #[error("invalid path '{0}': wildcards are not allowed here")]
    WildcardNotAllowed(String),

    /// A non-recursive output that names a directory.
    #[error("invalid output '{0}': must end in a filename or a single-component wildcard")]
    DirectoryOutput(String),

    /// An empty or otherwise unusable path string.
    #[error("invalid path '{0}': {1}")]
    Malformed(String, String),
}

/// The role a path plays in a task, which selects its subdirectory under
/// the data-disk root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Input,
    Output,
    Mount,
}

impl Role {
    /// Subdirectory under the data root for this role.
    pub fn subdir(&self) -> &'static str {
        match self {
            Role::Input => "input",
            Role::Output => "output",
            Role::Mount => "mount",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.subdir())
    }
}

/// Storage scheme of a user-supplied path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// Cloud object storage (`gs://bucket/path`).
    Gs,
    /// Explicit local file URL (`file:///path`).
    File,
    /// A bare local path.
    Local,
}

/// Classification of a path after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PathClass {
    LocalFile,
    LocalDir,
    RemoteFile,
    RemoteDir,
    MountRef,
}

/// A classified input, output, or mount path.
///
/// Construction validates wildcard placement and directory rules; the
/// accessors derive the canonical URI and the in-container path. Instances
/// are immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPath {
    raw: String,
    scheme: Scheme,
    class: PathClass,
    role: Role,
    recursive: bool,
    /// Scheme-less remainder, no leading slash, trailing slash normalized away.
    rest: String,
    /// Whether the original string carried a trailing slash.
    had_trailing_slash: bool,
}

impl DataPath {
    /// Classifies an input path. Wildcards are allowed in the final
    /// component unless `recursive` is set.
    pub fn new_input(raw: &str, recursive: bool) -> Result<Self, PathError> {
        Self::build(raw, Role::Input, recursive)
    }

    /// Classifies an output path. A non-recursive output must end in a
    /// filename or a single-component wildcard.
    pub fn new_output(raw: &str, recursive: bool) -> Result<Self, PathError> {
        let path = Self::build(raw, Role::Output, recursive)?;
        if !recursive && matches!(path.class, PathClass::LocalDir | PathClass::RemoteDir) {
            return Err(PathError::DirectoryOutput(raw.to_string()));
        }
        Ok(path)
    }

    /// Classifies a mount specification. Mounts are attached read-only and
    /// never carry wildcards.
    pub fn new_mount(raw: &str) -> Result<Self, PathError> {
        if raw.contains('*') {
            return Err(PathError::WildcardNotAllowed(raw.to_string()));
        }
        let mut path = Self::build(raw, Role::Mount, false)?;
        path.class = PathClass::MountRef;
        Ok(path)
    }

    fn build(raw: &str, role: Role, recursive: bool) -> Result<Self, PathError> {
        if raw.is_empty() {
            return Err(PathError::Malformed(raw.to_string(), "empty path".into()));
        }
        if raw.contains("**") {
            return Err(PathError::DoubleWildcard(raw.to_string()));
        }

        let (scheme, remainder) = split_scheme(raw);
        if remainder.is_empty() {
            return Err(PathError::Malformed(
                raw.to_string(),
                "no path after scheme".into(),
            ));
        }

        // Wildcards may only appear in the final component, and never on
        // recursive parameters.
        if remainder.contains('*') {
            if recursive {
                return Err(PathError::WildcardNotAllowed(raw.to_string()));
            }
            let final_component = remainder.rsplit('/').next().unwrap_or(remainder);
            let (dirs, _) = remainder.split_at(remainder.len() - final_component.len());
            if dirs.contains('*') {
                return Err(PathError::MidPathWildcard(raw.to_string()));
            }
            if final_component.is_empty() {
                // A path like `gs://b/p/*/` wildcards a directory.
                return Err(PathError::MidPathWildcard(raw.to_string()));
            }
        }

        let had_trailing_slash = remainder.ends_with('/');
        let rest = remainder.trim_start_matches('/').trim_end_matches('/');

        let is_dir = recursive || had_trailing_slash;
        let class = match (scheme, is_dir) {
            (Scheme::Gs, true) => PathClass::RemoteDir,
            (Scheme::Gs, false) => PathClass::RemoteFile,
            (_, true) => PathClass::LocalDir,
            (_, false) => PathClass::LocalFile,
        };

        Ok(Self {
            raw: raw.to_string(),
            scheme,
            class,
            role,
            recursive,
            rest: rest.to_string(),
            had_trailing_slash,
        })
    }

    /// The path exactly as the user supplied it.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn class(&self) -> PathClass {
        self.class
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether this path names a directory tree synced in bulk.
    pub fn recursive(&self) -> bool {
        self.recursive
    }

    /// Whether the final component carries a `*` wildcard.
    pub fn has_wildcard(&self) -> bool {
        self.rest.contains('*')
    }

    /// Whether this path names a directory (recursive or trailing slash).
    pub fn is_directory(&self) -> bool {
        matches!(
            self.class,
            PathClass::LocalDir | PathClass::RemoteDir | PathClass::MountRef
        ) || self.recursive
    }

    /// Canonical remote representation of the path.
    ///
    /// `gs://` paths are returned unchanged; local paths are normalized to
    /// `file://` URLs with an absolute path. Trailing slashes survive so
    /// that directory-ness stays observable downstream.
    pub fn uri(&self) -> String {
        let suffix = if self.had_trailing_slash { "/" } else { "" };
        match self.scheme {
            Scheme::Gs => format!("gs://{}{}", self.rest, suffix),
            Scheme::File | Scheme::Local => format!("file:///{}{}", self.rest, suffix),
        }
    }

    /// In-container path relative to the data root.
    ///
    /// Remote and `file://` paths keep their scheme as a subdirectory
    /// (`gs://b/p` maps to `input/gs/b/p`); bare local paths map their
    /// absolute form directly under the role subdirectory. Wildcards are
    /// preserved verbatim so the user's shell can expand them.
    pub fn docker_relative(&self) -> String {
        let role = self.role.subdir();
        match self.scheme {
            Scheme::Gs => format!("{}/gs/{}", role, self.rest),
            Scheme::File => format!("{}/file/{}", role, self.rest),
            Scheme::Local => format!("{}/{}", role, self.rest),
        }
    }

    /// Absolute in-container path, rooted at [`DATA_MOUNT_POINT`].
    pub fn docker_path(&self) -> String {
        format!("{}/{}", DATA_MOUNT_POINT, self.docker_relative())
    }

    /// The directory portion of the in-container path.
    ///
    /// For files and wildcards this is the parent; for directories it is
    /// the path itself. Used by the prepare phase to create output parents
    /// before the user command runs.
    pub fn docker_parent(&self) -> String {
        let full = self.docker_path();
        if self.is_directory() || !full.contains('/') {
            return full;
        }
        match full.rsplit_once('/') {
            Some((parent, _)) => parent.to_string(),
            None => full,
        }
    }
}

impl fmt::Display for DataPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

/// Splits a scheme prefix off a raw path string.
fn split_scheme(raw: &str) -> (Scheme, &str) {
    if let Some(rest) = raw.strip_prefix("gs://") {
        (Scheme::Gs, rest)
    } else if let Some(rest) = raw.strip_prefix("file://") {
        (Scheme::File, rest)
    } else {
        (Scheme::Local, raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_input_docker_path_is_verbatim() {
        let p = DataPath::new_input("gs://bucket/path/file.bam", false).unwrap();
        assert_eq!(p.docker_path(), "/mnt/data/input/gs/bucket/path/file.bam");
        assert_eq!(p.class(), PathClass::RemoteFile);
        assert_eq!(p.uri(), "gs://bucket/path/file.bam");
    }

    #[test]
    fn file_url_output_keeps_scheme_subdir() {
        let p = DataPath::new_output("file:///tmp/out.txt", false).unwrap();
        assert_eq!(p.docker_path(), "/mnt/data/output/file/tmp/out.txt");
        assert_eq!(p.uri(), "file:///tmp/out.txt");
    }

    #[test]
    fn bare_local_path_maps_directly() {
        let p = DataPath::new_input("/data/sample.vcf", false).unwrap();
        assert_eq!(p.docker_path(), "/mnt/data/input/data/sample.vcf");
        assert_eq!(p.class(), PathClass::LocalFile);
    }

    #[test]
    fn wildcard_preserved_in_docker_path() {
        let p = DataPath::new_input("gs://b/p/*.bam", false).unwrap();
        assert!(p.has_wildcard());
        assert_eq!(p.docker_path(), "/mnt/data/input/gs/b/p/*.bam");
    }

    #[test]
    fn double_wildcard_rejected() {
        let err = DataPath::new_input("gs://b/**/x.bam", false).unwrap_err();
        assert!(matches!(err, PathError::DoubleWildcard(_)));
    }

    #[test]
    fn mid_path_wildcard_rejected() {
        let err = DataPath::new_input("gs://b/*/x.bam", false).unwrap_err();
        assert!(matches!(err, PathError::MidPathWildcard(_)));
    }

    #[test]
    fn trailing_wildcard_directory_rejected() {
        let err = DataPath::new_input("gs://b/p/*/", false).unwrap_err();
        assert!(matches!(err, PathError::MidPathWildcard(_)));
    }

    #[test]
    fn recursive_wildcard_rejected() {
        let err = DataPath::new_input("gs://b/p/*", true).unwrap_err();
        assert!(matches!(err, PathError::WildcardNotAllowed(_)));
    }

    #[test]
    fn directory_output_rejected_when_not_recursive() {
        let err = DataPath::new_output("gs://b/results/", false).unwrap_err();
        assert!(matches!(err, PathError::DirectoryOutput(_)));
    }

    #[test]
    fn wildcard_output_allowed() {
        let p = DataPath::new_output("gs://b/results/*.txt", false).unwrap();
        assert!(p.has_wildcard());
        assert_eq!(p.docker_parent(), "/mnt/data/output/gs/b/results");
    }

    #[test]
    fn recursive_output_is_directory() {
        let p = DataPath::new_output("gs://b/results/", true).unwrap();
        assert!(p.is_directory());
        assert_eq!(p.docker_path(), "/mnt/data/output/gs/b/results");
        // Trailing slash normalized for comparison but retained in the URI.
        assert_eq!(p.uri(), "gs://b/results/");
    }

    #[test]
    fn recursive_without_trailing_slash_is_directory() {
        let p = DataPath::new_input("gs://b/data", true).unwrap();
        assert!(p.is_directory());
        assert_eq!(p.uri(), "gs://b/data");
    }

    #[test]
    fn mount_rejects_wildcards() {
        let err = DataPath::new_mount("gs://bucket/*").unwrap_err();
        assert!(matches!(err, PathError::WildcardNotAllowed(_)));
    }

    #[test]
    fn mount_classifies_as_mount_ref() {
        let p = DataPath::new_mount("gs://bucket").unwrap();
        assert_eq!(p.class(), PathClass::MountRef);
    }

    #[test]
    fn empty_path_rejected() {
        assert!(DataPath::new_input("", false).is_err());
        assert!(DataPath::new_input("gs://", false).is_err());
    }

    #[test]
    fn docker_parent_of_file_is_parent_dir() {
        let p = DataPath::new_output("gs://b/o/result.txt", false).unwrap();
        assert_eq!(p.docker_parent(), "/mnt/data/output/gs/b/o");
    }
}
