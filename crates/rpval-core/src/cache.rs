//! The local object cache and its path mapper.
//!
//! Every fetched repository object lives under one base directory,
//! mirrored from its `rsync://` URI: `rsync://host/path/file` maps to
//! `<base>/host/path/file`. Both RRDP and rsync write through here, and
//! the validator reads back through here, so this module is the single
//! choke point for filesystem safety:
//!
//! - **Path containment**: a URI containing a `..`, `.` or empty path
//!   segment maps to [`CacheError::IllegalPath`] before any I/O. Nothing
//!   the network hands us can name a file outside the base directory.
//! - **Atomic writes**: temp file in the target directory, flush, rename.
//!   A crash leaves either the old or the new object, never a torn one.
//! - **Restrictive modes**: files 0600, directories 0700, at create time.
//! - **Bounded, symlink-refusing reads**: size is checked against a cap
//!   before allocation and symlinks are never followed, so a poisoned
//!   cache cannot stall or balloon the validator.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::uri::RsyncUri;

/// Cap on any single cached object read (64 MiB).
pub const MAX_OBJECT_SIZE: u64 = 64 * 1024 * 1024;

/// Errors from cache operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CacheError {
    /// The URI maps outside the cache base directory.
    #[error("illegal path element in {uri}")]
    IllegalPath {
        /// The offending URI.
        uri: String,
    },

    /// The target of a read is a symbolic link.
    #[error("refusing to read symlink at {}", path.display())]
    SymlinkRefused {
        /// The symlink path.
        path: PathBuf,
    },

    /// The target of a read is not a regular file.
    #[error("not a regular file at {}", path.display())]
    NotRegularFile {
        /// The offending path.
        path: PathBuf,
    },

    /// A file exceeds the read cap.
    #[error("file too large: {size} bytes exceeds cap of {max} bytes")]
    FileTooLarge {
        /// Actual size.
        size: u64,
        /// Configured cap.
        max: u64,
    },

    /// JSON serialization failed.
    #[error("json serialization failed: {0}")]
    SerializeFailed(#[source] serde_json::Error),

    /// JSON deserialization failed.
    #[error("json deserialization failed: {0}")]
    DeserializeFailed(#[source] serde_json::Error),

    /// An I/O error with the operation that produced it.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// What was being done.
        context: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// The on-disk object cache.
#[derive(Clone, Debug)]
pub struct Cache {
    base: PathBuf,
}

impl Cache {
    /// Creates a cache rooted at `base`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// [`CacheError::Io`] when the base directory cannot be created.
    pub fn create(base: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let base = base.into();
        make_dir_all(&base)?;
        Ok(Self { base })
    }

    /// The base directory.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Maps a URI to its on-disk location.
    ///
    /// With `dir_only` the final segment is dropped, yielding the
    /// directory to create before a fetch.
    ///
    /// # Errors
    ///
    /// [`CacheError::IllegalPath`] when any segment is empty, `.`, `..`,
    /// or carries a backslash.
    pub fn uri_to_path(&self, uri: &RsyncUri, dir_only: bool) -> Result<PathBuf, CacheError> {
        let relative = uri.relative_path();
        let mut segments: Vec<&str> = relative.split('/').collect();
        if dir_only && segments.len() > 1 {
            segments.pop();
        }
        let mut path = self.base.clone();
        for segment in segments {
            if segment.is_empty()
                || segment == "."
                || segment == ".."
                || segment.contains('\\')
            {
                return Err(CacheError::IllegalPath {
                    uri: uri.as_str().to_string(),
                });
            }
            path.push(segment);
        }
        debug_assert!(is_descendant(&path, &self.base));
        Ok(path)
    }

    /// Writes an object, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// [`CacheError::IllegalPath`] for unmappable URIs, [`CacheError::Io`]
    /// for filesystem failures.
    pub fn write(&self, uri: &RsyncUri, data: &[u8]) -> Result<(), CacheError> {
        let path = self.uri_to_path(uri, false)?;
        atomic_write(&path, data)
    }

    /// Removes an object; missing files are not an error.
    ///
    /// # Errors
    ///
    /// [`CacheError::IllegalPath`] for unmappable URIs, [`CacheError::Io`]
    /// for filesystem failures other than absence.
    pub fn remove(&self, uri: &RsyncUri) -> Result<(), CacheError> {
        let path = self.uri_to_path(uri, false)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CacheError::io("remove cached object", err)),
        }
    }

    /// Reads an object back.
    ///
    /// # Errors
    ///
    /// Mapping, bounds and symlink errors as for the helpers below.
    pub fn read(&self, uri: &RsyncUri) -> Result<Bytes, CacheError> {
        let path = self.uri_to_path(uri, false)?;
        bounded_read(&path, MAX_OBJECT_SIZE).map(Bytes::from)
    }

    /// Whether an object is present.
    #[must_use]
    pub fn contains(&self, uri: &RsyncUri) -> bool {
        self.uri_to_path(uri, false)
            .map(|p| p.is_file())
            .unwrap_or(false)
    }

    /// Lists the file names directly under a publication point.
    ///
    /// Missing directories list as empty: a publication point that was
    /// never fetched simply has no siblings.
    ///
    /// # Errors
    ///
    /// [`CacheError::IllegalPath`] for unmappable URIs, [`CacheError::Io`]
    /// for unreadable directories.
    pub fn list_dir(&self, uri: &RsyncUri) -> Result<Vec<String>, CacheError> {
        let dir = self.uri_to_path(uri, false)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        let entries =
            fs::read_dir(&dir).map_err(|e| CacheError::io("list publication point", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| CacheError::io("list publication point", e))?;
            let is_file = entry
                .file_type()
                .map(|t| t.is_file())
                .unwrap_or(false);
            if is_file {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Counts regular files in the subtree below a URI.
    ///
    /// # Errors
    ///
    /// [`CacheError::IllegalPath`] for unmappable URIs.
    pub fn file_count(&self, uri: &RsyncUri) -> Result<usize, CacheError> {
        let root = self.uri_to_path(uri, false)?;
        Ok(count_files(&root))
    }
}

fn count_files(path: &Path) -> usize {
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    let mut count = 0;
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_file() {
            count += 1;
        } else if file_type.is_dir() {
            count += count_files(&entry.path());
        }
        // Symlinks are never counted, matching the no-symlink write policy.
    }
    count
}

fn is_descendant(path: &Path, base: &Path) -> bool {
    path.starts_with(base)
        && path
            .components()
            .all(|c| !matches!(c, Component::ParentDir))
}

// ---------------------------------------------------------------------------
// Atomic writer / bounded reader
// ---------------------------------------------------------------------------

/// Creates a directory tree with mode 0700.
fn make_dir_all(dir: &Path) -> Result<(), CacheError> {
    if dir.exists() {
        return Ok(());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .map_err(|e| CacheError::io("create directory with mode 0700", e))
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir).map_err(|e| CacheError::io("create directory", e))
    }
}

/// Writes `data` to `path` atomically: temp file in the same directory,
/// flush, fsync, rename. The temp file carries mode 0600.
///
/// # Errors
///
/// [`CacheError::Io`] on any filesystem failure.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), CacheError> {
    let parent = path.parent().ok_or_else(|| {
        CacheError::io(
            "resolve parent directory",
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent"),
        )
    })?;
    make_dir_all(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| CacheError::io("create temp file", e))?;
    tmp.write_all(data)
        .map_err(|e| CacheError::io("write temp file", e))?;
    tmp.flush().map_err(|e| CacheError::io("flush temp file", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| CacheError::io("fsync temp file", e))?;
    tmp.persist(path)
        .map_err(|e| CacheError::io("rename into place", e.error))?;
    Ok(())
}

/// Reads a whole file with a size cap, refusing symlinks and
/// non-regular files.
///
/// # Errors
///
/// [`CacheError::SymlinkRefused`], [`CacheError::NotRegularFile`],
/// [`CacheError::FileTooLarge`] or [`CacheError::Io`].
pub fn bounded_read(path: &Path, max_size: u64) -> Result<Vec<u8>, CacheError> {
    let meta = fs::symlink_metadata(path)
        .map_err(|e| CacheError::io("stat cached object", e))?;
    if meta.file_type().is_symlink() {
        return Err(CacheError::SymlinkRefused {
            path: path.to_path_buf(),
        });
    }
    if !meta.is_file() {
        return Err(CacheError::NotRegularFile {
            path: path.to_path_buf(),
        });
    }
    if meta.len() > max_size {
        return Err(CacheError::FileTooLarge {
            size: meta.len(),
            max: max_size,
        });
    }

    let file = File::open(path).map_err(|e| CacheError::io("open cached object", e))?;
    let mut buf = Vec::with_capacity(usize::try_from(meta.len()).unwrap_or(0));
    // take() caps the read even if the file grew between stat and read.
    file.take(max_size.saturating_add(1))
        .read_to_end(&mut buf)
        .map_err(|e| CacheError::io("read cached object", e))?;
    if buf.len() as u64 > max_size {
        return Err(CacheError::FileTooLarge {
            size: buf.len() as u64,
            max: max_size,
        });
    }
    Ok(buf)
}

/// Serializes to pretty JSON and writes atomically.
///
/// # Errors
///
/// [`CacheError::SerializeFailed`] or any [`atomic_write`] error.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CacheError> {
    let json = serde_json::to_string_pretty(value).map_err(CacheError::SerializeFailed)?;
    atomic_write(path, json.as_bytes())
}

/// Reads and deserializes a JSON file with a size cap.
///
/// # Errors
///
/// [`CacheError::DeserializeFailed`] or any [`bounded_read`] error.
pub fn bounded_read_json<T: DeserializeOwned>(
    path: &Path,
    max_size: u64,
) -> Result<T, CacheError> {
    let data = bounded_read(path, max_size)?;
    serde_json::from_slice(&data).map_err(CacheError::DeserializeFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> RsyncUri {
        RsyncUri::parse(s).unwrap()
    }

    #[test]
    fn maps_uri_under_base() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::create(dir.path()).unwrap();
        let path = cache
            .uri_to_path(&uri("rsync://h.example.net/repo/a.cer"), false)
            .unwrap();
        assert_eq!(path, dir.path().join("h.example.net/repo/a.cer"));
        let dir_path = cache
            .uri_to_path(&uri("rsync://h.example.net/repo/a.cer"), true)
            .unwrap();
        assert_eq!(dir_path, dir.path().join("h.example.net/repo"));
    }

    #[test]
    fn rejects_parent_segments() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::create(dir.path()).unwrap();
        for bad in [
            "rsync://h/../../etc/passwd",
            "rsync://h/repo/../../../etc/passwd",
            "rsync://h/repo/..",
            "rsync://h/repo//x",
            "rsync://h/repo/.",
            "rsync://h/repo/..\\x",
        ] {
            let result = cache.uri_to_path(&uri(bad), false);
            assert!(
                matches!(result, Err(CacheError::IllegalPath { .. })),
                "{bad} should be refused"
            );
        }
    }

    #[test]
    fn write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::create(dir.path()).unwrap();
        let object = uri("rsync://h/repo/obj.roa");
        cache.write(&object, b"payload").unwrap();
        assert!(cache.contains(&object));
        assert_eq!(cache.read(&object).unwrap().as_ref(), b"payload");
    }

    #[test]
    #[cfg(unix)]
    fn written_files_are_owner_only() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::create(dir.path()).unwrap();
        let object = uri("rsync://h/repo/obj.roa");
        cache.write(&object, b"secret").unwrap();

        let path = cache.uri_to_path(&object, false).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().mode() & 0o777, 0o600);
        assert_eq!(
            fs::metadata(path.parent().unwrap()).unwrap().mode() & 0o777,
            0o700
        );
    }

    #[test]
    fn illegal_write_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::create(dir.path()).unwrap();
        let result = cache.write(&uri("rsync://h/../escape"), b"x");
        assert!(matches!(result, Err(CacheError::IllegalPath { .. })));
        // Nothing outside (or inside) the base was created.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::create(dir.path()).unwrap();
        let object = uri("rsync://h/repo/obj.roa");
        cache.write(&object, b"payload").unwrap();
        cache.remove(&object).unwrap();
        cache.remove(&object).unwrap();
        assert!(!cache.contains(&object));
    }

    #[test]
    fn list_dir_names_only_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::create(dir.path()).unwrap();
        cache.write(&uri("rsync://h/repo/b.roa"), b"b").unwrap();
        cache.write(&uri("rsync://h/repo/a.cer"), b"a").unwrap();
        cache.write(&uri("rsync://h/repo/sub/c.cer"), b"c").unwrap();

        let names = cache.list_dir(&uri("rsync://h/repo")).unwrap();
        assert_eq!(names, vec!["a.cer".to_string(), "b.roa".to_string()]);
    }

    #[test]
    fn list_dir_of_unfetched_point_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::create(dir.path()).unwrap();
        assert!(cache.list_dir(&uri("rsync://h/never")).unwrap().is_empty());
    }

    #[test]
    fn file_count_recurses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::create(dir.path()).unwrap();
        cache.write(&uri("rsync://h/repo/a"), b"1").unwrap();
        cache.write(&uri("rsync://h/repo/x/b"), b"2").unwrap();
        cache.write(&uri("rsync://h/repo/x/y/c"), b"3").unwrap();
        assert_eq!(cache.file_count(&uri("rsync://h/repo")).unwrap(), 3);
        assert_eq!(cache.file_count(&uri("rsync://h/missing")).unwrap(), 0);
    }

    #[test]
    fn bounded_read_rejects_oversize_and_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let big = dir.path().join("big");
        fs::write(&big, vec![0u8; 512]).unwrap();
        assert!(matches!(
            bounded_read(&big, 100),
            Err(CacheError::FileTooLarge { size: 512, max: 100 })
        ));

        #[cfg(unix)]
        {
            let link = dir.path().join("link");
            std::os::unix::fs::symlink(&big, &link).unwrap();
            assert!(matches!(
                bounded_read(&link, 1024),
                Err(CacheError::SymlinkRefused { .. })
            ));
        }
    }

    #[test]
    fn json_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        #[serde(deny_unknown_fields)]
        struct State {
            serial: i64,
            session: String,
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let state = State {
            serial: 42,
            session: "abc".into(),
        };
        atomic_write_json(&path, &state).unwrap();
        let loaded: State = bounded_read_json(&path, 1 << 20).unwrap();
        assert_eq!(loaded, state);
    }
}
