//! A local content-addressed store for filesystem trees.
//!
//! File contents are stored once per SHA-256 hash under `blobs/`, using a two-level directory
//! layout. Each captured tree is described by a manifest stored under `trees/`, and the digest of a
//! tree is the digest of its manifest.
//!
//! The store also keeps an action cache: a record, keyed by the SHA-256 of an action's canonical
//! JSON description, of the tree that action produced. A later run asking for the same action gets
//! the same digest back without redoing the work.
//!
//! ```text
//! <root>/
//!   blobs/ab/cd/abcdef0123...
//!   trees/<fingerprint>.json
//!   actions/<key>.json
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use crate::digest::Digest;

/// The serialised manifest of a tree with no entries.
pub(crate) const EMPTY_MANIFEST: &[u8] = b"[]";

/// Errors raised while capturing or materialising trees.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("failed to {operation} {}", path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("digest {0} is not present in the store")]
    UnknownDigest(Digest),
    #[error("declared output '{0}' was not produced")]
    MissingOutput(String),
    #[error("path {} is not valid UTF-8", .0.display())]
    NonUtf8Path(PathBuf),
    #[error("manifest for {digest} is corrupt")]
    CorruptManifest {
        digest: Digest,
        #[source]
        source: Arc<serde_json::Error>,
    },
    #[error("symbolic links cannot be materialised on this platform: {0}")]
    SymlinkUnsupported(String),
    #[error("failed to encode action")]
    ActionEncoding(#[source] Arc<serde_json::Error>),
}

fn io_error<'a>(
    operation: &'static str,
    path: &'a Path,
) -> impl FnOnce(io::Error) -> StoreError + 'a {
    move |source| StoreError::Io {
        operation,
        path: path.to_path_buf(),
        source: Arc::new(source),
    }
}

fn walk_error(root: &Path) -> impl FnOnce(walkdir::Error) -> StoreError + '_ {
    move |err| {
        let path = err.path().unwrap_or(root).to_path_buf();
        StoreError::Io {
            operation: "walk",
            path,
            source: Arc::new(io::Error::from(err)),
        }
    }
}

/// An action and the tree it produced, as written under `actions/`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct ActionRecord {
    action: serde_json::Value,
    digest: Digest,
}

/// What a manifest entry refers to.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EntryKind {
    Directory,
    File { blob: String, executable: bool },
    Symlink { target: String },
}

/// One entry of a tree manifest. Paths are relative and `/`-separated.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TreeEntry {
    pub path: String,
    #[serde(flatten)]
    pub kind: EntryKind,
}

impl TreeEntry {
    pub fn is_file(&self) -> bool {
        matches!(self.kind, EntryKind::File { .. })
    }
}

/// Handle to a store rooted at a directory. Cloning is cheap; clones share the same root.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        self.root
            .join("blobs")
            .join(&hash[0..2])
            .join(&hash[2..4])
            .join(hash)
    }

    fn manifest_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("trees")
            .join(format!("{}.json", digest.fingerprint()))
    }

    /// Check whether the tree identified by `digest` is present.
    pub fn contains(&self, digest: &Digest) -> bool {
        digest.is_empty() || self.manifest_path(digest).is_file()
    }

    /// Capture the relative `outputs` under `dir` into the store. An output of `.` captures the
    /// whole of `dir`. Every listed output must exist.
    pub fn snapshot<S: AsRef<str>>(&self, dir: &Path, outputs: &[S]) -> Result<Digest, StoreError> {
        let mut entries = BTreeMap::new();
        for output in outputs {
            let output = output.as_ref().trim_end_matches('/');
            let root = if output.is_empty() || output == "." {
                dir.to_path_buf()
            } else {
                let path = dir.join(output);
                if fs::symlink_metadata(&path).is_err() {
                    return Err(StoreError::MissingOutput(output.to_string()));
                }
                // Parents of a nested output are part of the tree too
                let mut parent = Path::new(output).parent();
                while let Some(p) = parent.filter(|p| !p.as_os_str().is_empty()) {
                    entries.insert(relative_name(p)?, EntryKind::Directory);
                    parent = p.parent();
                }
                path
            };
            self.capture(dir, &root, &mut entries)?;
        }
        self.write_manifest(entries)
    }

    /// Record `root` and everything below it, named relative to `dir`. Links are kept as links.
    fn capture(
        &self,
        dir: &Path,
        root: &Path,
        entries: &mut BTreeMap<String, EntryKind>,
    ) -> Result<(), StoreError> {
        let walker = WalkDir::new(root)
            .follow_links(false)
            .follow_root_links(false)
            .sort_by_file_name();
        for entry in walker {
            let entry = entry.map_err(walk_error(root))?;
            let path = entry.path();
            let relative = path.strip_prefix(dir).unwrap_or(path);
            if relative.as_os_str().is_empty() {
                continue;
            }
            let name = relative_name(relative)?;
            let file_type = entry.file_type();
            if file_type.is_symlink() {
                let target = fs::read_link(path).map_err(io_error("read link", path))?;
                let target = target
                    .to_str()
                    .ok_or_else(|| StoreError::NonUtf8Path(target.clone()))?
                    .to_string();
                entries.insert(name, EntryKind::Symlink { target });
            } else if file_type.is_dir() {
                entries.insert(name, EntryKind::Directory);
            } else {
                let meta = entry.metadata().map_err(walk_error(root))?;
                let blob = self.store_blob(path)?;
                entries.insert(
                    name,
                    EntryKind::File {
                        blob,
                        executable: is_executable(&meta),
                    },
                );
            }
        }
        Ok(())
    }

    fn store_blob(&self, path: &Path) -> Result<String, StoreError> {
        let contents = fs::read(path).map_err(io_error("read", path))?;
        let hash = sha256::digest(contents.as_slice());
        let blob_path = self.blob_path(&hash);
        if !blob_path.exists() {
            write_atomic(&blob_path, &contents)?;
        }
        Ok(hash)
    }

    fn write_manifest(&self, entries: BTreeMap<String, EntryKind>) -> Result<Digest, StoreError> {
        let manifest = entries
            .into_iter()
            .map(|(path, kind)| TreeEntry { path, kind })
            .collect::<Vec<_>>();
        let bytes = serde_json::to_vec(&manifest).map_err(|e| StoreError::CorruptManifest {
            digest: Digest::empty(),
            source: Arc::new(e),
        })?;
        let digest = Digest::of_bytes(&bytes);
        let manifest_path = self.manifest_path(&digest);
        if !digest.is_empty() && !manifest_path.exists() {
            write_atomic(&manifest_path, &bytes)?;
        }
        debug!(%digest, entries = manifest.len(), "captured tree");
        Ok(digest)
    }

    /// List the entries of a captured tree, sorted by path.
    pub fn entries(&self, digest: &Digest) -> Result<Vec<TreeEntry>, StoreError> {
        if digest.is_empty() {
            return Ok(Vec::new());
        }
        let manifest_path = self.manifest_path(digest);
        let bytes = match fs::read(&manifest_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::UnknownDigest(digest.clone()));
            }
            Err(e) => return Err(io_error("read", &manifest_path)(e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| StoreError::CorruptManifest {
            digest: digest.clone(),
            source: Arc::new(e),
        })
    }

    /// The key of `action`: the SHA-256 of its canonical JSON encoding.
    pub fn action_key<A: serde::Serialize>(action: &A) -> Result<String, StoreError> {
        let bytes = serde_json::to_vec(action).map_err(|e| StoreError::ActionEncoding(Arc::new(e)))?;
        Ok(sha256::digest(bytes.as_slice()))
    }

    fn action_path(&self, key: &str) -> PathBuf {
        self.root.join("actions").join(format!("{key}.json"))
    }

    /// The tree recorded for `action` by an earlier run, if that tree is still in the store.
    pub fn lookup_action<A: serde::Serialize>(&self, action: &A) -> Result<Option<Digest>, StoreError> {
        let key = Self::action_key(action)?;
        let path = self.action_path(&key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("read", &path)(e)),
        };
        let record = match serde_json::from_slice::<ActionRecord>(&bytes) {
            Ok(record) => record,
            Err(e) => {
                warn!(key = %key, error = %e, "ignoring unreadable action record");
                return Ok(None);
            }
        };
        if !self.contains(&record.digest) {
            debug!(key = %key, digest = %record.digest, "recorded tree is gone");
            return Ok(None);
        }
        debug!(key = %key, digest = %record.digest, "action cache hit");
        Ok(Some(record.digest))
    }

    /// Record that `action` produced the tree `digest`, replacing any earlier record.
    pub fn record_action<A: serde::Serialize>(&self, action: &A, digest: &Digest) -> Result<(), StoreError> {
        let record = ActionRecord {
            action: serde_json::to_value(action).map_err(|e| StoreError::ActionEncoding(Arc::new(e)))?,
            digest: digest.clone(),
        };
        let bytes =
            serde_json::to_vec_pretty(&record).map_err(|e| StoreError::ActionEncoding(Arc::new(e)))?;
        write_atomic(&self.action_path(&Self::action_key(action)?), &bytes)
    }

    /// Write the tree identified by `digest` into `dest`, creating it if needed.
    pub fn materialize(&self, digest: &Digest, dest: &Path) -> Result<(), StoreError> {
        let entries = self.entries(digest)?;
        fs::create_dir_all(dest).map_err(io_error("create directory", dest))?;
        for entry in &entries {
            let path = dest.join(&entry.path);
            trace!(path = %path.display(), "materialise");
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(io_error("create directory", parent))?;
            }
            match &entry.kind {
                EntryKind::Directory => {
                    fs::create_dir_all(&path).map_err(io_error("create directory", &path))?
                }
                EntryKind::File { blob, executable } => {
                    let blob_path = self.blob_path(blob);
                    fs::copy(&blob_path, &path).map_err(io_error("copy", &blob_path))?;
                    set_executable(&path, *executable)?;
                }
                EntryKind::Symlink { target } => make_symlink(target, &path)?,
            }
        }
        Ok(())
    }
}

fn relative_name(path: &Path) -> Result<String, StoreError> {
    let parts = path
        .components()
        .map(|c| {
            c.as_os_str()
                .to_str()
                .ok_or_else(|| StoreError::NonUtf8Path(path.to_path_buf()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts.join("/"))
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    use std::io::Write;
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent).map_err(io_error("create directory", parent))?;
    let mut file = tempfile::NamedTempFile::new_in(parent).map_err(io_error("create", parent))?;
    file.write_all(contents).map_err(io_error("write", path))?;
    file.persist(path)
        .map_err(|e| io_error("persist", path)(e.error))?;
    Ok(())
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_: &fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn set_executable(path: &Path, executable: bool) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o755 } else { 0o644 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(io_error("set permissions on", path))
}

#[cfg(not(unix))]
fn set_executable(_: &Path, _: bool) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &str, path: &Path) -> Result<(), StoreError> {
    std::os::unix::fs::symlink(target, path).map_err(io_error("create link", path))
}

#[cfg(not(unix))]
fn make_symlink(target: &str, _: &Path) -> Result<(), StoreError> {
    Err(StoreError::SymlinkUnsupported(target.to_string()))
}
