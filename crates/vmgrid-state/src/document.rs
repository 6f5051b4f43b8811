//! ConfigDocument — one JSON document on disk, replaced atomically.
//!
//! Every mutation goes through [`ConfigDocument::update`]:
//!
//! ```text
//! flock(<doc>.lock)
//!   read config.json → Value
//!   f(&mut copy)              (error → abort, file untouched)
//!   copy.revision += 1
//!   write .config.json.tmp → fsync
//!   commit hook (tests only)  (error → abort, temp removed)
//!   rename over config.json → fsync(dir)
//! unlock
//! ```
//!
//! A crash at any point leaves either the pre-state or the post-state on
//! disk, never a torn write.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info};
use vmgrid_core::GridResult;

use crate::error::{StateError, StateResult};
use crate::lockfile::FileLock;
use crate::view::SubtreeView;

/// Top-level key of the schema version.
pub const VERSION_KEY: &str = "version";
/// Top-level key of the mutation counter.
pub const REVISION_KEY: &str = "revision";

/// Called with the fsynced temp file path just before it is renamed into
/// place. Returning an error aborts the commit.
pub type CommitHook = Arc<dyn Fn(&Path) -> io::Result<()> + Send + Sync>;

macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

#[derive(Clone)]
pub struct ConfigDocument {
    path: PathBuf,
    lock_path: PathBuf,
    commit_hook: Option<CommitHook>,
}

impl std::fmt::Debug for ConfigDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigDocument")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ConfigDocument {
    /// Open an existing document. Fails with [`StateError::NotFound`] if the
    /// file is missing.
    pub fn open(path: &Path) -> StateResult<Self> {
        if !path.exists() {
            return Err(StateError::NotFound);
        }
        Ok(Self::at(path))
    }

    /// Open `path`, writing `initial` first if the document does not exist.
    pub fn create(path: &Path, initial: &Value) -> StateResult<Self> {
        let doc = Self::at(path);
        let _lock = doc.lock()?;
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(map_err!(Write))?;
            }
            doc.write_atomic(initial)?;
            info!(path = %path.display(), "configuration document created");
        }
        Ok(doc)
    }

    fn at(path: &Path) -> Self {
        let mut lock_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        lock_name.push(".lock");
        Self {
            path: path.to_path_buf(),
            lock_path: path.with_file_name(lock_name),
            commit_hook: None,
        }
    }

    /// Install a hook that runs between fsync and rename.
    pub fn with_commit_hook(mut self, hook: CommitHook) -> Self {
        self.commit_hook = Some(hook);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A deep copy of the whole document.
    pub fn get(&self) -> StateResult<Value> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StateError::NotFound),
            Err(e) => return Err(StateError::Read(e.to_string())),
        };
        serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))
    }

    /// Decode the whole document into `T`.
    pub fn get_typed<T: DeserializeOwned>(&self) -> StateResult<T> {
        serde_json::from_value(self.get()?).map_err(map_err!(Deserialize))
    }

    /// The schema version recorded in the document.
    pub fn version(&self) -> StateResult<u32> {
        read_version(&self.get()?)
    }

    pub fn revision(&self) -> StateResult<u64> {
        Ok(self.get()?.get(REVISION_KEY).and_then(Value::as_u64).unwrap_or(0))
    }

    /// Apply `f` to a copy of the document and commit it atomically.
    ///
    /// Returns the committed document. Errors from `f` surface as
    /// [`StateError::Rejected`] and leave the file untouched.
    pub fn update<F>(&self, reason: &str, f: F) -> StateResult<Value>
    where
        F: FnOnce(&mut Value) -> GridResult<()>,
    {
        let _lock = self.lock()?;
        let mut doc = self.get()?;
        f(&mut doc)?;

        let Some(root) = doc.as_object_mut() else {
            return Err(StateError::Serialize("document root must be an object".into()));
        };
        let revision = root.get(REVISION_KEY).and_then(Value::as_u64).unwrap_or(0) + 1;
        root.insert(REVISION_KEY.to_string(), Value::from(revision));

        self.write_atomic(&doc)?;
        info!(target: "audit", reason, revision, "configuration updated");
        Ok(doc)
    }

    /// A view of the subtree at `path`.
    pub fn view<S: AsRef<str>>(&self, path: &[S]) -> SubtreeView {
        SubtreeView::new(self.clone(), path.iter().map(|s| s.as_ref().to_string()).collect())
    }

    fn lock(&self) -> StateResult<FileLock> {
        FileLock::exclusive(&self.lock_path).map_err(map_err!(Lock))
    }

    fn write_atomic(&self, doc: &Value) -> StateResult<()> {
        let bytes = serde_json::to_vec_pretty(doc).map_err(map_err!(Serialize))?;
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let mut tmp_name = std::ffi::OsString::from(".");
        tmp_name.push(self.path.file_name().unwrap_or_default());
        tmp_name.push(".tmp");
        let tmp = dir.join(tmp_name);

        let result = (|| -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            drop(file);
            if let Some(hook) = &self.commit_hook {
                hook(&tmp)?;
            }
            fs::rename(&tmp, &self.path)?;
            File::open(dir)?.sync_all()
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(StateError::Write(e.to_string()));
        }
        debug!(path = %self.path.display(), bytes = bytes.len(), "document written");
        Ok(())
    }
}

pub(crate) fn read_version(doc: &Value) -> StateResult<u32> {
    doc.get(VERSION_KEY)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| StateError::Deserialize("document has no integer version".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vmgrid_core::{ErrorKind, GridError};

    fn fresh(dir: &Path) -> ConfigDocument {
        ConfigDocument::create(&dir.join("config.json"), &json!({"version": 22, "networks": {}}))
            .unwrap()
    }

    #[test]
    fn missing_document_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigDocument::open(&dir.path().join("config.json")).unwrap_err();
        assert!(matches!(err, StateError::NotFound));
        assert_eq!(GridError::from(err).kind, ErrorKind::ConfigNotFound);
    }

    #[test]
    fn update_bumps_revision_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let doc = fresh(dir.path());
        assert_eq!(doc.revision().unwrap(), 0);

        doc.update("add network", |v| {
            v["networks"]["prod"] = json!("br0");
            Ok(())
        })
        .unwrap();

        let reopened = ConfigDocument::open(doc.path()).unwrap();
        let value = reopened.get().unwrap();
        assert_eq!(value["networks"]["prod"], "br0");
        assert_eq!(reopened.revision().unwrap(), 1);
        assert_eq!(reopened.version().unwrap(), 22);
    }

    #[test]
    fn get_returns_an_independent_copy() {
        let dir = tempfile::tempdir().unwrap();
        let doc = fresh(dir.path());
        let mut copy = doc.get().unwrap();
        copy["networks"]["x"] = json!("br9");
        assert!(doc.get().unwrap()["networks"].get("x").is_none());
    }

    #[test]
    fn rejected_update_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let doc = fresh(dir.path());
        let before = fs::read(doc.path()).unwrap();

        let err = doc
            .update("bad", |v| {
                v["networks"]["half"] = json!("br1");
                Err(GridError::invalid_argument("nope"))
            })
            .unwrap_err();
        assert!(matches!(err, StateError::Rejected(_)));
        assert_eq!(fs::read(doc.path()).unwrap(), before);
    }

    #[test]
    fn fault_before_rename_keeps_prior_file() {
        let dir = tempfile::tempdir().unwrap();
        let doc = fresh(dir.path());
        doc.update("seed", |v| {
            v["networks"]["a"] = json!("br0");
            Ok(())
        })
        .unwrap();
        let before = fs::read(doc.path()).unwrap();

        let faulty = doc.clone().with_commit_hook(Arc::new(|tmp: &Path| -> io::Result<()> {
            assert!(tmp.exists());
            Err(io::Error::other("power loss"))
        }));
        let err = faulty
            .update("doomed", |v| {
                v["networks"]["b"] = json!("br1");
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, StateError::Write(_)));

        assert_eq!(fs::read(doc.path()).unwrap(), before);
        assert_eq!(doc.revision().unwrap(), 1);
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn concurrent_updates_are_serialised() {
        let dir = tempfile::tempdir().unwrap();
        let doc = fresh(dir.path());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let doc = doc.clone();
                std::thread::spawn(move || {
                    doc.update("counter", |v| {
                        let n = v.get("counter").and_then(Value::as_u64).unwrap_or(0);
                        v["counter"] = json!(n + 1);
                        v["networks"][format!("n{i}")] = json!("br");
                        Ok(())
                    })
                    .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let value = doc.get().unwrap();
        assert_eq!(value["counter"], 8);
        assert_eq!(value["revision"], 8);
        assert_eq!(value["networks"].as_object().unwrap().len(), 8);
    }
}
