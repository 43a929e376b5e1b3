//! File-backed state store
//!
//! Format of `<state_dir>/<target>.state.json`:
//!
//! ```text
//! {
//!   "version": 1,
//!   "checksum": <crc32 of the serialized body>,
//!   "body": { "checkpoint": .., "credential": .., "app_id": .. }
//! }
//! ```
//!
//! A record that cannot be read back intact (unknown version, checksum
//! mismatch, truncated JSON) is treated as absent rather than as an error.

use crate::state::error::{StateError, StateResult};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Current on-disk record version
pub const STATE_VERSION: u32 = 1;

/// An access token together with its expiry (Unix ms)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub expires_at: i64,
}

/// The persisted fields of one target
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateBody {
    #[serde(default)]
    pub checkpoint: Option<i64>,
    #[serde(default)]
    pub credential: Option<Credential>,
    #[serde(default)]
    pub app_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateRecord {
    version: u32,
    checksum: u32,
    body: StateBody,
}

impl StateRecord {
    fn seal(body: StateBody) -> StateResult<Self> {
        let checksum = checksum(&body)?;
        Ok(Self {
            version: STATE_VERSION,
            checksum,
            body,
        })
    }

    fn verify(&self) -> Result<(), String> {
        if self.version != STATE_VERSION {
            return Err(format!("unsupported version {}", self.version));
        }
        let expected = checksum(&self.body).map_err(|e| e.to_string())?;
        if expected != self.checksum {
            return Err(format!(
                "checksum mismatch (stored {:08x}, computed {:08x})",
                self.checksum, expected
            ));
        }
        Ok(())
    }
}

fn checksum(body: &StateBody) -> StateResult<u32> {
    let bytes = serde_json::to_vec(body)?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes);
    Ok(hasher.finalize())
}

/// Durable key/value state for a single target
pub struct StateStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles within the process
    lock: Mutex<()>,
}

impl StateStore {
    /// Open (without creating) the state file for `target` under `dir`
    pub fn open(dir: impl AsRef<Path>, target: &str) -> StateResult<Self> {
        let name = sanitize(target);
        if name.is_empty() {
            return Err(StateError::InvalidPath(format!(
                "target name {:?} has no usable characters",
                target
            )));
        }

        Ok(Self {
            path: dir.as_ref().join(format!("{}.state.json", name)),
            lock: Mutex::new(()),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole record; missing or damaged state yields an empty body
    pub fn load(&self) -> StateBody {
        let _guard = self.guard();
        self.read_body()
    }

    /// Last persisted checkpoint, if any
    pub fn load_checkpoint(&self) -> Option<i64> {
        self.load().checkpoint
    }

    /// Last persisted credential, if any
    pub fn load_credential(&self) -> Option<Credential> {
        self.load().credential
    }

    /// Cached application identity, if any
    pub fn load_app_id(&self) -> Option<String> {
        self.load().app_id
    }

    /// Persist a new checkpoint.
    ///
    /// The stored value never decreases: saving a position older than the
    /// one on disk keeps the newer one. Returns the value actually stored.
    pub fn save_checkpoint(&self, position: i64) -> StateResult<i64> {
        let mut stored = position;
        self.update(|body| {
            stored = body.checkpoint.map_or(position, |cur| cur.max(position));
            body.checkpoint = Some(stored);
        })?;
        Ok(stored)
    }

    /// Persist the current credential
    pub fn save_credential(&self, credential: &Credential) -> StateResult<()> {
        self.update(|body| body.credential = Some(credential.clone()))
    }

    /// Forget the persisted credential
    pub fn clear_credential(&self) -> StateResult<()> {
        self.update(|body| body.credential = None)
    }

    /// Persist the application identity
    pub fn save_app_id(&self, app_id: &str) -> StateResult<()> {
        self.update(|body| body.app_id = Some(app_id.to_string()))
    }

    fn update(&self, apply: impl FnOnce(&mut StateBody)) -> StateResult<()> {
        let _guard = self.guard();
        let mut body = self.read_body();
        apply(&mut body);
        self.write_atomic(&StateRecord::seal(body)?)
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        // A poisoned lock only means another caller panicked mid-update;
        // the file itself is still consistent thanks to the rename.
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_body(&self) -> StateBody {
        let content = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return StateBody::default(),
            Err(e) => {
                tracing::warn!(path = ?self.path, error = %e, "Cannot read state file, ignoring it");
                return StateBody::default();
            }
        };

        let record: StateRecord = match serde_json::from_slice(&content) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(path = ?self.path, error = %e, "State file is unreadable, ignoring it");
                return StateBody::default();
            }
        };

        match record.verify() {
            Ok(()) => record.body,
            Err(reason) => {
                tracing::warn!(path = ?self.path, %reason, "State file failed validation, ignoring it");
                StateBody::default()
            }
        }
    }

    fn write_atomic(&self, record: &StateRecord) -> StateResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let bytes = serde_json::to_vec_pretty(record)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;

        // Make the rename itself durable
        if let Some(parent) = self.path.parent() {
            if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
                tracing::warn!(dir = ?parent, error = %e, "Cannot sync state directory");
            }
        }

        Ok(())
    }
}

/// Map a target name onto a safe file stem
fn sanitize(target: &str) -> String {
    target
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path(), "device-1").unwrap();

        assert_eq!(store.load_checkpoint(), None);
        assert_eq!(store.load_credential(), None);
        assert_eq!(store.load_app_id(), None);
        assert!(!store.path().exists());
    }

    #[test]
    fn test_fields_persist_across_opens() {
        let dir = tempdir().unwrap();

        {
            let store = StateStore::open(dir.path(), "device-1").unwrap();
            store.save_checkpoint(1_000).unwrap();
            store
                .save_credential(&Credential {
                    token: "abc".into(),
                    expires_at: 5_000,
                })
                .unwrap();
            store.save_app_id("app-7").unwrap();
        }

        let store = StateStore::open(dir.path(), "device-1").unwrap();
        let body = store.load();
        assert_eq!(body.checkpoint, Some(1_000));
        assert_eq!(body.credential.unwrap().token, "abc");
        assert_eq!(body.app_id.as_deref(), Some("app-7"));
    }

    #[test]
    fn test_clear_credential_keeps_other_fields() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path(), "t").unwrap();
        store.save_checkpoint(9).unwrap();
        store
            .save_credential(&Credential {
                token: "abc".into(),
                expires_at: 1,
            })
            .unwrap();

        store.clear_credential().unwrap();
        assert_eq!(store.load_credential(), None);
        assert_eq!(store.load_checkpoint(), Some(9));
    }

    #[test]
    fn test_checkpoint_never_decreases() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path(), "t").unwrap();

        assert_eq!(store.save_checkpoint(500).unwrap(), 500);
        assert_eq!(store.save_checkpoint(300).unwrap(), 500);
        assert_eq!(store.load_checkpoint(), Some(500));
        assert_eq!(store.save_checkpoint(501).unwrap(), 501);
    }

    #[test]
    fn test_targets_do_not_collide() {
        let dir = tempdir().unwrap();
        let a = StateStore::open(dir.path(), "device-a").unwrap();
        let b = StateStore::open(dir.path(), "device-b").unwrap();

        a.save_checkpoint(10).unwrap();
        assert_eq!(b.load_checkpoint(), None);
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn test_corrupt_file_treated_as_missing() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path(), "t").unwrap();
        store.save_checkpoint(42).unwrap();

        std::fs::write(store.path(), b"{\"version\": 1, \"checks").unwrap();
        assert_eq!(store.load_checkpoint(), None);

        // Saving again replaces the damaged record
        store.save_checkpoint(7).unwrap();
        assert_eq!(store.load_checkpoint(), Some(7));
    }

    #[test]
    fn test_checksum_mismatch_treated_as_missing() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path(), "t").unwrap();
        store.save_checkpoint(42).unwrap();

        let content = std::fs::read_to_string(store.path()).unwrap();
        std::fs::write(store.path(), content.replace("42", "43")).unwrap();

        assert_eq!(store.load_checkpoint(), None);
    }

    #[test]
    fn test_unknown_version_treated_as_missing() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path(), "t").unwrap();
        store.save_app_id("app").unwrap();

        let content = std::fs::read_to_string(store.path()).unwrap();
        std::fs::write(store.path(), content.replace("\"version\": 1", "\"version\": 9")).unwrap();

        assert_eq!(store.load_app_id(), None);
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path(), "t").unwrap();
        store.save_checkpoint(1).unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["t.state.json".to_string()]);
    }

    #[test]
    fn test_sanitize_target_name() {
        assert_eq!(sanitize("dev/../x y"), "dev_.._x_y");
        assert_eq!(sanitize("abc-1_2.3"), "abc-1_2.3");
        assert!(StateStore::open("/tmp", "..").is_err());
    }
}
