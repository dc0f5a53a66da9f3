//! Durable JSON-on-disk stores.
//!
//! Every store is a single JSON file with an in-memory snapshot. Reads
//! clone the snapshot and never block; all mutations pass through a
//! per-store serial lane and are written atomically (sibling tmp file +
//! rename). A malformed file is quarantined on load and the store is
//! rebuilt empty.

pub mod archive;
pub mod state_dir;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use oc_domain::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// JsonStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single-file JSON store with snapshot reads and serialized writes.
pub struct JsonStore<T> {
    path: PathBuf,
    snapshot: RwLock<Arc<T>>,
    /// Serial mutation lane: one writer at a time, writes ordered.
    write_lane: Mutex<()>,
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned + Default + Clone + Send + Sync,
{
    /// Load (or create empty) the store at `path`.
    ///
    /// A file that fails to parse is moved aside to
    /// `<name>.corrupt.<timestamp>` and replaced with an empty store; the
    /// quarantine is reported so `doctor` can surface it.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let value = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => value,
                Err(e) => {
                    let quarantine = quarantine_path(&path);
                    std::fs::rename(&path, &quarantine)?;
                    tracing::warn!(
                        path = %path.display(),
                        quarantine = %quarantine.display(),
                        error = %e,
                        "malformed store file quarantined, rebuilding empty"
                    );
                    T::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => T::default(),
            Err(e) => return Err(Error::Io(e)),
        };

        Ok(Self {
            path,
            snapshot: RwLock::new(Arc::new(value)),
            write_lane: Mutex::new(()),
        })
    }

    /// Current snapshot. Cheap: clones an `Arc`, not the data.
    pub fn get(&self) -> Arc<T> {
        self.snapshot.read().clone()
    }

    /// Read through a closure without cloning the snapshot `Arc`.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.snapshot.read())
    }

    /// Mutate the store under the serial lane.
    ///
    /// `f` receives a writable draft; on return the draft is written to a
    /// sibling tmp file, renamed over the target, and installed as the new
    /// snapshot. The draft is discarded if the write fails.
    pub async fn mutate<R: Send>(&self, f: impl FnOnce(&mut T) -> R + Send) -> Result<R> {
        let _lane = self.write_lane.lock().await;

        let mut draft = (**self.snapshot.read()).clone();
        let out = f(&mut draft);

        let json = serde_json::to_string_pretty(&draft)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &json))
            .await
            .map_err(|e| Error::Other(format!("store write task: {e}")))??;

        *self.snapshot.write() = Arc::new(draft);
        Ok(out)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Write `contents` to `path` via a sibling tmp file and rename.
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn quarantine_path(path: &Path) -> PathBuf {
    let ts = chrono::Utc::now().timestamp();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".into());
    path.with_file_name(format!("{name}.corrupt.{ts}"))
}

/// Names of quarantined store files next to `path`, newest first.
/// Used by `doctor` to report integrity incidents.
pub fn list_quarantined(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().contains(".corrupt.") {
                found.push(entry.path());
            }
        }
    }
    found.sort();
    found.reverse();
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Counters {
        values: HashMap<String, u64>,
    }

    #[tokio::test]
    async fn mutate_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counters.json");

        let store: JsonStore<Counters> = JsonStore::load(&path).unwrap();
        store
            .mutate(|c| {
                c.values.insert("a".into(), 1);
            })
            .await
            .unwrap();

        let reloaded: JsonStore<Counters> = JsonStore::load(&path).unwrap();
        assert_eq!(reloaded.get().values.get("a"), Some(&1));
    }

    #[tokio::test]
    async fn snapshot_isolated_from_draft() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonStore<Counters> =
            JsonStore::load(dir.path().join("c.json")).unwrap();

        let before = store.get();
        store
            .mutate(|c| {
                c.values.insert("k".into(), 9);
            })
            .await
            .unwrap();

        // The pre-mutation snapshot is unchanged.
        assert!(before.values.is_empty());
        assert_eq!(store.get().values.get("k"), Some(&9));
    }

    #[tokio::test]
    async fn malformed_file_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();

        let store: JsonStore<Counters> = JsonStore::load(&path).unwrap();
        assert!(store.get().values.is_empty());

        let quarantined = list_quarantined(dir.path());
        assert_eq!(quarantined.len(), 1);
        assert!(quarantined[0]
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("bad.json.corrupt."));
    }

    #[tokio::test]
    async fn mutations_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<JsonStore<Counters>> =
            Arc::new(JsonStore::load(dir.path().join("c.json")).unwrap());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .mutate(|c| {
                        *c.values.entry("n".into()).or_insert(0) += 1;
                    })
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(store.get().values.get("n"), Some(&8));
    }
}
