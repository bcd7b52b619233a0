use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::model::{NewSnapshot, Overlay, OverlayStatus, Owner, Snapshot, SnapshotFilter, SnapshotStatus};
use crate::store::OverlayStore;

const INDEX_FILE: &str = ".index.json";

/// Lookup tables kept next to the overlay documents so a read touches one
/// document. Rebuilt from the documents when missing or unreadable.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreIndex {
    /// `(file_path, owner)` key to the active overlay's id.
    active: HashMap<String, String>,
    /// Snapshot id to its overlay's id.
    snapshots: HashMap<String, String>,
}

impl StoreIndex {
    fn from_overlays(overlays: &[Overlay]) -> StoreResult<Self> {
        let mut index = Self::default();
        for overlay in overlays {
            index.track(overlay)?;
        }
        Ok(index)
    }

    fn track(&mut self, overlay: &Overlay) -> StoreResult<()> {
        if overlay.status == OverlayStatus::Active {
            let key = index_key(&overlay.file_path, overlay.owner.as_ref())?;
            self.active.insert(key, overlay.id.clone());
        }
        for snapshot in &overlay.snapshots {
            self.snapshots.insert(snapshot.id.clone(), overlay.id.clone());
        }
        Ok(())
    }
}

fn index_key(file_path: &str, owner: Option<&Owner>) -> StoreResult<String> {
    Ok(serde_json::to_string(&(file_path, owner))?)
}

/// Overlay store keeping one JSON document per overlay in a directory, plus
/// an index. The directory is owned by a single process.
pub struct FileOverlayStore {
    dir: PathBuf,
    /// Also serializes read-modify-write cycles.
    index: Mutex<StoreIndex>,
}

impl FileOverlayStore {
    pub async fn new(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        let store = Self {
            dir,
            index: Mutex::new(StoreIndex::default()),
        };
        let index = store.load_index().await?;
        *store.index.lock().await = index;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, overlay_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", overlay_id))
    }

    /// Write a document into the store directory.
    /// Uses tmp+rename for atomicity.
    async fn write_document<T: Serialize>(&self, filename: &str, value: &T) -> StoreResult<()> {
        let content = serde_json::to_string_pretty(value)?;
        let tmp = self.dir.join(format!(".{}.tmp", filename.trim_start_matches('.')));
        fs::write(&tmp, &content).await?;
        fs::rename(&tmp, self.dir.join(filename)).await?;
        Ok(())
    }

    async fn write(&self, overlay: &Overlay) -> StoreResult<()> {
        self.write_document(&format!("{}.json", overlay.id), overlay)
            .await
    }

    async fn save_index(&self, index: &StoreIndex) -> StoreResult<()> {
        self.write_document(INDEX_FILE, index).await
    }

    async fn load_index(&self) -> StoreResult<StoreIndex> {
        match fs::read_to_string(self.dir.join(INDEX_FILE)).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(index) => return Ok(index),
                Err(e) => tracing::warn!("Rebuilding unreadable overlay index: {}", e),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(dir = %self.dir.display(), "building overlay index");
            }
            Err(e) => return Err(e.into()),
        }
        let index = StoreIndex::from_overlays(&self.read_all().await?)?;
        self.save_index(&index).await?;
        Ok(index)
    }

    async fn read(&self, overlay_id: &str) -> StoreResult<Overlay> {
        let content = match fs::read_to_string(self.path_for(overlay_id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::OverlayNotFound(overlay_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    /// Every readable overlay document. Corrupt files are logged and skipped.
    async fn read_all(&self) -> StoreResult<Vec<Overlay>> {
        let mut overlays = Vec::new();
        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let filename = match path.file_name().and_then(|f| f.to_str()) {
                Some(f) => f.to_string(),
                None => continue,
            };

            // Skip temp files and the index
            if filename.starts_with('.') || !filename.ends_with(".json") {
                continue;
            }

            match fs::read_to_string(&path).await {
                Ok(content) => match serde_json::from_str::<Overlay>(&content) {
                    Ok(overlay) => overlays.push(overlay),
                    Err(e) => {
                        tracing::error!("Failed to parse overlay {}: {}", filename, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to read overlay {}: {}", filename, e);
                }
            }
        }
        Ok(overlays)
    }
}

#[async_trait::async_trait]
impl OverlayStore for FileOverlayStore {
    async fn find_overlay(
        &self,
        file_path: &str,
        owner: Option<&Owner>,
        filter: &SnapshotFilter,
    ) -> StoreResult<Option<Overlay>> {
        let key = index_key(file_path, owner)?;
        let Some(overlay_id) = self.index.lock().await.active.get(&key).cloned() else {
            return Ok(None);
        };
        match self.read(&overlay_id).await {
            Ok(overlay) if overlay.is_active_for(file_path, owner) => Ok(Some(overlay.filtered(filter))),
            Ok(_) | Err(StoreError::OverlayNotFound(_)) => {
                tracing::warn!(file = %file_path, overlay = %overlay_id, "overlay index is out of date");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn create_overlay(
        &self,
        file_path: &str,
        owner: Option<&Owner>,
        baseline_code: &str,
    ) -> StoreResult<Overlay> {
        let mut index = self.index.lock().await;
        let key = index_key(file_path, owner)?;
        if index.active.contains_key(&key) {
            return Err(StoreError::AlreadyExists(file_path.to_string()));
        }
        let overlay = Overlay::new(file_path, owner, baseline_code);
        self.write(&overlay).await?;
        index.active.insert(key, overlay.id.clone());
        self.save_index(&index).await?;
        Ok(overlay)
    }

    async fn append_snapshot(&self, overlay_id: &str, snapshot: NewSnapshot) -> StoreResult<Snapshot> {
        let mut index = self.index.lock().await;
        let mut overlay = self.read(overlay_id).await?;
        let snapshot = overlay.push_snapshot(snapshot)?;
        self.write(&overlay).await?;
        index
            .snapshots
            .insert(snapshot.id.clone(), overlay.id.clone());
        self.save_index(&index).await?;
        Ok(snapshot)
    }

    async fn set_overlay_status(&self, overlay_id: &str, status: OverlayStatus) -> StoreResult<()> {
        let mut index = self.index.lock().await;
        let mut overlay = self.read(overlay_id).await?;
        overlay.set_status(status)?;
        self.write(&overlay).await?;
        if status != OverlayStatus::Active {
            let key = index_key(&overlay.file_path, overlay.owner.as_ref())?;
            if index.active.get(&key) == Some(&overlay.id) {
                index.active.remove(&key);
                self.save_index(&index).await?;
            }
        }
        Ok(())
    }

    async fn set_snapshot_status(
        &self,
        snapshot_id: &str,
        status: SnapshotStatus,
    ) -> StoreResult<Snapshot> {
        let index = self.index.lock().await;
        let overlay_id = index
            .snapshots
            .get(snapshot_id)
            .ok_or_else(|| StoreError::SnapshotNotFound(snapshot_id.to_string()))?;
        let mut overlay = self.read(overlay_id).await?;
        let snapshot = overlay.set_snapshot_status(snapshot_id, status)?;
        self.write(&overlay).await?;
        Ok(snapshot)
    }

    async fn get_overlay(&self, overlay_id: &str) -> StoreResult<Overlay> {
        self.read(overlay_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_overlays_persist_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let owner = Owner::tenant("acme");
        let overlay_id = {
            let store = FileOverlayStore::new(dir.path()).await.unwrap();
            let overlay = store
                .create_overlay("pages/index.html", Some(&owner), "<p>Hi</p>")
                .await
                .unwrap();
            let snapshot = store
                .append_snapshot(
                    &overlay.id,
                    NewSnapshot {
                        unified_diff: Some("@@ -1,1 +1,1 @@\n-<p>Hi</p>\n+<p>Hey</p>\n".into()),
                        change_summary: "+1 -1 in 1 block(s)".into(),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            assert_eq!(snapshot.version_number, 1);
            overlay.id
        };

        let store = FileOverlayStore::new(dir.path()).await.unwrap();
        let found = store
            .find_overlay("pages/index.html", Some(&owner), &SnapshotFilter::open_only())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, overlay_id);
        assert_eq!(found.baseline_code, "<p>Hi</p>");
        assert_eq!(found.snapshots.len(), 1);
        assert!(matches!(
            store.create_overlay("pages/index.html", Some(&owner), "x").await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_status_changes_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileOverlayStore::new(dir.path()).await.unwrap();
        let overlay = store.create_overlay("a.js", None, "").await.unwrap();
        let snapshot = store
            .append_snapshot(&overlay.id, NewSnapshot::default())
            .await
            .unwrap();

        store
            .set_snapshot_status(&snapshot.id, SnapshotStatus::Finalized)
            .await
            .unwrap();
        let pending = store
            .find_overlay("a.js", None, &SnapshotFilter::with_pending())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pending.snapshots[0].status, SnapshotStatus::Finalized);
        let open = store
            .find_overlay("a.js", None, &SnapshotFilter::open_only())
            .await
            .unwrap()
            .unwrap();
        assert!(open.snapshots.is_empty());

        store
            .set_overlay_status(&overlay.id, OverlayStatus::Archived)
            .await
            .unwrap();
        assert!(store
            .find_overlay("a.js", None, &SnapshotFilter::open_only())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_corrupt_documents_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        let store = FileOverlayStore::new(dir.path()).await.unwrap();
        store.create_overlay("a.ts", None, "").await.unwrap();
        let found = store
            .find_overlay("a.ts", None, &SnapshotFilter::open_only())
            .await
            .unwrap();
        assert!(found.is_some());
        assert!(matches!(
            store.get_overlay("missing").await,
            Err(StoreError::OverlayNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_index_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let (kept, snapshot_id) = {
            let store = FileOverlayStore::new(dir.path()).await.unwrap();
            let kept = store.create_overlay("a.tsx", None, "a").await.unwrap();
            let snapshot = store
                .append_snapshot(&kept.id, NewSnapshot::default())
                .await
                .unwrap();
            let archived = store.create_overlay("b.tsx", None, "b").await.unwrap();
            store
                .set_overlay_status(&archived.id, OverlayStatus::Archived)
                .await
                .unwrap();
            (kept.id, snapshot.id)
        };
        assert!(dir.path().join(INDEX_FILE).exists());
        std::fs::remove_file(dir.path().join(INDEX_FILE)).unwrap();

        let store = FileOverlayStore::new(dir.path()).await.unwrap();
        assert!(dir.path().join(INDEX_FILE).exists());
        let found = store
            .find_overlay("a.tsx", None, &SnapshotFilter::open_only())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, kept);
        assert!(store
            .find_overlay("b.tsx", None, &SnapshotFilter::open_only())
            .await
            .unwrap()
            .is_none());
        store
            .set_snapshot_status(&snapshot_id, SnapshotStatus::Discarded)
            .await
            .unwrap();
        assert!(matches!(
            store.set_snapshot_status("nope", SnapshotStatus::Finalized).await,
            Err(StoreError::SnapshotNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_lookup_reads_only_the_indexed_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileOverlayStore::new(dir.path()).await.unwrap();
        let a = store.create_overlay("a.tsx", None, "a").await.unwrap();
        let b = store
            .create_overlay("a.tsx", Some(&Owner::user("u1")), "b")
            .await
            .unwrap();

        // Another overlay's document going bad does not affect this lookup.
        std::fs::write(dir.path().join(format!("{}.json", b.id)), "{ not json").unwrap();
        let found = store
            .find_overlay("a.tsx", None, &SnapshotFilter::open_only())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, a.id);
        assert!(store
            .find_overlay("a.tsx", Some(&Owner::user("u1")), &SnapshotFilter::open_only())
            .await
            .is_err());

        // A document removed behind the store's back reads as absent.
        std::fs::remove_file(dir.path().join(format!("{}.json", a.id))).unwrap();
        assert!(store
            .find_overlay("a.tsx", None, &SnapshotFilter::open_only())
            .await
            .unwrap()
            .is_none());
    }
}
