use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{StoreError, StoreResult};
use crate::model::{NewSnapshot, Overlay, OverlayStatus, Owner, Snapshot, SnapshotFilter, SnapshotStatus};
use crate::store::OverlayStore;

type ActiveKey = (String, Option<Owner>);

/// In-process overlay store.
#[derive(Default)]
pub struct MemoryOverlayStore {
    overlays: DashMap<String, Overlay>,
    /// `(file_path, owner)` -> id of the active overlay.
    active: DashMap<ActiveKey, String>,
    unreachable: AtomicBool,
}

impl MemoryOverlayStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `Unavailable` until reset.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> StoreResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unreachable".into()));
        }
        Ok(())
    }

    fn overlay_id_for_snapshot(&self, snapshot_id: &str) -> StoreResult<String> {
        self.overlays
            .iter()
            .find(|entry| entry.value().has_snapshot(snapshot_id))
            .map(|entry| entry.key().clone())
            .ok_or_else(|| StoreError::SnapshotNotFound(snapshot_id.to_string()))
    }
}

#[async_trait::async_trait]
impl OverlayStore for MemoryOverlayStore {
    async fn find_overlay(
        &self,
        file_path: &str,
        owner: Option<&Owner>,
        filter: &SnapshotFilter,
    ) -> StoreResult<Option<Overlay>> {
        self.check_reachable()?;
        let key = (file_path.to_string(), owner.cloned());
        let Some(id) = self.active.get(&key).map(|id| id.value().clone()) else {
            return Ok(None);
        };
        Ok(self.overlays.get(&id).map(|overlay| overlay.filtered(filter)))
    }

    async fn create_overlay(
        &self,
        file_path: &str,
        owner: Option<&Owner>,
        baseline_code: &str,
    ) -> StoreResult<Overlay> {
        self.check_reachable()?;
        let key = (file_path.to_string(), owner.cloned());
        match self.active.entry(key) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(file_path.to_string())),
            Entry::Vacant(slot) => {
                let overlay = Overlay::new(file_path, owner, baseline_code);
                self.overlays.insert(overlay.id.clone(), overlay.clone());
                slot.insert(overlay.id.clone());
                Ok(overlay)
            }
        }
    }

    async fn append_snapshot(&self, overlay_id: &str, snapshot: NewSnapshot) -> StoreResult<Snapshot> {
        self.check_reachable()?;
        let mut overlay = self
            .overlays
            .get_mut(overlay_id)
            .ok_or_else(|| StoreError::OverlayNotFound(overlay_id.to_string()))?;
        overlay.push_snapshot(snapshot)
    }

    async fn set_overlay_status(&self, overlay_id: &str, status: OverlayStatus) -> StoreResult<()> {
        self.check_reachable()?;
        let key = {
            let mut overlay = self
                .overlays
                .get_mut(overlay_id)
                .ok_or_else(|| StoreError::OverlayNotFound(overlay_id.to_string()))?;
            overlay.set_status(status)?;
            (overlay.file_path.clone(), overlay.owner.clone())
        };
        if status == OverlayStatus::Archived {
            self.active.remove_if(&key, |_, id| id == overlay_id);
        }
        Ok(())
    }

    async fn set_snapshot_status(
        &self,
        snapshot_id: &str,
        status: SnapshotStatus,
    ) -> StoreResult<Snapshot> {
        self.check_reachable()?;
        let overlay_id = self.overlay_id_for_snapshot(snapshot_id)?;
        let mut overlay = self
            .overlays
            .get_mut(&overlay_id)
            .ok_or(StoreError::OverlayNotFound(overlay_id.clone()))?;
        overlay.set_snapshot_status(snapshot_id, status)
    }

    async fn get_overlay(&self, overlay_id: &str) -> StoreResult<Overlay> {
        self.check_reachable()?;
        self.overlays
            .get(overlay_id)
            .map(|overlay| overlay.clone())
            .ok_or_else(|| StoreError::OverlayNotFound(overlay_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edit(summary: &str) -> NewSnapshot {
        NewSnapshot {
            unified_diff: Some(String::new()),
            change_summary: summary.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_find_and_append() {
        let store = MemoryOverlayStore::new();
        let owner = Owner::user("u1");
        let overlay = store.create_overlay("a.tsx", Some(&owner), "base").await.unwrap();
        assert!(matches!(
            store.create_overlay("a.tsx", Some(&owner), "other").await,
            Err(StoreError::AlreadyExists(_))
        ));

        store.append_snapshot(&overlay.id, edit("one")).await.unwrap();
        let second = store.append_snapshot(&overlay.id, edit("two")).await.unwrap();
        assert_eq!(second.version_number, 2);

        let found = store
            .find_overlay("a.tsx", Some(&owner), &SnapshotFilter::open_only())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.baseline_code, "base");
        assert_eq!(found.snapshots.len(), 2);

        // Shared and other-owner lookups do not see a user's overlay.
        let filter = SnapshotFilter::open_only();
        assert!(store.find_overlay("a.tsx", None, &filter).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_archive_hides_overlay() {
        let store = MemoryOverlayStore::new();
        let overlay = store.create_overlay("a.html", None, "v1").await.unwrap();
        store
            .set_overlay_status(&overlay.id, OverlayStatus::Archived)
            .await
            .unwrap();

        let filter = SnapshotFilter::open_only();
        assert!(store.find_overlay("a.html", None, &filter).await.unwrap().is_none());
        assert!(matches!(
            store.append_snapshot(&overlay.id, edit("late")).await,
            Err(StoreError::OverlayArchived(_))
        ));

        let fresh = store.create_overlay("a.html", None, "v2").await.unwrap();
        assert_ne!(fresh.id, overlay.id);
        assert_eq!(
            store.get_overlay(&overlay.id).await.unwrap().status,
            OverlayStatus::Archived
        );
    }

    #[tokio::test]
    async fn test_snapshot_status_by_id() {
        let store = MemoryOverlayStore::new();
        let overlay = store.create_overlay("a.js", None, "").await.unwrap();
        let snapshot = store.append_snapshot(&overlay.id, edit("one")).await.unwrap();

        let updated = store
            .set_snapshot_status(&snapshot.id, SnapshotStatus::Discarded)
            .await
            .unwrap();
        assert_eq!(updated.overlay_id, overlay.id);
        assert!(matches!(
            store
                .set_snapshot_status(&snapshot.id, SnapshotStatus::Finalized)
                .await,
            Err(StoreError::InvalidTransition { .. })
        ));
        assert!(matches!(
            store.set_snapshot_status("nope", SnapshotStatus::Finalized).await,
            Err(StoreError::SnapshotNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable() {
        let store = MemoryOverlayStore::new();
        store.set_unreachable(true);
        let filter = SnapshotFilter::open_only();
        assert!(matches!(
            store.find_overlay("a.js", None, &filter).await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_unreachable(false);
        assert!(store.find_overlay("a.js", None, &filter).await.unwrap().is_none());
    }
}
