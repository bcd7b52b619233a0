use crate::error::StoreResult;
use crate::model::{NewSnapshot, Overlay, OverlayStatus, Owner, Snapshot, SnapshotFilter, SnapshotStatus};

/// Persistence for overlays and their snapshots.
///
/// Implementations assign ids and version numbers and enforce the status
/// state machines; callers never mutate an overlay's baseline.
#[async_trait::async_trait]
pub trait OverlayStore: Send + Sync + 'static {
    /// The active overlay for `(file_path, owner)`, with its snapshots
    /// narrowed and ordered by `filter`.
    async fn find_overlay(
        &self,
        file_path: &str,
        owner: Option<&Owner>,
        filter: &SnapshotFilter,
    ) -> StoreResult<Option<Overlay>>;

    /// Fails with `AlreadyExists` when an active overlay is already present.
    async fn create_overlay(
        &self,
        file_path: &str,
        owner: Option<&Owner>,
        baseline_code: &str,
    ) -> StoreResult<Overlay>;

    async fn append_snapshot(&self, overlay_id: &str, snapshot: NewSnapshot) -> StoreResult<Snapshot>;

    async fn set_overlay_status(&self, overlay_id: &str, status: OverlayStatus) -> StoreResult<()>;

    async fn set_snapshot_status(
        &self,
        snapshot_id: &str,
        status: SnapshotStatus,
    ) -> StoreResult<Snapshot>;

    /// Any overlay by id, archived included, with all of its snapshots.
    async fn get_overlay(&self, overlay_id: &str) -> StoreResult<Overlay>;
}
