use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{StoreError, StoreResult};

/// Scope of an overlay. An overlay with no owner is shared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl Owner {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            tenant_id: None,
        }
    }

    pub fn tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            user_id: None,
            tenant_id: Some(tenant_id.into()),
        }
    }

    /// `None` when neither id is set.
    pub fn from_parts(user_id: Option<String>, tenant_id: Option<String>) -> Option<Self> {
        if user_id.is_none() && tenant_id.is_none() {
            return None;
        }
        Some(Self { user_id, tenant_id })
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "user={} tenant={}",
            self.user_id.as_deref().unwrap_or("-"),
            self.tenant_id.as_deref().unwrap_or("-")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlayStatus {
    Active,
    Archived,
}

impl OverlayStatus {
    pub fn as_str(&self) -> &str {
        match self {
            OverlayStatus::Active => "active",
            OverlayStatus::Archived => "archived",
        }
    }

    pub fn can_transition_to(self, next: OverlayStatus) -> bool {
        matches!((self, next), (OverlayStatus::Active, OverlayStatus::Archived))
    }
}

impl fmt::Display for OverlayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Open,
    Finalized,
    Discarded,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SnapshotStatus::Open => "open",
            SnapshotStatus::Finalized => "finalized",
            SnapshotStatus::Discarded => "discarded",
        }
    }

    /// `open` may become `finalized` or `discarded`; both are terminal.
    pub fn can_transition_to(self, next: SnapshotStatus) -> bool {
        matches!(
            (self, next),
            (SnapshotStatus::Open, SnapshotStatus::Finalized)
                | (SnapshotStatus::Open, SnapshotStatus::Discarded)
        )
    }
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    #[default]
    Manual,
    Generated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    pub overlay_id: String,
    pub version_number: u64,
    pub change_type: ChangeType,
    pub change_summary: String,
    #[serde(default)]
    pub unified_diff: Option<String>,
    #[serde(default)]
    pub structural_diff: Option<String>,
    pub status: SnapshotStatus,
    pub created_at: DateTime<Utc>,
}

/// A snapshot as submitted by a writer; the store assigns id and version.
#[derive(Debug, Clone, Default)]
pub struct NewSnapshot {
    pub unified_diff: Option<String>,
    pub structural_diff: Option<String>,
    pub change_summary: String,
    pub change_type: ChangeType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Overlay {
    pub id: String,
    pub file_path: String,
    #[serde(default)]
    pub owner: Option<Owner>,
    pub baseline_code: String,
    /// Advisory precomputed merge, used only when there are no snapshots.
    #[serde(default)]
    pub current_code: Option<String>,
    pub status: OverlayStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
}

impl Overlay {
    pub fn new(file_path: &str, owner: Option<&Owner>, baseline_code: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            file_path: file_path.to_string(),
            owner: owner.cloned(),
            baseline_code: baseline_code.to_string(),
            current_code: None,
            status: OverlayStatus::Active,
            created_at: now,
            updated_at: now,
            snapshots: Vec::new(),
        }
    }

    /// Active overlay for exactly this file and owner.
    pub fn is_active_for(&self, file_path: &str, owner: Option<&Owner>) -> bool {
        self.status == OverlayStatus::Active
            && self.file_path == file_path
            && self.owner.as_ref() == owner
    }

    /// Append a snapshot with the next version number.
    pub fn push_snapshot(&mut self, new: NewSnapshot) -> StoreResult<Snapshot> {
        if self.status != OverlayStatus::Active {
            return Err(StoreError::OverlayArchived(self.id.clone()));
        }
        let version_number = self
            .snapshots
            .iter()
            .map(|s| s.version_number)
            .max()
            .unwrap_or(0)
            + 1;
        let now = Utc::now();
        let snapshot = Snapshot {
            id: uuid::Uuid::new_v4().to_string(),
            overlay_id: self.id.clone(),
            version_number,
            change_type: new.change_type,
            change_summary: new.change_summary,
            unified_diff: new.unified_diff,
            structural_diff: new.structural_diff,
            status: SnapshotStatus::Open,
            created_at: now,
        };
        self.snapshots.push(snapshot.clone());
        self.updated_at = now;
        Ok(snapshot)
    }

    pub fn set_status(&mut self, status: OverlayStatus) -> StoreResult<()> {
        if !self.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                from: self.status.to_string(),
                to: status.to_string(),
            });
        }
        self.status = status;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Move one of this overlay's snapshots to `status`.
    pub fn set_snapshot_status(
        &mut self,
        snapshot_id: &str,
        status: SnapshotStatus,
    ) -> StoreResult<Snapshot> {
        let snapshot = self
            .snapshots
            .iter_mut()
            .find(|s| s.id == snapshot_id)
            .ok_or_else(|| StoreError::SnapshotNotFound(snapshot_id.to_string()))?;
        if !snapshot.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                from: snapshot.status.to_string(),
                to: status.to_string(),
            });
        }
        snapshot.status = status;
        let updated = snapshot.clone();
        self.updated_at = Utc::now();
        Ok(updated)
    }

    pub fn has_snapshot(&self, snapshot_id: &str) -> bool {
        self.snapshots.iter().any(|s| s.id == snapshot_id)
    }

    /// Copy of this overlay with its snapshots narrowed by `filter`.
    pub fn filtered(&self, filter: &SnapshotFilter) -> Self {
        Self {
            snapshots: filter.apply(&self.snapshots),
            ..self.clone()
        }
    }
}

/// Which snapshots to load with an overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFilter {
    pub statuses: Vec<SnapshotStatus>,
    /// Keep at most this many, earliest versions first. `None` = all.
    pub limit: Option<usize>,
}

impl Default for SnapshotFilter {
    fn default() -> Self {
        Self::open_only()
    }
}

impl SnapshotFilter {
    pub fn open_only() -> Self {
        Self {
            statuses: vec![SnapshotStatus::Open],
            limit: None,
        }
    }

    /// Open and finalized snapshots.
    pub fn with_pending() -> Self {
        Self {
            statuses: vec![SnapshotStatus::Open, SnapshotStatus::Finalized],
            limit: None,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Filter by status, sort ascending by version and apply the limit.
    pub fn apply(&self, snapshots: &[Snapshot]) -> Vec<Snapshot> {
        let mut kept: Vec<Snapshot> = snapshots
            .iter()
            .filter(|s| self.statuses.contains(&s.status))
            .cloned()
            .collect();
        kept.sort_by_key(|s| s.version_number);
        if let Some(limit) = self.limit {
            kept.truncate(limit);
        }
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlay_with(count: usize) -> Overlay {
        let mut overlay = Overlay::new("src/Card.tsx", None, "base");
        for i in 0..count {
            overlay
                .push_snapshot(NewSnapshot {
                    change_summary: format!("edit {i}"),
                    ..Default::default()
                })
                .unwrap();
        }
        overlay
    }

    #[test]
    fn test_versions_increase() {
        let overlay = overlay_with(3);
        let versions: Vec<u64> = overlay.snapshots.iter().map(|s| s.version_number).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert!(overlay.snapshots.iter().all(|s| s.overlay_id == overlay.id));
    }

    #[test]
    fn test_snapshot_transitions() {
        let mut overlay = overlay_with(2);
        let first = overlay.snapshots[0].id.clone();
        let updated = overlay
            .set_snapshot_status(&first, SnapshotStatus::Finalized)
            .unwrap();
        assert_eq!(updated.status, SnapshotStatus::Finalized);

        let err = overlay
            .set_snapshot_status(&first, SnapshotStatus::Discarded)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert!(matches!(
            overlay.set_snapshot_status("missing", SnapshotStatus::Finalized),
            Err(StoreError::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn test_archived_overlay_rejects_snapshots() {
        let mut overlay = overlay_with(0);
        overlay.set_status(OverlayStatus::Archived).unwrap();
        assert!(!overlay.is_active_for("src/Card.tsx", None));
        assert!(overlay.set_status(OverlayStatus::Archived).is_err());
        assert!(matches!(
            overlay.push_snapshot(NewSnapshot::default()),
            Err(StoreError::OverlayArchived(_))
        ));
    }

    #[test]
    fn test_filter_orders_and_limits() {
        let mut overlay = overlay_with(4);
        let second = overlay.snapshots[1].id.clone();
        let third = overlay.snapshots[2].id.clone();
        overlay
            .set_snapshot_status(&second, SnapshotStatus::Finalized)
            .unwrap();
        overlay
            .set_snapshot_status(&third, SnapshotStatus::Discarded)
            .unwrap();
        overlay.snapshots.reverse();

        let open: Vec<u64> = SnapshotFilter::open_only()
            .apply(&overlay.snapshots)
            .iter()
            .map(|s| s.version_number)
            .collect();
        assert_eq!(open, vec![1, 4]);

        let pending: Vec<u64> = SnapshotFilter::with_pending()
            .limit(2)
            .apply(&overlay.snapshots)
            .iter()
            .map(|s| s.version_number)
            .collect();
        assert_eq!(pending, vec![1, 2]);

        assert!(SnapshotFilter::open_only().limit(0).apply(&overlay.snapshots).is_empty());
    }

    #[test]
    fn test_owner_scoping() {
        let owner = Owner::user("u1");
        let overlay = Overlay::new("a.html", Some(&owner), "");
        assert!(overlay.is_active_for("a.html", Some(&owner)));
        assert!(!overlay.is_active_for("a.html", None));
        assert!(!overlay.is_active_for("a.html", Some(&Owner::tenant("u1"))));
        assert_eq!(Owner::from_parts(None, None), None);
    }

    #[test]
    fn test_snapshot_json_is_camel_case() {
        let overlay = overlay_with(1);
        let json = serde_json::to_value(&overlay.snapshots[0]).unwrap();
        assert_eq!(json["versionNumber"], 1);
        assert_eq!(json["status"], "open");
        assert_eq!(json["changeType"], "manual");
    }
}
