use merge_engine::{DiffStats, Extracted};
use overlay_core::{ChangeType, Snapshot};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOptions {
    /// Also fold finalized snapshots.
    pub include_pending: bool,
    /// Overrides the configured snapshot cap.
    pub max_snapshots: Option<usize>,
}

impl MergeOptions {
    pub fn pending() -> Self {
        Self {
            include_pending: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    pub success: bool,
    pub has_overlay: bool,
    pub baseline_code: Option<String>,
    pub merged_code: Option<String>,
    pub applied_snapshots: usize,
    pub considered_snapshots: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MergeResult {
    /// The file has no overlay; callers serve their own baseline.
    pub fn no_overlay() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

/// A merge result prepared for the browser.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedResult {
    #[serde(flatten)]
    pub merge: MergeResult,
    pub wrapped: Option<String>,
    pub extracted: Option<Extracted>,
}

/// What a write recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDescriptor {
    pub snapshot_id: String,
    pub overlay_id: String,
    pub version_number: u64,
    pub change_summary: String,
    pub has_structural_diff: bool,
    pub stats: DiffStats,
}

impl SnapshotDescriptor {
    pub fn new(snapshot: &Snapshot, stats: DiffStats) -> Self {
        Self {
            snapshot_id: snapshot.id.clone(),
            overlay_id: snapshot.overlay_id.clone(),
            version_number: snapshot.version_number,
            change_summary: snapshot.change_summary.clone(),
            has_structural_diff: snapshot.structural_diff.is_some(),
            stats,
        }
    }
}

/// Attribution for a recorded edit.
#[derive(Debug, Clone, Default)]
pub struct EditMeta {
    pub change_type: ChangeType,
    /// Defaults to the diff stats summary.
    pub summary: Option<String>,
}

impl EditMeta {
    pub fn generated(summary: impl Into<String>) -> Self {
        Self {
            change_type: ChangeType::Generated,
            summary: Some(summary.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processed_result_is_flat() {
        let result = ProcessedResult {
            merge: MergeResult {
                success: true,
                has_overlay: true,
                merged_code: Some("<p>Hi</p>".into()),
                applied_snapshots: 1,
                considered_snapshots: 1,
                ..Default::default()
            },
            wrapped: None,
            extracted: None,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["hasOverlay"], true);
        assert_eq!(json["mergedCode"], "<p>Hi</p>");
        assert_eq!(json["appliedSnapshots"], 1);
        assert!(json.get("merge").is_none());
        assert!(json.get("error").is_none());
    }
}
