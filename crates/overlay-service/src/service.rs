use std::sync::Arc;
use std::time::Duration;

use merge_engine::{project, EngineConfig, MergeEngine, SnapshotDiff};
use overlay_core::config::Settings;
use overlay_core::{
    NewSnapshot, OverlayStatus, OverlayStore, Owner, SnapshotFilter, SnapshotStatus, StoreError,
};

use crate::cache::{CacheKey, MergeCache};
use crate::error::ServiceError;
use crate::types::{EditMeta, MergeOptions, MergeResult, ProcessedResult, SnapshotDescriptor};

/// Reads merged files through an optional cache and records edits as
/// snapshots.
pub struct OverlayService {
    store: Arc<dyn OverlayStore>,
    engine: MergeEngine,
    cache: Option<MergeCache>,
    max_snapshots: usize,
}

impl OverlayService {
    pub fn new(
        store: Arc<dyn OverlayStore>,
        engine: MergeEngine,
        cache: Option<MergeCache>,
        max_snapshots: usize,
    ) -> Self {
        Self {
            store,
            engine,
            cache,
            max_snapshots,
        }
    }

    pub fn from_settings(store: Arc<dyn OverlayStore>, settings: &Settings) -> Self {
        let engine = MergeEngine::new(EngineConfig {
            context_lines: settings.engine.diff_context_lines,
            diff_timeout: match settings.engine.diff_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            max_structural_input_bytes: settings.engine.max_structural_input_bytes,
        });
        let cache = settings.cache.enabled.then(|| {
            MergeCache::new(
                Duration::from_secs(settings.cache.ttl_secs),
                settings.cache.max_entries,
            )
        });
        Self::new(store, engine, cache, settings.engine.max_snapshots)
    }

    pub fn engine(&self) -> &MergeEngine {
        &self.engine
    }

    /// Merged code for a file, served from the cache when fresh. Failed
    /// merges, and merges that overlapped an invalidation, are not cached.
    pub async fn get_merged_code(
        &self,
        file_path: &str,
        owner: Option<&Owner>,
        options: MergeOptions,
    ) -> MergeResult {
        let Some(cache) = &self.cache else {
            return self.get_merged_uncached(file_path, owner, options).await;
        };
        let key = CacheKey::new(file_path, owner, &options);
        if let Some(hit) = cache.get(&key) {
            return hit;
        }
        let generation = cache.generation(file_path);
        let result = self.get_merged_uncached(file_path, owner, options).await;
        if result.success {
            cache.insert(key, result.clone(), generation);
        }
        result
    }

    /// Merged code straight from the store, for read-your-write callers.
    pub async fn get_merged_uncached(
        &self,
        file_path: &str,
        owner: Option<&Owner>,
        options: MergeOptions,
    ) -> MergeResult {
        let filter = if options.include_pending {
            SnapshotFilter::with_pending()
        } else {
            SnapshotFilter::open_only()
        }
        .limit(options.max_snapshots.unwrap_or(self.max_snapshots));

        let overlay = match self.store.find_overlay(file_path, owner, &filter).await {
            Ok(Some(overlay)) => overlay,
            Ok(None) => return MergeResult::no_overlay(),
            Err(e) => {
                tracing::error!(file = %file_path, error = %e, "overlay store lookup failed");
                return MergeResult::failure(e);
            }
        };

        if overlay.snapshots.is_empty() {
            let merged = overlay
                .current_code
                .clone()
                .unwrap_or_else(|| overlay.baseline_code.clone());
            return MergeResult {
                success: true,
                has_overlay: true,
                baseline_code: Some(overlay.baseline_code),
                merged_code: Some(merged),
                ..Default::default()
            };
        }

        let diffs: Vec<SnapshotDiff<'_>> = overlay
            .snapshots
            .iter()
            .map(|s| SnapshotDiff {
                version: s.version_number,
                unified_diff: s.unified_diff.as_deref(),
                structural_diff: s.structural_diff.as_deref(),
            })
            .collect();
        let fold = self.engine.merge(file_path, &overlay.baseline_code, &diffs);

        let error = fold.all_failed().then(|| {
            format!(
                "all {} snapshot(s) with a payload failed to apply",
                fold.failed
            )
        });
        MergeResult {
            success: error.is_none(),
            has_overlay: true,
            merged_code: Some(fold.text),
            applied_snapshots: fold.applied,
            considered_snapshots: fold.considered,
            baseline_code: Some(overlay.baseline_code.clone()),
            error,
        }
    }

    /// Merged code wrapped and scanned for the browser.
    pub async fn get_processed_for_client(
        &self,
        file_path: &str,
        owner: Option<&Owner>,
        options: MergeOptions,
    ) -> ProcessedResult {
        let merge = self.get_merged_code(file_path, owner, options).await;
        let projection = merge
            .merged_code
            .as_deref()
            .map(|code| project(code, file_path));
        let (wrapped, extracted) = match projection {
            Some(p) => (p.wrapped, Some(p.extracted)),
            None => (None, None),
        };
        ProcessedResult {
            merge,
            wrapped,
            extracted,
        }
    }

    /// Record a manual edit. `None` when nothing changed.
    pub async fn record_edit(
        &self,
        file_path: &str,
        owner: Option<&Owner>,
        old_code: &str,
        new_code: &str,
    ) -> Result<Option<SnapshotDescriptor>, ServiceError> {
        self.record_edit_with(file_path, owner, old_code, new_code, EditMeta::default())
            .await
    }

    /// Record an edit as a new snapshot. The first edit to a file creates its
    /// overlay with `old_code` as the baseline.
    pub async fn record_edit_with(
        &self,
        file_path: &str,
        owner: Option<&Owner>,
        old_code: &str,
        new_code: &str,
        meta: EditMeta,
    ) -> Result<Option<SnapshotDescriptor>, ServiceError> {
        if old_code == new_code {
            return Ok(None);
        }
        let diff = self.engine.create_write_diff(old_code, new_code, file_path)?;

        let lookup = SnapshotFilter::open_only().limit(0);
        let overlay = match self.store.find_overlay(file_path, owner, &lookup).await? {
            Some(overlay) => overlay,
            None => match self.store.create_overlay(file_path, owner, old_code).await {
                Ok(overlay) => overlay,
                // Lost a race with a concurrent first edit.
                Err(StoreError::AlreadyExists(_)) => self
                    .store
                    .find_overlay(file_path, owner, &lookup)
                    .await?
                    .ok_or_else(|| StoreError::OverlayNotFound(file_path.to_string()))?,
                Err(e) => return Err(e.into()),
            },
        };

        let change_summary = meta.summary.unwrap_or_else(|| diff.stats.summary());
        let snapshot = self
            .store
            .append_snapshot(
                &overlay.id,
                NewSnapshot {
                    unified_diff: Some(diff.unified_diff),
                    structural_diff: diff.structural_diff,
                    change_summary,
                    change_type: meta.change_type,
                },
            )
            .await?;
        self.invalidate(file_path);

        tracing::info!(
            file = %file_path,
            version = snapshot.version_number,
            structural = snapshot.structural_diff.is_some(),
            "recorded edit"
        );
        Ok(Some(SnapshotDescriptor::new(&snapshot, diff.stats)))
    }

    pub async fn finalize_snapshot(&self, snapshot_id: &str) -> Result<(), ServiceError> {
        self.transition_snapshot(snapshot_id, SnapshotStatus::Finalized)
            .await
    }

    pub async fn discard_snapshot(&self, snapshot_id: &str) -> Result<(), ServiceError> {
        self.transition_snapshot(snapshot_id, SnapshotStatus::Discarded)
            .await
    }

    async fn transition_snapshot(
        &self,
        snapshot_id: &str,
        status: SnapshotStatus,
    ) -> Result<(), ServiceError> {
        let snapshot = self.store.set_snapshot_status(snapshot_id, status).await?;
        let overlay = self.store.get_overlay(&snapshot.overlay_id).await?;
        self.invalidate(&overlay.file_path);
        tracing::info!(file = %overlay.file_path, version = snapshot.version_number, %status, "snapshot status changed");
        Ok(())
    }

    /// Archive the active overlay for a file. Returns `false` when there is
    /// none.
    pub async fn archive_overlay(
        &self,
        file_path: &str,
        owner: Option<&Owner>,
    ) -> Result<bool, ServiceError> {
        let Some(overlay) = self
            .store
            .find_overlay(file_path, owner, &SnapshotFilter::open_only().limit(0))
            .await?
        else {
            return Ok(false);
        };
        self.store
            .set_overlay_status(&overlay.id, OverlayStatus::Archived)
            .await?;
        self.invalidate(file_path);
        tracing::info!(file = %file_path, overlay = %overlay.id, "overlay archived");
        Ok(true)
    }

    /// Drop cached merges for a file.
    pub fn invalidate(&self, file_path: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate(file_path);
        }
    }
}
