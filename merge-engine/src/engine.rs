//! Snapshot fold.
//!
//! A merged file is a pure function of its baseline and its ordered
//! snapshots. Each snapshot is applied to the output of the previous one:
//!
//! 1. **Structural delta**: on structured files, when present
//! 2. **Unified diff**: when there is no structural delta, or it could not
//!    be used (parse failure, oversized input, corrupt payload, nothing matched)
//! 3. **No payload**: the snapshot is a no-op
//!
//! A snapshot that fails is logged and skipped, and the fold continues from
//! the last good text. Failures never abort the merge.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::{DiffCodec, DiffStats};
use crate::error::{EngineError, EngineResult};
use crate::structural::{StructuralDelta, StructuralPatcher};
use crate::types::Language;

/// Configuration for the merge engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Lines of context around each unified diff hunk.
    pub context_lines: usize,
    /// Deadline for a single line diff. `None` = unbounded.
    pub diff_timeout: Option<Duration>,
    /// Inputs above this size skip structural processing.
    pub max_structural_input_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            context_lines: 3,
            diff_timeout: Some(Duration::from_secs(2)),
            max_structural_input_bytes: 256 * 1024,
        }
    }
}

/// One snapshot's payload as seen by the fold.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotDiff<'a> {
    pub version: u64,
    pub unified_diff: Option<&'a str>,
    pub structural_diff: Option<&'a str>,
}

/// How a snapshot was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchKind {
    Structural,
    Unified,
}

/// What happened to one snapshot during the fold.
#[derive(Debug)]
pub struct SnapshotOutcome {
    pub version: u64,
    /// `Ok(None)` means the snapshot carried no payload.
    pub result: EngineResult<Option<PatchKind>>,
}

/// Result of folding a list of snapshots over a baseline.
#[derive(Debug)]
pub struct FoldOutcome {
    pub text: String,
    pub applied: usize,
    pub failed: usize,
    pub skipped: usize,
    pub considered: usize,
    pub outcomes: Vec<SnapshotOutcome>,
}

impl FoldOutcome {
    /// Every snapshot that carried a payload failed.
    pub fn all_failed(&self) -> bool {
        self.failed > 0 && self.applied == 0
    }
}

/// Diffs produced for one write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteDiff {
    pub unified_diff: String,
    pub structural_diff: Option<String>,
    pub stats: DiffStats,
}

/// Folds snapshots and produces diffs for new writes.
#[derive(Debug, Clone, Default)]
pub struct MergeEngine {
    codec: DiffCodec,
    structural: StructuralPatcher,
}

impl MergeEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            codec: DiffCodec::new(config.context_lines, config.diff_timeout),
            structural: StructuralPatcher::new(config.max_structural_input_bytes),
        }
    }

    pub fn codec(&self) -> &DiffCodec {
        &self.codec
    }

    /// Apply `snapshots` to `baseline` in ascending version order.
    pub fn merge(&self, file_path: &str, baseline: &str, snapshots: &[SnapshotDiff<'_>]) -> FoldOutcome {
        let mut ordered = snapshots.to_vec();
        ordered.sort_by_key(|s| s.version);

        let language = Language::detect(file_path, baseline);
        let mut text = baseline.to_string();
        let mut outcomes = Vec::with_capacity(ordered.len());
        let (mut applied, mut failed, mut skipped) = (0, 0, 0);

        for snapshot in &ordered {
            let result = self.apply_snapshot(&text, language, snapshot);
            let result = match result {
                Ok(Some((next, kind))) => {
                    text = next;
                    applied += 1;
                    Ok(Some(kind))
                }
                Ok(None) => {
                    skipped += 1;
                    Ok(None)
                }
                Err(e) => {
                    tracing::warn!(file = %file_path, version = snapshot.version, error = %e, "skipping snapshot");
                    failed += 1;
                    Err(e)
                }
            };
            outcomes.push(SnapshotOutcome {
                version: snapshot.version,
                result,
            });
        }

        FoldOutcome {
            text,
            applied,
            failed,
            skipped,
            considered: ordered.len(),
            outcomes,
        }
    }

    /// Apply one snapshot. `Ok(None)` when it carries nothing to apply.
    fn apply_snapshot(
        &self,
        text: &str,
        language: Option<Language>,
        snapshot: &SnapshotDiff<'_>,
    ) -> EngineResult<Option<(String, PatchKind)>> {
        let structural = match (language, snapshot.structural_diff) {
            (Some(lang), Some(payload)) => Some(self.apply_structural(text, lang, payload)),
            _ => None,
        };

        match (structural, snapshot.unified_diff) {
            (Some(Ok(next)), _) => Ok(Some((next, PatchKind::Structural))),
            (Some(Err(e)), Some(patch)) => {
                tracing::debug!(version = snapshot.version, error = %e, "structural delta unusable, applying unified diff");
                self.apply_unified(text, patch).map(|next| Some((next, PatchKind::Unified)))
            }
            (Some(Err(e)), None) => Err(e),
            (None, Some(patch)) => self.apply_unified(text, patch).map(|next| Some((next, PatchKind::Unified))),
            (None, None) => Ok(None),
        }
    }

    fn apply_structural(&self, text: &str, lang: Language, payload: &str) -> EngineResult<String> {
        let delta = StructuralDelta::from_json(payload)?;
        self.structural.patch_source(text, lang, &delta)
    }

    /// A patch with any rejected hunk is a failure; its partial output is
    /// dropped.
    fn apply_unified(&self, text: &str, patch: &str) -> EngineResult<String> {
        let outcome = self.codec.apply_diff(text, patch)?;
        if !outcome.all_hunks_applied {
            return Err(EngineError::HunksRejected {
                failed: outcome.failed_hunks.len(),
                total: outcome.total_hunks,
            });
        }
        Ok(outcome.text)
    }

    /// Diff a write. The unified diff is always produced; the structural
    /// delta only when it alone reproduces `new` from `old`.
    pub fn create_write_diff(&self, old: &str, new: &str, file_path: &str) -> EngineResult<WriteDiff> {
        let patch = self.codec.create_diff(old, new);
        let structural_diff = match Language::detect(file_path, old) {
            Some(lang) => match self.structural.diff_sources(old, new, lang) {
                Ok(Some(delta)) => Some(delta.to_json()?),
                Ok(None) => None,
                Err(e) => {
                    tracing::debug!(file = %file_path, error = %e, "no structural diff for write");
                    None
                }
            },
            None => None,
        };
        Ok(WriteDiff {
            unified_diff: patch.patch,
            structural_diff,
            stats: patch.stats,
        })
    }
}
