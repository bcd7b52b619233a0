//! # merge-engine
//!
//! Rebuilds a customized source file from an immutable baseline and an
//! ordered list of snapshots, each carrying a unified text diff, a structural
//! delta, or both.
//!
//! ## Approach
//!
//! 1. **Text diffs**: line-level unified diffs built with `similar`. Hunks
//!    are relocated to the nearest matching offset when the text has
//!    shifted, and skipped (not fatal) when their context is gone.
//!
//! 2. **Structural deltas**: on JavaScript, TypeScript, TSX and HTML files,
//!    edits are also recorded as content changes over a tree-sitter parse:
//!    literal text and attribute values. A structural delta keeps applying
//!    after the surrounding markup has been restructured, where a text hunk
//!    would lose its context.
//!
//! 3. **Fold**: snapshots are applied in ascending version order. Each one
//!    uses its structural delta when it can and its text diff otherwise; a
//!    snapshot that fails is skipped and the fold continues.
//!
//! 4. **Projection**: merged output is wrapped in an error boundary for the
//!    browser and scanned for user-visible values.
//!
//! ## Example
//!
//! ```rust
//! use merge_engine::{MergeEngine, SnapshotDiff};
//!
//! let engine = MergeEngine::default();
//! let write = engine
//!     .create_write_diff("<p>Hello</p>\n", "<p>Hello there</p>\n", "index.html")
//!     .unwrap();
//!
//! let snapshots = [SnapshotDiff {
//!     version: 1,
//!     unified_diff: Some(&write.unified_diff),
//!     structural_diff: write.structural_diff.as_deref(),
//! }];
//! let merged = engine.merge("index.html", "<p>Hello</p>\n", &snapshots);
//!
//! assert_eq!(merged.text, "<p>Hello there</p>\n");
//! assert_eq!(merged.applied, 1);
//! ```

pub mod codec;
pub mod engine;
pub mod error;
pub mod parser;
pub mod projection;
pub mod structural;
pub mod types;

// Re-export primary public API
pub use codec::{DiffCodec, DiffStats, PatchOutcome, TextPatch};
pub use engine::{EngineConfig, FoldOutcome, MergeEngine, PatchKind, SnapshotDiff, SnapshotOutcome, WriteDiff};
pub use error::{EngineError, EngineResult};
pub use projection::{project, Extracted, Projection};
pub use structural::{apply_structural_delta, diff_trees, DeltaApplication, StructuralDelta, StructuralPatcher};
pub use types::{Language, SourceNode, SourceTree};
