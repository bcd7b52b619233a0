//! Text diff codec.
//!
//! Line-level diffs are computed with the `similar` crate and serialized as
//! unified diff hunks (`@@ -a,b +c,d @@`). Applying a patch never fails on a
//! context mismatch: each hunk is located at its recorded position or the
//! nearest position where its context still matches, and hunks that cannot be
//! placed are skipped and reported.
//!
//! Both sides of a diff and the text a patch is applied to are split with
//! [`split_lines`] (after `\n`, `\r\n` or a lone `\r`), so a patch applies to
//! exactly the tokens it was built from.

use std::fmt::Write as _;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use similar::{Algorithm, DiffTag};

use crate::error::{EngineError, EngineResult};

const NO_NEWLINE_MARKER: &str = "\\ No newline at end of file";

/// Line counts describing a diff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffStats {
    pub additions: usize,
    pub deletions: usize,
    /// Contiguous regions of change.
    pub changed_blocks: usize,
}

impl DiffStats {
    pub fn is_empty(&self) -> bool {
        self.additions == 0 && self.deletions == 0
    }

    /// Short human-readable summary, e.g. `+3 -1 in 2 block(s)`.
    pub fn summary(&self) -> String {
        format!(
            "+{} -{} in {} block(s)",
            self.additions, self.deletions, self.changed_blocks
        )
    }
}

/// A serialized patch and its stats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextPatch {
    pub patch: String,
    pub stats: DiffStats,
}

/// Result of applying a patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOutcome {
    pub text: String,
    pub all_hunks_applied: bool,
    /// Zero-based indices of the hunks that were skipped.
    pub failed_hunks: Vec<usize>,
    pub total_hunks: usize,
}

/// Creates and applies unified text diffs.
#[derive(Debug, Clone)]
pub struct DiffCodec {
    context_lines: usize,
    timeout: Option<Duration>,
}

impl Default for DiffCodec {
    fn default() -> Self {
        Self {
            context_lines: 3,
            timeout: Some(Duration::from_secs(2)),
        }
    }
}

impl DiffCodec {
    pub fn new(context_lines: usize, timeout: Option<Duration>) -> Self {
        Self {
            context_lines,
            timeout,
        }
    }

    /// Compute a patch turning `old` into `new`.
    pub fn create_diff(&self, old: &str, new: &str) -> TextPatch {
        self.write_patch(old, new, None)
    }

    /// Same as [`create_diff`](Self::create_diff), with `---`/`+++` file
    /// headers naming `path`.
    pub fn create_file_diff(&self, old: &str, new: &str, path: &str) -> TextPatch {
        self.write_patch(old, new, Some(path))
    }

    fn write_patch(&self, old: &str, new: &str, path: Option<&str>) -> TextPatch {
        let old_lines = split_lines(old);
        let new_lines = split_lines(new);
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let ops = similar::capture_diff_slices_deadline(
            Algorithm::Myers,
            &old_lines,
            &new_lines,
            deadline,
        );

        let mut patch = String::new();
        let mut stats = DiffStats::default();

        for group in similar::group_diff_ops(ops, self.context_lines) {
            if group.iter().all(|op| op.tag() == DiffTag::Equal) {
                continue;
            }
            let (Some(first), Some(last)) = (group.first(), group.last()) else {
                continue;
            };
            if patch.is_empty() {
                if let Some(path) = path {
                    let _ = writeln!(patch, "--- a/{path}\n+++ b/{path}");
                }
            }
            let old_range = first.old_range().start..last.old_range().end;
            let new_range = first.new_range().start..last.new_range().end;
            let _ = writeln!(
                patch,
                "@@ -{} +{} @@",
                format_range(old_range.start, old_range.len()),
                format_range(new_range.start, new_range.len())
            );

            for op in &group {
                let (tag, old_range, new_range) = op.as_tag_tuple();
                if tag == DiffTag::Equal {
                    for line in &old_lines[old_range] {
                        push_line(&mut patch, ' ', line);
                    }
                    continue;
                }
                stats.changed_blocks += 1;
                stats.deletions += old_range.len();
                stats.additions += new_range.len();
                for line in &old_lines[old_range] {
                    push_line(&mut patch, '-', line);
                }
                for line in &new_lines[new_range] {
                    push_line(&mut patch, '+', line);
                }
            }
        }

        TextPatch { patch, stats }
    }

    /// Apply a patch produced by [`create_diff`](Self::create_diff).
    ///
    /// Context mismatches are reported through the outcome; only a patch that
    /// cannot be parsed at all is an error.
    pub fn apply_diff(&self, old: &str, patch: &str) -> EngineResult<PatchOutcome> {
        let hunks = parse_patch(patch)?;
        let lines = split_lines(old);

        let mut text = String::with_capacity(old.len());
        let mut cursor = 0usize;
        let mut offset: isize = 0;
        let mut failed_hunks = Vec::new();

        for (index, hunk) in hunks.iter().enumerate() {
            let expected = hunk.old_lines();
            let anchor = (hunk.anchor() as isize).saturating_add(offset);
            match locate(&lines, &expected, cursor, anchor) {
                Some(pos) => {
                    for line in &lines[cursor..pos] {
                        text.push_str(line);
                    }
                    for line in hunk.new_lines() {
                        text.push_str(line);
                    }
                    cursor = pos + expected.len();
                    offset = pos as isize - hunk.anchor() as isize;
                }
                None => {
                    tracing::debug!(hunk = index, anchor, "hunk context not found");
                    failed_hunks.push(index);
                }
            }
        }
        for line in &lines[cursor..] {
            text.push_str(line);
        }

        Ok(PatchOutcome {
            text,
            all_hunks_applied: failed_hunks.is_empty(),
            failed_hunks,
            total_hunks: hunks.len(),
        })
    }
}

fn push_line(patch: &mut String, tag: char, line: &str) {
    patch.push(tag);
    patch.push_str(line);
    if !line.ends_with('\n') {
        patch.push('\n');
        patch.push_str(NO_NEWLINE_MARKER);
        patch.push('\n');
    }
}

fn format_range(start: usize, len: usize) -> String {
    if len == 0 {
        format!("{start},0")
    } else {
        format!("{},{len}", start + 1)
    }
}

/// Split text into lines, keeping terminators: `\r\n`, `\n` and a lone `\r`
/// each end a line.
pub fn split_lines(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut lines = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\r' if bytes.get(i + 1) == Some(&b'\n') => {
                lines.push(&text[start..i + 2]);
                i += 2;
                start = i;
            }
            b'\r' | b'\n' => {
                lines.push(&text[start..=i]);
                i += 1;
                start = i;
            }
            _ => i += 1,
        }
    }
    if start < text.len() {
        lines.push(&text[start..]);
    }
    lines
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HunkLine {
    Context(String),
    Delete(String),
    Insert(String),
}

impl HunkLine {
    fn text_mut(&mut self) -> &mut String {
        match self {
            HunkLine::Context(s) | HunkLine::Delete(s) | HunkLine::Insert(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Hunk {
    old_start: usize,
    old_len: usize,
    lines: Vec<HunkLine>,
}

impl Hunk {
    /// Zero-based line index where the hunk's old lines begin.
    fn anchor(&self) -> usize {
        if self.old_len == 0 {
            self.old_start
        } else {
            self.old_start.saturating_sub(1)
        }
    }

    fn old_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Delete(s) => Some(s.as_str()),
                HunkLine::Insert(_) => None,
            })
            .collect()
    }

    fn new_lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| match l {
            HunkLine::Context(s) | HunkLine::Insert(s) => Some(s.as_str()),
            HunkLine::Delete(_) => None,
        })
    }
}

fn parse_patch(patch: &str) -> EngineResult<Vec<Hunk>> {
    let mut hunks = Vec::new();
    let mut lines = patch.split_inclusive('\n').peekable();

    while let Some(line) = lines.next() {
        // File headers and anything else outside a hunk are ignored.
        if !line.starts_with("@@") {
            continue;
        }
        let (old_start, old_len, new_len) = parse_header(line)?;
        let mut hunk = Hunk {
            old_start,
            old_len,
            lines: Vec::new(),
        };
        let (mut old_seen, mut new_seen) = (0, 0);

        while old_seen < old_len || new_seen < new_len {
            let body = lines
                .next()
                .ok_or_else(|| EngineError::malformed(format!("hunk at line {old_start} is truncated")))?;
            let parsed = match body.chars().next() {
                Some(' ') => HunkLine::Context(body[1..].to_string()),
                Some('-') => HunkLine::Delete(body[1..].to_string()),
                Some('+') => HunkLine::Insert(body[1..].to_string()),
                Some('\n') => HunkLine::Context("\n".to_string()),
                Some('\\') => {
                    strip_newline(&mut hunk)?;
                    continue;
                }
                _ => {
                    return Err(EngineError::malformed(format!(
                        "unexpected line in hunk: {:?}",
                        body.trim_end()
                    )));
                }
            };
            match parsed {
                HunkLine::Context(_) => {
                    old_seen += 1;
                    new_seen += 1;
                }
                HunkLine::Delete(_) => old_seen += 1,
                HunkLine::Insert(_) => new_seen += 1,
            }
            hunk.lines.push(parsed);
        }
        while lines.peek().is_some_and(|l| l.starts_with('\\')) {
            lines.next();
            strip_newline(&mut hunk)?;
        }
        if old_seen != old_len || new_seen != new_len {
            return Err(EngineError::malformed(format!(
                "hunk at line {old_start} does not match its header counts"
            )));
        }
        hunks.push(hunk);
    }

    Ok(hunks)
}

fn strip_newline(hunk: &mut Hunk) -> EngineResult<()> {
    let last = hunk
        .lines
        .last_mut()
        .ok_or_else(|| EngineError::malformed("newline marker without a preceding line"))?;
    let text = last.text_mut();
    if text.ends_with('\n') {
        text.pop();
    }
    Ok(())
}

/// Parse `@@ -a[,b] +c[,d] @@`, returning `(a, b, d)`.
fn parse_header(line: &str) -> EngineResult<(usize, usize, usize)> {
    let bad = || EngineError::malformed(format!("bad hunk header: {:?}", line.trim_end()));
    let inner = line
        .strip_prefix("@@ ")
        .and_then(|rest| rest.split(" @@").next())
        .ok_or_else(bad)?;
    let mut parts = inner.split_whitespace();
    let old = parts.next().and_then(|p| p.strip_prefix('-')).ok_or_else(bad)?;
    let new = parts.next().and_then(|p| p.strip_prefix('+')).ok_or_else(bad)?;

    let range = |part: &str| -> Option<(usize, usize)> {
        match part.split_once(',') {
            Some((start, len)) => Some((start.parse().ok()?, len.parse().ok()?)),
            None => Some((part.parse().ok()?, 1)),
        }
    };
    let (old_start, old_len) = range(old).ok_or_else(bad)?;
    let (new_start, new_len) = range(new).ok_or_else(bad)?;
    // Line arithmetic during apply is signed.
    let limit = isize::MAX as usize;
    if [old_start, old_len, new_start, new_len].iter().any(|&n| n > limit) {
        return Err(bad());
    }
    Ok((old_start, old_len, new_len))
}

/// Find where `expected` occurs in `lines`, at or after `cursor`, closest to
/// `anchor`.
fn locate(lines: &[&str], expected: &[&str], cursor: usize, anchor: isize) -> Option<usize> {
    if lines.len() < cursor + expected.len() {
        return None;
    }
    let last = lines.len() - expected.len();
    let anchor = anchor.clamp(cursor as isize, last as isize) as usize;
    let matches_at = |pos: usize| lines[pos..pos + expected.len()] == *expected;

    if matches_at(anchor) {
        return Some(anchor);
    }
    let reach = (anchor - cursor).max(last - anchor);
    for distance in 1..=reach {
        if let Some(pos) = anchor.checked_sub(distance) {
            if pos >= cursor && matches_at(pos) {
                return Some(pos);
            }
        }
        let pos = anchor + distance;
        if pos <= last && matches_at(pos) {
            return Some(pos);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn round_trip(old: &str, new: &str) -> String {
        let codec = DiffCodec::default();
        let patch = codec.create_diff(old, new);
        let outcome = codec.apply_diff(old, &patch.patch).unwrap();
        assert!(outcome.all_hunks_applied, "patch:\n{}", patch.patch);
        outcome.text
    }

    #[test]
    fn test_round_trip_edge_cases() {
        let cases = [
            ("", ""),
            ("", "added\n"),
            ("removed\n", ""),
            ("no newline", "still no newline"),
            ("a\nb\nc\n", "a\nb\nc"),
            ("a\nb\nc", "a\nb\nc\n"),
            ("crlf\r\nline\r\n", "crlf\r\nchanged\r\n"),
            ("lone\rcarriage", "lone\rcarriage\rreturn"),
            ("--- a\n+++ b\n@@ x\n", "--- a\n+++ c\n@@ x\n"),
        ];
        for (old, new) in cases {
            assert_eq!(round_trip(old, new), new, "old={old:?} new={new:?}");
        }
    }

    #[test]
    fn test_stats() {
        let codec = DiffCodec::default();
        let old = "one\ntwo\nthree\nfour\n";
        let new = "one\n2\nthree\nfour\nfive\n";
        let patch = codec.create_diff(old, new);
        assert_eq!(
            patch.stats,
            DiffStats {
                additions: 2,
                deletions: 1,
                changed_blocks: 2
            }
        );
        assert_eq!(patch.stats.summary(), "+2 -1 in 2 block(s)");
    }

    #[test]
    fn test_identical_inputs_produce_empty_patch() {
        let patch = DiffCodec::default().create_diff("same\n", "same\n");
        assert!(patch.patch.is_empty());
        assert!(patch.stats.is_empty());
    }

    #[test]
    fn test_file_headers_are_ignored_on_apply() {
        let codec = DiffCodec::default();
        let patch = codec.create_file_diff("a\n", "b\n", "src/Card.tsx");
        assert!(patch.patch.starts_with("--- a/src/Card.tsx\n+++ b/src/Card.tsx\n@@"));
        assert_eq!(codec.apply_diff("a\n", &patch.patch).unwrap().text, "b\n");
    }

    #[test]
    fn test_hunk_applies_at_shifted_offset() {
        let codec = DiffCodec::new(1, None);
        let old = "a\nb\nc\nd\ne\n";
        let patch = codec.create_diff(old, "a\nb\nC\nd\ne\n");
        let shifted = "header\nheader\na\nb\nc\nd\ne\n";
        let outcome = codec.apply_diff(shifted, &patch.patch).unwrap();
        assert!(outcome.all_hunks_applied);
        assert_eq!(outcome.text, "header\nheader\na\nb\nC\nd\ne\n");
    }

    #[test]
    fn test_mismatched_hunk_is_skipped() {
        let codec = DiffCodec::new(1, None);
        let old = "1\n2\n3\n4\n5\n6\n7\n8\n9\n";
        let new = "1\nTWO\n3\n4\n5\n6\n7\nEIGHT\n9\n";
        let patch = codec.create_diff(old, new);

        let drifted = "1\n2\n3\n4\n5\n6\nseven\n8\n9\n";
        let outcome = codec.apply_diff(drifted, &patch.patch).unwrap();
        assert!(!outcome.all_hunks_applied);
        assert_eq!(outcome.failed_hunks, vec![1]);
        assert_eq!(outcome.total_hunks, 2);
        assert_eq!(outcome.text, "1\nTWO\n3\n4\n5\n6\nseven\n8\n9\n");
    }

    #[test]
    fn test_malformed_patch_is_an_error() {
        let codec = DiffCodec::default();
        assert!(matches!(
            codec.apply_diff("a\n", "@@ -1 +1 @@\n"),
            Err(EngineError::MalformedPatch(_))
        ));
        assert!(matches!(
            codec.apply_diff("a\n", "@@ nonsense @@\n-a\n"),
            Err(EngineError::MalformedPatch(_))
        ));
        assert!(matches!(
            codec.apply_diff("a\n", "@@ -1,1 +1,1 @@\n?a\n+b\n"),
            Err(EngineError::MalformedPatch(_))
        ));
    }

    #[test]
    fn test_out_of_range_header_is_malformed() {
        let codec = DiffCodec::default();
        assert!(matches!(
            codec.apply_diff("a\n", "@@ -9223372036854775809,1 +1,1 @@\n-a\n+z\n"),
            Err(EngineError::MalformedPatch(_))
        ));
        let near_limit = format!("@@ -{},1 +1,1 @@\n-a\n+z\n", isize::MAX);
        let outcome = codec.apply_diff("a\n", &near_limit).unwrap();
        assert!(outcome.all_hunks_applied);
        assert_eq!(outcome.text, "z\n");
    }

    #[test]
    fn test_split_lines() {
        assert_eq!(split_lines("a\nb\r\nc\rd"), vec!["a\n", "b\r\n", "c\r", "d"]);
        assert!(split_lines("").is_empty());
    }

    proptest! {
        #[test]
        fn prop_apply_reproduces_new(
            old in "[ab\\r\\n ]{0,40}",
            new in "[ab\\r\\n ]{0,40}",
        ) {
            let codec = DiffCodec::default();
            let patch = codec.create_diff(&old, &new);
            let outcome = codec.apply_diff(&old, &patch.patch).unwrap();
            prop_assert!(outcome.all_hunks_applied);
            prop_assert_eq!(outcome.text, new);
        }
    }
}
