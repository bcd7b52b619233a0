//! Structural diffing and patching.
//!
//! A structural delta records *what content changed* rather than where:
//! literal text that became other text, and attribute values that were added
//! or modified. Diffing pairs up old and new literals heuristically:
//!
//! 1. identical values are unchanged (nearest position first),
//! 2. remaining values are paired when one contains the other,
//! 3. when both trees hold the same number of literals of a kind, leftovers
//!    at the same ordinal position are paired.
//!
//! Every change carries a [`PositionHint`] (enclosing element path and
//! ordinal) so that, when several nodes could match on content alone, the
//! patcher picks the one at the recorded position.
//!
//! Patching never fails: entries that match nothing are ignored and counted.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::parser;
use crate::types::{attribute_value_index, Language, NodeId, SourceNode, SourceTree, TRIVIA_KIND};

/// Which literal node kind a change applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiteralKind {
    #[default]
    Text,
    String,
}

/// Where a node was found in the tree it was diffed from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionHint {
    /// Enclosing element tags, outermost first.
    #[serde(default)]
    pub path: Vec<String>,
    /// Index among the nodes of the same kind (or same tag, for elements).
    #[serde(default)]
    pub ordinal: usize,
}

/// An old literal value replaced by a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiteralChange {
    #[serde(default)]
    pub kind: LiteralKind,
    pub old: String,
    pub new: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<PositionHint>,
}

/// An attribute added to (`old: None`) or modified on an element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub element: String,
    pub name: String,
    #[serde(default)]
    pub old: Option<String>,
    pub new: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<PositionHint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuralDelta {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub text_changes: Vec<LiteralChange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attribute_changes: Vec<AttributeChange>,
}

impl StructuralDelta {
    pub fn len(&self) -> usize {
        self.text_changes.len() + self.attribute_changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_json(&self) -> EngineResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> EngineResult<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Result of applying a delta to a tree.
#[derive(Debug, Clone)]
pub struct DeltaApplication {
    pub tree: SourceTree,
    pub applied: usize,
    pub ignored: usize,
}

// ── Site collection ──

/// A literal node and where it sits.
#[derive(Debug)]
struct LiteralSite<'a> {
    id: NodeId,
    kind: LiteralKind,
    /// Trimmed for text literals.
    value: &'a str,
    path: Vec<&'a str>,
    ordinal: usize,
}

/// An element node, its attributes and where it sits.
#[derive(Debug)]
struct ElementSite<'a> {
    id: NodeId,
    tag: &'a str,
    attributes: Vec<(&'a str, Option<String>)>,
    path: Vec<&'a str>,
    ordinal: usize,
}

impl ElementSite<'_> {
    fn attribute(&self, name: &str) -> Option<&Option<String>> {
        self.attributes.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }
}

fn literal_sites(root: &SourceNode) -> Vec<LiteralSite<'_>> {
    let mut sites = Vec::new();
    let (mut texts, mut strings) = (0, 0);
    root.walk(&mut |node, scope| {
        if scope.attribute.is_some() {
            return;
        }
        let (kind, value, counter) = match node {
            SourceNode::TextLiteral { value, .. } if !value.trim().is_empty() => {
                (LiteralKind::Text, value.trim(), &mut texts)
            }
            SourceNode::StringLiteral { value, .. } => (LiteralKind::String, value.as_str(), &mut strings),
            _ => return,
        };
        sites.push(LiteralSite {
            id: node.id(),
            kind,
            value,
            path: scope.elements.clone(),
            ordinal: *counter,
        });
        *counter += 1;
    });
    sites
}

fn element_sites(root: &SourceNode) -> Vec<ElementSite<'_>> {
    let mut sites: Vec<ElementSite<'_>> = Vec::new();
    root.walk(&mut |node, scope| {
        let SourceNode::Element { tag, .. } = node else {
            return;
        };
        let attributes = node
            .attributes()
            .filter_map(|attr| match attr {
                SourceNode::Attribute { name, .. } => Some((name.as_str(), attr.attribute_value())),
                _ => None,
            })
            .collect();
        let ordinal = sites.iter().filter(|s| s.tag == tag.as_str()).count();
        sites.push(ElementSite {
            id: node.id(),
            tag: tag.as_str(),
            attributes,
            path: scope.elements.clone(),
            ordinal,
        });
    });
    sites
}

fn hint(path: &[&str], ordinal: usize) -> Option<PositionHint> {
    Some(PositionHint {
        path: path.iter().map(|s| s.to_string()).collect(),
        ordinal,
    })
}

// ── Diffing ──

/// Compute the literal-text and attribute-value changes between two trees.
pub fn diff_trees(old: &SourceTree, new: &SourceTree) -> StructuralDelta {
    let mut delta = StructuralDelta::default();

    let old_literals = literal_sites(&old.root);
    let new_literals = literal_sites(&new.root);
    for kind in [LiteralKind::Text, LiteralKind::String] {
        let olds: Vec<&LiteralSite> = old_literals.iter().filter(|s| s.kind == kind).collect();
        let news: Vec<&LiteralSite> = new_literals.iter().filter(|s| s.kind == kind).collect();
        for (o, n) in pair_literals(&olds, &news) {
            delta.text_changes.push(LiteralChange {
                kind,
                old: o.value.to_string(),
                new: n.value.to_string(),
                hint: hint(&o.path, o.ordinal),
            });
        }
    }

    let old_elements = element_sites(&old.root);
    let new_elements = element_sites(&new.root);
    for o in &old_elements {
        let Some(n) = new_elements
            .iter()
            .find(|n| n.tag == o.tag && n.ordinal == o.ordinal)
        else {
            continue;
        };
        for (name, value) in &n.attributes {
            // Boolean attributes have no value to record.
            let Some(value) = value else { continue };
            let old_value = match o.attribute(name) {
                Some(existing) if existing.as_ref() == Some(value) => continue,
                Some(existing) => existing.clone(),
                None => None,
            };
            delta.attribute_changes.push(AttributeChange {
                element: o.tag.to_string(),
                name: name.to_string(),
                old: old_value,
                new: value.clone(),
                hint: hint(&o.path, o.ordinal),
            });
        }
    }

    delta
}

/// Pair changed literals. Returns `(old, new)` pairs whose values differ.
fn pair_literals<'s, 'a>(
    olds: &[&'s LiteralSite<'a>],
    news: &[&'s LiteralSite<'a>],
) -> Vec<(&'s LiteralSite<'a>, &'s LiteralSite<'a>)> {
    let mut old_done = vec![false; olds.len()];
    let mut new_done = vec![false; news.len()];

    let pass = |accept: &dyn Fn(&LiteralSite, &LiteralSite) -> bool,
                    old_done: &mut Vec<bool>,
                    new_done: &mut Vec<bool>|
     -> Vec<(usize, usize)> {
        let mut pairs = Vec::new();
        for (oi, o) in olds.iter().enumerate() {
            if old_done[oi] {
                continue;
            }
            let nearest = news
                .iter()
                .enumerate()
                .filter(|(ni, n)| !new_done[*ni] && accept(o, n))
                .min_by_key(|(_, n)| n.ordinal.abs_diff(o.ordinal));
            if let Some((ni, _)) = nearest {
                old_done[oi] = true;
                new_done[ni] = true;
                pairs.push((oi, ni));
            }
        }
        pairs
    };

    // Unchanged literals are consumed first and never reported.
    pass(&|o, n| o.value == n.value, &mut old_done, &mut new_done);

    let mut changed = pass(
        &|o, n| !o.value.is_empty() && !n.value.is_empty() && (o.value.contains(n.value) || n.value.contains(o.value)),
        &mut old_done,
        &mut new_done,
    );
    if olds.len() == news.len() {
        changed.extend(pass(&|o, n| o.ordinal == n.ordinal, &mut old_done, &mut new_done));
    }

    changed.sort_unstable();
    changed.into_iter().map(|(oi, ni)| (olds[oi], news[ni])).collect()
}

// ── Patching ──

/// Apply a delta. Each literal is rewritten at most once and each attribute
/// of an element set at most once; entries that match nothing are ignored.
pub fn apply_structural_delta(mut tree: SourceTree, delta: &StructuralDelta) -> DeltaApplication {
    let mut used_literals: HashSet<NodeId> = HashSet::new();
    let mut used_attributes: HashSet<(NodeId, &str)> = HashSet::new();
    let mut applied = 0;
    let mut ignored = 0;

    for change in &delta.text_changes {
        let target = {
            let sites = literal_sites(&tree.root);
            choose_literal(&sites, change, &used_literals)
        };
        let replaced = match target.and_then(|id| tree.root.find_mut(id)) {
            Some(SourceNode::TextLiteral { value, .. } | SourceNode::StringLiteral { value, .. }) => {
                replace_literal(value, &change.old, &change.new)
            }
            _ => false,
        };
        match target {
            Some(id) if replaced => {
                used_literals.insert(id);
                applied += 1;
            }
            _ => ignored += 1,
        }
    }

    for change in &delta.attribute_changes {
        let target = {
            let sites = element_sites(&tree.root);
            choose_element(&sites, change, &used_attributes)
        };
        let Some(id) = target else {
            ignored += 1;
            continue;
        };
        let new_ids = [tree.fresh_id(), tree.fresh_id(), tree.fresh_id(), tree.fresh_id(), tree.fresh_id()];
        let updated = match tree.root.find_mut(id) {
            Some(element) => set_attribute(element, &change.name, &change.new, new_ids),
            None => false,
        };
        if updated {
            used_attributes.insert((id, change.name.as_str()));
            applied += 1;
        } else {
            ignored += 1;
        }
    }

    DeltaApplication {
        tree,
        applied,
        ignored,
    }
}

fn hint_rank(path: &[&str], ordinal: usize, hint: Option<&PositionHint>) -> (bool, usize) {
    match hint {
        Some(h) => {
            let same_path = path.len() == h.path.len() && path.iter().zip(&h.path).all(|(a, b)| *a == b.as_str());
            (!same_path, ordinal.abs_diff(h.ordinal))
        }
        None => (false, 0),
    }
}

fn choose_literal(sites: &[LiteralSite], change: &LiteralChange, used: &HashSet<NodeId>) -> Option<NodeId> {
    sites
        .iter()
        .enumerate()
        .filter(|(_, s)| s.kind == change.kind && !used.contains(&s.id))
        .filter_map(|(order, s)| {
            let exact = s.value == change.old;
            let contains = !change.old.is_empty() && s.value.contains(change.old.as_str());
            (exact || contains).then(|| {
                let (path_miss, distance) = hint_rank(&s.path, s.ordinal, change.hint.as_ref());
                ((!exact, path_miss, distance, order), s.id)
            })
        })
        .min_by_key(|(rank, _)| *rank)
        .map(|(_, id)| id)
}

fn choose_element(
    sites: &[ElementSite],
    change: &AttributeChange,
    used: &HashSet<(NodeId, &str)>,
) -> Option<NodeId> {
    sites
        .iter()
        .enumerate()
        .filter(|(_, s)| s.tag == change.element && !used.contains(&(s.id, change.name.as_str())))
        .filter_map(|(order, s)| {
            let closeness = match (s.attribute(&change.name), &change.old) {
                // Adding: only elements that lack the attribute.
                (None, None) => 0,
                (Some(Some(current)), Some(old)) if current == old => 0,
                (Some(Some(current)), Some(old))
                    if !old.is_empty() && (current.contains(old.as_str()) || old.contains(current.as_str())) =>
                {
                    1
                }
                _ => return None,
            };
            let (path_miss, distance) = hint_rank(&s.path, s.ordinal, change.hint.as_ref());
            Some(((closeness, path_miss, distance, order), s.id))
        })
        .min_by_key(|(rank, _)| *rank)
        .map(|(_, id)| id)
}

/// Replace `old` inside a literal value, keeping surrounding whitespace.
fn replace_literal(value: &mut String, old: &str, new: &str) -> bool {
    if value == old {
        *value = new.to_string();
        return true;
    }
    let trimmed = value.trim();
    if trimmed == old {
        let start = value.len() - value.trim_start().len();
        let end = start + trimmed.len();
        value.replace_range(start..end, new);
        return true;
    }
    if old.is_empty() {
        return false;
    }
    match value.find(old) {
        Some(pos) => {
            value.replace_range(pos..pos + old.len(), new);
            true
        }
        None => false,
    }
}

fn looks_like_expression(value: &str) -> bool {
    value.starts_with('{') && value.ends_with('}')
}

fn value_node(id: NodeId, value: &str) -> SourceNode {
    if looks_like_expression(value) {
        SourceNode::Other {
            id,
            kind: "expression".into(),
            text: value.to_string(),
            children: vec![],
        }
    } else {
        let (quote, value) = quoted_value(Some('"'), value);
        SourceNode::StringLiteral { id, quote, value }
    }
}

/// Quote and body for an attribute value, keeping `current` when the value
/// fits inside it. A value holding both quote characters gets `&quot;`.
fn quoted_value(current: Option<char>, value: &str) -> (Option<char>, String) {
    let bare = |c: char| !(c.is_whitespace() || matches!(c, '"' | '\'' | '`' | '=' | '<' | '>'));
    match current {
        Some(q) if !value.contains(q) => (Some(q), value.to_string()),
        None if !value.is_empty() && value.chars().all(bare) => (None, value.to_string()),
        _ if !value.contains('"') => (Some('"'), value.to_string()),
        _ if !value.contains('\'') => (Some('\''), value.to_string()),
        _ => (Some('"'), value.replace('"', "&quot;")),
    }
}

fn token(id: NodeId, kind: &str, text: &str) -> SourceNode {
    SourceNode::Other {
        id,
        kind: kind.to_string(),
        text: text.to_string(),
        children: vec![],
    }
}

/// Set (or add) an attribute on an element's opening tag.
fn set_attribute(element: &mut SourceNode, name: &str, value: &str, ids: [NodeId; 5]) -> bool {
    let Some(head) = element.tag_head_mut() else {
        return false;
    };

    let existing = head
        .iter_mut()
        .find(|c| matches!(c, SourceNode::Attribute { name: n, .. } if n == name));
    if let Some(SourceNode::Attribute { children, .. }) = existing {
        match attribute_value_index(children) {
            Some(i) => match &mut children[i] {
                SourceNode::StringLiteral { quote, value: v, .. } if !looks_like_expression(value) => {
                    (*quote, *v) = quoted_value(*quote, value);
                }
                slot => *slot = value_node(ids[0], value),
            },
            None => {
                children.push(token(ids[1], "=", "="));
                children.push(value_node(ids[0], value));
            }
        }
        return true;
    }

    let at = SourceNode::attribute_insert_index(head);
    let attribute = SourceNode::Attribute {
        id: ids[2],
        name: name.to_string(),
        children: vec![
            token(ids[3], "attribute_name", name),
            token(ids[1], "=", "="),
            value_node(ids[0], value),
        ],
    };
    head.insert(at, attribute);
    head.insert(at, token(ids[4], TRIVIA_KIND, " "));
    true
}

// ── Entry points with an input ceiling ──

/// Structural diffing and patching with a bound on input size.
#[derive(Debug, Clone)]
pub struct StructuralPatcher {
    max_input_bytes: usize,
}

impl Default for StructuralPatcher {
    fn default() -> Self {
        Self {
            max_input_bytes: 256 * 1024,
        }
    }
}

impl StructuralPatcher {
    pub fn new(max_input_bytes: usize) -> Self {
        Self { max_input_bytes }
    }

    fn check_size(&self, source: &str) -> EngineResult<()> {
        if source.len() > self.max_input_bytes {
            return Err(EngineError::InputTooLarge {
                len: source.len(),
                limit: self.max_input_bytes,
            });
        }
        Ok(())
    }

    /// Parse within the size ceiling. `Ok(None)` means malformed input.
    pub fn parse(&self, source: &str, lang: Language) -> EngineResult<Option<SourceTree>> {
        self.check_size(source)?;
        Ok(parser::parse(source, lang))
    }

    /// Diff two sources. Returns `Ok(None)` when either side does not parse
    /// or when the delta does not fully reproduce `new`; a delta that only
    /// partly explains an edit must not stand in for the text diff.
    pub fn diff_sources(&self, old: &str, new: &str, lang: Language) -> EngineResult<Option<StructuralDelta>> {
        let (Some(old_tree), Some(new_tree)) = (self.parse(old, lang)?, self.parse(new, lang)?) else {
            return Ok(None);
        };
        let delta = diff_trees(&old_tree, &new_tree);
        if delta.is_empty() {
            return Ok(None);
        }
        let replayed = apply_structural_delta(old_tree, &delta);
        if replayed.tree.to_source() != new {
            tracing::debug!(language = %lang, changes = delta.len(), "structural delta does not reproduce edit");
            return Ok(None);
        }
        Ok(Some(delta))
    }

    /// Patch source text with a delta. Fails when the source cannot be
    /// parsed or when none of the delta's entries matched.
    pub fn patch_source(&self, source: &str, lang: Language, delta: &StructuralDelta) -> EngineResult<String> {
        let tree = self
            .parse(source, lang)?
            .ok_or(EngineError::ParseFailure { language: lang })?;
        let outcome = apply_structural_delta(tree, delta);
        if outcome.applied == 0 && !delta.is_empty() {
            return Err(EngineError::DeltaUnmatched { entries: delta.len() });
        }
        if outcome.ignored > 0 {
            tracing::debug!(applied = outcome.applied, ignored = outcome.ignored, "structural delta partly matched");
        }
        Ok(outcome.tree.to_source())
    }
}
