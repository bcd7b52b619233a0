//! Core types for the merge engine.
//!
//! Source text is modelled as a tagged tree with five node kinds:
//! - **Element**: a markup element (JSX or HTML), tagged with its tag name
//! - **Attribute**: a key/value pair on an element's opening tag
//! - **TextLiteral**: literal text between tags
//! - **StringLiteral**: a quoted string (JS string or HTML attribute value)
//! - **Other**: every other syntax node, including whitespace trivia
//!
//! Leaves keep their exact source text, so concatenating them reproduces the
//! original input byte for byte.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Unique identifier for a node within one parsed tree.
pub type NodeId = usize;

/// `Other` leaves with this kind hold the bytes between two syntax nodes.
pub const TRIVIA_KIND: &str = "trivia";

/// Node kinds that hold an element's opening tag (and thus its attributes).
const TAG_HEAD_KINDS: &[&str] = &["jsx_opening_element", "start_tag", "self_closing_tag"];

/// Tokens that close an opening tag.
const TAG_CLOSE_TOKENS: &[&str] = &[">", "/>", "/"];

/// Structured source languages. Anything else is treated as plain text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    JavaScript,
    TypeScript,
    Tsx,
    Html,
}

impl Language {
    /// Infer language from a file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "js" | "jsx" | "mjs" | "cjs" => Some(Language::JavaScript),
            "ts" | "mts" | "cts" => Some(Language::TypeScript),
            "tsx" => Some(Language::Tsx),
            "html" | "htm" => Some(Language::Html),
            _ => None,
        }
    }

    /// Classify a file by extension, or by shape when it has no extension.
    pub fn detect(file_path: &str, source: &str) -> Option<Self> {
        match Path::new(file_path).extension().and_then(|e| e.to_str()) {
            Some(ext) => Self::from_extension(&ext.to_ascii_lowercase()),
            None if source.trim_start().starts_with('<') => Some(Language::Html),
            None => None,
        }
    }

    /// Whether the language is executed by the browser (as opposed to markup).
    pub fn is_script(self) -> bool {
        !matches!(self, Language::Html)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Tsx => "tsx",
            Language::Html => "html",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node of the generic source tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceNode {
    Element {
        id: NodeId,
        tag: String,
        children: Vec<SourceNode>,
    },
    Attribute {
        id: NodeId,
        name: String,
        children: Vec<SourceNode>,
    },
    TextLiteral {
        id: NodeId,
        value: String,
    },
    /// `quote` is `None` for unquoted HTML attribute values.
    StringLiteral {
        id: NodeId,
        quote: Option<char>,
        value: String,
    },
    /// Leaves carry `text`; inner nodes carry `children` and an empty `text`.
    Other {
        id: NodeId,
        kind: String,
        text: String,
        children: Vec<SourceNode>,
    },
}

/// Where a node sits while walking: the enclosing element tags (outermost
/// first) and the attribute being visited, if any.
#[derive(Debug, Default, Clone)]
pub struct Scope<'a> {
    pub elements: Vec<&'a str>,
    pub attribute: Option<&'a str>,
}

impl SourceNode {
    pub fn id(&self) -> NodeId {
        match self {
            SourceNode::Element { id, .. }
            | SourceNode::Attribute { id, .. }
            | SourceNode::TextLiteral { id, .. }
            | SourceNode::StringLiteral { id, .. }
            | SourceNode::Other { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            SourceNode::Element { .. } => "element",
            SourceNode::Attribute { .. } => "attribute",
            SourceNode::TextLiteral { .. } => "text",
            SourceNode::StringLiteral { .. } => "string",
            SourceNode::Other { kind, .. } => kind,
        }
    }

    pub fn children(&self) -> &[SourceNode] {
        match self {
            SourceNode::Element { children, .. }
            | SourceNode::Attribute { children, .. }
            | SourceNode::Other { children, .. } => children,
            SourceNode::TextLiteral { .. } | SourceNode::StringLiteral { .. } => &[],
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut Vec<SourceNode>> {
        match self {
            SourceNode::Element { children, .. }
            | SourceNode::Attribute { children, .. }
            | SourceNode::Other { children, .. } => Some(children),
            SourceNode::TextLiteral { .. } | SourceNode::StringLiteral { .. } => None,
        }
    }

    pub fn is_trivia(&self) -> bool {
        matches!(self, SourceNode::Other { kind, .. } if kind == TRIVIA_KIND)
    }

    /// A leaf `Other` node whose text is exactly `token`.
    pub fn is_token(&self, token: &str) -> bool {
        matches!(self, SourceNode::Other { text, children, .. } if children.is_empty() && text == token)
    }

    /// Compute the total number of nodes in this subtree.
    pub fn size(&self) -> usize {
        1 + self.children().iter().map(|c| c.size()).sum::<usize>()
    }

    /// Reconstruct source text.
    pub fn to_source(&self) -> String {
        let mut out = String::new();
        self.write_source(&mut out);
        out
    }

    fn write_source(&self, out: &mut String) {
        match self {
            SourceNode::TextLiteral { value, .. } => out.push_str(value),
            SourceNode::StringLiteral { quote, value, .. } => {
                if let Some(q) = quote {
                    out.push(*q);
                }
                out.push_str(value);
                if let Some(q) = quote {
                    out.push(*q);
                }
            }
            SourceNode::Other { text, children, .. } if children.is_empty() => out.push_str(text),
            SourceNode::Element { children, .. }
            | SourceNode::Attribute { children, .. }
            | SourceNode::Other { children, .. } => {
                for c in children {
                    c.write_source(out);
                }
            }
        }
    }

    /// Pre-order traversal. The visitor sees each node together with its
    /// scope; an element's own tag is not part of its scope.
    pub fn walk<'a, F>(&'a self, visit: &mut F)
    where
        F: FnMut(&'a SourceNode, &Scope<'a>),
    {
        let mut scope = Scope::default();
        self.walk_in(&mut scope, visit);
    }

    fn walk_in<'a, F>(&'a self, scope: &mut Scope<'a>, visit: &mut F)
    where
        F: FnMut(&'a SourceNode, &Scope<'a>),
    {
        visit(self, scope);
        match self {
            SourceNode::Element { tag, children, .. } => {
                scope.elements.push(tag);
                for c in children {
                    c.walk_in(scope, visit);
                }
                scope.elements.pop();
            }
            SourceNode::Attribute { name, children, .. } => {
                let outer = scope.attribute.replace(name);
                for c in children {
                    c.walk_in(scope, visit);
                }
                scope.attribute = outer;
            }
            SourceNode::Other { children, .. } => {
                for c in children {
                    c.walk_in(scope, visit);
                }
            }
            SourceNode::TextLiteral { .. } | SourceNode::StringLiteral { .. } => {}
        }
    }

    /// Depth-first search for the node with the given id.
    pub fn find_mut(&mut self, target: NodeId) -> Option<&mut SourceNode> {
        if self.id() == target {
            return Some(self);
        }
        self.children_mut()?
            .iter_mut()
            .find_map(|c| c.find_mut(target))
    }

    /// The children that make up an element's opening tag: the tag-head
    /// node's children for `<div ...>` forms, the element's own children for
    /// JSX self-closing elements.
    pub fn tag_head(&self) -> &[SourceNode] {
        let SourceNode::Element { children, .. } = self else {
            return &[];
        };
        match children.iter().find(|c| !c.is_trivia()) {
            Some(head @ SourceNode::Other { kind, .. }) if TAG_HEAD_KINDS.contains(&kind.as_str()) => {
                head.children()
            }
            _ => children,
        }
    }

    pub fn tag_head_mut(&mut self) -> Option<&mut Vec<SourceNode>> {
        let SourceNode::Element { children, .. } = self else {
            return None;
        };
        let head = children.iter().position(|c| {
            matches!(c, SourceNode::Other { kind, .. } if TAG_HEAD_KINDS.contains(&kind.as_str()))
        });
        let first_significant = children.iter().position(|c| !c.is_trivia());
        match head {
            Some(i) if Some(i) == first_significant => children[i].children_mut(),
            _ => Some(children),
        }
    }

    /// Attributes declared on this element's opening tag.
    pub fn attributes(&self) -> impl Iterator<Item = &SourceNode> {
        self.tag_head()
            .iter()
            .filter(|c| matches!(c, SourceNode::Attribute { .. }))
    }

    /// The value of an attribute: unquoted content for string values, raw
    /// source for expression values, `None` for boolean attributes.
    pub fn attribute_value(&self) -> Option<String> {
        let SourceNode::Attribute { children, .. } = self else {
            return None;
        };
        let node = &children[attribute_value_index(children)?];
        match node {
            SourceNode::StringLiteral { value, .. } => Some(value.clone()),
            other => Some(other.to_source()),
        }
    }

    /// Index in an opening tag's children where a new attribute belongs: just
    /// before the trailing whitespace and closing tokens.
    pub fn attribute_insert_index(head: &[SourceNode]) -> usize {
        let mut index = head.len();
        while index > 0 {
            let node = &head[index - 1];
            if node.is_trivia() || TAG_CLOSE_TOKENS.iter().any(|t| node.is_token(t)) {
                index -= 1;
            } else {
                break;
            }
        }
        index
    }
}

/// Position of an attribute's value among its children: the third
/// significant child when the second is `=`.
pub fn attribute_value_index(children: &[SourceNode]) -> Option<usize> {
    let significant: Vec<usize> = children
        .iter()
        .enumerate()
        .filter(|(_, c)| !c.is_trivia())
        .map(|(i, _)| i)
        .collect();
    match significant.as_slice() {
        [_, eq, value, ..] if children[*eq].is_token("=") => Some(*value),
        _ => None,
    }
}

impl fmt::Display for SourceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_source())
    }
}

/// A parsed source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTree {
    pub language: Language,
    pub root: SourceNode,
    pub(crate) next_id: NodeId,
}

impl SourceTree {
    pub fn new(language: Language, root: SourceNode, next_id: NodeId) -> Self {
        Self {
            language,
            root,
            next_id,
        }
    }

    pub fn to_source(&self) -> String {
        self.root.to_source()
    }

    pub fn size(&self) -> usize {
        self.root.size()
    }

    /// Allocate an id for a node created after parsing.
    pub fn fresh_id(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}
