//! Tree-sitter parser integration.
//!
//! Source text is parsed with the tree-sitter grammar for its language and
//! the concrete syntax tree is mapped onto [`SourceNode`]. Element, attribute
//! and literal nodes get their own variants; everything else becomes `Other`.
//! The bytes between sibling nodes (whitespace, mostly) are kept as trivia
//! leaves so the tree can be written back out unchanged.
//!
//! Input that tree-sitter can only parse with error recovery is rejected:
//! callers fall back to text diffs rather than patch a guessed tree.

use crate::types::{Language, NodeId, SourceNode, SourceTree, TRIVIA_KIND};

const ELEMENT_KINDS: &[&str] = &[
    "jsx_element",
    "jsx_self_closing_element",
    "element",
    "script_element",
    "style_element",
];
const ATTRIBUTE_KINDS: &[&str] = &["jsx_attribute", "attribute"];
const TEXT_KINDS: &[&str] = &["jsx_text", "text"];
const STRING_KINDS: &[&str] = &["string", "quoted_attribute_value", "attribute_value"];

/// Parse source into a tree, or `None` when it is not well-formed.
pub fn parse(source: &str, lang: Language) -> Option<SourceTree> {
    match parse_to_tree(source, lang) {
        Ok(tree) => Some(tree),
        Err(e) => {
            tracing::debug!(language = %lang, error = %e, "structured parse rejected input");
            None
        }
    }
}

/// Parse source into a tree, reporting why parsing failed.
pub fn parse_to_tree(source: &str, lang: Language) -> Result<SourceTree, ParseError> {
    let tree = parse_syntax(source, lang)?;
    let root = tree.root_node();

    let mut builder = TreeBuilder { source, next_id: 0 };
    let id = builder.fresh_id();
    let children = builder.convert_span(&root, 0, source.len());
    let root = SourceNode::Other {
        id,
        kind: root.kind().to_string(),
        text: String::new(),
        children,
    };
    Ok(SourceTree::new(lang, root, builder.next_id))
}

/// Parse source into the raw tree-sitter tree, rejecting error-recovered
/// parses.
pub(crate) fn parse_syntax(source: &str, lang: Language) -> Result<tree_sitter::Tree, ParseError> {
    let ts_lang = get_tree_sitter_language(lang);
    let mut parser = tree_sitter::Parser::new();
    parser
        .set_language(&ts_lang)
        .map_err(|e| ParseError::LanguageError(e.to_string()))?;

    let tree = parser.parse(source, None).ok_or(ParseError::ParseFailed)?;
    if tree.root_node().has_error() {
        let row = first_error(&tree.root_node()).map_or(0, |n| n.start_position().row);
        return Err(ParseError::Malformed { line: row + 1 });
    }
    Ok(tree)
}

struct TreeBuilder<'s> {
    source: &'s str,
    next_id: NodeId,
}

impl TreeBuilder<'_> {
    fn fresh_id(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn text(&self, start: usize, end: usize) -> String {
        self.source.get(start..end).unwrap_or("").to_string()
    }

    /// Recursively convert a tree-sitter node.
    fn convert(&mut self, node: &tree_sitter::Node) -> SourceNode {
        let kind = node.kind();
        let id = self.fresh_id();
        let raw = self.text(node.start_byte(), node.end_byte());

        if TEXT_KINDS.contains(&kind) {
            return SourceNode::TextLiteral { id, value: raw };
        }
        if STRING_KINDS.contains(&kind) {
            let (quote, value) = split_quotes(&raw);
            return SourceNode::StringLiteral { id, quote, value };
        }
        if node.child_count() == 0 {
            return SourceNode::Other {
                id,
                kind: kind.to_string(),
                text: raw,
                children: vec![],
            };
        }

        let children = self.convert_span(node, node.start_byte(), node.end_byte());
        if ELEMENT_KINDS.contains(&kind) {
            SourceNode::Element {
                id,
                tag: element_tag(node, self.source.as_bytes()),
                children,
            }
        } else if ATTRIBUTE_KINDS.contains(&kind) {
            SourceNode::Attribute {
                id,
                name: attribute_name(node, self.source.as_bytes()),
                children,
            }
        } else {
            SourceNode::Other {
                id,
                kind: kind.to_string(),
                text: String::new(),
                children,
            }
        }
    }

    /// Convert the children of `node`, filling the gaps inside `start..end`
    /// with trivia leaves.
    fn convert_span(&mut self, node: &tree_sitter::Node, start: usize, end: usize) -> Vec<SourceNode> {
        let mut children = Vec::new();
        let mut cursor = start;
        for child in (0..node.child_count()).filter_map(|i| node.child(i)) {
            self.push_gap(&mut children, cursor, child.start_byte());
            children.push(self.convert(&child));
            cursor = child.end_byte();
        }
        self.push_gap(&mut children, cursor, end);
        children
    }

    fn push_gap(&mut self, children: &mut Vec<SourceNode>, start: usize, end: usize) {
        if start >= end {
            return;
        }
        let id = self.fresh_id();
        children.push(SourceNode::Other {
            id,
            kind: TRIVIA_KIND.to_string(),
            text: self.text(start, end),
            children: vec![],
        });
    }
}

fn split_quotes(raw: &str) -> (Option<char>, String) {
    let mut chars = raw.chars();
    match (chars.next(), chars.next_back()) {
        (Some(open), Some(close)) if open == close && (open == '"' || open == '\'') => {
            (Some(open), raw[1..raw.len() - 1].to_string())
        }
        _ => (None, raw.to_string()),
    }
}

/// Tag name of an element: the `name` field of its opening tag in JSX, the
/// `tag_name` child of its start tag in HTML. Fragments have no name.
fn element_tag(node: &tree_sitter::Node, source: &[u8]) -> String {
    let head = match node.kind() {
        "jsx_self_closing_element" => Some(*node),
        _ => node.child(0),
    };
    head.and_then(|h| h.child_by_field_name("name").or_else(|| child_of_kind(&h, "tag_name")))
        .and_then(|n| n.utf8_text(source).ok())
        .unwrap_or("")
        .to_string()
}

fn attribute_name(node: &tree_sitter::Node, source: &[u8]) -> String {
    (0..node.child_count())
        .filter_map(|i| node.child(i))
        .find(|c| c.is_named())
        .and_then(|n| n.utf8_text(source).ok())
        .unwrap_or("")
        .to_string()
}

fn child_of_kind<'t>(node: &tree_sitter::Node<'t>, kind: &str) -> Option<tree_sitter::Node<'t>> {
    (0..node.child_count())
        .filter_map(|i| node.child(i))
        .find(|c| c.kind() == kind)
}

fn first_error<'t>(node: &tree_sitter::Node<'t>) -> Option<tree_sitter::Node<'t>> {
    if node.is_error() || node.is_missing() {
        return Some(*node);
    }
    (0..node.child_count())
        .filter_map(|i| node.child(i))
        .filter(|c| c.has_error())
        .find_map(|c| first_error(&c))
}

/// Get the tree-sitter Language object for a given language.
fn get_tree_sitter_language(lang: Language) -> tree_sitter::Language {
    let lang_ref = match lang {
        Language::JavaScript => tree_sitter_javascript::LANGUAGE,
        Language::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT,
        Language::Tsx => tree_sitter_typescript::LANGUAGE_TSX,
        Language::Html => tree_sitter_html::LANGUAGE,
    };
    lang_ref.into()
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("language error: {0}")]
    LanguageError(String),
    #[error("parse failed")]
    ParseFailed,
    #[error("syntax error near line {line}")]
    Malformed { line: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    const CARD: &str = r#"export function Card({ title }) {
  return (
    <div className="card">
      <h2>{title}</h2>
      <p>Welcome back</p>
      <Button variant="primary" disabled>Buy now</Button>
    </div>
  );
}
"#;

    fn texts(tree: &SourceTree) -> Vec<String> {
        let mut out = Vec::new();
        tree.root.walk(&mut |node, _| {
            if let SourceNode::TextLiteral { value, .. } = node {
                out.push(value.trim().to_string());
            }
        });
        out
    }

    #[test]
    fn test_parse_tsx_round_trips() {
        let tree = parse(CARD, Language::Tsx).unwrap();
        assert_eq!(tree.root.kind(), "program");
        assert_eq!(tree.to_source(), CARD);
    }

    #[test]
    fn test_tsx_elements_and_attributes() {
        let tree = parse(CARD, Language::Tsx).unwrap();
        let mut tags = Vec::new();
        let mut attrs = Vec::new();
        tree.root.walk(&mut |node, _| {
            if let SourceNode::Element { tag, .. } = node {
                tags.push(tag.clone());
                for attr in node.attributes() {
                    if let SourceNode::Attribute { name, .. } = attr {
                        attrs.push((name.clone(), attr.attribute_value()));
                    }
                }
            }
        });
        assert_eq!(tags, vec!["div", "h2", "p", "Button"]);
        assert_eq!(
            attrs,
            vec![
                ("className".to_string(), Some("card".to_string())),
                ("variant".to_string(), Some("primary".to_string())),
                ("disabled".to_string(), None),
            ]
        );
        assert!(texts(&tree).contains(&"Welcome back".to_string()));
    }

    #[test]
    fn test_parse_html() {
        let src = "<section class=\"hero\">\n  <h1>Summer sale</h1>\n  <a href=/shop>Shop now</a>\n</section>\n";
        let tree = parse(src, Language::Html).unwrap();
        assert_eq!(tree.to_source(), src);
        assert_eq!(texts(&tree), vec!["Summer sale", "Shop now"]);

        let mut unquoted = None;
        tree.root.walk(&mut |node, scope| {
            if let SourceNode::StringLiteral { quote: None, value, .. } = node {
                unquoted = Some((value.clone(), scope.attribute.map(str::to_string)));
            }
        });
        assert_eq!(unquoted, Some(("/shop".to_string(), Some("href".to_string()))));
    }

    #[test]
    fn test_plain_text_is_html_text() {
        let tree = parse("Hi {name}", Language::Html).unwrap();
        assert_eq!(texts(&tree), vec!["Hi {name}"]);
    }

    #[test]
    fn test_malformed_input_is_rejected() {
        assert!(parse("function ( {", Language::JavaScript).is_none());
        let err = parse_to_tree("const x = ;", Language::TypeScript).unwrap_err();
        assert!(matches!(err, ParseError::Malformed { line: 1 }));
    }

    #[test]
    fn test_split_quotes() {
        assert_eq!(split_quotes("\"a b\""), (Some('"'), "a b".to_string()));
        assert_eq!(split_quotes("'x'"), (Some('\''), "x".to_string()));
        assert_eq!(split_quotes("bare"), (None, "bare".to_string()));
        assert_eq!(split_quotes("\""), (None, "\"".to_string()));
    }
}
