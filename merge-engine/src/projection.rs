//! Browser projection of merged code.
//!
//! Merged output is handed to the browser in a form that cannot take the
//! host page down: script content runs inside a try/catch that reports to a
//! host hook, and HTML is fenced in a boundary element. Module syntax stays
//! at the top level: imports and re-exports are hoisted above the boundary
//! and local exports are re-bound from outside it. Alongside, a quick
//! regex scan pulls out the user-visible values (text, attribute values,
//! styles, component references) so the host can index or preview them
//! without parsing.

use std::fmt::Write;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::parser::parse_syntax;
use crate::types::Language;

/// Content scanned out of merged code, de-duplicated in order of first
/// appearance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extracted {
    pub text_values: Vec<String>,
    pub attribute_values: Vec<String>,
    pub style_blobs: Vec<String>,
    pub referenced_components: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Projection {
    /// `None` for plain-text files.
    pub wrapped: Option<String>,
    pub extracted: Extracted,
}

static TEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^=-])>\s*([^<>]*?[^<>\s])\s*<").unwrap());
static ATTRIBUTE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\s([A-Za-z_:][\w:.-]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|\{\s*["'`]([^"'`]*)["'`]\s*\})"#).unwrap()
});
static STYLE_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style[^>]*>(.*?)</style>").unwrap());
static STYLE_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\sstyle\s*=\s*(?:"([^"]*)"|'([^']*)'|\{\{(.*?)\}\})"#).unwrap()
});
static STYLED_TEMPLATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)(?:\bcss|\bstyled\.\w+|\bstyled\([^)]*\))`([^`]*)`").unwrap());
static COMPONENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([A-Z]\w*(?:\.\w+)*)").unwrap());

/// Wrap and scan merged code for the browser.
pub fn project(merged: &str, file_path: &str) -> Projection {
    let wrapped = match Language::detect(file_path, merged) {
        Some(Language::Html) => Some(wrap_markup(merged, file_path)),
        Some(lang) => Some(wrap_script(merged, file_path, lang)),
        None => None,
    };
    Projection {
        wrapped,
        extracted: extract(merged),
    }
}

/// Declarations that only exist for the type checker.
const TYPE_ONLY_KINDS: &[&str] = &[
    "interface_declaration",
    "type_alias_declaration",
    "function_signature",
    "ambient_declaration",
    "import_alias",
];

const NAMED_EXPRESSION_KINDS: &[&str] = &[
    "function_expression",
    "function",
    "generator_function",
    "class",
];

/// An export re-bound outside the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ModuleExport {
    exported: String,
    /// Local name assigned at the end of the body. `None` when the body
    /// assigns the binding itself (`export default <expr>`).
    local: Option<String>,
}

/// Top-level module syntax split from the executable body.
#[derive(Debug, Default)]
struct ModuleParts {
    hoisted: Vec<String>,
    body: String,
    exports: Vec<ModuleExport>,
}

fn export_binding(index: usize) -> String {
    format!("__overlay_export_{index}")
}

impl ModuleParts {
    fn plain(code: &str) -> Self {
        Self {
            body: code.to_string(),
            ..Default::default()
        }
    }

    fn split(code: &str, root: &tree_sitter::Node) -> Self {
        let mut parts = Self::default();
        let mut cursor = 0;
        for node in (0..root.named_child_count()).filter_map(|i| root.named_child(i)) {
            let replacement = match node.kind() {
                "import_statement" | "hash_bang_line" => {
                    parts.hoisted.push(node_text(code, &node).to_string());
                    String::new()
                }
                "export_statement" => parts.rewrite_export(code, &node),
                _ => continue,
            };
            parts.body.push_str(&code[cursor..node.start_byte()]);
            parts.body.push_str(&replacement);
            cursor = node.end_byte();
        }
        parts.body.push_str(&code[cursor..]);
        parts
    }

    /// Replace an export statement with what runs inside the boundary.
    fn rewrite_export(&mut self, code: &str, node: &tree_sitter::Node) -> String {
        let is_default = has_token(node, "default");
        let hoist = |parts: &mut Self| {
            parts.hoisted.push(node_text(code, node).to_string());
            String::new()
        };

        if node.child_by_field_name("source").is_some() || has_token(node, "type") {
            return hoist(self);
        }
        if let Some(value) = node.child_by_field_name("value") {
            // A named function or class keeps its module-scope binding.
            if let Some(name) = value
                .child_by_field_name("name")
                .filter(|_| NAMED_EXPRESSION_KINDS.contains(&value.kind()))
            {
                self.exports.push(ModuleExport {
                    exported: "default".to_string(),
                    local: Some(node_text(code, &name).to_string()),
                });
                return strip_tokens(code, node, &["export", "default"]);
            }
            let binding = export_binding(self.exports.len());
            self.exports.push(ModuleExport {
                exported: "default".to_string(),
                local: None,
            });
            return format!("{binding} = {};", node_text(code, &value));
        }
        if let Some(declaration) = node.child_by_field_name("declaration") {
            if TYPE_ONLY_KINDS.contains(&declaration.kind()) {
                return hoist(self);
            }
            let names = declared_names(code, &declaration);
            if names.is_empty() {
                return hoist(self);
            }
            for name in names {
                let exported = if is_default { "default".to_string() } else { name.clone() };
                self.exports.push(ModuleExport {
                    exported,
                    local: Some(name),
                });
            }
            return strip_tokens(code, node, &["export", "default"]);
        }
        let Some(clause) = child_of_kind(node, "export_clause") else {
            // `export = x` and `export as namespace X`
            return hoist(self);
        };
        for specifier in (0..clause.named_child_count()).filter_map(|i| clause.named_child(i)) {
            let Some(name) = specifier.child_by_field_name("name") else {
                continue;
            };
            let local = node_text(code, &name).to_string();
            let exported = specifier
                .child_by_field_name("alias")
                .map_or_else(|| local.clone(), |alias| node_text(code, &alias).to_string());
            self.exports.push(ModuleExport {
                exported,
                local: Some(local),
            });
        }
        String::new()
    }
}

/// Names bound by a declaration. Empty when it binds nothing nameable.
fn declared_names(code: &str, declaration: &tree_sitter::Node) -> Vec<String> {
    let mut names = Vec::new();
    match declaration.kind() {
        "lexical_declaration" | "variable_declaration" => {
            for declarator in (0..declaration.named_child_count()).filter_map(|i| declaration.named_child(i)) {
                if let Some(name) = declarator.child_by_field_name("name") {
                    binding_names(code, &name, &mut names);
                }
            }
        }
        _ => {
            if let Some(name) = declaration.child_by_field_name("name") {
                if name.kind() == "identifier" || name.kind() == "type_identifier" {
                    names.push(node_text(code, &name).to_string());
                }
            }
        }
    }
    names
}

fn binding_names(code: &str, pattern: &tree_sitter::Node, names: &mut Vec<String>) {
    match pattern.kind() {
        "identifier" | "shorthand_property_identifier_pattern" => {
            names.push(node_text(code, pattern).to_string());
        }
        "pair_pattern" => {
            if let Some(value) = pattern.child_by_field_name("value") {
                binding_names(code, &value, names);
            }
        }
        "assignment_pattern" | "object_assignment_pattern" => {
            if let Some(left) = pattern.child_by_field_name("left") {
                binding_names(code, &left, names);
            }
        }
        _ => {
            for child in (0..pattern.named_child_count()).filter_map(|i| pattern.named_child(i)) {
                binding_names(code, &child, names);
            }
        }
    }
}

fn node_text<'a>(code: &'a str, node: &tree_sitter::Node) -> &'a str {
    code.get(node.start_byte()..node.end_byte()).unwrap_or("")
}

fn has_token(node: &tree_sitter::Node, token: &str) -> bool {
    (0..node.child_count())
        .filter_map(|i| node.child(i))
        .any(|c| !c.is_named() && c.kind() == token)
}

fn child_of_kind<'t>(node: &tree_sitter::Node<'t>, kind: &str) -> Option<tree_sitter::Node<'t>> {
    (0..node.child_count())
        .filter_map(|i| node.child(i))
        .find(|c| c.kind() == kind)
}

/// Source of `node` with the given keyword tokens cut out, along with the
/// whitespace that follows them.
fn strip_tokens(code: &str, node: &tree_sitter::Node, tokens: &[&str]) -> String {
    let mut out = String::new();
    let mut cursor = node.start_byte();
    for child in (0..node.child_count()).filter_map(|i| node.child(i)) {
        if child.is_named() || !tokens.contains(&child.kind()) {
            continue;
        }
        out.push_str(&code[cursor..child.start_byte()]);
        cursor = child.end_byte();
        while code[cursor..node.end_byte()].starts_with(char::is_whitespace) {
            cursor += code[cursor..].chars().next().map_or(1, char::len_utf8);
        }
    }
    out.push_str(&code[cursor..node.end_byte()]);
    out
}

fn wrap_script(code: &str, file_path: &str, lang: Language) -> String {
    let file = serde_json::Value::String(file_path.to_string()).to_string();
    let parts = match parse_syntax(code, lang) {
        Ok(tree) => ModuleParts::split(code, &tree.root_node()),
        Err(e) => {
            tracing::debug!(file = %file_path, error = %e, "wrapping unparsed script as a plain body");
            ModuleParts::plain(code)
        }
    };

    let mut out = String::new();
    for statement in &parts.hoisted {
        out.push_str(statement);
        out.push('\n');
    }
    let bindings: Vec<String> = (0..parts.exports.len()).map(export_binding).collect();
    if !bindings.is_empty() {
        let _ = writeln!(out, "let {};", bindings.join(", "));
    }
    let _ = writeln!(out, "(function () {{\ntry {{\n{}", parts.body);
    for (binding, export) in bindings.iter().zip(&parts.exports) {
        if let Some(local) = &export.local {
            let _ = writeln!(out, "{binding} = {local};");
        }
    }
    let _ = write!(
        out,
        "}} catch (error) {{\n\
         var host = typeof window !== \"undefined\" && window.__overlayHost;\n\
         if (host && typeof host.report === \"function\") {{\n\
         host.report({{ file: {file}, error: error }});\n\
         }} else {{\n\
         console.error(\"overlay error in \" + {file}, error);\n\
         }}\n\
         }}\n\
         }})();\n"
    );
    if !bindings.is_empty() {
        let specifiers: Vec<String> = bindings
            .iter()
            .zip(&parts.exports)
            .map(|(binding, export)| format!("{binding} as {}", export.exported))
            .collect();
        let _ = writeln!(out, "export {{ {} }};", specifiers.join(", "));
    }
    out
}

fn wrap_markup(code: &str, file_path: &str) -> String {
    format!(
        "<div data-overlay-boundary=\"{}\">\n{code}\n</div>\n",
        escape_attribute(file_path)
    )
}

fn escape_attribute(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Regex scan of merged code. Not a parse: values inside comments or
/// strings that happen to look like markup are picked up too.
pub fn extract(code: &str) -> Extracted {
    let mut out = Extracted::default();

    let markup = STYLE_TAG_RE.replace_all(code, "");
    for cap in TEXT_RE.captures_iter(&markup) {
        let value = &cap[1];
        // A lone `{expr}` is code, not text.
        if value.starts_with('{') && value.ends_with('}') {
            continue;
        }
        push_unique(&mut out.text_values, value);
    }

    for cap in ATTRIBUTE_RE.captures_iter(code) {
        if cap[1].eq_ignore_ascii_case("style") {
            continue;
        }
        if let Some(value) = cap.get(2).or_else(|| cap.get(3)).or_else(|| cap.get(4)) {
            push_unique(&mut out.attribute_values, value.as_str());
        }
    }

    for cap in STYLE_TAG_RE.captures_iter(code) {
        push_unique(&mut out.style_blobs, cap[1].trim());
    }
    for cap in STYLE_ATTR_RE.captures_iter(code) {
        if let Some(value) = cap.get(1).or_else(|| cap.get(2)).or_else(|| cap.get(3)) {
            push_unique(&mut out.style_blobs, value.as_str().trim());
        }
    }
    for cap in STYLED_TEMPLATE_RE.captures_iter(code) {
        push_unique(&mut out.style_blobs, cap[1].trim());
    }

    for cap in COMPONENT_RE.captures_iter(code) {
        push_unique(&mut out.referenced_components, &cap[1]);
    }

    out
}

fn push_unique(values: &mut Vec<String>, value: &str) {
    if value.is_empty() || values.iter().any(|v| v == value) {
        return;
    }
    values.push(value.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    const CARD: &str = r#"import styled from "styled-components";

const Title = styled.h2`
  color: tomato;
`;

export const Card = ({ name }) => (
  <div className="card" style={{ padding: 8 }}>
    <Title>Welcome back</Title>
    <p>{name}</p>
    <Button variant="primary" label={"Buy"}>Buy now</Button>
    <Button variant="primary">Buy now</Button>
  </div>
);
"#;

    #[test]
    fn test_extracts_values_in_order() {
        let extracted = extract(CARD);
        assert_eq!(extracted.text_values, vec!["Welcome back", "Buy now"]);
        assert_eq!(extracted.attribute_values, vec!["card", "primary", "Buy"]);
        assert_eq!(extracted.referenced_components, vec!["Title", "Button"]);
        assert_eq!(extracted.style_blobs, vec!["padding: 8", "color: tomato;"]);
    }

    #[test]
    fn test_html_styles() {
        let html = "<style>\n  .hero { color: red; }\n</style>\n<section class=\"hero\" style=\"margin: 0\">Hi</section>\n";
        let extracted = extract(html);
        assert_eq!(extracted.style_blobs, vec![".hero { color: red; }", "margin: 0"]);
        assert_eq!(extracted.attribute_values, vec!["hero"]);
        assert_eq!(extracted.text_values, vec!["Hi"]);
    }

    #[test]
    fn test_script_is_wrapped_in_boundary() {
        let projection = project("render();", "src/widget.js");
        let wrapped = projection.wrapped.unwrap();
        assert!(wrapped.starts_with("(function () {\ntry {\nrender();\n} catch (error) {"));
        assert!(wrapped.contains("host.report({ file: \"src/widget.js\", error: error });"));
    }

    #[test]
    fn test_script_path_is_escaped() {
        let wrapped = project("x();", "we\"ird.ts").wrapped.unwrap();
        assert!(wrapped.contains(r#"file: "we\"ird.ts""#));
    }

    /// Module syntax is only legal at the top level of a module.
    fn assert_module_syntax_is_top_level(wrapped: &str, lang: Language) {
        let tree = parse_syntax(wrapped, lang).unwrap();
        let mut stack = vec![tree.root_node()];
        while let Some(node) = stack.pop() {
            if matches!(node.kind(), "import_statement" | "export_statement") {
                assert_eq!(
                    node.parent().map(|p| p.kind()),
                    Some("program"),
                    "nested module syntax in:\n{wrapped}"
                );
            }
            stack.extend((0..node.named_child_count()).filter_map(|i| node.named_child(i)));
        }
    }

    #[test]
    fn test_module_imports_and_exports_stay_outside_boundary() {
        let wrapped = project(CARD, "src/Card.jsx").wrapped.unwrap();
        assert_module_syntax_is_top_level(&wrapped, Language::JavaScript);
        assert!(wrapped.starts_with(
            "import styled from \"styled-components\";\nlet __overlay_export_0;\n(function () {\ntry {\n"
        ));
        assert!(wrapped.contains("\nconst Card = ({ name }) => ("));
        assert!(wrapped.contains("__overlay_export_0 = Card;\n} catch (error) {"));
        assert!(wrapped.ends_with("})();\nexport { __overlay_export_0 as Card };\n"));
    }

    #[test]
    fn test_default_export_is_rebound() {
        let source = "import React from \"react\";\nexport default function Card() {\n  return <p>Hi</p>;\n}\n";
        let wrapped = project(source, "Card.js").wrapped.unwrap();
        assert_module_syntax_is_top_level(&wrapped, Language::JavaScript);
        assert!(wrapped.starts_with("import React from \"react\";\n"));
        assert!(wrapped.contains("\nfunction Card() {\n  return <p>Hi</p>;\n}"));
        assert!(!wrapped.contains("export default"));
        assert!(wrapped.contains("__overlay_export_0 = Card;\n"));
        assert!(wrapped.ends_with("export { __overlay_export_0 as default };\n"));
    }

    #[test]
    fn test_typescript_module_forms() {
        let source = r#"import type { ReactNode } from "react";
export * from "./theme";
export interface Props { title: string }
const helper = (s: string) => s.trim();
export const { a, b: renamed } = config;
function Card(props: Props) { return <h1>{helper(props.title)}</h1>; }
export { helper as format, Card };
export default { name: "card" };
"#;
        let wrapped = project(source, "Card.tsx").wrapped.unwrap();
        assert_module_syntax_is_top_level(&wrapped, Language::Tsx);
        assert!(wrapped.starts_with(
            "import type { ReactNode } from \"react\";\nexport * from \"./theme\";\nexport interface Props { title: string }\n"
        ));
        assert!(wrapped.contains("\nconst { a, b: renamed } = config;\n"));
        assert!(wrapped.contains("__overlay_export_4 = { name: \"card\" };"));
        assert!(wrapped.contains("__overlay_export_2 = helper;\n__overlay_export_3 = Card;\n"));
        assert!(wrapped.ends_with(
            "export { __overlay_export_0 as a, __overlay_export_1 as renamed, \
             __overlay_export_2 as format, __overlay_export_3 as Card, \
             __overlay_export_4 as default };\n"
        ));
    }

    #[test]
    fn test_unparsable_script_is_wrapped_whole() {
        let wrapped = project("import x from;\nrun(", "broken.js").wrapped.unwrap();
        assert!(wrapped.starts_with("(function () {\ntry {\nimport x from;\nrun(\n} catch"));
    }

    #[test]
    fn test_html_is_wrapped_in_boundary_element() {
        let projection = project("<p>Hi</p>", "pages/a&b.html");
        assert_eq!(
            projection.wrapped.as_deref(),
            Some("<div data-overlay-boundary=\"pages/a&amp;b.html\">\n<p>Hi</p>\n</div>\n")
        );
        assert_eq!(projection.extracted.text_values, vec!["Hi"]);
    }

    #[test]
    fn test_plain_text_is_not_wrapped() {
        assert_eq!(project("Hello", "notes.txt").wrapped, None);
    }
}
