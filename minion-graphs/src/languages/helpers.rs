use tree_sitter::Node;

use crate::{Definition, SymbolKind};

/// Extract the source text for a tree-sitter node.
pub fn node_text<'a>(node: Node<'_>, source: &'a str) -> &'a str {
    &source[node.byte_range()]
}

/// Find the first child with a specific kind.
pub fn find_child_by_kind<'a>(node: Node<'a>, kind: &str) -> Option<Node<'a>> {
    let mut cursor = node.walk();
    node.children(&mut cursor)
        .find(|child| child.kind() == kind)
}

/// Find a child by field name.
pub fn child_by_field<'a>(node: Node<'a>, field: &str) -> Option<Node<'a>> {
    node.child_by_field_name(field)
}

/// Text of the `name` field, if present.
pub fn field_name_text(node: Node<'_>, source: &str) -> Option<String> {
    child_by_field(node, "name").map(|n| node_text(n, source).to_string())
}

/// Strip quotes from a string literal node's text.
pub fn unquote(text: &str) -> &str {
    text.trim_matches(|c| c == '"' || c == '\'' || c == '`')
}

/// Push a definition unless the same name was already recorded.
pub fn push_definition(defs: &mut Vec<Definition>, name: String, kind: SymbolKind) {
    if name.is_empty() || defs.iter().any(|d| d.name == name) {
        return;
    }
    defs.push(Definition { name, kind });
}
