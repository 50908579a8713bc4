// Shared summary and resolution rules for JavaScript and TypeScript.

use crate::{FileId, FileSummary, ImportSpec, SymbolKind};

use super::helpers::{child_by_field, field_name_text, node_text, push_definition, unquote};
use super::{FileIndex, join_relative};

const PROBE_EXTENSIONS: &[&str] = &["ts", "tsx", "d.ts", "js", "jsx", "mjs", "cjs"];

pub fn summarize(tree: &tree_sitter::Tree, source: &str) -> FileSummary {
    let mut summary = FileSummary::default();
    let root = tree.root_node();
    let mut cursor = root.walk();
    for child in root.children(&mut cursor) {
        collect_declaration(child, source, &mut summary);
    }
    collect_imports(root, source, &mut summary.imports);
    summary
}

fn collect_declaration(node: tree_sitter::Node<'_>, source: &str, summary: &mut FileSummary) {
    let kind = match node.kind() {
        "export_statement" => {
            if let Some(decl) = child_by_field(node, "declaration") {
                collect_declaration(decl, source, summary);
            }
            return;
        }
        "function_declaration" | "generator_function_declaration" => SymbolKind::Function,
        "class_declaration"
        | "abstract_class_declaration"
        | "interface_declaration"
        | "type_alias_declaration"
        | "enum_declaration" => SymbolKind::Type,
        "lexical_declaration" | "variable_declaration" => {
            let mut cursor = node.walk();
            for declarator in node.children(&mut cursor) {
                if declarator.kind() != "variable_declarator" {
                    continue;
                }
                if let Some(name) = child_by_field(declarator, "name") {
                    if name.kind() == "identifier" {
                        push_definition(
                            &mut summary.definitions,
                            node_text(name, source).to_string(),
                            SymbolKind::Variable,
                        );
                    }
                }
            }
            return;
        }
        _ => return,
    };
    if let Some(name) = field_name_text(node, source) {
        push_definition(&mut summary.definitions, name, kind);
    }
}

fn collect_imports(node: tree_sitter::Node<'_>, source: &str, imports: &mut Vec<ImportSpec>) {
    match node.kind() {
        "import_statement" => {
            if let Some(src) = child_by_field(node, "source") {
                let module = unquote(node_text(src, source)).to_string();
                imports.push(ImportSpec::with_names(module, imported_names(node, source)));
            }
            return;
        }
        "export_statement" => {
            if let Some(src) = child_by_field(node, "source") {
                let module = unquote(node_text(src, source)).to_string();
                imports.push(ImportSpec::module(module));
                return;
            }
        }
        "call_expression" => {
            if let Some(spec) = require_call(node, source) {
                imports.push(spec);
            }
        }
        _ => {}
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_imports(child, source, imports);
    }
}

/// `require("./x")` and `import("./x")` with a literal argument.
fn require_call(node: tree_sitter::Node<'_>, source: &str) -> Option<ImportSpec> {
    let func = child_by_field(node, "function")?;
    let callee = node_text(func, source);
    if callee != "require" && func.kind() != "import" {
        return None;
    }
    let args = child_by_field(node, "arguments")?;
    let first = args.named_child(0)?;
    if first.kind() != "string" {
        return None;
    }
    Some(ImportSpec::module(unquote(node_text(first, source))))
}

fn imported_names(import: tree_sitter::Node<'_>, source: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut stack = vec![import];
    while let Some(node) = stack.pop() {
        match node.kind() {
            "import_specifier" => {
                if let Some(name) = child_by_field(node, "name") {
                    names.push(node_text(name, source).to_string());
                }
                continue;
            }
            "string" => continue,
            _ => {}
        }
        let mut cursor = node.walk();
        let children: Vec<_> = node.children(&mut cursor).collect();
        stack.extend(children.into_iter().rev());
    }
    names
}

pub fn is_relative(module: &str) -> bool {
    module.starts_with("./") || module.starts_with("../") || module == "." || module == ".."
}

pub fn resolve(import: &ImportSpec, from: &FileId, index: &FileIndex) -> Vec<FileId> {
    if !is_relative(&import.module) {
        return Vec::new();
    }
    let Some(target) = join_relative(from.dir(), &import.module) else {
        return Vec::new();
    };
    probe(index, &target).into_iter().collect()
}

fn probe(index: &FileIndex, target: &str) -> Option<FileId> {
    if let Some(hit) = index.get(target) {
        return Some(hit);
    }
    // TypeScript sources are imported with their emitted `.js` name.
    if let Some(stem) = target.strip_suffix(".js") {
        for ext in ["ts", "tsx"] {
            if let Some(hit) = index.get(&format!("{stem}.{ext}")) {
                return Some(hit);
            }
        }
    }
    PROBE_EXTENSIONS
        .iter()
        .find_map(|ext| index.get(&format!("{target}.{ext}")))
        .or_else(|| {
            PROBE_EXTENSIONS
                .iter()
                .find_map(|ext| index.get(&format!("{target}/index.{ext}")))
        })
}
