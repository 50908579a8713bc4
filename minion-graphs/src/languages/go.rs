use std::path::Path;

use crate::{FileId, FileSummary, ImportSpec, Result, SymbolKind};

use super::helpers::{child_by_field, node_text, push_definition, unquote};
use super::{FileIndex, LanguageSupport};

#[derive(Debug)]
pub struct GoSupport;

impl LanguageSupport for GoSupport {
    fn id(&self) -> &'static str {
        "go"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["go"]
    }

    fn tree_sitter_language(&self) -> tree_sitter::Language {
        tree_sitter_go::LANGUAGE.into()
    }

    fn summarize(
        &self,
        tree: &tree_sitter::Tree,
        source: &str,
        _path: &Path,
    ) -> Result<FileSummary> {
        let mut summary = FileSummary::default();
        let root = tree.root_node();
        let mut cursor = root.walk();
        for child in root.children(&mut cursor) {
            match child.kind() {
                "function_declaration" | "method_declaration" => {
                    if let Some(name) = child_by_field(child, "name") {
                        push_definition(
                            &mut summary.definitions,
                            node_text(name, source).to_string(),
                            SymbolKind::Function,
                        );
                    }
                }
                "type_declaration" | "const_declaration" | "var_declaration" => {
                    let kind = match child.kind() {
                        "type_declaration" => SymbolKind::Type,
                        "const_declaration" => SymbolKind::Constant,
                        _ => SymbolKind::Variable,
                    };
                    collect_spec_names(child, source, kind, &mut summary);
                }
                "import_declaration" => collect_import_paths(child, source, &mut summary.imports),
                _ => {}
            }
        }
        Ok(summary)
    }

    /// Import paths name a package directory; the longest directory of the
    /// snapshot that is a suffix of the path wins.
    fn resolve_import(
        &self,
        import: &ImportSpec,
        _from: &FileId,
        index: &FileIndex,
    ) -> Vec<FileId> {
        let path = import.module.as_str();
        let best = index
            .dirs()
            .filter(|dir| !dir.is_empty())
            .filter(|dir| path == *dir || path.ends_with(&format!("/{dir}")))
            .max_by_key(|dir| dir.len());
        let Some(dir) = best else {
            return Vec::new();
        };
        package_files(index, dir)
    }

    fn may_be_local(&self, _import: &ImportSpec, _index: &FileIndex) -> bool {
        false
    }

    /// `_test.go` files see every declaration of their package.
    fn implicit_dependencies(&self, file: &FileId, index: &FileIndex) -> Vec<FileId> {
        if !file.file_name().ends_with("_test.go") {
            return Vec::new();
        }
        package_files(index, file.dir())
    }
}

fn package_files(index: &FileIndex, dir: &str) -> Vec<FileId> {
    index
        .files_in_dir(dir)
        .iter()
        .filter(|f| f.extension() == Some("go") && !f.file_name().ends_with("_test.go"))
        .cloned()
        .collect()
}

fn collect_spec_names(
    node: tree_sitter::Node<'_>,
    source: &str,
    kind: SymbolKind,
    summary: &mut FileSummary,
) {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        match child.kind() {
            "type_spec" | "type_alias" => {
                if let Some(name) = child_by_field(child, "name") {
                    push_definition(
                        &mut summary.definitions,
                        node_text(name, source).to_string(),
                        kind,
                    );
                }
            }
            "const_spec" | "var_spec" => {
                let mut inner = child.walk();
                for name in child.children_by_field_name("name", &mut inner) {
                    push_definition(
                        &mut summary.definitions,
                        node_text(name, source).to_string(),
                        kind,
                    );
                }
            }
            "var_spec_list" => collect_spec_names(child, source, kind, summary),
            _ => {}
        }
    }
}

fn collect_import_paths(node: tree_sitter::Node<'_>, source: &str, imports: &mut Vec<ImportSpec>) {
    if node.kind() == "import_spec" {
        if let Some(path) = child_by_field(node, "path") {
            imports.push(ImportSpec::module(unquote(node_text(path, source))));
        }
        return;
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_import_paths(child, source, imports);
    }
}
