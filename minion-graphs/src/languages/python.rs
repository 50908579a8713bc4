use std::path::Path;

use crate::{FileId, FileSummary, ImportSpec, Result, SymbolKind};

use super::helpers::{child_by_field, field_name_text, node_text, push_definition};
use super::{FileIndex, LanguageSupport, in_dir, join_relative, parent_dir};

/// Roots tried, in order, for absolute imports.
const SOURCE_ROOTS: &[&str] = &["", "src", "lib"];

#[derive(Debug)]
pub struct PythonSupport;

impl LanguageSupport for PythonSupport {
    fn id(&self) -> &'static str {
        "python"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["py", "pyi"]
    }

    fn tree_sitter_language(&self) -> tree_sitter::Language {
        tree_sitter_python::LANGUAGE.into()
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
            collect_definition(child, source, &mut summary);
        }
        collect_imports(root, source, &mut summary.imports);
        Ok(summary)
    }

    fn resolve_import(
        &self,
        import: &ImportSpec,
        from: &FileId,
        index: &FileIndex,
    ) -> Vec<FileId> {
        let level = import.module.chars().take_while(|c| *c == '.').count();
        let dotted = &import.module[level..];
        let segments: Vec<&str> = dotted.split('.').filter(|s| !s.is_empty()).collect();

        let bases: Vec<String> = if level > 0 {
            // `.` is the importer's package, each extra dot climbs one level.
            let mut base = from.dir();
            for _ in 1..level {
                match parent_dir(base) {
                    Some(parent) => base = parent,
                    None => return Vec::new(),
                }
            }
            vec![base.to_string()]
        } else {
            let mut roots: Vec<String> = SOURCE_ROOTS.iter().map(|r| (*r).to_string()).collect();
            if !from.dir().is_empty() {
                roots.push(from.dir().to_string());
            }
            roots
        };

        let mut found = Vec::new();
        for base in &bases {
            let module_dir = segments
                .iter()
                .fold(base.clone(), |acc, seg| in_dir(&acc, seg));

            // `from pkg import sub` may name submodules.
            for name in &import.names {
                if let Some(hit) = module_file(index, &in_dir(&module_dir, name)) {
                    push_unique(&mut found, hit);
                }
            }

            if segments.is_empty() {
                if let Some(hit) = index.get(&in_dir(base, "__init__.py")) {
                    if found.is_empty() {
                        push_unique(&mut found, hit);
                    }
                }
            } else {
                // Longest existing module prefix: `import a.b.c` where `c` is
                // an attribute still lands on `a/b.py`.
                for len in (1..=segments.len()).rev() {
                    let candidate = segments[..len]
                        .iter()
                        .fold(base.clone(), |acc, seg| in_dir(&acc, seg));
                    if let Some(hit) = module_file(index, &candidate) {
                        push_unique(&mut found, hit);
                        break;
                    }
                }
            }

            if !found.is_empty() {
                break;
            }
        }
        found
    }

    fn may_be_local(&self, import: &ImportSpec, index: &FileIndex) -> bool {
        let module = import.module.trim_start_matches('.');
        if import.module.starts_with('.') {
            return true;
        }
        let first = module.split('.').next().unwrap_or(module);
        index.has_top_level(first)
    }
}

fn module_file(index: &FileIndex, base: &str) -> Option<FileId> {
    index
        .get(&format!("{base}.py"))
        .or_else(|| index.get(&format!("{base}.pyi")))
        .or_else(|| index.get(&in_dir(base, "__init__.py")))
}

fn push_unique(found: &mut Vec<FileId>, id: FileId) {
    if !found.contains(&id) {
        found.push(id);
    }
}

fn collect_definition(node: tree_sitter::Node<'_>, source: &str, summary: &mut FileSummary) {
    match node.kind() {
        "function_definition" => {
            if let Some(name) = field_name_text(node, source) {
                push_definition(&mut summary.definitions, name, SymbolKind::Function);
            }
        }
        "class_definition" => {
            if let Some(name) = field_name_text(node, source) {
                push_definition(&mut summary.definitions, name, SymbolKind::Type);
            }
        }
        "decorated_definition" => {
            if let Some(inner) = child_by_field(node, "definition") {
                collect_definition(inner, source, summary);
            }
        }
        "expression_statement" => {
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                if child.kind() != "assignment" {
                    continue;
                }
                if let Some(left) = child_by_field(child, "left") {
                    if left.kind() == "identifier" {
                        let name = node_text(left, source).to_string();
                        let kind = if name.chars().all(|c| c.is_ascii_uppercase() || c == '_') {
                            SymbolKind::Constant
                        } else {
                            SymbolKind::Variable
                        };
                        push_definition(&mut summary.definitions, name, kind);
                    }
                }
            }
        }
        _ => {}
    }
}

/// Imports may sit inside `if TYPE_CHECKING:` or `try:` blocks, so walk
/// the whole tree rather than only module-level statements.
fn collect_imports(node: tree_sitter::Node<'_>, source: &str, imports: &mut Vec<ImportSpec>) {
    match node.kind() {
        "import_statement" => {
            let mut cursor = node.walk();
            for child in node.children_by_field_name("name", &mut cursor) {
                if let Some(module) = dotted_of(child, source) {
                    imports.push(ImportSpec::module(module));
                }
            }
            return;
        }
        "import_from_statement" => {
            let Some(module_node) = child_by_field(node, "module_name") else {
                return;
            };
            let module = node_text(module_node, source).replace(char::is_whitespace, "");
            let mut names = Vec::new();
            let mut cursor = node.walk();
            for child in node.children_by_field_name("name", &mut cursor) {
                if let Some(name) = dotted_of(child, source) {
                    names.push(name);
                }
            }
            imports.push(ImportSpec::with_names(module, names));
            return;
        }
        "function_definition" | "class_definition" => {
            // Local imports inside bodies still count as dependencies.
        }
        _ => {}
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_imports(child, source, imports);
    }
}

/// Module text of a `dotted_name` or the original name of an `aliased_import`.
fn dotted_of(node: tree_sitter::Node<'_>, source: &str) -> Option<String> {
    match node.kind() {
        "dotted_name" => Some(node_text(node, source).to_string()),
        "aliased_import" => child_by_field(node, "name").map(|n| node_text(n, source).to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summarize(source: &str) -> FileSummary {
        super::super::summarize_source(&PythonSupport, source, Path::new("m.py")).unwrap()
    }

    #[test]
    fn extracts_top_level_definitions() {
        let source = r#"
import os

MAX_SIZE = 10
counter = 0

def hello():
    """Says hello."""
    def inner():
        pass

class Greeter:
    def greet(self):
        pass

@cached
def decorated():
    pass
"#;
        let summary = summarize(source);
        let names: Vec<&str> = summary.definitions.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["MAX_SIZE", "counter", "hello", "Greeter", "decorated"]);
        assert_eq!(summary.definitions[0].kind, SymbolKind::Constant);
        assert_eq!(summary.definitions[3].kind, SymbolKind::Type);
    }

    #[test]
    fn extracts_imports() {
        let source = r"
import os, pkg.util as u
from .models import User, Order as O
from .. import shared
from app.core import (engine, config)

def late():
    import json
";
        let summary = summarize(source);
        let modules: Vec<&str> = summary.imports.iter().map(|i| i.module.as_str()).collect();
        assert_eq!(modules, vec!["os", "pkg.util", ".models", "..", "app.core", "json"]);
        assert_eq!(summary.imports[2].names, vec!["User", "Order"]);
        assert_eq!(summary.imports[3].names, vec!["shared"]);
        assert_eq!(summary.imports[4].names, vec!["engine", "config"]);
    }

    #[test]
    fn syntax_errors_are_reported() {
        let result =
            super::super::summarize_source(&PythonSupport, "def broken(:\n", Path::new("b.py"));
        assert!(matches!(result, Err(crate::GraphError::Parse { .. })));
    }

    fn index(paths: &[&str]) -> (Vec<FileId>, FileIndex) {
        let ids: Vec<FileId> = paths.iter().map(|p| FileId::new(*p)).collect();
        let index = FileIndex::new(&ids);
        (ids, index)
    }

    #[test]
    fn resolves_absolute_and_package_imports() {
        let (_, index) = index(&[
            "app/__init__.py",
            "app/core.py",
            "app/models/__init__.py",
            "app/models/user.py",
            "tests/test_core.py",
        ]);
        let from = FileId::new("tests/test_core.py");

        let hits = PythonSupport.resolve_import(&ImportSpec::module("app.core"), &from, &index);
        assert_eq!(hits, vec![FileId::new("app/core.py")]);

        let hits = PythonSupport.resolve_import(
            &ImportSpec::with_names("app.models", vec!["user".into()]),
            &from,
            &index,
        );
        assert_eq!(
            hits,
            vec![FileId::new("app/models/user.py"), FileId::new("app/models/__init__.py")]
        );

        // Attribute access past the module still lands on the module.
        let hits =
            PythonSupport.resolve_import(&ImportSpec::module("app.core.Engine"), &from, &index);
        assert_eq!(hits, vec![FileId::new("app/core.py")]);
    }

    #[test]
    fn resolves_relative_imports() {
        let (_, index) = index(&["pkg/a.py", "pkg/sub/b.py", "pkg/sub/__init__.py"]);
        let from = FileId::new("pkg/sub/b.py");

        let hits = PythonSupport.resolve_import(
            &ImportSpec::with_names("..", vec!["a".into()]),
            &from,
            &index,
        );
        assert_eq!(hits, vec![FileId::new("pkg/a.py")]);

        let hits = PythonSupport.resolve_import(&ImportSpec::module("."), &from, &index);
        assert_eq!(hits, vec![FileId::new("pkg/sub/__init__.py")]);
    }

    #[test]
    fn stdlib_imports_are_not_local() {
        let (_, index) = index(&["app/core.py"]);
        assert!(!PythonSupport.may_be_local(&ImportSpec::module("os.path"), &index));
        assert!(PythonSupport.may_be_local(&ImportSpec::module("app.missing"), &index));
    }
}
