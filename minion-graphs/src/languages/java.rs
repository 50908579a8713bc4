use std::path::Path;

use crate::{FileId, FileSummary, ImportSpec, Result, SymbolKind};

use super::helpers::{field_name_text, node_text, push_definition};
use super::{FileIndex, LanguageSupport};

const EXTERNAL_PREFIXES: &[&str] = &["java.", "javax.", "jdk.", "sun.", "kotlin."];

#[derive(Debug)]
pub struct JavaSupport;

impl LanguageSupport for JavaSupport {
    fn id(&self) -> &'static str {
        "java"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["java"]
    }

    fn tree_sitter_language(&self) -> tree_sitter::Language {
        tree_sitter_java::LANGUAGE.into()
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
                "class_declaration"
                | "interface_declaration"
                | "enum_declaration"
                | "record_declaration"
                | "annotation_type_declaration" => {
                    if let Some(name) = field_name_text(child, source) {
                        push_definition(&mut summary.definitions, name, SymbolKind::Type);
                    }
                }
                "import_declaration" => {
                    if let Some(spec) = parse_import(node_text(child, source)) {
                        summary.imports.push(spec);
                    }
                }
                _ => {}
            }
        }
        Ok(summary)
    }

    fn resolve_import(
        &self,
        import: &ImportSpec,
        _from: &FileId,
        index: &FileIndex,
    ) -> Vec<FileId> {
        if let Some(package) = import.module.strip_suffix(".*") {
            let dir_suffix = package.replace('.', "/");
            let mut hits: Vec<FileId> = index
                .dirs()
                .filter(|dir| *dir == dir_suffix || dir.ends_with(&format!("/{dir_suffix}")))
                .flat_map(|dir| index.files_in_dir(dir).iter().cloned())
                .filter(|f| f.extension() == Some("java"))
                .collect();
            hits.sort();
            return hits;
        }
        index.files_with_suffix(&format!("{}.java", import.module.replace('.', "/")))
    }

    fn may_be_local(&self, import: &ImportSpec, _index: &FileIndex) -> bool {
        !EXTERNAL_PREFIXES.iter().any(|p| import.module.starts_with(p))
    }

    /// `FooTest` exercises `Foo` from the same package without importing it.
    fn implicit_dependencies(&self, file: &FileId, index: &FileIndex) -> Vec<FileId> {
        let stem = file.stem();
        let Some(subject) = stem.strip_suffix("Tests").or_else(|| stem.strip_suffix("Test")) else {
            return Vec::new();
        };
        if subject.is_empty() {
            return Vec::new();
        }
        index
            .files_with_suffix(&format!("{subject}.java"))
            .into_iter()
            .filter(|f| f != file)
            .collect()
    }
}

/// `import static a.b.C.member;` depends on `a.b.C`; wildcards keep `.*`.
fn parse_import(text: &str) -> Option<ImportSpec> {
    let body = text.trim().strip_prefix("import")?.trim().trim_end_matches(';').trim();
    let (is_static, path) = match body.strip_prefix("static") {
        Some(rest) => (true, rest.trim()),
        None => (false, body),
    };
    let path: String = path.chars().filter(|c| !c.is_whitespace()).collect();
    if path.is_empty() {
        return None;
    }
    if !is_static {
        return Some(ImportSpec::module(path));
    }
    let type_path = path.strip_suffix(".*").unwrap_or(&path);
    let type_path = if path.ends_with(".*") {
        type_path
    } else {
        type_path.rsplit_once('.').map_or(type_path, |(owner, _)| owner)
    };
    Some(ImportSpec::module(type_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_types_and_imports() {
        let source = r"
package com.acme.orders;

import java.util.List;
import com.acme.billing.Invoice;
import com.acme.shared.*;
import static com.acme.util.Strings.isBlank;

public class OrderService {}
interface Repository {}
";
        let summary = super::super::summarize_source(
            &JavaSupport,
            source,
            Path::new("src/main/java/com/acme/orders/OrderService.java"),
        )
        .unwrap();
        let names: Vec<&str> = summary.definitions.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["OrderService", "Repository"]);
        let modules: Vec<&str> = summary.imports.iter().map(|i| i.module.as_str()).collect();
        assert_eq!(
            modules,
            vec![
                "java.util.List",
                "com.acme.billing.Invoice",
                "com.acme.shared.*",
                "com.acme.util.Strings",
            ]
        );
    }

    #[test]
    fn resolves_types_packages_and_test_subjects() {
        let ids: Vec<FileId> = [
            "src/main/java/com/acme/billing/Invoice.java",
            "src/main/java/com/acme/shared/Money.java",
            "src/main/java/com/acme/shared/Currency.java",
            "src/test/java/com/acme/billing/InvoiceTest.java",
        ]
        .iter()
        .map(|p| FileId::new(*p))
        .collect();
        let index = FileIndex::new(&ids);
        let from = FileId::new("src/main/java/com/acme/orders/OrderService.java");

        let hits =
            JavaSupport.resolve_import(&ImportSpec::module("com.acme.billing.Invoice"), &from, &index);
        assert_eq!(hits, vec![FileId::new("src/main/java/com/acme/billing/Invoice.java")]);

        let hits = JavaSupport.resolve_import(&ImportSpec::module("com.acme.shared.*"), &from, &index);
        assert_eq!(hits.len(), 2);

        let subject = JavaSupport.implicit_dependencies(
            &FileId::new("src/test/java/com/acme/billing/InvoiceTest.java"),
            &index,
        );
        assert_eq!(subject, vec![FileId::new("src/main/java/com/acme/billing/Invoice.java")]);
    }
}
