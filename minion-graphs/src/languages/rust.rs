use std::path::Path;

use crate::{FileId, FileSummary, ImportKind, ImportSpec, Result, SymbolKind};

use super::helpers::{child_by_field, field_name_text, node_text, push_definition};
use super::{FileIndex, LanguageSupport, in_dir, parent_dir};

const EXTERNAL_ROOTS: &[&str] = &["std", "core", "alloc", "proc_macro", "test"];

#[derive(Debug)]
pub struct RustSupport;

impl LanguageSupport for RustSupport {
    fn id(&self) -> &'static str {
        "rust"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["rs"]
    }

    fn tree_sitter_language(&self) -> tree_sitter::Language {
        tree_sitter_rust::LANGUAGE.into()
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
            collect_item(child, source, &mut summary);
        }
        Ok(summary)
    }

    fn resolve_import(
        &self,
        import: &ImportSpec,
        from: &FileId,
        index: &FileIndex,
    ) -> Vec<FileId> {
        let own_dir = module_dir(from);

        if import.kind == ImportKind::ModuleDecl {
            return module_file(index, &in_dir(&own_dir, &import.module))
                .into_iter()
                .collect();
        }

        let mut segments: Vec<&str> = import
            .module
            .split("::")
            .filter(|s| !s.is_empty())
            .collect();
        segments.extend(import.names.iter().map(String::as_str));
        let Some(first) = segments.first().copied() else {
            return Vec::new();
        };

        let (base, rest) = match first {
            "crate" => {
                let Some(root) = crate_dir(from, index) else {
                    return Vec::new();
                };
                (root, &segments[1..])
            }
            "self" => (own_dir.clone(), &segments[1..]),
            "super" => {
                let supers = segments.iter().take_while(|s| **s == "super").count();
                let mut dir = own_dir.as_str();
                for _ in 0..supers {
                    match parent_dir(dir) {
                        Some(parent) => dir = parent,
                        None => return Vec::new(),
                    }
                }
                (dir.to_string(), &segments[supers..])
            }
            // Uniform paths: `use foo::Bar` may name a sibling module.
            _ => (own_dir.clone(), &segments[..]),
        };

        let root = crate_dir(from, index);
        for len in (0..=rest.len()).rev() {
            let path = rest[..len].iter().fold(base.clone(), |acc, seg| in_dir(&acc, seg));
            let hit = if len == 0 {
                if matches!(first, "crate" | "self" | "super") {
                    root_or_module_file(index, &path, root.as_deref())
                } else {
                    None
                }
            } else {
                module_file(index, &path)
            };
            if let Some(hit) = hit {
                return vec![hit];
            }
        }
        Vec::new()
    }

    fn may_be_local(&self, import: &ImportSpec, _index: &FileIndex) -> bool {
        let first = import.module.split("::").next().unwrap_or_default();
        !EXTERNAL_ROOTS.contains(&first)
    }
}

/// Directory holding the child modules of `file`.
fn module_dir(file: &FileId) -> String {
    match file.file_name() {
        "mod.rs" | "lib.rs" | "main.rs" => file.dir().to_string(),
        _ => in_dir(file.dir(), file.stem()),
    }
}

/// Nearest ancestor directory that holds a crate root file.
fn crate_dir(file: &FileId, index: &FileIndex) -> Option<String> {
    let mut dir = file.dir();
    loop {
        if index.contains(&in_dir(dir, "lib.rs")) || index.contains(&in_dir(dir, "main.rs")) {
            return Some(dir.to_string());
        }
        dir = parent_dir(dir)?;
    }
}

fn module_file(index: &FileIndex, path: &str) -> Option<FileId> {
    index
        .get(&format!("{path}.rs"))
        .or_else(|| index.get(&in_dir(path, "mod.rs")))
}

fn root_or_module_file(index: &FileIndex, dir: &str, crate_root: Option<&str>) -> Option<FileId> {
    if crate_root == Some(dir) {
        return index
            .get(&in_dir(dir, "lib.rs"))
            .or_else(|| index.get(&in_dir(dir, "main.rs")));
    }
    module_file(index, dir)
}

fn collect_item(node: tree_sitter::Node<'_>, source: &str, summary: &mut FileSummary) {
    let kind = match node.kind() {
        "function_item" => SymbolKind::Function,
        "struct_item" | "enum_item" | "union_item" | "trait_item" | "type_item" => {
            SymbolKind::Type
        }
        "const_item" | "static_item" => SymbolKind::Constant,
        "macro_definition" => SymbolKind::Function,
        "mod_item" => {
            let Some(name) = field_name_text(node, source) else {
                return;
            };
            if child_by_field(node, "body").is_some() {
                push_definition(&mut summary.definitions, name, SymbolKind::Module);
            } else {
                summary.imports.push(ImportSpec {
                    module: name,
                    names: Vec::new(),
                    kind: ImportKind::ModuleDecl,
                });
            }
            return;
        }
        "use_declaration" => {
            if let Some(arg) = child_by_field(node, "argument") {
                let mut paths = Vec::new();
                let text = node_text(arg, source).replace(char::is_whitespace, " ");
                expand_use_tree("", text.trim(), &mut paths);
                summary.imports.extend(paths.into_iter().filter_map(|p| use_path_to_spec(&p)));
            }
            return;
        }
        _ => return,
    };
    if let Some(name) = field_name_text(node, source) {
        push_definition(&mut summary.definitions, name, kind);
    }
}

/// Flatten `a::{b, c::{d, e}}` into full paths.
fn expand_use_tree(prefix: &str, tree: &str, out: &mut Vec<String>) {
    let join = |head: &str| -> String {
        match (prefix.is_empty(), head.is_empty()) {
            (true, _) => head.to_string(),
            (false, true) => prefix.to_string(),
            (false, false) => format!("{prefix}::{head}"),
        }
    };

    let Some(open) = tree.find('{') else {
        let path = tree.split(" as ").next().unwrap_or(tree);
        out.push(join(&path.replace(' ', "")));
        return;
    };
    let Some(close) = tree.rfind('}') else {
        return;
    };
    let head = tree[..open].replace(' ', "");
    let head = head.trim_end_matches("::");
    let next_prefix = join(head);
    for item in split_top_level(&tree[open + 1..close]) {
        let item = item.trim();
        if !item.is_empty() {
            expand_use_tree(&next_prefix, item, out);
        }
    }
}

fn split_top_level(list: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in list.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                items.push(&list[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(&list[start..]);
    items
}

fn use_path_to_spec(path: &str) -> Option<ImportSpec> {
    let mut segments: Vec<&str> = path.split("::").filter(|s| !s.is_empty()).collect();
    if matches!(segments.last(), Some(&"self" | &"*")) && segments.len() > 1 {
        segments.pop();
        return Some(ImportSpec::module(segments.join("::")));
    }
    match segments.as_slice() {
        [] => None,
        [single] => Some(ImportSpec::module(*single)),
        [module @ .., last] => Some(ImportSpec::with_names(
            module.join("::"),
            vec![(*last).to_string()],
        )),
    }
}
