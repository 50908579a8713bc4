mod ecma;
pub mod go;
mod helpers;
pub mod java;
pub mod javascript;
pub mod python;
pub mod rust;
pub mod typescript;

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use crate::{FileId, FileSummary, ImportSpec, Result};

/// Trait implemented by each language's summary and resolution support.
pub trait LanguageSupport: Send + Sync + std::fmt::Debug {
    /// Language identifier (e.g., "rust", "python").
    fn id(&self) -> &'static str;

    /// File extensions this language handles.
    fn extensions(&self) -> &'static [&'static str];

    /// Tree-sitter language for parsing.
    fn tree_sitter_language(&self) -> tree_sitter::Language;

    /// Grammar to use for a specific file. Most languages have one.
    fn tree_sitter_language_for(&self, _path: &Path) -> tree_sitter::Language {
        self.tree_sitter_language()
    }

    /// Extract top-level definitions and import statements.
    fn summarize(&self, tree: &tree_sitter::Tree, source: &str, path: &Path)
    -> Result<FileSummary>;

    /// Map one import of `from` to files in the snapshot.
    fn resolve_import(&self, import: &ImportSpec, from: &FileId, index: &FileIndex)
    -> Vec<FileId>;

    /// Whether an unresolved import could still point into the snapshot, in
    /// which case its names are looked up in the definition index.
    fn may_be_local(&self, _import: &ImportSpec, _index: &FileIndex) -> bool {
        true
    }

    /// Dependencies the language implies without an import statement.
    fn implicit_dependencies(&self, _file: &FileId, _index: &FileIndex) -> Vec<FileId> {
        Vec::new()
    }
}

/// Parse `source` with the language's grammar and summarize it.
pub fn summarize_source(
    lang: &dyn LanguageSupport,
    source: &str,
    path: &Path,
) -> Result<FileSummary> {
    let mut parser = tree_sitter::Parser::new();
    parser
        .set_language(&lang.tree_sitter_language_for(path))
        .map_err(|e| crate::GraphError::TreeSitter(e.to_string()))?;
    let tree = parser
        .parse(source, None)
        .ok_or_else(|| crate::GraphError::Parse {
            path: path.display().to_string(),
            message: "parser produced no tree".to_string(),
        })?;
    let root = tree.root_node();
    if root.has_error() {
        let at = first_error(root).map_or(root.start_position(), |n| n.start_position());
        return Err(crate::GraphError::Parse {
            path: path.display().to_string(),
            message: format!("syntax error near line {}", at.row + 1),
        });
    }
    lang.summarize(&tree, source, path)
}

fn first_error(node: tree_sitter::Node<'_>) -> Option<tree_sitter::Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    let mut cursor = node.walk();
    node.children(&mut cursor)
        .filter(tree_sitter::Node::has_error)
        .find_map(first_error)
}

// ── File index ─────────────────────────────────────────────────────

/// Lookup structure over every file id in a snapshot, used by resolvers.
#[derive(Debug, Clone, Default)]
pub struct FileIndex {
    files: BTreeSet<String>,
    dirs: HashMap<String, Vec<FileId>>,
}

impl FileIndex {
    pub fn new<'a>(ids: impl IntoIterator<Item = &'a FileId>) -> Self {
        let mut index = Self::default();
        for id in ids {
            index.files.insert(id.as_str().to_string());
            index
                .dirs
                .entry(id.dir().to_string())
                .or_default()
                .push(id.clone());
        }
        for files in index.dirs.values_mut() {
            files.sort();
        }
        index
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains(path)
    }

    /// The id for `path` if it exists in the snapshot.
    pub fn get(&self, path: &str) -> Option<FileId> {
        self.files.contains(path).then(|| FileId::new(path))
    }

    /// Files directly inside `dir` (not recursive).
    pub fn files_in_dir(&self, dir: &str) -> &[FileId] {
        self.dirs.get(dir).map_or(&[], Vec::as_slice)
    }

    pub fn dirs(&self) -> impl Iterator<Item = &str> {
        self.dirs.keys().map(String::as_str)
    }

    /// Whether any file or directory of the snapshot starts with `segment`
    /// as its first path component.
    pub fn has_top_level(&self, segment: &str) -> bool {
        self.files.iter().any(|f| {
            let first = f.split('/').next().unwrap_or(f);
            first == segment || first.rsplit_once('.').is_some_and(|(stem, _)| stem == segment)
        }) || self.dirs.keys().any(|d| d.split('/').any(|part| part == segment))
    }

    /// Files whose path ends with `suffix` at a component boundary.
    pub fn files_with_suffix(&self, suffix: &str) -> Vec<FileId> {
        self.files
            .iter()
            .filter(|f| *f == suffix || f.ends_with(&format!("/{suffix}")))
            .map(FileId::new)
            .collect()
    }
}

/// Join a relative path onto a directory, resolving `.` and `..`.
/// Returns `None` when the path escapes the snapshot root.
pub fn join_relative(dir: &str, rel: &str) -> Option<String> {
    let mut parts: Vec<&str> = dir.split('/').filter(|p| !p.is_empty()).collect();
    for piece in rel.split('/') {
        match piece {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    Some(parts.join("/"))
}

/// Parent directory of a `/`-separated directory path.
pub fn parent_dir(dir: &str) -> Option<&str> {
    if dir.is_empty() {
        return None;
    }
    Some(dir.rsplit_once('/').map_or("", |(parent, _)| parent))
}

/// Join a directory and a file name without producing a leading slash.
pub fn in_dir(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

// ── Registry ───────────────────────────────────────────────────────

/// Registry of all supported languages.
#[derive(Debug)]
pub struct LanguageRegistry {
    languages: HashMap<String, Arc<dyn LanguageSupport>>,
    extension_map: HashMap<String, String>,
}

impl LanguageRegistry {
    pub fn new() -> Self {
        let mut reg = Self {
            languages: HashMap::new(),
            extension_map: HashMap::new(),
        };
        reg.register(Arc::new(rust::RustSupport));
        reg.register(Arc::new(python::PythonSupport));
        reg.register(Arc::new(typescript::TypeScriptSupport));
        reg.register(Arc::new(javascript::JavaScriptSupport));
        reg.register(Arc::new(go::GoSupport));
        reg.register(Arc::new(java::JavaSupport));
        reg
    }

    fn register(&mut self, lang: Arc<dyn LanguageSupport>) {
        for ext in lang.extensions() {
            self.extension_map
                .insert((*ext).to_string(), lang.id().to_string());
        }
        self.languages.insert(lang.id().to_string(), lang);
    }

    /// Look up the language support for a file by its extension.
    pub fn for_file(&self, path: &Path) -> Option<Arc<dyn LanguageSupport>> {
        let ext = path.extension()?.to_str()?;
        let lang_id = self.extension_map.get(ext)?;
        self.languages.get(lang_id).cloned()
    }

    /// Get a language by its identifier.
    pub fn get(&self, id: &str) -> Option<Arc<dyn LanguageSupport>> {
        self.languages.get(id).cloned()
    }

    /// List all registered language IDs, sorted.
    pub fn language_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.languages.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_relative_handles_parent_segments() {
        assert_eq!(join_relative("src/a", "../b/c").as_deref(), Some("src/b/c"));
        assert_eq!(join_relative("src", "./x").as_deref(), Some("src/x"));
        assert_eq!(join_relative("", "../x"), None);
    }

    #[test]
    fn registry_maps_extensions() {
        let reg = LanguageRegistry::new();
        assert_eq!(reg.for_file(Path::new("a/b.py")).unwrap().id(), "python");
        assert_eq!(reg.for_file(Path::new("a/b.tsx")).unwrap().id(), "typescript");
        assert_eq!(reg.for_file(Path::new("main.go")).unwrap().id(), "go");
        assert!(reg.for_file(Path::new("README.md")).is_none());
        assert_eq!(
            reg.language_ids(),
            vec!["go", "java", "javascript", "python", "rust", "typescript"]
        );
    }

    #[test]
    fn file_index_suffix_lookup() {
        let ids = [
            FileId::new("src/main/java/com/acme/Foo.java"),
            FileId::new("src/main/java/com/acme/Bar.java"),
        ];
        let index = FileIndex::new(&ids);
        assert_eq!(
            index.files_with_suffix("com/acme/Foo.java"),
            vec![FileId::new("src/main/java/com/acme/Foo.java")]
        );
        assert_eq!(index.files_in_dir("src/main/java/com/acme").len(), 2);
        assert!(index.has_top_level("src"));
    }
}
