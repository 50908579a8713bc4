pub mod builder;
pub mod context;
pub mod graph;
pub mod languages;

use std::fmt;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

pub use builder::{BuildOptions, GraphBuild, GraphBuilder, ParseFailure};
pub use context::{
    AffectedTests, ContextOrder, FullSuiteReason, GraphCycle, TestSelection, forward_context,
    forward_distances, order_for_context, reverse_impact, select_affected_tests,
};
pub use graph::{DependencyGraph, FileNode};
pub use languages::{LanguageRegistry, LanguageSupport};

/// Error type for the graph engine.
#[derive(thiserror::Error, Debug)]
pub enum GraphError {
    #[error("Parse error in {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Tree-sitter error: {0}")]
    TreeSitter(String),

    #[error("File not in graph: {0}")]
    UnknownFile(FileId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GraphError>;

// ── File identity ──────────────────────────────────────────────────

/// Stable identifier of a file inside a snapshot: its path relative to the
/// snapshot root, `/`-separated. Ordering is lexicographic on that path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    pub fn new(path: impl AsRef<str>) -> Self {
        let raw = path.as_ref().replace('\\', "/");
        let trimmed = raw.trim_start_matches("./").trim_start_matches('/');
        Self(trimmed.to_string())
    }

    /// Build an id from an absolute path under `root`.
    pub fn from_path(root: &Path, path: &Path) -> Option<Self> {
        let rel = path.strip_prefix(root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().to_string()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            return None;
        }
        Some(Self(parts.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory part, empty for files at the snapshot root.
    pub fn dir(&self) -> &str {
        self.0.rsplit_once('/').map_or("", |(dir, _)| dir)
    }

    pub fn file_name(&self) -> &str {
        self.0.rsplit_once('/').map_or(self.0.as_str(), |(_, name)| name)
    }

    /// File name without its final extension.
    pub fn stem(&self) -> &str {
        let name = self.file_name();
        name.rsplit_once('.').map_or(name, |(stem, _)| stem)
    }

    pub fn extension(&self) -> Option<&str> {
        self.file_name().rsplit_once('.').map(|(_, ext)| ext)
    }

    pub fn to_path(&self, root: &Path) -> std::path::PathBuf {
        root.join(&self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FileId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for FileId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

// ── Symbol kind ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymbolKind {
    Function,
    Type,
    Variable,
    Module,
    Constant,
}

// ── Per-file summary ───────────────────────────────────────────────

/// A top-level name defined by a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    pub name: String,
    pub kind: SymbolKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImportKind {
    /// `import`, `use`, `require` and friends.
    Import,
    /// Rust `mod foo;`: the module body lives in a child file.
    ModuleDecl,
}

/// One import statement as written, before resolution to files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSpec {
    /// Module path in the language's own notation (`..pkg.mod`, `./util`,
    /// `crate::a::b`, `github.com/x/y`, `a.b.C`).
    pub module: String,
    /// Names pulled out of the module; empty for whole-module imports.
    pub names: Vec<String>,
    pub kind: ImportKind,
}

impl ImportSpec {
    pub fn module(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            names: Vec::new(),
            kind: ImportKind::Import,
        }
    }

    pub fn with_names(module: impl Into<String>, names: Vec<String>) -> Self {
        Self {
            module: module.into(),
            names,
            kind: ImportKind::Import,
        }
    }
}

/// What a language extractor reports for one file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileSummary {
    pub definitions: Vec<Definition>,
    pub imports: Vec<ImportSpec>,
}
