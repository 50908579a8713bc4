use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use glob::{MatchOptions, Pattern};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::graph::{DependencyGraph, FileNode, content_hash};
use crate::languages::{FileIndex, LanguageRegistry, summarize_source};
use crate::{FileId, FileSummary, GraphError, Result};

/// Which files the builder looks at and which of them are tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOptions {
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub test_patterns: Vec<String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            include_patterns: [
                "**/*.rs", "**/*.py", "**/*.pyi", "**/*.ts", "**/*.tsx", "**/*.js", "**/*.jsx",
                "**/*.mjs", "**/*.cjs", "**/*.go", "**/*.java",
            ]
            .iter()
            .map(|s| (*s).to_string())
            .collect(),
            exclude_patterns: [
                "**/.git/**",
                "**/node_modules/**",
                "**/target/**",
                "**/vendor/**",
                "**/dist/**",
                "**/build/**",
                "**/.venv/**",
                "**/venv/**",
                "**/__pycache__/**",
                "**/.tox/**",
                "**/.minion/**",
            ]
            .iter()
            .map(|s| (*s).to_string())
            .collect(),
            test_patterns: [
                "**/test_*.py",
                "**/*_test.py",
                "**/tests/**",
                "**/test/**",
                "**/__tests__/**",
                "**/*_test.go",
                "**/*.test.*",
                "**/*.spec.*",
                "**/*Test.java",
                "**/*Tests.java",
            ]
            .iter()
            .map(|s| (*s).to_string())
            .collect(),
        }
    }
}

/// A file that was kept as an edgeless node because it could not be summarized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseFailure {
    pub file: FileId,
    pub message: String,
}

/// Result of a full build.
#[derive(Debug, Clone)]
pub struct GraphBuild {
    pub graph: DependencyGraph,
    pub failures: Vec<ParseFailure>,
}

#[derive(Debug)]
pub struct GraphBuilder {
    root: PathBuf,
    options: BuildOptions,
    registry: LanguageRegistry,
    excludes: Vec<Pattern>,
    tests: Vec<Pattern>,
}

const MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

impl GraphBuilder {
    pub fn new(root: &Path, options: BuildOptions) -> Self {
        let excludes = compile_patterns(&options.exclude_patterns);
        let tests = compile_patterns(&options.test_patterns);
        Self {
            root: root.to_path_buf(),
            options,
            registry: LanguageRegistry::new(),
            excludes,
            tests,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_test_file(&self, file: &FileId) -> bool {
        self.tests
            .iter()
            .any(|p| p.matches_with(file.as_str(), MATCH))
    }

    /// Walk the snapshot, summarize every matched file and resolve edges.
    #[instrument(skip_all, name = "graph_build", fields(root = %self.root.display()))]
    pub fn build(&self) -> Result<GraphBuild> {
        let start = Instant::now();
        let files = self.walk_files();
        info!(file_count = files.len(), "Dependency scan found files");

        let summarized: Vec<(FileNode, Option<ParseFailure>)> =
            files.par_iter().map(|id| self.summarize_file(id)).collect();

        let mut graph = DependencyGraph::new();
        let mut failures = Vec::new();
        for (node, failure) in summarized {
            graph.add_file(node);
            failures.extend(failure);
        }

        let index = FileIndex::new(&graph.file_ids());
        for file in graph.file_ids() {
            self.resolve_file(&mut graph, &index, &file)?;
        }

        info!(
            files = graph.len(),
            edges = graph.edge_count(),
            parse_failures = failures.len(),
            elapsed_ms = start.elapsed().as_millis(),
            "Dependency graph built"
        );
        Ok(GraphBuild { graph, failures })
    }

    /// Re-summarize one file after it changed on disk and re-resolve its
    /// dependencies.
    pub fn refresh_file(
        &self,
        graph: &mut DependencyGraph,
        file: &FileId,
    ) -> Result<Option<ParseFailure>> {
        if !file.to_path(&self.root).is_file() {
            debug!(file = %file, "Refreshed file no longer exists, keeping edgeless node");
            if graph.contains(file) {
                graph.clear_dependencies(file)?;
            }
            return Ok(None);
        }
        let (node, failure) = self.summarize_file(file);
        self.replace_node(graph, node)?;
        Ok(failure)
    }

    /// Files whose summary no longer matches the repository: edited or
    /// deleted nodes, plus matching files the graph has not seen yet.
    pub fn changed_files(&self, graph: &DependencyGraph) -> BTreeSet<FileId> {
        let mut changed = graph.stale_files(&self.root);
        changed.extend(self.walk_files().into_iter().filter(|f| !graph.contains(f)));
        changed
    }

    /// Like [`refresh_file`](Self::refresh_file) for content that only
    /// exists in memory, such as a proposed patch.
    pub fn refresh_source(
        &self,
        graph: &mut DependencyGraph,
        file: &FileId,
        source: &str,
    ) -> Result<Option<ParseFailure>> {
        let (node, failure) = self.summarize_bytes(file, source.as_bytes().to_vec());
        self.replace_node(graph, node)?;
        Ok(failure)
    }

    /// Insert or replace `node` and resolve edges again. A file new to the
    /// graph may satisfy imports that other files could not resolve before,
    /// so every file is resolved again then.
    fn replace_node(&self, graph: &mut DependencyGraph, node: FileNode) -> Result<()> {
        let file = node.id.clone();
        let is_new = !graph.contains(&file);
        graph.add_file(node);
        let index = FileIndex::new(&graph.file_ids());
        if is_new {
            for other in graph.file_ids() {
                graph.clear_dependencies(&other)?;
                self.resolve_file(graph, &index, &other)?;
            }
        } else {
            graph.clear_dependencies(&file)?;
            self.resolve_file(graph, &index, &file)?;
        }
        Ok(())
    }

    fn walk_files(&self) -> Vec<FileId> {
        let mut matched = BTreeSet::new();
        for pattern in &self.options.include_patterns {
            let full_pattern = self.root.join(pattern).to_string_lossy().to_string();
            match glob::glob(&full_pattern) {
                Ok(paths) => {
                    for entry in paths.flatten() {
                        if !entry.is_file() {
                            continue;
                        }
                        let Some(id) = FileId::from_path(&self.root, &entry) else {
                            continue;
                        };
                        if !self.is_excluded(&id) {
                            matched.insert(id);
                        }
                    }
                }
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "Invalid glob pattern");
                }
            }
        }
        matched.into_iter().collect()
    }

    fn is_excluded(&self, file: &FileId) -> bool {
        self.excludes
            .iter()
            .any(|p| p.matches_with(file.as_str(), MATCH))
    }

    fn summarize_file(&self, id: &FileId) -> (FileNode, Option<ParseFailure>) {
        match std::fs::read(id.to_path(&self.root)) {
            Ok(bytes) => self.summarize_bytes(id, bytes),
            Err(e) => {
                let language = self
                    .registry
                    .for_file(&id.to_path(&self.root))
                    .map(|l| l.id().to_string());
                failed(id, language, self.is_test_file(id), 0, &GraphError::Io(e))
            }
        }
    }

    fn summarize_bytes(&self, id: &FileId, bytes: Vec<u8>) -> (FileNode, Option<ParseFailure>) {
        let path = id.to_path(&self.root);
        let is_test = self.is_test_file(id);
        let lang = self.registry.for_file(&path);
        let language = lang.as_ref().map(|l| l.id().to_string());
        let hash = content_hash(&bytes);

        let Some(lang) = lang else {
            let err = GraphError::UnsupportedLanguage(id.extension().unwrap_or("").to_string());
            return failed(id, language, is_test, hash, &err);
        };

        let summary = String::from_utf8(bytes)
            .map_err(|e| GraphError::Parse {
                path: id.to_string(),
                message: e.to_string(),
            })
            .and_then(|source| summarize_source(lang.as_ref(), &source, &path));

        match summary {
            Ok(FileSummary {
                definitions,
                imports,
            }) => {
                debug!(
                    file = %id,
                    definitions = definitions.len(),
                    imports = imports.len(),
                    "Summarized file"
                );
                let node = FileNode {
                    id: id.clone(),
                    language,
                    exports: definitions.into_iter().map(|d| d.name).collect(),
                    imports,
                    is_test,
                    parsed: true,
                    content_hash: hash,
                };
                (node, None)
            }
            Err(e) => failed(id, language, is_test, hash, &e),
        }
    }

    fn resolve_file(
        &self,
        graph: &mut DependencyGraph,
        index: &FileIndex,
        file: &FileId,
    ) -> Result<()> {
        let Some(node) = graph.node(file) else {
            return Err(GraphError::UnknownFile(file.clone()));
        };
        let Some(lang) = node.language.as_deref().and_then(|id| self.registry.get(id)) else {
            return Ok(());
        };
        if !node.parsed {
            return Ok(());
        }

        let mut targets: Vec<(FileId, Vec<String>)> = Vec::new();
        for import in &node.imports {
            let hits = lang.resolve_import(import, file, index);
            if !hits.is_empty() {
                targets.extend(hits.into_iter().map(|hit| (hit, import.names.clone())));
                continue;
            }
            if !lang.may_be_local(import, index) {
                continue;
            }
            // Fall back to the definition index: a unique definer of an
            // imported name is taken as the target.
            for name in &import.names {
                if let Some(files) = graph.defining_files(name) {
                    if files.len() == 1 {
                        if let Some(hit) = files.iter().next() {
                            targets.push((hit.clone(), vec![name.clone()]));
                        }
                    }
                }
            }
        }
        for implicit in lang.implicit_dependencies(file, index) {
            targets.push((implicit, Vec::new()));
        }

        for (target, symbols) in targets {
            graph.add_dependency(file, &target, &symbols)?;
        }
        Ok(())
    }
}

fn failed(
    id: &FileId,
    language: Option<String>,
    is_test: bool,
    hash: u64,
    err: &GraphError,
) -> (FileNode, Option<ParseFailure>) {
    warn!(file = %id, error = %err, "File kept without dependencies");
    let failure = ParseFailure {
        file: id.clone(),
        message: err.to_string(),
    };
    (FileNode::bare(id.clone(), language, is_test, hash), Some(failure))
}

fn compile_patterns(patterns: &[String]) -> Vec<Pattern> {
    patterns
        .iter()
        .filter_map(|p| match Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                warn!(pattern = %p, error = %e, "Invalid glob pattern");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "app/__init__.py", "");
        write(root, "app/db.py", "class Database:\n    pass\n");
        write(root, "app/service.py", "from app.db import Database\n\ndef run():\n    pass\n");
        write(root, "app/api.py", "from .service import run\n");
        write(root, "tests/test_service.py", "from app.service import run\n");
        write(root, "app/broken.py", "def broken(:\n");
        write(root, "node_modules/pkg/index.js", "module.exports = 1;\n");
        dir
    }

    #[test]
    fn builds_python_graph_with_edges_and_failures() {
        let dir = fixture();
        let build = GraphBuilder::new(dir.path(), BuildOptions::default())
            .build()
            .unwrap();
        let g = &build.graph;

        assert!(!g.contains(&FileId::new("node_modules/pkg/index.js")));
        assert_eq!(
            g.dependencies(&FileId::new("app/service.py")),
            vec![&FileId::new("app/db.py")]
        );
        assert_eq!(
            g.dependencies(&FileId::new("app/api.py")),
            vec![&FileId::new("app/service.py")]
        );
        assert!(g.node(&FileId::new("tests/test_service.py")).unwrap().is_test);
        assert!(!g.node(&FileId::new("app/service.py")).unwrap().is_test);

        // The broken file stays in the graph without edges.
        let broken = FileId::new("app/broken.py");
        assert!(g.contains(&broken));
        assert!(!g.node(&broken).unwrap().parsed);
        assert!(g.dependencies(&broken).is_empty());
        assert_eq!(build.failures.len(), 1);
        assert_eq!(build.failures[0].file, broken);
    }

    #[test]
    fn refresh_picks_up_new_imports() {
        let dir = fixture();
        let builder = GraphBuilder::new(dir.path(), BuildOptions::default());
        let mut g = builder.build().unwrap().graph;
        let api = FileId::new("app/api.py");

        write(dir.path(), "app/api.py", "from .service import run\nfrom app.db import Database\n");
        assert!(g.stale_files(dir.path()).contains(&api));
        let failure = builder.refresh_file(&mut g, &api).unwrap();
        assert!(failure.is_none());
        assert_eq!(
            g.dependencies(&api),
            vec![&FileId::new("app/db.py"), &FileId::new("app/service.py")]
        );
        assert!(g.stale_files(dir.path()).iter().all(|f| f != &api));
    }

    #[test]
    fn refresh_of_new_file_resolves_waiting_importers() {
        let dir = fixture();
        write(dir.path(), "app/report.py", "from app.render import render\n");
        let builder = GraphBuilder::new(dir.path(), BuildOptions::default());
        let mut g = builder.build().unwrap().graph;
        let report = FileId::new("app/report.py");
        // Until the module exists the import resolves to its package.
        assert_eq!(g.dependencies(&report), vec![&FileId::new("app/__init__.py")]);

        write(dir.path(), "app/render.py", "def render():\n    pass\n");
        let render = FileId::new("app/render.py");
        builder.refresh_file(&mut g, &render).unwrap();
        assert_eq!(g.dependencies(&report), vec![&render]);
    }

    #[test]
    fn changed_files_include_edits_and_new_files() {
        let dir = fixture();
        let builder = GraphBuilder::new(dir.path(), BuildOptions::default());
        let g = builder.build().unwrap().graph;
        assert!(builder.changed_files(&g).is_empty());

        write(dir.path(), "app/api.py", "from app.db import Database\n");
        write(dir.path(), "app/export.py", "from app.db import Database\n");
        let changed = builder.changed_files(&g);
        assert_eq!(
            changed.into_iter().collect::<Vec<_>>(),
            vec![FileId::new("app/api.py"), FileId::new("app/export.py")]
        );
    }

    #[test]
    fn refresh_from_memory_leaves_disk_alone() {
        let dir = fixture();
        let builder = GraphBuilder::new(dir.path(), BuildOptions::default());
        let mut g = builder.build().unwrap().graph;
        let api = FileId::new("app/api.py");
        let before = std::fs::read_to_string(api.to_path(dir.path())).unwrap();

        builder
            .refresh_source(&mut g, &api, "from app.db import Database\n")
            .unwrap();
        assert_eq!(g.dependencies(&api), vec![&FileId::new("app/db.py")]);
        assert_eq!(std::fs::read_to_string(api.to_path(dir.path())).unwrap(), before);
    }

    #[test]
    fn unresolved_import_falls_back_to_unique_definition() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/lib.rs", "pub mod engine;\n");
        write(dir.path(), "src/engine.rs", "pub struct Engine;\n");
        write(dir.path(), "tests/engine.rs", "use mycrate::Engine;\n");
        let build = GraphBuilder::new(dir.path(), BuildOptions::default())
            .build()
            .unwrap();
        let g = &build.graph;
        assert_eq!(
            g.dependencies(&FileId::new("tests/engine.rs")),
            vec![&FileId::new("src/engine.rs")]
        );
        assert_eq!(
            g.dependencies(&FileId::new("src/lib.rs")),
            vec![&FileId::new("src/engine.rs")]
        );
    }

    #[test]
    fn test_patterns_respect_separators() {
        let builder = GraphBuilder::new(Path::new("/repo"), BuildOptions::default());
        assert!(builder.is_test_file(&FileId::new("pkg/test_models.py")));
        assert!(builder.is_test_file(&FileId::new("tests/helpers.py")));
        assert!(builder.is_test_file(&FileId::new("web/app.spec.ts")));
        assert!(!builder.is_test_file(&FileId::new("test_data_dir/loader.py")));
        assert!(!builder.is_test_file(&FileId::new("app/contest.py")));
    }
}
