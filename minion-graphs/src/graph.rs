// File-level dependency graph.
//
// Edges point from a file to the files it depends on. The graph may contain
// cycles; consumers that need an order go through `context::order_for_context`.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use petgraph::Direction;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};

use crate::{FileId, GraphError, ImportSpec, Result};

/// One file of the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileNode {
    pub id: FileId,
    /// Language id, `None` for files no extractor handles.
    pub language: Option<String>,
    pub exports: BTreeSet<String>,
    pub imports: Vec<ImportSpec>,
    pub is_test: bool,
    /// False when the file failed to parse or has no extractor.
    pub parsed: bool,
    pub content_hash: u64,
}

impl FileNode {
    /// A node with no summary: unparsed or unsupported files.
    pub fn bare(id: FileId, language: Option<String>, is_test: bool, content_hash: u64) -> Self {
        Self {
            id,
            language,
            exports: BTreeSet::new(),
            imports: Vec::new(),
            is_test,
            parsed: false,
            content_hash,
        }
    }
}

/// Symbols that produced a dependency edge. Empty for whole-module imports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: StableDiGraph<FileNode, DependencyEdge>,
    index: HashMap<FileId, NodeIndex>,
    definitions: HashMap<String, BTreeSet<FileId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node, replacing any existing node with the same id. Edges
    /// of a replaced node are kept; callers re-resolve them explicitly.
    pub fn add_file(&mut self, node: FileNode) -> NodeIndex {
        if let Some(&idx) = self.index.get(&node.id) {
            self.unindex_definitions(idx);
            self.index_definitions(&node);
            self.graph[idx] = node;
            return idx;
        }
        self.index_definitions(&node);
        let id = node.id.clone();
        let idx = self.graph.add_node(node);
        self.index.insert(id, idx);
        idx
    }

    /// Record that `from` depends on `to`. Both files must already be in the
    /// graph. Self-dependencies are ignored and return `Ok(false)`; repeated
    /// edges merge their symbol lists.
    pub fn add_dependency(&mut self, from: &FileId, to: &FileId, symbols: &[String]) -> Result<bool> {
        let src = self.node_index(from)?;
        let dst = self.node_index(to)?;
        if src == dst {
            return Ok(false);
        }
        if let Some(edge) = self.graph.find_edge(src, dst) {
            let weight = &mut self.graph[edge];
            for symbol in symbols {
                if !weight.symbols.contains(symbol) {
                    weight.symbols.push(symbol.clone());
                }
            }
            return Ok(false);
        }
        self.graph.add_edge(
            src,
            dst,
            DependencyEdge {
                symbols: symbols.to_vec(),
            },
        );
        Ok(true)
    }

    /// Drop every outgoing edge of `file`.
    pub fn clear_dependencies(&mut self, file: &FileId) -> Result<()> {
        let idx = self.node_index(file)?;
        let edges: Vec<_> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .map(|e| e.id())
            .collect();
        for edge in edges {
            self.graph.remove_edge(edge);
        }
        Ok(())
    }

    pub fn contains(&self, file: &FileId) -> bool {
        self.index.contains_key(file)
    }

    pub fn node(&self, file: &FileId) -> Option<&FileNode> {
        self.index.get(file).map(|&idx| &self.graph[idx])
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// All nodes in lexicographic id order.
    pub fn nodes(&self) -> Vec<&FileNode> {
        let mut nodes: Vec<&FileNode> = self.graph.node_weights().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn file_ids(&self) -> BTreeSet<FileId> {
        self.index.keys().cloned().collect()
    }

    pub fn test_files(&self) -> BTreeSet<FileId> {
        self.graph
            .node_weights()
            .filter(|n| n.is_test)
            .map(|n| n.id.clone())
            .collect()
    }

    /// Files `file` depends on, sorted.
    pub fn dependencies(&self, file: &FileId) -> Vec<&FileId> {
        self.neighbors(file, Direction::Outgoing)
    }

    /// Files that depend on `file`, sorted.
    pub fn dependents(&self, file: &FileId) -> Vec<&FileId> {
        self.neighbors(file, Direction::Incoming)
    }

    pub fn edge(&self, from: &FileId, to: &FileId) -> Option<&DependencyEdge> {
        let src = *self.index.get(from)?;
        let dst = *self.index.get(to)?;
        self.graph.find_edge(src, dst).map(|e| &self.graph[e])
    }

    /// Files that define a top-level `symbol`.
    pub fn defining_files(&self, symbol: &str) -> Option<&BTreeSet<FileId>> {
        self.definitions.get(symbol)
    }

    /// Files whose content on disk no longer matches the hash recorded at
    /// build time. Missing files count as stale.
    pub fn stale_files(&self, root: &Path) -> BTreeSet<FileId> {
        self.graph
            .node_weights()
            .filter(|node| match std::fs::read(node.id.to_path(root)) {
                Ok(bytes) => content_hash(&bytes) != node.content_hash,
                Err(_) => true,
            })
            .map(|node| node.id.clone())
            .collect()
    }

    pub(crate) fn neighbors(&self, file: &FileId, dir: Direction) -> Vec<&FileId> {
        let Some(&idx) = self.index.get(file) else {
            return Vec::new();
        };
        let mut out: Vec<&FileId> = self
            .graph
            .neighbors_directed(idx, dir)
            .map(|n| &self.graph[n].id)
            .collect();
        out.sort();
        out.dedup();
        out
    }

    fn node_index(&self, file: &FileId) -> Result<NodeIndex> {
        self.index
            .get(file)
            .copied()
            .ok_or_else(|| GraphError::UnknownFile(file.clone()))
    }

    fn index_definitions(&mut self, node: &FileNode) {
        for name in &node.exports {
            self.definitions
                .entry(name.clone())
                .or_default()
                .insert(node.id.clone());
        }
    }

    fn unindex_definitions(&mut self, idx: NodeIndex) {
        let node = &self.graph[idx];
        for name in &node.exports {
            if let Some(files) = self.definitions.get_mut(name) {
                files.remove(&node.id);
                if files.is_empty() {
                    self.definitions.remove(name);
                }
            }
        }
    }
}

/// Simple content hash for change detection.
pub fn content_hash(data: &[u8]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    data.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(path: &str, exports: &[&str]) -> FileNode {
        let mut n = FileNode::bare(FileId::new(path), Some("python".into()), false, 0);
        n.exports = exports.iter().map(|s| (*s).to_string()).collect();
        n.parsed = true;
        n
    }

    #[test]
    fn edges_require_both_endpoints() {
        let mut g = DependencyGraph::new();
        g.add_file(node("a.py", &[]));
        let err = g
            .add_dependency(&FileId::new("a.py"), &FileId::new("missing.py"), &[])
            .unwrap_err();
        assert!(matches!(err, GraphError::UnknownFile(_)));
        assert_eq!(g.edge_count(), 0);
    }

    #[test]
    fn self_edges_are_skipped_and_duplicates_merge() {
        let mut g = DependencyGraph::new();
        g.add_file(node("a.py", &[]));
        g.add_file(node("b.py", &["B", "C"]));
        let a = FileId::new("a.py");
        let b = FileId::new("b.py");

        assert!(!g.add_dependency(&a, &a, &[]).unwrap());
        assert!(g.add_dependency(&a, &b, &["B".into()]).unwrap());
        assert!(!g.add_dependency(&a, &b, &["C".into(), "B".into()]).unwrap());

        assert_eq!(g.edge_count(), 1);
        assert_eq!(g.edge(&a, &b).unwrap().symbols, vec!["B", "C"]);
        assert_eq!(g.dependencies(&a), vec![&b]);
        assert_eq!(g.dependents(&b), vec![&a]);
    }

    #[test]
    fn replacing_a_node_reindexes_definitions() {
        let mut g = DependencyGraph::new();
        g.add_file(node("a.py", &["old"]));
        assert!(g.defining_files("old").is_some());

        g.add_file(node("a.py", &["new"]));
        assert!(g.defining_files("old").is_none());
        assert_eq!(g.defining_files("new").unwrap().len(), 1);
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn clearing_dependencies_keeps_incoming_edges() {
        let mut g = DependencyGraph::new();
        for p in ["a.py", "b.py", "c.py"] {
            g.add_file(node(p, &[]));
        }
        let (a, b, c) = (FileId::new("a.py"), FileId::new("b.py"), FileId::new("c.py"));
        g.add_dependency(&a, &b, &[]).unwrap();
        g.add_dependency(&b, &c, &[]).unwrap();

        g.clear_dependencies(&b).unwrap();
        assert!(g.dependencies(&b).is_empty());
        assert_eq!(g.dependents(&b), vec![&a]);
    }

    #[test]
    fn stale_files_detects_edits_and_deletions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        std::fs::write(dir.path().join("b.py"), "y = 1\n").unwrap();

        let mut g = DependencyGraph::new();
        for (p, body) in [("a.py", "x = 1\n"), ("b.py", "y = 1\n"), ("c.py", "")] {
            let mut n = node(p, &[]);
            n.content_hash = content_hash(body.as_bytes());
            g.add_file(n);
        }
        std::fs::write(dir.path().join("b.py"), "y = 2\n").unwrap();

        let stale = g.stale_files(dir.path());
        assert_eq!(
            stale.into_iter().collect::<Vec<_>>(),
            vec![FileId::new("b.py"), FileId::new("c.py")]
        );
    }
}
