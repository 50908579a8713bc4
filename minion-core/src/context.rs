//! Context bundle assembly: which file contents a reasoning request sees,
//! in which order, under a token budget.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use minion_graphs::{DependencyGraph, FileId, GraphCycle, forward_distances, order_for_context};

use crate::config::GraphSection;
use crate::types::{Task, truncate_chars};

/// Characters per approximate token.
pub const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub file: FileId,
    pub content: String,
    /// Content was cut to fit the budget.
    pub truncated: bool,
}

/// Dependency-first file contents for one reasoning request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextBundle {
    pub targets: Vec<FileId>,
    pub entries: Vec<ContextEntry>,
    pub partially_ordered: bool,
    pub cycle: Option<GraphCycle>,
    /// Reachable files left out for budget.
    pub omitted: Vec<FileId>,
    pub approx_tokens: usize,
    /// First graph files by path, for orientation.
    pub outline: Vec<FileId>,
}

impl ContextBundle {
    pub fn files(&self) -> Vec<&FileId> {
        self.entries.iter().map(|e| &e.file).collect()
    }

    pub fn contains(&self, file: &FileId) -> bool {
        self.entries.iter().any(|e| &e.file == file)
    }

    pub fn content_of(&self, file: &FileId) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| &e.file == file)
            .map(|e| e.content.as_str())
    }

    /// Prompt rendering: outline, then each file in bundle order.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.outline.is_empty() {
            out.push_str("## Repository outline\n");
            for file in &self.outline {
                let _ = writeln!(out, "- {file}");
            }
            out.push('\n');
        }
        out.push_str("## Files (dependencies first)\n");
        for entry in &self.entries {
            let marker = if entry.truncated { " (truncated)" } else { "" };
            let _ = writeln!(out, "\n### {}{marker}\n```\n{}\n```", entry.file, entry.content);
        }
        if !self.omitted.is_empty() {
            let _ = writeln!(
                out,
                "\nOmitted for size: {}",
                self.omitted
                    .iter()
                    .map(FileId::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        out
    }
}

/// Bundle size and seeding limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextLimits {
    pub token_budget: usize,
    pub max_depth: Option<usize>,
    pub max_seed_files: usize,
    pub outline_limit: usize,
}

impl From<&GraphSection> for ContextLimits {
    fn from(section: &GraphSection) -> Self {
        Self {
            token_budget: section.token_budget,
            max_depth: section.context_depth,
            max_seed_files: section.max_seed_files,
            outline_limit: section.outline_limit,
        }
    }
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self::from(&GraphSection::default())
    }
}

/// Reads file contents from the snapshot root for files in `graph`.
#[derive(Debug)]
pub struct ContextAssembler<'a> {
    graph: &'a DependencyGraph,
    root: &'a Path,
    limits: ContextLimits,
}

impl<'a> ContextAssembler<'a> {
    pub fn new(graph: &'a DependencyGraph, root: &'a Path, limits: ContextLimits) -> Self {
        Self {
            graph,
            root,
            limits,
        }
    }

    /// The task's explicit hints, or files seeded from its description.
    pub fn target_files(&self, task: &Task) -> Vec<FileId> {
        if task.file_hints.is_empty() {
            self.seed_targets(&task.description)
        } else {
            task.file_hints.clone()
        }
    }

    /// Files whose path, stem, or defined symbols appear as words in
    /// `description`, best matches first.
    pub fn seed_targets(&self, description: &str) -> Vec<FileId> {
        let words: BTreeSet<String> = description
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|w| w.len() > 2)
            .map(str::to_lowercase)
            .collect();
        let lowered = description.to_lowercase();

        let mut scored: Vec<(usize, bool, &FileId)> = self
            .graph
            .nodes()
            .into_iter()
            .filter_map(|node| {
                let mut score = 0;
                if lowered.contains(&node.id.as_str().to_lowercase()) {
                    score += 3;
                }
                if words.contains(&node.id.stem().to_lowercase()) {
                    score += 2;
                }
                score += node
                    .exports
                    .iter()
                    .filter(|s| words.contains(&s.to_lowercase()))
                    .count();
                (score > 0).then_some((score, node.is_test, &node.id))
            })
            .collect();

        // Highest score, then non-test files, then path.
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(b.2)));
        let seeds: Vec<FileId> = scored
            .into_iter()
            .take(self.limits.max_seed_files)
            .map(|(_, _, id)| id.clone())
            .collect();
        debug!(count = seeds.len(), "Seeded target files from description");
        seeds
    }

    /// Build the bundle for `targets`.
    ///
    /// Targets are admitted first (cut to the remaining budget if needed),
    /// then forward-reachable files by hop distance and path while they fit.
    /// The admitted set is emitted dependency-first.
    pub fn assemble(&self, targets: &[FileId]) -> ContextBundle {
        let budget = self.limits.token_budget.saturating_mul(CHARS_PER_TOKEN);
        let mut used = 0usize;
        let mut contents: BTreeMap<FileId, (String, bool)> = BTreeMap::new();
        let mut omitted = Vec::new();

        let target_set: BTreeSet<&FileId> = targets.iter().collect();
        for target in targets {
            if contents.contains_key(target) {
                continue;
            }
            // Targets may be files the patch is about to create.
            let content = self.read(target).unwrap_or_default();
            let remaining = budget - used;
            let len = content.chars().count();
            let (content, truncated) = if len > remaining {
                (truncate_chars(&content, remaining).to_string(), true)
            } else {
                (content, false)
            };
            used += content.chars().count();
            contents.insert(target.clone(), (content, truncated));
        }

        let mut candidates: Vec<(usize, FileId)> =
            forward_distances(self.graph, targets, self.limits.max_depth)
                .into_iter()
                .filter(|(file, _)| !target_set.contains(file))
                .map(|(file, distance)| (distance, file))
                .collect();
        candidates.sort();

        for (_, file) in candidates {
            let Some(content) = self.read(&file) else {
                omitted.push(file);
                continue;
            };
            let len = content.chars().count();
            if used + len <= budget {
                used += len;
                contents.insert(file, (content, false));
            } else {
                omitted.push(file);
            }
        }

        let admitted: BTreeSet<FileId> = contents.keys().cloned().collect();
        let order = order_for_context(self.graph, &admitted);
        let entries = order
            .files
            .into_iter()
            .filter_map(|file| {
                contents
                    .remove(&file)
                    .map(|(content, truncated)| ContextEntry {
                        file,
                        content,
                        truncated,
                    })
            })
            .collect::<Vec<_>>();

        omitted.sort();
        let bundle = ContextBundle {
            targets: targets.to_vec(),
            entries,
            partially_ordered: order.partially_ordered,
            cycle: order.cycle,
            omitted,
            approx_tokens: used.div_ceil(CHARS_PER_TOKEN),
            outline: self
                .graph
                .file_ids()
                .into_iter()
                .take(self.limits.outline_limit)
                .collect(),
        };
        info!(
            files = bundle.entries.len(),
            omitted = bundle.omitted.len(),
            tokens = bundle.approx_tokens,
            partially_ordered = bundle.partially_ordered,
            "Context bundle assembled"
        );
        bundle
    }

    fn read(&self, file: &FileId) -> Option<String> {
        match std::fs::read(file.to_path(self.root)) {
            Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) => {
                debug!(file = %file, error = %e, "Unreadable context file");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use minion_graphs::{BuildOptions, GraphBuilder};

    use super::*;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn fixture() -> (tempfile::TempDir, DependencyGraph) {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "app/models.py", "class Item:\n    price = 0\n");
        write(
            dir.path(),
            "app/pricing.py",
            "from app.models import Item\n\ndef apply_discount(item):\n    return item\n",
        );
        write(
            dir.path(),
            "app/cart.py",
            "from app.pricing import apply_discount\n\ndef cart_total(items):\n    return 0\n",
        );
        write(dir.path(), "app/unrelated.py", "X = 1\n");
        let build = GraphBuilder::new(dir.path(), BuildOptions::default())
            .build()
            .unwrap();
        (dir, build.graph)
    }

    fn limits(token_budget: usize) -> ContextLimits {
        ContextLimits {
            token_budget,
            ..ContextLimits::default()
        }
    }

    #[test]
    fn bundle_is_dependency_first() {
        let (dir, graph) = fixture();
        let assembler = ContextAssembler::new(&graph, dir.path(), limits(24_000));
        let bundle = assembler.assemble(&[FileId::new("app/cart.py")]);

        let files: Vec<&str> = bundle.files().into_iter().map(FileId::as_str).collect();
        assert_eq!(files, vec!["app/models.py", "app/pricing.py", "app/cart.py"]);
        assert!(!bundle.partially_ordered);
        assert!(bundle.omitted.is_empty());
        assert!(!bundle.contains(&FileId::new("app/unrelated.py")));
    }

    #[test]
    fn budget_drops_farthest_files_first() {
        let (dir, graph) = fixture();
        let cart_len = std::fs::read_to_string(dir.path().join("app/cart.py"))
            .unwrap()
            .len();
        let pricing_len = std::fs::read_to_string(dir.path().join("app/pricing.py"))
            .unwrap()
            .len();
        // Room for the target and its direct dependency only.
        let tokens = (cart_len + pricing_len).div_ceil(CHARS_PER_TOKEN);
        let assembler = ContextAssembler::new(&graph, dir.path(), limits(tokens));
        let bundle = assembler.assemble(&[FileId::new("app/cart.py")]);

        assert!(bundle.contains(&FileId::new("app/cart.py")));
        assert!(bundle.contains(&FileId::new("app/pricing.py")));
        assert_eq!(bundle.omitted, vec![FileId::new("app/models.py")]);
        assert!(bundle.approx_tokens <= tokens);
    }

    #[test]
    fn oversized_target_is_truncated() {
        let (dir, graph) = fixture();
        let assembler = ContextAssembler::new(&graph, dir.path(), limits(2));
        let bundle = assembler.assemble(&[FileId::new("app/cart.py")]);

        assert_eq!(bundle.entries.len(), 1);
        assert!(bundle.entries[0].truncated);
        assert_eq!(bundle.entries[0].content.chars().count(), 8);
        assert_eq!(bundle.omitted.len(), 2);
    }

    #[test]
    fn new_target_files_are_included_empty() {
        let (dir, graph) = fixture();
        let assembler = ContextAssembler::new(&graph, dir.path(), limits(24_000));
        let bundle = assembler.assemble(&[FileId::new("app/new_feature.py")]);
        assert_eq!(bundle.content_of(&FileId::new("app/new_feature.py")), Some(""));
    }

    #[test]
    fn cyclic_targets_are_flagged_not_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.py", "import b\n");
        write(dir.path(), "b.py", "import a\n");
        let graph = GraphBuilder::new(dir.path(), BuildOptions::default())
            .build()
            .unwrap()
            .graph;
        let assembler = ContextAssembler::new(&graph, dir.path(), limits(24_000));
        let bundle = assembler.assemble(&[FileId::new("a.py")]);
        assert_eq!(bundle.entries.len(), 2);
        assert!(bundle.partially_ordered);
        assert!(bundle.cycle.is_some());
    }

    #[test]
    fn seeds_come_from_description_words() {
        let (dir, graph) = fixture();
        let assembler = ContextAssembler::new(&graph, dir.path(), ContextLimits::default());

        let seeds = assembler.seed_targets("cart_total returns the wrong value for the cart");
        assert_eq!(seeds.first(), Some(&FileId::new("app/cart.py")));

        let seeds = assembler.seed_targets("Item prices are stale");
        assert_eq!(seeds, vec![FileId::new("app/models.py")]);

        assert!(assembler.seed_targets("nothing matches here").is_empty());
    }

    #[test]
    fn render_lists_outline_and_files() {
        let (dir, graph) = fixture();
        let assembler = ContextAssembler::new(&graph, dir.path(), ContextLimits::default());
        let text = assembler.assemble(&[FileId::new("app/pricing.py")]).render();
        assert!(text.contains("- app/unrelated.py"));
        assert!(text.contains("### app/models.py"));
        assert!(text.find("### app/models.py") < text.find("### app/pricing.py"));
    }
}
