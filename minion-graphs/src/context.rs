// Traversals over the dependency graph: what a change needs to see
// (forward), what a change can break (reverse), and the order in which
// files are presented (dependencies first).

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use petgraph::Direction;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::graph::DependencyGraph;
use crate::FileId;

// ── Traversal ──────────────────────────────────────────────────────

/// Files reachable from `starts` along dependency edges within `max_depth`
/// hops, start files included. `None` means unbounded.
pub fn forward_context<'a>(
    graph: &DependencyGraph,
    starts: impl IntoIterator<Item = &'a FileId>,
    max_depth: Option<usize>,
) -> BTreeSet<FileId> {
    forward_distances(graph, starts, max_depth).into_keys().collect()
}

/// Hop distance of every file reachable from `starts` (distance 0 for the
/// start files themselves).
pub fn forward_distances<'a>(
    graph: &DependencyGraph,
    starts: impl IntoIterator<Item = &'a FileId>,
    max_depth: Option<usize>,
) -> BTreeMap<FileId, usize> {
    bfs(graph, starts, max_depth, Direction::Outgoing)
}

/// Files that transitively depend on `changed` within `max_depth` hops,
/// changed files included.
pub fn reverse_impact<'a>(
    graph: &DependencyGraph,
    changed: impl IntoIterator<Item = &'a FileId>,
    max_depth: Option<usize>,
) -> BTreeSet<FileId> {
    bfs(graph, changed, max_depth, Direction::Incoming)
        .into_keys()
        .collect()
}

fn bfs<'a>(
    graph: &DependencyGraph,
    starts: impl IntoIterator<Item = &'a FileId>,
    max_depth: Option<usize>,
    direction: Direction,
) -> BTreeMap<FileId, usize> {
    let mut visited: BTreeMap<FileId, usize> = BTreeMap::new();
    let mut queue: VecDeque<(FileId, usize)> = VecDeque::new();

    for start in starts {
        if !graph.contains(start) {
            debug!(file = %start, "Start file not in graph, skipping");
            continue;
        }
        if visited.insert(start.clone(), 0).is_none() {
            queue.push_back((start.clone(), 0));
        }
    }

    while let Some((file, depth)) = queue.pop_front() {
        if max_depth.is_some_and(|max| depth >= max) {
            continue;
        }
        for next in graph.neighbors(&file, direction) {
            if !visited.contains_key(next) {
                visited.insert(next.clone(), depth + 1);
                queue.push_back((next.clone(), depth + 1));
            }
        }
    }
    visited
}

// ── Ordering ───────────────────────────────────────────────────────

/// Files left over by the ordering because they sit on or behind a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphCycle {
    pub files: Vec<FileId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextOrder {
    /// Every file of the input set exactly once.
    pub files: Vec<FileId>,
    /// True when a trailing block could not be ordered.
    pub partially_ordered: bool,
    pub cycle: Option<GraphCycle>,
}

/// Order `files` so that each file comes after the files it depends on,
/// counting only edges inside the set. Among ready files the smallest path
/// goes first. Files caught in a cycle are appended in path order and the
/// result is flagged as partially ordered.
pub fn order_for_context(graph: &DependencyGraph, files: &BTreeSet<FileId>) -> ContextOrder {
    let mut pending: HashMap<&FileId, usize> = HashMap::with_capacity(files.len());
    for file in files {
        let deps = graph
            .dependencies(file)
            .into_iter()
            .filter(|dep| *dep != file && files.contains(*dep))
            .count();
        pending.insert(file, deps);
    }

    let mut ready: BTreeSet<&FileId> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(file, _)| *file)
        .collect();

    let mut ordered = Vec::with_capacity(files.len());
    while let Some(file) = ready.pop_first() {
        ordered.push(file.clone());
        for dependent in graph.dependents(file) {
            let Some(count) = pending.get_mut(dependent) else {
                continue;
            };
            if *count == 0 {
                continue;
            }
            *count -= 1;
            if *count == 0 {
                if let Some((key, _)) = pending.get_key_value(dependent) {
                    ready.insert(*key);
                }
            }
        }
    }

    if ordered.len() == files.len() {
        return ContextOrder {
            files: ordered,
            partially_ordered: false,
            cycle: None,
        };
    }

    let emitted: BTreeSet<&FileId> = ordered.iter().collect();
    let remaining: Vec<FileId> = files
        .iter()
        .filter(|f| !emitted.contains(f))
        .cloned()
        .collect();
    warn!(
        files = remaining.len(),
        first = %remaining[0],
        "Dependency cycle detected, appending remaining files in path order"
    );
    ordered.extend(remaining.iter().cloned());
    ContextOrder {
        files: ordered,
        partially_ordered: true,
        cycle: Some(GraphCycle { files: remaining }),
    }
}

// ── Test selection ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestSelection {
    /// Reverse hops searched from the changed files.
    pub hop_limit: usize,
    /// Above this many selected tests the full suite runs instead.
    pub max_tests: usize,
}

impl Default for TestSelection {
    fn default() -> Self {
        Self {
            hop_limit: 5,
            max_tests: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FullSuiteReason {
    CapExceeded { found: usize, cap: usize },
    NoTestsSelected,
}

impl std::fmt::Display for FullSuiteReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CapExceeded { found, cap } => {
                write!(f, "{found} affected tests exceed the cap of {cap}")
            }
            Self::NoTestsSelected => f.write_str("no affected tests found"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AffectedTests {
    Selected(BTreeSet<FileId>),
    FullSuite { reason: FullSuiteReason },
}

impl AffectedTests {
    pub fn is_full_suite(&self) -> bool {
        matches!(self, Self::FullSuite { .. })
    }
}

/// Test files reverse-reachable from `changed`. Never truncates: above the
/// cap, or with nothing selected, the full suite is requested instead.
pub fn select_affected_tests<'a>(
    graph: &DependencyGraph,
    changed: impl IntoIterator<Item = &'a FileId>,
    selection: &TestSelection,
) -> AffectedTests {
    let impacted = reverse_impact(graph, changed, Some(selection.hop_limit));
    let tests: BTreeSet<FileId> = impacted
        .into_iter()
        .filter(|f| graph.node(f).is_some_and(|n| n.is_test))
        .collect();

    if tests.is_empty() {
        return AffectedTests::FullSuite {
            reason: FullSuiteReason::NoTestsSelected,
        };
    }
    if tests.len() > selection.max_tests {
        return AffectedTests::FullSuite {
            reason: FullSuiteReason::CapExceeded {
                found: tests.len(),
                cap: selection.max_tests,
            },
        };
    }
    AffectedTests::Selected(tests)
}
