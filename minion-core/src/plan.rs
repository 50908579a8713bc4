//! Plan memory and attempt history persistence.
//!
//! Each task owns `<state_dir>/<task-id>/plan.md` and
//! `<state_dir>/<task-id>/attempts.json`. Writes go through a temporary file
//! in the same directory followed by a rename, so readers never observe a
//! half-written document.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::error::PlanStoreError;
use crate::types::{AttemptRecord, TaskId};

pub const PLAN_FILE: &str = "plan.md";
pub const ATTEMPTS_FILE: &str = "attempts.json";

/// Storage for the per-task plan document and attempt history.
pub trait PlanStore: Send + Sync + std::fmt::Debug {
    fn load_plan(&self, task: &TaskId) -> Result<Option<String>, PlanStoreError>;

    fn save_plan(&self, task: &TaskId, plan: &str) -> Result<(), PlanStoreError>;

    fn load_attempts(&self, task: &TaskId) -> Result<Vec<AttemptRecord>, PlanStoreError>;

    fn save_attempts(&self, task: &TaskId, attempts: &[AttemptRecord])
    -> Result<(), PlanStoreError>;
}

/// Starting plan for a task that has none yet.
pub fn initial_plan(task_id: &TaskId, description: &str) -> String {
    format!(
        "# Plan: {task_id}\n\n## Task\n{}\n\n## Approach\n- [ ] Read the target files and their dependencies\n- [ ] Make the smallest change that solves the task\n- [ ] Keep lint and affected tests green\n",
        description.trim()
    )
}

// ── Filesystem store ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FilePlanStore {
    root: PathBuf,
}

impl FilePlanStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one task's state.
    pub fn task_dir(&self, task: &TaskId) -> Result<PathBuf, PlanStoreError> {
        if !task.is_path_safe() {
            return Err(PlanStoreError::InvalidTaskId(task.to_string()));
        }
        Ok(self.root.join(task.as_str()))
    }

    fn read_optional(path: &Path) -> Result<Option<String>, PlanStoreError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl PlanStore for FilePlanStore {
    fn load_plan(&self, task: &TaskId) -> Result<Option<String>, PlanStoreError> {
        Self::read_optional(&self.task_dir(task)?.join(PLAN_FILE))
    }

    fn save_plan(&self, task: &TaskId, plan: &str) -> Result<(), PlanStoreError> {
        let path = self.task_dir(task)?.join(PLAN_FILE);
        write_atomic(&path, plan.as_bytes())?;
        debug!(task = %task, bytes = plan.len(), "Plan saved");
        Ok(())
    }

    fn load_attempts(&self, task: &TaskId) -> Result<Vec<AttemptRecord>, PlanStoreError> {
        match Self::read_optional(&self.task_dir(task)?.join(ATTEMPTS_FILE))? {
            Some(text) => Ok(serde_json::from_str(&text)?),
            None => Ok(Vec::new()),
        }
    }

    fn save_attempts(
        &self,
        task: &TaskId,
        attempts: &[AttemptRecord],
    ) -> Result<(), PlanStoreError> {
        let path = self.task_dir(task)?.join(ATTEMPTS_FILE);
        let json = serde_json::to_vec_pretty(attempts)?;
        write_atomic(&path, &json)?;
        Ok(())
    }
}

/// Write `bytes` to `path` through a sibling temporary file and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// ── In-memory store ────────────────────────────────────────────────

/// Process-local store for library callers that do not persist state.
#[derive(Debug, Default)]
pub struct MemoryPlanStore {
    plans: Mutex<HashMap<TaskId, String>>,
    attempts: Mutex<HashMap<TaskId, Vec<AttemptRecord>>>,
}

impl MemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> PlanStoreError {
    PlanStoreError::Io(std::io::Error::other("plan store lock poisoned"))
}

impl PlanStore for MemoryPlanStore {
    fn load_plan(&self, task: &TaskId) -> Result<Option<String>, PlanStoreError> {
        Ok(self.plans.lock().map_err(|_| poisoned())?.get(task).cloned())
    }

    fn save_plan(&self, task: &TaskId, plan: &str) -> Result<(), PlanStoreError> {
        self.plans
            .lock()
            .map_err(|_| poisoned())?
            .insert(task.clone(), plan.to_string());
        Ok(())
    }

    fn load_attempts(&self, task: &TaskId) -> Result<Vec<AttemptRecord>, PlanStoreError> {
        Ok(self
            .attempts
            .lock()
            .map_err(|_| poisoned())?
            .get(task)
            .cloned()
            .unwrap_or_default())
    }

    fn save_attempts(
        &self,
        task: &TaskId,
        attempts: &[AttemptRecord],
    ) -> Result<(), PlanStoreError> {
        self.attempts
            .lock()
            .map_err(|_| poisoned())?
            .insert(task.clone(), attempts.to_vec());
        Ok(())
    }
}
