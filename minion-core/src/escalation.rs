//! Handing exhausted tasks to a human.
//!
//! Sinks are idempotent per task: a second notification for the same task
//! id is skipped and reported as such.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::EscalationSection;
use crate::error::EscalationError;
use crate::plan::write_atomic;
use crate::types::{AttemptRecord, Task, TaskId};

pub const ESCALATION_FILE: &str = "escalation.json";

/// What a reviewer receives when a task runs out of attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationReport {
    pub task_id: TaskId,
    pub description: String,
    pub revision: String,
    pub attempts: Vec<AttemptRecord>,
    pub last_diagnostic: Option<String>,
    pub raised_at: DateTime<Utc>,
}

impl EscalationReport {
    pub fn new(task: &Task, history: &[AttemptRecord]) -> Self {
        let last_diagnostic = history
            .iter()
            .rev()
            .find_map(|a| a.failure.as_ref())
            .map(|f| f.diagnostic().to_string());
        Self {
            task_id: task.id.clone(),
            description: task.description.clone(),
            revision: task.snapshot.revision.clone(),
            attempts: history.to_vec(),
            last_diagnostic,
            raised_at: Utc::now(),
        }
    }
}

#[async_trait::async_trait]
pub trait EscalationSink: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Deliver the escalation. `Ok(false)` when this task was already
    /// escalated through this sink.
    async fn notify(&self, task: &Task, history: &[AttemptRecord]) -> Result<bool, EscalationError>;
}

/// Task ids already handled by a sink.
#[derive(Debug, Default)]
struct Seen(Mutex<HashSet<TaskId>>);

impl Seen {
    /// True the first time `id` is offered.
    fn first(&self, id: &TaskId) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone())
    }

    fn forget(&self, id: &TaskId) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

// ── Log sink ───────────────────────────────────────────────────────

/// Logs the escalation and writes `<state_dir>/<task-id>/escalation.json`.
#[derive(Debug)]
pub struct LogEscalationSink {
    state_dir: PathBuf,
    seen: Seen,
}

impl LogEscalationSink {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            seen: Seen::default(),
        }
    }

    pub fn report_path(&self, task: &TaskId) -> PathBuf {
        self.state_dir.join(task.as_str()).join(ESCALATION_FILE)
    }
}

#[async_trait::async_trait]
#[allow(clippy::unnecessary_literal_bound)]
impl EscalationSink for LogEscalationSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, task: &Task, history: &[AttemptRecord]) -> Result<bool, EscalationError> {
        if !task.id.is_path_safe() {
            return Err(EscalationError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unsafe task id: {}", task.id),
            )));
        }
        let path = self.report_path(&task.id);
        if !self.seen.first(&task.id) || path.exists() {
            return Ok(false);
        }
        let report = EscalationReport::new(task, history);
        warn!(
            task = %task.id,
            attempts = history.len(),
            last_diagnostic = report.last_diagnostic.as_deref().unwrap_or(""),
            "Task escalated for human review"
        );
        let json = serde_json::to_vec_pretty(&report)?;
        if let Err(e) = write_atomic(&path, &json) {
            self.seen.forget(&task.id);
            return Err(e.into());
        }
        Ok(true)
    }
}

// ── Webhook sink ───────────────────────────────────────────────────

/// POSTs the [`EscalationReport`] as JSON.
#[derive(Debug)]
pub struct WebhookEscalationSink {
    client: Client,
    url: String,
    seen: Seen,
}

impl WebhookEscalationSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: crate::http::client(),
            url: url.into(),
            seen: Seen::default(),
        }
    }
}

#[async_trait::async_trait]
#[allow(clippy::unnecessary_literal_bound)]
impl EscalationSink for WebhookEscalationSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, task: &Task, history: &[AttemptRecord]) -> Result<bool, EscalationError> {
        if !self.seen.first(&task.id) {
            return Ok(false);
        }
        let report = EscalationReport::new(task, history);
        let result = self
            .client
            .post(&self.url)
            .header("User-Agent", concat!("minion/", env!("CARGO_PKG_VERSION")))
            .json(&report)
            .send()
            .await;
        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                self.seen.forget(&task.id);
                return Err(EscalationError::Network(e.to_string()));
            }
        };
        if !resp.status().is_success() {
            self.seen.forget(&task.id);
            return Err(EscalationError::Status(resp.status().as_u16()));
        }
        info!(task = %task.id, url = %self.url, "Escalation webhook delivered");
        Ok(true)
    }
}

// ── Fan-out ────────────────────────────────────────────────────────

/// Notifies every inner sink; fails if any of them failed.
#[derive(Debug)]
pub struct MultiSink {
    sinks: Vec<Arc<dyn EscalationSink>>,
}

impl MultiSink {
    pub fn new(sinks: Vec<Arc<dyn EscalationSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait::async_trait]
#[allow(clippy::unnecessary_literal_bound)]
impl EscalationSink for MultiSink {
    fn name(&self) -> &str {
        "multi"
    }

    async fn notify(&self, task: &Task, history: &[AttemptRecord]) -> Result<bool, EscalationError> {
        let mut delivered = false;
        let mut first_error = None;
        for sink in &self.sinks {
            match sink.notify(task, history).await {
                Ok(d) => delivered |= d,
                Err(e) => {
                    warn!(sink = sink.name(), error = %e, "Escalation sink failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(delivered),
        }
    }
}

/// Log sink, plus the webhook when one is configured.
pub fn sink_from_config(section: &EscalationSection, state_dir: PathBuf) -> Arc<dyn EscalationSink> {
    let log: Arc<dyn EscalationSink> = Arc::new(LogEscalationSink::new(state_dir));
    match &section.webhook_url {
        Some(url) if !url.trim().is_empty() => Arc::new(MultiSink::new(vec![
            log,
            Arc::new(WebhookEscalationSink::new(url.clone())),
        ])),
        _ => log,
    }
}
