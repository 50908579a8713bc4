//! Progress reporting for task runs.
//!
//! The CLI uses `IndicatifReporter` for a live spinner; library callers use
//! `NoopReporter` or their own implementation.

use std::sync::atomic::{AtomicU64, Ordering};

use indicatif::{ProgressBar, ProgressStyle};

use crate::types::{TaskId, TaskState};

/// Receives build steps and attempt state transitions.
pub trait ProgressReporter: Send + Sync {
    /// Begin a step with an optional total count.
    fn start(&self, step: &str, total: Option<u64>);

    fn advance(&self, amount: u64);

    fn finish(&self);

    fn message(&self, msg: &str);

    /// Called on every state change of a task.
    fn transition(&self, task: &TaskId, from: TaskState, to: TaskState) {
        self.message(&format!("[{task}] {from} -> {to}"));
    }
}

#[derive(Debug, Default)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn start(&self, _step: &str, _total: Option<u64>) {}
    fn advance(&self, _amount: u64) {}
    fn finish(&self) {}
    fn message(&self, _msg: &str) {}
    fn transition(&self, _task: &TaskId, _from: TaskState, _to: TaskState) {}
}

/// Reporter backed by an `indicatif` bar on stderr.
#[derive(Debug)]
pub struct IndicatifReporter {
    bar: ProgressBar,
    completed: AtomicU64,
}

impl Default for IndicatifReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl IndicatifReporter {
    pub fn new() -> Self {
        Self::with_bar(ProgressBar::new_spinner())
    }

    /// A reporter that renders nothing (non-interactive output).
    pub fn hidden() -> Self {
        Self::with_bar(ProgressBar::hidden())
    }

    fn with_bar(bar: ProgressBar) -> Self {
        Self {
            bar,
            completed: AtomicU64::new(0),
        }
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

impl ProgressReporter for IndicatifReporter {
    fn start(&self, step: &str, total: Option<u64>) {
        self.completed.store(0, Ordering::Relaxed);
        let style = if let Some(total) = total {
            self.bar.set_length(total);
            ProgressStyle::with_template(
                "{spinner:.green} {msg} [{bar:30.cyan/blue}] {pos}/{len} ({eta})",
            )
            .map(|s| s.progress_chars("=> "))
        } else {
            self.bar.set_length(0);
            ProgressStyle::with_template("{spinner:.green} {msg}")
        };
        self.bar
            .set_style(style.unwrap_or_else(|_| ProgressStyle::default_spinner()));
        self.bar.set_message(step.to_string());
        self.bar.reset();
    }

    fn advance(&self, amount: u64) {
        self.completed.fetch_add(amount, Ordering::Relaxed);
        self.bar.inc(amount);
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }

    fn message(&self, msg: &str) {
        self.bar.println(msg);
    }

    fn transition(&self, task: &TaskId, _from: TaskState, to: TaskState) {
        self.bar.set_message(format!("{task}: {to}"));
        self.bar.tick();
    }
}
