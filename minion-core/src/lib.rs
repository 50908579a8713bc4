//! Minion core library: the bounded attempt loop and everything it drives.
//!
//! The main entry point is [`orchestrator::TaskRunner`], which takes a
//! [`types::Task`] through context assembly, reasoning, sandboxed lint and
//! test gates, and finally publication or escalation.

pub mod config;
pub mod context;
pub mod error;
pub mod escalation;
pub mod gates;
pub mod http;
pub mod llm;
pub mod orchestrator;
pub mod plan;
pub mod progress;
pub mod publish;
pub mod reasoning;
pub mod sandbox;
pub mod tools;
pub mod types;

pub use error::{MinionError, Result};
pub use orchestrator::TaskRunner;
