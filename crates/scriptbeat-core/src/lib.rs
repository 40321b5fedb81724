//! # ScriptBeat Core
//!
//! Shared foundation for the ScriptBeat workspace: the persisted data model
//! (tasks, scripts, run logs, notifier configs), the central error type, and
//! service configuration.

pub mod config;
pub mod error;
pub mod models;

pub use config::ServiceConfig;
pub use error::{Error, Result};
pub use models::{
    NotifierConfig, NotifierKind, RunLog, Script, ScriptKind, Task, TaskStatus,
};
