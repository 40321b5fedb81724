//! Persisted data model — tasks, scripts, run logs, notifier configs.
//!
//! Field names are camelCase on the wire so the JSON files on disk stay
//! readable and stable across versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a task. Only active tasks hold a live registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Inactive,
}

/// Which interpreter runs a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptKind {
    Python,
    Nodejs,
    Shell,
}

impl ScriptKind {
    /// File extension used when inline source is materialized to disk.
    pub fn extension(&self) -> &'static str {
        match self {
            ScriptKind::Python => "py",
            ScriptKind::Nodejs => "js",
            ScriptKind::Shell => "sh",
        }
    }
}

impl std::fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptKind::Python => write!(f, "python"),
            ScriptKind::Nodejs => write!(f, "nodejs"),
            ScriptKind::Shell => write!(f, "shell"),
        }
    }
}

/// A schedule binding a script to a cron expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub name: String,
    /// Identity of the script this task runs. Join by reference only —
    /// deleting the script does not cascade here.
    pub script_id: String,
    /// Six-field cron expression (seconds enabled): `SEC MIN HOUR DOM MON DOW`.
    pub cron: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    /// Next predicted firing. Authoritative only while the task holds a live
    /// registration; stale once unregistered.
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new active task with a fresh id and current timestamps.
    pub fn new(name: &str, script_id: &str, cron: &str) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: name.to_string(),
            script_id: script_id.to_string(),
            cron: cron.to_string(),
            status: TaskStatus::Active,
            description: String::new(),
            created_at: now,
            updated_at: now,
            last_run_at: None,
            next_run_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TaskStatus::Active
    }
}

/// Executable source, referenced by path or carried inline.
/// A non-empty `path` that exists on disk takes precedence over `source`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Script {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub kind: ScriptKind,
    /// Filesystem path to the script, if it lives outside the store.
    #[serde(default)]
    pub path: String,
    /// Inline source text, materialized to a temp file at execution time.
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Script {
    /// Create an inline script with a fresh id.
    pub fn inline(name: &str, kind: ScriptKind, source: &str) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: name.to_string(),
            description: String::new(),
            kind,
            path: String::new(),
            source: source.to_string(),
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
            last_run_at: None,
        }
    }
}

/// One execution outcome. Append-only: never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLog {
    pub id: String,
    /// Owning task identity; empty for ad-hoc script runs.
    #[serde(default)]
    pub task_id: String,
    pub task_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: i64,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: String,
    pub success: bool,
}

/// Notification channel kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifierKind {
    Dingtalk,
    Wecom,
    Lark,
    Webhook,
    Email,
}

/// One configured notification endpoint. Consumed by the scheduler side,
/// never mutated by it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifierConfig {
    pub id: String,
    pub kind: NotifierKind,
    pub name: String,
    pub enabled: bool,
    /// Channel-specific settings, e.g. `webhook` URL, Lark `secret`.
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NotifierConfig {
    /// Fetch a string-valued setting, empty when absent.
    pub fn setting(&self, key: &str) -> &str {
        self.settings.get(key).and_then(|v| v.as_str()).unwrap_or("")
    }
}

/// Fresh entity identity.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_roundtrips_through_json() {
        let mut task = Task::new("nightly", "script-1", "0 0 2 * * *");
        task.last_run_at = Some(Utc::now());
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"scriptId\""));
        assert!(json.contains("\"lastRunAt\""));
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, task.id);
        assert_eq!(back.cron, task.cron);
        assert_eq!(back.status, TaskStatus::Active);
        assert_eq!(back.last_run_at, task.last_run_at);
    }

    #[test]
    fn script_kind_serde_names() {
        assert_eq!(serde_json::to_string(&ScriptKind::Nodejs).unwrap(), "\"nodejs\"");
        assert_eq!(serde_json::to_string(&ScriptKind::Python).unwrap(), "\"python\"");
        let kind: ScriptKind = serde_json::from_str("\"shell\"").unwrap();
        assert_eq!(kind, ScriptKind::Shell);
    }

    #[test]
    fn notifier_setting_lookup() {
        let mut settings = serde_json::Map::new();
        settings.insert("webhook".into(), serde_json::json!("https://example.com/hook"));
        let cfg = NotifierConfig {
            id: new_id(),
            kind: NotifierKind::Webhook,
            name: "hook".into(),
            enabled: true,
            settings,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(cfg.setting("webhook"), "https://example.com/hook");
        assert_eq!(cfg.setting("missing"), "");
    }
}
