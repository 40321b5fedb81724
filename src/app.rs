//! App service — the outer surface a UI or CLI talks to.
//!
//! Wires the store, runner, scheduler, and notifier together and keeps the
//! scheduler's registrations consistent with persisted task status on every
//! mutating call.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use scriptbeat_core::{
    models::new_id, NotifierConfig, Result, RunLog, Script, ServiceConfig, Task, TaskStatus,
};
use scriptbeat_notify::Notifier;
use scriptbeat_runner::ScriptRunner;
use scriptbeat_scheduler::{Schedule, Scheduler};
use scriptbeat_store::Store;

/// Aggregate counters for the dashboard/CLI.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total_tasks: usize,
    pub active_tasks: usize,
    pub total_logs: usize,
    pub success_logs: usize,
    pub failed_logs: usize,
    pub scheduler_running: bool,
}

pub struct App {
    config: ServiceConfig,
    store: Arc<Store>,
    runner: Arc<ScriptRunner>,
    notifier: Arc<Notifier>,
    scheduler: Scheduler,
}

impl App {
    /// Open every component against the configured data directory.
    pub fn open(config: ServiceConfig) -> Result<Self> {
        let store = Arc::new(Store::open(&config.data_dir)?);
        let runner = Arc::new(ScriptRunner::new(&config.scripts_dir())?);
        let notifier = Arc::new(Notifier::new());
        notifier.set_configs(store.notifiers());

        let scheduler = Scheduler::new(
            store.clone(),
            runner.clone(),
            notifier.clone(),
            Duration::from_secs(config.scheduled_timeout_secs),
        );

        Ok(Self {
            config,
            store,
            runner,
            notifier,
            scheduler,
        })
    }

    pub async fn start(&self) -> Result<()> {
        if let Err(e) = self.store.prune_logs(self.config.log_retention) {
            tracing::warn!("log pruning failed: {e}");
        }
        self.scheduler.start().await
    }

    pub async fn stop(&self) {
        self.scheduler.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    // --- Tasks ---

    pub fn tasks(&self) -> Vec<Task> {
        self.store.tasks()
    }

    pub fn task(&self, id: &str) -> Result<Task> {
        self.store.task(id)
    }

    /// Persist a new task and register it when active. Id and timestamps are
    /// assigned here.
    pub fn create_task(&self, mut task: Task) -> Result<Task> {
        // Reject bad cron upfront so the task never lands half-usable.
        Schedule::parse(&task.cron)?;
        let now = Utc::now();
        task.id = new_id();
        task.created_at = now;
        task.updated_at = now;
        task.last_run_at = None;
        task.next_run_at = None;
        self.store.save_task(&task)?;
        self.scheduler.add_task(&task)?;
        Ok(task)
    }

    /// Update a task; the scheduler drops the old registration and
    /// re-registers when the new status is active.
    pub fn update_task(&self, mut task: Task) -> Result<Task> {
        let old = self.store.task(&task.id)?;
        task.created_at = old.created_at;
        task.updated_at = Utc::now();
        self.store.save_task(&task)?;
        self.scheduler.update_task(&task)?;
        Ok(task)
    }

    pub fn delete_task(&self, id: &str) -> Result<()> {
        self.scheduler.remove_task(id);
        self.store.delete_task(id)
    }

    pub fn set_task_status(&self, id: &str, status: TaskStatus) -> Result<Task> {
        let mut task = self.store.task(id)?;
        task.status = status;
        task.updated_at = Utc::now();
        self.store.save_task(&task)?;
        self.scheduler.update_task(&task)?;
        Ok(task)
    }

    /// One immediate out-of-band execution of a task.
    pub fn run_task_now(&self, id: &str) -> Result<()> {
        self.scheduler.run_now(id)
    }

    // --- Scripts ---

    pub fn scripts(&self) -> Vec<Script> {
        self.store.scripts()
    }

    pub fn script(&self, id: &str) -> Result<Script> {
        self.store.script(id)
    }

    pub fn create_script(&self, mut script: Script) -> Result<Script> {
        let now = Utc::now();
        script.id = new_id();
        script.created_at = now;
        script.updated_at = now;
        script.last_run_at = None;
        self.store.save_script(&script)?;
        Ok(script)
    }

    pub fn update_script(&self, mut script: Script) -> Result<Script> {
        let old = self.store.script(&script.id)?;
        script.created_at = old.created_at;
        script.updated_at = Utc::now();
        self.store.save_script(&script)?;
        Ok(script)
    }

    /// No cascade: tasks referencing this script keep their registration and
    /// fail per-firing with a recorded error.
    pub fn delete_script(&self, id: &str) -> Result<()> {
        self.store.delete_script(id)
    }

    /// Ad-hoc run of a script with no owning task, bounded by the manual
    /// ceiling. Waits for completion and returns the record.
    pub async fn run_script(&self, id: &str, notify: bool) -> Result<RunLog> {
        let mut script = self.store.script(id)?;
        let ceiling = Duration::from_secs(self.config.manual_timeout_secs);
        let log = self.runner.run_script(&script, ceiling).await;

        if let Err(e) = self.store.save_log(&log) {
            tracing::warn!("failed to persist run log: {e}");
        }
        if let Err(e) = self.store.prune_logs(self.config.log_retention) {
            tracing::warn!("log pruning failed: {e}");
        }

        script.last_run_at = Some(Utc::now());
        if let Err(e) = self.store.save_script(&script) {
            tracing::warn!("failed to persist script last run time: {e}");
        }

        if notify {
            self.notifier.notify(&log);
        }
        Ok(log)
    }

    // --- Run logs ---

    pub fn logs(&self, limit: usize) -> Vec<RunLog> {
        self.store.logs(limit)
    }

    pub fn task_logs(&self, task_id: &str, limit: usize) -> Vec<RunLog> {
        self.store.task_logs(task_id, limit)
    }

    // --- Notifier configs ---

    pub fn notifier_configs(&self) -> Vec<NotifierConfig> {
        self.store.notifiers()
    }

    pub fn save_notifier_config(&self, mut config: NotifierConfig) -> Result<NotifierConfig> {
        if config.id.is_empty() {
            config.id = new_id();
            config.created_at = Utc::now();
        }
        config.updated_at = Utc::now();
        self.store.save_notifier(&config)?;
        self.notifier.set_configs(self.store.notifiers());
        Ok(config)
    }

    pub fn delete_notifier_config(&self, id: &str) -> Result<()> {
        self.store.delete_notifier(id)?;
        self.notifier.set_configs(self.store.notifiers());
        Ok(())
    }

    // --- Environment overrides ---

    pub fn env_vars(&self) -> std::collections::HashMap<String, String> {
        self.store.env_vars()
    }

    pub fn set_env_var(&self, key: &str, value: &str) -> Result<()> {
        self.store.set_env_var(key, value)
    }

    pub fn unset_env_var(&self, key: &str) -> Result<()> {
        self.store.unset_env_var(key)
    }

    // --- Misc ---

    pub fn validate_cron(&self, expr: &str) -> Result<()> {
        Schedule::parse(expr).map(|_| ())
    }

    pub fn stats(&self) -> Stats {
        let tasks = self.store.tasks();
        let logs = self.store.logs(0);
        let active_tasks = tasks.iter().filter(|t| t.is_active()).count();
        let success_logs = logs.iter().filter(|l| l.success).count();
        Stats {
            total_tasks: tasks.len(),
            active_tasks,
            total_logs: logs.len(),
            success_logs,
            failed_logs: logs.len() - success_logs,
            scheduler_running: self.scheduler.is_running(),
        }
    }
}
