//! Scheduler engine — registration map plus the clock loop.
//!
//! One global clock (a one-second tokio interval) drives every registered
//! task. Each due firing is dispatched as its own tokio task, so a slow
//! script never delays other tasks or the clock. Overlapping runs of the
//! same task are allowed; timestamp writes are last-write-wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use scriptbeat_core::{Error, Result, RunLog, Task};
use scriptbeat_notify::Notifier;
use scriptbeat_runner::ScriptRunner;
use scriptbeat_store::Store;

use crate::cron::Schedule;

/// Live binding between a task identity and the clock.
struct Registration {
    schedule: Schedule,
    next_fire: DateTime<Utc>,
}

/// The clock task and its shutdown signal.
struct Clock {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    store: Arc<Store>,
    runner: Arc<ScriptRunner>,
    notifier: Arc<Notifier>,
    /// Wall-clock ceiling for scheduled runs.
    ceiling: Duration,
    /// task id → live registration. Lookups during tick bookkeeping take the
    /// read side; register/unregister take the write side.
    registrations: RwLock<HashMap<String, Registration>>,
    /// Executions dispatched by ticks and `run_now`. `stop()` drains this so
    /// every record already in flight is durable before it returns.
    executions: std::sync::Mutex<JoinSet<()>>,
    clock: tokio::sync::Mutex<Option<Clock>>,
    running: AtomicBool,
}

/// The scheduler. Cheap to clone; all clones share one registration map.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        runner: Arc<ScriptRunner>,
        notifier: Arc<Notifier>,
        scheduled_ceiling: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                runner,
                notifier,
                ceiling: scheduled_ceiling,
                registrations: RwLock::new(HashMap::new()),
                executions: std::sync::Mutex::new(JoinSet::new()),
                clock: tokio::sync::Mutex::new(None),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Load persisted tasks, register every active one, start the clock.
    /// Individual registration failures are logged and skipped; they never
    /// abort startup of the remaining tasks.
    pub async fn start(&self) -> Result<()> {
        let mut clock = self.inner.clock.lock().await;
        if clock.is_some() {
            return Err(Error::AlreadyRunning);
        }

        for task in self.inner.store.tasks() {
            if !task.is_active() {
                continue;
            }
            if let Err(e) = self.inner.register(&task) {
                tracing::warn!("failed to register task '{}': {e}", task.name);
            }
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => Inner::dispatch_due(&inner),
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        *clock = Some(Clock { shutdown, handle });
        self.inner.running.store(true, Ordering::SeqCst);
        tracing::info!("scheduler started");
        Ok(())
    }

    /// Stop the clock, wait for it to quiesce, then wait for every
    /// execution already dispatched to finish its bookkeeping. Script
    /// processes themselves are not cancelled — only the per-run timeout
    /// terminates a runaway script. Idempotent.
    pub async fn stop(&self) {
        let clock = self.inner.clock.lock().await.take();
        let Some(clock) = clock else { return };

        let _ = clock.shutdown.send(true);
        if let Err(e) = clock.handle.await {
            tracing::warn!("clock task ended abnormally: {e}");
        }

        // The clock is gone, so nothing new lands in the set while we drain.
        let mut executions = std::mem::take(&mut *self.inner.executions.lock().unwrap());
        while let Some(res) = executions.join_next().await {
            if let Err(e) = res {
                tracing::warn!("execution task ended abnormally: {e}");
            }
        }

        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.registrations.write().unwrap().clear();
        tracing::info!("scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Register a task if it is active; inactive tasks are a no-op.
    pub fn add_task(&self, task: &Task) -> Result<()> {
        if task.is_active() {
            self.inner.register(task)?;
        }
        Ok(())
    }

    /// Unregister a task. Unknown identities are a no-op, not an error.
    pub fn remove_task(&self, id: &str) {
        let removed = self.inner.registrations.write().unwrap().remove(id);
        if removed.is_some() {
            tracing::info!("unregistered task {id}");
        }
    }

    /// Unconditionally unregister, then re-register when active. This is the
    /// only way to change a live task's cron expression.
    pub fn update_task(&self, task: &Task) -> Result<()> {
        self.remove_task(&task.id);
        self.add_task(task)
    }

    /// One immediate out-of-band execution. Leaves the recurring
    /// registration and its next firing untouched.
    pub fn run_now(&self, id: &str) -> Result<()> {
        let task = self.inner.store.task(id)?;
        self.inner.dispatch(self.inner.clone(), task.id);
        Ok(())
    }

    /// Number of live registrations.
    pub fn registered_count(&self) -> usize {
        self.inner.registrations.read().unwrap().len()
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.inner.registrations.read().unwrap().contains_key(id)
    }
}

impl Inner {
    /// Insert a registration for the task and persist its predicted next
    /// firing. Replaces any previous registration for the same identity.
    fn register(&self, task: &Task) -> Result<()> {
        let schedule = Schedule::parse(&task.cron)?;
        let now = Utc::now();
        let next_fire = schedule.next_after(now).ok_or_else(|| Error::InvalidSchedule {
            expr: task.cron.clone(),
            reason: "no firing within the search horizon".to_string(),
        })?;

        self.registrations.write().unwrap().insert(
            task.id.clone(),
            Registration {
                schedule,
                next_fire,
            },
        );

        let mut task = task.clone();
        task.next_run_at = Some(next_fire);
        if let Err(e) = self.store.save_task(&task) {
            tracing::warn!("failed to persist next run time for '{}': {e}", task.name);
        }
        tracing::info!("registered task '{}' (cron: {})", task.name, task.cron);
        Ok(())
    }

    /// One clock tick: advance every due registration under the write lock,
    /// then dispatch each due firing as an independent tokio task.
    fn dispatch_due(inner: &Arc<Inner>) {
        let now = Utc::now();
        let mut due: Vec<String> = Vec::new();
        {
            let mut regs = inner.registrations.write().unwrap();
            let mut exhausted: Vec<String> = Vec::new();
            for (id, reg) in regs.iter_mut() {
                if reg.next_fire > now {
                    continue;
                }
                due.push(id.clone());
                match reg.schedule.next_after(now) {
                    Some(next) => reg.next_fire = next,
                    None => exhausted.push(id.clone()),
                }
            }
            for id in exhausted {
                tracing::warn!("task {id} has no further firings; unregistering");
                regs.remove(&id);
            }
        }

        for id in due {
            inner.dispatch(inner.clone(), id);
        }
    }

    /// Spawn one execution into the tracked set so `stop()` can wait on it.
    fn dispatch(&self, inner: Arc<Inner>, task_id: String) {
        let mut executions = self.executions.lock().unwrap();
        // Reap whatever already finished so the set never grows unbounded.
        while executions.try_join_next().is_some() {}
        executions.spawn(async move {
            Inner::execute(inner, task_id).await;
        });
    }

    /// One execution attempt. Every failure here is contained: logged,
    /// recorded where possible, and never propagated to the clock.
    async fn execute(inner: Arc<Inner>, task_id: String) {
        let mut task = match inner.store.task(&task_id) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("skipping firing, task {task_id} unavailable: {e}");
                return;
            }
        };

        // Persist the "this ran" fact before execution so a crash mid-run
        // does not lose it.
        task.last_run_at = Some(Utc::now());
        if let Err(e) = inner.store.save_task(&task) {
            tracing::warn!("failed to persist last run time for '{}': {e}", task.name);
        }

        let log = match inner.store.script(&task.script_id) {
            Ok(mut script) => {
                tracing::info!("executing task '{}'", task.name);
                let log = inner.runner.run_task(&task, &script, inner.ceiling).await;

                script.last_run_at = Some(Utc::now());
                if let Err(e) = inner.store.save_script(&script) {
                    tracing::warn!("failed to persist script last run time: {e}");
                }
                log
            }
            Err(e) => {
                tracing::warn!("task '{}' references a missing script: {e}", task.name);
                failure_log(&task, format!("script not found: {}", task.script_id))
            }
        };

        if log.success {
            tracing::info!("task '{}' completed in {}ms", task.name, log.duration_ms);
        } else {
            tracing::warn!("task '{}' failed: {}", task.name, log.error);
        }
        if let Err(e) = inner.store.save_log(&log) {
            tracing::warn!("failed to persist run log for '{}': {e}", task.name);
        }

        // The clock's own prediction is authoritative, but only while the
        // registration survived to execution time.
        let next_fire = inner
            .registrations
            .read()
            .unwrap()
            .get(&task_id)
            .map(|reg| reg.next_fire);
        if let Some(next) = next_fire {
            task.next_run_at = Some(next);
            if let Err(e) = inner.store.save_task(&task) {
                tracing::warn!("failed to persist next run time for '{}': {e}", task.name);
            }
        }

        inner.notifier.notify(&log);
    }
}

/// Execution record for a firing that could not start.
fn failure_log(task: &Task, error: String) -> RunLog {
    let now = Utc::now();
    RunLog {
        id: scriptbeat_core::models::new_id(),
        task_id: task.id.clone(),
        task_name: task.name.clone(),
        started_at: now,
        ended_at: now,
        duration_ms: 0,
        output: String::new(),
        error,
        success: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scriptbeat_core::{models::new_id, Script, ScriptKind, TaskStatus};
    use std::path::PathBuf;

    struct Fixture {
        dir: PathBuf,
        store: Arc<Store>,
        scheduler: Scheduler,
    }

    impl Fixture {
        fn new(tag: &str) -> Self {
            let dir = std::env::temp_dir().join(format!("scriptbeat-engine-{tag}-{}", new_id()));
            let store = Arc::new(Store::open(&dir).unwrap());
            let runner = Arc::new(ScriptRunner::new(&dir.join("scripts")).unwrap());
            let notifier = Arc::new(Notifier::new());
            let scheduler = Scheduler::new(
                store.clone(),
                runner,
                notifier,
                Duration::from_secs(60),
            );
            Self {
                dir,
                store,
                scheduler,
            }
        }

        fn add_shell_task(&self, name: &str, cron: &str, source: &str, status: TaskStatus) -> Task {
            let script = Script::inline(name, ScriptKind::Shell, source);
            self.store.save_script(&script).unwrap();
            let mut task = Task::new(name, &script.id, cron);
            task.status = status;
            self.store.save_task(&task).unwrap();
            task
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.dir).ok();
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_registers_only_active_tasks() {
        let fx = Fixture::new("start");
        let active = fx.add_shell_task("a", "0 0 3 * * *", "echo a", TaskStatus::Active);
        fx.add_shell_task("b", "0 0 3 * * *", "echo b", TaskStatus::Inactive);

        fx.scheduler.start().await.unwrap();
        assert!(fx.scheduler.is_running());
        assert_eq!(fx.scheduler.registered_count(), 1);
        assert!(fx.scheduler.is_registered(&active.id));

        // Registration persisted a prediction.
        let persisted = fx.store.task(&active.id).unwrap();
        assert!(persisted.next_run_at.is_some());

        assert!(matches!(
            fx.scheduler.start().await,
            Err(Error::AlreadyRunning)
        ));

        fx.scheduler.stop().await;
        assert!(!fx.scheduler.is_running());
        // Idempotent.
        fx.scheduler.stop().await;

        // Restartable after a stop.
        fx.scheduler.start().await.unwrap();
        fx.scheduler.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bad_cron_at_startup_skips_only_that_task() {
        let fx = Fixture::new("badcron");
        fx.add_shell_task("broken", "not a cron", "echo x", TaskStatus::Active);
        let good = fx.add_shell_task("good", "0 0 3 * * *", "echo y", TaskStatus::Active);

        fx.scheduler.start().await.unwrap();
        assert_eq!(fx.scheduler.registered_count(), 1);
        assert!(fx.scheduler.is_registered(&good.id));
        fx.scheduler.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn every_second_task_produces_a_run_log() {
        let fx = Fixture::new("fires");
        let task = fx.add_shell_task("hello", "* * * * * *", "echo hello", TaskStatus::Active);

        fx.scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2600)).await;
        fx.scheduler.stop().await;

        let logs = fx.store.task_logs(&task.id, 0);
        assert!(!logs.is_empty(), "expected at least one firing");
        assert!(logs[0].success, "error: {}", logs[0].error);
        assert!(logs[0].output.contains("hello"));

        let persisted = fx.store.task(&task.id).unwrap();
        assert!(persisted.last_run_at.is_some());
        assert!(persisted.next_run_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_waits_for_in_flight_executions() {
        let fx = Fixture::new("drain");
        let task =
            fx.add_shell_task("slow", "* * * * * *", "sleep 2; echo done", TaskStatus::Active);

        fx.scheduler.start().await.unwrap();
        // Long enough for at least one firing to dispatch, short enough that
        // the script is still sleeping when stop is called.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        fx.scheduler.stop().await;

        // The record must be durable by the time stop returns.
        let logs = fx.store.task_logs(&task.id, 0);
        assert!(!logs.is_empty(), "stop returned before bookkeeping finished");
        assert!(logs[0].success, "error: {}", logs[0].error);
        assert!(logs[0].output.contains("done"));
        assert!(fx.store.task(&task.id).unwrap().last_run_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn two_tasks_same_cron_fire_independently() {
        let fx = Fixture::new("pair");
        let t1 = fx.add_shell_task("one", "* * * * * *", "echo one", TaskStatus::Active);
        let t2 = fx.add_shell_task("two", "* * * * * *", "echo two", TaskStatus::Active);

        fx.scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2600)).await;
        fx.scheduler.stop().await;

        let l1 = fx.store.task_logs(&t1.id, 0);
        let l2 = fx.store.task_logs(&t2.id, 0);
        assert!(!l1.is_empty() && !l2.is_empty());
        assert!(l1[0].output.contains("one"));
        assert!(l2[0].output.contains("two"));
        assert!(fx.store.task(&t1.id).unwrap().last_run_at.is_some());
        assert!(fx.store.task(&t2.id).unwrap().last_run_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_toggle_leaves_exactly_one_registration() {
        let fx = Fixture::new("toggle");
        let mut task = fx.add_shell_task("t", "0 0 3 * * *", "echo t", TaskStatus::Active);

        fx.scheduler.add_task(&task).unwrap();
        assert_eq!(fx.scheduler.registered_count(), 1);

        task.status = TaskStatus::Inactive;
        fx.scheduler.update_task(&task).unwrap();
        assert_eq!(fx.scheduler.registered_count(), 0);

        task.status = TaskStatus::Active;
        fx.scheduler.update_task(&task).unwrap();
        assert_eq!(fx.scheduler.registered_count(), 1);

        // Re-adding replaces rather than duplicates.
        fx.scheduler.update_task(&task).unwrap();
        assert_eq!(fx.scheduler.registered_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remove_unknown_task_is_a_noop() {
        let fx = Fixture::new("rm");
        fx.scheduler.remove_task("no-such-id");
        assert_eq!(fx.scheduler.registered_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inactive_task_is_not_registered() {
        let fx = Fixture::new("inactive");
        let task = fx.add_shell_task("t", "0 0 3 * * *", "echo t", TaskStatus::Inactive);
        fx.scheduler.add_task(&task).unwrap();
        assert_eq!(fx.scheduler.registered_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_cron_is_rejected_on_add() {
        let fx = Fixture::new("invalid");
        let task = fx.add_shell_task("t", "*/x * * * * *", "echo t", TaskStatus::Active);
        assert!(matches!(
            fx.scheduler.add_task(&task),
            Err(Error::InvalidSchedule { .. })
        ));
        assert_eq!(fx.scheduler.registered_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn run_now_unknown_id_is_not_found() {
        let fx = Fixture::new("rnmissing");
        assert!(matches!(
            fx.scheduler.run_now("ghost"),
            Err(Error::NotFound { .. })
        ));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(fx.store.logs(0).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn run_now_executes_without_a_registration() {
        let fx = Fixture::new("rn");
        // Inactive: never registered, still runnable on demand.
        let task = fx.add_shell_task("manual", "0 0 3 * * *", "echo manual", TaskStatus::Inactive);

        fx.scheduler.run_now(&task.id).unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let logs = fx.store.task_logs(&task.id, 0);
        assert_eq!(logs.len(), 1);
        assert!(logs[0].success);
        assert!(logs[0].output.contains("manual"));
        assert_eq!(fx.scheduler.registered_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_script_yields_contained_failure_record() {
        let fx = Fixture::new("ghostscript");
        let mut task = Task::new("orphan", "ghost-script-id", "* * * * * *");
        task.status = TaskStatus::Active;
        fx.store.save_task(&task).unwrap();

        fx.scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2600)).await;
        fx.scheduler.stop().await;

        let logs = fx.store.task_logs(&task.id, 0);
        assert!(!logs.is_empty());
        assert!(!logs[0].success);
        assert!(logs[0].error.contains("script not found"));
    }
}
