//! # ScriptBeat Store
//!
//! File-based durable store — one JSON file per collection, human-readable
//! and git-friendly. Collections are loaded wholesale at startup and
//! rewritten wholesale on every mutation; each rewrite goes through a temp
//! file and an atomic rename so a crash mid-write never corrupts the
//! previous durable state.
//!
//! Reads return point-in-time snapshots. The in-memory mirrors are guarded
//! by a single reader/writer lock, independent of the scheduler's
//! registration lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::de::DeserializeOwned;
use serde::Serialize;

use scriptbeat_core::{Error, NotifierConfig, Result, RunLog, Script, Task};

const TASKS_FILE: &str = "tasks.json";
const SCRIPTS_FILE: &str = "scripts.json";
const LOGS_FILE: &str = "logs.json";
const NOTIFIERS_FILE: &str = "notifiers.json";
const ENV_FILE: &str = "env.json";

#[derive(Default)]
struct Collections {
    tasks: HashMap<String, Task>,
    scripts: HashMap<String, Script>,
    logs: HashMap<String, RunLog>,
    notifiers: HashMap<String, NotifierConfig>,
}

/// Durable store for all persisted entities.
pub struct Store {
    data_dir: PathBuf,
    inner: RwLock<Collections>,
}

impl Store {
    /// Open the store, creating the data directory and loading every
    /// collection. Missing files are empty collections; a corrupt file is
    /// an error.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;

        let collections = Collections {
            tasks: load_collection(&data_dir.join(TASKS_FILE))?,
            scripts: load_collection(&data_dir.join(SCRIPTS_FILE))?,
            logs: load_collection(&data_dir.join(LOGS_FILE))?,
            notifiers: load_collection(&data_dir.join(NOTIFIERS_FILE))?,
        };
        tracing::debug!(
            tasks = collections.tasks.len(),
            scripts = collections.scripts.len(),
            logs = collections.logs.len(),
            "store loaded from {}",
            data_dir.display()
        );

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            inner: RwLock::new(collections),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    // --- Tasks ---

    pub fn tasks(&self) -> Vec<Task> {
        self.inner.read().unwrap().tasks.values().cloned().collect()
    }

    pub fn task(&self, id: &str) -> Result<Task> {
        self.inner
            .read()
            .unwrap()
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("task", id))
    }

    pub fn save_task(&self, task: &Task) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.tasks.insert(task.id.clone(), task.clone());
        self.write_collection(TASKS_FILE, &inner.tasks)
    }

    pub fn delete_task(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.tasks.remove(id);
        self.write_collection(TASKS_FILE, &inner.tasks)
    }

    // --- Scripts ---

    pub fn scripts(&self) -> Vec<Script> {
        self.inner.read().unwrap().scripts.values().cloned().collect()
    }

    pub fn script(&self, id: &str) -> Result<Script> {
        self.inner
            .read()
            .unwrap()
            .scripts
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("script", id))
    }

    pub fn save_script(&self, script: &Script) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.scripts.insert(script.id.clone(), script.clone());
        self.write_collection(SCRIPTS_FILE, &inner.scripts)
    }

    pub fn delete_script(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.scripts.remove(id);
        self.write_collection(SCRIPTS_FILE, &inner.scripts)
    }

    // --- Run logs (append-only) ---

    /// Most recent logs first, truncated to `limit` (0 = no limit).
    pub fn logs(&self, limit: usize) -> Vec<RunLog> {
        let inner = self.inner.read().unwrap();
        let mut logs: Vec<RunLog> = inner.logs.values().cloned().collect();
        logs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if limit > 0 {
            logs.truncate(limit);
        }
        logs
    }

    /// Logs for one task, most recent first.
    pub fn task_logs(&self, task_id: &str, limit: usize) -> Vec<RunLog> {
        let inner = self.inner.read().unwrap();
        let mut logs: Vec<RunLog> = inner
            .logs
            .values()
            .filter(|l| l.task_id == task_id)
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if limit > 0 {
            logs.truncate(limit);
        }
        logs
    }

    pub fn save_log(&self, log: &RunLog) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.logs.insert(log.id.clone(), log.clone());
        self.write_collection(LOGS_FILE, &inner.logs)
    }

    /// Trim the persisted logs to the newest `keep` records.
    pub fn prune_logs(&self, keep: usize) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.logs.len() <= keep {
            return Ok(());
        }
        let mut logs: Vec<RunLog> = inner.logs.values().cloned().collect();
        logs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        logs.truncate(keep);
        inner.logs = logs.into_iter().map(|l| (l.id.clone(), l)).collect();
        self.write_collection(LOGS_FILE, &inner.logs)
    }

    // --- Notifier configs ---

    pub fn notifiers(&self) -> Vec<NotifierConfig> {
        self.inner.read().unwrap().notifiers.values().cloned().collect()
    }

    pub fn notifier(&self, id: &str) -> Result<NotifierConfig> {
        self.inner
            .read()
            .unwrap()
            .notifiers
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("notifier config", id))
    }

    pub fn save_notifier(&self, config: &NotifierConfig) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.notifiers.insert(config.id.clone(), config.clone());
        self.write_collection(NOTIFIERS_FILE, &inner.notifiers)
    }

    pub fn delete_notifier(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.notifiers.remove(id);
        self.write_collection(NOTIFIERS_FILE, &inner.notifiers)
    }

    // --- Environment overrides ---

    /// User-defined env overrides applied to every script process. The file
    /// is edited by the outer layer; the runner only reads it.
    pub fn env_vars(&self) -> HashMap<String, String> {
        let path = self.data_dir.join(ENV_FILE);
        match std::fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!("failed to parse {}: {e}", path.display());
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        }
    }

    pub fn set_env_var(&self, key: &str, value: &str) -> Result<()> {
        let mut vars = self.env_vars();
        vars.insert(key.to_string(), value.to_string());
        write_atomic(&self.data_dir.join(ENV_FILE), &serde_json::to_vec_pretty(&vars)?)
    }

    pub fn unset_env_var(&self, key: &str) -> Result<()> {
        let mut vars = self.env_vars();
        vars.remove(key);
        write_atomic(&self.data_dir.join(ENV_FILE), &serde_json::to_vec_pretty(&vars)?)
    }

    /// Serialize one collection and replace its file atomically.
    /// Called with the inner lock held so writers never interleave.
    fn write_collection<T: Serialize>(&self, file: &str, map: &HashMap<String, T>) -> Result<()> {
        let entities: Vec<&T> = map.values().collect();
        let json = serde_json::to_vec_pretty(&entities)?;
        write_atomic(&self.data_dir.join(file), &json)
    }
}

fn load_collection<T>(path: &Path) -> Result<HashMap<String, T>>
where
    T: DeserializeOwned + HasId,
{
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let json = std::fs::read_to_string(path)?;
    let entities: Vec<T> = serde_json::from_str(&json)?;
    Ok(entities.into_iter().map(|e| (e.id().to_string(), e)).collect())
}

/// Write via a temp file in the same directory, then rename over the target.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

trait HasId {
    fn id(&self) -> &str;
}

impl HasId for Task {
    fn id(&self) -> &str {
        &self.id
    }
}

impl HasId for Script {
    fn id(&self) -> &str {
        &self.id
    }
}

impl HasId for RunLog {
    fn id(&self) -> &str {
        &self.id
    }
}

impl HasId for NotifierConfig {
    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use scriptbeat_core::{models::new_id, NotifierKind, ScriptKind};

    fn temp_store(tag: &str) -> (PathBuf, Store) {
        let dir = std::env::temp_dir().join(format!("scriptbeat-store-{tag}-{}", new_id()));
        let store = Store::open(&dir).unwrap();
        (dir, store)
    }

    fn sample_log(task_id: &str, started_offset_secs: i64) -> RunLog {
        let started = Utc::now() + Duration::seconds(started_offset_secs);
        RunLog {
            id: new_id(),
            task_id: task_id.to_string(),
            task_name: "sample".into(),
            started_at: started,
            ended_at: started + Duration::milliseconds(40),
            duration_ms: 40,
            output: "hello".into(),
            error: String::new(),
            success: true,
        }
    }

    #[test]
    fn roundtrip_survives_reload() {
        let (dir, store) = temp_store("roundtrip");

        let mut task = Task::new("t", "s1", "*/5 * * * * *");
        task.description = "every five seconds".into();
        task.last_run_at = Some(Utc::now());
        store.save_task(&task).unwrap();

        let script = Script::inline("echo", ScriptKind::Shell, "echo hello");
        store.save_script(&script).unwrap();

        let log = sample_log(&task.id, 0);
        store.save_log(&log).unwrap();

        let now = Utc::now();
        let mut settings = serde_json::Map::new();
        settings.insert("webhook".into(), "https://example.com/hook".into());
        settings.insert("secret".into(), "s3cr3t".into());
        let notifier = NotifierConfig {
            id: new_id(),
            kind: NotifierKind::Lark,
            name: "ops channel".into(),
            enabled: true,
            settings,
            created_at: now,
            updated_at: now,
        };
        store.save_notifier(&notifier).unwrap();

        drop(store);
        let reloaded = Store::open(&dir).unwrap();

        let t = reloaded.task(&task.id).unwrap();
        assert_eq!(t.description, task.description);
        assert_eq!(t.last_run_at, task.last_run_at);
        assert_eq!(t.cron, task.cron);

        let s = reloaded.script(&script.id).unwrap();
        assert_eq!(s.source, script.source);
        assert_eq!(s.kind, ScriptKind::Shell);

        let logs = reloaded.logs(0);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].output, "hello");
        assert_eq!(logs[0].started_at, log.started_at);

        let notifiers = reloaded.notifiers();
        assert_eq!(notifiers.len(), 1);
        let n = &notifiers[0];
        assert_eq!(n.id, notifier.id);
        assert_eq!(n.kind, NotifierKind::Lark);
        assert_eq!(n.name, "ops channel");
        assert!(n.enabled);
        assert_eq!(n.setting("webhook"), "https://example.com/hook");
        assert_eq!(n.setting("secret"), "s3cr3t");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn get_unknown_is_not_found() {
        let (dir, store) = temp_store("missing");
        assert!(matches!(
            store.task("nope"),
            Err(Error::NotFound { kind: "task", .. })
        ));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn delete_is_idempotent() {
        let (dir, store) = temp_store("delete");
        let task = Task::new("t", "s", "* * * * * *");
        store.save_task(&task).unwrap();
        store.delete_task(&task.id).unwrap();
        // Deleting again is a no-op, not an error.
        store.delete_task(&task.id).unwrap();
        assert!(store.tasks().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn logs_ordered_and_truncated() {
        let (dir, store) = temp_store("logs");
        for i in 0..5 {
            store.save_log(&sample_log("t1", i)).unwrap();
        }
        let logs = store.logs(3);
        assert_eq!(logs.len(), 3);
        assert!(logs[0].started_at > logs[1].started_at);
        assert!(logs[1].started_at > logs[2].started_at);

        store.prune_logs(2).unwrap();
        assert_eq!(store.logs(0).len(), 2);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn task_logs_filters_by_owner() {
        let (dir, store) = temp_store("tasklogs");
        store.save_log(&sample_log("a", 0)).unwrap();
        store.save_log(&sample_log("b", 1)).unwrap();
        store.save_log(&sample_log("a", 2)).unwrap();
        assert_eq!(store.task_logs("a", 0).len(), 2);
        assert_eq!(store.task_logs("b", 0).len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn env_vars_roundtrip() {
        let (dir, store) = temp_store("env");
        assert!(store.env_vars().is_empty());
        store.set_env_var("API_KEY", "abc123").unwrap();
        store.set_env_var("REGION", "eu").unwrap();
        assert_eq!(store.env_vars().get("API_KEY").unwrap(), "abc123");
        store.unset_env_var("API_KEY").unwrap();
        assert!(!store.env_vars().contains_key("API_KEY"));
        assert_eq!(store.env_vars().len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rewrite_goes_through_temp_file() {
        let (dir, store) = temp_store("atomic");
        store.save_task(&Task::new("t", "s", "* * * * * *")).unwrap();
        // The temp file must not linger after a successful rewrite.
        assert!(dir.join(TASKS_FILE).exists());
        assert!(!dir.join("tasks.json.tmp").exists());
        std::fs::remove_dir_all(&dir).ok();
    }
}
