//! # ScriptBeat Runner
//!
//! Spawns one external interpreter process per invocation: resolves the
//! script (file path wins over inline source), picks the interpreter binary,
//! overlays user env vars, enforces a wall-clock ceiling, and reports a
//! structured outcome. A failed run is data, never a crash.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio::process::Command;

use scriptbeat_core::{models::new_id, Error, Result, RunLog, Script, ScriptKind, Task};

/// Common node install locations checked when PATH lookup fails.
/// GUI-launched processes often see a truncated PATH compared to a shell.
const NODE_FALLBACK_PATHS: &[&str] = &[
    "/opt/homebrew/bin/node",
    "/usr/local/bin/node",
    "/usr/bin/node",
    "/bin/node",
];

/// Outcome of one script execution.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Captured stdout, with stderr appended under a `[STDERR]` marker.
    pub output: String,
    /// Human-readable failure description, empty on success.
    pub error: String,
    pub success: bool,
}

impl RunOutcome {
    fn failure(output: String, error: String) -> Self {
        Self {
            output,
            error,
            success: false,
        }
    }
}

/// Script runner bound to a managed scripts directory.
pub struct ScriptRunner {
    scripts_dir: PathBuf,
    /// Parent of the scripts dir; holds the env override file.
    data_dir: PathBuf,
}

impl ScriptRunner {
    /// Create the runner, making sure the scripts directory exists.
    pub fn new(scripts_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(scripts_dir)?;
        let data_dir = scripts_dir
            .parent()
            .unwrap_or(scripts_dir)
            .to_path_buf();
        Ok(Self {
            scripts_dir: scripts_dir.to_path_buf(),
            data_dir,
        })
    }

    pub fn scripts_dir(&self) -> &Path {
        &self.scripts_dir
    }

    /// Execute a script bounded by `ceiling`. Resolution or spawn problems
    /// come back as a failed outcome with a descriptive error.
    pub async fn execute(
        &self,
        kind: ScriptKind,
        path: &str,
        source: &str,
        ceiling: Duration,
    ) -> RunOutcome {
        let script_path = match self.resolve(kind, path, source).await {
            Ok(p) => p,
            Err(e) => return RunOutcome::failure(String::new(), e.to_string()),
        };

        let interpreter = match resolve_interpreter(kind) {
            Ok(bin) => bin,
            Err(e) => return RunOutcome::failure(String::new(), e.to_string()),
        };

        let mut cmd = Command::new(&interpreter);
        cmd.arg(&script_path)
            // Relative local dependency lookups (node_modules, sibling
            // modules) resolve against the managed scripts dir.
            .current_dir(&self.scripts_dir)
            .kill_on_drop(true);

        for (key, value) in self.env_overrides() {
            cmd.env(key, value);
        }
        cmd.env(
            "NODE_PATH",
            self.scripts_dir.join("node_modules").as_os_str(),
        );
        cmd.env("PYTHONPATH", self.scripts_dir.as_os_str());

        let run = tokio::time::timeout(ceiling, cmd.output()).await;

        match run {
            Ok(Ok(out)) => {
                let output = combine_output(&out.stdout, &out.stderr);
                if out.status.success() {
                    RunOutcome {
                        output,
                        error: String::new(),
                        success: true,
                    }
                } else {
                    let code = out
                        .status
                        .code()
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string());
                    RunOutcome::failure(
                        output,
                        format!("script exited with non-zero status ({code})"),
                    )
                }
            }
            Ok(Err(e)) => RunOutcome::failure(
                String::new(),
                format!("failed to run {interpreter}: {e}"),
            ),
            // Dropping the timed-out future kills the child (kill_on_drop).
            Err(_) => RunOutcome::failure(
                String::new(),
                Error::Timeout(ceiling.as_secs()).to_string(),
            ),
        }
    }

    /// Run a script on behalf of a scheduled task, producing the append-only
    /// execution record.
    pub async fn run_task(&self, task: &Task, script: &Script, ceiling: Duration) -> RunLog {
        let started_at = Utc::now();
        let result = self
            .execute(script.kind, &script.path, &script.source, ceiling)
            .await;
        let ended_at = Utc::now();

        RunLog {
            id: new_id(),
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            started_at,
            ended_at,
            duration_ms: (ended_at - started_at).num_milliseconds(),
            output: result.output,
            error: result.error,
            success: result.success,
        }
    }

    /// Ad-hoc run of a script with no owning task.
    pub async fn run_script(&self, script: &Script, ceiling: Duration) -> RunLog {
        let started_at = Utc::now();
        let result = self
            .execute(script.kind, &script.path, &script.source, ceiling)
            .await;
        let ended_at = Utc::now();

        RunLog {
            id: new_id(),
            task_id: String::new(),
            task_name: format!("{} (manual)", script.name),
            started_at,
            ended_at,
            duration_ms: (ended_at - started_at).num_milliseconds(),
            output: result.output,
            error: result.error,
            success: result.success,
        }
    }

    /// Resolve to a concrete runnable file: an existing `path` as-is,
    /// otherwise inline `source` materialized into the scripts dir.
    async fn resolve(&self, kind: ScriptKind, path: &str, source: &str) -> Result<PathBuf> {
        if !path.is_empty() {
            let p = PathBuf::from(path);
            if p.exists() {
                return Ok(p);
            }
        }

        if source.is_empty() {
            return Err(Error::NoScript);
        }

        let nanos = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_else(|| Utc::now().timestamp_millis());
        let file = self
            .scripts_dir
            .join(format!("temp_{nanos}.{}", kind.extension()));
        tokio::fs::write(&file, source).await?;
        Ok(file)
    }

    /// User env overrides from `<data_dir>/env.json`, applied on top of the
    /// inherited host environment.
    fn env_overrides(&self) -> HashMap<String, String> {
        let path = self.data_dir.join("env.json");
        match std::fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!("ignoring unparseable {}: {e}", path.display());
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        }
    }
}

/// Map a script kind to its interpreter binary. Node gets an ordered probe
/// because its binary name is not canonical across distros.
fn resolve_interpreter(kind: ScriptKind) -> Result<String> {
    match kind {
        ScriptKind::Python => Ok("python3".to_string()),
        ScriptKind::Shell => Ok("bash".to_string()),
        ScriptKind::Nodejs => find_node(),
    }
}

fn find_node() -> Result<String> {
    for name in ["node", "nodejs"] {
        if let Some(found) = search_path(name) {
            return Ok(found);
        }
    }
    for candidate in NODE_FALLBACK_PATHS {
        if Path::new(candidate).exists() {
            return Ok((*candidate).to_string());
        }
    }
    Err(Error::InterpreterNotFound {
        kind: "nodejs".to_string(),
        tried: format!("node, nodejs on PATH, {}", NODE_FALLBACK_PATHS.join(", ")),
    })
}

/// PATH lookup without shelling out.
fn search_path(bin: &str) -> Option<String> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(bin);
        if candidate.is_file() {
            return Some(candidate.to_string_lossy().into_owned());
        }
    }
    None
}

fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut output = String::from_utf8_lossy(stdout).into_owned();
    if !stderr.is_empty() {
        output.push_str("\n[STDERR]\n");
        output.push_str(&String::from_utf8_lossy(stderr));
    }
    output
}
