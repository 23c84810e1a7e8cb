//! External collaborators: converters, indexers, mergers, finalizers and
//! user scripts run as child processes.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::MirrorError;
use crate::fs_util::find_in_path;
use crate::task::{Task, TaskEnv, TaskKind};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Task identifier to program path, from the batch configuration. Unlisted
/// identifiers are looked up on `PATH` under their own name.
#[derive(Debug, Clone, Default)]
pub struct ToolTable {
    tools: HashMap<String, PathBuf>,
}

impl ToolTable {
    pub fn new(tools: HashMap<String, PathBuf>) -> Self {
        Self { tools }
    }

    pub fn resolve(&self, name: &str) -> Result<PathBuf, MirrorError> {
        if let Some(path) = self.tools.get(name) {
            return Ok(path.clone());
        }
        if name.contains(std::path::MAIN_SEPARATOR) {
            let path = PathBuf::from(name);
            if path.exists() {
                return Ok(path);
            }
        }
        find_in_path(name).ok_or_else(|| MirrorError::MissingTool(name.to_string()))
    }
}

pub(crate) fn run(task: &Task, env: &TaskEnv<'_>) -> Result<(), MirrorError> {
    let (program, mut args) = match task.kind {
        TaskKind::Script => {
            let name = task.params.get("name").ok_or_else(|| MirrorError::Task {
                task: task.label(),
                message: "script needs a name=<program> parameter".to_string(),
            })?;
            let args: Vec<String> = task.params.list("args").into_iter().map(str::to_string).collect();
            (env.tools.resolve(name)?, args)
        }
        kind => (env.tools.resolve(kind.id())?, Vec::new()),
    };
    args.extend(standard_args(task));
    for dir in [output_dir(task), task.bank.offline_dir.as_path()] {
        fs::create_dir_all(dir).map_err(|err| MirrorError::Filesystem(err.to_string()))?;
    }
    info!(bank = %task.bank.name, task = %task.label(), program = %program.display(), "running tool");
    run_tool(&program, &args, task, env)
}

/// `--bank`, `--type`, `--output`, one `--input` per input, then every
/// parameter as `--key value`.
fn standard_args(task: &Task) -> Vec<String> {
    let mut args = vec![
        "--bank".to_string(),
        task.bank.name.clone(),
        "--type".to_string(),
        task.bank.bank_type.to_string(),
        "--output".to_string(),
        task.output.to_string_lossy().to_string(),
    ];
    for input in &task.inputs {
        args.push("--input".to_string());
        args.push(input.to_string_lossy().to_string());
    }
    for (key, value) in task.params.iter() {
        if task.kind == TaskKind::Script && matches!(key, "name" | "args") {
            continue;
        }
        args.push(format!("--{key}"));
        args.push(value.to_string());
    }
    args
}

fn output_dir(task: &Task) -> &Path {
    if task.output.extension().is_some() {
        task.output.parent().unwrap_or(&task.output)
    } else {
        &task.output
    }
}

fn run_tool(
    program: &Path,
    args: &[String],
    task: &Task,
    env: &TaskEnv<'_>,
) -> Result<(), MirrorError> {
    let task_error = |message: String| MirrorError::Task {
        task: task.label(),
        message,
    };
    // stderr goes to an unnamed file so a chatty tool cannot fill a pipe.
    let mut stderr = tempfile::tempfile().map_err(|err| MirrorError::Filesystem(err.to_string()))?;
    let stderr_handle = stderr
        .try_clone()
        .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
    let mut child = Command::new(program)
        .args(args)
        .current_dir(&task.bank.offline_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(stderr_handle))
        .spawn()
        .map_err(|err| task_error(format!("spawn {}: {err}", program.display())))?;

    let status = loop {
        if let Some(status) = child.try_wait().map_err(|err| task_error(err.to_string()))? {
            break status;
        }
        if env.ctx.is_aborted() {
            warn!(task = %task.label(), "abort requested, stopping tool");
            let _ = child.kill();
            thread::sleep(KILL_GRACE);
            let _ = child.try_wait();
            return Err(MirrorError::Interrupted);
        }
        thread::sleep(POLL_INTERVAL);
    };
    if status.success() {
        debug!(task = %task.label(), "tool finished");
        return Ok(());
    }

    let mut message = String::new();
    if stderr.seek(SeekFrom::Start(0)).is_ok() {
        let _ = stderr.read_to_string(&mut message);
    }
    let message = message.trim();
    Err(task_error(if message.is_empty() {
        format!("command failed: {} ({status})", program.display())
    } else {
        message.to_string()
    }))
}
