//! A worker that runs commands on this host.
//!
//! Relative paths are resolved against the worker's root directory. Shell
//! commands run in their own process group so interrupts reach every child.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use ci_step::{
    CommandLine, CommandOutcome, CommandUpdate, RemoteCommand, Result, Signal, StepError,
    WorkerConnection,
};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

const COMMAND_VERSION: &str = "3.0";
const SUPPORTED_COMMANDS: &[&str] = &["shell", "mkdir", "rmdir", "stat", "glob", "upload_file"];

/// Time output pipes may stay open after the process exited.
const PIPE_DRAIN: Duration = Duration::from_secs(1);

type Wrap = fn(Vec<u8>) -> CommandUpdate;

static GLOB_META: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[*?\[]").unwrap());

#[derive(Debug, Deserialize)]
struct ShellArgs {
    command: CommandLine,
    #[serde(default)]
    workdir: String,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default = "yes")]
    want_stdout: bool,
    #[serde(default = "yes")]
    want_stderr: bool,
    timeout: Option<u64>,
    max_time: Option<u64>,
    initial_stdin: Option<String>,
    #[serde(default)]
    log_environ: bool,
    #[serde(default)]
    logfiles: BTreeMap<String, String>,
}

fn yes() -> bool {
    true
}

struct Running {
    pid: i32,
    signalled: bool,
}

pub struct LocalWorker {
    name: String,
    root: PathBuf,
    running: Mutex<HashMap<Uuid, Running>>,
}

impl LocalWorker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            name: "local".to_string(),
            root: root.into(),
            running: Mutex::new(HashMap::new()),
        }
    }

    fn running(&self) -> MutexGuard<'_, HashMap<Uuid, Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    async fn run_shell(
        &self,
        command: &RemoteCommand,
        updates: &mpsc::UnboundedSender<CommandUpdate>,
    ) -> Result<CommandOutcome> {
        let args: ShellArgs = serde_json::from_value(command.args.clone())
            .map_err(|e| StepError::Transport(format!("malformed shell arguments: {e}")))?;
        let workdir = self.resolve(&args.workdir);
        if let Err(e) = tokio::fs::create_dir_all(&workdir).await {
            let _ = updates.send(CommandUpdate::Header(format!(
                "cannot create workdir {}: {e}\n",
                workdir.display()
            )));
            return Ok(CommandOutcome::exited(-1));
        }

        let mut cmd = match &args.command {
            CommandLine::Shell(line) => {
                let mut cmd = Command::new("bash");
                cmd.args(["-c", line]);
                cmd
            }
            CommandLine::Argv(argv) => match argv.split_first() {
                Some((program, rest)) => {
                    let mut cmd = Command::new(program);
                    cmd.args(rest);
                    cmd
                }
                None => {
                    let _ = updates.send(CommandUpdate::Header("empty command\n".to_string()));
                    return Ok(CommandOutcome::exited(-1));
                }
            },
        };
        cmd.current_dir(&workdir)
            .envs(&args.env)
            .stdin(if args.initial_stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let _ = updates.send(CommandUpdate::Header(format!(
            "{}\n in dir {}\n",
            args.command.words().join(" "),
            workdir.display()
        )));
        if args.log_environ {
            for (key, value) in &args.env {
                let _ = updates.send(CommandUpdate::Header(format!(" {key}={value}\n")));
            }
        }

        let started = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = updates.send(CommandUpdate::Header(format!("Failed to execute command: {e}\n")));
                return Ok(CommandOutcome::exited(-1));
            }
        };
        let pid = child.id().map(|id| id as i32).unwrap_or_default();
        let registration = Registration::new(self, command.id, pid);
        tracing::debug!(command = %command.id, pid, "shell command spawned");

        if let (Some(mut stdin), Some(text)) = (child.stdin.take(), args.initial_stdin.clone()) {
            tokio::spawn(async move {
                let _ = stdin.write_all(text.as_bytes()).await;
            });
        }

        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, chunk_tx.clone(), args.want_stdout.then_some(CommandUpdate::Stdout as Wrap)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, chunk_tx.clone(), args.want_stderr.then_some(CommandUpdate::Stderr as Wrap)));
        }
        drop(chunk_tx);

        let silence = args.timeout.map(Duration::from_secs);
        let max_time = args.max_time.map(|secs| started + Duration::from_secs(secs));
        let mut last_output = Instant::now();
        let mut status = None;
        let mut pipes_open = true;
        let mut timed_out = false;
        let mut drain_until = None;

        loop {
            let deadline = [silence.map(|s| last_output + s), max_time]
                .into_iter()
                .flatten()
                .min();
            tokio::select! {
                chunk = chunk_rx.recv(), if pipes_open => match chunk {
                    Some(update) => {
                        last_output = Instant::now();
                        let _ = updates.send(update);
                    }
                    None => pipes_open = false,
                },
                exit = child.wait(), if status.is_none() => {
                    status = Some(exit.map_err(|e| StepError::Transport(format!("failed to wait for command: {e}")))?);
                    drain_until = Some(Instant::now() + PIPE_DRAIN);
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() && !timed_out && status.is_none() => {
                    timed_out = true;
                    let reason = match silence {
                        Some(s) if last_output + s <= Instant::now() => format!("command timed out: {} seconds without output", s.as_secs()),
                        _ => format!("command timed out: {} seconds elapsed", args.max_time.unwrap_or_default()),
                    };
                    tracing::warn!(command = %command.id, pid, %reason, "killing timed out command");
                    let _ = updates.send(CommandUpdate::Header(format!("{reason}, attempting to kill\n")));
                    send_signal(pid, Signal::Kill)?;
                }
                _ = sleep_until(drain_until.unwrap_or_else(Instant::now)), if drain_until.is_some() && pipes_open => {
                    pipes_open = false;
                }
            }
            if status.is_some() && !pipes_open {
                break;
            }
        }

        let rc = status.and_then(|s| s.code()).unwrap_or(-1);
        let interrupted = registration.signalled();
        drop(registration);

        for worker_path in args.logfiles.keys() {
            match tokio::fs::read(workdir.join(worker_path)).await {
                Ok(data) if !data.is_empty() => {
                    let _ = updates.send(CommandUpdate::Log {
                        name: worker_path.clone(),
                        data,
                    });
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(logfile = %worker_path, error = %e, "logfile not readable"),
            }
        }

        let _ = updates.send(CommandUpdate::Header(format!(
            "program finished with exit code {rc}\nelapsedTime={:.6}\n",
            started.elapsed().as_secs_f64()
        )));
        Ok(CommandOutcome {
            rc: Some(rc),
            interrupted,
            timed_out,
            ..CommandOutcome::default()
        })
    }

    async fn mkdir(&self, args: &Value, updates: &mpsc::UnboundedSender<CommandUpdate>) -> CommandOutcome {
        for path in paths(args) {
            if let Err(e) = tokio::fs::create_dir_all(self.resolve(&path)).await {
                return failed(updates, format!("mkdir {path}: {e}"));
            }
        }
        CommandOutcome::exited(0)
    }

    async fn rmdir(&self, args: &Value, updates: &mpsc::UnboundedSender<CommandUpdate>) -> CommandOutcome {
        for path in paths(args) {
            match tokio::fs::remove_dir_all(self.resolve(&path)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return failed(updates, format!("rmdir {path}: {e}")),
            }
        }
        CommandOutcome::exited(0)
    }

    async fn stat(&self, args: &Value, updates: &mpsc::UnboundedSender<CommandUpdate>) -> CommandOutcome {
        let path = args["path"].as_str().unwrap_or_default();
        match tokio::fs::metadata(self.resolve(path)).await {
            Ok(meta) => {
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs());
                CommandOutcome::exited(0).with_payload(json!({
                    "stat": {
                        "size": meta.len(),
                        "is_dir": meta.is_dir(),
                        "is_file": meta.is_file(),
                        "mtime": mtime,
                    }
                }))
            }
            Err(e) => failed(updates, format!("stat {path}: {e}")),
        }
    }

    async fn glob(&self, args: &Value, updates: &mpsc::UnboundedSender<CommandUpdate>) -> CommandOutcome {
        let pattern = args["path"].as_str().unwrap_or_default();
        let (dir, file_pattern) = match pattern.rsplit_once('/') {
            Some((dir, file)) => (dir, file),
            None => ("", pattern),
        };
        if GLOB_META.is_match(dir) {
            return failed(updates, format!("glob {pattern}: wildcards are only supported in the last path component"));
        }
        let matcher = match glob_to_regex(file_pattern) {
            Ok(matcher) => matcher,
            Err(e) => return failed(updates, format!("glob {pattern}: {e}")),
        };

        let mut files = Vec::new();
        let search = if dir.is_empty() { self.root.clone() } else { self.resolve(dir) };
        match tokio::fs::read_dir(&search).await {
            Ok(mut entries) => loop {
                match entries.next_entry().await {
                    Ok(Some(entry)) => {
                        let name = entry.file_name().to_string_lossy().into_owned();
                        if matcher.is_match(&name) {
                            files.push(if dir.is_empty() { name } else { format!("{dir}/{name}") });
                        }
                    }
                    Ok(None) => break,
                    Err(e) => return failed(updates, format!("glob {pattern}: {e}")),
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return failed(updates, format!("glob {pattern}: {e}")),
        }
        files.sort();
        CommandOutcome::exited(0).with_payload(json!({ "files": files }))
    }

    async fn upload_file(&self, args: &Value, updates: &mpsc::UnboundedSender<CommandUpdate>) -> CommandOutcome {
        let path = args["path"].as_str().unwrap_or_default();
        match tokio::fs::read(self.resolve(path)).await {
            Ok(content) => CommandOutcome {
                content: Some(content),
                ..CommandOutcome::exited(0)
            },
            Err(e) => failed(updates, format!("upload_file {path}: {e}")),
        }
    }
}

#[async_trait]
impl WorkerConnection for LocalWorker {
    fn worker_name(&self) -> &str {
        &self.name
    }

    fn command_version(&self, command: &str) -> Option<String> {
        SUPPORTED_COMMANDS
            .contains(&command)
            .then(|| COMMAND_VERSION.to_string())
    }

    async fn run_command(
        &self,
        command: RemoteCommand,
        updates: mpsc::UnboundedSender<CommandUpdate>,
    ) -> Result<CommandOutcome> {
        match command.name.as_str() {
            "shell" => self.run_shell(&command, &updates).await,
            "mkdir" => Ok(self.mkdir(&command.args, &updates).await),
            "rmdir" => Ok(self.rmdir(&command.args, &updates).await),
            "stat" => Ok(self.stat(&command.args, &updates).await),
            "glob" => Ok(self.glob(&command.args, &updates).await),
            "upload_file" => Ok(self.upload_file(&command.args, &updates).await),
            other => Err(StepError::WorkerSetup(format!(
                "local worker does not implement '{other}'"
            ))),
        }
    }

    async fn interrupt_command(&self, command_id: Uuid, signal: Signal) -> Result<()> {
        let pid = {
            let mut running = self.running();
            match running.get_mut(&command_id) {
                Some(entry) => {
                    entry.signalled = true;
                    entry.pid
                }
                None => {
                    tracing::debug!(command = %command_id, "interrupt for a command that is not running");
                    return Ok(());
                }
            }
        };
        tracing::info!(command = %command_id, pid, %signal, "signalling command");
        send_signal(pid, signal)
    }
}

/// Keeps a spawned command interruptible for as long as it runs.
struct Registration<'a> {
    worker: &'a LocalWorker,
    id: Uuid,
}

impl<'a> Registration<'a> {
    fn new(worker: &'a LocalWorker, id: Uuid, pid: i32) -> Self {
        worker.running().insert(id, Running { pid, signalled: false });
        Self { worker, id }
    }

    fn signalled(&self) -> bool {
        self.worker
            .running()
            .get(&self.id)
            .is_some_and(|r| r.signalled)
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.worker.running().remove(&self.id);
    }
}

async fn pump<R>(
    mut stream: R,
    tx: mpsc::UnboundedSender<CommandUpdate>,
    wrap: Option<Wrap>,
) where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0u8; 8192];
    loop {
        match stream.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Some(wrap) = wrap {
                    if tx.send(wrap(buffer[..n].to_vec())).is_err() {
                        break;
                    }
                }
            }
        }
    }
}

/// Signal the process group led by `pid`.
fn send_signal(pid: i32, signal: Signal) -> Result<()> {
    if pid <= 0 {
        return Ok(());
    }
    let signum = match signal {
        Signal::Int => libc::SIGINT,
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-pid, signum) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(StepError::Transport(format!("failed to send SIG{signal} to {pid}: {err}")))
}

fn paths(args: &Value) -> Vec<String> {
    args["paths"]
        .as_array()
        .map(|paths| {
            paths
                .iter()
                .filter_map(|p| p.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn failed(updates: &mpsc::UnboundedSender<CommandUpdate>, message: String) -> CommandOutcome {
    tracing::debug!(%message, "worker command failed");
    let _ = updates.send(CommandUpdate::Stderr(format!("{message}\n").into_bytes()));
    CommandOutcome::exited(1)
}

/// Translate a single-component shell wildcard into an anchored regex.
fn glob_to_regex(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    let mut out = String::from("^");
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '[' => match chars[i + 1..].iter().position(|&c| c == ']') {
                Some(len) if len > 0 => {
                    let class: String = chars[i + 1..i + 1 + len].iter().collect();
                    match class.strip_prefix('!') {
                        Some(negated) => out.push_str(&format!("[^{negated}]")),
                        None => out.push_str(&format!("[{class}]")),
                    }
                    i += len + 1;
                }
                _ => out.push_str(r"\["),
            },
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    out.push('$');
    Regex::new(&out)
}

impl std::fmt::Debug for LocalWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalWorker").field("root", &self.root).finish()
    }
}

/// The worker root as given on the command line, made absolute.
pub fn worker_root(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
