//! Remote command descriptors, their outcomes, and the dispatcher that runs
//! one on a worker while routing its output into the step's logs.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use crate::error::{Result, StepError};
use crate::log::{LogStore, LogType};
use crate::worker::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Int,
    Term,
    Kill,
}

impl Signal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Int => "INT",
            Self::Term => "TERM",
            Self::Kill => "KILL",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Signal {
    type Err = StepError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        match upper.strip_prefix("SIG").unwrap_or(&upper) {
            "INT" => Ok(Self::Int),
            "TERM" => Ok(Self::Term),
            "KILL" => Ok(Self::Kill),
            _ => Err(StepError::config(format!("unknown signal '{s}'"))),
        }
    }
}

/// A command to run on a worker.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteCommand {
    pub id: Uuid,
    /// Worker command name, e.g. `shell` or `mkdir`.
    pub name: String,
    pub args: Value,
    /// Step log that receives stdout, stderr and header output.
    pub stdio_log: String,
    /// Worker-side logfile name to step log name.
    pub logfiles: BTreeMap<String, String>,
    /// Create logfile logs on first output instead of up front.
    pub lazy_logfiles: bool,
    pub collect_stdout: bool,
    pub collect_stderr: bool,
    pub interrupt_signal: Signal,
    /// Escalation window; the step's default applies when unset.
    #[serde(skip)]
    pub grace: Option<Duration>,
}

impl RemoteCommand {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            args,
            stdio_log: "stdio".to_string(),
            logfiles: BTreeMap::new(),
            lazy_logfiles: false,
            collect_stdout: false,
            collect_stderr: false,
            interrupt_signal: Signal::Kill,
            grace: None,
        }
    }

    pub fn with_logfiles(mut self, logfiles: BTreeMap<String, String>, lazy: bool) -> Self {
        self.logfiles = logfiles;
        self.lazy_logfiles = lazy;
        self
    }

    pub fn collecting(mut self, stdout: bool, stderr: bool) -> Self {
        self.collect_stdout = stdout;
        self.collect_stderr = stderr;
        self
    }

    pub fn with_interrupt_signal(mut self, signal: Signal) -> Self {
        self.interrupt_signal = signal;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = Some(grace);
        self
    }
}

/// Output streamed back while a command runs.
#[derive(Debug, Clone)]
pub enum CommandUpdate {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Header(String),
    /// Content of a worker-side logfile.
    Log { name: String, data: Vec<u8> },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    /// Exit status; `None` if the command never reported one.
    pub rc: Option<i32>,
    /// Structured result of filesystem-style commands.
    pub payload: Value,
    /// File content returned by `upload_file`.
    pub content: Option<Vec<u8>>,
    /// Captured stdout when the command asked for collection.
    pub stdout: String,
    pub stderr: String,
    pub interrupted: bool,
    pub timed_out: bool,
}

impl CommandOutcome {
    pub fn exited(rc: i32) -> Self {
        Self {
            rc: Some(rc),
            ..Self::default()
        }
    }

    pub fn interrupted() -> Self {
        Self {
            interrupted: true,
            ..Self::default()
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn succeeded(&self) -> bool {
        !self.interrupted && self.rc == Some(0)
    }
}

struct CommandSink<'a> {
    logs: &'a LogStore,
    stdio_log: String,
    logfiles: BTreeMap<String, String>,
    collect_stdout: bool,
    collect_stderr: bool,
    stdout: String,
    stderr: String,
}

impl<'a> CommandSink<'a> {
    async fn new(command: &RemoteCommand, logs: &'a LogStore) -> Result<Self> {
        if !command.lazy_logfiles {
            for step_log in command.logfiles.values() {
                logs.get_or_create(step_log, LogType::Text).await?;
            }
        }
        Ok(Self {
            logs,
            stdio_log: command.stdio_log.clone(),
            logfiles: command.logfiles.clone(),
            collect_stdout: command.collect_stdout,
            collect_stderr: command.collect_stderr,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn handle(&mut self, update: CommandUpdate) -> Result<()> {
        match update {
            CommandUpdate::Stdout(bytes) => {
                let log = self.logs.get_or_create(&self.stdio_log, LogType::Stdio).await?;
                let text = log.decode(&bytes)?;
                if self.collect_stdout {
                    self.stdout.push_str(&text);
                }
                log.add_stdout(&text).await
            }
            CommandUpdate::Stderr(bytes) => {
                let log = self.logs.get_or_create(&self.stdio_log, LogType::Stdio).await?;
                let text = log.decode(&bytes)?;
                if self.collect_stderr {
                    self.stderr.push_str(&text);
                }
                log.add_stderr(&text).await
            }
            CommandUpdate::Header(text) => {
                let log = self.logs.get_or_create(&self.stdio_log, LogType::Stdio).await?;
                log.add_header(&text).await
            }
            CommandUpdate::Log { name, data } => match self.logfiles.get(&name) {
                Some(step_log) => {
                    let log = self.logs.get_or_create(step_log, LogType::Text).await?;
                    let text = log.decode(&data)?;
                    log.add_content(&text).await
                }
                None => {
                    tracing::warn!(logfile = %name, "output for an undeclared logfile dropped");
                    Ok(())
                }
            },
        }
    }

    fn complete(self, outcome: &mut CommandOutcome) {
        if self.collect_stdout {
            outcome.stdout = self.stdout;
        }
        if self.collect_stderr {
            outcome.stderr = self.stderr;
        }
    }
}

#[derive(Clone, Copy)]
enum Escalation {
    Signalled,
    Killed,
}

/// Run `command` on `worker`, racing it against the step's interrupt.
///
/// On interrupt the command's signal is sent; after `grace` a KILL follows,
/// and after another `grace` the command is abandoned as interrupted.
pub(crate) async fn dispatch(
    worker: &Worker,
    command: RemoteCommand,
    logs: &LogStore,
    interrupt: &mut watch::Receiver<Option<String>>,
    default_grace: Duration,
) -> Result<CommandOutcome> {
    if interrupt.borrow_and_update().is_some() {
        return Ok(CommandOutcome::interrupted());
    }

    let grace = command.grace.unwrap_or(default_grace);
    let id = command.id;
    let signal = command.interrupt_signal;
    let name = command.name.clone();
    let mut sink = CommandSink::new(&command, logs).await?;

    crate::metrics::command_dispatched(&name);
    tracing::debug!(command = %name, %id, worker = %worker.name(), "dispatching remote command");

    let connection = worker.connection().clone();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let run = connection.run_command(command, tx);
    tokio::pin!(run);

    let mut interrupted = false;
    let mut watching = true;
    let mut escalation: Option<(Escalation, Instant)> = None;

    let mut outcome = loop {
        let deadline = escalation.map(|(_, at)| at);
        tokio::select! {
            biased;
            Some(update) = rx.recv() => {
                if let Err(e) = sink.handle(update).await {
                    tracing::warn!(command = %name, error = %e, "command output rejected, killing remote command");
                    if let Err(kill) = connection.interrupt_command(id, Signal::Kill).await {
                        tracing::warn!(command = %name, error = %kill, "failed to kill remote command");
                    }
                    return Err(e);
                }
            }
            result = &mut run => break result?,
            changed = interrupt.changed(), if watching && !interrupted => {
                if changed.is_err() {
                    watching = false;
                    continue;
                }
                let reason = interrupt.borrow_and_update().clone();
                if let Some(reason) = reason {
                    interrupted = true;
                    tracing::info!(command = %name, %reason, %signal, "interrupting remote command");
                    connection.interrupt_command(id, signal).await?;
                    escalation = Some((Escalation::Signalled, Instant::now() + grace));
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                match escalation {
                    Some((Escalation::Signalled, _)) => {
                        tracing::warn!(command = %name, grace_secs = grace.as_secs(), "command ignored interrupt, sending KILL");
                        crate::metrics::command_escalated(Signal::Kill.as_str());
                        connection.interrupt_command(id, Signal::Kill).await?;
                        escalation = Some((Escalation::Killed, Instant::now() + grace));
                    }
                    _ => {
                        tracing::warn!(command = %name, "command survived KILL, abandoning it");
                        crate::metrics::command_escalated("abandon");
                        break CommandOutcome::interrupted();
                    }
                }
            }
        }
    };

    while let Ok(update) = rx.try_recv() {
        sink.handle(update).await?;
    }
    outcome.interrupted |= interrupted;
    sink.complete(&mut outcome);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_signal_names() {
        assert_eq!("SIGTERM".parse::<Signal>().unwrap(), Signal::Term);
        assert_eq!("int".parse::<Signal>().unwrap(), Signal::Int);
        assert!("HUP".parse::<Signal>().is_err());
    }

    #[test]
    fn only_clean_exit_succeeds() {
        assert!(CommandOutcome::exited(0).succeeded());
        assert!(!CommandOutcome::exited(1).succeeded());
        assert!(!CommandOutcome::interrupted().succeeded());
        let killed = CommandOutcome {
            interrupted: true,
            ..CommandOutcome::exited(0)
        };
        assert!(!killed.succeeded());
    }
}
