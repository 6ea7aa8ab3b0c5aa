#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ci_step::{
    Build, CommandOutcome, CommandUpdate, CoreConfig, MemoryStore, RemoteCommand, Result,
    Signal, StepError, Worker, WorkerConnection,
};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

/// How the fake worker answers the next command.
pub enum Script {
    /// Stream `updates`, then resolve with `outcome`.
    Complete {
        updates: Vec<CommandUpdate>,
        outcome: CommandOutcome,
    },
    /// Stream `updates`, then wait for any signal and resolve as interrupted.
    UntilSignalled { updates: Vec<CommandUpdate> },
    /// Never resolve, whatever signal arrives.
    Hang,
    /// Fail the round-trip itself.
    Transport(String),
}

impl Script {
    pub fn exit(rc: i32) -> Self {
        Self::Complete {
            updates: Vec::new(),
            outcome: CommandOutcome::exited(rc),
        }
    }

    pub fn output(rc: i32, stdout: &str) -> Self {
        Self::Complete {
            updates: vec![CommandUpdate::Stdout(stdout.as_bytes().to_vec())],
            outcome: CommandOutcome::exited(rc),
        }
    }

    pub fn payload(rc: i32, payload: serde_json::Value) -> Self {
        Self::Complete {
            updates: Vec::new(),
            outcome: CommandOutcome::exited(rc).with_payload(payload),
        }
    }
}

/// Worker that answers commands from a script and records what it saw.
pub struct FakeWorker {
    versions: HashMap<String, String>,
    script: Mutex<VecDeque<Script>>,
    commands: Mutex<Vec<RemoteCommand>>,
    signals: Mutex<Vec<Signal>>,
    signalled: Notify,
}

impl FakeWorker {
    pub fn new() -> Arc<Self> {
        Self::with_shell_version(Some("3.0"))
    }

    pub fn with_shell_version(shell: Option<&str>) -> Arc<Self> {
        let mut versions: HashMap<String, String> = ["mkdir", "rmdir", "stat", "glob", "upload_file"]
            .into_iter()
            .map(|c| (c.to_string(), "3.0".to_string()))
            .collect();
        if let Some(shell) = shell {
            versions.insert("shell".to_string(), shell.to_string());
        }
        Arc::new(Self {
            versions,
            script: Mutex::new(VecDeque::new()),
            commands: Mutex::new(Vec::new()),
            signals: Mutex::new(Vec::new()),
            signalled: Notify::new(),
        })
    }

    pub fn expect(&self, script: Script) {
        self.script.lock().unwrap().push_back(script);
    }

    pub fn commands(&self) -> Vec<RemoteCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.signals.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerConnection for FakeWorker {
    fn worker_name(&self) -> &str {
        "fake"
    }

    fn command_version(&self, command: &str) -> Option<String> {
        self.versions.get(command).cloned()
    }

    async fn run_command(
        &self,
        command: RemoteCommand,
        updates: mpsc::UnboundedSender<CommandUpdate>,
    ) -> Result<CommandOutcome> {
        self.commands.lock().unwrap().push(command);
        let script = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::exit(0));
        match script {
            Script::Complete { updates: chunks, outcome } => {
                for chunk in chunks {
                    let _ = updates.send(chunk);
                }
                Ok(outcome)
            }
            Script::UntilSignalled { updates: chunks } => {
                for chunk in chunks {
                    let _ = updates.send(chunk);
                }
                self.signalled.notified().await;
                Ok(CommandOutcome {
                    rc: Some(-1),
                    interrupted: true,
                    ..CommandOutcome::default()
                })
            }
            Script::Hang => std::future::pending().await,
            Script::Transport(msg) => Err(StepError::Transport(msg)),
        }
    }

    async fn interrupt_command(&self, _command_id: Uuid, signal: Signal) -> Result<()> {
        self.signals.lock().unwrap().push(signal);
        self.signalled.notify_one();
        Ok(())
    }
}

pub fn core_config() -> CoreConfig {
    CoreConfig {
        summary_interval: Duration::from_millis(100),
        interrupt_grace: Duration::from_secs(1),
        ..CoreConfig::default()
    }
}

/// A build on `worker` backed by a fresh in-memory store.
pub fn harness(worker: &Arc<FakeWorker>) -> (Build, Arc<MemoryStore>) {
    harness_with(worker, core_config())
}

pub fn harness_with(worker: &Arc<FakeWorker>, core: CoreConfig) -> (Build, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let build = Build::new(1, Worker::new(worker.clone()), store.clone(), core);
    (build, store)
}
