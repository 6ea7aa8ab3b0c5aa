//! The worker a step's commands run on.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Result, StepError};
use crate::remote::{CommandOutcome, CommandUpdate, RemoteCommand, Signal};

/// Gateway to one connected worker.
#[async_trait]
pub trait WorkerConnection: Send + Sync {
    fn worker_name(&self) -> &str;

    /// Version of `command` the worker implements, `None` if unsupported.
    fn command_version(&self, command: &str) -> Option<String>;

    /// Run `command` to completion, streaming output through `updates`.
    /// Errors are transport failures; a failing command is an outcome.
    async fn run_command(
        &self,
        command: RemoteCommand,
        updates: mpsc::UnboundedSender<CommandUpdate>,
    ) -> Result<CommandOutcome>;

    async fn interrupt_command(&self, command_id: Uuid, signal: Signal) -> Result<()>;
}

#[derive(Clone)]
pub struct Worker {
    connection: Arc<dyn WorkerConnection>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker").field("name", &self.name()).finish()
    }
}

impl Worker {
    pub fn new(connection: Arc<dyn WorkerConnection>) -> Self {
        Self { connection }
    }

    pub fn name(&self) -> &str {
        self.connection.worker_name()
    }

    pub fn connection(&self) -> &Arc<dyn WorkerConnection> {
        &self.connection
    }

    pub fn command_version(&self, command: &str) -> Option<String> {
        self.connection.command_version(command)
    }

    /// The version of `command`, or a setup error if the worker lacks it.
    pub fn require_command(&self, command: &str) -> Result<String> {
        self.command_version(command).ok_or_else(|| {
            StepError::WorkerSetup(format!(
                "worker '{}' does not support command '{command}'",
                self.name()
            ))
        })
    }

    /// Whether the worker's `command` is at least version `minimum`.
    pub fn supports(&self, command: &str, minimum: &str) -> bool {
        self.command_version(command)
            .is_some_and(|v| version_at_least(&v, minimum))
    }
}

/// Dotted numeric comparison; missing components count as zero.
pub fn version_at_least(version: &str, minimum: &str) -> bool {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.')
            .map(|part| {
                part.chars()
                    .take_while(char::is_ascii_digit)
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let (have, want) = (parse(version), parse(minimum));
    let len = have.len().max(want.len());
    for i in 0..len {
        let (h, w) = (have.get(i).copied().unwrap_or(0), want.get(i).copied().unwrap_or(0));
        if h != w {
            return h > w;
        }
    }
    true
}
