//! Step-execution core for the CI platform.
//!
//! A [`BuildStep`] runs one unit of work on a remote worker: it acquires its
//! locks, hands a [`StepContext`] to the pluggable [`StepBehavior`], routes
//! remote command output into logs, flushes test results, and resolves with a
//! [`ResultCode`] that the containing [`Build`] folds into the build outcome.
//!
//! External collaborators are traits: [`StepStore`] (persistence) and
//! [`WorkerConnection`] (the remote command gateway). [`MemoryStore`] is the
//! in-process store used by tests and the local pipeline runner.

pub mod build;
pub mod command;
pub mod config;
pub mod error;
pub mod locks;
pub mod log;
pub mod metrics;
pub mod progress;
pub mod properties;
pub mod remote;
pub mod results;
pub mod shell;
pub mod stats;
pub mod step;
pub mod store;
pub mod summary;
pub mod worker;

pub use build::{Build, BuildContext, BuildOutcome};
pub use command::WorkerCommands;
pub use config::{CoreConfig, StepConfig, StepPredicate};
pub use error::{Result, StepError};
pub use locks::{LockClaim, LockMode, LockRegistry, MasterLock};
pub use log::{Channel, Log, LogObserver, LogStore, LogType};
pub use progress::ProgressTracker;
pub use properties::{Properties, Renderable};
pub use remote::{CommandOutcome, CommandUpdate, RemoteCommand, Signal};
pub use results::{Contribution, FailurePolicy, ResultCode};
pub use shell::{CommandLine, RemoteShellCommand, ShellCommandStep, ShellMixin, ShellOptions};
pub use stats::{StatisticsStore, TestResult, TestResultSet};
pub use step::{BuildStep, StepBehavior, StepContext, StepOutcome, StepState};
pub use store::{MemoryStore, StepStore};
pub use summary::{BuildSummaryPolicy, Summary};
pub use worker::{Worker, WorkerConnection};
