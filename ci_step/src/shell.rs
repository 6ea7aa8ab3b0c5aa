//! Shell command assembly and the stock shell-command step.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::StepConfig;
use crate::error::{Result, StepError};
use crate::log::LogType;
use crate::properties::Renderable;
use crate::remote::{CommandOutcome, RemoteCommand, Signal};
use crate::results::ResultCode;
use crate::step::{BuildStep, StepBehavior, StepContext, StepState};
use crate::summary::{self, Summary};

/// Minimum `shell` command versions for optional features.
const PTY_VERSION: &str = "2.0";
const MAX_TIME_VERSION: &str = "2.16";
const SIGTERM_TIME_VERSION: &str = "3.0";

const DEFAULT_TIMEOUT_SECS: u64 = 1200;

/// A command as a single shell string or an argv list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Shell(String),
    Argv(Vec<String>),
}

impl CommandLine {
    pub fn words(&self) -> Vec<&str> {
        match self {
            Self::Shell(cmd) => cmd.split_whitespace().collect(),
            Self::Argv(argv) => argv.iter().map(String::as_str).collect(),
        }
    }
}

/// Short quoted description such as `'make all'`, used in summaries.
pub fn command_to_string(command: &CommandLine) -> String {
    let words = command.words();
    let mut text = words.iter().take(3).copied().collect::<Vec<_>>().join(" ");
    if words.len() > 3 {
        text.push_str(" ...");
    }
    if text.chars().count() > 30 {
        text = text.chars().take(30).collect::<String>() + "...";
    }
    format!("'{text}'")
}

/// Shell command configuration. Every field is optional so the layers
/// (class defaults, constructor arguments, per-call overrides) can be merged.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ShellOptions {
    pub command: Option<Renderable<CommandLine>>,
    pub workdir: Option<Renderable<String>>,
    pub env: Option<BTreeMap<String, Renderable<String>>>,
    pub want_stdout: Option<bool>,
    pub want_stderr: Option<bool>,
    pub use_pty: Option<bool>,
    /// Worker-side logfile name to step log name.
    pub logfiles: Option<BTreeMap<String, String>>,
    pub lazylogfiles: Option<bool>,
    /// Seconds without output before the worker kills the command.
    pub timeout: Option<u64>,
    /// Seconds the command may run in total.
    pub max_time: Option<u64>,
    pub log_environ: Option<bool>,
    pub interrupt_signal: Option<Signal>,
    /// Seconds between the interrupt signal and KILL.
    pub sigterm_time: Option<u64>,
    pub initial_stdin: Option<Renderable<String>>,
    /// Exit code to result; unlisted codes are FAILURE.
    pub decode_rc: Option<BTreeMap<i32, ResultCode>>,
    pub collect_stdout: Option<bool>,
    pub collect_stderr: Option<bool>,
}

/// Keys of [`ShellOptions`], used to split mixed keyword maps.
pub const SHELL_OPTION_KEYS: &[&str] = &[
    "command",
    "workdir",
    "env",
    "want_stdout",
    "want_stderr",
    "use_pty",
    "logfiles",
    "lazylogfiles",
    "timeout",
    "max_time",
    "log_environ",
    "interrupt_signal",
    "sigterm_time",
    "initial_stdin",
    "decode_rc",
    "collect_stdout",
    "collect_stderr",
];

macro_rules! overlay {
    ($base:ident, $over:ident, $($field:ident),+ $(,)?) => {
        ShellOptions {
            $($field: $over.$field.or($base.$field),)+
        }
    };
}

impl ShellOptions {
    pub fn command(command: impl Into<CommandLine>) -> Self {
        Self {
            command: Some(Renderable::Value(command.into())),
            ..Self::default()
        }
    }

    /// Values set in `over` win over values in `self`.
    pub fn merge(self, over: ShellOptions) -> ShellOptions {
        let base = self;
        overlay!(
            base,
            over,
            command,
            workdir,
            env,
            want_stdout,
            want_stderr,
            use_pty,
            logfiles,
            lazylogfiles,
            timeout,
            max_time,
            log_environ,
            interrupt_signal,
            sigterm_time,
            initial_stdin,
            decode_rc,
            collect_stdout,
            collect_stderr,
        )
    }
}

impl From<&str> for CommandLine {
    fn from(cmd: &str) -> Self {
        Self::Shell(cmd.to_string())
    }
}

impl From<String> for CommandLine {
    fn from(cmd: String) -> Self {
        Self::Shell(cmd)
    }
}

impl From<Vec<String>> for CommandLine {
    fn from(argv: Vec<String>) -> Self {
        Self::Argv(argv)
    }
}

/// Builds shell commands from layered configuration.
#[derive(Debug, Clone, Default)]
pub struct ShellMixin {
    options: ShellOptions,
}

impl ShellMixin {
    /// Merge constructor `kwargs` over class `defaults`. Any key listed in
    /// `prohibited` is a configuration error.
    pub fn new(defaults: ShellOptions, kwargs: Value, prohibited: &[&str]) -> Result<Self> {
        if let Value::Object(map) = &kwargs {
            if let Some(key) = prohibited.iter().find(|k| map.contains_key(**k)) {
                return Err(StepError::config(format!("invalid argument '{key}'")));
            }
        }
        let options: ShellOptions = if kwargs.is_null() {
            ShellOptions::default()
        } else {
            serde_json::from_value(kwargs)
                .map_err(|e| StepError::config(format!("invalid shell arguments: {e}")))?
        };
        Ok(Self {
            options: defaults.merge(options),
        })
    }

    pub fn from_options(options: ShellOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ShellOptions {
        &self.options
    }

    /// Assemble the command for the running step. Consults the worker's
    /// `shell` version, so it cannot be called before RUNNING.
    pub async fn make_remote_shell_command(
        &self,
        ctx: &StepContext,
        overrides: ShellOptions,
    ) -> Result<RemoteShellCommand> {
        let state = ctx.state();
        if !matches!(state, StepState::Running | StepState::Interrupting) {
            return Err(StepError::InvalidState {
                expected: "running",
                found: state.to_string(),
            });
        }

        let opts = self.options.clone().merge(overrides);
        let props = ctx.properties();
        let command_line = opts
            .command
            .as_ref()
            .ok_or_else(|| StepError::config("no command specified"))?
            .render(props)?;
        let version = ctx.worker().require_command("shell")?;

        let workdir = match &opts.workdir {
            Some(workdir) => ctx.build_path(&workdir.render(props)?),
            None => ctx.workdir().to_string(),
        };
        let mut env = BTreeMap::new();
        for (key, value) in opts.env.iter().flatten() {
            env.insert(key.clone(), value.render(props)?);
        }
        let initial_stdin = opts.initial_stdin.as_ref().map(|s| s.render(props)).transpose()?;

        let mut use_pty = opts.use_pty.unwrap_or(false);
        let mut max_time = opts.max_time;
        let mut sigterm_time = opts.sigterm_time;
        let mut dropped = Vec::new();
        if use_pty && !crate::worker::version_at_least(&version, PTY_VERSION) {
            use_pty = false;
            dropped.push("use_pty");
        }
        if max_time.is_some() && !crate::worker::version_at_least(&version, MAX_TIME_VERSION) {
            max_time = None;
            dropped.push("max_time");
        }
        if sigterm_time.is_some() && !crate::worker::version_at_least(&version, SIGTERM_TIME_VERSION) {
            sigterm_time = None;
            dropped.push("sigterm_time");
        }
        if !dropped.is_empty() {
            let log = ctx.logs().get_or_create("stdio", LogType::Stdio).await?;
            for feature in &dropped {
                tracing::warn!(step = %ctx.name(), worker = %ctx.worker().name(), %version, feature, "worker shell too old, feature ignored");
                log.add_header(&format!(
                    "NOTE: worker shell version {version} does not support '{feature}', ignoring it\n"
                ))
                .await?;
            }
        }

        let interrupt_signal = opts.interrupt_signal.unwrap_or(Signal::Kill);
        let mut args = Map::new();
        args.insert("command".into(), serde_json::to_value(&command_line).map_err(anyhow::Error::from)?);
        args.insert("workdir".into(), json!(workdir));
        args.insert("env".into(), json!(env));
        args.insert("want_stdout".into(), json!(opts.want_stdout.unwrap_or(true)));
        args.insert("want_stderr".into(), json!(opts.want_stderr.unwrap_or(true)));
        args.insert("use_pty".into(), json!(use_pty));
        args.insert("logfiles".into(), json!(opts.logfiles.clone().unwrap_or_default()));
        args.insert("timeout".into(), json!(opts.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS)));
        args.insert("log_environ".into(), json!(opts.log_environ.unwrap_or(true)));
        args.insert("interrupt_signal".into(), json!(interrupt_signal));
        if let Some(max_time) = max_time {
            args.insert("max_time".into(), json!(max_time));
        }
        if let Some(sigterm_time) = sigterm_time {
            args.insert("sigterm_time".into(), json!(sigterm_time));
        }
        if let Some(stdin) = initial_stdin {
            args.insert("initial_stdin".into(), json!(stdin));
        }

        let mut remote = RemoteCommand::new("shell", Value::Object(args))
            .with_logfiles(
                opts.logfiles.clone().unwrap_or_default(),
                opts.lazylogfiles.unwrap_or(false),
            )
            .collecting(
                opts.collect_stdout.unwrap_or(false),
                opts.collect_stderr.unwrap_or(false),
            )
            .with_interrupt_signal(interrupt_signal);
        if let Some(secs) = sigterm_time {
            remote = remote.with_grace(Duration::from_secs(secs));
        }

        Ok(RemoteShellCommand {
            remote,
            command_line,
            decode_rc: opts
                .decode_rc
                .clone()
                .unwrap_or_else(|| BTreeMap::from([(0, ResultCode::Success)])),
        })
    }
}

/// A ready-to-dispatch shell command.
#[derive(Debug, Clone)]
pub struct RemoteShellCommand {
    pub remote: RemoteCommand,
    pub command_line: CommandLine,
    decode_rc: BTreeMap<i32, ResultCode>,
}

impl RemoteShellCommand {
    pub fn decode(&self, outcome: &CommandOutcome) -> ResultCode {
        if outcome.interrupted {
            return ResultCode::Cancelled;
        }
        outcome
            .rc
            .and_then(|rc| self.decode_rc.get(&rc).copied())
            .unwrap_or(ResultCode::Failure)
    }

    /// Hand the command to the step's dispatcher and decode the exit code.
    pub async fn run(&self, ctx: &StepContext) -> Result<(ResultCode, CommandOutcome)> {
        let outcome = ctx.run_command(self.remote.clone()).await?;
        if outcome.timed_out {
            ctx.set_timed_out();
        }
        Ok((self.decode(&outcome), outcome))
    }
}

/// Runs one shell command; the result is its decoded exit code.
pub struct ShellCommandStep {
    mixin: ShellMixin,
    last_command: Mutex<Option<CommandLine>>,
}

impl ShellCommandStep {
    pub fn new(mixin: ShellMixin) -> Self {
        Self {
            mixin,
            last_command: Mutex::new(None),
        }
    }

    /// Create a step from one keyword map holding both step and shell keys.
    pub fn from_kwargs(kwargs: Value) -> Result<BuildStep> {
        let Value::Object(map) = kwargs else {
            return Err(StepError::config("step arguments must be a map"));
        };
        let (shell, step): (Map<String, Value>, Map<String, Value>) = map
            .into_iter()
            .partition(|(k, _)| SHELL_OPTION_KEYS.contains(&k.as_str()));
        let config = StepConfig::from_kwargs(Value::Object(step))?;
        let mixin = ShellMixin::new(ShellOptions::default(), Value::Object(shell), &[])?;
        Ok(BuildStep::new(config, Self::new(mixin)))
    }

    fn last_command(&self) -> Option<CommandLine> {
        self.last_command
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl StepBehavior for ShellCommandStep {
    async fn run(&self, ctx: &StepContext) -> Result<ResultCode> {
        let command = self
            .mixin
            .make_remote_shell_command(ctx, ShellOptions::default())
            .await?;
        *self.last_command.lock().unwrap_or_else(PoisonError::into_inner) = Some(command.command_line.clone());
        ctx.update_summary();
        let (result, _) = command.run(ctx).await?;
        Ok(result)
    }

    async fn current_summary(&self, ctx: &StepContext) -> Result<Summary> {
        match (&ctx.config().description, self.last_command()) {
            (None, Some(command)) => Ok(Summary::step(command_to_string(&command))),
            _ => Ok(ctx.default_current_summary()),
        }
    }

    async fn result_summary(&self, ctx: &StepContext, result: ResultCode) -> Result<Summary> {
        let config = ctx.config();
        match self.last_command() {
            Some(command) if config.description_done.is_none() && config.description.is_none() => {
                let mut text = command_to_string(&command);
                if let Some(suffix) = &config.description_suffix {
                    text.push(' ');
                    text.push_str(suffix);
                }
                summary::append_result_suffix(&mut text, result, ctx.timed_out());
                Ok(Summary::step(text))
            }
            _ => Ok(ctx.default_result_summary(result)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describes_commands_briefly() {
        assert_eq!(command_to_string(&"make".into()), "'make'");
        assert_eq!(command_to_string(&"make all install DESTDIR=/tmp".into()), "'make all install ...'");
        let argv = CommandLine::Argv(vec!["a-very-long-program-name-indeed".into(), "--flag".into()]);
        assert_eq!(command_to_string(&argv), "'a-very-long-program-name-indee...'");
    }

    #[test]
    fn later_layers_win() {
        let defaults = ShellOptions {
            timeout: Some(60),
            want_stderr: Some(false),
            ..ShellOptions::command("make")
        };
        let mixin = ShellMixin::new(defaults, json!({"timeout": 30, "command": ["make", "test"]}), &[]).unwrap();
        let merged = mixin.options().clone().merge(ShellOptions {
            timeout: Some(10),
            ..ShellOptions::default()
        });
        assert_eq!(merged.timeout, Some(10));
        assert_eq!(merged.want_stderr, Some(false));
        assert_eq!(
            merged.command,
            Some(Renderable::Value(CommandLine::Argv(vec!["make".into(), "test".into()])))
        );
    }

    #[test]
    fn prohibited_and_unknown_arguments_are_rejected() {
        let err = ShellMixin::new(ShellOptions::default(), json!({"command": "ls"}), &["command"]).unwrap_err();
        assert!(matches!(err, StepError::Config(ref m) if m.contains("command")));

        let err = ShellMixin::new(ShellOptions::default(), json!({"comand": "ls"}), &[]).unwrap_err();
        assert!(matches!(err, StepError::Config(_)));
    }

    #[test]
    fn decode_rc_maps_exit_codes() {
        let cmd = RemoteShellCommand {
            remote: RemoteCommand::new("shell", json!({})),
            command_line: "grep x".into(),
            decode_rc: BTreeMap::from([(0, ResultCode::Success), (1, ResultCode::Warnings)]),
        };
        assert_eq!(cmd.decode(&CommandOutcome::exited(0)), ResultCode::Success);
        assert_eq!(cmd.decode(&CommandOutcome::exited(1)), ResultCode::Warnings);
        assert_eq!(cmd.decode(&CommandOutcome::exited(2)), ResultCode::Failure);
        assert_eq!(cmd.decode(&CommandOutcome::interrupted()), ResultCode::Cancelled);
    }

    #[test]
    fn kwargs_split_between_step_and_shell() {
        let step = ShellCommandStep::from_kwargs(json!({
            "name": "compile",
            "halt_on_failure": true,
            "command": "make",
            "timeout": 5,
        }))
        .unwrap();
        assert_eq!(step.name(), "compile");
        assert!(step.config().halt_on_failure);

        assert!(ShellCommandStep::from_kwargs(json!({"name": "x", "bogus": 1})).is_err());
    }
}
