//! Pipeline definition: a JSON list of shell steps.
//!
//! ```json
//! {
//!   "timeout_secs": 600,
//!   "steps": [
//!     {"name": "check", "command": "cargo check", "halt_on_failure": true},
//!     {"name": "test", "command": ["cargo", "test"], "locks": [{"name": "db"}]}
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use ci_step::{
    BuildStep, CommandLine, LockClaim, LockMode, LockRegistry, Renderable, ShellCommandStep,
    ShellMixin, ShellOptions, StepConfig,
};
use eyre::WrapErr;
use serde::Deserialize;

const DEFAULT_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pipeline {
    /// Overall limit for each step's command.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub steps: Vec<StepDef>,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDef {
    pub name: String,
    pub command: CommandLine,
    pub description: Option<String>,
    #[serde(default)]
    pub halt_on_failure: bool,
    #[serde(default = "default_true")]
    pub flunk_on_failure: bool,
    #[serde(default)]
    pub warn_on_failure: bool,
    #[serde(default)]
    pub always_run: bool,
    #[serde(default)]
    pub env: BTreeMap<String, Renderable<String>>,
    pub workdir: Option<Renderable<String>>,
    #[serde(default)]
    pub locks: Vec<LockDef>,
    /// Seconds without output before the command is killed.
    pub timeout: Option<u64>,
    pub decode_rc: Option<BTreeMap<i32, ci_step::ResultCode>>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockDef {
    pub name: String,
    #[serde(default = "default_mode")]
    pub mode: LockModeDef,
    #[serde(default = "default_max_count")]
    pub max_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockModeDef {
    Shared,
    Exclusive,
}

fn default_mode() -> LockModeDef {
    LockModeDef::Exclusive
}

fn default_max_count() -> u32 {
    1
}

impl Pipeline {
    pub fn from_json(text: &str) -> eyre::Result<Self> {
        let mut pipeline: Self = serde_json::from_str(text).wrap_err("invalid pipeline definition")?;
        if pipeline.steps.is_empty() {
            tracing::warn!("pipeline defines no steps, running a placeholder");
            pipeline.steps.push(StepDef::placeholder());
        }
        Ok(pipeline)
    }

    pub async fn load(path: &Path) -> eyre::Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .wrap_err_with(|| format!("failed to read pipeline {}", path.display()))?;
        Self::from_json(&text)
    }

    /// Turn every step definition into a shell step. Locks with the same
    /// name are shared across steps through `registry`.
    pub fn build_steps(&self, registry: &LockRegistry) -> eyre::Result<Vec<BuildStep>> {
        self.steps
            .iter()
            .map(|def| def.to_step(self.timeout_secs, registry))
            .collect()
    }
}

impl StepDef {
    fn placeholder() -> Self {
        Self {
            name: "check".to_string(),
            command: CommandLine::Shell("echo 'No pipeline configured'".to_string()),
            description: None,
            halt_on_failure: false,
            flunk_on_failure: true,
            warn_on_failure: false,
            always_run: false,
            env: BTreeMap::new(),
            workdir: None,
            locks: Vec::new(),
            timeout: None,
            decode_rc: None,
        }
    }

    fn to_step(&self, max_time: u64, registry: &LockRegistry) -> eyre::Result<BuildStep> {
        let locks = self
            .locks
            .iter()
            .map(|lock| LockClaim {
                lock: registry.get_or_create(&lock.name, lock.max_count),
                mode: match lock.mode {
                    LockModeDef::Shared => LockMode::Shared,
                    LockModeDef::Exclusive => LockMode::Exclusive,
                },
            })
            .collect();
        let config = StepConfig {
            description: self.description.clone().map(Renderable::Value),
            halt_on_failure: self.halt_on_failure,
            flunk_on_failure: self.flunk_on_failure,
            warn_on_failure: self.warn_on_failure,
            always_run: self.always_run,
            locks,
            ..StepConfig::new(self.name.clone())
        };
        config
            .validate()
            .wrap_err_with(|| format!("invalid step '{}'", self.name))?;

        let mut env = self.env.clone();
        env.entry("CI".to_string())
            .or_insert_with(|| Renderable::Value("true".to_string()));
        let options = ShellOptions {
            env: Some(env),
            workdir: self.workdir.clone(),
            timeout: self.timeout,
            max_time: Some(max_time),
            decode_rc: self.decode_rc.clone(),
            ..ShellOptions::command(self.command.clone())
        };
        Ok(BuildStep::new(
            config,
            ShellCommandStep::new(ShellMixin::from_options(options)),
        ))
    }
}
