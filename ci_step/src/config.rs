//! Step configuration: process-wide defaults loaded from the environment and
//! the static per-step configuration a build factory creates steps with.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, StepError};
use crate::locks::LockClaim;
use crate::log;
use crate::properties::{Properties, Renderable};
use crate::results::{FailurePolicy, ResultCode};
use crate::summary::BuildSummaryPolicy;

/// Step names are persisted as identifiers of bounded length.
pub const MAX_STEP_NAME_LEN: usize = 50;

/// Defaults shared by every step of a build, loaded from environment variables.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    /// Minimum interval between two summary recomputations.
    pub summary_interval: Duration,
    /// Number of queued test results that triggers a flush to the store.
    pub test_result_batch_size: usize,
    /// Working directory used when neither the step nor the factory sets one.
    pub default_workdir: String,
    /// Time a remote command gets to exit after each interrupt signal.
    pub interrupt_grace: Duration,
    /// Log encoding used when the step does not set one.
    pub log_encoding: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            summary_interval: Duration::from_millis(1000),
            test_result_batch_size: 100,
            default_workdir: "build".to_string(),
            interrupt_grace: Duration::from_secs(5),
            log_encoding: "utf-8".to_string(),
        }
    }
}

impl CoreConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let summary_interval = std::env::var("STEP_SUMMARY_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.summary_interval);
        let test_result_batch_size = std::env::var("STEP_TEST_RESULT_BATCH")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.test_result_batch_size);
        let default_workdir =
            std::env::var("STEP_DEFAULT_WORKDIR").unwrap_or(defaults.default_workdir);
        let interrupt_grace = std::env::var("STEP_INTERRUPT_GRACE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.interrupt_grace);
        let log_encoding = std::env::var("STEP_LOG_ENCODING").unwrap_or(defaults.log_encoding);

        if test_result_batch_size == 0 {
            tracing::warn!("STEP_TEST_RESULT_BATCH is 0 -- every test result is flushed immediately");
        }
        if !log::is_supported_encoding(&log_encoding) {
            tracing::warn!(
                encoding = %log_encoding,
                "STEP_LOG_ENCODING is not supported -- falling back to utf-8"
            );
        }

        Self {
            summary_interval,
            test_result_batch_size: test_result_batch_size.max(1),
            default_workdir,
            interrupt_grace,
            log_encoding: if log::is_supported_encoding(&log_encoding) {
                log_encoding
            } else {
                "utf-8".to_string()
            },
        }
    }
}

/// Decides from build properties whether a step runs at all.
#[derive(Clone, Default)]
pub enum StepPredicate {
    #[default]
    Always,
    Never,
    When(Arc<dyn Fn(&Properties) -> bool + Send + Sync>),
}

impl StepPredicate {
    pub fn when(f: impl Fn(&Properties) -> bool + Send + Sync + 'static) -> Self {
        Self::When(Arc::new(f))
    }

    pub fn evaluate(&self, props: &Properties) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::When(f) => f(props),
        }
    }
}

impl fmt::Debug for StepPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => f.write_str("Always"),
            Self::Never => f.write_str("Never"),
            Self::When(_) => f.write_str("When(..)"),
        }
    }
}

/// Decides from the final result whether a step is hidden from reports.
#[derive(Clone, Default)]
pub enum HidePredicate {
    #[default]
    Never,
    Always,
    When(Arc<dyn Fn(ResultCode, &Properties) -> bool + Send + Sync>),
}

impl HidePredicate {
    pub fn when(f: impl Fn(ResultCode, &Properties) -> bool + Send + Sync + 'static) -> Self {
        Self::When(Arc::new(f))
    }

    pub fn evaluate(&self, result: ResultCode, props: &Properties) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::When(f) => f(result, props),
        }
    }
}

impl fmt::Debug for HidePredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("Never"),
            Self::Always => f.write_str("Always"),
            Self::When(_) => f.write_str("When(..)"),
        }
    }
}

/// Static configuration of one step, as created by a build factory.
///
/// Can be deserialized from a keyword map; unknown keys are rejected.
/// Locks and predicates are not serializable and are set in code.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StepConfig {
    pub name: String,
    pub description: Option<Renderable<String>>,
    pub description_done: Option<Renderable<String>>,
    pub description_suffix: Option<Renderable<String>>,
    pub halt_on_failure: bool,
    pub flunk_on_warnings: bool,
    pub flunk_on_failure: bool,
    pub warn_on_warnings: bool,
    pub warn_on_failure: bool,
    pub always_run: bool,
    pub use_progress: bool,
    pub progress_metrics: Vec<String>,
    pub workdir: Option<Renderable<String>>,
    pub log_encoding: Option<String>,
    pub update_build_summary_policy: BuildSummaryPolicy,
    #[serde(skip)]
    pub locks: Vec<LockClaim>,
    #[serde(skip)]
    pub do_step_if: StepPredicate,
    #[serde(skip)]
    pub hide_step_if: HidePredicate,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            name: "generic".to_string(),
            description: None,
            description_done: None,
            description_suffix: None,
            halt_on_failure: false,
            flunk_on_warnings: false,
            flunk_on_failure: false,
            warn_on_warnings: false,
            warn_on_failure: false,
            always_run: false,
            use_progress: true,
            progress_metrics: Vec::new(),
            workdir: None,
            log_encoding: None,
            update_build_summary_policy: BuildSummaryPolicy::default(),
            locks: Vec::new(),
            do_step_if: StepPredicate::Always,
            hide_step_if: HidePredicate::Never,
        }
    }
}

impl StepConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Build a config from a keyword map such as `{"name": "compile", "halt_on_failure": true}`.
    pub fn from_kwargs(kwargs: serde_json::Value) -> Result<Self> {
        let config: Self = serde_json::from_value(kwargs)
            .map_err(|e| StepError::config(format!("invalid step arguments: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(StepError::config("step name must not be empty"));
        }
        if self.name.len() > MAX_STEP_NAME_LEN {
            return Err(StepError::config(format!(
                "step name '{}' is longer than {MAX_STEP_NAME_LEN} characters",
                self.name
            )));
        }
        if let Some(encoding) = &self.log_encoding {
            if !log::is_supported_encoding(encoding) {
                return Err(StepError::config(format!(
                    "unsupported log encoding '{encoding}'"
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for metric in &self.progress_metrics {
            if !seen.insert(metric.as_str()) {
                return Err(StepError::config(format!(
                    "progress metric '{metric}' declared twice"
                )));
            }
        }
        Ok(())
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy {
            halt_on_failure: self.halt_on_failure,
            flunk_on_warnings: self.flunk_on_warnings,
            flunk_on_failure: self.flunk_on_failure,
            warn_on_warnings: self.warn_on_warnings,
            warn_on_failure: self.warn_on_failure,
        }
    }
}
