//! The containing build: the step-facing [`BuildContext`] collaborator and a
//! minimal sequencer that runs attached steps in order.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::config::CoreConfig;
use crate::error::{Result, StepError};
use crate::properties::Properties;
use crate::results::ResultCode;
use crate::step::{BuildStep, StepOutcome};
use crate::store::StepStore;
use crate::worker::Worker;

/// What a step needs from the build it belongs to.
#[async_trait]
pub trait BuildContext: Send + Sync {
    fn build_id(&self) -> i64;

    /// Snapshot of the current build properties.
    fn properties(&self) -> Properties;

    fn set_property(&self, name: &str, value: Value, source: &str);

    /// Working directory for steps that set none: the factory's, else the
    /// configured default.
    fn default_workdir(&self) -> String;

    fn store(&self) -> Arc<dyn StepStore>;

    fn core_config(&self) -> &CoreConfig;

    /// Receive a build-scoped summary message from a finished step.
    fn add_summary_fragment(&self, step_name: &str, text: &str);

    async fn set_build_data(&self, name: &str, value: Vec<u8>, source: &str) -> Result<()> {
        self.store().set_build_data(self.build_id(), name, value, source).await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildOutcome {
    pub result: ResultCode,
    pub steps: Vec<(String, StepOutcome)>,
    pub summaries: Vec<String>,
}

struct BuildState {
    properties: Properties,
    workdir: Option<String>,
    steps: Vec<BuildStep>,
    current: Option<BuildStep>,
    summaries: Vec<String>,
}

struct BuildInner {
    build_id: i64,
    worker: Worker,
    store: Arc<dyn StepStore>,
    core: CoreConfig,
    stopped: AtomicBool,
    state: Mutex<BuildState>,
}

impl BuildInner {
    fn state(&self) -> MutexGuard<'_, BuildState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BuildContext for BuildInner {
    fn build_id(&self) -> i64 {
        self.build_id
    }

    fn properties(&self) -> Properties {
        self.state().properties.clone()
    }

    fn set_property(&self, name: &str, value: Value, source: &str) {
        self.state().properties.set(name, value, source);
    }

    fn default_workdir(&self) -> String {
        self.state()
            .workdir
            .clone()
            .unwrap_or_else(|| self.core.default_workdir.clone())
    }

    fn store(&self) -> Arc<dyn StepStore> {
        self.store.clone()
    }

    fn core_config(&self) -> &CoreConfig {
        &self.core
    }

    fn add_summary_fragment(&self, step_name: &str, text: &str) {
        self.state().summaries.push(format!("{step_name}: {text}"));
    }
}

/// An ordered sequence of steps run on one worker.
#[derive(Clone)]
pub struct Build {
    inner: Arc<BuildInner>,
}

impl Build {
    pub fn new(build_id: i64, worker: Worker, store: Arc<dyn StepStore>, core: CoreConfig) -> Self {
        Self {
            inner: Arc::new(BuildInner {
                build_id,
                worker,
                store,
                core,
                stopped: AtomicBool::new(false),
                state: Mutex::new(BuildState {
                    properties: Properties::new(),
                    workdir: None,
                    steps: Vec::new(),
                    current: None,
                    summaries: Vec::new(),
                }),
            }),
        }
    }

    pub fn build_id(&self) -> i64 {
        self.inner.build_id
    }

    pub fn context(&self) -> Arc<dyn BuildContext> {
        self.inner.clone()
    }

    pub fn properties(&self) -> Properties {
        self.inner.properties()
    }

    pub fn set_property(&self, name: &str, value: impl Into<Value>, source: &str) {
        self.inner.set_property(name, value.into(), source);
    }

    /// Factory-level working directory for steps that set none.
    pub fn set_workdir(&self, workdir: impl Into<String>) {
        self.inner.state().workdir = Some(workdir.into());
    }

    pub fn steps(&self) -> Vec<BuildStep> {
        self.inner.state().steps.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Attach a step, renaming it `name_1`, `name_2`, ... if a sibling
    /// already uses its name, and bind it to this build and worker.
    pub fn add_step(&self, step: BuildStep) -> Result<()> {
        if step.is_bound() {
            return Err(StepError::InvalidState {
                expected: "step not attached to a build",
                found: format!("'{}' already bound", step.name()),
            });
        }
        step.bind_build(self.context())?;
        step.bind_worker(self.inner.worker.clone())?;

        let mut state = self.inner.state();
        let taken: HashSet<String> = state.steps.iter().map(BuildStep::name).collect();
        let base = step.name();
        if taken.contains(&base) {
            let mut n = 1;
            while taken.contains(&format!("{base}_{n}")) {
                n += 1;
            }
            step.set_name(format!("{base}_{n}"))?;
        }
        state.steps.push(step);
        Ok(())
    }

    /// Run every step in order and fold their outcomes into a build result.
    pub async fn run(&self) -> BuildOutcome {
        let started = Instant::now();
        let mut result = ResultCode::Success;
        let mut halted = false;
        let mut outcomes = Vec::new();

        tracing::info!(build_id = self.inner.build_id, worker = %self.inner.worker.name(), "build started");
        for step in self.steps() {
            let run_it = {
                let mut state = self.inner.state();
                let passed_over = (halted || self.is_stopped()) && !step.always_run();
                if !passed_over {
                    state.current = Some(step.clone());
                }
                !passed_over
            };

            let outcome = if run_it {
                let outcome = step.run().await;
                self.inner.state().current = None;
                outcome
            } else {
                step.skip().await
            };
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(build_id = self.inner.build_id, step = %step.name(), error = %e, "step could not be run");
                    result = result.worst(ResultCode::Exception);
                    halted = true;
                    continue;
                }
            };

            if let Some(contributed) = outcome.contribution.as_result() {
                result = result.worst(contributed);
            }
            if outcome.result.terminates_build() {
                result = result.worst(outcome.result);
            }
            if outcome.halt_build && !halted {
                tracing::info!(build_id = self.inner.build_id, step = %step.name(), result = %outcome.result, "build halted");
                halted = true;
            }
            outcomes.push((step.name(), outcome));
        }

        if self.is_stopped() {
            result = result.worst(ResultCode::Cancelled);
        }
        let summaries = self.inner.state().summaries.clone();
        crate::metrics::build_finished(result, started.elapsed().as_millis() as u64);
        tracing::info!(build_id = self.inner.build_id, %result, steps = outcomes.len(), "build finished");
        BuildOutcome {
            result,
            steps: outcomes,
            summaries,
        }
    }

    /// Stop the build: interrupt the running step and pass over the rest
    /// (except `always_run` steps).
    pub async fn stop(&self, reason: &str) {
        let current = {
            let state = self.inner.state();
            self.inner.stopped.store(true, Ordering::SeqCst);
            state.current.clone()
        };
        tracing::info!(build_id = self.inner.build_id, %reason, "build stopped");
        if let Some(step) = current {
            step.interrupt(reason).await;
        }
    }
}
