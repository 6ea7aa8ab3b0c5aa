//! The build step state machine.
//!
//! A [`BuildStep`] owns the lifecycle `CREATED → BOUND → READY → RUNNING →
//! (INTERRUPTING) → FINISHED` and everything attached to a running step:
//! locks, logs, statistics, test results, progress and the debounced summary.
//! What the step actually does is supplied by a [`StepBehavior`].

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::build::BuildContext;
use crate::command::WorkerCommands;
use crate::config::{CoreConfig, StepConfig};
use crate::error::{Result, StepError};
use crate::locks::{self, LockGuard};
use crate::log::{Log, LogStore, LogType, OutputProgressObserver};
use crate::progress::ProgressTracker;
use crate::properties::Properties;
use crate::remote::{self, CommandOutcome, RemoteCommand};
use crate::results::{Contribution, FailurePolicy, ResultCode};
use crate::stats::{StatisticsStore, TestResultSet, TestResultSets};
use crate::store::StepStore;
use crate::summary::{self, BuildSummaryPolicy, Debouncer, Summary};
use crate::worker::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    Created,
    Bound,
    Ready,
    Running,
    Interrupting,
    Finished,
}

impl StepState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Bound => "bound",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Interrupting => "interrupting",
            Self::Finished => "finished",
        }
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a concrete step does. Only [`StepBehavior::run`] is required.
#[async_trait]
pub trait StepBehavior: Send + Sync {
    /// Execution entry point. Invoked at most once, while RUNNING.
    async fn run(&self, ctx: &StepContext) -> Result<ResultCode>;

    async fn current_summary(&self, ctx: &StepContext) -> Result<Summary> {
        Ok(ctx.default_current_summary())
    }

    async fn result_summary(&self, ctx: &StepContext, result: ResultCode) -> Result<Summary> {
        Ok(ctx.default_result_summary(result))
    }

    /// Called once, on the first interrupt of a running step, after the core
    /// has flagged the step as stopped and signalled in-flight commands.
    async fn interrupt(&self, _ctx: &StepContext, _reason: &str) {}

    /// Runs right before [`StepBehavior::run`].
    async fn add_test_result_sets(&self, _ctx: &StepContext) -> Result<()> {
        Ok(())
    }

    /// Runs after [`StepBehavior::run`] whatever its outcome.
    async fn finish_test_result_sets(&self, _ctx: &StepContext) -> Result<()> {
        Ok(())
    }
}

/// Step configuration with every renderable resolved against the build's
/// properties. Fixed once the step is READY.
#[derive(Debug, Clone)]
pub struct ResolvedStepConfig {
    pub name: String,
    pub description: Option<String>,
    pub description_done: Option<String>,
    pub description_suffix: Option<String>,
    pub workdir: String,
    pub log_encoding: String,
    pub policy: FailurePolicy,
    pub always_run: bool,
    pub use_progress: bool,
    pub progress_metrics: Vec<String>,
    pub update_build_summary_policy: BuildSummaryPolicy,
}

impl ResolvedStepConfig {
    fn resolve(config: &StepConfig, name: &str, props: &Properties, build: &dyn BuildContext) -> Result<Self> {
        let render = |value: &Option<crate::properties::Renderable<String>>| -> Result<Option<String>> {
            value.as_ref().map(|v| v.render(props)).transpose()
        };
        let workdir = match &config.workdir {
            Some(workdir) => workdir.render(props)?,
            None => build.default_workdir(),
        };
        let log_encoding = config
            .log_encoding
            .clone()
            .unwrap_or_else(|| build.core_config().log_encoding.clone());
        if !crate::log::is_supported_encoding(&log_encoding) {
            return Err(StepError::config(format!("unsupported log encoding '{log_encoding}'")));
        }
        Ok(Self {
            name: name.to_string(),
            description: render(&config.description)?,
            description_done: render(&config.description_done)?,
            description_suffix: render(&config.description_suffix)?,
            workdir,
            log_encoding,
            policy: config.failure_policy(),
            always_run: config.always_run,
            use_progress: config.use_progress,
            progress_metrics: config.progress_metrics.clone(),
            update_build_summary_policy: config.update_build_summary_policy.clone(),
        })
    }
}

/// How a finished step resolved, as seen by its build.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    pub result: ResultCode,
    pub contribution: Contribution,
    pub halt_build: bool,
    pub hidden: bool,
    pub summary: Summary,
}

type SharedState = Arc<Mutex<StepState>>;

fn lock_state(state: &SharedState) -> MutexGuard<'_, StepState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything step logic can reach while it runs.
pub struct StepContext {
    name: String,
    step_id: i64,
    build: Arc<dyn BuildContext>,
    worker: Worker,
    store: Arc<dyn StepStore>,
    core: CoreConfig,
    config: Arc<ResolvedStepConfig>,
    properties: Properties,
    logs: LogStore,
    stats: StatisticsStore,
    tests: TestResultSets,
    progress: Option<Arc<ProgressTracker>>,
    interrupt: watch::Receiver<Option<String>>,
    state: SharedState,
    timed_out: AtomicBool,
    summary: OnceLock<Arc<Debouncer>>,
}

impl StepContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step_id(&self) -> i64 {
        self.step_id
    }

    pub fn build(&self) -> &Arc<dyn BuildContext> {
        &self.build
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub fn config(&self) -> &ResolvedStepConfig {
        &self.config
    }

    pub fn core_config(&self) -> &CoreConfig {
        &self.core
    }

    /// Build properties as they were when the step became READY.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn logs(&self) -> &LogStore {
        &self.logs
    }

    pub fn stats(&self) -> &StatisticsStore {
        &self.stats
    }

    pub fn tests(&self) -> &TestResultSets {
        &self.tests
    }

    pub fn progress(&self) -> Option<&Arc<ProgressTracker>> {
        self.progress.as_ref()
    }

    pub fn state(&self) -> StepState {
        *lock_state(&self.state)
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), StepState::Running | StepState::Interrupting)
    }

    pub fn is_stopped(&self) -> bool {
        self.interrupt.borrow().is_some()
    }

    pub fn interrupt_reason(&self) -> Option<String> {
        self.interrupt.borrow().clone()
    }

    pub fn interrupted(&self) -> watch::Receiver<Option<String>> {
        self.interrupt.clone()
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    pub fn set_timed_out(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
    }

    pub fn workdir(&self) -> &str {
        &self.config.workdir
    }

    /// `path` relative to the step's working directory, posix-joined.
    pub fn build_path(&self, path: &str) -> String {
        if path.starts_with('/') || self.config.workdir.is_empty() {
            path.to_string()
        } else if path.is_empty() || path == "." {
            self.config.workdir.clone()
        } else {
            format!("{}/{}", self.config.workdir.trim_end_matches('/'), path)
        }
    }

    /// Dispatch a command to the worker. Output is routed into this step's
    /// logs and the command is interrupted along with the step.
    pub async fn run_command(&self, command: RemoteCommand) -> Result<CommandOutcome> {
        let mut interrupt = self.interrupt.clone();
        remote::dispatch(&self.worker, command, &self.logs, &mut interrupt, self.core.interrupt_grace).await
    }

    pub fn commands(&self) -> WorkerCommands<'_> {
        WorkerCommands::new(self)
    }

    /// Request a summary recomputation; bursts are debounced.
    pub fn update_summary(&self) {
        if let Some(debouncer) = self.summary.get() {
            debouncer.trigger();
        }
    }

    pub fn set_property(&self, name: &str, value: impl Into<Value>, source: &str) {
        self.build.set_property(name, value.into(), source);
    }

    pub async fn set_build_data(&self, name: &str, value: Vec<u8>, source: &str) -> Result<()> {
        self.build.set_build_data(name, value, source).await
    }

    pub async fn add_url(&self, name: &str, url: &str) -> Result<()> {
        self.store.add_url(self.step_id, name, url).await
    }

    pub async fn add_log(&self, name: &str, log_type: LogType) -> Result<Arc<Log>> {
        self.logs.create(name, log_type).await
    }

    pub async fn get_log(&self, name: &str) -> Result<Arc<Log>> {
        self.logs.get(name).await
    }

    pub async fn add_test_result_set(
        &self,
        description: &str,
        category: &str,
        value_unit: &str,
    ) -> Result<Arc<TestResultSet>> {
        let set = Arc::new(
            TestResultSet::create(
                self.store.clone(),
                self.step_id,
                description,
                category,
                value_unit,
                self.core.test_result_batch_size,
            )
            .await?,
        );
        self.tests.register(set.clone());
        Ok(set)
    }

    /// Update a declared progress metric. Ignored when progress is disabled.
    pub fn set_progress(&self, metric: &str, value: u64) -> Result<()> {
        match &self.progress {
            Some(progress) => progress.set(metric, value),
            None => Ok(()),
        }
    }

    pub fn default_current_summary(&self) -> Summary {
        Summary::step(summary::current_summary_text(
            self.config.description.as_deref(),
            self.config.description_suffix.as_deref(),
        ))
    }

    pub fn default_result_summary(&self, result: ResultCode) -> Summary {
        Summary::step(summary::result_summary_text(
            self.config.description_done.as_deref(),
            self.config.description.as_deref(),
            self.config.description_suffix.as_deref(),
            result,
            self.timed_out(),
        ))
    }

    async fn persist_state_string(&self, text: &str) {
        if let Err(e) = self.store.set_step_state_string(self.step_id, text).await {
            tracing::warn!(step = %self.name, error = %e, "failed to persist step state string");
        }
    }
}

struct StepInner {
    config: StepConfig,
    behavior: Arc<dyn StepBehavior>,
    name: Mutex<String>,
    state: SharedState,
    started: AtomicBool,
    stopped: AtomicBool,
    build: OnceLock<Arc<dyn BuildContext>>,
    worker: OnceLock<Worker>,
    resolved: OnceLock<Arc<ResolvedStepConfig>>,
    properties: OnceLock<Properties>,
    progress: OnceLock<Option<Arc<ProgressTracker>>>,
    step_id: OnceLock<i64>,
    ctx: OnceLock<Arc<StepContext>>,
    outcome: OnceLock<StepOutcome>,
    interrupt_tx: watch::Sender<Option<String>>,
}

/// One unit of work within a build.
#[derive(Clone)]
pub struct BuildStep {
    inner: Arc<StepInner>,
}

impl fmt::Debug for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildStep")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

impl BuildStep {
    pub fn new(config: StepConfig, behavior: impl StepBehavior + 'static) -> Self {
        Self::with_behavior(config, Arc::new(behavior))
    }

    pub fn with_behavior(config: StepConfig, behavior: Arc<dyn StepBehavior>) -> Self {
        let (interrupt_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(StepInner {
                name: Mutex::new(config.name.clone()),
                config,
                behavior,
                state: Arc::new(Mutex::new(StepState::Created)),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                build: OnceLock::new(),
                worker: OnceLock::new(),
                resolved: OnceLock::new(),
                properties: OnceLock::new(),
                progress: OnceLock::new(),
                step_id: OnceLock::new(),
                ctx: OnceLock::new(),
                outcome: OnceLock::new(),
                interrupt_tx,
            }),
        }
    }

    pub fn name(&self) -> String {
        self.inner.name.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Rename the step; only allowed before it starts.
    pub fn set_name(&self, name: impl Into<String>) -> Result<()> {
        if self.inner.started.load(Ordering::SeqCst) {
            return Err(StepError::InvalidState {
                expected: "step not yet started",
                found: self.state().to_string(),
            });
        }
        *self.inner.name.lock().unwrap_or_else(PoisonError::into_inner) = name.into();
        Ok(())
    }

    pub fn config(&self) -> &StepConfig {
        &self.inner.config
    }

    pub fn always_run(&self) -> bool {
        self.inner.config.always_run
    }

    pub fn state(&self) -> StepState {
        *lock_state(&self.inner.state)
    }

    pub fn step_id(&self) -> Option<i64> {
        self.inner.step_id.get().copied()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn resolved_config(&self) -> Option<Arc<ResolvedStepConfig>> {
        self.inner.resolved.get().cloned()
    }

    pub fn progress(&self) -> Option<Arc<ProgressTracker>> {
        self.inner.progress.get().cloned().flatten()
    }

    /// The running context, once the step has started executing.
    pub fn context(&self) -> Option<Arc<StepContext>> {
        self.inner.ctx.get().cloned()
    }

    pub fn outcome(&self) -> Option<StepOutcome> {
        self.inner.outcome.get().cloned()
    }

    /// The final result. Only readable once FINISHED.
    pub fn results(&self) -> Result<ResultCode> {
        self.inner
            .outcome
            .get()
            .map(|o| o.result)
            .ok_or_else(|| StepError::InvalidState {
                expected: "finished step",
                found: self.state().to_string(),
            })
    }

    pub fn bind_build(&self, build: Arc<dyn BuildContext>) -> Result<()> {
        if self.inner.build.set(build).is_err() {
            return Err(StepError::InvalidState {
                expected: "unbound build",
                found: "build already bound".to_string(),
            });
        }
        self.maybe_bound();
        Ok(())
    }

    pub fn bind_worker(&self, worker: Worker) -> Result<()> {
        if self.inner.worker.set(worker).is_err() {
            return Err(StepError::InvalidState {
                expected: "unbound worker",
                found: "worker already bound".to_string(),
            });
        }
        self.maybe_bound();
        Ok(())
    }

    /// Whether a build or worker has already been bound.
    pub fn is_bound(&self) -> bool {
        self.inner.build.get().is_some() || self.inner.worker.get().is_some()
    }

    fn maybe_bound(&self) {
        let mut state = lock_state(&self.inner.state);
        if *state == StepState::Created && self.inner.build.get().is_some() && self.inner.worker.get().is_some() {
            *state = StepState::Bound;
        }
    }

    fn bound_build(&self) -> Result<Arc<dyn BuildContext>> {
        self.inner.build.get().cloned().ok_or_else(|| StepError::InvalidState {
            expected: "step bound to a build",
            found: self.state().to_string(),
        })
    }

    /// Resolve renderables against the build's properties and initialise
    /// progress tracking. BOUND → READY.
    pub fn prepare(&self) -> Result<()> {
        let state = self.state();
        if state != StepState::Bound {
            return Err(StepError::InvalidState {
                expected: "bound",
                found: state.to_string(),
            });
        }
        self.inner.config.validate()?;
        let build = self.bound_build()?;
        let properties = build.properties();
        let resolved = ResolvedStepConfig::resolve(&self.inner.config, &self.name(), &properties, build.as_ref())?;
        let progress = resolved
            .use_progress
            .then(|| Arc::new(ProgressTracker::new(resolved.progress_metrics.iter().cloned())));

        let _ = self.inner.properties.set(properties);
        let _ = self.inner.resolved.set(Arc::new(resolved));
        let _ = self.inner.progress.set(progress);
        *lock_state(&self.inner.state) = StepState::Ready;
        Ok(())
    }

    /// Run the step to completion. Errors are returned only for misuse (the
    /// step is not bound or already started); every failure of the step
    /// itself resolves to a result in the returned outcome.
    pub async fn run(&self) -> Result<StepOutcome> {
        let initial = self.state();
        if !matches!(initial, StepState::Bound | StepState::Ready) {
            return Err(StepError::InvalidState {
                expected: "bound or ready",
                found: initial.to_string(),
            });
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(StepError::InvalidState {
                expected: "step not yet started",
                found: "already started".to_string(),
            });
        }

        let build = self.bound_build()?;
        let store = build.store();
        let name = self.name();
        let began = Instant::now();

        let step_id = match store.add_step(build.build_id(), &name).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(step = %name, error = %e, "failed to record step");
                return Ok(self.conclude(None, ResultCode::Exception, false).await);
            }
        };
        let _ = self.inner.step_id.set(step_id);

        if initial == StepState::Bound {
            if let Err(e) = self.prepare() {
                tracing::error!(step = %name, error = %e, "failed to prepare step");
                return Ok(self.conclude(None, ResultCode::Exception, false).await);
            }
        }
        if self.is_stopped() {
            tracing::info!(step = %name, "step interrupted before it started");
            return Ok(self.conclude(None, ResultCode::Cancelled, false).await);
        }

        let ctx = self.make_context(step_id, build)?;
        let _ = self.inner.ctx.set(ctx.clone());

        let guards = match self.acquire_locks().await {
            Ok(Some(guards)) => guards,
            Ok(None) => return Ok(self.conclude(Some(&ctx), ResultCode::Cancelled, false).await),
            Err(e) => {
                tracing::error!(step = %name, error = %e, "lock acquisition failed");
                return Ok(self.conclude(Some(&ctx), ResultCode::Exception, false).await);
            }
        };
        if let Err(e) = store.set_locks_acquired(step_id).await {
            tracing::warn!(step = %name, error = %e, "failed to persist lock acquisition");
        }

        if !self.inner.config.do_step_if.evaluate(ctx.properties()) {
            drop(guards);
            tracing::info!(step = %name, "step skipped by its run condition");
            return Ok(self.conclude(Some(&ctx), ResultCode::Skipped, false).await);
        }

        let cancelled_before_start = {
            let mut state = lock_state(&self.inner.state);
            if self.is_stopped() {
                true
            } else {
                *state = StepState::Running;
                false
            }
        };
        if cancelled_before_start {
            drop(guards);
            return Ok(self.conclude(Some(&ctx), ResultCode::Cancelled, false).await);
        }

        if let Err(e) = store.start_step(step_id).await {
            tracing::warn!(step = %name, error = %e, "failed to persist step start");
        }
        ctx.logs.open();
        if let Some(progress) = ctx.progress.clone() {
            if progress.is_declared("output") {
                ctx.logs
                    .add_observer("stdio", Box::new(OutputProgressObserver::new(progress, "output")))
                    .await;
            }
        }
        crate::metrics::step_started(&name);
        tracing::info!(step = %name, step_id, worker = %ctx.worker.name(), "step started");

        let debouncer = Debouncer::new(ctx.core.summary_interval, self.summary_action(&ctx));
        let _ = ctx.summary.set(debouncer.clone());
        ctx.update_summary();

        let mut result = match catch_panic(self.run_behavior(&ctx)).await {
            Ok(result) => result,
            Err(e) => self.record_failure(&ctx, e).await,
        };
        if let Err(e) = catch_panic(self.inner.behavior.finish_test_result_sets(&ctx)).await {
            result = result.worst(self.record_failure(&ctx, e).await);
        }
        if let Err(e) = ctx.tests.finish_all().await {
            result = result.worst(self.record_failure(&ctx, e).await);
        }
        if self.is_stopped() && result != ResultCode::Retry {
            result = ResultCode::Cancelled;
        }

        debouncer.stop().await;
        if let Err(e) = ctx.logs.finish_all().await {
            tracing::error!(step = %name, error = %e, "failed to finish logs");
            result = result.worst(ResultCode::Exception);
        }
        drop(guards);

        crate::metrics::step_duration(&name, began.elapsed().as_millis() as u64);
        Ok(self.conclude(Some(&ctx), result, true).await)
    }

    /// Finish a step that will not run, e.g. passed over by a halted build.
    pub async fn skip(&self) -> Result<StepOutcome> {
        let state = self.state();
        if state == StepState::Finished || self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(StepError::InvalidState {
                expected: "step not yet started",
                found: state.to_string(),
            });
        }
        if let Some(build) = self.inner.build.get() {
            match build.store().add_step(build.build_id(), &self.name()).await {
                Ok(id) => {
                    let _ = self.inner.step_id.set(id);
                }
                Err(e) => tracing::warn!(step = %self.name(), error = %e, "failed to record skipped step"),
            }
        }
        Ok(self.conclude(None, ResultCode::Skipped, false).await)
    }

    /// Ask the step to stop. Safe to call repeatedly and concurrently; only
    /// the first call has any effect, and none once the step has finished.
    pub async fn interrupt(&self, reason: &str) {
        let was_running = {
            let mut state = lock_state(&self.inner.state);
            if *state == StepState::Finished || self.inner.stopped.swap(true, Ordering::SeqCst) {
                return;
            }
            let running = *state == StepState::Running;
            if running {
                *state = StepState::Interrupting;
            }
            running
        };
        tracing::info!(step = %self.name(), %reason, "step interrupted");
        self.inner.interrupt_tx.send_replace(Some(reason.to_string()));

        if was_running {
            if let Some(ctx) = self.inner.ctx.get() {
                self.inner.behavior.interrupt(ctx, reason).await;
            }
        }
    }

    fn make_context(&self, step_id: i64, build: Arc<dyn BuildContext>) -> Result<Arc<StepContext>> {
        let not_ready = || StepError::InvalidState {
            expected: "ready",
            found: self.state().to_string(),
        };
        let config = self.inner.resolved.get().cloned().ok_or_else(not_ready)?;
        let worker = self.inner.worker.get().cloned().ok_or_else(not_ready)?;
        let properties = self.inner.properties.get().cloned().unwrap_or_default();
        let progress = self.inner.progress.get().cloned().flatten();
        let store = build.store();
        let core = build.core_config().clone();

        Ok(Arc::new(StepContext {
            name: self.name(),
            step_id,
            logs: LogStore::new(store.clone(), step_id, config.log_encoding.clone()),
            build,
            worker,
            store,
            core,
            config,
            properties,
            stats: StatisticsStore::default(),
            tests: TestResultSets::default(),
            progress,
            interrupt: self.inner.interrupt_tx.subscribe(),
            state: self.inner.state.clone(),
            timed_out: AtomicBool::new(false),
            summary: OnceLock::new(),
        }))
    }

    fn summary_action(&self, ctx: &Arc<StepContext>) -> summary::DebouncedAction {
        let weak = Arc::downgrade(ctx);
        let behavior = self.inner.behavior.clone();
        summary::debounced(move || {
            let weak = weak.clone();
            let behavior = behavior.clone();
            async move {
                let Some(ctx) = weak.upgrade() else {
                    return;
                };
                match behavior.current_summary(&ctx).await {
                    Ok(summary) => {
                        if let Some(text) = summary.step {
                            tracing::debug!(step = %ctx.name, summary = %text, "summary updated");
                            ctx.persist_state_string(&text).await;
                        }
                    }
                    Err(e) => tracing::warn!(step = %ctx.name, error = %e, "current summary failed"),
                }
            }
        })
    }

    /// `None` when interrupted while waiting.
    async fn acquire_locks(&self) -> Result<Option<Vec<LockGuard>>> {
        let claims = &self.inner.config.locks;
        if claims.is_empty() {
            return Ok(Some(Vec::new()));
        }
        let mut interrupt = self.inner.interrupt_tx.subscribe();
        let interrupted = async move {
            let _ = interrupt.wait_for(Option::is_some).await;
        };
        tokio::select! {
            guards = locks::acquire_all(claims) => {
                let guards = guards?;
                tracing::info!(step = %self.name(), count = guards.len(), "locks acquired");
                Ok(Some(guards))
            }
            _ = interrupted => {
                tracing::info!(step = %self.name(), "interrupted while waiting for locks");
                Ok(None)
            }
        }
    }

    async fn run_behavior(&self, ctx: &StepContext) -> Result<ResultCode> {
        self.inner.behavior.add_test_result_sets(ctx).await?;
        self.inner.behavior.run(ctx).await
    }

    /// Map an error escaping step logic to a result. Unexpected errors are
    /// also written to an `err.text` log.
    async fn record_failure(&self, ctx: &StepContext, err: StepError) -> ResultCode {
        match err {
            StepError::Abandoned { result, reason } => {
                tracing::info!(step = %ctx.name, %result, %reason, "step abandoned");
                result
            }
            err => {
                tracing::error!(step = %ctx.name, error = %err, "step failed with an error");
                if let Err(e) = ctx.logs.append_complete("err.text", LogType::Text, &format!("{err}\n")).await {
                    tracing::warn!(step = %ctx.name, error = %e, "could not write err.text");
                }
                ResultCode::Exception
            }
        }
    }

    fn static_result_summary(&self, result: ResultCode) -> Summary {
        let resolved = self.inner.resolved.get();
        Summary::step(summary::result_summary_text(
            resolved.and_then(|r| r.description_done.as_deref()),
            resolved.and_then(|r| r.description.as_deref()),
            resolved.and_then(|r| r.description_suffix.as_deref()),
            result,
            false,
        ))
    }

    /// Transition to FINISHED: summary, failure policy, persistence.
    async fn conclude(&self, ctx: Option<&Arc<StepContext>>, result: ResultCode, was_running: bool) -> StepOutcome {
        let name = self.name();
        let policy = self
            .inner
            .resolved
            .get()
            .map(|r| r.policy)
            .unwrap_or_else(|| self.inner.config.failure_policy());

        let summary = match ctx {
            Some(ctx) if was_running => match self.inner.behavior.result_summary(ctx, result).await {
                Ok(summary) => summary,
                Err(e) => {
                    tracing::warn!(step = %name, error = %e, "result summary failed");
                    ctx.default_result_summary(result)
                }
            },
            Some(ctx) => ctx.default_result_summary(result),
            None => self.static_result_summary(result),
        };
        let summary = self.inner.config.update_build_summary_policy.apply(summary, result);

        let build = self.inner.build.get();
        let properties = build.map(|b| b.properties()).unwrap_or_default();
        let hidden = self.inner.config.hide_step_if.evaluate(result, &properties);

        if let Some(build) = build {
            if let Some(text) = &summary.build {
                build.add_summary_fragment(&name, text);
            }
            if let Some(step_id) = self.step_id() {
                let store = build.store();
                if let Some(text) = &summary.step {
                    if let Err(e) = store.set_step_state_string(step_id, text).await {
                        tracing::warn!(step = %name, error = %e, "failed to persist step state string");
                    }
                }
                if let Err(e) = store.finish_step(step_id, result, hidden).await {
                    tracing::warn!(step = %name, error = %e, "failed to persist step result");
                }
            }
        }

        let outcome = StepOutcome {
            result,
            contribution: policy.contribution(result),
            halt_build: policy.halts_build(result),
            hidden,
            summary,
        };
        let _ = self.inner.outcome.set(outcome.clone());
        *lock_state(&self.inner.state) = StepState::Finished;

        crate::metrics::step_finished(result, was_running);
        tracing::info!(step = %name, %result, contribution = ?outcome.contribution, "step finished");
        outcome
    }
}

/// Run step logic so that a panic surfaces as an error and the step still
/// reaches FINISHED.
async fn catch_panic<T>(fut: impl Future<Output = Result<T>>) -> Result<T> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(StepError::Other(anyhow::anyhow!("step logic panicked: {message}")))
        }
    }
}
