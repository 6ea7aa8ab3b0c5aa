//! Step summaries, the build-summary promotion policy and the debouncer that
//! rate-limits summary recomputation.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::results::ResultCode;

/// Short human-readable status of a step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// Shown next to the step.
    pub step: Option<String>,
    /// Shown on the build; only meaningful for result summaries.
    pub build: Option<String>,
}

impl Summary {
    pub fn step(text: impl Into<String>) -> Self {
        Self {
            step: Some(text.into()),
            build: None,
        }
    }
}

/// When the step-scoped result summary is promoted to the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildSummaryPolicy {
    Never,
    Always,
    OnResults(Vec<ResultCode>),
}

impl Default for BuildSummaryPolicy {
    fn default() -> Self {
        Self::OnResults(vec![
            ResultCode::Failure,
            ResultCode::Exception,
            ResultCode::Retry,
            ResultCode::Cancelled,
        ])
    }
}

impl BuildSummaryPolicy {
    pub fn promotes(&self, result: ResultCode) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::OnResults(results) => results.contains(&result),
        }
    }

    /// Fill in `summary.build` from `summary.step` unless the step set it.
    pub fn apply(&self, mut summary: Summary, result: ResultCode) -> Summary {
        if summary.build.is_none() && self.promotes(result) {
            summary.build = summary.step.clone();
        }
        summary
    }
}

pub fn current_summary_text(description: Option<&str>, suffix: Option<&str>) -> String {
    let mut text = description.unwrap_or("running").to_string();
    if let Some(suffix) = suffix {
        text.push(' ');
        text.push_str(suffix);
    }
    text
}

pub fn result_summary_text(
    description_done: Option<&str>,
    description: Option<&str>,
    suffix: Option<&str>,
    result: ResultCode,
    timed_out: bool,
) -> String {
    let mut text = description_done
        .or(description)
        .unwrap_or("finished")
        .to_string();
    if let Some(suffix) = suffix {
        text.push(' ');
        text.push_str(suffix);
    }
    append_result_suffix(&mut text, result, timed_out);
    text
}

/// `" (failure)"`, plus `" (timed out)"` when applicable; nothing for success.
pub fn append_result_suffix(text: &mut String, result: ResultCode, timed_out: bool) {
    if result != ResultCode::Success {
        text.push_str(&format!(" ({result})"));
        if timed_out {
            text.push_str(" (timed out)");
        }
    }
}

pub type DebouncedAction = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Wrap an async closure as a [`DebouncedAction`].
pub fn debounced<F, Fut>(f: F) -> DebouncedAction
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || -> Pin<Box<dyn Future<Output = ()> + Send>> { Box::pin(f()) })
}

#[derive(Default)]
struct DebounceState {
    /// A timer task exists (sleeping or running the action).
    scheduled: bool,
    /// The action is executing right now.
    running: bool,
    /// Triggered again while the action was running.
    pending: bool,
    stopped: bool,
    task: Option<JoinHandle<()>>,
}

/// Collapses bursts of triggers into at most one action per `wait` window.
///
/// The first trigger arms a timer; triggers while it is armed are absorbed,
/// triggers while the action runs re-arm it once. [`Debouncer::stop`] cancels
/// the timer and waits for an in-flight action.
pub struct Debouncer {
    wait: Duration,
    action: DebouncedAction,
    state: Mutex<DebounceState>,
    cancel: Notify,
    runs: AtomicU64,
}

impl Debouncer {
    pub fn new(wait: Duration, action: DebouncedAction) -> Arc<Self> {
        Arc::new(Self {
            wait,
            action,
            state: Mutex::new(DebounceState::default()),
            cancel: Notify::new(),
            runs: AtomicU64::new(0),
        })
    }

    fn state(&self) -> MutexGuard<'_, DebounceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn trigger(self: &Arc<Self>) {
        let mut state = self.state();
        if state.stopped {
            return;
        }
        if state.scheduled {
            if state.running {
                state.pending = true;
            }
            return;
        }
        state.scheduled = true;
        let this = Arc::clone(self);
        state.task = Some(tokio::spawn(async move { this.run_loop().await }));
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.wait) => {}
                _ = self.cancel.notified() => {
                    self.state().scheduled = false;
                    return;
                }
            }
            {
                let mut state = self.state();
                if state.stopped {
                    state.scheduled = false;
                    return;
                }
                state.running = true;
            }

            (self.action)().await;
            self.runs.fetch_add(1, Ordering::Relaxed);
            crate::metrics::summary_recomputed();

            let mut state = self.state();
            state.running = false;
            if state.pending && !state.stopped {
                state.pending = false;
                continue;
            }
            state.scheduled = false;
            return;
        }
    }

    /// Number of times the action has run.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Cancel any armed timer, wait for a running action, refuse new triggers.
    pub async fn stop(&self) {
        let task = {
            let mut state = self.state();
            state.stopped = true;
            state.pending = false;
            state.task.take()
        };
        self.cancel.notify_one();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_action(counter: Arc<AtomicU64>) -> DebouncedAction {
        debounced(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_into_one_run() {
        let calls = Arc::new(AtomicU64::new(0));
        let debouncer = Debouncer::new(Duration::from_secs(1), counting_action(calls.clone()));

        for _ in 0..50 {
            debouncer.trigger();
        }
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(debouncer.runs(), 1);

        debouncer.trigger();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(debouncer.runs(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_during_action_rearms_once() {
        let calls = Arc::new(AtomicU64::new(0));
        let action = {
            let calls = calls.clone();
            debounced(move || {
                let calls = calls.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    calls.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        let debouncer = Debouncer::new(Duration::from_secs(1), action);

        debouncer.trigger();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        debouncer.trigger();
        debouncer.trigger();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(debouncer.runs(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_armed_timer() {
        let calls = Arc::new(AtomicU64::new(0));
        let debouncer = Debouncer::new(Duration::from_secs(1), counting_action(calls.clone()));

        debouncer.trigger();
        debouncer.stop().await;
        debouncer.trigger();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn result_summary_text_appends_result() {
        assert_eq!(
            result_summary_text(None, None, None, ResultCode::Success, false),
            "finished"
        );
        assert_eq!(
            result_summary_text(Some("compiled"), Some("compiling"), Some("[x86]"), ResultCode::Failure, true),
            "compiled [x86] (failure) (timed out)"
        );
        assert_eq!(current_summary_text(None, None), "running");
    }

    #[test]
    fn default_policy_promotes_only_failures() {
        let policy = BuildSummaryPolicy::default();
        let promoted = policy.apply(Summary::step("failed"), ResultCode::Failure);
        assert_eq!(promoted.build.as_deref(), Some("failed"));

        let kept = policy.apply(Summary::step("ok"), ResultCode::Success);
        assert_eq!(kept.build, None);

        let explicit = Summary {
            step: Some("ok".into()),
            build: Some("custom".into()),
        };
        assert_eq!(
            BuildSummaryPolicy::Never.apply(explicit.clone(), ResultCode::Success),
            explicit
        );
    }
}
