//! Transient step statistics and batched test-result sets.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StepError};
use crate::store::StepStore;

/// Named values visible while the build runs. Not persisted.
#[derive(Debug, Default)]
pub struct StatisticsStore {
    values: Mutex<BTreeMap<String, Value>>,
}

impl StatisticsStore {
    fn values(&self) -> MutexGuard<'_, BTreeMap<String, Value>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.values().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.values().insert(name.into(), value.into());
    }

    pub fn has(&self, name: &str) -> bool {
        self.values().contains_key(name)
    }

    pub fn all(&self) -> BTreeMap<String, Value> {
        self.values().clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_name: String,
    pub test_code_path: Option<String>,
    pub line: Option<u32>,
    pub duration_ns: Option<u64>,
    pub value: String,
}

impl TestResult {
    pub fn new(test_name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            test_name: test_name.into(),
            test_code_path: None,
            line: None,
            duration_ns: None,
            value: value.into(),
        }
    }

    pub fn with_location(mut self, path: impl Into<String>, line: Option<u32>) -> Self {
        self.test_code_path = Some(path.into());
        self.line = line;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ns = Some(duration.as_nanos() as u64);
        self
    }
}

/// A categorized bucket of test outcomes. Appends are queued and written to
/// the store in batches; [`TestResultSet::finish`] flushes and completes it.
pub struct TestResultSet {
    id: i64,
    description: String,
    category: String,
    value_unit: String,
    batch_size: usize,
    store: Arc<dyn StepStore>,
    pending: tokio::sync::Mutex<Vec<TestResult>>,
    complete: AtomicBool,
}

impl std::fmt::Debug for TestResultSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestResultSet")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("category", &self.category)
            .field("value_unit", &self.value_unit)
            .finish()
    }
}

impl TestResultSet {
    pub async fn create(
        store: Arc<dyn StepStore>,
        step_id: i64,
        description: &str,
        category: &str,
        value_unit: &str,
        batch_size: usize,
    ) -> Result<Self> {
        let id = store
            .add_test_result_set(step_id, description, category, value_unit)
            .await?;
        Ok(Self {
            id,
            description: description.to_string(),
            category: category.to_string(),
            value_unit: value_unit.to_string(),
            batch_size: batch_size.max(1),
            store,
            pending: tokio::sync::Mutex::new(Vec::new()),
            complete: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn value_unit(&self) -> &str {
        &self.value_unit
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    pub async fn add_test_result(&self, result: TestResult) -> Result<()> {
        if self.is_complete() {
            return Err(StepError::InvalidState {
                expected: "open test result set",
                found: format!("set '{}' is complete", self.description),
            });
        }
        let mut pending = self.pending.lock().await;
        pending.push(result);
        if pending.len() >= self.batch_size {
            self.flush_locked(&mut pending).await?;
        }
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        let mut pending = self.pending.lock().await;
        self.flush_locked(&mut pending).await
    }

    async fn flush_locked(&self, pending: &mut Vec<TestResult>) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        self.store.add_test_results(self.id, pending).await?;
        crate::metrics::test_results_flushed(pending.len());
        tracing::debug!(set_id = self.id, count = pending.len(), "test results flushed");
        pending.clear();
        Ok(())
    }

    /// Flush queued results and mark the set complete. Idempotent.
    pub async fn finish(&self) -> Result<()> {
        let mut pending = self.pending.lock().await;
        if self.is_complete() {
            return Ok(());
        }
        self.flush_locked(&mut pending).await?;
        self.store.complete_test_result_set(self.id).await?;
        self.complete.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Every test result set a step created.
#[derive(Debug, Default)]
pub struct TestResultSets {
    sets: Mutex<Vec<Arc<TestResultSet>>>,
}

impl TestResultSets {
    fn sets(&self) -> MutexGuard<'_, Vec<Arc<TestResultSet>>> {
        self.sets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, set: Arc<TestResultSet>) {
        self.sets().push(set);
    }

    pub fn all(&self) -> Vec<Arc<TestResultSet>> {
        self.sets().clone()
    }

    /// Finish every set; returns the first error after attempting all.
    pub async fn finish_all(&self) -> Result<()> {
        let mut first_error = None;
        for set in self.all() {
            if let Err(e) = set.finish().await {
                tracing::warn!(set_id = set.id(), error = %e, "failed to finish test result set");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
