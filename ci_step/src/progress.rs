//! Named, monotonically non-decreasing progress counters.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{Result, StepError};

#[derive(Debug, Default)]
struct Counters {
    values: BTreeMap<String, u64>,
    expectations: BTreeMap<String, u64>,
}

/// Progress counters of one step, restricted to the metrics it declared.
#[derive(Debug)]
pub struct ProgressTracker {
    declared: BTreeSet<String>,
    counters: Mutex<Counters>,
}

impl ProgressTracker {
    pub fn new<I, S>(metrics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            declared: metrics.into_iter().map(Into::into).collect(),
            counters: Mutex::default(),
        }
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_declared(&self, metric: &str) -> bool {
        self.declared.contains(metric)
    }

    /// Update a counter. Values lower than the current one are ignored.
    pub fn set(&self, metric: &str, value: u64) -> Result<()> {
        if !self.is_declared(metric) {
            return Err(StepError::UndeclaredMetric(metric.to_string()));
        }
        let mut counters = self.counters();
        let current = counters.values.entry(metric.to_string()).or_insert(0);
        *current = (*current).max(value);
        Ok(())
    }

    pub fn get(&self, metric: &str) -> Option<u64> {
        self.counters().values.get(metric).copied()
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters().values.clone()
    }

    /// Expected final values, typically taken from a previous build.
    pub fn set_expectations(&self, expectations: BTreeMap<String, u64>) {
        self.counters().expectations = expectations
            .into_iter()
            .filter(|(metric, expected)| self.declared.contains(metric) && *expected > 0)
            .collect();
    }

    /// Mean completion over the metrics that have an expectation.
    pub fn fraction_complete(&self) -> Option<f64> {
        let counters = self.counters();
        if counters.expectations.is_empty() {
            return None;
        }
        let total: f64 = counters
            .expectations
            .iter()
            .map(|(metric, expected)| {
                let current = counters.values.get(metric).copied().unwrap_or(0);
                (current as f64 / *expected as f64).min(1.0)
            })
            .sum();
        Some(total / counters.expectations.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undeclared_metric_is_config_error() {
        let progress = ProgressTracker::new(["output"]);
        let err = progress.set("tests", 3).unwrap_err();
        assert!(matches!(err, StepError::UndeclaredMetric(ref m) if m == "tests"));
    }

    #[test]
    fn counters_never_decrease() {
        let progress = ProgressTracker::new(["output"]);
        progress.set("output", 10).unwrap();
        progress.set("output", 4).unwrap();
        assert_eq!(progress.get("output"), Some(10));
    }

    #[test]
    fn fraction_uses_expectations() {
        let progress = ProgressTracker::new(["output", "tests"]);
        assert_eq!(progress.fraction_complete(), None);

        progress.set_expectations(BTreeMap::from([
            ("output".to_string(), 100),
            ("tests".to_string(), 10),
        ]));
        progress.set("output", 50).unwrap();
        progress.set("tests", 20).unwrap();
        assert_eq!(progress.fraction_complete(), Some(0.75));
    }
}
