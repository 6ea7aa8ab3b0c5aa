//! Persistence boundary for steps, logs, test results and build data.
//!
//! [`StepStore`] is the contract with the persistent store. [`MemoryStore`]
//! keeps everything in process and backs the tests and the pipeline runner.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StepError};
use crate::log::{Channel, LogType};
use crate::results::ResultCode;
use crate::stats::TestResult;

#[async_trait]
pub trait StepStore: Send + Sync {
    /// Record a new step and assign its durable id.
    async fn add_step(&self, build_id: i64, name: &str) -> Result<i64>;
    async fn start_step(&self, step_id: i64) -> Result<()>;
    async fn set_locks_acquired(&self, step_id: i64) -> Result<()>;
    async fn set_step_state_string(&self, step_id: i64, state: &str) -> Result<()>;
    async fn add_url(&self, step_id: i64, name: &str, url: &str) -> Result<()>;
    async fn finish_step(&self, step_id: i64, result: ResultCode, hidden: bool) -> Result<()>;

    async fn add_log(&self, step_id: i64, name: &str, log_type: LogType) -> Result<i64>;
    async fn append_log(&self, log_id: i64, channel: Channel, text: &str) -> Result<()>;
    async fn finish_log(&self, log_id: i64) -> Result<()>;

    async fn add_test_result_set(
        &self,
        step_id: i64,
        description: &str,
        category: &str,
        value_unit: &str,
    ) -> Result<i64>;
    async fn add_test_results(&self, set_id: i64, results: &[TestResult]) -> Result<()>;
    async fn complete_test_result_set(&self, set_id: i64) -> Result<()>;

    async fn set_build_data(&self, build_id: i64, name: &str, value: Vec<u8>, source: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: i64,
    pub build_id: i64,
    /// Position of the step within its build.
    pub number: i32,
    pub name: String,
    pub state_string: String,
    pub results: Option<ResultCode>,
    pub hidden: bool,
    pub urls: Vec<StepUrl>,
    pub started_at: Option<DateTime<Utc>>,
    pub locks_acquired_at: Option<DateTime<Utc>>,
    pub complete_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepUrl {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogChunk {
    pub channel: Channel,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub step_id: i64,
    pub name: String,
    pub log_type: LogType,
    pub chunks: Vec<LogChunk>,
    pub complete: bool,
}

impl LogRecord {
    /// All content of one channel, concatenated.
    pub fn text(&self, channel: Channel) -> String {
        self.chunks
            .iter()
            .filter(|c| c.channel == channel)
            .map(|c| c.text.as_str())
            .collect()
    }

    /// All content in append order, regardless of channel.
    pub fn full_text(&self) -> String {
        self.chunks.iter().map(|c| c.text.as_str()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResultSetRecord {
    pub id: i64,
    pub step_id: i64,
    pub description: String,
    pub category: String,
    pub value_unit: String,
    pub complete: bool,
    pub results: Vec<TestResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDataRecord {
    pub build_id: i64,
    pub name: String,
    pub value: Vec<u8>,
    pub source: String,
}

#[derive(Default)]
struct Tables {
    steps: Vec<StepRecord>,
    logs: Vec<LogRecord>,
    test_result_sets: Vec<TestResultSetRecord>,
    build_data: Vec<BuildDataRecord>,
}

/// In-process [`StepStore`].
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn step(&self, step_id: i64) -> Option<StepRecord> {
        self.tables().steps.iter().find(|s| s.id == step_id).cloned()
    }

    pub fn steps(&self, build_id: i64) -> Vec<StepRecord> {
        self.tables()
            .steps
            .iter()
            .filter(|s| s.build_id == build_id)
            .cloned()
            .collect()
    }

    pub fn log(&self, step_id: i64, name: &str) -> Option<LogRecord> {
        self.tables()
            .logs
            .iter()
            .find(|l| l.step_id == step_id && l.name == name)
            .cloned()
    }

    pub fn logs(&self, step_id: i64) -> Vec<LogRecord> {
        self.tables()
            .logs
            .iter()
            .filter(|l| l.step_id == step_id)
            .cloned()
            .collect()
    }

    pub fn test_result_sets(&self, step_id: i64) -> Vec<TestResultSetRecord> {
        self.tables()
            .test_result_sets
            .iter()
            .filter(|s| s.step_id == step_id)
            .cloned()
            .collect()
    }

    pub fn build_data(&self, build_id: i64, name: &str) -> Option<BuildDataRecord> {
        self.tables()
            .build_data
            .iter()
            .find(|d| d.build_id == build_id && d.name == name)
            .cloned()
    }
}

fn not_found(kind: &str, id: i64) -> StepError {
    StepError::Store(format!("no {kind} with id {id}"))
}

macro_rules! find_mut {
    ($rows:expr, $id:expr, $kind:literal) => {
        $rows
            .iter_mut()
            .find(|row| row.id == $id)
            .ok_or_else(|| not_found($kind, $id))?
    };
}

#[async_trait]
impl StepStore for MemoryStore {
    async fn add_step(&self, build_id: i64, name: &str) -> Result<i64> {
        let mut tables = self.tables();
        let id = tables.steps.len() as i64 + 1;
        let number = tables.steps.iter().filter(|s| s.build_id == build_id).count() as i32;
        tables.steps.push(StepRecord {
            id,
            build_id,
            number,
            name: name.to_string(),
            state_string: "pending".to_string(),
            results: None,
            hidden: false,
            urls: Vec::new(),
            started_at: None,
            locks_acquired_at: None,
            complete_at: None,
        });
        Ok(id)
    }

    async fn start_step(&self, step_id: i64) -> Result<()> {
        let mut tables = self.tables();
        find_mut!(tables.steps, step_id, "step").started_at = Some(Utc::now());
        Ok(())
    }

    async fn set_locks_acquired(&self, step_id: i64) -> Result<()> {
        let mut tables = self.tables();
        find_mut!(tables.steps, step_id, "step").locks_acquired_at = Some(Utc::now());
        Ok(())
    }

    async fn set_step_state_string(&self, step_id: i64, state: &str) -> Result<()> {
        let mut tables = self.tables();
        find_mut!(tables.steps, step_id, "step").state_string = state.to_string();
        Ok(())
    }

    async fn add_url(&self, step_id: i64, name: &str, url: &str) -> Result<()> {
        let mut tables = self.tables();
        let step = find_mut!(tables.steps, step_id, "step");
        let url = StepUrl {
            name: name.to_string(),
            url: url.to_string(),
        };
        if !step.urls.contains(&url) {
            step.urls.push(url);
        }
        Ok(())
    }

    async fn finish_step(&self, step_id: i64, result: ResultCode, hidden: bool) -> Result<()> {
        let mut tables = self.tables();
        let step = find_mut!(tables.steps, step_id, "step");
        step.results = Some(result);
        step.hidden = hidden;
        step.complete_at = Some(Utc::now());
        Ok(())
    }

    async fn add_log(&self, step_id: i64, name: &str, log_type: LogType) -> Result<i64> {
        let mut tables = self.tables();
        if tables.logs.iter().any(|l| l.step_id == step_id && l.name == name) {
            return Err(StepError::DuplicateLog(name.to_string()));
        }
        let id = tables.logs.len() as i64 + 1;
        tables.logs.push(LogRecord {
            id,
            step_id,
            name: name.to_string(),
            log_type,
            chunks: Vec::new(),
            complete: false,
        });
        Ok(id)
    }

    async fn append_log(&self, log_id: i64, channel: Channel, text: &str) -> Result<()> {
        let mut tables = self.tables();
        let log = find_mut!(tables.logs, log_id, "log");
        if log.complete {
            return Err(StepError::LogFinished(log.name.clone()));
        }
        log.chunks.push(LogChunk {
            channel,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn finish_log(&self, log_id: i64) -> Result<()> {
        let mut tables = self.tables();
        find_mut!(tables.logs, log_id, "log").complete = true;
        Ok(())
    }

    async fn add_test_result_set(
        &self,
        step_id: i64,
        description: &str,
        category: &str,
        value_unit: &str,
    ) -> Result<i64> {
        let mut tables = self.tables();
        let id = tables.test_result_sets.len() as i64 + 1;
        tables.test_result_sets.push(TestResultSetRecord {
            id,
            step_id,
            description: description.to_string(),
            category: category.to_string(),
            value_unit: value_unit.to_string(),
            complete: false,
            results: Vec::new(),
        });
        Ok(id)
    }

    async fn add_test_results(&self, set_id: i64, results: &[TestResult]) -> Result<()> {
        let mut tables = self.tables();
        let set = find_mut!(tables.test_result_sets, set_id, "test result set");
        if set.complete {
            return Err(StepError::InvalidState {
                expected: "open test result set",
                found: "complete".to_string(),
            });
        }
        set.results.extend_from_slice(results);
        Ok(())
    }

    async fn complete_test_result_set(&self, set_id: i64) -> Result<()> {
        let mut tables = self.tables();
        find_mut!(tables.test_result_sets, set_id, "test result set").complete = true;
        Ok(())
    }

    async fn set_build_data(&self, build_id: i64, name: &str, value: Vec<u8>, source: &str) -> Result<()> {
        let mut tables = self.tables();
        tables
            .build_data
            .retain(|d| !(d.build_id == build_id && d.name == name));
        tables.build_data.push(BuildDataRecord {
            build_id,
            name: name.to_string(),
            value,
            source: source.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn steps_are_numbered_per_build() {
        let store = MemoryStore::new();
        let a = store.add_step(1, "checkout").await.unwrap();
        let b = store.add_step(1, "compile").await.unwrap();
        let c = store.add_step(2, "checkout").await.unwrap();

        assert_ne!(a, b);
        assert_eq!(store.step(b).unwrap().number, 1);
        assert_eq!(store.step(c).unwrap().number, 0);
        assert_eq!(store.steps(1).len(), 2);
    }

    #[tokio::test]
    async fn finished_logs_reject_appends() {
        let store = MemoryStore::new();
        let step = store.add_step(1, "compile").await.unwrap();
        let log = store.add_log(step, "stdio", LogType::Stdio).await.unwrap();
        store.append_log(log, Channel::Header, "make\n").await.unwrap();
        store.append_log(log, Channel::Stdout, "ok\n").await.unwrap();
        store.finish_log(log).await.unwrap();

        let err = store.append_log(log, Channel::Stdout, "late").await.unwrap_err();
        assert!(matches!(err, StepError::LogFinished(_)));

        let record = store.log(step, "stdio").unwrap();
        assert_eq!(record.text(Channel::Stdout), "ok\n");
        assert_eq!(record.full_text(), "make\nok\n");
    }

    #[tokio::test]
    async fn build_data_is_replaced_by_name() {
        let store = MemoryStore::new();
        store.set_build_data(1, "artifact", b"a".to_vec(), "Upload").await.unwrap();
        store.set_build_data(1, "artifact", b"b".to_vec(), "Upload").await.unwrap();
        assert_eq!(store.build_data(1, "artifact").unwrap().value, b"b");
        assert!(store.build_data(2, "artifact").is_none());
    }
}
