//! Error taxonomy for step execution.

use crate::results::ResultCode;

/// Everything that can go wrong while configuring or running a step.
///
/// Only the step's top-level wrapper turns these into a terminal result.
/// [`StepError::Abandoned`] carries the result the step should end with;
/// every other variant ends the step with `EXCEPTION`.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("step abandoned ({result}): {reason}")]
    Abandoned { result: ResultCode, reason: String },

    #[error("worker transport failure: {0}")]
    Transport(String),

    #[error("worker setup error: {0}")]
    WorkerSetup(String),

    #[error("no log named '{0}'")]
    LogNotFound(String),

    #[error("log '{0}' already exists")]
    DuplicateLog(String),

    #[error("log '{0}' is already finished")]
    LogFinished(String),

    #[error("log '{0}' does not accept {1} content")]
    LogType(String, &'static str),

    #[error("progress metric '{0}' was not declared by the step")]
    UndeclaredMetric(String),

    #[error("invalid step state: expected {expected}, found {found}")]
    InvalidState {
        expected: &'static str,
        found: String,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StepError {
    /// Stop the step now and finish it with `EXCEPTION`.
    pub fn abandon(reason: impl Into<String>) -> Self {
        Self::Abandoned {
            result: ResultCode::Exception,
            reason: reason.into(),
        }
    }

    /// Stop the step now and finish it with `FAILURE`.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Abandoned {
            result: ResultCode::Failure,
            reason: reason.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// The terminal result this error maps to at the step boundary.
    pub fn result(&self) -> ResultCode {
        match self {
            Self::Abandoned { result, .. } => *result,
            _ => ResultCode::Exception,
        }
    }
}

pub type Result<T, E = StepError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abandonment_carries_its_result() {
        assert_eq!(StepError::failed("nope").result(), ResultCode::Failure);
        assert_eq!(StepError::abandon("nope").result(), ResultCode::Exception);
        assert_eq!(
            StepError::Transport("connection lost".into()).result(),
            ResultCode::Exception
        );
        let other: StepError = anyhow::anyhow!("boom").into();
        assert_eq!(other.result(), ResultCode::Exception);
        assert_eq!(other.to_string(), "boom");
    }
}
