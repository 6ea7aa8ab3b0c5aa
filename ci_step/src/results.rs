//! Result codes and the failure policy that maps a step result onto the build.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of a step or build, ordered by severity.
///
/// The declaration order is the severity order, so `Ord` and [`ResultCode::worst`]
/// agree. The wire code ([`ResultCode::code`]) is a separate, stable table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultCode {
    Success,
    Skipped,
    Warnings,
    Failure,
    Exception,
    Retry,
    Cancelled,
}

impl ResultCode {
    /// Stable integer code persisted with steps and builds.
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Warnings => 1,
            Self::Failure => 2,
            Self::Skipped => 3,
            Self::Exception => 4,
            Self::Retry => 5,
            Self::Cancelled => 6,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::Warnings),
            2 => Some(Self::Failure),
            3 => Some(Self::Skipped),
            4 => Some(Self::Exception),
            5 => Some(Self::Retry),
            6 => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// The more severe of two results.
    pub fn worst(self, other: Self) -> Self {
        self.max(other)
    }

    pub fn is_failure_or_worse(self) -> bool {
        self >= Self::Failure
    }

    /// Results that end the build regardless of step flags.
    pub fn terminates_build(self) -> bool {
        matches!(self, Self::Exception | Self::Retry | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Warnings => "warnings",
            Self::Failure => "failure",
            Self::Exception => "exception",
            Self::Retry => "retry",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a finished step contributes to the overall build result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Contribution {
    None,
    Warn,
    Flunk,
}

impl Contribution {
    /// The build result this contribution pushes the build towards.
    pub fn as_result(self) -> Option<ResultCode> {
        match self {
            Self::None => None,
            Self::Warn => Some(ResultCode::Warnings),
            Self::Flunk => Some(ResultCode::Failure),
        }
    }
}

/// The step flags consulted when a step finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePolicy {
    pub halt_on_failure: bool,
    pub flunk_on_warnings: bool,
    pub flunk_on_failure: bool,
    pub warn_on_warnings: bool,
    pub warn_on_failure: bool,
}

impl FailurePolicy {
    pub fn contribution(&self, result: ResultCode) -> Contribution {
        if result.is_failure_or_worse() {
            if self.flunk_on_failure {
                Contribution::Flunk
            } else if self.warn_on_failure {
                Contribution::Warn
            } else {
                Contribution::None
            }
        } else if result == ResultCode::Warnings {
            if self.flunk_on_warnings {
                Contribution::Flunk
            } else if self.warn_on_warnings {
                Contribution::Warn
            } else {
                Contribution::None
            }
        } else {
            Contribution::None
        }
    }

    /// Whether steps after this one should be skipped (unless `always_run`).
    pub fn halts_build(&self, result: ResultCode) -> bool {
        (self.halt_on_failure && result.is_failure_or_worse()) || result.terminates_build()
    }
}
