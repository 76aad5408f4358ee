//! Program run: the record of one program execution.
//!
//! A run starts in [`ProgramRunState::NotStarted`], moves to `Running` once
//! and ends in exactly one terminal state. Terminal fields (`end_time`,
//! `state`, `error`) are written once, after output has been captured.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CellError, ErrorRecord};
use crate::id::RunId;
use crate::motion::ExecutionResult;
use crate::program::Program;
use crate::time::{Timestamp, elapsed, now};

/// Lifecycle state of a program run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramRunState {
    NotStarted,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl ProgramRunState {
    /// `true` for `Completed`, `Failed` and `Stopped`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for ProgramRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotStarted => "not started",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        })
    }
}

/// Snapshot of a program execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramRun {
    pub id: RunId,
    pub program: Program,
    pub state: ProgramRunState,
    pub logs: Option<String>,
    pub stdout: Option<String>,
    /// Tag of the error type, see [`CellError::type_name`].
    pub error_type: Option<String>,
    pub error: Option<String>,
    pub traceback: Option<String>,
    pub error_record: Option<ErrorRecord>,
    pub start_time: Option<Timestamp>,
    pub end_time: Option<Timestamp>,
    pub store: serde_json::Map<String, serde_json::Value>,
    pub execution_results: Vec<ExecutionResult>,
}

impl ProgramRun {
    #[must_use]
    pub fn new(id: RunId, program: Program) -> Self {
        Self {
            id,
            program,
            state: ProgramRunState::NotStarted,
            logs: None,
            stdout: None,
            error_type: None,
            error: None,
            traceback: None,
            error_record: None,
            start_time: None,
            end_time: None,
            store: serde_json::Map::new(),
            execution_results: Vec::new(),
        }
    }

    /// Record the failure details of `err`.
    pub fn record_error(&mut self, err: &CellError) {
        self.error_type = Some(err.type_name().to_string());
        self.error = Some(err.to_string());
        self.traceback = Some(err.traceback());
        self.error_record = Some(err.to_record());
    }

    /// Time spent running: until `end_time` when finished, until now otherwise.
    #[must_use]
    pub fn execution_time(&self) -> Option<Duration> {
        let start = self.start_time?;
        Some(elapsed(start, self.end_time.unwrap_or_else(now)))
    }
}
