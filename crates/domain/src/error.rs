//! Error taxonomy used across the workspace.
//!
//! Every failure is a typed value. Layers convert into [`CellError`] via
//! `#[from]`, so callers can branch on the variant to decide whether to
//! retry, surface the problem to the user, or give up.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::run::ProgramRunState;

/// A 1-based position inside program source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    #[must_use]
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// Where in the program source an error originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Location {
    Point { line: u32, column: u32 },
    Range { start: Position, end: Position },
}

impl Location {
    /// A single point at `line`/`column`.
    #[must_use]
    pub fn point(line: u32, column: u32) -> Self {
        Self::Point { line, column }
    }

    /// The first position covered by this location.
    #[must_use]
    pub fn start(&self) -> Position {
        match *self {
            Self::Point { line, column } => Position { line, column },
            Self::Range { start, .. } => start,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Point { line, column } => write!(f, "line {line}, column {column}"),
            Self::Range { start, end } => write!(
                f,
                "line {}, column {} to line {}, column {}",
                start.line, start.column, end.line, end.column
            ),
        }
    }
}

/// Flavour of a [`ProgramError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramErrorKind {
    /// The program itself is malformed.
    Program,
    /// A runtime precondition was not met while executing (e.g. not plannable).
    Runtime,
}

/// An error attributable to the user program, optionally located in its source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}{}", located(.location))]
pub struct ProgramError {
    kind: ProgramErrorKind,
    message: String,
    location: Option<Location>,
}

impl ProgramError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: ProgramErrorKind::Program,
            message: message.into(),
            location: None,
        }
    }

    /// An unmet runtime precondition.
    #[must_use]
    pub fn runtime(message: impl Into<String>) -> Self {
        Self {
            kind: ProgramErrorKind::Runtime,
            message: message.into(),
            location: None,
        }
    }

    /// A motion could not be planned.
    #[must_use]
    pub fn not_plannable(reason: impl fmt::Display) -> Self {
        Self::runtime(format!("not plannable: {reason}"))
    }

    /// Attach a source location.
    #[must_use]
    pub fn at(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    #[must_use]
    pub fn kind(&self) -> ProgramErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn location(&self) -> Option<Location> {
        self.location
    }
}

#[allow(clippy::ref_option)]
fn located(location: &Option<Location>) -> String {
    location
        .map(|location| format!(" ({location})"))
        .unwrap_or_default()
}

/// The requested identifier is not part of the cell.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("device `{identifier}` is not part of the cell")]
pub struct DeviceNotFoundError {
    pub identifier: String,
}

/// A device-level operation could not be satisfied as requested.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("device `{identifier}` cannot execute motion: {reason}")]
pub struct MotionError {
    pub identifier: String,
    pub reason: String,
}

/// A capability a device may or may not provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Read,
    Write,
    StateStream,
    Stop,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::StateStream => "state stream",
            Self::Stop => "stop",
        })
    }
}

/// The device exists but does not provide the requested capability.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("device `{identifier}` does not support {capability}")]
pub struct MissingCapabilityError {
    pub identifier: String,
    pub capability: Capability,
}

/// Errors raised while turning configurations into devices.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigurationError {
    /// No device type is registered under this kind.
    #[error("unknown device kind `{kind}`")]
    UnknownKind { kind: String },

    /// The settings do not match the device type's declared fields.
    #[error("malformed settings for device kind `{kind}`")]
    Malformed {
        kind: String,
        #[source]
        source: Arc<serde_json::Error>,
    },

    /// The settings decode but describe an unusable device.
    #[error("invalid settings for device kind `{kind}`: {reason}")]
    Invalid { kind: String, reason: String },

    /// Settings must serialize to a map of named fields.
    #[error("settings for device kind `{kind}` are not a map of fields")]
    NotAMap { kind: String },

    /// A device type was registered twice under the same kind.
    #[error("device kind `{kind}` is already registered")]
    DuplicateKind { kind: String },

    /// Two devices share the same identifier.
    #[error("device identifier `{identifier}` is already in use")]
    DuplicateDevice { identifier: String },
}

/// Serializable summary of an error, suitable for run records and APIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

/// Top-level error type for cells, devices and program runs.
///
/// Cheap to clone: foreign sources are shared behind an [`Arc`], so a
/// captured run error can be handed to every caller that joins the run.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CellError {
    #[error(transparent)]
    Program(#[from] ProgramError),

    #[error(transparent)]
    DeviceNotFound(#[from] DeviceNotFoundError),

    #[error(transparent)]
    Motion(#[from] MotionError),

    #[error(transparent)]
    MissingCapability(#[from] MissingCapabilityError),

    #[error("device `{identifier}` is not a {expected}")]
    DeviceType {
        identifier: String,
        expected: &'static str,
    },

    #[error("invalid device configuration")]
    Configuration(#[from] ConfigurationError),

    #[error("invalid state: cannot {operation} a program run that is {state}")]
    InvalidState {
        operation: &'static str,
        state: ProgramRunState,
    },

    #[error("program is not running")]
    NotRunning,

    /// The cell is already open, typically by another program run.
    #[error("cell is already open")]
    AlreadyOpen,

    #[error("program was stopped")]
    Stopped,

    #[error("program panicked: {0}")]
    Panicked(String),

    #[error("failed to start the execution thread")]
    ExecutionThread(#[source] Arc<std::io::Error>),

    /// Transport or driver failure reported by a device.
    #[error("device `{identifier}` failed")]
    Device {
        identifier: String,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },
}

impl CellError {
    /// Wrap a transport-level failure raised by `identifier`.
    pub fn device(
        identifier: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        let source: Box<dyn std::error::Error + Send + Sync> = source.into();
        Self::Device {
            identifier: identifier.into(),
            source: Arc::from(source),
        }
    }

    /// The execution thread or its runtime could not be created.
    #[must_use]
    pub fn execution_thread(err: std::io::Error) -> Self {
        Self::ExecutionThread(Arc::new(err))
    }

    /// Whether this error signals a cooperative stop rather than a failure.
    #[must_use]
    pub fn is_stop(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Stable tag naming the error type, recorded alongside the message.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Program(err) => match err.kind() {
                ProgramErrorKind::Program => "ProgramError",
                ProgramErrorKind::Runtime => "ProgramRuntimeError",
            },
            Self::DeviceNotFound(_) => "DeviceNotFoundError",
            Self::Motion(_) => "MotionError",
            Self::MissingCapability(_) => "MissingCapabilityError",
            Self::DeviceType { .. } => "DeviceTypeError",
            Self::Configuration(_) => "ConfigurationError",
            Self::InvalidState { .. } => "InvalidStateError",
            Self::NotRunning => "NotRunningError",
            Self::AlreadyOpen => "AlreadyOpenError",
            Self::Stopped => "Stopped",
            Self::Panicked(_) => "Panic",
            Self::ExecutionThread(_) => "ExecutionThreadError",
            Self::Device { .. } => "DeviceError",
        }
    }

    /// Every message in the source chain, outermost first.
    #[must_use]
    pub fn chain(&self) -> Vec<String> {
        let mut messages = vec![self.to_string()];
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            messages.push(err.to_string());
            source = err.source();
        }
        messages
    }

    /// Numbered source chain, one cause per line.
    #[must_use]
    pub fn traceback(&self) -> String {
        self.chain()
            .iter()
            .enumerate()
            .map(|(depth, message)| format!("{depth}: {message}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Convert into the serializable `{text, line?, column?}` summary.
    #[must_use]
    pub fn to_record(&self) -> ErrorRecord {
        let position = match self {
            Self::Program(err) => err.location().map(|loc| loc.start()),
            _ => None,
        };
        ErrorRecord {
            text: self.chain().join(": "),
            line: position.map(|p| p.line),
            column: position.map(|p| p.column),
        }
    }
}
