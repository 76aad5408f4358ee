//! Program: user-authored content handed to an executor.
//!
//! The runner never interprets the content; the discriminant only tells the
//! executor which language it is looking at.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which language the program content is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramKind {
    /// Declarative, line-oriented list of motions and IO operations.
    Waypoints,
    /// General-purpose script evaluated by an embedding collaborator.
    Script,
}

impl fmt::Display for ProgramKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Waypoints => "waypoints",
            Self::Script => "script",
        })
    }
}

/// A program to execute against a cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub kind: ProgramKind,
    pub content: String,
}

impl Program {
    #[must_use]
    pub fn new(kind: ProgramKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn waypoints(content: impl Into<String>) -> Self {
        Self::new(ProgramKind::Waypoints, content)
    }

    #[must_use]
    pub fn script(content: impl Into<String>) -> Self {
        Self::new(ProgramKind::Script, content)
    }
}
