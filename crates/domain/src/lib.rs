//! # cellrun-domain
//!
//! Pure domain model for the cellrun program execution system.
//!
//! ## Responsibilities
//! - Foundational types: typed identifiers, error taxonomy, timestamps
//! - Define **Values** (typed payloads read from and written to devices)
//! - Define **Device configurations** (serializable recipes for constructing devices)
//! - Define **Device states** (samples produced by state-streaming devices)
//! - Define **Programs** (opaque user content plus a discriminant)
//! - Define **Program runs** (the record of one execution: state, output, results)
//!
//! ## Dependency rule
//! This crate has **no internal dependencies**.
//! It must never import anything from `app`, adapters, or IO crates.
//! Device capabilities and the runner live in the `app` crate.

pub mod error;
pub mod id;
pub mod time;

pub mod configuration;
pub mod motion;
pub mod program;
pub mod run;
pub mod state;
pub mod value;
