//! # cellrun-app
//!
//! Application layer: device **port definitions** (traits), the cell that
//! aggregates devices, and the program runner.
//!
//! ## Responsibilities
//! - Define **port traits** that device adapters implement:
//!   - `Device`: identity and open/close lifecycle
//!   - `Readable`, `Writable`, `StateStreamer`, `Stoppable`: optional capabilities
//! - Keep the **device registry** mapping configuration kinds to constructors
//! - Provide the **cell** (`Cell`): concurrent open/close/stop and state-stream fan-in
//! - Provide the **program runner** (`ProgramRunner`): a dedicated execution
//!   thread, cooperative stop and a structured run record
//!
//! ## Dependency rule
//! Depends on `cellrun-domain` only (plus `tokio`/`futures` for the async
//! plumbing). Never imports adapter crates. Adapters depend on *this* crate,
//! not the reverse.

pub mod cell;
pub mod ports;
pub mod registry;
pub mod runner;
pub mod timer;

mod sync;
