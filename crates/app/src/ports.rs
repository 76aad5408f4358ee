//! Port definitions: traits that device adapters implement.
//!
//! Ports are the boundary between the runtime core and the hardware. They
//! live here (in `app`) so both the cell and the adapter crates can depend
//! on them without creating circular dependencies.

pub mod device;

pub use device::{Device, Rate, Readable, StateStreamer, Stoppable, Writable};
