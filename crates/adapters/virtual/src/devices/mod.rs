//! Virtual device implementations: robot and IO block.
//!
//! Both keep their state behind a mutex and never touch real hardware, so
//! they can be opened, closed and reopened freely.

mod io;
mod robot;

pub use io::{VirtualIo, VirtualIoSettings};
pub use robot::{VirtualRobot, VirtualRobotSettings};
