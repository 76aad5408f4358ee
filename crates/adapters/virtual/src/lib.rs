//! # cellrun-adapter-virtual
//!
//! Virtual integration that provides simulated devices for testing and
//! demonstration purposes.
//!
//! ## Provided devices
//!
//! | Device | Kind | Capabilities |
//! |--------|------|--------------|
//! | Virtual Robot | `virtual_robot` | read `pose.x`/`pose.y`/`pose.z`/`moving`/`io.*`, write `io.*`, state stream, stop |
//! | Virtual IO | `virtual_io` | read/write named values (delayed acknowledgement), state stream |
//!
//! ## Dependency rule
//!
//! Depends on `cellrun-app` (port traits) and `cellrun-domain` only.

mod devices;

use cellrun_app::registry::DeviceRegistry;
use cellrun_domain::error::CellError;

pub use devices::{VirtualIo, VirtualIoSettings, VirtualRobot, VirtualRobotSettings};

/// Register every virtual device kind.
///
/// # Errors
///
/// Returns an error if one of the kinds is already registered.
pub fn register(registry: &mut DeviceRegistry) -> Result<(), CellError> {
    registry.register::<VirtualRobot>()?;
    registry.register::<VirtualIo>()?;
    Ok(())
}
