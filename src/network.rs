//! Host networking for instances
//!
//! Provides:
//! - Private subnet allocation and persistence
//! - NetworkManager bridge provisioning over D-Bus
//! - The D-Bus gateway the provisioner talks through

pub mod bridge;
pub mod dbus;
pub mod state;
pub mod subnet;

pub use bridge::{BridgeProvisioner, BridgeSpec};
pub use dbus::{BusConnection, BusInterface, SystemBus};
pub use subnet::{Subnet, SubnetAllocator};
