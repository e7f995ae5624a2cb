//! hostprov - host provisioning for a virtual machine manager
//!
//! Prepares a Linux host before instances boot: picks a private subnet,
//! bridges a physical interface through NetworkManager, readies disk images
//! with qemu-img, and checks that KVM is usable.

pub mod cli;
pub mod error;
pub mod hardware;
pub mod image;
pub mod manifest;
pub mod memory_size;
pub mod network;
pub mod process;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use memory_size::MemorySize;
