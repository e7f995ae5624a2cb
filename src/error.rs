//! Error types for hostprov
//!
//! Each component reports through its own closed enum so callers can match
//! on the kind of failure. [`Error`] unifies them for the CLI.

use crate::network::dbus::BusError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A memory size string that does not match `digits[K|M|G]?B?`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid memory size: '{0}'")]
pub struct InvalidMemorySize(pub String);

/// Subnet allocation failures
#[derive(Error, Debug)]
pub enum SubnetError {
    #[error("Could not determine a subnet for networking.")]
    Exhausted,

    #[error("Failed to persist subnet in '{path}': {source}")]
    Persist { path: PathBuf, source: io::Error },
}

fn bridge_outcome(rollback: &bool) -> &'static str {
    if *rollback {
        "Could not roll back bridge"
    } else {
        "Could not create bridge"
    }
}

/// Bridge provisioning failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CreateBridgeError {
    #[error("Could not create bridge. {detail}: {}", .cause.cause())]
    BusUnreachable { detail: String, cause: BusError },

    #[error("Could not create bridge. {detail} ({service} {path} {interface}): {}", .cause.cause())]
    InterfaceUnreachable {
        detail: String,
        service: String,
        path: String,
        interface: String,
        cause: BusError,
    },

    #[error(
        "{}. Failed DBus call. (Service: {service}; Object: {path}; Interface: {interface}; Method: {method}): {}",
        bridge_outcome(.rollback),
        .cause.cause()
    )]
    BusCallFailed {
        service: String,
        path: String,
        interface: String,
        method: String,
        cause: BusError,
        rollback: bool,
    },
}

impl CreateBridgeError {
    /// Whether the failure happened while compensating an earlier one
    pub fn during_rollback(&self) -> bool {
        matches!(self, CreateBridgeError::BusCallFailed { rollback: true, .. })
    }
}

/// Disk image preparation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("Cannot resize instance image: {tool} failed ({failure}) with output:\n{stderr}")]
    ResizeFailed {
        tool: String,
        failure: String,
        stderr: String,
    },

    #[error("Cannot read image format: {tool} failed ({failure}) with output:\n{stderr}")]
    InfoFailed {
        tool: String,
        failure: String,
        stderr: String,
    },

    #[error("Failed to convert image format: {tool} failed ({failure}) with output:\n{stderr}")]
    ConvertFailed {
        tool: String,
        failure: String,
        stderr: String,
    },
}

/// Virtualization acceleration failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HardwareError {
    #[error("The check_kvm_support script failed to start ({path}): {message}. Ensure it is installed next to hostprov.")]
    HelperFailedToStart { path: PathBuf, message: String },

    #[error("{0}")]
    Unsupported(String),

    #[error(
        "Another virtual machine manager is currently running. Please shut it down before starting an instance."
    )]
    AcceleratorBusy,
}

/// Main error type for hostprov operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    // Component errors
    #[error(transparent)]
    MemorySize(#[from] InvalidMemorySize),

    #[error(transparent)]
    Subnet(#[from] SubnetError),

    #[error(transparent)]
    Bridge(#[from] CreateBridgeError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

/// Result type alias for hostprov operations
pub type Result<T> = std::result::Result<T, Error>;
