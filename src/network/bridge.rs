//! NetworkManager bridge provisioning
//!
//! Creates a bridge connection and a slave connection binding a physical
//! interface to it, then activates the slave. Roughly equivalent to:
//!
//! ```text
//! nmcli connection add type bridge ifname <br> connection.autoconnect-slaves 1
//! nmcli connection add type bridge-slave ifname <if> master <br> connection.autoconnect-priority 10
//! nmcli connection up <child>
//! ```
//!
//! Any failure after the bridge connection exists deletes whatever was
//! created, child first.

use crate::error::CreateBridgeError;
use crate::network::dbus::{BusArg, BusConnection, BusError, BusInterface, ConnectionSettings, ObjectPath};
use crate::network::state::{Progress, Stage, Step};

const NM_BUS_NAME: &str = "org.freedesktop.NetworkManager";
const NM_ROOT_OBJ: &str = "/org/freedesktop/NetworkManager";
const NM_ROOT_IFC: &str = "org.freedesktop.NetworkManager";
const NM_SETTINGS_OBJ: &str = "/org/freedesktop/NetworkManager/Settings";
const NM_SETTINGS_IFC: &str = "org.freedesktop.NetworkManager.Settings";
const NM_CONNECTION_IFC: &str = "org.freedesktop.NetworkManager.Settings.Connection";

/// Kernel limit on interface names (IFNAMSIZ - 1)
pub const MAX_BRIDGE_NAME_LEN: usize = 15;
const BRIDGE_PREFIX: &str = "br-";
const CHILD_SUFFIX: &str = "-child";

/// Names for the connections backing one bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSpec {
    /// Bridge connection id and interface name (e.g., "br-eth0")
    pub parent: String,
    /// Slave connection id (e.g., "br-eth0-child")
    pub child: String,
    /// Physical interface enslaved to the bridge
    pub interface: String,
}

impl BridgeSpec {
    pub fn for_interface(interface: &str) -> Self {
        let parent: String = format!("{}{}", BRIDGE_PREFIX, interface)
            .chars()
            .take(MAX_BRIDGE_NAME_LEN)
            .collect();
        let child = format!("{}{}", parent, CHILD_SUFFIX);

        Self {
            parent,
            child,
            interface: interface.to_string(),
        }
    }

    pub fn parent_settings(&self) -> ConnectionSettings {
        ConnectionSettings::new()
            .with("connection", "type", "bridge")
            .with("connection", "id", self.parent.as_str())
            .with("connection", "autoconnect-slaves", 1)
            .with("bridge", "interface-name", self.parent.as_str())
    }

    pub fn child_settings(&self) -> ConnectionSettings {
        ConnectionSettings::new()
            .with("connection", "id", self.child.as_str())
            .with("connection", "type", "802-3-ethernet")
            .with("connection", "slave-type", "bridge")
            .with("connection", "master", self.parent.as_str())
            .with("connection", "interface-name", self.interface.as_str())
            .with("connection", "autoconnect-priority", 10)
    }
}

/// Connections created so far by one provisioning call
///
/// Dropping an armed handle deletes them (child first). Failures while
/// deleting are logged, never raised.
pub struct ProvisioningHandle<'a> {
    bus: &'a dyn BusConnection,
    progress: Progress,
    parent: Option<ObjectPath>,
    child: Option<ObjectPath>,
    armed: bool,
}

impl<'a> ProvisioningHandle<'a> {
    fn new(bus: &'a dyn BusConnection, progress: Progress) -> Self {
        Self {
            bus,
            progress,
            parent: None,
            child: None,
            armed: true,
        }
    }

    pub fn stage(&self) -> Stage {
        self.progress.stage()
    }

    fn step(&mut self, step: Step) {
        advance(&mut self.progress, step);
    }

    fn parent_created(&mut self, path: ObjectPath) {
        self.parent = Some(path);
        self.step(Step::Bridge);
    }

    fn child_created(&mut self, path: ObjectPath) {
        self.child = Some(path);
        self.step(Step::Enslave);
    }

    /// Keep everything: the bridge is up
    fn disarm(mut self) {
        self.step(Step::Activate);
        self.armed = false;
    }

    fn roll_back(&mut self) {
        tracing::info!(stage = ?self.stage(), "Rolling back bridge");

        for path in [&self.child, &self.parent]
            .into_iter()
            .flatten()
            .filter(|p| !p.is_null())
        {
            let connection = self.bus.interface(NM_BUS_NAME, path.as_str(), NM_CONNECTION_IFC);
            if let Err(e) = checked_call(connection.as_ref(), "Delete", &[], true) {
                tracing::error!(path = %path, error = %e, "Failed to delete connection");
            }
        }

        if self.stage().has_side_effects() {
            self.step(Step::Rollback);
        }
    }
}

impl Drop for ProvisioningHandle<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.roll_back();
        }
    }
}

fn advance(progress: &mut Progress, step: Step) {
    if progress.advance(step).is_err() {
        tracing::warn!(?step, stage = ?progress.stage(), "Unexpected provisioning transition");
    }
}

fn checked_interface<'a>(
    bus: &'a dyn BusConnection,
    path: &str,
    interface: &str,
) -> Result<Box<dyn BusInterface + 'a>, CreateBridgeError> {
    let iface = bus.interface(NM_BUS_NAME, path, interface);
    if !iface.is_valid() {
        return Err(CreateBridgeError::InterfaceUnreachable {
            detail: "Could not reach remote D-Bus object".to_string(),
            service: NM_BUS_NAME.to_string(),
            path: path.to_string(),
            interface: interface.to_string(),
            cause: iface.last_error(),
        });
    }
    Ok(iface)
}

fn call_failed(iface: &dyn BusInterface, method: &str, cause: BusError, rollback: bool) -> CreateBridgeError {
    CreateBridgeError::BusCallFailed {
        service: iface.service().to_string(),
        path: iface.path().to_string(),
        interface: iface.interface().to_string(),
        method: method.to_string(),
        cause,
        rollback,
    }
}

fn checked_call(
    iface: &dyn BusInterface,
    method: &str,
    args: &[BusArg],
    rollback: bool,
) -> Result<Option<ObjectPath>, CreateBridgeError> {
    iface
        .call(method, args)
        .map_err(|cause| call_failed(iface, method, cause, rollback))
}

/// Like [`checked_call`], for methods that must return an object path
fn checked_path_call(
    iface: &dyn BusInterface,
    method: &str,
    args: &[BusArg],
) -> Result<ObjectPath, CreateBridgeError> {
    checked_call(iface, method, args, false)?.ok_or_else(|| {
        call_failed(
            iface,
            method,
            BusError::new(
                "org.freedesktop.DBus.Error.InvalidSignature",
                "Reply did not carry an object path",
            ),
            false,
        )
    })
}

/// Wires host bridges through NetworkManager
pub struct BridgeProvisioner<'a> {
    bus: &'a dyn BusConnection,
}

impl<'a> BridgeProvisioner<'a> {
    pub fn new(bus: &'a dyn BusConnection) -> Self {
        Self { bus }
    }

    /// Create and activate a bridge for `interface`
    ///
    /// Assumes no bridge exists for the interface yet and that it names an
    /// ethernet device.
    pub fn create_bridge(&self, interface: &str) -> Result<(), CreateBridgeError> {
        let mut progress = Progress::new();

        if !self.bus.is_connected() {
            return Err(CreateBridgeError::BusUnreachable {
                detail: "Failed to connect to D-Bus system bus".to_string(),
                cause: self.bus.last_error(),
            });
        }
        advance(&mut progress, Step::Connect);

        let nm_root = checked_interface(self.bus, NM_ROOT_OBJ, NM_ROOT_IFC)?;
        let nm_settings = checked_interface(self.bus, NM_SETTINGS_OBJ, NM_SETTINGS_IFC)?;
        advance(&mut progress, Step::Resolve);

        let spec = BridgeSpec::for_interface(interface);
        tracing::debug!(interface, "Creating bridge: {}", spec.parent);

        let mut handle = ProvisioningHandle::new(self.bus, progress);

        let parent = checked_path_call(
            nm_settings.as_ref(),
            "AddConnection",
            &[BusArg::Settings(spec.parent_settings())],
        )?;
        handle.parent_created(parent);

        let child = checked_path_call(
            nm_settings.as_ref(),
            "AddConnection",
            &[BusArg::Settings(spec.child_settings())],
        )?;
        handle.child_created(child.clone());

        checked_call(
            nm_root.as_ref(),
            "ActivateConnection",
            &[
                BusArg::ObjectPath(child),
                BusArg::ObjectPath(ObjectPath::root()),
                BusArg::ObjectPath(ObjectPath::root()),
            ],
            false,
        )?;

        handle.disarm();
        tracing::info!(interface, "Created bridge: {}", spec.parent);
        Ok(())
    }
}
