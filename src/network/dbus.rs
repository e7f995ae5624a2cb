//! D-Bus gateway
//!
//! The bridge provisioner talks to NetworkManager through the
//! [`BusConnection`] and [`BusInterface`] traits. [`SystemBus`] implements
//! them over the blocking `zbus` API.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use zbus::blocking::Connection;
use zbus::zvariant::{self, OwnedObjectPath, Value};

const INTROSPECTABLE_IFC: &str = "org.freedesktop.DBus.Introspectable";
const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";

/// Error reported by the bus
///
/// An error without a name is "no error" as far as the bus is concerned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusError {
    pub name: Option<String>,
    pub message: Option<String>,
}

impl BusError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            message: Some(message.into()),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.name.is_some()
    }

    /// The bus-reported reason, or "unknown cause"
    pub fn cause(&self) -> &str {
        match self.message.as_deref() {
            Some(msg) if self.is_valid() && !msg.is_empty() => msg,
            _ => "unknown cause",
        }
    }
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}: {}", name, self.cause()),
            None => write!(f, "{}", self.cause()),
        }
    }
}

impl From<zbus::Error> for BusError {
    fn from(e: zbus::Error) -> Self {
        match e {
            zbus::Error::MethodError(name, detail, _) => Self {
                name: Some(name.to_string()),
                message: detail,
            },
            other => Self::new("org.freedesktop.DBus.Error.Failed", other.to_string()),
        }
    }
}

impl From<zvariant::Error> for BusError {
    fn from(e: zvariant::Error) -> Self {
        Self::new(INVALID_ARGS, e.to_string())
    }
}

/// A D-Bus object path; an empty path means "no object"
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// `/`, which NetworkManager reads as "no device" or "no specific object"
    pub fn root() -> Self {
        Self("/".to_string())
    }

    pub fn is_null(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single setting value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingValue {
    Str(String),
    Int(i32),
}

impl From<&str> for SettingValue {
    fn from(s: &str) -> Self {
        SettingValue::Str(s.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(s: String) -> Self {
        SettingValue::Str(s)
    }
}

impl From<i32> for SettingValue {
    fn from(i: i32) -> Self {
        SettingValue::Int(i)
    }
}

/// NetworkManager connection settings, `a{sa{sv}}` on the wire
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionSettings {
    groups: BTreeMap<String, BTreeMap<String, SettingValue>>,
}

impl ConnectionSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key to a settings group, creating the group if needed
    pub fn with(mut self, group: &str, key: &str, value: impl Into<SettingValue>) -> Self {
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
        self
    }

    pub fn group(&self, group: &str) -> Option<&BTreeMap<String, SettingValue>> {
        self.groups.get(group)
    }

    pub fn get(&self, group: &str, key: &str) -> Option<&SettingValue> {
        self.group(group).and_then(|g| g.get(key))
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn to_wire(&self) -> HashMap<String, HashMap<String, Value<'static>>> {
        self.groups
            .iter()
            .map(|(group, entries)| {
                let entries = entries
                    .iter()
                    .map(|(key, value)| {
                        let value = match value {
                            SettingValue::Str(s) => Value::from(s.clone()),
                            SettingValue::Int(i) => Value::from(*i),
                        };
                        (key.clone(), value)
                    })
                    .collect();
                (group.clone(), entries)
            })
            .collect()
    }
}

/// An argument to a bus method call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusArg {
    Settings(ConnectionSettings),
    ObjectPath(ObjectPath),
}

/// A connection to a message bus
pub trait BusConnection {
    fn is_connected(&self) -> bool;

    fn last_error(&self) -> BusError;

    /// Handle to an interface on a remote object
    fn interface<'a>(
        &'a self,
        service: &str,
        path: &str,
        interface: &str,
    ) -> Box<dyn BusInterface + 'a>;
}

/// An interface on a remote bus object
///
/// Methods used by this crate reply with at most one object path.
pub trait BusInterface {
    fn service(&self) -> &str;

    fn path(&self) -> &str;

    fn interface(&self) -> &str;

    /// Whether the remote object exists and exposes this interface
    fn is_valid(&self) -> bool;

    fn last_error(&self) -> BusError;

    /// Blocking method call
    fn call(&self, method: &str, args: &[BusArg]) -> Result<Option<ObjectPath>, BusError>;
}

/// The system bus, via zbus
pub struct SystemBus {
    connection: Option<Connection>,
    error: BusError,
}

impl SystemBus {
    /// Connect to the system bus; failures are reported through
    /// [`BusConnection::is_connected`] and [`BusConnection::last_error`]
    pub fn connect() -> Self {
        match Connection::system() {
            Ok(connection) => Self {
                connection: Some(connection),
                error: BusError::default(),
            },
            Err(e) => {
                tracing::debug!(error = %e, "System bus connection failed");
                Self {
                    connection: None,
                    error: e.into(),
                }
            }
        }
    }
}

impl BusConnection for SystemBus {
    fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn last_error(&self) -> BusError {
        self.error.clone()
    }

    fn interface<'a>(
        &'a self,
        service: &str,
        path: &str,
        interface: &str,
    ) -> Box<dyn BusInterface + 'a> {
        Box::new(RemoteInterface {
            connection: self.connection.as_ref(),
            service: service.to_string(),
            path: path.to_string(),
            interface: interface.to_string(),
            error: RefCell::new(BusError::default()),
        })
    }
}

struct RemoteInterface<'a> {
    connection: Option<&'a Connection>,
    service: String,
    path: String,
    interface: String,
    error: RefCell<BusError>,
}

impl RemoteInterface<'_> {
    fn connection(&self) -> Result<&Connection, BusError> {
        self.connection.ok_or_else(|| {
            BusError::new(
                "org.freedesktop.DBus.Error.Disconnected",
                "Not connected to D-Bus",
            )
        })
    }

    fn introspect(&self) -> Result<String, BusError> {
        let reply = self.connection()?.call_method(
            Some(self.service.as_str()),
            self.path.as_str(),
            Some(INTROSPECTABLE_IFC),
            "Introspect",
            &(),
        )?;
        Ok(reply.body().deserialize::<String>()?)
    }

    fn dispatch(&self, method: &str, args: &[BusArg]) -> Result<Option<ObjectPath>, BusError> {
        let connection = self.connection()?;
        let service = Some(self.service.as_str());
        let path = self.path.as_str();
        let interface = Some(self.interface.as_str());

        let reply = match args {
            [] => connection.call_method(service, path, interface, method, &())?,
            [BusArg::Settings(settings)] => {
                connection.call_method(service, path, interface, method, &(settings.to_wire(),))?
            }
            [
                BusArg::ObjectPath(a),
                BusArg::ObjectPath(b),
                BusArg::ObjectPath(c),
            ] => {
                let body = (
                    zvariant::ObjectPath::try_from(a.as_str())?,
                    zvariant::ObjectPath::try_from(b.as_str())?,
                    zvariant::ObjectPath::try_from(c.as_str())?,
                );
                connection.call_method(service, path, interface, method, &body)?
            }
            _ => {
                return Err(BusError::new(
                    INVALID_ARGS,
                    format!("Unsupported argument list for {}", method),
                ));
            }
        };

        Ok(reply
            .body()
            .deserialize::<OwnedObjectPath>()
            .ok()
            .map(|p| ObjectPath::new(p.as_str())))
    }
}

impl BusInterface for RemoteInterface<'_> {
    fn service(&self) -> &str {
        &self.service
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn interface(&self) -> &str {
        &self.interface
    }

    fn is_valid(&self) -> bool {
        let marker = format!("interface name=\"{}\"", self.interface);
        match self.introspect() {
            Ok(xml) if xml.contains(&marker) => true,
            Ok(_) => {
                self.error.replace(BusError::new(
                    "org.freedesktop.DBus.Error.UnknownInterface",
                    format!("No such interface '{}' at object path '{}'", self.interface, self.path),
                ));
                false
            }
            Err(e) => {
                self.error.replace(e);
                false
            }
        }
    }

    fn last_error(&self) -> BusError {
        self.error.borrow().clone()
    }

    fn call(&self, method: &str, args: &[BusArg]) -> Result<Option<ObjectPath>, BusError> {
        self.dispatch(method, args).inspect_err(|e| {
            self.error.replace(e.clone());
        })
    }
}
