//! Test doubles for the process and bus seams

use crate::network::dbus::{BusArg, BusConnection, BusError, BusInterface, ObjectPath};
use crate::process::{ProcessErrorKind, ProcessOutcome, ProcessRunner, ProcessSpec, ProcessState};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

/// Process runner that answers from a closure and records every spec
pub struct FakeRunner {
    handler: Box<dyn Fn(&ProcessSpec) -> ProcessOutcome>,
    calls: RefCell<Vec<ProcessSpec>>,
}

impl FakeRunner {
    pub fn new(handler: impl Fn(&ProcessSpec) -> ProcessOutcome + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<ProcessSpec> {
        self.calls.borrow().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.borrow().len()
    }
}

impl ProcessRunner for FakeRunner {
    fn run(&self, spec: &ProcessSpec) -> ProcessOutcome {
        self.calls.borrow_mut().push(spec.clone());
        (self.handler)(spec)
    }
}

pub fn exited(code: i32, stdout: &str, stderr: &str) -> ProcessOutcome {
    ProcessOutcome {
        state: ProcessState::exited(code),
        stdout: stdout.as_bytes().to_vec(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

pub fn errored(kind: ProcessErrorKind, message: &str, stderr: &str) -> ProcessOutcome {
    ProcessOutcome {
        state: ProcessState::failed(kind, message),
        stdout: Vec::new(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

/// A method call seen by [`FakeBus`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub service: String,
    pub path: String,
    pub interface: String,
    pub method: String,
    pub args: Vec<BusArg>,
}

type Reply = Result<Option<ObjectPath>, BusError>;

/// In-memory bus: scripted replies per (object path, method), calls recorded
#[derive(Default)]
pub struct FakeBus {
    disconnected: Option<BusError>,
    invalid: HashMap<String, BusError>,
    replies: RefCell<HashMap<(String, String), VecDeque<Reply>>>,
    calls: RefCell<Vec<RecordedCall>>,
    resolved: RefCell<Vec<String>>,
}

impl FakeBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disconnected(error: BusError) -> Self {
        Self {
            disconnected: Some(error),
            ..Self::default()
        }
    }

    /// Make the interface at `path` report itself invalid
    pub fn invalid_object(mut self, path: &str, error: BusError) -> Self {
        self.invalid.insert(path.to_string(), error);
        self
    }

    /// Queue a reply for the next `method` call on `path`
    pub fn reply(self, path: &str, method: &str, reply: Reply) -> Self {
        self.replies
            .borrow_mut()
            .entry((path.to_string(), method.to_string()))
            .or_default()
            .push_back(reply);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.borrow().clone()
    }

    pub fn methods(&self) -> Vec<(String, String)> {
        self.calls
            .borrow()
            .iter()
            .map(|c| (c.path.clone(), c.method.clone()))
            .collect()
    }

    /// Object paths handed out through `interface()`
    pub fn resolved(&self) -> Vec<String> {
        self.resolved.borrow().clone()
    }
}

impl BusConnection for FakeBus {
    fn is_connected(&self) -> bool {
        self.disconnected.is_none()
    }

    fn last_error(&self) -> BusError {
        self.disconnected.clone().unwrap_or_default()
    }

    fn interface<'a>(
        &'a self,
        service: &str,
        path: &str,
        interface: &str,
    ) -> Box<dyn BusInterface + 'a> {
        self.resolved.borrow_mut().push(path.to_string());
        Box::new(FakeInterface {
            bus: self,
            service: service.to_string(),
            path: path.to_string(),
            interface: interface.to_string(),
        })
    }
}

struct FakeInterface<'a> {
    bus: &'a FakeBus,
    service: String,
    path: String,
    interface: String,
}

impl BusInterface for FakeInterface<'_> {
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
        !self.bus.invalid.contains_key(&self.path)
    }

    fn last_error(&self) -> BusError {
        self.bus.invalid.get(&self.path).cloned().unwrap_or_default()
    }

    fn call(&self, method: &str, args: &[BusArg]) -> Reply {
        self.bus.calls.borrow_mut().push(RecordedCall {
            service: self.service.clone(),
            path: self.path.clone(),
            interface: self.interface.clone(),
            method: method.to_string(),
            args: args.to_vec(),
        });

        self.bus
            .replies
            .borrow_mut()
            .get_mut(&(self.path.clone(), method.to_string()))
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(None))
    }
}

