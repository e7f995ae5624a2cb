//! Bridge provisioning state machine
//!
//! Tracks how far a `create_bridge` call got, which decides whether the
//! rollback has anything to undo.

use state_machines::state_machine;

state_machine! {
    name: BridgeMachine,
    dynamic: true,
    initial: Start,
    states: [Start, BusConnected, InterfacesResolved, ParentCreated, ChildCreated, Activated, RolledBack],
    events {
        connect {
            transition: { from: Start, to: BusConnected }
        }
        resolve {
            transition: { from: BusConnected, to: InterfacesResolved }
        }
        bridge {
            transition: { from: InterfacesResolved, to: ParentCreated }
        }
        enslave {
            transition: { from: ParentCreated, to: ChildCreated }
        }
        activate {
            transition: { from: ChildCreated, to: Activated }
        }
        rollback {
            transition: { from: [ParentCreated, ChildCreated], to: RolledBack }
        }
    }
}

/// Provisioning progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Start,
    BusConnected,
    InterfacesResolved,
    ParentCreated,
    ChildCreated,
    Activated,
    RolledBack,
}

impl Stage {
    fn from_str(s: &str) -> Self {
        match s {
            "BusConnected" => Stage::BusConnected,
            "InterfacesResolved" => Stage::InterfacesResolved,
            "ParentCreated" => Stage::ParentCreated,
            "ChildCreated" => Stage::ChildCreated,
            "Activated" => Stage::Activated,
            "RolledBack" => Stage::RolledBack,
            _ => Stage::Start,
        }
    }

    /// Whether a connection exists on the bus that a rollback must delete
    pub fn has_side_effects(&self) -> bool {
        matches!(self, Stage::ParentCreated | Stage::ChildCreated)
    }
}

/// Provisioning events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Connect,
    Resolve,
    Bridge,
    Enslave,
    Activate,
    Rollback,
}

/// Runtime state of one provisioning call
pub struct Progress {
    machine: DynamicBridgeMachine<()>,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            machine: BridgeMachine::new(()).into_dynamic(),
        }
    }

    pub fn stage(&self) -> Stage {
        Stage::from_str(self.machine.current_state())
    }

    pub fn advance(&mut self, step: Step) -> Result<(), state_machines::DynamicError> {
        let event = match step {
            Step::Connect => BridgeMachineEvent::Connect,
            Step::Resolve => BridgeMachineEvent::Resolve,
            Step::Bridge => BridgeMachineEvent::Bridge,
            Step::Enslave => BridgeMachineEvent::Enslave,
            Step::Activate => BridgeMachineEvent::Activate,
            Step::Rollback => BridgeMachineEvent::Rollback,
        };
        self.machine.handle(event)
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}
