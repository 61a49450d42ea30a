//! Apply pipeline state machine
//!
//! Every apply pass walks this machine. Dynamic dispatch mode lets the
//! manager fire events as the pass progresses.

use crate::error::Error;
use state_machines::state_machine;

state_machine! {
    name: ApplyMachine,
    dynamic: true,
    initial: Idle,
    states: [Idle, Validating, Diffing, Applying, RollingBack, Committed, Rejected],
    events {
        validate {
            transition: { from: Idle, to: Validating }
        }
        diff {
            transition: { from: Validating, to: Diffing }
        }
        apply {
            transition: { from: Diffing, to: Applying }
        }
        commit {
            transition: { from: Applying, to: Committed }
        }
        rollback {
            transition: { from: Applying, to: RollingBack }
        }
        reject {
            transition: { from: [Validating, Diffing, RollingBack], to: Rejected }
        }
        reset {
            transition: { from: [Committed, Rejected], to: Idle }
        }
    }
}

/// Pipeline phase for external use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Validating,
    Diffing,
    Applying,
    RollingBack,
    Committed,
    Rejected,
}

impl Phase {
    fn from_state(s: &str) -> Self {
        match s {
            "Validating" => Phase::Validating,
            "Diffing" => Phase::Diffing,
            "Applying" => Phase::Applying,
            "RollingBack" => Phase::RollingBack,
            "Committed" => Phase::Committed,
            "Rejected" => Phase::Rejected,
            _ => Phase::Idle,
        }
    }
}

/// Tracks one apply pass through the machine
pub struct ApplyTracker {
    machine: DynamicApplyMachine<()>,
    /// Terminal phase of the most recent pass
    last_outcome: Option<Phase>,
}

impl Default for ApplyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ApplyTracker {
    pub fn new() -> Self {
        Self {
            machine: ApplyMachine::new(()).into_dynamic(),
            last_outcome: None,
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_state(self.machine.current_state())
    }

    pub fn last_outcome(&self) -> Option<Phase> {
        self.last_outcome
    }

    fn fire(&mut self, event: ApplyMachineEvent) -> crate::error::Result<()> {
        let from = self.machine.current_state().to_string();
        self.machine
            .handle(event)
            .map_err(|e| Error::Pipeline(format!("invalid transition from {}: {:?}", from, e)))?;
        tracing::debug!(from = %from, to = %self.machine.current_state(), "Apply phase");
        Ok(())
    }

    pub fn validate(&mut self) -> crate::error::Result<()> {
        self.fire(ApplyMachineEvent::Validate)
    }

    pub fn diff(&mut self) -> crate::error::Result<()> {
        self.fire(ApplyMachineEvent::Diff)
    }

    pub fn apply(&mut self) -> crate::error::Result<()> {
        self.fire(ApplyMachineEvent::Apply)
    }

    pub fn commit(&mut self) -> crate::error::Result<()> {
        self.fire(ApplyMachineEvent::Commit)
    }

    pub fn rollback(&mut self) -> crate::error::Result<()> {
        self.fire(ApplyMachineEvent::Rollback)
    }

    pub fn reject(&mut self) -> crate::error::Result<()> {
        self.fire(ApplyMachineEvent::Reject)
    }

    /// Record the terminal phase and return to Idle
    pub fn finish(&mut self) -> crate::error::Result<()> {
        let outcome = self.phase();
        self.fire(ApplyMachineEvent::Reset)?;
        self.last_outcome = Some(outcome);
        Ok(())
    }
}
