//! Delivery state machine using rust-fsm.
//!
//! ## State Diagram
//!
//! ```text
//!            Claim                Succeed
//! Pending ───────────► Processing ────────► Delivered
//!    ▲  ▲                 │   │
//!    │  └─── Release ─────┘   │ Fail
//!    │                        ▼
//!    └────── Restart ────── Failed ──┐
//!                             ▲      │ Claim (retry due)
//!                             └──────┘  ──► Processing
//!
//! Cancel: Pending | Processing | Failed ──► Cancelled
//! ```
//!
//! Delivered and Cancelled are terminal. Storage guards are derived from
//! this machine, so a status change the machine forbids never reaches SQL.

use rust_fsm::*;
use webhook_database::DeliveryStatus;

state_machine! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub delivery_machine(Pending)

    Pending => {
        Claim => Processing,
        Cancel => Cancelled
    },
    Processing => {
        Succeed => Delivered,
        Fail => Failed,
        Release => Pending,
        Cancel => Cancelled
    },
    Failed => {
        Claim => Processing,
        Restart => Pending,
        Cancel => Cancelled
    }
}

pub use delivery_machine::Input as DeliveryInput;
pub use delivery_machine::State as DeliveryMachineState;
pub use delivery_machine::StateMachine as DeliveryMachine;

impl From<DeliveryStatus> for DeliveryMachineState {
    fn from(status: DeliveryStatus) -> Self {
        match status {
            DeliveryStatus::Pending => Self::Pending,
            DeliveryStatus::Processing => Self::Processing,
            DeliveryStatus::Delivered => Self::Delivered,
            DeliveryStatus::Failed => Self::Failed,
            DeliveryStatus::Cancelled => Self::Cancelled,
        }
    }
}

impl From<DeliveryMachineState> for DeliveryStatus {
    fn from(state: DeliveryMachineState) -> Self {
        match state {
            DeliveryMachineState::Pending => Self::Pending,
            DeliveryMachineState::Processing => Self::Processing,
            DeliveryMachineState::Delivered => Self::Delivered,
            DeliveryMachineState::Failed => Self::Failed,
            DeliveryMachineState::Cancelled => Self::Cancelled,
        }
    }
}

/// Where `input` may be applied and where it leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guard {
    pub from: Vec<DeliveryStatus>,
    pub to: DeliveryStatus,
}

/// Status reached by applying `input` in `status`, if allowed.
pub fn next_status(status: DeliveryStatus, input: DeliveryInput) -> Option<DeliveryStatus> {
    delivery_machine::Impl::transition(&status.into(), &input).map(DeliveryStatus::from)
}

/// Every status accepting `input`, with the status it leads to.
///
/// `None` if no status accepts it. Each input in the machine above has a
/// single target.
pub fn guard(input: DeliveryInput) -> Option<Guard> {
    let mut from = Vec::new();
    let mut to = None;
    for status in DeliveryStatus::ALL {
        if let Some(next) = next_status(status, input) {
            from.push(status);
            to = Some(next);
        }
    }
    to.map(|to| Guard { from, to })
}

/// Verb used in error messages.
pub fn action_name(input: DeliveryInput) -> &'static str {
    match input {
        DeliveryInput::Claim => "claim",
        DeliveryInput::Succeed => "record success for",
        DeliveryInput::Fail => "record failure for",
        DeliveryInput::Release => "release",
        DeliveryInput::Cancel => "cancel",
        DeliveryInput::Restart => "restart",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_pending() {
        let machine = DeliveryMachine::new();
        assert_eq!(*machine.state(), DeliveryMachineState::Pending);
    }

    #[test]
    fn test_retry_cycle() {
        let mut machine = DeliveryMachine::new();
        machine.consume(&DeliveryInput::Claim).unwrap();
        machine.consume(&DeliveryInput::Fail).unwrap();
        machine.consume(&DeliveryInput::Claim).unwrap();
        machine.consume(&DeliveryInput::Succeed).unwrap();
        assert_eq!(*machine.state(), DeliveryMachineState::Delivered);
    }

    #[test]
    fn test_terminal_states_accept_nothing() {
        let inputs = [
            DeliveryInput::Claim,
            DeliveryInput::Succeed,
            DeliveryInput::Fail,
            DeliveryInput::Release,
            DeliveryInput::Cancel,
            DeliveryInput::Restart,
        ];
        for status in [DeliveryStatus::Delivered, DeliveryStatus::Cancelled] {
            for input in inputs {
                assert_eq!(next_status(status, input), None, "{status} {input:?}");
            }
        }
    }

    #[test]
    fn test_success_requires_a_claim() {
        assert_eq!(next_status(DeliveryStatus::Pending, DeliveryInput::Succeed), None);
        assert_eq!(next_status(DeliveryStatus::Failed, DeliveryInput::Fail), None);
    }

    #[test]
    fn test_guards() {
        assert_eq!(
            guard(DeliveryInput::Claim),
            Some(Guard {
                from: vec![DeliveryStatus::Pending, DeliveryStatus::Failed],
                to: DeliveryStatus::Processing,
            })
        );
        assert_eq!(
            guard(DeliveryInput::Cancel),
            Some(Guard {
                from: vec![
                    DeliveryStatus::Pending,
                    DeliveryStatus::Processing,
                    DeliveryStatus::Failed
                ],
                to: DeliveryStatus::Cancelled,
            })
        );
        assert_eq!(
            guard(DeliveryInput::Restart),
            Some(Guard {
                from: vec![DeliveryStatus::Failed],
                to: DeliveryStatus::Pending,
            })
        );
    }
}
