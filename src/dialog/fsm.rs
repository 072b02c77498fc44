//! The dialog state machine as a pure transition function.
//!
//! Per the redesign notes (§9), this returns `(new_state, effects)` instead
//! of firing callbacks mid-transition: the driver in [`super::Dialog`]
//! applies `state` and then runs `effects`, so nothing can observe the
//! dialog half-transitioned or re-enter the transition function while it
//! runs.

use crate::dialog::state::{DialogState, Role};
use crate::error::DialogError;

/// Inputs that can move a dialog between states. Named after the row in the
/// §4.3 transition table they drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogEvent {
    SendInvite,
    RecvInvite,
    RecvProvisional,
    Recv2xxInvite,
    RecvFailureInvite,
    SendCancel,
    Recv487ToCancelledInvite,
    RecvCancel,
    Send1xxProvisional,
    Send2xxAccept,
    SendFailureReject,
    SendBye,
    RecvBye,
    Recv2xxBye,
}

/// What the driver must do after a successful transition. The transition
/// function only *describes* effects; it never performs them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogEffect {
    NotifyStateChanged { from: DialogState, to: DialogState },
    ArmAckWindow,
}

/// Attempts `event` against `(role, state)`. Returns the new state plus the
/// effects the driver must run, or `InvalidState` if the event is not legal
/// from the current state for that role.
pub fn transition(role: Role, state: DialogState, event: DialogEvent) -> Result<(DialogState, Vec<DialogEffect>), DialogError> {
    use DialogEvent::*;
    use DialogState::*;

    let new_state = match (role, state, event) {
        (Role::Uac, Init, SendInvite) => Trying,
        (Role::Uac, Trying, RecvProvisional) => Ringing,
        (Role::Uac, Ringing, RecvProvisional) => Ringing,
        (Role::Uac, Trying, Recv2xxInvite) | (Role::Uac, Ringing, Recv2xxInvite) => Established,
        (Role::Uac, Trying, RecvFailureInvite) | (Role::Uac, Ringing, RecvFailureInvite) => Terminated,
        (Role::Uac, Trying, SendCancel) | (Role::Uac, Ringing, SendCancel) => Cancelling,
        (Role::Uac, Cancelling, Recv487ToCancelledInvite) => Terminated,

        (Role::Uas, Init, RecvInvite) => Ringing,
        (Role::Uas, Ringing, Send1xxProvisional) => Ringing,
        (Role::Uas, Ringing, Send2xxAccept) => Established,
        (Role::Uas, Ringing, SendFailureReject) => Terminated,
        (Role::Uas, Ringing, RecvCancel) => Terminated,

        (_, Established, SendBye) | (_, Established, RecvBye) => Terminating,
        (_, _, RecvBye) if state != Terminated => Terminating,
        (_, Terminating, Recv2xxBye) => Terminated,

        _ => {
            return Err(DialogError::invalid_state("dialog transition", "a state accepting this event", state.name()));
        }
    };

    let mut effects = vec![DialogEffect::NotifyStateChanged { from: state, to: new_state }];
    if matches!(event, Recv2xxInvite | Send2xxAccept) {
        effects.push(DialogEffect::ArmAckWindow);
    }
    Ok((new_state, effects))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialog::state::DialogState::*;

    #[test]
    fn uac_happy_path() {
        let (s, _) = transition(Role::Uac, Init, DialogEvent::SendInvite).unwrap();
        assert_eq!(s, Trying);
        let (s, _) = transition(Role::Uac, s, DialogEvent::RecvProvisional).unwrap();
        assert_eq!(s, Ringing);
        let (s, effects) = transition(Role::Uac, s, DialogEvent::Recv2xxInvite).unwrap();
        assert_eq!(s, Established);
        assert!(effects.contains(&DialogEffect::ArmAckWindow));
    }

    #[test]
    fn uas_happy_path() {
        let (s, _) = transition(Role::Uas, Init, DialogEvent::RecvInvite).unwrap();
        assert_eq!(s, Ringing);
        let (s, _) = transition(Role::Uas, s, DialogEvent::Send1xxProvisional).unwrap();
        assert_eq!(s, Ringing);
        let (s, _) = transition(Role::Uas, s, DialogEvent::Send2xxAccept).unwrap();
        assert_eq!(s, Established);
    }

    #[test]
    fn glare_cancel_reaches_terminated_exactly_once() {
        let (s, _) = transition(Role::Uac, Init, DialogEvent::SendInvite).unwrap();
        let (s, _) = transition(Role::Uac, s, DialogEvent::RecvProvisional).unwrap();
        let (s, _) = transition(Role::Uac, s, DialogEvent::SendCancel).unwrap();
        assert_eq!(s, Cancelling);
        let (s, effects) = transition(Role::Uac, s, DialogEvent::Recv487ToCancelledInvite).unwrap();
        assert_eq!(s, Terminated);
        assert_eq!(effects.len(), 1);
    }

    #[test]
    fn uas_receiving_cancel_while_ringing_terminates() {
        let (s, _) = transition(Role::Uas, Init, DialogEvent::RecvInvite).unwrap();
        let (s, _) = transition(Role::Uas, s, DialogEvent::RecvCancel).unwrap();
        assert_eq!(s, Terminated);
    }

    #[test]
    fn accept_outside_ringing_is_invalid_state() {
        let err = transition(Role::Uas, Established, DialogEvent::Send2xxAccept).unwrap_err();
        assert!(matches!(err, DialogError::InvalidState { .. }));
    }

    #[test]
    fn bye_in_init_is_invalid_state() {
        let err = transition(Role::Uac, Init, DialogEvent::SendBye).unwrap_err();
        assert!(matches!(err, DialogError::InvalidState { .. }));
    }
}
