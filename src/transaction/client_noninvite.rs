//! RFC 3261 §17.1.2 client non-INVITE transaction.

use crate::error::DialogError;
use crate::transaction::state::ClientNonInviteState as State;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Start,
    RecvProvisional,
    RecvFinal,
    /// Timer E: retransmit (unreliable transports only).
    TimerEFired,
    /// Timer F: transaction timeout.
    TimerFFired,
    /// Timer K: done absorbing retransmitted final responses.
    TimerKFired,
    TransportFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    RetransmitRequest,
    ArmTimerE,
    ArmTimerF,
    ArmTimerK,
    CancelTimers,
    NotifyTransportFailure,
    NotifyTimeout,
}

pub fn transition(state: State, event: Event) -> Result<(State, Vec<Effect>), DialogError> {
    use Event::*;
    use State::*;

    let (new_state, effects): (State, Vec<Effect>) = match (state, event) {
        (Trying, Start) => (Trying, vec![Effect::ArmTimerE, Effect::ArmTimerF]),
        (Trying, TimerEFired) => (Trying, vec![Effect::RetransmitRequest, Effect::ArmTimerE]),
        (Proceeding, TimerEFired) => (Proceeding, vec![Effect::RetransmitRequest, Effect::ArmTimerE]),
        (Trying, RecvProvisional) | (Proceeding, RecvProvisional) => (Proceeding, vec![]),
        (Trying, RecvFinal) | (Proceeding, RecvFinal) => (Completed, vec![Effect::CancelTimers, Effect::ArmTimerK]),
        (Completed, RecvFinal) => (Completed, vec![]),
        (Completed, TimerKFired) => (Terminated, vec![]),
        (Trying, TimerFFired) | (Proceeding, TimerFFired) => {
            (Terminated, vec![Effect::CancelTimers, Effect::NotifyTimeout])
        }
        (Trying, TransportFailed) | (Proceeding, TransportFailed) => {
            (Terminated, vec![Effect::CancelTimers, Effect::NotifyTransportFailure])
        }
        _ => {
            return Err(DialogError::invalid_state("client non-INVITE transition", "a reachable state for this event", state_name(state)));
        }
    };
    Ok((new_state, effects))
}

fn state_name(state: State) -> &'static str {
    match state {
        State::Trying => "Trying",
        State::Proceeding => "Proceeding",
        State::Completed => "Completed",
        State::Terminated => "Terminated",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let (s, _) = transition(State::Trying, Event::Start).unwrap();
        let (s, _) = transition(s, Event::RecvProvisional).unwrap();
        assert_eq!(s, State::Proceeding);
        let (s, effects) = transition(s, Event::RecvFinal).unwrap();
        assert_eq!(s, State::Completed);
        assert!(effects.contains(&Effect::ArmTimerK));
    }

    #[test]
    fn retransmitted_final_in_completed_is_absorbed_silently() {
        let (s, effects) = transition(State::Completed, Event::RecvFinal).unwrap();
        assert_eq!(s, State::Completed);
        assert!(effects.is_empty());
    }

    #[test]
    fn timer_f_times_out_from_trying() {
        let (s, effects) = transition(State::Trying, Event::TimerFFired).unwrap();
        assert_eq!(s, State::Terminated);
        assert!(effects.contains(&Effect::NotifyTimeout));
    }
}
