//! RFC 3261 §17.2.2 server non-INVITE transaction.

use crate::error::DialogError;
use crate::transaction::state::ServerNonInviteState as State;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    RecvRequest,
    Send1xx,
    SendFinal,
    RecvRetransmittedRequest,
    /// Timer J: done absorbing retransmitted requests.
    TimerJFired,
    TransportFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    RetransmitLastResponse,
    ArmTimerJ,
    CancelTimers,
    NotifyTransportFailure,
}

pub fn transition(state: State, event: Event) -> Result<(State, Vec<Effect>), DialogError> {
    use Event::*;
    use State::*;

    let (new_state, effects): (State, Vec<Effect>) = match (state, event) {
        (Trying, RecvRequest) => (Trying, vec![]),
        (Trying, Send1xx) => (Proceeding, vec![]),
        (Proceeding, Send1xx) => (Proceeding, vec![]),
        (Proceeding, RecvRetransmittedRequest) => (Proceeding, vec![Effect::RetransmitLastResponse]),
        (Trying, SendFinal) | (Proceeding, SendFinal) => (Completed, vec![Effect::ArmTimerJ]),
        (Completed, RecvRetransmittedRequest) => (Completed, vec![Effect::RetransmitLastResponse]),
        (Completed, TimerJFired) => (Terminated, vec![Effect::CancelTimers]),
        (Trying, TransportFailed) | (Proceeding, TransportFailed) | (Completed, TransportFailed) => {
            (Terminated, vec![Effect::CancelTimers, Effect::NotifyTransportFailure])
        }
        _ => {
            return Err(DialogError::invalid_state("server non-INVITE transition", "a reachable state for this event", state_name(state)));
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
    fn happy_path_with_provisional() {
        let (s, _) = transition(State::Trying, Event::Send1xx).unwrap();
        assert_eq!(s, State::Proceeding);
        let (s, effects) = transition(s, Event::SendFinal).unwrap();
        assert_eq!(s, State::Completed);
        assert!(effects.contains(&Effect::ArmTimerJ));
    }

    #[test]
    fn timer_j_terminates_from_completed() {
        let (s, _) = transition(State::Trying, Event::SendFinal).unwrap();
        let (s, _) = transition(s, Event::TimerJFired).unwrap();
        assert_eq!(s, State::Terminated);
    }
}
