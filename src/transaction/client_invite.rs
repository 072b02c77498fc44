//! RFC 3261 §17.1.1 client INVITE transaction, as a pure transition function
//! in the same style as [`crate::dialog::fsm`].

use crate::error::DialogError;
use crate::transaction::state::ClientInviteState as State;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Sent the initial INVITE; enters the transaction proper.
    Start,
    RecvProvisional,
    Recv2xx,
    RecvFinalNon2xx,
    /// Timer A: retransmit the request (unreliable transports only).
    TimerAFired,
    /// Timer B: no final response within the transaction lifetime.
    TimerBFired,
    /// Timer D: done absorbing retransmitted final responses.
    TimerDFired,
    TransportFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    RetransmitRequest,
    SendAck,
    ArmTimerA,
    ArmTimerB,
    ArmTimerD,
    CancelTimers,
    NotifyTransportFailure,
    NotifyTimeout,
}

pub fn transition(state: State, event: Event) -> Result<(State, Vec<Effect>), DialogError> {
    use Event::*;
    use State::*;

    let (new_state, effects): (State, Vec<Effect>) = match (state, event) {
        (Calling, Start) => (Calling, vec![Effect::ArmTimerA, Effect::ArmTimerB]),
        (Calling, TimerAFired) => (Calling, vec![Effect::RetransmitRequest, Effect::ArmTimerA]),
        (Calling, RecvProvisional) => (Proceeding, vec![]),
        (Proceeding, RecvProvisional) => (Proceeding, vec![]),
        (Calling, Recv2xx) | (Proceeding, Recv2xx) => (Terminated, vec![Effect::CancelTimers]),
        (Calling, RecvFinalNon2xx) | (Proceeding, RecvFinalNon2xx) => {
            (Completed, vec![Effect::SendAck, Effect::CancelTimers, Effect::ArmTimerD])
        }
        (Completed, RecvFinalNon2xx) => (Completed, vec![Effect::SendAck]),
        (Completed, TimerDFired) => (Terminated, vec![]),
        (Calling, TimerBFired) | (Proceeding, TimerBFired) => {
            (Terminated, vec![Effect::CancelTimers, Effect::NotifyTimeout])
        }
        (Calling, TransportFailed) | (Proceeding, TransportFailed) => {
            (Terminated, vec![Effect::CancelTimers, Effect::NotifyTransportFailure])
        }
        _ => {
            return Err(DialogError::invalid_state("client INVITE transition", "a reachable state for this event", state_name(state)));
        }
    };
    Ok((new_state, effects))
}

fn state_name(state: State) -> &'static str {
    match state {
        State::Calling => "Calling",
        State::Proceeding => "Proceeding",
        State::Completed => "Completed",
        State::Terminated => "Terminated",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_200_ok() {
        let (s, _) = transition(State::Calling, Event::Start).unwrap();
        let (s, _) = transition(s, Event::RecvProvisional).unwrap();
        assert_eq!(s, State::Proceeding);
        let (s, effects) = transition(s, Event::Recv2xx).unwrap();
        assert_eq!(s, State::Terminated);
        assert!(effects.contains(&Effect::CancelTimers));
    }

    #[test]
    fn non_2xx_final_arms_timer_d_and_acks() {
        let (s, _) = transition(State::Calling, Event::Start).unwrap();
        let (s, effects) = transition(s, Event::RecvFinalNon2xx).unwrap();
        assert_eq!(s, State::Completed);
        assert!(effects.contains(&Effect::SendAck));
        assert!(effects.contains(&Effect::ArmTimerD));
    }

    #[test]
    fn retransmitted_final_in_completed_re_acks_without_leaving_completed() {
        let (s, effects) = transition(State::Completed, Event::RecvFinalNon2xx).unwrap();
        assert_eq!(s, State::Completed);
        assert_eq!(effects, vec![Effect::SendAck]);
    }

    #[test]
    fn timer_b_timeout_terminates() {
        let (s, effects) = transition(State::Calling, Event::TimerBFired).unwrap();
        assert_eq!(s, State::Terminated);
        assert!(effects.contains(&Effect::NotifyTimeout));
    }

    #[test]
    fn event_after_terminated_is_invalid() {
        assert!(transition(State::Terminated, Event::RecvProvisional).is_err());
    }
}
