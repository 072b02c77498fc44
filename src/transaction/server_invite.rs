//! RFC 3261 §17.2.1 server INVITE transaction.

use crate::error::DialogError;
use crate::transaction::state::ServerInviteState as State;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The INVITE that created this transaction arrived.
    RecvInvite,
    /// The TU sent a 1xx.
    Send1xx,
    /// The TU sent a 2xx. Per RFC 3261 the transaction does not retransmit
    /// 2xx itself past this point — the TU/dialog layer owns that.
    Send2xx,
    /// The TU sent a final non-2xx response.
    SendFinalNon2xx,
    /// A retransmitted INVITE arrived (no ACK yet).
    RecvRetransmittedInvite,
    /// The matching ACK arrived.
    RecvAck,
    /// Timer G: retransmit the final non-2xx response (unreliable only).
    TimerGFired,
    /// Timer H: no ACK arrived in time.
    TimerHFired,
    /// Timer I: done absorbing retransmitted ACKs.
    TimerIFired,
    TransportFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    RetransmitLastResponse,
    ArmTimerG,
    ArmTimerH,
    ArmTimerI,
    CancelTimers,
    NotifyTransportFailure,
    NotifyNoAck,
}

pub fn transition(state: State, event: Event) -> Result<(State, Vec<Effect>), DialogError> {
    use Event::*;
    use State::*;

    let (new_state, effects): (State, Vec<Effect>) = match (state, event) {
        (Proceeding, RecvInvite) => (Proceeding, vec![]),
        (Proceeding, Send1xx) => (Proceeding, vec![]),
        (Proceeding, RecvRetransmittedInvite) => (Proceeding, vec![Effect::RetransmitLastResponse]),
        (Proceeding, Send2xx) => (Terminated, vec![]),
        (Proceeding, SendFinalNon2xx) => (Completed, vec![Effect::ArmTimerG, Effect::ArmTimerH]),
        (Completed, TimerGFired) => (Completed, vec![Effect::RetransmitLastResponse, Effect::ArmTimerG]),
        (Completed, RecvRetransmittedInvite) => (Completed, vec![Effect::RetransmitLastResponse]),
        (Completed, RecvAck) => (Confirmed, vec![Effect::CancelTimers, Effect::ArmTimerI]),
        (Confirmed, TimerIFired) => (Terminated, vec![]),
        (Completed, TimerHFired) => (Terminated, vec![Effect::CancelTimers, Effect::NotifyNoAck]),
        (Proceeding, TransportFailed) | (Completed, TransportFailed) => {
            (Terminated, vec![Effect::CancelTimers, Effect::NotifyTransportFailure])
        }
        _ => {
            return Err(DialogError::invalid_state("server INVITE transition", "a reachable state for this event", state_name(state)));
        }
    };
    Ok((new_state, effects))
}

fn state_name(state: State) -> &'static str {
    match state {
        State::Proceeding => "Proceeding",
        State::Completed => "Completed",
        State::Confirmed => "Confirmed",
        State::Terminated => "Terminated",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_hundred_terminates_immediately() {
        let (s, effects) = transition(State::Proceeding, Event::Send2xx).unwrap();
        assert_eq!(s, State::Terminated);
        assert!(effects.is_empty());
    }

    #[test]
    fn non_2xx_then_ack_reaches_confirmed_then_terminated() {
        let (s, _) = transition(State::Proceeding, Event::SendFinalNon2xx).unwrap();
        assert_eq!(s, State::Completed);
        let (s, _) = transition(s, Event::RecvAck).unwrap();
        assert_eq!(s, State::Confirmed);
        let (s, _) = transition(s, Event::TimerIFired).unwrap();
        assert_eq!(s, State::Terminated);
    }

    #[test]
    fn missing_ack_times_out_via_timer_h() {
        let (s, _) = transition(State::Proceeding, Event::SendFinalNon2xx).unwrap();
        let (s, effects) = transition(s, Event::TimerHFired).unwrap();
        assert_eq!(s, State::Terminated);
        assert!(effects.contains(&Effect::NotifyNoAck));
    }
}
