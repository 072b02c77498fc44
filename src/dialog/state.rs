//! Dialog roles and lifecycle states (§4.3).

use std::fmt;

/// Whether this side originated the initial request (UAC) or received it
/// (UAS). Immutable after dialog creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Uac,
    Uas,
}

/// RFC 3261 dialog lifecycle, plus the `Cancelling` sub-state entered when
/// the local side CANCELs an outgoing INVITE that has not yet completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Init,
    Trying,
    Ringing,
    Established,
    Cancelling,
    Terminating,
    Terminated,
}

impl DialogState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DialogState::Terminated)
    }

    pub fn name(self) -> &'static str {
        match self {
            DialogState::Init => "Init",
            DialogState::Trying => "Trying",
            DialogState::Ringing => "Ringing",
            DialogState::Established => "Established",
            DialogState::Cancelling => "Cancelling",
            DialogState::Terminating => "Terminating",
            DialogState::Terminated => "Terminated",
        }
    }
}

impl fmt::Display for DialogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
