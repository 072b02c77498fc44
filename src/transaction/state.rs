//! Per-family transaction states (§4.4).

use std::fmt;

/// RFC 3261 §17.1.1 client INVITE transaction states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientInviteState {
    Calling,
    Proceeding,
    Completed,
    Terminated,
}

/// RFC 3261 §17.1.2 client non-INVITE transaction states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientNonInviteState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// RFC 3261 §17.2.1 server INVITE transaction states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerInviteState {
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

/// RFC 3261 §17.2.2 server non-INVITE transaction states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerNonInviteState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Union over the four families, tagged by [`super::key::TransactionKind`].
/// Kept as one enum (rather than four separate transaction types) so
/// [`super::manager::TransactionManager`] can hold a single homogeneous map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    ClientInvite(ClientInviteState),
    ServerInvite(ServerInviteState),
    ClientNonInvite(ClientNonInviteState),
    ServerNonInvite(ServerNonInviteState),
}

impl TransactionState {
    pub fn is_terminated(self) -> bool {
        matches!(
            self,
            TransactionState::ClientInvite(ClientInviteState::Terminated)
                | TransactionState::ServerInvite(ServerInviteState::Terminated)
                | TransactionState::ClientNonInvite(ClientNonInviteState::Terminated)
                | TransactionState::ServerNonInvite(ServerNonInviteState::Terminated)
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            TransactionState::ClientInvite(s) => match s {
                ClientInviteState::Calling => "Calling",
                ClientInviteState::Proceeding => "Proceeding",
                ClientInviteState::Completed => "Completed",
                ClientInviteState::Terminated => "Terminated",
            },
            TransactionState::ServerInvite(s) => match s {
                ServerInviteState::Proceeding => "Proceeding",
                ServerInviteState::Completed => "Completed",
                ServerInviteState::Confirmed => "Confirmed",
                ServerInviteState::Terminated => "Terminated",
            },
            TransactionState::ClientNonInvite(s) => match s {
                ClientNonInviteState::Trying => "Trying",
                ClientNonInviteState::Proceeding => "Proceeding",
                ClientNonInviteState::Completed => "Completed",
                ClientNonInviteState::Terminated => "Terminated",
            },
            TransactionState::ServerNonInvite(s) => match s {
                ServerNonInviteState::Trying => "Trying",
                ServerNonInviteState::Proceeding => "Proceeding",
                ServerNonInviteState::Completed => "Completed",
                ServerNonInviteState::Terminated => "Terminated",
            },
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
