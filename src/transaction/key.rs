//! Transaction identity (§3, §4.4).

use std::fmt;
use std::hash::{Hash, Hasher};

use rsip::Method;

/// Whether this transaction was created by sending a request (client) or by
/// receiving one (server). Part of the matching key because a client and a
/// server transaction can share a branch when a UA talks to itself in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Client,
    Server,
}

/// `(branch, method, direction)` — RFC 3261 §17.1.3/§17.2.3 transaction
/// matching, simplified to the magic-cookie (`z9hG4bK`) branch case this
/// crate always generates and requires on receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionKey {
    pub branch: String,
    pub method: Method,
    pub direction: Direction,
}

impl Hash for TransactionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.branch.hash(state);
        self.method.to_string().hash(state);
        self.direction.hash(state);
    }
}

impl TransactionKey {
    pub fn new(branch: impl Into<String>, method: Method, direction: Direction) -> Self {
        Self { branch: branch.into(), method, direction }
    }

    /// CANCEL matches the INVITE transaction it cancels by branch alone
    /// (RFC 3261 §9.1): same key with `method` swapped to `Invite`.
    pub fn as_invite(&self) -> TransactionKey {
        TransactionKey { branch: self.branch.clone(), method: Method::Invite, direction: self.direction }
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.direction {
            Direction::Client => "client",
            Direction::Server => "server",
        };
        write!(f, "{}:{}:{}", self.branch, self.method, dir)
    }
}

/// The four RFC 3261 §17 transaction families; governs which FSM module
/// drives a given transaction's `state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    ClientInvite,
    ServerInvite,
    ClientNonInvite,
    ServerNonInvite,
}

impl TransactionKind {
    pub fn for_request(method: Method, direction: Direction) -> Self {
        match (method, direction) {
            (Method::Invite, Direction::Client) => TransactionKind::ClientInvite,
            (Method::Invite, Direction::Server) => TransactionKind::ServerInvite,
            (_, Direction::Client) => TransactionKind::ClientNonInvite,
            (_, Direction::Server) => TransactionKind::ServerNonInvite,
        }
    }
}
