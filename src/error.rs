//! Error taxonomy for the dialog/transaction/timer core.
//!
//! Internal code paths return [`DialogError`]; the thinner [`ApiError`] in
//! [`crate::api`] re-buckets these for application callers that don't want to
//! match on every internal variant.

use thiserror::Error;

/// Result alias used throughout the core.
pub type DialogResult<T> = Result<T, DialogError>;

/// Errors produced by dialog, transaction and timer operations.
///
/// Variant names track the taxonomy kinds (not concrete error *types*) the
/// core promises: `InvalidState`, `DuplicateKey`, `Timeout`,
/// `TransportFailure`, `ProtocolViolation`, `ResourceExhaustion`,
/// `Cancelled`, `Recovered`.
#[derive(Debug, Error, Clone)]
pub enum DialogError {
    /// Operation rejected because the dialog/transaction is not in an allowed state.
    #[error("invalid state for {operation}: expected {expected}, found {actual}")]
    InvalidState {
        operation: &'static str,
        expected: &'static str,
        actual: &'static str,
    },

    /// Registry insertion rejected because the key is already live.
    #[error("duplicate dialog key: {key}")]
    DuplicateKey { key: String },

    /// No dialog is registered under the given key or id.
    #[error("dialog not found: {0}")]
    DialogNotFound(String),

    /// No transaction is registered under the given id.
    #[error("transaction not found: {0}")]
    TransactionNotFound(String),

    /// Timer B/F/H expiry, or a REFER subscription that expired unanswered.
    #[error("timeout: {context}")]
    Timeout { context: String },

    /// Transport `send` failed.
    #[error("transport failure: {reason} (retryable={retryable})")]
    TransportFailure { reason: String, retryable: bool },

    /// A required header was missing, a URI was malformed, a CSeq regressed,
    /// a Replaces header pointed at an unknown dialog, etc.
    #[error("protocol violation: {detail}")]
    ProtocolViolation { detail: String },

    /// The stack's configured dialog/transaction limits were exceeded.
    #[error("resource exhausted: {limit}")]
    ResourceExhaustion { limit: String },

    /// The operation's cancellation handle fired before completion.
    #[error("operation cancelled")]
    Cancelled,

    /// An application callback panicked; the panic was caught and isolated.
    #[error("callback panicked: {panic_message}")]
    Recovered { panic_message: String },
}

impl DialogError {
    pub fn invalid_state(operation: &'static str, expected: &'static str, actual: &'static str) -> Self {
        DialogError::InvalidState { operation, expected, actual }
    }

    pub fn protocol_error(detail: impl Into<String>) -> Self {
        DialogError::ProtocolViolation { detail: detail.into() }
    }

    pub fn dialog_not_found(id: impl Into<String>) -> Self {
        DialogError::DialogNotFound(id.into())
    }

    pub fn transaction_not_found(id: impl Into<String>) -> Self {
        DialogError::TransactionNotFound(id.into())
    }

    pub fn timeout(context: impl Into<String>) -> Self {
        DialogError::Timeout { context: context.into() }
    }

    pub fn transport_failure(reason: impl Into<String>, retryable: bool) -> Self {
        DialogError::TransportFailure { reason: reason.into(), retryable }
    }

    /// True for errors a caller may reasonably retry the same operation for.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DialogError::TransportFailure { retryable: true, .. })
    }
}
