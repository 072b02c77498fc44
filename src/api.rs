//! Application-facing API surface: request options and the simplified
//! [`ApiError`] consumers can match on without learning the full internal
//! taxonomy in [`crate::error`].

use std::collections::HashMap;
use std::fmt;

use rsip::Uri;

use crate::body::Body;
use crate::error::DialogError;
use crate::refer::ReplacesInfo;

/// Simplified, high-level error bucket for application code.
#[derive(Debug, Clone)]
pub enum ApiError {
    Configuration { message: String },
    Network { message: String },
    Protocol { message: String },
    Dialog { message: String },
    Internal { message: String },
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Configuration { message } => write!(f, "configuration error: {message}"),
            ApiError::Network { message } => write!(f, "network error: {message}"),
            ApiError::Protocol { message } => write!(f, "protocol error: {message}"),
            ApiError::Dialog { message } => write!(f, "dialog error: {message}"),
            ApiError::Internal { message } => write!(f, "internal error: {message}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<DialogError> for ApiError {
    fn from(err: DialogError) -> Self {
        match err {
            DialogError::InvalidState { .. } | DialogError::Cancelled => {
                ApiError::Dialog { message: err.to_string() }
            }
            DialogError::DuplicateKey { .. }
            | DialogError::DialogNotFound(_)
            | DialogError::TransactionNotFound(_) => ApiError::Dialog { message: err.to_string() },
            DialogError::Timeout { .. } | DialogError::TransportFailure { .. } => {
                ApiError::Network { message: err.to_string() }
            }
            DialogError::ProtocolViolation { .. } => ApiError::Protocol { message: err.to_string() },
            DialogError::ResourceExhaustion { .. } => ApiError::Internal { message: err.to_string() },
            DialogError::Recovered { .. } => ApiError::Internal { message: err.to_string() },
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Options for an outgoing INVITE (new or re-INVITE).
#[derive(Debug, Clone, Default)]
pub struct InviteOpts {
    pub body: Option<Body>,
    pub extra_headers: Vec<rsip::Header>,
    pub from_display_name: Option<String>,
    pub contact_params: HashMap<String, Option<String>>,
    pub subject: Option<String>,
    pub user_agent: Option<String>,
    /// RFC 3325 P-Asserted-Identity.
    pub p_asserted_identity: Option<Uri>,
}

/// Options for an outgoing (or application-built) response.
#[derive(Debug, Clone, Default)]
pub struct ResponseOpts {
    pub body: Option<Body>,
    pub extra_headers: Vec<rsip::Header>,
    pub contact_params: HashMap<String, Option<String>>,
    pub user_agent: Option<String>,
    pub p_asserted_identity: Option<Uri>,
}

/// Parameters for `Dialog::refer_replace` (attended transfer).
#[derive(Debug, Clone)]
pub struct ReferReplaceTarget {
    pub target: Uri,
    pub replaces: ReplacesInfo,
}
