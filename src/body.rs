//! Opaque message bodies.
//!
//! SDP negotiation and media are out of scope for this crate: a body is
//! just a `(content_type, bytes)` pair that the core stores, forwards, and
//! never interprets — except for `message/sipfrag`, whose contents the REFER
//! subsystem builds and parses itself (see [`crate::refer::sipfrag`]).

use bytes::Bytes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Body {
    pub content_type: String,
    pub bytes: Bytes,
}

impl Body {
    pub fn new(content_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self { content_type: content_type.into(), bytes: bytes.into() }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}
