//! Dialog identification (§3).

use std::fmt;

/// `(Call-ID, local-tag, remote-tag)` — unique per dialog within one stack.
/// `remote_tag` is empty until the first dialog-creating response/request
/// supplies it; the registry re-keys the dialog at that point
/// ([`crate::registry::DialogRegistry::rekey`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogKey {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogKey {
    pub fn new(call_id: impl Into<String>, local_tag: impl Into<String>, remote_tag: impl Into<String>) -> Self {
        Self { call_id: call_id.into(), local_tag: local_tag.into(), remote_tag: remote_tag.into() }
    }

    /// The same dialog as seen from the other peer: local and remote tags
    /// swapped. Used by the registry to match in-dialog requests whose
    /// To/From tags are the inverse of ours.
    pub fn swapped(&self) -> DialogKey {
        DialogKey { call_id: self.call_id.clone(), local_tag: self.remote_tag.clone(), remote_tag: self.local_tag.clone() }
    }

    pub fn is_early(&self) -> bool {
        self.remote_tag.is_empty()
    }
}

impl fmt::Display for DialogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.call_id, self.local_tag, self.remote_tag)
    }
}
