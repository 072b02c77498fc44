//! The implicit subscription RFC 3515 attaches to every REFER (§4.6).

use std::time::{Duration, Instant};

use rsip::Uri;

use crate::refer::replaces::ReplacesInfo;

/// `(from_tag, to_tag, cseq_of_refer)` — unique per REFER within a dialog,
/// since a dialog may send more than one REFER over its lifetime (§9 design
/// note: chosen over the source's inconsistent id scheme for this reason).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId {
    pub from_tag: String,
    pub to_tag: String,
    pub cseq_of_refer: u32,
}

impl SubscriptionId {
    pub fn new(from_tag: impl Into<String>, to_tag: impl Into<String>, cseq_of_refer: u32) -> Self {
        Self { from_tag: from_tag.into(), to_tag: to_tag.into(), cseq_of_refer }
    }
}

/// Progress of the request REFER asked the recipient to place, as reported
/// by successive NOTIFYs (outgoing side) or tracked locally while the
/// application drives the referred dialog (incoming side).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferStatus {
    Pending,
    Accepted,
    Trying,
    Proceeding,
    Success,
    Failed,
}

impl ReferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReferStatus::Success | ReferStatus::Failed)
    }
}

/// One REFER's implicit subscription.
#[derive(Debug, Clone)]
pub struct ReferSubscription {
    pub id: SubscriptionId,
    pub refer_to: Uri,
    pub replaces: Option<ReplacesInfo>,
    status: ReferStatus,
    pub active: bool,
    pub cseq_of_refer: u32,
    pub expiry_at: Instant,
}

impl ReferSubscription {
    pub fn new(id: SubscriptionId, refer_to: Uri, replaces: Option<ReplacesInfo>, expiry: Duration) -> Self {
        let cseq_of_refer = id.cseq_of_refer;
        Self { id, refer_to, replaces, status: ReferStatus::Pending, active: true, cseq_of_refer, expiry_at: Instant::now() + expiry }
    }

    pub fn status(&self) -> ReferStatus {
        self.status
    }

    pub fn is_expired(&self) -> bool {
        self.active && Instant::now() >= self.expiry_at
    }

    /// Advances `status`. A no-op once the subscription has already reached
    /// a terminal status, per the idempotence invariant in §8: calling this
    /// again with the same or a different terminal status changes nothing.
    pub fn update_status(&mut self, status: ReferStatus) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        if status.is_terminal() {
            self.active = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ReferSubscription {
        let id = SubscriptionId::new("tag-a", "tag-b", 2);
        let uri = Uri::try_from("sip:carol@example.com").unwrap();
        ReferSubscription::new(id, uri, None, Duration::from_secs(180))
    }

    #[test]
    fn update_status_is_idempotent_once_terminal() {
        let mut sub = sample();
        sub.update_status(ReferStatus::Success);
        assert_eq!(sub.status(), ReferStatus::Success);
        sub.update_status(ReferStatus::Failed);
        assert_eq!(sub.status(), ReferStatus::Success, "a second update after terminal status must be a no-op");
        assert!(!sub.active);
    }

    #[test]
    fn progresses_through_non_terminal_statuses() {
        let mut sub = sample();
        sub.update_status(ReferStatus::Accepted);
        assert_eq!(sub.status(), ReferStatus::Accepted);
        sub.update_status(ReferStatus::Trying);
        assert_eq!(sub.status(), ReferStatus::Trying);
        assert!(sub.active);
    }
}
