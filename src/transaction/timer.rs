//! Per-transaction timer state machine (§4.5).
//!
//! A timer never fires a callback directly: `arm` schedules a `tokio::time`
//! sleep that, on completion, pushes a command into the owning
//! transaction's event-loop channel (see [`super::manager::TransactionManager`]).
//! This keeps "all events for one transaction are processed sequentially"
//! true without putting a lock around transaction state.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::config::TimerSettings;

/// Which RFC 3261 §17 timer a fired/armed instance corresponds to. Only used
/// for logging and for picking the right backoff formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerName {
    /// Client INVITE retransmit (unreliable transports only).
    A,
    /// Client INVITE transaction timeout.
    B,
    /// Client INVITE `Completed` absorb window for duplicate final
    /// responses (`64·T1` unreliable, `0s` reliable).
    D,
    /// Client non-INVITE retransmit.
    E,
    /// Client non-INVITE transaction timeout.
    F,
    /// Server INVITE response retransmit.
    G,
    /// Server INVITE wait-for-ACK timeout (`64·T1` unreliable, `0s` reliable).
    H,
    /// Server INVITE absorb-retransmitted-ACK window (`T4` unreliable, `0s` reliable).
    I,
    /// Server non-INVITE absorb-retransmitted-request window (`64·T1` unreliable, `0s` reliable).
    J,
    /// Client non-INVITE absorb-stray-response window (`T4` unreliable, `0s` reliable).
    K,
}

/// Lifecycle of one armed timer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Idle,
    Armed,
    Fired,
    Cancelled,
}

/// `delay_n = min(T1 << n, T2)`, the exponential-backoff-capped-at-T2
/// schedule used by Timers A, E and G.
pub fn backoff_delay(settings: &TimerSettings, attempt: u32) -> Duration {
    let doubled = settings.t1.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    std::cmp::min(doubled, settings.t2)
}

/// Handle to one outstanding `tokio::time::sleep` backing an armed timer.
/// Dropping or calling [`TimerHandle::cancel`] aborts the task; the
/// transaction event loop never observes a timer fire after cancellation
/// because `abort` races the channel send and the receiver drops commands
/// for transactions it has already removed.
pub struct TimerHandle {
    name: TimerName,
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn name(&self) -> TimerName {
        self.name
    }

    pub fn cancel(self) {
        trace!(timer = ?self.name, "cancelling timer");
        self.task.abort();
    }
}

/// Arms `name` to fire after `delay`, sending `command` into `sink` when it
/// does. `command` is cloned at fire time so the caller can reuse the same
/// enum variant for every timer of a transaction's run.
pub fn arm<T>(name: TimerName, delay: Duration, sink: mpsc::Sender<T>, command: T) -> TimerHandle
where
    T: Send + 'static,
{
    let task = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = sink.send(command).await;
    });
    TimerHandle { name, task }
}

/// The full set of timers a transaction may have armed at once. Only one of
/// each named timer is ever outstanding per transaction; re-arming replaces
/// the previous handle (and implicitly cancels it via `Drop`/`JoinHandle`
/// replacement — the old task is aborted when its handle is dropped only if
/// the caller explicitly cancels it first, since `JoinHandle` alone does not
/// abort on drop).
#[derive(Default)]
pub struct TimerSet {
    pub retransmit: Option<TimerHandle>,
    pub timeout: Option<TimerHandle>,
    pub wait_ack: Option<TimerHandle>,
    pub absorb: Option<TimerHandle>,
}

impl TimerSet {
    pub fn cancel_all(&mut self) {
        for handle in [self.retransmit.take(), self.timeout.take(), self.wait_ack.take(), self.absorb.take()] {
            if let Some(handle) = handle {
                handle.cancel();
            }
        }
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped_at_t2() {
        let settings = TimerSettings { t1: Duration::from_millis(500), t2: Duration::from_secs(4), t4: Duration::from_secs(5) };
        assert_eq!(backoff_delay(&settings, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(&settings, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(&settings, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(&settings, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(&settings, 10), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn armed_timer_fires_command_after_delay() {
        let (tx, mut rx) = mpsc::channel(1);
        let _handle = arm(TimerName::A, Duration::from_millis(500), tx, "fired");
        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(rx.recv().await, Some("fired"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::channel::<&'static str>(1);
        let handle = arm(TimerName::A, Duration::from_millis(500), tx, "fired");
        handle.cancel();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }
}
