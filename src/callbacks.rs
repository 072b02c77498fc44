//! Cross-cutting concurrency primitives shared by [`crate::dialog`] and
//! [`crate::refer`]: at-most-once close sentinels and panic-isolated
//! callback invocation (§4.7 of the spec).

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::error::DialogError;
use crate::observability::MetricsSink;

/// Idempotent close sentinel: only the first of any number of concurrent
/// `fire` calls runs the supplied closure.
#[derive(Debug, Default)]
pub struct CloseOnce {
    fired: AtomicBool,
}

impl CloseOnce {
    pub fn new() -> Self {
        Self { fired: AtomicBool::new(false) }
    }

    pub fn is_closed(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Runs `effect` exactly once across all callers racing on this sentinel.
    /// Returns `true` if this call was the one that ran it.
    pub fn fire(&self, effect: impl FnOnce()) -> bool {
        if self.fired.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            effect();
            true
        } else {
            false
        }
    }
}

/// An append-only list of application callbacks. Registration is cheap
/// (push under lock); invocation snapshots the list, releases the lock, then
/// calls each callback outside of any owning-entity mutation lock.
pub struct CallbackList<F: ?Sized> {
    callbacks: RwLock<Vec<Arc<F>>>,
}

impl<F: ?Sized> Default for CallbackList<F> {
    fn default() -> Self {
        Self { callbacks: RwLock::new(Vec::new()) }
    }
}

impl<F: ?Sized> CallbackList<F> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, callback: Arc<F>) {
        self.callbacks.write().push(callback);
    }

    fn snapshot(&self) -> Vec<Arc<F>> {
        self.callbacks.read().clone()
    }
}

impl<A> CallbackList<dyn Fn(&A) + Send + Sync> {
    /// Invokes every registered callback with `arg`, isolating panics so a
    /// single bad callback never prevents the rest from running. Panics are
    /// logged and counted via `metrics`; they never propagate to the caller.
    pub fn invoke_all(&self, arg: &A, metrics: &dyn MetricsSink) {
        for callback in self.snapshot() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| callback(arg)));
            if let Err(payload) = result {
                let message = panic_message(&payload);
                warn!(panic = %message, "application callback panicked; isolated");
                metrics.callback_panic();
                let _ = DialogError::Recovered { panic_message: message };
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::NoopMetricsSink;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn close_once_runs_exactly_once_under_n_concurrent_callers() {
        let close = Arc::new(CloseOnce::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let close = close.clone();
            let hits = hits.clone();
            handles.push(std::thread::spawn(move || {
                close.fire(|| {
                    hits.fetch_add(1, Ordering::SeqCst);
                });
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(close.is_closed());
    }

    #[test]
    fn panicking_callback_does_not_block_the_rest() {
        let list: CallbackList<dyn Fn(&i32) + Send + Sync> = CallbackList::new();
        let calls = Arc::new(AtomicUsize::new(0));

        list.register(Arc::new(|_: &i32| panic!("boom")));
        let calls2 = calls.clone();
        list.register(Arc::new(move |_: &i32| {
            calls2.fetch_add(1, Ordering::SeqCst);
        }));

        let metrics = NoopMetricsSink::default();
        list.invoke_all(&42, &metrics);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.panics(), 1);
    }
}
