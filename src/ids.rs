//! Collision-free Call-ID, tag and branch generation without a syscall on
//! the hot path (§4.2).
//!
//! Each identifier is `hex(random_bytes) + hex(node_id) + hex(counter)`: 8
//! random bytes from a CSPRNG seeded once at pool construction, a 4-byte
//! `node_id` derived from the configured local host/port, and a 64-bit
//! atomic counter that never repeats for the lifetime of the pool. The
//! random+node+counter combination keeps the collision probability at or
//! below 2⁻⁶⁴ per call even across multiple pool instances sharing a host.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngCore;
use tokio::sync::Notify;
use tracing::trace;

use crate::observability::MetricsSink;

const LOW_WATER_RATIO: f64 = 0.25;

fn node_id_from_host_port(host: &str, port: u16) -> [u8; 4] {
    // FNV-1a over "host:port", truncated to 4 bytes. Not cryptographic; it
    // only needs to make two stacks on different hosts unlikely to collide.
    let mut hash: u32 = 0x811c9dc5;
    for byte in host.as_bytes().iter().chain(port.to_be_bytes().iter()) {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x01000193);
    }
    hash.to_be_bytes()
}

struct Inner {
    random_seed: [u8; 8],
    node_id: [u8; 4],
    counter: AtomicU64,
    call_ids: Mutex<VecDeque<String>>,
    tags: Mutex<VecDeque<String>>,
    branches: Mutex<VecDeque<String>>,
    target_fill: usize,
    refill_notify: Notify,
}

impl Inner {
    fn format_raw(&self) -> String {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut rng = rand::thread_rng();
        let mut entropy = [0u8; 8];
        rng.fill_bytes(&mut entropy);
        // Mix the pool's fixed seed in so every id also carries pool identity,
        // not just per-call entropy.
        for i in 0..8 {
            entropy[i] ^= self.random_seed[i];
        }
        format!(
            "{}{}{:016x}",
            hex(&entropy),
            hex(&self.node_id),
            counter
        )
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Pre-filled pool of Call-IDs, tags and branches, topped up in the
/// background once any buffer crosses its low-water mark.
pub struct IdGeneratorPool {
    inner: Arc<Inner>,
}

impl IdGeneratorPool {
    /// Creates a pool and spawns its background refill task. `target_fill`
    /// is the number of spare ids kept ready in each of the three buffers.
    pub fn new(host: &str, port: u16, target_fill: usize, metrics: Arc<dyn MetricsSink>) -> Self {
        let mut seed = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut seed);

        let inner = Arc::new(Inner {
            random_seed: seed,
            node_id: node_id_from_host_port(host, port),
            counter: AtomicU64::new(0),
            call_ids: Mutex::new(VecDeque::with_capacity(target_fill)),
            tags: Mutex::new(VecDeque::with_capacity(target_fill)),
            branches: Mutex::new(VecDeque::with_capacity(target_fill)),
            target_fill,
            refill_notify: Notify::new(),
        });

        fill_all(&inner);

        let refill_inner = inner.clone();
        tokio::spawn(async move {
            loop {
                refill_inner.refill_notify.notified().await;
                fill_all(&refill_inner);
            }
        });

        // metrics isn't wired into the background loop (it has nothing to
        // report yet); keep the handle so Stack can share one sink.
        let _ = metrics;

        Self { inner }
    }

    fn pop(&self, buffer: &Mutex<VecDeque<String>>, metrics: &dyn MetricsSink, on_hit: impl Fn(&dyn MetricsSink)) -> String {
        let popped = {
            let mut guard = buffer.lock();
            let value = guard.pop_front();
            if guard.len() < low_water(self.inner.target_fill) {
                self.inner.refill_notify.notify_one();
            }
            value
        };
        match popped {
            Some(id) => {
                on_hit(metrics);
                id
            }
            None => {
                metrics.id_pool_miss();
                trace!("id pool exhausted, generating on demand");
                self.inner.format_raw()
            }
        }
    }

    pub fn get_call_id(&self, metrics: &dyn MetricsSink) -> String {
        self.pop(&self.inner.call_ids, metrics, |m| m.id_pool_hit())
    }

    pub fn get_tag(&self, metrics: &dyn MetricsSink) -> String {
        self.pop(&self.inner.tags, metrics, |m| m.id_pool_hit())
    }

    pub fn get_branch(&self, metrics: &dyn MetricsSink) -> String {
        let raw = self.pop(&self.inner.branches, metrics, |m| m.id_pool_hit());
        strip_branch_prefix(raw)
    }

    /// Smallest of the three buffers' fill levels against `target_fill`, as a
    /// percentage. Used by `Stack::health_check` as a coarse "is the
    /// background refill loop keeping up" signal.
    pub fn fill_percent(&self) -> u8 {
        let lens = [self.inner.call_ids.lock().len(), self.inner.tags.lock().len(), self.inner.branches.lock().len()];
        let min_len = *lens.iter().min().unwrap_or(&0);
        let target = self.inner.target_fill.max(1);
        ((min_len as f64 / target as f64) * 100.0).min(100.0) as u8
    }
}

fn low_water(target: usize) -> usize {
    ((target as f64) * LOW_WATER_RATIO).ceil() as usize
}

fn fill_all(inner: &Arc<Inner>) {
    fill_buffer(&inner.call_ids, inner.target_fill, |inner| format!("{}@softphone", inner.format_raw()), inner);
    fill_buffer(&inner.tags, inner.target_fill, |inner| inner.format_raw(), inner);
    fill_buffer(&inner.branches, inner.target_fill, |inner| format!("z9hG4bK{}", inner.format_raw()), inner);
}

fn fill_buffer(
    buffer: &Mutex<VecDeque<String>>,
    target: usize,
    make: impl Fn(&Inner) -> String,
    inner: &Inner,
) {
    let mut guard = buffer.lock();
    while guard.len() < target {
        guard.push_back(make(inner));
    }
}

fn strip_branch_prefix(raw: String) -> String {
    // Branches popped from the buffer already carry the magic cookie from
    // `fill_all`; generated-on-demand ones do not, so normalize here.
    if raw.starts_with("z9hG4bK") {
        raw
    } else {
        format!("z9hG4bK{raw}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::NoopMetricsSink;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn pool() -> IdGeneratorPool {
        IdGeneratorPool::new("127.0.0.1", 5060, 64, Arc::new(NoopMetricsSink::default()))
    }

    #[tokio::test]
    async fn call_ids_end_with_softphone_suffix() {
        let pool = pool();
        let metrics = NoopMetricsSink::default();
        let id = pool.get_call_id(&metrics);
        assert!(id.ends_with("@softphone"), "unexpected call-id: {id}");
    }

    #[tokio::test]
    async fn branches_carry_magic_cookie() {
        let pool = pool();
        let metrics = NoopMetricsSink::default();
        for _ in 0..100 {
            let branch = pool.get_branch(&metrics);
            assert!(branch.starts_with("z9hG4bK"));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn no_duplicates_across_many_concurrent_calls() {
        let pool = Arc::new(pool());
        let metrics = Arc::new(NoopMetricsSink::default());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let pool = pool.clone();
            let metrics = metrics.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::with_capacity(500);
                for _ in 0..500 {
                    ids.push(pool.get_call_id(metrics.as_ref()));
                }
                ids
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "duplicate id generated");
            }
        }
        assert_eq!(seen.len(), 10_000);
    }
}
