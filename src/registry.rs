//! The sharded dialog registry (§4.1): the one piece of process-wide shared
//! mutable state in the stack. Hand-rolled sharding rather than `dashmap`
//! because `rekey` needs explicit control over which two shard locks it
//! takes and in what order (§5) — a plain `dashmap::DashMap` does not expose
//! that.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::dialog::{Dialog, DialogKey};
use crate::error::{DialogError, DialogResult};

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Sharded `HashMap<DialogKey, Arc<Dialog>>`. Shard count must be a power of
/// two (enforced by [`crate::config::StackConfig::validate`]) so the hash's
/// low bits select a shard uniformly.
pub struct DialogRegistry {
    shards: Vec<RwLock<HashMap<DialogKey, Arc<Dialog>>>>,
    mask: u64,
}

impl DialogRegistry {
    pub fn new(shard_count: usize) -> Self {
        assert!(shard_count.is_power_of_two() && shard_count >= 8, "shard_count must be a power of two >= 8");
        let shards = (0..shard_count).map(|_| RwLock::new(HashMap::new())).collect();
        Self { shards, mask: (shard_count as u64) - 1 }
    }

    fn shard_index(&self, call_id: &str) -> usize {
        (fnv1a(call_id.as_bytes()) & self.mask) as usize
    }

    fn shard_index_for_key(&self, key: &DialogKey) -> usize {
        self.shard_index(&key.call_id)
    }

    /// Inserts a new dialog. Fails with `DuplicateKey` if `key` is already
    /// live — the caller should treat that as a protocol error (e.g. a
    /// retransmitted INVITE racing dialog creation) rather than overwrite.
    pub fn insert(&self, dialog: Arc<Dialog>) -> DialogResult<()> {
        let key = dialog.key_snapshot();
        let idx = self.shard_index_for_key(&key);
        let mut shard = self.shards[idx].write();
        if shard.contains_key(&key) {
            return Err(DialogError::DuplicateKey { key: key.to_string() });
        }
        shard.insert(key, dialog);
        Ok(())
    }

    pub fn get(&self, key: &DialogKey) -> Option<Arc<Dialog>> {
        let idx = self.shard_index_for_key(key);
        self.shards[idx].read().get(key).cloned()
    }

    pub fn remove(&self, key: &DialogKey) -> Option<Arc<Dialog>> {
        let idx = self.shard_index_for_key(key);
        self.shards[idx].write().remove(key)
    }

    /// Finds a dialog by Call-ID alone, trying both tag orderings since an
    /// in-dialog request's From/To tags are the inverse of how the local
    /// side stored them (used when an incoming request's own tags haven't
    /// been matched to a `DialogKey` yet).
    pub fn lookup_by_call_id(&self, call_id: &str, local_tag: &str, remote_tag: &str) -> Option<Arc<Dialog>> {
        let direct = DialogKey::new(call_id, local_tag, remote_tag);
        if let Some(dialog) = self.get(&direct) {
            return Some(dialog);
        }
        let swapped = direct.swapped();
        self.get(&swapped)
    }

    /// Atomically moves a dialog from `old_key` to `new_key` (e.g. the
    /// remote tag becoming known on the first dialog-creating response).
    /// Always locks the lower shard index first, regardless of which shard
    /// is "old" vs "new", so two concurrent rekeys can never deadlock on
    /// each other.
    pub fn rekey(&self, old_key: &DialogKey, new_key: DialogKey) -> DialogResult<()> {
        let old_idx = self.shard_index_for_key(old_key);
        let new_idx = self.shard_index_for_key(&new_key);

        if old_idx == new_idx {
            let mut shard = self.shards[old_idx].write();
            let dialog = shard.remove(old_key).ok_or_else(|| DialogError::dialog_not_found(old_key.to_string()))?;
            if shard.contains_key(&new_key) {
                shard.insert(old_key.clone(), dialog);
                return Err(DialogError::DuplicateKey { key: new_key.to_string() });
            }
            dialog.set_key(new_key.clone());
            shard.insert(new_key, dialog);
            return Ok(());
        }

        let (first, second) = if old_idx < new_idx { (old_idx, new_idx) } else { (new_idx, old_idx) };
        let mut guards: Vec<_> = Vec::with_capacity(2);
        guards.push(self.shards[first].write());
        guards.push(self.shards[second].write());

        let (old_guard_pos, new_guard_pos) = if old_idx < new_idx { (0, 1) } else { (1, 0) };
        let dialog = guards[old_guard_pos]
            .remove(old_key)
            .ok_or_else(|| DialogError::dialog_not_found(old_key.to_string()))?;
        if guards[new_guard_pos].contains_key(&new_key) {
            guards[old_guard_pos].insert(old_key.clone(), dialog);
            return Err(DialogError::DuplicateKey { key: new_key.to_string() });
        }
        dialog.set_key(new_key.clone());
        guards[new_guard_pos].insert(new_key, dialog);
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    /// Runs `callback` once per live dialog. Never holds a shard's lock
    /// across the callback: each shard's entries are cloned into a `Vec`
    /// first, the lock is released, and only then does `callback` run.
    pub fn for_each(&self, mut callback: impl FnMut(&Arc<Dialog>)) {
        for shard in &self.shards {
            let snapshot: Vec<Arc<Dialog>> = shard.read().values().cloned().collect();
            for dialog in &snapshot {
                callback(dialog);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackConfig;
    use crate::dialog::Role;
    use crate::observability::NoopMetricsSink;
    use std::sync::Arc as StdArc;

    fn test_dialog(call_id: &str, local_tag: &str, remote_tag: &str) -> Arc<Dialog> {
        let key = DialogKey::new(call_id, local_tag, remote_tag);
        let local_uri = rsip::Uri::try_from("sip:alice@example.com").unwrap();
        let remote_uri = rsip::Uri::try_from("sip:bob@example.com").unwrap();
        Arc::new(Dialog::new_for_test(key, Role::Uac, local_uri, remote_uri, StdArc::new(NoopMetricsSink::default())))
    }

    #[test]
    fn insert_then_get_round_trips() {
        let registry = DialogRegistry::new(StackConfig::default().registry_shards);
        let dialog = test_dialog("call-1", "a", "b");
        registry.insert(dialog.clone()).unwrap();
        assert!(registry.get(&DialogKey::new("call-1", "a", "b")).is_some());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let registry = DialogRegistry::new(8);
        registry.insert(test_dialog("call-2", "a", "b")).unwrap();
        let err = registry.insert(test_dialog("call-2", "a", "b")).unwrap_err();
        assert!(matches!(err, DialogError::DuplicateKey { .. }));
    }

    #[test]
    fn rekey_moves_dialog_to_new_key() {
        let registry = DialogRegistry::new(8);
        let dialog = test_dialog("call-3", "a", "");
        registry.insert(dialog).unwrap();

        let old_key = DialogKey::new("call-3", "a", "");
        let new_key = DialogKey::new("call-3", "a", "b");
        registry.rekey(&old_key, new_key.clone()).unwrap();

        assert!(registry.get(&old_key).is_none());
        assert!(registry.get(&new_key).is_some());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn lookup_by_call_id_matches_swapped_tags() {
        let registry = DialogRegistry::new(8);
        registry.insert(test_dialog("call-4", "local", "remote")).unwrap();
        let found = registry.lookup_by_call_id("call-4", "remote", "local").unwrap();
        assert_eq!(found.key_snapshot(), DialogKey::new("call-4", "local", "remote"));
    }

    #[test]
    fn for_each_never_holds_lock_across_callback() {
        let registry = DialogRegistry::new(8);
        for i in 0..20 {
            registry.insert(test_dialog(&format!("call-{i}"), "a", "b")).unwrap();
        }
        let mut seen = 0;
        registry.for_each(|dialog| {
            // Reentrant registry call from inside the callback would deadlock
            // if `for_each` held a shard lock while invoking it.
            let _ = registry.get(&dialog.key_snapshot());
            seen += 1;
        });
        assert_eq!(seen, 20);
    }

    #[test]
    fn concurrent_inserts_across_many_tasks_all_land() {
        use std::thread;
        let registry = StdArc::new(DialogRegistry::new(32));
        let mut handles = Vec::new();
        for t in 0..16 {
            let registry = registry.clone();
            handles.push(thread::spawn(move || {
                for i in 0..50 {
                    let call_id = format!("call-{t}-{i}");
                    registry.insert(test_dialog(&call_id, "a", "b")).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.count(), 16 * 50);
    }
}
