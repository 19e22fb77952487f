//! Process-wide call-probe table (§3 "Stalker (process-wide)", §4.1
//! "add_call_probe/remove_call_probe").
//!
//! Guarded externally by the facade's `probe_lock` spinlock (§5); this
//! module only holds the bookkeeping structures themselves, the way
//! [`crate::ctx::CodeState`] holds what `code_lock` protects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::events::ProbeId;
use crate::traits::CallProbe;

struct ProbeEntry {
    target: usize,
    callback: Arc<dyn CallProbe>,
    user_data: usize,
}

/// `(ProbeId -> target address)` and `(target address -> list of probes)`,
/// both described in §3 as guarded by the same spinlock.
#[derive(Default)]
pub struct ProbeTable {
    by_id: HashMap<ProbeId, ProbeEntry>,
    by_target: HashMap<usize, Vec<ProbeId>>,
    next_id: AtomicU64,
}

impl ProbeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a probe, returning its freshly assigned id and `true` iff
    /// this is the *first* probe registered for `target` (§4.1: "Adding the
    /// first probe for a target ... must invalidate any existing
    /// translations of that target").
    pub fn add(
        &mut self,
        target: usize,
        callback: Arc<dyn CallProbe>,
        user_data: usize,
    ) -> (ProbeId, bool) {
        let id = ProbeId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.by_id.insert(
            id,
            ProbeEntry {
                target,
                callback,
                user_data,
            },
        );
        let list = self.by_target.entry(target).or_default();
        let was_empty = list.is_empty();
        list.push(id);
        (id, was_empty)
    }

    /// Deregister a probe, returning its target address and `true` iff it
    /// was the *last* probe for that target (§4.1: "removing the last [probe]
    /// must invalidate").
    pub fn remove(&mut self, id: ProbeId) -> Option<(usize, bool)> {
        let entry = self.by_id.remove(&id)?;
        let now_empty = if let Some(list) = self.by_target.get_mut(&entry.target) {
            list.retain(|&pid| pid != id);
            let empty = list.is_empty();
            if empty {
                self.by_target.remove(&entry.target);
            }
            empty
        } else {
            true
        };
        Some((entry.target, now_empty))
    }

    pub fn has_probes_for(&self, target: usize) -> bool {
        self.by_target.contains_key(&target)
    }

    pub fn probes_for(&self, target: usize) -> impl Iterator<Item = (&Arc<dyn CallProbe>, usize)> {
        self.by_target
            .get(&target)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.by_id.get(id))
            .map(|e| (&e.callback, e.user_data))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl CallProbe for Noop {
        fn on_call(&self, _ctx: &mut crate::cpu::CpuContext, _user_data: usize) {}
    }

    #[test]
    fn first_add_and_last_remove_are_flagged() {
        let mut t = ProbeTable::new();
        let (id1, first) = t.add(0x1000, Arc::new(Noop), 0);
        assert!(first);
        let (id2, first2) = t.add(0x1000, Arc::new(Noop), 0);
        assert!(!first2);
        let (_, last) = t.remove(id1).unwrap();
        assert!(!last, "one probe remains");
        let (_, last2) = t.remove(id2).unwrap();
        assert!(last2);
        assert!(!t.has_probes_for(0x1000));
    }

    #[test]
    fn ids_are_monotonically_increasing() {
        let mut t = ProbeTable::new();
        let (a, _) = t.add(1, Arc::new(Noop), 0);
        let (b, _) = t.add(2, Arc::new(Noop), 0);
        assert!(b.0 > a.0);
    }
}
