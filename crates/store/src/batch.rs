//! Batching queue for watch events: drops re-deliveries and hands batches out in
//! revision order, whatever order the watches delivered them in.

use std::collections::VecDeque;

use kview_core::{ObjectRef, Revision, WatchEvent};
use rustc_hash::FxHashMap;
use tracing::warn;

type Key = (ObjectRef, Revision, bool);

/// Bounded queue keyed by `(ref, revision, deleted)` with FIFO eviction.
pub struct ChangeBatcher {
    map: FxHashMap<Key, WatchEvent>,
    order: VecDeque<Key>,
    cap: usize,
    dropped: u64,
}

impl ChangeBatcher {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1), dropped: 0 }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn push(&mut self, event: WatchEvent) {
        let key = match ObjectRef::of(event.object()) {
            Ok(r) => (r, event.revision(), event.is_deleted()),
            Err(e) => {
                warn!(error = %e, "watch event without identity; dropped");
                return;
            }
        };
        if self.map.contains_key(&key) {
            return;
        }
        if self.order.len() >= self.cap {
            if let Some(old) = self.order.pop_front() {
                self.map.remove(&old);
                self.dropped += 1;
                metrics::counter!("batcher_dropped_total", 1u64);
            }
        }
        self.order.push_back(key.clone());
        self.map.insert(key, event);
    }

    /// Drain everything queued, sorted by revision (stable for equal revisions).
    pub fn drain_ready(&mut self) -> Vec<WatchEvent> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(ev) = self.map.remove(&key) {
                out.push(ev);
            }
        }
        out.sort_by_key(|e| e.revision());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kview_core::object::new_object;
    use kview_core::ObjectType;
    use serde_json::json;

    fn ev(name: &str, rv: &str) -> WatchEvent {
        let mut o = new_object(&ObjectType::new("v1", "Pod"), Some("ns"), name, json!({}));
        o.metadata.resource_version = Some(rv.into());
        WatchEvent::Applied(o)
    }

    #[test]
    fn dedupes_and_sorts_by_revision() {
        let mut b = ChangeBatcher::with_capacity(16);
        b.push(ev("b", "30"));
        b.push(ev("a", "10"));
        b.push(ev("a", "10"));
        b.push(ev("a", "20"));
        assert_eq!(b.len(), 3);
        let revs: Vec<_> = b.drain_ready().iter().map(|e| e.revision()).collect();
        assert_eq!(revs, vec![10, 20, 30]);
        assert!(b.is_empty());
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut b = ChangeBatcher::with_capacity(2);
        b.push(ev("a", "1"));
        b.push(ev("b", "2"));
        b.push(ev("c", "3"));
        assert_eq!(b.dropped(), 1);
        let names: Vec<_> = b.drain_ready().iter().map(|e| e.object().metadata.name.clone().unwrap()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }
}
