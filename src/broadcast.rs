//! Retransmission queue for gossip broadcasts.
//!
//! Messages are re-sent piggybacked on outgoing UDP packets until they have
//! been transmitted `retransmit_mult * ceil(log10(n+1))` times, preferring
//! messages that have been sent the fewest times. At most one live message
//! exists per subject (member name or event key): queueing a newer message
//! about the same subject displaces the older one atomically.

use std::sync::Mutex;
use tokio::sync::oneshot;

struct Entry {
    /// Invalidation subject; `None` entries are never displaced.
    key: Option<String>,
    msg: Vec<u8>,
    transmits: u32,
    /// Monotonic insertion id; newer entries win ties.
    id: u64,
    /// Fired when the message leaves the queue (fully transmitted or
    /// displaced).
    notify: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct Inner {
    entries: Vec<Entry>,
    next_id: u64,
}

#[derive(Default)]
pub struct TransmitQueue {
    inner: Mutex<Inner>,
}

/// How many times a message is retransmitted in a cluster of `n` nodes.
pub fn retransmit_limit(mult: u32, n: usize) -> u32 {
    let scale = ((n + 1) as f64).log10().ceil().max(1.0) as u32;
    mult * scale
}

impl TransmitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message, displacing any queued message with the same key.
    pub fn queue(&self, key: Option<String>, msg: Vec<u8>, notify: Option<oneshot::Sender<()>>) {
        let mut inner = self.inner.lock().unwrap();

        if let Some(k) = &key {
            if let Some(pos) = inner.entries.iter().position(|e| e.key.as_deref() == Some(k)) {
                let old = inner.entries.swap_remove(pos);
                if let Some(tx) = old.notify {
                    let _ = tx.send(());
                }
            }
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push(Entry {
            key,
            msg,
            transmits: 0,
            id,
            notify,
        });
    }

    /// Drop any queued message about `key` (e.g. a reaped member).
    pub fn invalidate(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner
            .entries
            .iter()
            .position(|e| e.key.as_deref() == Some(key))
        {
            let old = inner.entries.swap_remove(pos);
            if let Some(tx) = old.notify {
                let _ = tx.send(());
            }
        }
    }

    /// Pull up to `limit` bytes of broadcasts, charging `overhead` bytes per
    /// message for framing. Least-transmitted messages go first; newer
    /// messages win ties so fresh state spreads before stale retransmits.
    pub fn get_broadcasts(
        &self,
        overhead: usize,
        limit: usize,
        retransmit_mult: u32,
        n_nodes: usize,
    ) -> Vec<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.is_empty() {
            return Vec::new();
        }

        let max_transmits = retransmit_limit(retransmit_mult, n_nodes);
        inner
            .entries
            .sort_by(|a, b| a.transmits.cmp(&b.transmits).then(b.id.cmp(&a.id)));

        let mut used = 0usize;
        let mut out = Vec::new();
        let mut finished = Vec::new();

        for (idx, entry) in inner.entries.iter_mut().enumerate() {
            let cost = overhead + entry.msg.len();
            if used + cost > limit {
                continue;
            }
            used += cost;
            out.push(entry.msg.clone());
            entry.transmits += 1;
            if entry.transmits >= max_transmits {
                finished.push(idx);
            }
        }

        // Remove finished entries back-to-front so indices stay valid.
        for idx in finished.into_iter().rev() {
            let old = inner.entries.remove(idx);
            if let Some(tx) = old.notify {
                let _ = tx.send(());
            }
        }

        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retransmit_limit_scales() {
        assert_eq!(retransmit_limit(4, 0), 4);
        assert_eq!(retransmit_limit(4, 1), 4);
        assert_eq!(retransmit_limit(4, 50), 8);
        assert_eq!(retransmit_limit(4, 5000), 16);
    }

    #[test]
    fn test_lowest_transmit_count_first() {
        let q = TransmitQueue::new();
        q.queue(Some("a".into()), vec![1], None);

        // Transmit "a" once, then add "b"; "b" must now be preferred.
        let got = q.get_broadcasts(0, 1024, 4, 10);
        assert_eq!(got, vec![vec![1]]);

        q.queue(Some("b".into()), vec![2], None);
        let got = q.get_broadcasts(0, 1024, 4, 10);
        assert_eq!(got[0], vec![2]);
    }

    #[test]
    fn test_invalidation_displaces_same_key() {
        let q = TransmitQueue::new();
        let (tx, mut rx) = oneshot::channel();
        q.queue(Some("node-a".into()), vec![1], Some(tx));
        q.queue(Some("node-a".into()), vec![2], None);

        assert_eq!(q.len(), 1);
        // The displaced entry's notify fired.
        assert!(rx.try_recv().is_ok());

        let got = q.get_broadcasts(0, 1024, 4, 10);
        assert_eq!(got, vec![vec![2]]);
    }

    #[test]
    fn test_byte_limit_respected() {
        let q = TransmitQueue::new();
        q.queue(Some("a".into()), vec![0; 100], None);
        q.queue(Some("b".into()), vec![0; 100], None);

        let got = q.get_broadcasts(2, 110, 4, 10);
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn test_entry_expires_after_limit() {
        let q = TransmitQueue::new();
        let (tx, mut rx) = oneshot::channel();
        q.queue(Some("a".into()), vec![1], Some(tx));

        // mult=1, n=0 -> exactly one transmission allowed.
        assert_eq!(q.get_broadcasts(0, 1024, 1, 0).len(), 1);
        assert!(q.is_empty());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_explicit_invalidate() {
        let q = TransmitQueue::new();
        q.queue(Some("gone".into()), vec![9], None);
        q.invalidate("gone");
        assert!(q.is_empty());
    }
}
