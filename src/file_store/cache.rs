//! Message cache of a file message log
//!
//! Entries are kept in a list ordered by expiration, linked through their
//! sequences. A hit moves the entry to the tail with a fresh expiration.

use std::collections::HashMap;
use std::sync::Arc;

use crate::types::Message;

/// Time a message stays cached (nanoseconds)
pub const CACHE_TTL: i64 = 1_000_000_000;

#[derive(Debug)]
struct CachedMsg {
    expiration: i64,
    msg: Arc<Message>,
    prev: Option<u64>,
    next: Option<u64>,
}

#[derive(Debug, Default)]
pub struct MsgsCache {
    entries: HashMap<u64, CachedMsg>,
    head: Option<u64>,
    tail: Option<u64>,
}

impl MsgsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cache `msg` until `expiration`.
    pub fn add(&mut self, msg: Arc<Message>, expiration: i64) {
        let seq = msg.sequence;
        self.remove(seq);
        self.entries.insert(
            seq,
            CachedMsg {
                expiration,
                msg,
                prev: None,
                next: None,
            },
        );
        self.push_tail(seq);
    }

    /// Cached message for `seq`; a hit refreshes its expiration.
    pub fn get(&mut self, seq: u64, now: i64) -> Option<Arc<Message>> {
        if !self.entries.contains_key(&seq) {
            return None;
        }
        if self.tail != Some(seq) {
            self.unlink(seq);
            self.push_tail(seq);
        }
        let entry = self.entries.get_mut(&seq)?;
        entry.expiration = now + CACHE_TTL;
        Some(Arc::clone(&entry.msg))
    }

    pub fn remove(&mut self, seq: u64) {
        if self.entries.contains_key(&seq) {
            self.unlink(seq);
            self.entries.remove(&seq);
        }
    }

    /// Drop entries expired at `now`: everything at once if the newest has
    /// expired, from the head otherwise.
    pub fn evict(&mut self, now: i64) {
        let Some(tail) = self.tail else {
            return;
        };
        if self.entries.get(&tail).map_or(true, |e| now >= e.expiration) {
            self.clear();
            return;
        }
        while let Some(head) = self.head {
            let expired = self.entries.get(&head).map_or(false, |e| e.expiration <= now);
            if !expired {
                break;
            }
            self.remove(head);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.head = None;
        self.tail = None;
    }

    fn push_tail(&mut self, seq: u64) {
        let prev = self.tail;
        if let Some(entry) = self.entries.get_mut(&seq) {
            entry.prev = prev;
            entry.next = None;
        }
        match prev.and_then(|p| self.entries.get_mut(&p)) {
            Some(tail) => tail.next = Some(seq),
            None => self.head = Some(seq),
        }
        self.tail = Some(seq);
    }

    fn unlink(&mut self, seq: u64) {
        let Some(entry) = self.entries.get(&seq) else {
            return;
        };
        let (prev, next) = (entry.prev, entry.next);
        match prev.and_then(|p| self.entries.get_mut(&p)) {
            Some(p) => p.next = next,
            None => self.head = next,
        }
        match next.and_then(|n| self.entries.get_mut(&n)) {
            Some(n) => n.prev = prev,
            None => self.tail = prev,
        }
    }

    #[cfg(test)]
    fn order(&self) -> Vec<u64> {
        let mut seqs = Vec::new();
        let mut cur = self.head;
        while let Some(seq) = cur {
            seqs.push(seq);
            cur = self.entries[&seq].next;
        }
        seqs
    }
}
