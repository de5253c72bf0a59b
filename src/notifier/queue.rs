//! Bounded outbound queue.
//!
//! At most `capacity` notices are held in memory. Past that, new notices
//! live only in the outbox table (`spilled`) and are paged back in, oldest
//! first, as the head drains; nothing is dropped. Every resident entry is
//! older than every spilled one, so delivery stays in enqueue order.
//!
//! Only the dispatch loop removes entries from the front. The head may be
//! in flight, and an in-flight entry is never merged into, so the loop can
//! finish its send without holding the queue lock.

use std::collections::VecDeque;

use tokio::time::Instant;

use super::message::Notice;

#[derive(Debug, Clone)]
pub struct QueuedNotice {
    /// Row id in the persisted outbox.
    pub outbox_id: Option<i64>,
    pub notice: Notice,
    /// Failed send attempts so far.
    pub failures: u32,
    pub next_attempt_at: Instant,
    pub in_flight: bool,
}

impl QueuedNotice {
    pub fn new(notice: Notice, outbox_id: Option<i64>, now: Instant) -> Self {
        Self {
            outbox_id,
            notice,
            failures: 0,
            next_attempt_at: now,
            in_flight: false,
        }
    }
}

#[derive(Debug)]
pub struct OutboundQueue {
    entries: VecDeque<QueuedNotice>,
    capacity: usize,
    /// Notices persisted in the outbox but not loaded into memory.
    spilled: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            spilled: 0,
        }
    }

    /// All pending notices, resident and spilled.
    pub fn len(&self) -> usize {
        self.entries.len() + self.spilled
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resident(&self) -> usize {
        self.entries.len()
    }

    pub fn spilled(&self) -> usize {
        self.spilled
    }

    /// Free in-memory slots. Zero while anything is spilled, so a new notice
    /// cannot overtake older ones waiting in the outbox.
    pub fn room(&self) -> usize {
        if self.spilled > 0 {
            return 0;
        }
        self.capacity.saturating_sub(self.entries.len())
    }

    /// Room left for paging spilled rows back in.
    pub fn refill_room(&self) -> usize {
        self.capacity.saturating_sub(self.entries.len())
    }

    /// Index of a queued, not in-flight entry that `notice` can be folded
    /// into.
    pub fn merge_target(&self, notice: &Notice) -> Option<usize> {
        let key = notice.merge_key()?;
        self.entries
            .iter()
            .rposition(|e| !e.in_flight && e.notice.merge_key() == Some(key))
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut QueuedNotice> {
        self.entries.get_mut(index)
    }

    /// Append a resident entry. Callers check [`OutboundQueue::room`] first;
    /// refills may use the slots freed by the dispatch loop.
    pub fn push(&mut self, entry: QueuedNotice) {
        self.entries.push_back(entry);
    }

    /// Record a notice that was written to the outbox only.
    pub fn spill(&mut self) {
        self.spilled += 1;
    }

    /// Mark `count` spilled notices as loaded or discarded.
    pub fn unspill(&mut self, count: usize) {
        self.spilled = self.spilled.saturating_sub(count);
    }

    /// Newest outbox id held in memory; spilled rows all come after it.
    pub fn last_outbox_id(&self) -> Option<i64> {
        self.entries.iter().filter_map(|e| e.outbox_id).max()
    }

    pub fn front(&self) -> Option<&QueuedNotice> {
        self.entries.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut QueuedNotice> {
        self.entries.front_mut()
    }

    pub fn pop_front(&mut self) -> Option<QueuedNotice> {
        self.entries.pop_front()
    }
}
