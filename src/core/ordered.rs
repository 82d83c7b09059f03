//! FIFO of work slots that are claimed in order, completed in any order and
//! delivered strictly from the head.
//!
//! Both pipelines keep one of these behind their lock: the sink's
//! compressors claim extents and its writer pops finished frames, the
//! source's decoders claim frames and its consumer pops finished extents.

use std::collections::VecDeque;

enum Slot<T, R> {
    Queued(T),
    Claimed,
    Done(R),
}

struct Entry<M, T, R> {
    meta: M,
    slot: Slot<T, R>,
}

pub(crate) struct OrderedQueue<M, T, R> {
    entries: VecDeque<Entry<M, T, R>>,
    head_seq: u64,
}

impl<M, T, R> OrderedQueue<M, T, R> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            head_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_seq(&self) -> u64 {
        self.head_seq + self.entries.len() as u64
    }

    pub fn push(&mut self, meta: M, item: T) -> u64 {
        let seq = self.next_seq();
        self.entries.push_back(Entry {
            meta,
            slot: Slot::Queued(item),
        });
        seq
    }

    /// Append a slot whose result is already known.
    pub fn push_done(&mut self, meta: M, result: R) -> u64 {
        let seq = self.next_seq();
        self.entries.push_back(Entry {
            meta,
            slot: Slot::Done(result),
        });
        seq
    }

    /// Metadata of the oldest unclaimed slot.
    pub fn peek_unclaimed(&self) -> Option<&M> {
        self.entries
            .iter()
            .find(|entry| matches!(entry.slot, Slot::Queued(_)))
            .map(|entry| &entry.meta)
    }

    /// Claim the oldest unclaimed slot, taking its input.
    pub fn claim_next(&mut self) -> Option<(u64, T)> {
        let idx = self
            .entries
            .iter()
            .position(|entry| matches!(entry.slot, Slot::Queued(_)))?;
        let entry = &mut self.entries[idx];
        match std::mem::replace(&mut entry.slot, Slot::Claimed) {
            Slot::Queued(item) => Some((self.head_seq + idx as u64, item)),
            _ => None,
        }
    }

    /// Attach a result to a claimed slot. Returns false if the slot is gone.
    pub fn complete(&mut self, seq: u64, result: R) -> bool {
        let Some(idx) = seq.checked_sub(self.head_seq) else {
            return false;
        };
        match self.entries.get_mut(idx as usize) {
            Some(entry) if matches!(entry.slot, Slot::Claimed) => {
                entry.slot = Slot::Done(result);
                true
            }
            _ => false,
        }
    }

    pub fn head_ready(&self) -> bool {
        matches!(self.entries.front(), Some(Entry { slot: Slot::Done(_), .. }))
    }

    /// Pop the head if its result is ready.
    pub fn pop_ready(&mut self) -> Option<(M, R)> {
        if !self.head_ready() {
            return None;
        }
        let entry = self.entries.pop_front()?;
        self.head_seq += 1;
        match entry.slot {
            Slot::Done(result) => Some((entry.meta, result)),
            _ => None,
        }
    }

    pub fn metas_mut(&mut self) -> impl Iterator<Item = &mut M> {
        self.entries.iter_mut().map(|entry| &mut entry.meta)
    }

    /// Drop every slot. Results for claimed slots completed later are discarded.
    pub fn clear(&mut self) {
        self.head_seq = self.next_seq();
        self.entries.clear();
    }
}
