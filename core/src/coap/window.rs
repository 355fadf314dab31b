//! Duplicate detection for confirmable traffic.
//!
//! CoAP retransmits confirmable messages until acknowledged, so the same
//! message ID can arrive more than once. A fixed-size ring of recently seen
//! IDs is enough to drop the retries without unbounded growth.

/// Ring buffer of the last `capacity` message IDs seen from one peer.
#[derive(Debug)]
pub struct SlidingWindow {
    slots: Box<[Option<u16>]>,
    next: usize,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "window capacity must be non-zero");
        Self {
            slots: vec![None; capacity].into_boxed_slice(),
            next: 0,
        }
    }

    /// Record `id`, evicting the oldest entry once the window is full.
    pub fn push(&mut self, id: u16) {
        self.slots[self.next] = Some(id);
        self.next = (self.next + 1) % self.slots.len();
    }

    pub fn contains(&self, id: u16) -> bool {
        self.slots.iter().any(|slot| *slot == Some(id))
    }

    /// Record only if unseen. Returns `false` for a duplicate.
    pub fn accept(&mut self, id: u16) -> bool {
        if self.contains(id) {
            return false;
        }
        self.push(id);
        true
    }
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new(32)
    }
}
