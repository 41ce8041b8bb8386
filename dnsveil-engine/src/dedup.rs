//! Duplicate query suppression
//!
//! The OS stub resolver retransmits a query within tens of milliseconds
//! when the answer is slow, and DoH adds enough latency to make that the
//! common case. Retransmissions carry the same message ID, so a small
//! ring of recently seen IDs absorbs them before they multiply upstream
//! load. An ID collision inside the window drops a legitimate query, but
//! the window is tight enough that this is negligible in practice.

/// Number of recently seen message IDs to track (power of two)
const WINDOW_SIZE: usize = 64;

/// Fixed-size, age-evicted window of DNS message IDs.
///
/// Owned by the dispatcher task; not safe for concurrent use.
pub struct Dedup {
    window: [u16; WINDOW_SIZE],
    used: usize,
    next: usize,
}

impl Dedup {
    pub fn new() -> Self {
        Self {
            window: [0; WINDOW_SIZE],
            used: 0,
            next: 0,
        }
    }

    /// Check whether `id` was seen recently, recording it if not.
    ///
    /// Insertion overwrites the oldest entry once the window is full, so
    /// an ID re-seen after a full roll-over counts as fresh.
    pub fn is_duplicate(&mut self, id: u16) -> bool {
        if self.window[..self.used].contains(&id) {
            return true;
        }
        self.window[self.next] = id;
        self.next = (self.next + 1) & (WINDOW_SIZE - 1);
        if self.used < WINDOW_SIZE {
            self.used += 1;
        }
        false
    }
}

impl Default for Dedup {
    fn default() -> Self {
        Self::new()
    }
}
