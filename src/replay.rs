//! Anti-replay protection for transport message counters
//!
//! Every inbound encrypted message carries a 64-bit counter. The filter
//! accepts each counter at most once while tolerating bounded out-of-order
//! delivery, so duplicated or replayed datagrams are dropped before they
//! reach the decryption path.

/// Maximum counter value before a session must be rejected.
/// WireGuard spec: REJECT_AFTER_MESSAGES = 2^64 - 2^13 - 1
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - 8192;

const BLOCK_BIT_LOG: u64 = 6;
/// Bits per ring block (one machine word).
const BLOCK_BITS: u64 = 1 << BLOCK_BIT_LOG;
/// Number of blocks in the ring. Must be a power of two.
const RING_BLOCKS: usize = 1 << 7;
/// Counters further than this behind the highest accepted one are stale.
pub const WINDOW_SIZE: u64 = (RING_BLOCKS as u64 - 1) * BLOCK_BITS;

const BLOCK_MASK: u64 = RING_BLOCKS as u64 - 1;
const BIT_MASK: u64 = BLOCK_BITS - 1;

/// Sliding-window replay filter over 64-bit message counters.
///
/// The bitmap is a ring of 64-bit blocks indexed by the counter value, so
/// memory stays fixed at `RING_BLOCKS * 8` bytes regardless of how far the
/// counter advances. One block of slack between the window and the ring size
/// means a counter is accepted while `last - counter <= WINDOW_SIZE`.
///
/// Not synchronized; the owner serializes access (one decryption worker per
/// peer, or an external lock).
#[derive(Debug, Clone)]
pub struct ReplayFilter {
    /// Highest counter value accepted so far
    last: u64,
    /// Ring bitmap of recently accepted counters
    ring: [u64; RING_BLOCKS],
}

impl Default for ReplayFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayFilter {
    /// Create an empty filter
    pub fn new() -> Self {
        Self {
            last: 0,
            ring: [0; RING_BLOCKS],
        }
    }

    /// Return the filter to its initial state without reallocation.
    pub fn reset(&mut self) {
        self.last = 0;
        // Only block 0 can be inspected before the window advances over the
        // others, and advancing clears them on the way.
        self.ring[0] = 0;
    }

    /// Highest counter value accepted so far.
    pub fn last(&self) -> u64 {
        self.last
    }

    /// Check a counter and record it in one step.
    ///
    /// Returns `true` if the message may be processed: the counter is below
    /// `limit`, inside the current window, and has not been seen before.
    /// Returns `false` for duplicates, stale counters, and counters at or
    /// over the limit.
    pub fn validate(&mut self, counter: u64, limit: u64) -> bool {
        if counter >= limit {
            return false;
        }
        let index_block = counter >> BLOCK_BIT_LOG;
        if counter > self.last {
            // Move the window forward, clearing the blocks it slides over.
            let current = self.last >> BLOCK_BIT_LOG;
            let diff = (index_block - current).min(RING_BLOCKS as u64);
            for i in current + 1..=current + diff {
                self.ring[(i & BLOCK_MASK) as usize] = 0;
            }
            self.last = counter;
        } else if self.last - counter > WINDOW_SIZE {
            return false;
        }
        let block = (index_block & BLOCK_MASK) as usize;
        let bit = 1u64 << (counter & BIT_MASK);
        let old = self.ring[block];
        self.ring[block] = old | bit;
        old & bit == 0
    }
}
