//! Live-code bitmap used during collection.
//!
//! One bit per `CODE_ALIGNMENT`-sized unit of the exec range, keyed by
//! allocation base address. Populated by the checkpoint mark phase with
//! atomic test-and-set (several threads walk their stacks concurrently),
//! read by the sweep, cleared when the collection ends.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::header::CODE_ALIGNMENT;

const BITS_PER_WORD: usize = u64::BITS as usize;

pub struct LiveBitmap {
    range_begin: usize,
    range_end: usize,
    words: Vec<AtomicU64>,
}

impl LiveBitmap {
    /// Cover `[range_begin, range_end)`; both bounds must be aligned to the
    /// allocation unit.
    pub fn new(range_begin: usize, range_end: usize) -> Self {
        debug_assert!(range_begin <= range_end);
        debug_assert_eq!(range_begin % CODE_ALIGNMENT, 0);
        let bits = (range_end - range_begin) / CODE_ALIGNMENT;
        let word_count = bits.div_ceil(BITS_PER_WORD);
        let mut words = Vec::with_capacity(word_count);
        words.resize_with(word_count, || AtomicU64::new(0));
        LiveBitmap { range_begin, range_end, words }
    }

    pub fn covers(&self, addr: usize) -> bool {
        addr >= self.range_begin && addr < self.range_end
    }

    /// Set the bit for `addr`; returns whether it was already set.
    pub fn atomic_test_and_set(&self, addr: usize) -> bool {
        let (word, mask) = self.locate(addr);
        self.words[word].fetch_or(mask, Ordering::AcqRel) & mask != 0
    }

    pub fn test(&self, addr: usize) -> bool {
        let (word, mask) = self.locate(addr);
        self.words[word].load(Ordering::Acquire) & mask != 0
    }

    pub fn clear_all(&self) {
        for word in &self.words {
            word.store(0, Ordering::Release);
        }
    }

    fn locate(&self, addr: usize) -> (usize, u64) {
        debug_assert!(self.covers(addr));
        debug_assert_eq!(addr % CODE_ALIGNMENT, 0);
        let bit = (addr - self.range_begin) / CODE_ALIGNMENT;
        (bit / BITS_PER_WORD, 1u64 << (bit % BITS_PER_WORD))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_test() {
        let bitmap = LiveBitmap::new(0x10000, 0x20000);
        let addr = 0x10000 + 42 * CODE_ALIGNMENT;
        assert!(!bitmap.test(addr));
        assert!(!bitmap.atomic_test_and_set(addr));
        assert!(bitmap.test(addr));
        // Second set reports the bit was already there.
        assert!(bitmap.atomic_test_and_set(addr));
    }

    #[test]
    fn test_distinct_units_are_independent() {
        let bitmap = LiveBitmap::new(0x10000, 0x20000);
        bitmap.atomic_test_and_set(0x10000);
        assert!(!bitmap.test(0x10000 + CODE_ALIGNMENT));
        assert!(!bitmap.test(0x20000 - CODE_ALIGNMENT));
    }

    #[test]
    fn test_clear_all() {
        let bitmap = LiveBitmap::new(0, 0x1000);
        for unit in 0..16 {
            bitmap.atomic_test_and_set(unit * CODE_ALIGNMENT);
        }
        bitmap.clear_all();
        for unit in 0..16 {
            assert!(!bitmap.test(unit * CODE_ALIGNMENT));
        }
    }

    #[test]
    fn test_covers_bounds() {
        let bitmap = LiveBitmap::new(0x1000, 0x2000);
        assert!(bitmap.covers(0x1000));
        assert!(bitmap.covers(0x1FF0));
        assert!(!bitmap.covers(0x2000));
        assert!(!bitmap.covers(0xFF0));
    }
}
