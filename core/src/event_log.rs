//! # Event Log
//!
//! Per-CPU, per-stage record of IRQs received but not yet delivered.
//!
//! The log is a set of IRQ numbers kept as a radix bitmap of two to four
//! levels. The bottom level has one bit per IRQ; each bit of an upper level
//! summarizes one word of the level below it, so finding the lowest pending
//! IRQ costs one trailing-zero count per level.
//!
//! ```text
//!   index_0            ┌─ one word, bit i ⇔ word i of level 1 is non-zero
//!      │
//!   level 1 .. N-1     ┌─ summary words
//!      │
//!   flat               └─ bit n ⇔ IRQ n is pending
//! ```
//!
//! The number of levels is derived from the capacity at compile time.
//! Posting an IRQ that is already pending is a no-op, and IRQs come back
//! out in ascending order.
//!
//! An event log is only touched by its owning CPU with hard interrupts
//! disabled; it carries no synchronization of its own.

use alloc::boxed::Box;
use alloc::vec;

use arrayvec::ArrayVec;

const WORD_BITS: usize = usize::BITS as usize;
const WORD_SHIFT: usize = usize::BITS.trailing_zeros() as usize;
const WORD_MASK: usize = WORD_BITS - 1;

/// Largest capacity a four-level log can address
pub const MAX_LOG_BITS: usize = WORD_BITS * WORD_BITS * WORD_BITS * WORD_BITS;

/// Number of levels, `index_0` included, needed to address `bits` IRQs
pub const fn map_levels(bits: usize) -> usize {
    let flat_words = bits.div_ceil(WORD_BITS);
    if flat_words > WORD_BITS * WORD_BITS {
        4
    } else if flat_words > WORD_BITS {
        3
    } else {
        2
    }
}

/// Pending-IRQ set for `BITS` IRQ numbers
#[derive(Debug, Clone)]
pub struct EventLog<const BITS: usize> {
    index_0: usize,
    /// Levels below `index_0`, the flat map last
    maps: ArrayVec<Box<[usize]>, 3>,
}

impl<const BITS: usize> EventLog<BITS> {
    /// Number of levels, `index_0` included
    pub const LEVELS: usize = map_levels(BITS);

    const DEPTH: usize = Self::LEVELS - 1;

    const CAPACITY_OK: () = assert!(
        BITS > 0 && BITS <= MAX_LOG_BITS,
        "event log capacity out of range"
    );

    /// Create an empty log
    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CAPACITY_OK;

        let mut maps = ArrayVec::new();
        for level in 1..=Self::DEPTH {
            let words = if level == Self::DEPTH {
                BITS.div_ceil(WORD_BITS)
            } else {
                WORD_BITS.pow(level as u32)
            };
            maps.push(vec![0usize; words].into_boxed_slice());
        }
        Self { index_0: 0, maps }
    }

    /// Capacity in IRQ numbers
    pub const fn capacity(&self) -> usize {
        BITS
    }

    /// Bit position of `irq` within `level` (1-based, `DEPTH` is flat)
    #[inline]
    fn position(irq: usize, level: usize) -> usize {
        irq >> (WORD_SHIFT * (Self::DEPTH - level))
    }

    /// Mark `irq` pending
    pub fn post(&mut self, irq: usize) {
        if warn_on_once!(irq >= BITS, "IRQ {} beyond event log capacity {}", irq, BITS) {
            return;
        }

        for (slot, map) in self.maps.iter_mut().enumerate() {
            let pos = Self::position(irq, slot + 1);
            map[pos >> WORD_SHIFT] |= 1 << (pos & WORD_MASK);
        }
        self.index_0 |= 1 << Self::position(irq, 0);
    }

    /// Remove and return the lowest pending IRQ
    pub fn pull_lowest(&mut self) -> Option<usize> {
        if self.index_0 == 0 {
            return None;
        }

        let mut pos = self.index_0.trailing_zeros() as usize;
        for map in self.maps.iter() {
            let word = map[pos];
            if warn_on_once!(word == 0, "event log summary out of sync") {
                return None;
            }
            pos = (pos << WORD_SHIFT) | word.trailing_zeros() as usize;
        }
        let irq = pos;

        // Clear bottom-up, stopping at the first word that stays non-zero.
        for level in (1..=Self::DEPTH).rev() {
            let pos = Self::position(irq, level);
            let word = &mut self.maps[level - 1][pos >> WORD_SHIFT];
            *word &= !(1 << (pos & WORD_MASK));
            if *word != 0 {
                return Some(irq);
            }
        }
        self.index_0 &= !(1 << Self::position(irq, 0));

        Some(irq)
    }

    /// Whether any IRQ is pending
    #[inline]
    pub fn pending(&self) -> bool {
        self.index_0 != 0
    }

    /// Whether `irq` is pending
    pub fn contains(&self, irq: usize) -> bool {
        if irq >= BITS {
            return false;
        }
        match self.maps.last() {
            Some(flat) => flat[irq >> WORD_SHIFT] & (1 << (irq & WORD_MASK)) != 0,
            None => false,
        }
    }

    /// Drop every pending IRQ
    pub fn clear(&mut self) {
        self.index_0 = 0;
        for map in self.maps.iter_mut() {
            map.fill(0);
        }
    }

    /// Verify that every summary bit matches its child word
    pub fn check_consistency(&self) -> bool {
        let Some(first) = self.maps.first() else {
            return false;
        };
        if !Self::summary_matches(self.index_0, 0, first) {
            return false;
        }
        self.maps.windows(2).all(|pair| {
            pair[0]
                .iter()
                .enumerate()
                .all(|(w, &word)| Self::summary_matches(word, w, &pair[1]))
        })
    }

    fn summary_matches(word: usize, index: usize, children: &[usize]) -> bool {
        (0..WORD_BITS).all(|bit| {
            let child = children
                .get((index << WORD_SHIFT) | bit)
                .copied()
                .unwrap_or(0);
            (word & (1 << bit) != 0) == (child != 0)
        })
    }
}

impl<const BITS: usize> Default for EventLog<BITS> {
    fn default() -> Self {
        Self::new()
    }
}
