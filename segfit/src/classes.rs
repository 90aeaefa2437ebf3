//! Size classes: mapping a chunk size to one of 64 slots.
//!
//! Slot 0 is reserved and never populated. Slot 1 is the fixed 32-byte class
//! (the fast bin's target size, see `fastbin.rs`). Slots 2..=31 are fixed
//! sizes 48..=512 in steps of 16. Slots 32..=33 are 576/640 (step 64), slots
//! 34..=47 are 768..=4096 (step 256), slot 48 anchors around 6144, and slots
//! 49..=63 are 8192..=65536 in steps of 4096.
//!
//! `index_of` implements the exact formula, not the descriptive table above:
//! at a couple of class boundaries (notably slot 48) the table's anchor size
//! computes into the *next* slot under the formula. The formula is what the
//! rest of the engine (bounded traversal counts, split policy) is built
//! against, so it is authoritative.

pub const SLOT_COUNT: usize = 64;
pub const FAST_SLOT: usize = 1;
pub const MIN_CHUNK_SIZE: usize = 32;

pub const TINY_LIMIT: usize = 512;
pub const MIDDLE_LIMIT: usize = 4096;

/// Chunks at or below this size are served by exact-size pops only (no
/// bounded traversal needed: every chunk on a tiny slot is the same size).
pub const MIDDLE_TRAVERSAL: usize = 4;
pub const HUGE_TRAVERSAL: usize = 8;

/// Maps a chunk size (header included, 8-byte aligned) to its slot index.
pub fn index_of(size: usize) -> usize {
    debug_assert!(size >= MIN_CHUNK_SIZE);
    debug_assert_eq!(size % 8, 0);
    let idx = if size <= 32 {
        1
    } else if size <= TINY_LIMIT {
        (size - 1) / 16
    } else if size <= 640 {
        (size + 1535) / 64
    } else if size <= MIDDLE_LIMIT {
        34 + (size - 513) / 256
    } else if size < 6144 {
        48
    } else {
        48 + (size - 1) / 4096
    };
    idx.min(SLOT_COUNT - 1)
}

/// True for the slots whose chunks are always exactly `class_size(i)` bytes.
pub fn is_fixed_class(index: usize) -> bool {
    (1..=31).contains(&index)
}

/// The exact size of every chunk parked on a fixed-class slot.
pub fn class_size(index: usize) -> usize {
    debug_assert!(is_fixed_class(index));
    if index == 1 {
        32
    } else {
        (index + 1) * 16
    }
}
