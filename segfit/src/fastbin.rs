//! The 32-byte fast bin: a 128-slot pool carved out of one ~4144-byte backing
//! chunk, reserved from the huge-allocation path the first time every
//! existing block is full.
//!
//! Each handed-out slot still gets a genuine 8-byte chunk header with
//! `THIS_INUSE | RESERVED` set, so `Heap::free` recognizes a fast-bin
//! pointer from its header alone (no side table to consult, no address-range
//! walk on the hot path). `RESERVED` is otherwise unused by the core engine;
//! this is its one job.

use core::ptr::NonNull;

use crate::chunk::{Chunk, HEADER_SIZE, RESERVED, THIS_INUSE};
use crate::list::ListNode;

pub const SLOT_SIZE: usize = 32;
pub const SLOTS_PER_BLOCK: usize = 128;
const LIST_NODE_SIZE: usize = 16;
const BLOCK_HEADER_SIZE: usize = 24; // available count + two 64-bit occupancy maps

pub const BLOCK_PAYLOAD: usize = LIST_NODE_SIZE + BLOCK_HEADER_SIZE + SLOTS_PER_BLOCK * SLOT_SIZE;
pub const BLOCK_CHUNK_SIZE: usize = HEADER_SIZE + BLOCK_PAYLOAD;

#[repr(C)]
struct BlockHeader {
    available: u64,
    bitmap_lo: u64,
    bitmap_hi: u64,
}

/// A view onto one reserved fast-bin backing chunk. Its list node lives in
/// the first 16 bytes of its payload, exactly like an ordinary free chunk's
/// node, but the list it's linked into is `Heap::fast_blocks`, private to
/// the fast bin.
#[derive(Clone, Copy)]
pub struct Block(Chunk);

impl Block {
    pub fn from_chunk(chunk: Chunk) -> Self {
        Block(chunk)
    }

    pub fn list_node(self) -> NonNull<ListNode> {
        self.0.list_node()
    }

    pub fn from_list_node(node: NonNull<ListNode>) -> Self {
        Block(Chunk::from_list_node(node))
    }

    fn header(self) -> &'static mut BlockHeader {
        unsafe { &mut *((self.0.payload() + LIST_NODE_SIZE) as *mut BlockHeader) }
    }

    fn slots_base(self) -> usize {
        self.0.payload() + LIST_NODE_SIZE + BLOCK_HEADER_SIZE
    }

    pub fn init(self) {
        let h = self.header();
        h.available = SLOTS_PER_BLOCK as u64;
        h.bitmap_lo = 0;
        h.bitmap_hi = 0;
    }

    pub fn is_full(self) -> bool {
        self.header().available == 0
    }

    pub fn contains(self, addr: usize) -> bool {
        let base = self.slots_base();
        addr >= base && addr < base + SLOTS_PER_BLOCK * SLOT_SIZE
    }

    fn bit(self, i: usize) -> bool {
        let h = self.header();
        if i < 64 {
            h.bitmap_lo & (1u64 << i) != 0
        } else {
            h.bitmap_hi & (1u64 << (i - 64)) != 0
        }
    }

    fn set_bit(self, i: usize, v: bool) {
        let h = self.header();
        if i < 64 {
            if v {
                h.bitmap_lo |= 1u64 << i;
            } else {
                h.bitmap_lo &= !(1u64 << i);
            }
        } else if v {
            h.bitmap_hi |= 1u64 << (i - 64);
        } else {
            h.bitmap_hi &= !(1u64 << (i - 64));
        }
    }

    /// Claims the first unused slot, writing its pseudo header and returning
    /// its payload address.
    pub fn take(self) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        for i in 0..SLOTS_PER_BLOCK {
            if !self.bit(i) {
                self.set_bit(i, true);
                self.header().available -= 1;
                let addr = self.slots_base() + i * SLOT_SIZE;
                let header = unsafe { Chunk::at(addr) };
                header.set_info(SLOT_SIZE, THIS_INUSE | RESERVED);
                return Some(header.payload());
            }
        }
        None
    }

    /// Releases the slot that owns `payload_addr`.
    pub fn put(self, payload_addr: usize) {
        let header_addr = payload_addr - HEADER_SIZE;
        let i = (header_addr - self.slots_base()) / SLOT_SIZE;
        debug_assert!(self.bit(i), "double free in fast bin");
        self.set_bit(i, false);
        self.header().available += 1;
    }
}
