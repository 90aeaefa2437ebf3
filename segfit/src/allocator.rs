//! The segregated-fit engine: 64 size-class slots, a 64-bit availability
//! bitmap, boundary-tag coalescing, and brk-backed growth.
//!
//! Layout of the managed extent, once `init`/`init_with` has run:
//!
//! ```text
//! [head sentinel: 8B, THIS_INUSE] [ ... real chunks ... ] [tail sentinel: 8B, THIS_INUSE, size 0]
//! ```
//!
//! The head sentinel's permanent `THIS_INUSE` makes the first real chunk's
//! `PREV_INUSE` permanently true, and the tail's permanent `THIS_INUSE`
//! stops forward coalescing from ever running off the managed extent.
//! Neither sentinel is ever freed, split, or inserted into a slot.

use core::ptr::NonNull;

use crate::bitmap::Bitmap;
use crate::brk::{ArenaBrk, BrkSource, PAGE_SIZE};
use crate::chunk::{Chunk, HEADER_SIZE, MIN_CHUNK_SIZE, PREV_INUSE, THIS_INUSE};
use crate::classes::{self, HUGE_TRAVERSAL, MIDDLE_LIMIT, MIDDLE_TRAVERSAL, TINY_LIMIT};
use crate::list::ListNode;
use crate::util::align_up;

#[cfg(feature = "fastbin")]
use crate::fastbin;

/// A segregated-fit heap growing against a `BrkSource`. Defaults to
/// `ArenaBrk`, which simulates `sbrk` over one fixed caller-owned region.
pub struct Heap<B: BrkSource = ArenaBrk> {
    brk: B,
    heap_base: usize,
    heap_top: usize,
    initialized: bool,
    slots: [ListNode; classes::SLOT_COUNT],
    bitmap: Bitmap,
    #[cfg(feature = "fastbin")]
    fast_blocks: ListNode,
}

unsafe impl<B: BrkSource + Send> Send for Heap<B> {}

impl<B: BrkSource> Heap<B> {
    /// Builds an uninitialized engine around an already-constructed break
    /// source. Call `init_with` before any allocation.
    pub const fn new_with(brk: B) -> Self {
        Heap {
            brk,
            heap_base: 0,
            heap_top: 0,
            initialized: false,
            slots: [ListNode::new(); classes::SLOT_COUNT],
            bitmap: Bitmap::new(),
            #[cfg(feature = "fastbin")]
            fast_blocks: ListNode::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Takes ownership of `brk`, carves out the head/tail sentinels and the
    /// first free chunk, and readies every slot list. Returns 0 on success,
    /// -1 if the break source can't supply even one page.
    pub fn init_with(&mut self, mut brk: B) -> i32 {
        let heap = match unsafe { brk.sbrk(PAGE_SIZE) } {
            Some(a) => a,
            None => return -1,
        };
        let rem = heap % PAGE_SIZE;
        let mut mapped = PAGE_SIZE;
        if rem != 0 {
            let extra = PAGE_SIZE - rem;
            if unsafe { brk.sbrk(extra) }.is_none() {
                return -1;
            }
            mapped += extra;
        }
        let top = heap + mapped;

        self.brk = brk;
        for i in 0..classes::SLOT_COUNT {
            unsafe { ListNode::init_self(NonNull::from(&mut self.slots[i])) };
        }
        #[cfg(feature = "fastbin")]
        unsafe {
            ListNode::init_self(NonNull::from(&mut self.fast_blocks));
        }
        self.bitmap = Bitmap::new();

        let head_addr = align_up(heap, 8);
        let first_addr = head_addr + HEADER_SIZE;
        let tail_addr = top - HEADER_SIZE;
        debug_assert!(tail_addr > first_addr + HEADER_SIZE);

        let head = unsafe { Chunk::at(head_addr) };
        head.set_info(HEADER_SIZE, THIS_INUSE);

        let first_size = tail_addr - first_addr;
        let first = unsafe { Chunk::at(first_addr) };
        first.set_info(first_size, PREV_INUSE);

        let tail = unsafe { Chunk::at(tail_addr) };
        tail.set_info(0, THIS_INUSE);
        tail.set_prev_size(first_size);

        self.heap_base = head_addr;
        self.heap_top = tail_addr;
        self.initialized = true;

        self.insert_free(first);
        0
    }

    // -- slot/bitmap bookkeeping --------------------------------------

    fn insert_free(&mut self, c: Chunk) {
        let idx = classes::index_of(c.size());
        unsafe {
            ListNode::push_front(NonNull::from(&mut self.slots[idx]), c.list_node());
        }
        self.bitmap.set(idx);
    }

    fn remove_free(&mut self, c: Chunk) {
        let idx = classes::index_of(c.size());
        unsafe {
            ListNode::remove(c.list_node());
            if ListNode::is_empty(NonNull::from(&mut self.slots[idx])) {
                self.bitmap.clr(idx);
            }
        }
    }

    fn take_exact(&mut self, idx: usize) -> Option<Chunk> {
        unsafe {
            let head = NonNull::from(&mut self.slots[idx]);
            if ListNode::is_empty(head) {
                return None;
            }
            let node = ListNode::pop_front(head);
            if ListNode::is_empty(head) {
                self.bitmap.clr(idx);
            }
            Some(Chunk::from_list_node(node))
        }
    }

    /// Scans at most `max_scan` nodes of slot `idx` for the first chunk big
    /// enough for `need`. Used for the dynamic (middle/huge) slots, whose
    /// chunks are not all the same size.
    fn take_bounded(&mut self, idx: usize, need: usize, max_scan: usize) -> Option<Chunk> {
        unsafe {
            let head = NonNull::from(&mut self.slots[idx]);
            let mut cur = (*head.as_ptr()).next;
            let mut scanned = 0;
            while cur != head && scanned < max_scan {
                let c = Chunk::from_list_node(cur);
                if c.size() >= need {
                    ListNode::remove(cur);
                    if ListNode::is_empty(head) {
                        self.bitmap.clr(idx);
                    }
                    return Some(c);
                }
                cur = (*cur.as_ptr()).next;
                scanned += 1;
            }
            None
        }
    }

    // -- coalescing ------------------------------------------------------

    /// Merges `c` with its predecessor if that predecessor is free. The
    /// merge is a no-op at the heap floor: the head sentinel's permanent
    /// `THIS_INUSE` keeps the very first real chunk's `PREV_INUSE` set.
    fn coalesce_backward(&mut self, c: Chunk) -> Chunk {
        if c.prev_inuse() {
            return c;
        }
        let prev = c.prev();
        self.remove_free(prev);
        let merged = prev.size() + c.size();
        prev.set_size(merged);
        let succ = c.next();
        succ.set_prev_size(merged);
        prev
    }

    /// Merges `c` with its successor if that successor is free. A no-op at
    /// the high-water mark: the tail sentinel's permanent `THIS_INUSE` stops
    /// this from ever running off the managed extent.
    fn coalesce_forward(&mut self, c: Chunk) -> Chunk {
        let succ = c.next();
        if succ.this_inuse() {
            return c;
        }
        self.remove_free(succ);
        let merged = c.size() + succ.size();
        c.set_size(merged);
        let after = c.next();
        after.set_prev_size(merged);
        c
    }

    // -- allocation --------------------------------------------------

    /// Splits off a tail remainder when `c` is more than twice `need`,
    /// otherwise hands the whole chunk over with its internal slack intact.
    /// Either way the returned chunk is marked in use and its successor's
    /// `PREV_INUSE` is brought up to date.
    fn split_or_take(&mut self, c: Chunk, need: usize) -> Chunk {
        let total = c.size();
        if total > need * 2 {
            let remainder = unsafe { Chunk::at(c.addr() + need) };
            let remainder_size = total - need;
            remainder.set_info(remainder_size, PREV_INUSE);
            c.set_size(need);
            let succ = remainder.next();
            succ.set_prev_size(remainder_size);
            succ.set_prev_inuse(false);
            self.insert_free(remainder);
        } else {
            let succ = c.next();
            succ.set_prev_inuse(true);
        }
        c.set_this_inuse(true);
        c
    }

    /// Extends the heap by at least `need` bytes, rounded up to a whole
    /// number of pages, absorbing the old tail position into a new free
    /// chunk and placing a fresh tail sentinel at the new high-water mark.
    /// The returned chunk is free and not yet linked into any slot.
    fn grow(&mut self, need: usize) -> Option<Chunk> {
        let rounded = align_up(need, PAGE_SIZE).max(PAGE_SIZE);
        let old_tail = unsafe { Chunk::at(self.heap_top) };
        let prev_inuse = old_tail.prev_inuse();
        let prev_size = old_tail.prev_size();

        let mapped_from = unsafe { self.brk.sbrk(rounded)? };
        debug_assert_eq!(mapped_from, self.heap_top + HEADER_SIZE);

        // The old tail's 8 header bytes were already mapped; `rounded` is the
        // only newly-granted span, and it must hold both the new chunk and
        // the next tail sentinel's 8 bytes. So the new chunk gets `rounded`
        // bytes total, not `rounded + HEADER_SIZE` (that would place the next
        // tail sentinel 8 bytes past what `sbrk` actually granted).
        let new_size = rounded;
        let c = unsafe { Chunk::at(self.heap_top) };
        c.set_info(new_size, if prev_inuse { PREV_INUSE } else { 0 });
        if !prev_inuse {
            c.set_prev_size(prev_size);
        }

        let new_tail_addr = self.heap_top + new_size;
        let new_tail = unsafe { Chunk::at(new_tail_addr) };
        new_tail.set_info(0, THIS_INUSE);
        self.heap_top = new_tail_addr;

        let merged = self.coalesce_backward(c);
        let succ = merged.next();
        succ.set_prev_size(merged.size());
        succ.set_prev_inuse(false);
        Some(merged)
    }

    /// Common acquisition path: try slot `idx` (exact pop for fixed classes,
    /// bounded scan for dynamic ones), then the next non-empty larger slot,
    /// then grow the heap. Applies split-or-take to whatever is found.
    fn acquire(&mut self, need: usize, idx: usize, bounded: Option<usize>) -> Option<Chunk> {
        let found = match bounded {
            None => self.take_exact(idx),
            Some(max_scan) => self.take_bounded(idx, need, max_scan),
        };
        if let Some(c) = found {
            return Some(self.split_or_take(c, need));
        }
        if let Some(j) = self.bitmap.next_nonempty(idx) {
            if let Some(c) = self.take_exact(j) {
                return Some(self.split_or_take(c, need));
            }
        }
        let c = self.grow(need)?;
        Some(self.split_or_take(c, need))
    }

    fn tiny_allocate(&mut self, need: usize) -> Option<Chunk> {
        let idx = classes::index_of(need);
        self.acquire(need, idx, None)
    }

    fn middle_allocate(&mut self, need: usize) -> Option<Chunk> {
        let idx = classes::index_of(need);
        self.acquire(need, idx, Some(MIDDLE_TRAVERSAL))
    }

    fn huge_allocate(&mut self, need: usize) -> Option<Chunk> {
        let idx = classes::index_of(need);
        self.acquire(need, idx, Some(HUGE_TRAVERSAL))
    }

    fn dispatch_allocate(&mut self, need: usize) -> Option<Chunk> {
        if need <= TINY_LIMIT {
            self.tiny_allocate(need)
        } else if need <= MIDDLE_LIMIT {
            self.middle_allocate(need)
        } else {
            self.huge_allocate(need)
        }
    }

    /// Allocates at least `size` usable bytes, returning a null pointer only
    /// when the underlying break extension fails. `size == 0` still returns a
    /// real, freeable pointer into a 32-byte chunk, same as `malloc(1)` or
    /// `malloc(24)`.
    pub unsafe fn malloc(&mut self, size: usize) -> *mut u8 {
        let need = (crate::util::align8(size) + HEADER_SIZE).max(MIN_CHUNK_SIZE);

        #[cfg(feature = "fastbin")]
        if need <= MIN_CHUNK_SIZE {
            return match self.fast_alloc() {
                Some(p) => p.as_ptr(),
                None => core::ptr::null_mut(),
            };
        }

        match self.dispatch_allocate(need) {
            Some(c) => c.payload() as *mut u8,
            None => core::ptr::null_mut(),
        }
    }

    /// Frees a pointer previously returned by `malloc`/`realloc`. `free(null)`
    /// is a no-op.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        #[cfg(feature = "fastbin")]
        if self.fast_owns(ptr) {
            self.fast_free(ptr);
            return;
        }

        let c0 = Chunk::from_payload(ptr as usize);
        c0.set_this_inuse(false);
        let c1 = self.coalesce_backward(c0);
        let c2 = self.coalesce_forward(c1);
        let succ = c2.next();
        succ.set_prev_size(c2.size());
        succ.set_prev_inuse(false);
        self.insert_free(c2);
    }

    /// Resizes the allocation at `ptr` to `new_size` bytes, preserving the
    /// lesser of the old and new sizes' worth of content. Shrinks split in
    /// place; grows absorb a free forward neighbor in place when possible,
    /// otherwise allocate-copy-free.
    pub unsafe fn realloc(&mut self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.malloc(new_size);
        }
        if new_size == 0 {
            self.free(ptr);
            return core::ptr::null_mut();
        }

        let need = (crate::util::align8(new_size) + HEADER_SIZE).max(MIN_CHUNK_SIZE);

        #[cfg(feature = "fastbin")]
        if self.fast_owns(ptr) {
            if need <= MIN_CHUNK_SIZE {
                return ptr;
            }
            let new_ptr = self.malloc(new_size);
            if !new_ptr.is_null() {
                core::ptr::copy_nonoverlapping(ptr, new_ptr, MIN_CHUNK_SIZE - HEADER_SIZE);
                self.fast_free(ptr);
            }
            return new_ptr;
        }

        let c = Chunk::from_payload(ptr as usize);
        let old_size = c.size();

        if need <= old_size {
            if old_size - need >= MIN_CHUNK_SIZE {
                let remainder = Chunk::at(c.addr() + need);
                let remainder_size = old_size - need;
                remainder.set_info(remainder_size, PREV_INUSE);
                c.set_size(need);
                let merged = self.coalesce_forward(remainder);
                let succ = merged.next();
                succ.set_prev_size(merged.size());
                succ.set_prev_inuse(false);
                self.insert_free(merged);
            }
            return ptr;
        }

        let succ = c.next();
        if !succ.this_inuse() && old_size + succ.size() >= need {
            self.remove_free(succ);
            let combined = old_size + succ.size();
            c.set_size(combined);
            let after = c.next();
            after.set_prev_size(combined);
            if combined > need * 2 {
                let remainder = Chunk::at(c.addr() + need);
                let remainder_size = combined - need;
                remainder.set_info(remainder_size, PREV_INUSE);
                c.set_size(need);
                after.set_prev_size(remainder_size);
                self.insert_free(remainder);
            } else {
                after.set_prev_inuse(true);
            }
            return ptr;
        }

        let new_ptr = self.malloc(new_size);
        if !new_ptr.is_null() {
            core::ptr::copy_nonoverlapping(ptr, new_ptr, old_size - HEADER_SIZE);
            self.free(ptr);
        }
        new_ptr
    }

    /// Walks every live chunk between the sentinels, checking boundary-tag
    /// consistency. Intended for debug-assertion-gated self-checks, not the
    /// allocation hot path.
    #[cfg(any(test, debug_assertions))]
    pub fn check(&self) {
        if !self.initialized {
            return;
        }
        let mut c = unsafe { Chunk::at(self.heap_base) }.next();
        let tail = self.heap_top;
        let mut prev_free = false;
        while c.addr() != tail {
            assert_eq!(
                c.prev_inuse(),
                !prev_free,
                "prev_inuse mismatch at {:#x}",
                c.addr()
            );
            if !c.this_inuse() {
                assert!(!prev_free, "adjacent free chunks at {:#x}", c.addr());
            }
            prev_free = !c.this_inuse();
            let next = c.next();
            assert_eq!(
                next.prev_size(),
                c.size(),
                "prev_size mismatch at {:#x}",
                next.addr()
            );
            assert!(next.addr() <= tail, "chunk runs past the tail sentinel");
            c = next;
        }
    }
}

#[cfg(feature = "fastbin")]
impl<B: BrkSource> Heap<B> {
    fn fast_alloc(&mut self) -> Option<NonNull<u8>> {
        unsafe {
            let head = NonNull::from(&mut self.fast_blocks);
            let mut cur = (*head.as_ptr()).next;
            while cur != head {
                let block = fastbin::Block::from_list_node(cur);
                if let Some(addr) = block.take() {
                    return Some(NonNull::new_unchecked(addr as *mut u8));
                }
                cur = (*cur.as_ptr()).next;
            }
        }
        let block_chunk = self.huge_allocate(fastbin::BLOCK_CHUNK_SIZE)?;
        let block = fastbin::Block::from_chunk(block_chunk);
        block.init();
        unsafe {
            ListNode::push_front(NonNull::from(&mut self.fast_blocks), block.list_node());
        }
        block
            .take()
            .map(|addr| unsafe { NonNull::new_unchecked(addr as *mut u8) })
    }

    fn fast_owns(&mut self, ptr: *mut u8) -> bool {
        let addr = ptr as usize;
        let header = unsafe { Chunk::at(addr - HEADER_SIZE) };
        if !(header.reserved() && header.this_inuse()) {
            return false;
        }
        unsafe {
            let head = NonNull::from(&mut self.fast_blocks);
            let mut cur = (*head.as_ptr()).next;
            while cur != head {
                let block = fastbin::Block::from_list_node(cur);
                if block.contains(addr) {
                    return true;
                }
                cur = (*cur.as_ptr()).next;
            }
        }
        false
    }

    fn fast_free(&mut self, ptr: *mut u8) {
        let addr = ptr as usize;
        unsafe {
            let head = NonNull::from(&mut self.fast_blocks);
            let mut cur = (*head.as_ptr()).next;
            while cur != head {
                let block = fastbin::Block::from_list_node(cur);
                if block.contains(addr) {
                    let header = Chunk::at(addr - HEADER_SIZE);
                    header.set_reserved(false);
                    header.set_this_inuse(false);
                    block.put(addr);
                    return;
                }
                cur = (*cur.as_ptr()).next;
            }
        }
        debug_assert!(false, "fast_free: pointer not owned by any fast-bin block");
    }
}

impl Heap<ArenaBrk> {
    /// Builds a not-yet-initialized engine; call `init` before allocating.
    pub const fn new() -> Self {
        Self::new_with(ArenaBrk::uninit())
    }

    /// Initializes the engine over `heap_start..heap_start + heap_size`.
    ///
    /// # Safety
    /// That range must be valid, writable, and exclusively owned by this
    /// allocator for as long as it is in use.
    pub unsafe fn init(&mut self, heap_start: usize, heap_size: usize) -> i32 {
        self.init_with(ArenaBrk::new(heap_start, heap_size))
    }
}

impl Default for Heap<ArenaBrk> {
    fn default() -> Self {
        Self::new()
    }
}
