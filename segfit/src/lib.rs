#![cfg_attr(not(test), no_std)]

mod allocator;
mod bitmap;
mod brk;
mod chunk;
mod classes;
#[cfg(feature = "fastbin")]
mod fastbin;
mod list;
mod util;

pub use allocator::Heap;
pub use brk::{ArenaBrk, BrkSource};

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::hint::spin_loop as cpu_relax;
use core::sync::atomic::{AtomicBool, Ordering};

struct SpinLock<T> {
    locked: AtomicBool,
    inner: UnsafeCell<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            inner: UnsafeCell::new(value),
        }
    }

    fn lock(&self) -> SpinLockGuard<'_, T> {
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            cpu_relax();
        }
        SpinLockGuard { lock: self }
    }
}

unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> core::ops::Deref for SpinLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<'a, T> core::ops::DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// A `Heap<B>` behind a spin lock, implementing `GlobalAlloc`.
///
/// `B` defaults to `ArenaBrk`; the sentinel/slot arrays are set up once by
/// `init`/`init_with` and never moved afterward, which is what makes the
/// engine's self-referential empty-list sentinels sound.
pub struct LockedAlloc<B: BrkSource = ArenaBrk>(SpinLock<Heap<B>>);

impl<B: BrkSource> LockedAlloc<B> {
    pub const fn new_with(brk: B) -> Self {
        Self(SpinLock::new(Heap::new_with(brk)))
    }

    /// # Safety
    /// Same contract as `Heap::init_with`: `brk` must hand out memory that is
    /// valid, writable, and exclusive to this allocator.
    pub unsafe fn init_with(&self, brk: B) -> i32 {
        let mut g = self.0.lock();
        g.init_with(brk)
    }
}

impl LockedAlloc<ArenaBrk> {
    pub const fn new() -> Self {
        Self::new_with(ArenaBrk::uninit())
    }

    /// # Safety
    /// `heap_start..heap_start+heap_size` must be a valid, writable region,
    /// exclusively owned by this allocator, and `init` must run exactly once
    /// before any allocation.
    pub unsafe fn init(&self, heap_start: usize, heap_size: usize) -> i32 {
        let mut g = self.0.lock();
        g.init_with(ArenaBrk::new(heap_start, heap_size))
    }
}

impl Default for LockedAlloc<ArenaBrk> {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl<B: BrkSource> GlobalAlloc for LockedAlloc<B> {
    /// # Safety
    /// Per the `GlobalAlloc` contract: `layout` must be valid and the region
    /// supplied to `init`/`init_with` must remain exclusive to this runtime.
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut g = self.0.lock();
        g.malloc(layout.size())
    }

    /// # Safety
    /// `ptr` must come from a prior `alloc`/`realloc` on this same instance.
    /// No double frees, no concurrent mutation of the same allocation.
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let mut g = self.0.lock();
        g.free(ptr);
    }

    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        let mut g = self.0.lock();
        g.realloc(ptr, new_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(size: usize) -> (LockedAlloc, std::vec::Vec<u8>) {
        let mut buf = std::vec![0u8; size];
        let alloc = LockedAlloc::new();
        unsafe { alloc.init(buf.as_mut_ptr() as usize, buf.len()) };
        (alloc, buf)
    }

    /// Re-derives invariants 1-6 of the engine's testable properties
    /// (tiling, boundary tags, bitmap/list consistency, no free-free
    /// adjacency) by walking the whole chunk chain. Call after any sequence
    /// of ops whose correctness depends on more than the immediate return
    /// value.
    fn check(alloc: &LockedAlloc) {
        alloc.0.lock().check();
    }

    #[test]
    fn small_alloc_dealloc() {
        let (alloc, _buf) = fresh(8192);
        let p = unsafe { alloc.alloc(Layout::from_size_align(32, 8).unwrap()) };
        assert!(!p.is_null());
        unsafe { alloc.dealloc(p, Layout::from_size_align(32, 8).unwrap()) };
        let q = unsafe { alloc.alloc(Layout::from_size_align(32, 8).unwrap()) };
        assert!(!q.is_null());
        check(&alloc);
    }

    #[test]
    fn refill_many_objects() {
        let (alloc, _buf) = fresh(256 * 1024);
        let l = Layout::from_size_align(16, 8).unwrap();
        let mut ptrs = std::vec![core::ptr::null_mut(); 200];
        for p in ptrs.iter_mut() {
            *p = unsafe { alloc.alloc(l) };
            assert!(!p.is_null());
        }
        for &p in &ptrs {
            unsafe { alloc.dealloc(p, l) };
        }
        for p in ptrs.iter_mut() {
            *p = unsafe { alloc.alloc(l) };
            assert!(!p.is_null());
        }
        check(&alloc);
    }

    #[test]
    fn boundary_classes_and_large() {
        let (alloc, _buf) = fresh(256 * 1024);

        let p1 = unsafe { alloc.alloc(Layout::from_size_align(4096, 8).unwrap()) } as usize;
        assert_ne!(p1, 0);

        let l_over = Layout::from_size_align(8192, 8).unwrap();
        let q1 = unsafe { alloc.alloc(l_over) } as usize;
        let q2 = unsafe { alloc.alloc(l_over) } as usize;
        assert_ne!(q1, 0);
        assert_ne!(q2, 0);
        assert_ne!(q1, q2);
        check(&alloc);
    }

    #[test]
    fn freelist_reuse_lifo() {
        let (alloc, _buf) = fresh(32 * 1024);
        let l = Layout::from_size_align(64, 8).unwrap();
        let a = unsafe { alloc.alloc(l) };
        let b = unsafe { alloc.alloc(l) };
        unsafe { alloc.dealloc(a, l) };
        unsafe { alloc.dealloc(b, l) };
        let c = unsafe { alloc.alloc(l) };
        assert_eq!(c as usize, b as usize);
        check(&alloc);
    }

    #[test]
    fn split_then_forward_coalesce_on_free() {
        let (alloc, _buf) = fresh(64 * 1024);
        let big = unsafe { alloc.alloc(Layout::from_size_align(2000, 8).unwrap()) };
        assert!(!big.is_null());
        let small = unsafe { alloc.alloc(Layout::from_size_align(64, 8).unwrap()) };
        assert!(!small.is_null());
        unsafe { alloc.dealloc(small, Layout::from_size_align(64, 8).unwrap()) };
        unsafe { alloc.dealloc(big, Layout::from_size_align(2000, 8).unwrap()) };

        // After both frees coalesce, a request close to the sum of both
        // should be servable without growing the heap.
        let reused = unsafe { alloc.alloc(Layout::from_size_align(1900, 8).unwrap()) };
        assert!(!reused.is_null());
        check(&alloc);
    }

    #[test]
    fn backward_coalesce_on_free() {
        let (alloc, _buf) = fresh(64 * 1024);
        let l = Layout::from_size_align(256, 8).unwrap();
        let a = unsafe { alloc.alloc(l) };
        let b = unsafe { alloc.alloc(l) };
        let c = unsafe { alloc.alloc(l) };
        unsafe { alloc.dealloc(a, l) };
        unsafe { alloc.dealloc(b, l) };
        // a and b are adjacent and both free now; c stays allocated, keeping
        // the merged region bounded on one side.
        let big = unsafe { alloc.alloc(Layout::from_size_align(400, 8).unwrap()) };
        assert!(!big.is_null());
        unsafe { alloc.dealloc(c, l) };
        check(&alloc);
    }

    #[test]
    fn realloc_shrink_preserves_prefix() {
        let (alloc, _buf) = fresh(32 * 1024);
        let l = Layout::from_size_align(512, 8).unwrap();
        let p = unsafe { alloc.alloc(l) };
        assert!(!p.is_null());
        unsafe {
            core::ptr::write_bytes(p, 0xAB, 512);
        }
        let q = unsafe { alloc.realloc(p, l, 64) };
        assert!(!q.is_null());
        let bytes = unsafe { core::slice::from_raw_parts(q, 64) };
        assert!(bytes.iter().all(|&b| b == 0xAB));
        check(&alloc);
    }

    #[test]
    fn realloc_grow_may_move() {
        let (alloc, _buf) = fresh(64 * 1024);
        let l = Layout::from_size_align(64, 8).unwrap();
        let p = unsafe { alloc.alloc(l) };
        assert!(!p.is_null());
        unsafe {
            core::ptr::write_bytes(p, 0x42, 64);
        }
        let q = unsafe { alloc.realloc(p, l, 4096) };
        assert!(!q.is_null());
        let bytes = unsafe { core::slice::from_raw_parts(q, 64) };
        assert!(bytes.iter().all(|&b| b == 0x42));
        check(&alloc);
    }

    #[test]
    fn exhaustion_returns_null() {
        let (alloc, _buf) = fresh(8192);
        let l = Layout::from_size_align(1024 * 1024, 8).unwrap();
        let p = unsafe { alloc.alloc(l) };
        assert!(p.is_null());
        check(&alloc);
    }

    #[test]
    fn alignment_constraints_respected() {
        // The engine's minimum alignment is 8 (the header width); every
        // payload address is header-aligned regardless of the requested
        // layout's own alignment.
        let (alloc, _buf) = fresh(32 * 1024);
        let p = unsafe { alloc.alloc(Layout::from_size_align(24, 8).unwrap()) } as usize;
        assert_ne!(p, 0);
        assert_eq!(p % 8, 0);
    }

    #[test]
    fn malloc_zero_lands_on_the_same_chunk_as_tiny_requests() {
        // `GlobalAlloc::alloc` forbids a zero-size `Layout`, so this probes
        // `Heap::malloc` directly: a 0-byte request must still be a valid,
        // freeable pointer into a 32-byte chunk, indistinguishable from
        // `malloc(1)`/`malloc(24)`.
        let mut buf = std::vec![0u8; 32 * 1024];
        let mut heap: Heap = Heap::new();
        unsafe { heap.init(buf.as_mut_ptr() as usize, buf.len()) };

        let p0 = unsafe { heap.malloc(0) };
        assert!(!p0.is_null());
        assert_eq!(p0 as usize % 8, 0);
        unsafe { heap.free(p0) };
        heap.check();

        let p1 = unsafe { heap.malloc(1) };
        assert!(!p1.is_null());
        unsafe { heap.free(p1) };
        let p24 = unsafe { heap.malloc(24) };
        assert!(!p24.is_null());
        // Freed in LIFO order from an otherwise-untouched heap, all three
        // requests must land on the exact same 32-byte chunk.
        assert_eq!(p1 as usize, p0 as usize);
        assert_eq!(p24 as usize, p0 as usize);
        heap.check();
    }

    #[cfg(feature = "fastbin")]
    #[test]
    fn fast_bin_round_trip() {
        let (alloc, _buf) = fresh(64 * 1024);
        let l = Layout::from_size_align(24, 8).unwrap();
        let mut ptrs = std::vec![core::ptr::null_mut(); 300];
        for p in ptrs.iter_mut() {
            *p = unsafe { alloc.alloc(l) };
            assert!(!p.is_null());
        }
        for &p in &ptrs {
            unsafe { alloc.dealloc(p, l) };
        }
        let reused = unsafe { alloc.alloc(l) };
        assert!(!reused.is_null());
        check(&alloc);
    }

    #[test]
    fn invariants_hold_across_repeated_brk_growth() {
        // Forces many successive `grow()` calls (the initial arena page is
        // nowhere near big enough for this many live 4 KiB-class blocks) and
        // re-checks every invariant after every single op, not just at the
        // end — this is exactly where a miscomputed new-chunk/tail-sentinel
        // boundary across a brk extension would show up.
        let (alloc, _buf) = fresh(512 * 1024);
        let l = Layout::from_size_align(3000, 8).unwrap();
        let mut live: std::vec::Vec<*mut u8> = std::vec::Vec::new();
        for i in 0..40 {
            let p = unsafe { alloc.alloc(l) };
            assert!(!p.is_null(), "alloc #{i} unexpectedly exhausted the arena");
            unsafe {
                core::ptr::write_bytes(p, (i % 256) as u8, 3000);
            }
            live.push(p);
            check(&alloc);
            if i % 3 == 0 {
                let dead = live.remove(0);
                unsafe { alloc.dealloc(dead, l) };
                check(&alloc);
            }
        }
        for p in live {
            unsafe { alloc.dealloc(p, l) };
            check(&alloc);
        }
    }
}
