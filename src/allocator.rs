use std::{ptr::NonNull, sync::Mutex};

use crate::{
    arena::Arena,
    brk::HeapGrower,
    error::{AllocError, ReleaseError},
};

/// The thread safe public interface: one [`Arena`] behind one global
/// [`Mutex`]. Every operation takes the lock before the first header is read
/// and holds it until the last link is written, so concurrent callers never
/// observe a half updated list and heap growth (a process global, non
/// reentrant affair) is always serialized.
///
/// This is deliberately the simplest correct design. No lock free fast path,
/// no sharding, no per thread arenas: throughput under contention is traded
/// for a lock scope that's trivially easy to audit. A caller blocks for as
/// long as another thread holds the lock, including across a heap growth
/// call into the operating system; there are no timeouts. The lock is not
/// recursive, so `allocate`/`release` must never be reentered from code that
/// already holds it (a signal handler, for instance) or the process
/// deadlocks.
///
/// # Examples
///
/// ```
/// use brkalloc::{Brkalloc, FixedHeap};
///
/// let allocator = Brkalloc::with_grower(FixedHeap::with_capacity(4096));
///
/// let ptr = allocator.allocate(128).unwrap();
/// unsafe { ptr.as_ptr().write(42) };
/// allocator.release(ptr).unwrap();
/// ```
///
/// On Unix the allocator can sit on the real program break:
///
/// ```no_run
/// use brkalloc::Brkalloc;
///
/// static ALLOCATOR: Brkalloc = Brkalloc::new();
///
/// let ptr = ALLOCATOR.allocate(64).unwrap();
/// ALLOCATOR.release(ptr).unwrap();
/// ```
pub struct Brkalloc<G: HeapGrower = DefaultGrower> {
    arena: Mutex<Arena<G>>,
}

/// Grower used by [`Brkalloc::new`]: the real program break on Unix, a slab
/// under Miri (where `sbrk` is unavailable).
#[cfg(all(unix, not(miri)))]
pub type DefaultGrower = crate::ProgramBreak;
#[cfg(not(all(unix, not(miri))))]
pub type DefaultGrower = crate::FixedHeap;

impl<G: HeapGrower> Brkalloc<G> {
    /// Wraps an empty arena over `grower`. No memory is requested until the
    /// first allocation.
    pub const fn with_grower(grower: G) -> Self {
        Self {
            arena: Mutex::new(Arena::with_grower(grower)),
        }
    }

    /// Thread safe [`Arena::allocate`]: at least `size` usable, word aligned
    /// bytes or [`AllocError::OutOfMemory`].
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        match self.arena.lock() {
            Ok(mut arena) => arena.allocate(size),
            Err(_) => Err(AllocError::OutOfMemory),
        }
    }

    /// Thread safe [`Arena::release`]. Invalid and stale pointers are
    /// reported as [`ReleaseError::InvalidPointer`] instead of corrupting
    /// the heap.
    pub fn release(&self, ptr: NonNull<u8>) -> Result<(), ReleaseError> {
        match self.arena.lock() {
            Ok(mut arena) => arena.release(ptr),
            Err(_) => Err(ReleaseError::InvalidPointer),
        }
    }
}

#[cfg(all(unix, not(miri)))]
impl Brkalloc {
    /// An allocator over the real program break.
    pub const fn new() -> Self {
        Self::with_grower(crate::ProgramBreak)
    }
}

#[cfg(all(unix, not(miri)))]
impl Default for Brkalloc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Barrier, thread};

    use test_log::test;

    use super::*;
    use crate::brk::FixedHeap;

    #[test]
    fn facade_round_trip() {
        let allocator = Brkalloc::with_grower(FixedHeap::with_capacity(1 << 16));

        let first = allocator.allocate(8).unwrap();
        let second = allocator.allocate(4096).unwrap();

        unsafe {
            first.as_ptr().write(69);
            for i in 0..4096 {
                second.as_ptr().add(i).write(42);
            }

            assert_eq!(first.as_ptr().read(), 69);
            for i in 0..4096 {
                assert_eq!(second.as_ptr().add(i).read(), 42);
            }
        }

        allocator.release(first).unwrap();
        allocator.release(second).unwrap();

        allocator.arena.lock().unwrap().assert_list_integrity();
    }

    /// All threads allocate at the same time, hold their payloads across a
    /// barrier, then release. Overlapping payloads would show up as torn
    /// thread ids.
    #[test]
    fn multiple_threads_synchronized_allocs_and_releases() {
        let allocator = Brkalloc::with_grower(FixedHeap::with_capacity(1 << 20));

        let num_threads = 8;
        let barrier = Barrier::new(num_threads);

        thread::scope(|scope| {
            for id in 0..num_threads as u8 {
                let allocator = &allocator;
                let barrier = &barrier;

                scope.spawn(move || {
                    let num_bytes = 1024;
                    let addr = allocator.allocate(num_bytes).unwrap();

                    unsafe {
                        for i in 0..num_bytes {
                            addr.as_ptr().add(i).write(id);
                        }
                    }

                    barrier.wait();

                    unsafe {
                        for i in 0..num_bytes {
                            assert_eq!(addr.as_ptr().add(i).read(), id);
                        }
                    }

                    allocator.release(addr).unwrap();
                });
            }
        });

        let arena = allocator.arena.lock().unwrap();
        arena.assert_list_integrity();
        assert_eq!(arena.free_blocks(), arena.blocks());
    }

    /// Threads allocate and release interchangeably with different sizes, so
    /// splitting, coalescing and heap growth all race on the one lock.
    #[test]
    fn multiple_threads_unsynchronized_allocs_and_releases() {
        let allocator = Brkalloc::with_grower(FixedHeap::with_capacity(1 << 24));

        let num_threads = 8;
        let barrier = Barrier::new(num_threads);

        thread::scope(|scope| {
            for _ in 0..num_threads {
                let allocator = &allocator;
                let barrier = &barrier;

                scope.spawn(move || {
                    // Contention over blocks of the same size as well as
                    // requests only heap growth can satisfy.
                    let sizes = [16, 256, 1024, 2048, 4096];

                    // Miri is really slow, but we don't need as many
                    // operations to find bugs with it.
                    let num_allocs = if cfg!(miri) { 10 } else { 500 };

                    for size in sizes {
                        barrier.wait();
                        for round in 0..num_allocs {
                            let addr = allocator.allocate(size).unwrap();
                            let value = (round % 256) as u8;

                            unsafe {
                                addr.as_ptr().write(value);
                                addr.as_ptr().add(size / 2).write(value);
                                addr.as_ptr().add(size - 1).write(value);

                                assert_eq!(addr.as_ptr().read(), value);
                                assert_eq!(addr.as_ptr().add(size / 2).read(), value);
                                assert_eq!(addr.as_ptr().add(size - 1).read(), value);
                            }

                            allocator.release(addr).unwrap();
                        }
                    }
                });
            }
        });

        let arena = allocator.arena.lock().unwrap();
        arena.assert_list_integrity();
        assert_eq!(arena.free_blocks(), arena.blocks());
    }

    #[cfg(all(unix, not(miri)))]
    #[test]
    fn program_break_smoke() {
        let allocator = Brkalloc::new();

        let ptr = allocator.allocate(32).unwrap();
        unsafe {
            ptr.as_ptr().write(7);
            assert_eq!(ptr.as_ptr().read(), 7);
        }
        allocator.release(ptr).unwrap();

        // The freed block is reused without another trip to sbrk.
        let again = allocator.allocate(32).unwrap();
        assert_eq!(again, ptr);
        allocator.release(again).unwrap();
    }
}
