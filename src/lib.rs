//! First-fit heap allocator backed by an sbrk-style memory source.
//!
//! The allocator manages one contiguous heap obtained incrementally from the
//! operating system by moving the program break (or any other boundary that
//! behaves like it, see [`HeapGrower`]). Every allocation is a block: a small
//! header followed by the caller's payload, and the headers chain all blocks
//! into a doubly linked list that covers the heap in address order with no
//! gaps:
//!
//! ```text
//!   base                                                      boundary
//!    |                                                           |
//!    v                                                           v
//!    +--------+----------+--------+----------+--------+----------+
//!    | Header | Payload  | Header | Payload  | Header | Payload  |
//!    |  used  |          |  free  |          |  used  |          |
//!    +--------+----------+--------+----------+--------+----------+
//!        |        ^  |       ^ |      ^  |       ^
//!        +--------|--+       | +------|--+       |
//!                 +----------+        +----------+
//!                  next / prev links (byte offsets)
//! ```
//!
//! Allocation scans that list for the first free block big enough (first
//! fit), splits off the unused tail when it is worth a header, and falls back
//! to growing the heap when nothing fits. Release walks the same list to find
//! the block by payload address, so foreign pointers and double frees are
//! rejected instead of corrupting the heap, and merges the block into its
//! predecessor when that one is already free. Merging only looks backward;
//! a free successor is left for a later release to pick up, which is a known
//! fragmentation limitation of this design.
//!
//! Two entry points:
//!
//! * [`Arena`] - the single threaded core. An owned context, so independent
//!   arenas (over separate growers) can coexist, which is also how the tests
//!   run many heaps side by side.
//! * [`Brkalloc`] - [`Arena`] behind a global [`std::sync::Mutex`], the
//!   thread safe interface. The lock covers whole operations, list traversal
//!   through the last link update, because the block list and the heap
//!   boundary are one shared resource.
//!
//! Out of scope by design: thread local arenas, size class buckets, realloc
//! style resizing, returning memory to the operating system, and non sbrk
//! memory sources such as `mmap`.

mod align;
mod allocator;
mod arena;
mod block;
mod brk;
mod error;

use std::ptr::NonNull;

/// Non-null pointer to `T`, or nothing. Used instead of `*mut T` wherever an
/// address can legitimately be absent so the compiler forces us to handle the
/// `None` case.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

pub use align::align;
pub use allocator::{Brkalloc, DefaultGrower};
pub use arena::Arena;
pub use brk::{FixedHeap, HeapGrower};
#[cfg(all(unix, not(miri)))]
pub use brk::ProgramBreak;
pub use error::{AllocError, ReleaseError};
