use std::ptr::NonNull;

use log::{debug, trace, warn};

use crate::{
    align::align,
    block::{BlockRef, Header, Link, HEADER_SIZE, MIN_BLOCK_SIZE},
    brk::HeapGrower,
    error::{AllocError, ReleaseError},
    Pointer,
};

/// Requests above this size are refused outright. Keeps the header math below
/// clear of `usize` overflow; nothing this large could be granted anyway.
const MAX_REQUEST: usize = isize::MAX as usize - HEADER_SIZE;

/// An owned allocator context: one heap, one grower, one block list. This is
/// the single threaded core, it needs `&mut self` for everything and knows
/// nothing about locks; [`crate::Brkalloc`] wraps it in a [`std::sync::Mutex`]
/// to produce the shared, thread safe interface. Independent arenas never
/// interfere with each other as long as they don't share a boundary (two
/// arenas over [`crate::ProgramBreak`] would, two [`crate::FixedHeap`] arenas
/// never do).
///
/// The heap is managed as one contiguous run of blocks starting at `base`:
///
/// ```text
///              base                                     base + len
///               |                                           |
///               v                                           v
///               +--------+---------+--------+-------+-------+
///               | Header | Payload | Header |  Pay  |  ...  |
///               +--------+---------+--------+-------+-------+
///               ^                  ^
///               |                  |
///             offset 0        offset HEADER_SIZE + size
/// ```
///
/// Blocks are addressed by their byte offset from `base` and all header
/// reads and writes go through bounds checked accessors, never through casts
/// of caller supplied addresses.
pub struct Arena<G> {
    /// Where new heap memory comes from.
    grower: G,
    /// Heap base address. `None` until the first allocation succeeds.
    base: Pointer<u8>,
    /// Total bytes obtained from the grower, headers included.
    len: usize,
    /// First block in address order.
    head: Link,
    /// Last block in address order. This is always the append point for new
    /// blocks, so failed searches don't need to report where they stopped.
    tail: Link,
    /// Number of blocks in the list.
    blocks: usize,
    /// Number of blocks currently marked free.
    free_blocks: usize,
}

// The arena exclusively owns the heap region behind `base`; no other copy of
// these pointers exists outside of payloads handed to callers, which are
// their responsibility.
unsafe impl<G: Send> Send for Arena<G> {}

impl<G: HeapGrower> Arena<G> {
    /// Creates an empty arena on top of `grower`. No memory is requested
    /// until the first call to [`Arena::allocate`].
    pub const fn with_grower(grower: G) -> Self {
        Self {
            grower,
            base: None,
            len: 0,
            head: None,
            tail: None,
            blocks: 0,
            free_blocks: 0,
        }
    }

    /// Allocates at least `size` usable, word aligned bytes.
    ///
    /// Zero sized requests are accepted and produce a minimal word sized
    /// block, so the returned pointer is valid (and releasable) even though
    /// nothing useful fits in it.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfMemory`] when no free block fits and the grower
    /// refuses to extend the heap. The heap is left unchanged in that case.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size > MAX_REQUEST {
            return Err(AllocError::OutOfMemory);
        }

        let size = align(size).max(MIN_BLOCK_SIZE);

        let block = match self.find_fit(size) {
            Some(block) => block,
            None => self.extend(size)?,
        };

        self.split_if_possible(block, size);

        let mut header = self.read(block);
        if header.is_free {
            header.is_free = false;
            self.write(block, header);
            self.free_blocks -= 1;
        }

        trace!("allocated {} bytes at offset {}", header.size, block.0);

        Ok(self.payload_ptr(block))
    }

    /// Releases a pointer previously returned by [`Arena::allocate`]. The
    /// block is either merged into a free predecessor or marked free for
    /// reuse.
    ///
    /// # Errors
    ///
    /// [`ReleaseError::InvalidPointer`] when `ptr` does not match the payload
    /// address of any currently allocated block: foreign pointers, pointers
    /// into the middle of a payload, double releases and pointers whose block
    /// was already coalesced away. The list is left unchanged.
    pub fn release(&mut self, ptr: NonNull<u8>) -> Result<(), ReleaseError> {
        let block = self.find_block(ptr).ok_or(ReleaseError::InvalidPointer)?;

        let mut header = self.read(block);
        if header.is_free {
            // Double release of a block that wasn't coalesced yet.
            return Err(ReleaseError::InvalidPointer);
        }

        if let Some(prev) = header.prev {
            if self.read(prev).is_free {
                self.merge_into_prev(block, prev);
                trace!("released offset {} into its predecessor", block.0);
                return Ok(());
            }
        }

        header.is_free = true;
        self.write(block, header);
        self.free_blocks += 1;

        trace!("released {} bytes at offset {}", header.size, block.0);

        Ok(())
    }

    /// Number of blocks in the heap, free and used.
    pub fn blocks(&self) -> usize {
        self.blocks
    }

    /// Number of blocks currently available for reuse.
    pub fn free_blocks(&self) -> usize {
        self.free_blocks
    }

    /// Total bytes obtained from the grower so far, headers included.
    pub fn heap_len(&self) -> usize {
        self.len
    }

    /// First-fit scan: the first free block in address order that can hold
    /// `size` bytes, or `None` if the list is exhausted (or was never
    /// created).
    fn find_fit(&self, size: usize) -> Link {
        let mut current = self.head;

        while let Some(block) = current {
            let header = self.read(block);

            if header.is_free && header.size >= size {
                return Some(block);
            }

            current = header.next;
        }

        None
    }

    /// Finds the block whose payload address is exactly `ptr`. Terminates
    /// with `None` at the end of the list, a pointer we never produced (or
    /// already coalesced away) must not send the scan into undefined memory.
    fn find_block(&self, ptr: NonNull<u8>) -> Link {
        let mut current = self.head;

        while let Some(block) = current {
            if self.payload_ptr(block) == ptr {
                return Some(block);
            }

            current = self.read(block).next;
        }

        None
    }

    /// Asks the grower for `HEADER_SIZE + size` bytes and appends the new
    /// block at the tail, already marked used. On failure nothing is
    /// published: no block, no length change.
    fn extend(&mut self, size: usize) -> Result<BlockRef, AllocError> {
        let total = HEADER_SIZE + size;

        let Some(boundary) = (unsafe { self.grower.grow_heap(total) }) else {
            debug!("heap grower refused {total} bytes");
            return Err(AllocError::OutOfMemory);
        };

        match self.base {
            None => self.base = Some(boundary),
            Some(base) => {
                // The grower contract says consecutive grows are contiguous.
                // If something else moved the boundary behind our back the
                // grown bytes are unusable; refusing them keeps the block
                // list valid, at the cost of leaking that grant.
                if boundary.as_ptr() != unsafe { base.as_ptr().add(self.len) } {
                    warn!("heap boundary moved by someone else, discarding the grown memory");
                    return Err(AllocError::OutOfMemory);
                }
            }
        }

        let block = BlockRef(self.len);
        self.len += total;

        self.write(
            block,
            Header {
                size,
                is_free: false,
                prev: self.tail,
                next: None,
            },
        );

        match self.tail {
            Some(tail) => {
                let mut before = self.read(tail);
                before.next = Some(block);
                self.write(tail, before);
            }
            None => self.head = Some(block),
        }

        self.tail = Some(block);
        self.blocks += 1;

        debug!("extended heap by {} bytes, {} in total", total, self.len);

        Ok(block)
    }

    /// Block splitting. If the block at `block` can hold `size` bytes plus
    /// another header and a minimal payload, its tail is carved off into a
    /// new free block:
    ///
    /// **Before**:
    ///
    /// ```text
    ///         +-->  +-----------+
    ///         |     |   Header  |
    /// Block   |     +-----------+
    ///         |     |  Content  | <- 64 bytes.
    ///         +-->  +-----------+
    /// ```
    ///
    /// **After** a request for 8 bytes:
    ///
    /// ```text
    ///         +-->  +-----------+
    ///         |     |   Header  |
    /// Block   |     +-----------+
    ///         |     |  Content  | <- 8 bytes.
    ///         +-->  +-----------+
    ///         |     |   Header  |
    /// Rest    |     +-----------+
    ///         |     |  Content  | <- 64 - 8 - HEADER_SIZE bytes, free.
    ///         +-->  +-----------+
    /// ```
    ///
    /// Remainders smaller than [`MIN_BLOCK_SIZE`] are not worth a header, in
    /// that case the block is left oversized and handed out as is. The
    /// block's own `is_free` flag is never touched here.
    fn split_if_possible(&mut self, block: BlockRef, size: usize) {
        let mut header = self.read(block);

        if header.size < size + HEADER_SIZE + MIN_BLOCK_SIZE {
            return;
        }

        let rest = BlockRef(block.payload_offset() + size);
        let rest_header = Header {
            size: header.size - size - HEADER_SIZE,
            is_free: true,
            prev: Some(block),
            next: header.next,
        };

        header.size = size;
        header.next = Some(rest);

        self.write(block, header);
        self.write(rest, rest_header);

        match rest_header.next {
            Some(next) => {
                let mut after = self.read(next);
                after.prev = Some(rest);
                self.write(next, after);
            }
            None => self.tail = Some(rest),
        }

        self.blocks += 1;
        self.free_blocks += 1;
    }

    /// Backward coalescing, the inverse of [`Arena::split_if_possible`]. The
    /// free predecessor absorbs the freed block's header and payload and the
    /// freed block's identity is gone:
    ///
    /// ```text
    /// +----------------+----------------+
    /// |  Prev (free)   | Block (freed)  |
    /// +----------------+----------------+
    ///         ^                 |
    ///         |                 |
    ///         +-----------------+
    ///            Merge into prev
    /// ```
    ///
    /// Only this single backward step is performed. A free successor is left
    /// alone, which can leave two adjacent free blocks behind; a later
    /// release of the block before them will not pick both up either. Known
    /// limitation of this design, recoverable fragmentation stays behind.
    fn merge_into_prev(&mut self, block: BlockRef, prev: BlockRef) {
        let header = self.read(block);
        let mut merged = self.read(prev);

        merged.size += header.total_size();
        merged.next = header.next;
        self.write(prev, merged);

        match header.next {
            Some(next) => {
                let mut after = self.read(next);
                after.prev = Some(prev);
                self.write(next, after);
            }
            None => self.tail = Some(prev),
        }

        self.blocks -= 1;
        // The absorbed block never counted as free on its own, so the free
        // block count is unchanged.
    }

    /// Address of the header at `block`, checked against the grown heap.
    /// Block references are produced only by this arena, so a violation is an
    /// internal bug and panics rather than corrupting memory.
    fn header_ptr(&self, block: BlockRef) -> *mut Header {
        assert!(
            self.base.is_some() && block.0 + HEADER_SIZE <= self.len,
            "block offset {} escapes the {} byte heap",
            block.0,
            self.len,
        );

        unsafe { self.base.unwrap().as_ptr().add(block.0).cast::<Header>() }
    }

    /// Reads the header at `block` by value.
    fn read(&self, block: BlockRef) -> Header {
        unsafe { self.header_ptr(block).read() }
    }

    /// Writes the header at `block`.
    fn write(&mut self, block: BlockRef, header: Header) {
        unsafe { self.header_ptr(block).write(header) }
    }

    /// Payload address of `block`, the pointer callers get and give back.
    fn payload_ptr(&self, block: BlockRef) -> NonNull<u8> {
        let end = block.payload_offset() + self.read(block).size;
        assert!(end <= self.len, "payload of block {} escapes the heap", block.0);

        unsafe {
            NonNull::new_unchecked(
                self.base.unwrap().as_ptr().add(block.payload_offset()),
            )
        }
    }

    /// Walks the whole list and checks every structural invariant: blocks
    /// cover the heap contiguously in address order, links are mutual
    /// inverses and the bookkeeping counters match reality.
    #[cfg(test)]
    pub(crate) fn assert_list_integrity(&self) {
        let mut expected_offset = 0;
        let mut prev: Link = None;
        let mut blocks = 0;
        let mut free_blocks = 0;

        let mut current = self.head;
        while let Some(block) = current {
            assert_eq!(block.0, expected_offset, "gap or overlap in the block list");

            let header = self.read(block);
            assert_eq!(header.prev, prev, "broken back link at offset {}", block.0);
            assert_eq!(header.size % MIN_BLOCK_SIZE, 0, "unaligned block size");
            assert!(header.size >= MIN_BLOCK_SIZE, "degenerate block");

            if header.is_free {
                free_blocks += 1;
            }
            blocks += 1;

            expected_offset = block.payload_offset() + header.size;
            prev = Some(block);
            current = header.next;
        }

        assert_eq!(expected_offset, self.len, "list does not cover the heap");
        assert_eq!(prev, self.tail, "tail is not the last block");
        assert_eq!(blocks, self.blocks, "block counter out of sync");
        assert_eq!(free_blocks, self.free_blocks, "free counter out of sync");
    }
}

#[cfg(all(unix, not(miri)))]
impl Arena<crate::ProgramBreak> {
    /// An arena over the real program break.
    pub const fn new() -> Self {
        Self::with_grower(crate::ProgramBreak)
    }
}

#[cfg(all(unix, not(miri)))]
impl Default for Arena<crate::ProgramBreak> {
    fn default() -> Self {
        Self::new()
    }
}
