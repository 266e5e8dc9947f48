//! The Kernel Heap
//!
//! Boundary-tag allocator over one contiguous arena. Every block is framed
//! by a header and footer word, both encoding `size << 1 | used`, so each
//! neighbor is reachable in O(1) and free neighbors coalesce eagerly: no
//! two free blocks are ever adjacent.

use core::alloc::{GlobalAlloc, Layout};
use core::mem::size_of;
use core::ptr::{self, NonNull};
use spin::Mutex;
use x86_64::{structures::paging::PageTableFlags, VirtAddr};

use crate::constants::memory::{FRAME_SIZE, HEAP_SIZE, HEAP_START};
use crate::memory::bitmap_frame_allocator::BitmapFrameAllocator;
use crate::memory::paging::{AddressSpace, PagingError};

const HEADER_SIZE: usize = size_of::<usize>();
const FOOTER_SIZE: usize = size_of::<usize>();
const METADATA_SIZE: usize = HEADER_SIZE + FOOTER_SIZE;

/// Payload alignment granularity; requested sizes round up to this.
const ALIGNMENT: usize = size_of::<usize>();

/// One boundary tag: `size << 1 | used`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Tag(usize);

impl Tag {
    fn new(size: usize, used: bool) -> Self {
        Tag(size << 1 | used as usize)
    }

    fn size(self) -> usize {
        self.0 >> 1
    }

    fn is_used(self) -> bool {
        self.0 & 1 != 0
    }
}

/// Body size of a block absorbing its right neighbor: the tag pair between
/// them is reclaimed into the merged body. A three-way merge is two
/// applications of this.
fn coalesced_size(first: usize, second: usize) -> usize {
    first + second + METADATA_SIZE
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// A boundary-tag heap over `[start, start + size)`.
///
/// The arena is fixed at construction; blocks are split on allocation,
/// merged on free and grown in place on realloc within that footprint.
pub struct KernelHeap {
    start: usize,
    size: usize,
}

impl KernelHeap {
    /// Describe `size` bytes at `start` as a single free block.
    ///
    /// # Safety
    /// The range must be mapped, writable, word-aligned and reserved for
    /// this heap for its whole lifetime.
    pub unsafe fn new(start: usize, size: usize) -> Self {
        let mut heap = KernelHeap { start, size };
        unsafe { heap.write_tags(start, Tag::new(size - METADATA_SIZE, false)) };
        heap
    }

    /// First-fit allocation of `size` bytes, zeroed and aligned to the
    /// word granularity. Returns `None` when no free block fits.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let size = align_up(size.max(1), ALIGNMENT);

        let mut header = self.start;
        while header < self.end() {
            let tag = unsafe { self.read_tag(header) };
            if !tag.is_used() && tag.size() >= size {
                unsafe {
                    self.split_block(header, size);
                    let payload = (header + HEADER_SIZE) as *mut u8;
                    ptr::write_bytes(payload, 0, size);
                    return NonNull::new(payload);
                }
            }
            header += METADATA_SIZE + tag.size();
        }
        None
    }

    /// Release the block owning `ptr` and coalesce unconditionally; a
    /// forward and a backward merge may both apply in one call.
    ///
    /// # Safety
    /// `ptr` must be a payload pointer returned by this heap, not yet
    /// freed.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let header = ptr.as_ptr() as usize - HEADER_SIZE;
        let tag = unsafe { self.read_tag(header) };
        debug_assert!(
            tag.is_used(),
            "double free at arena offset {:#x}",
            header - self.start
        );

        unsafe {
            let freed = Tag::new(tag.size(), false);
            self.write_tags(header, freed);

            if let Some(next) = self.next_header(header, freed) {
                if !self.read_tag(next).is_used() {
                    self.merge_block(header, next);
                }
            }
            if let Some(prev) = self.prev_header(header) {
                if !self.read_tag(prev).is_used() {
                    self.merge_block(prev, header);
                }
            }
        }
    }

    /// Resize the block owning `ptr`, preferring in-place growth: forward
    /// merge, then backward merge, then a three-way merge, each re-split
    /// to the requested size; relocation is the last resort. The returned
    /// pointer replaces `ptr`.
    ///
    /// # Safety
    /// `ptr` must be a payload pointer returned by this heap, not yet
    /// freed.
    pub unsafe fn realloc(&mut self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        let size = align_up(size.max(1), ALIGNMENT);
        let header = ptr.as_ptr() as usize - HEADER_SIZE;
        let tag = unsafe { self.read_tag(header) };
        let live = tag.size();

        unsafe {
            let next_free = self
                .next_header(header, tag)
                .map(|next| (next, self.read_tag(next)))
                .filter(|(_, tag)| !tag.is_used())
                .map(|(next, tag)| (next, tag.size()));
            let prev_free = self
                .prev_header(header)
                .map(|prev| (prev, self.read_tag(prev)))
                .filter(|(_, tag)| !tag.is_used())
                .map(|(prev, tag)| (prev, tag.size()));

            if let Some((next, next_size)) = next_free {
                if coalesced_size(live, next_size) >= size {
                    self.merge_block(header, next);
                    self.split_block(header, size);
                    self.zero_grown(header, live, size);
                    return NonNull::new((header + HEADER_SIZE) as *mut u8);
                }
            }

            if let Some((prev, prev_size)) = prev_free {
                if coalesced_size(prev_size, live) >= size {
                    return Some(self.merge_backward(prev, header, live, size));
                }

                if let Some((next, next_size)) = next_free {
                    let threeway = coalesced_size(coalesced_size(prev_size, live), next_size);
                    if threeway >= size {
                        self.merge_block(header, next);
                        return Some(self.merge_backward(prev, header, live, size));
                    }
                }
            }

            // Relocate: the fallback block is disjoint from every live one.
            let new = self.allocate(size)?;
            ptr::copy(ptr.as_ptr(), new.as_ptr(), live.min(size));
            self.free(ptr);
            Some(new)
        }
    }

    /// Walk the arena verifying tag agreement, exact coverage and the
    /// no-two-adjacent-free invariant.
    #[cfg(any(test, debug_assertions))]
    pub fn check_consistency(&self) {
        let mut header = self.start;
        let mut prev_free = false;
        while header < self.end() {
            let tag = unsafe { self.read_tag(header) };
            let free = !tag.is_used();
            assert!(
                !(prev_free && free),
                "adjacent free blocks at arena offset {:#x}",
                header - self.start
            );
            prev_free = free;
            header += METADATA_SIZE + tag.size();
        }
        assert_eq!(header, self.end(), "blocks do not tile the arena");
    }

    fn end(&self) -> usize {
        self.start + self.size
    }

    /// Carve `size` bytes off the front of the block at `header`, marking
    /// the front used. The remainder becomes its own free block unless it
    /// cannot hold a tag pair, in which case the whole block is consumed.
    unsafe fn split_block(&mut self, header: usize, size: usize) {
        let total = unsafe { self.read_tag(header) }.size();
        debug_assert!(total >= size);

        if total < size + METADATA_SIZE {
            unsafe { self.write_tags(header, Tag::new(total, true)) };
            return;
        }

        unsafe {
            self.write_tags(header, Tag::new(size, true));
            let remainder = header + METADATA_SIZE + size;
            self.write_tags(remainder, Tag::new(total - size - METADATA_SIZE, false));
        }
    }

    /// Absorb the adjacent block `second` into `first`. The merged block
    /// keeps `first`'s used bit.
    unsafe fn merge_block(&mut self, first: usize, second: usize) {
        let first_tag = unsafe { self.read_tag(first) };
        let second_tag = unsafe { self.read_tag(second) };
        debug_assert_eq!(first + METADATA_SIZE + first_tag.size(), second);

        let merged = coalesced_size(first_tag.size(), second_tag.size());
        unsafe { self.write_tags(first, Tag::new(merged, first_tag.is_used())) };
    }

    /// Merge the live block at `header` into the free block `prev`, moving
    /// the payload forward. Source and destination overlap whenever the
    /// previous block is smaller than the payload, so the copy must be
    /// overlap-safe. All tags are read before the copy can clobber them.
    unsafe fn merge_backward(
        &mut self,
        prev: usize,
        header: usize,
        live: usize,
        size: usize,
    ) -> NonNull<u8> {
        unsafe {
            let prev_size = self.read_tag(prev).size();
            let cur_size = self.read_tag(header).size();
            let merged = coalesced_size(prev_size, cur_size);

            let dst = (prev + HEADER_SIZE) as *mut u8;
            ptr::copy((header + HEADER_SIZE) as *const u8, dst, live);

            self.write_tags(prev, Tag::new(merged, true));
            self.split_block(prev, size);
            self.zero_grown(prev, live, size);
            NonNull::new_unchecked(dst)
        }
    }

    /// Zero the grown tail of a block that expanded in place; the absorbed
    /// bytes still hold stale tags and payload.
    unsafe fn zero_grown(&mut self, header: usize, old_size: usize, new_size: usize) {
        if new_size > old_size {
            let grown = (header + HEADER_SIZE + old_size) as *mut u8;
            unsafe { ptr::write_bytes(grown, 0, new_size - old_size) };
        }
    }

    /// Header of the following block, `None` at the arena end.
    unsafe fn next_header(&self, header: usize, tag: Tag) -> Option<usize> {
        let next = header + METADATA_SIZE + tag.size();
        debug_assert!(next <= self.end());
        (next < self.end()).then_some(next)
    }

    /// Header of the preceding block, `None` at the arena start.
    unsafe fn prev_header(&self, header: usize) -> Option<usize> {
        if header == self.start {
            return None;
        }
        let prev_footer = unsafe { Tag(*((header - FOOTER_SIZE) as *const usize)) };
        Some(header - METADATA_SIZE - prev_footer.size())
    }

    /// Write matching header and footer for the block at `header`.
    unsafe fn write_tags(&mut self, header: usize, tag: Tag) {
        unsafe {
            *(header as *mut usize) = tag.0;
            *((header + HEADER_SIZE + tag.size()) as *mut usize) = tag.0;
        }
    }

    unsafe fn read_tag(&self, header: usize) -> Tag {
        let tag = unsafe { Tag(*(header as *const usize)) };
        debug_assert_eq!(
            tag,
            unsafe { Tag(*((header + HEADER_SIZE + tag.size()) as *const usize)) },
            "boundary tags disagree at arena offset {:#x}",
            header - self.start
        );
        tag
    }
}

/// The kernel's global allocator: the boundary-tag heap behind a spinlock.
pub struct LockedHeap(Mutex<Option<KernelHeap>>);

#[cfg_attr(all(not(test), target_os = "none"), global_allocator)]
pub static ALLOCATOR: LockedHeap = LockedHeap(Mutex::new(None));

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut guard = self.0.lock();
        let Some(heap) = guard.as_mut() else {
            return ptr::null_mut();
        };
        if layout.align() <= ALIGNMENT {
            return heap
                .allocate(layout.size())
                .map_or(ptr::null_mut(), NonNull::as_ptr);
        }
        // Over-aligned request: over-allocate and stash the real payload
        // address one word below the aligned pointer.
        let Some(raw) = heap.allocate(layout.size() + layout.align()) else {
            return ptr::null_mut();
        };
        let raw = raw.as_ptr() as usize;
        let aligned = align_up(raw + ALIGNMENT, layout.align());
        unsafe { *((aligned - size_of::<usize>()) as *mut usize) = raw };
        aligned as *mut u8
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let mut guard = self.0.lock();
        let Some(heap) = guard.as_mut() else {
            return;
        };
        let payload = if layout.align() <= ALIGNMENT {
            ptr as usize
        } else {
            unsafe { *((ptr as usize - size_of::<usize>()) as *const usize) }
        };
        if let Some(payload) = NonNull::new(payload as *mut u8) {
            unsafe { heap.free(payload) };
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            // Rare path: relocate through alloc and copy, keeping the
            // stash scheme out of the in-place merges.
            let new_layout =
                unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
            let new = unsafe { self.alloc(new_layout) };
            if !new.is_null() {
                unsafe {
                    ptr::copy(ptr, new, layout.size().min(new_size));
                    self.dealloc(ptr, layout);
                }
            }
            return new;
        }

        let mut guard = self.0.lock();
        let Some(heap) = guard.as_mut() else {
            return ptr::null_mut();
        };
        match NonNull::new(ptr) {
            Some(ptr) => unsafe {
                heap.realloc(ptr, new_size)
                    .map_or(ptr::null_mut(), NonNull::as_ptr)
            },
            None => ptr::null_mut(),
        }
    }
}

/// Obtain the heap arena from the frame allocator, map it at `HEAP_START`
/// and install it as the global allocator's backing store.
pub fn init_heap(
    space: &mut AddressSpace,
    alloc: &mut BitmapFrameAllocator,
) -> Result<(), PagingError> {
    let arena = alloc
        .allocate_contiguous(HEAP_SIZE.div_ceil(FRAME_SIZE))
        .ok_or(PagingError::FrameAllocationFailed)?;

    space.map_range(
        VirtAddr::new(HEAP_START),
        VirtAddr::new(HEAP_START + HEAP_SIZE as u64),
        arena.start_address().as_u64().wrapping_sub(HEAP_START),
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE,
        alloc,
    )?;

    *ALLOCATOR.0.lock() = Some(unsafe { KernelHeap::new(HEAP_START as usize, HEAP_SIZE) });
    Ok(())
}
