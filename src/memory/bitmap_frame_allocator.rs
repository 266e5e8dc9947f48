//! Bitmap Frame Allocator
//!
//! - One bit per physical frame, bit set means allocated
//! - The bitmap hosts itself inside a usable region of the boot memory map
//! - A rotating cursor keeps steady-state allocation near O(1)

use crate::constants::memory::{BITMAP_ENTRY_SIZE, FRAME_SIZE, FULL_BITMAP_ENTRY};
use crate::memory::PhysRegion;
use core::mem::size_of;
use core::{ptr, slice};
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr, VirtAddr,
};

pub struct BitmapFrameAllocator {
    total_frames: usize,
    cursor: usize,
    bitmap: &'static mut [u64],
    phys_offset: VirtAddr,
}

impl BitmapFrameAllocator {
    /// Build the allocator from the distilled boot memory map.
    ///
    /// The bitmap covers every frame below the highest usable address and
    /// lives in the first usable region large enough to hold it. Its own
    /// frames are marked allocated, every other usable frame free, and every
    /// non-usable address permanently allocated. Returns `None` when no
    /// region can host the bitmap.
    ///
    /// # Safety
    /// `regions` must describe physical memory truthfully and `phys_offset`
    /// must map all of it.
    pub unsafe fn init(regions: &[PhysRegion], phys_offset: VirtAddr) -> Option<Self> {
        let top = regions
            .iter()
            .filter(|r| r.kind.is_usable())
            .map(|r| r.base + r.length)
            .max()? as usize;

        let total_frames = top.div_ceil(FRAME_SIZE);
        let bitmap_words = total_frames.div_ceil(BITMAP_ENTRY_SIZE);
        let bitmap_bytes = bitmap_words * size_of::<u64>();

        let host = regions
            .iter()
            .find(|r| r.kind.is_usable() && r.length as usize >= bitmap_bytes)?;
        let bitmap_base = host.base as usize;

        let bitmap = unsafe {
            let ptr = (phys_offset + host.base).as_mut_ptr::<u64>();
            slice::from_raw_parts_mut(ptr, bitmap_words)
        };
        bitmap.fill(FULL_BITMAP_ENTRY);

        let mut allocator = Self {
            total_frames,
            cursor: 0,
            bitmap,
            phys_offset,
        };

        // Clear the usable frames, then re-reserve the bitmap's own.
        for region in regions.iter().filter(|r| r.kind.is_usable()) {
            let start_frame = region.base as usize / FRAME_SIZE;
            let end_frame = (region.base + region.length) as usize / FRAME_SIZE;
            for frame_index in start_frame..end_frame {
                allocator.clear_bit(frame_index);
            }
        }
        let first_bitmap_frame = bitmap_base / FRAME_SIZE;
        for frame_index in first_bitmap_frame..first_bitmap_frame + bitmap_bytes.div_ceil(FRAME_SIZE)
        {
            allocator.set_bit(frame_index);
        }

        Some(allocator)
    }

    /// Allocate one frame, scanning from the rotating cursor with
    /// wraparound. The frame's contents are zeroed before it is handed out.
    pub fn allocate_frame(&mut self) -> Option<PhysFrame> {
        for _ in 0..self.total_frames {
            let index = self.cursor;
            self.cursor = (self.cursor + 1) % self.total_frames;
            if !self.is_bit_set(index) {
                self.set_bit(index);
                let addr = PhysAddr::new((index * FRAME_SIZE) as u64);
                unsafe { self.zero_frames(addr, 1) };
                return Some(PhysFrame::containing_address(addr));
            }
        }
        None
    }

    /// Allocate `count` physically contiguous frames under the same cursor
    /// discipline; a run never wraps past the end of the bitmap. The whole
    /// run is marked allocated and zeroed.
    pub fn allocate_contiguous(&mut self, count: usize) -> Option<PhysFrame> {
        if count == 0 || count > self.total_frames {
            return None;
        }

        let mut start = self.cursor;
        let mut wrapped = false;
        loop {
            if start + count > self.total_frames {
                if wrapped {
                    return None;
                }
                start = 0;
                wrapped = true;
            }
            match (start..start + count).find(|&index| self.is_bit_set(index)) {
                Some(used) => start = used + 1,
                None => {
                    for index in start..start + count {
                        self.set_bit(index);
                    }
                    let addr = PhysAddr::new((start * FRAME_SIZE) as u64);
                    unsafe { self.zero_frames(addr, count) };
                    self.cursor = (start + count) % self.total_frames;
                    return Some(PhysFrame::containing_address(addr));
                }
            }
        }
    }

    /// Release a frame. Contents are zeroed so stale data cannot leak to
    /// the next owner.
    pub fn free_frame(&mut self, frame: PhysFrame) {
        let index = frame.start_address().as_u64() as usize / FRAME_SIZE;
        debug_assert!(
            self.is_bit_set(index),
            "freeing frame {:?} which is not allocated",
            frame.start_address()
        );
        unsafe { self.zero_frames(frame.start_address(), 1) };
        self.clear_bit(index);
    }

    /// Number of free frames. Linear scan, diagnostic only.
    pub fn free_frame_count(&self) -> usize {
        self.bitmap
            .iter()
            .map(|word| word.count_zeros() as usize)
            .sum()
    }

    /// Check if frame is used. input: PhysFrame, output: bool
    pub fn is_frame_used(&self, frame: PhysFrame) -> bool {
        self.is_bit_set(frame.start_address().as_u64() as usize / FRAME_SIZE)
    }

    /// Frame contents are only reachable through the direct map.
    unsafe fn zero_frames(&mut self, start: PhysAddr, count: usize) {
        let ptr = (self.phys_offset + start.as_u64()).as_mut_ptr::<u8>();
        unsafe { ptr::write_bytes(ptr, 0, count * FRAME_SIZE) };
    }

    /// set a particular bit (1), taking in frame_index (usize)
    fn set_bit(&mut self, frame_index: usize) {
        assert!(frame_index < self.total_frames);

        let word_index = frame_index / BITMAP_ENTRY_SIZE;
        let bit_index = frame_index % BITMAP_ENTRY_SIZE;

        self.bitmap[word_index] |= 1 << bit_index;
    }

    /// clear a particular bit (0), taking in frame_index (usize)
    fn clear_bit(&mut self, frame_index: usize) {
        assert!(frame_index < self.total_frames);

        let word_index = frame_index / BITMAP_ENTRY_SIZE;
        let bit_index = frame_index % BITMAP_ENTRY_SIZE;

        self.bitmap[word_index] &= !(1 << bit_index);
    }

    /// check if bit is set at frame_index. returns true if bit == 1, false otherwise
    fn is_bit_set(&self, frame_index: usize) -> bool {
        assert!(frame_index < self.total_frames);

        let word_index = frame_index / BITMAP_ENTRY_SIZE;
        let bit_index = frame_index % BITMAP_ENTRY_SIZE;

        (self.bitmap[word_index] & (1 << bit_index)) != 0
    }
}

unsafe impl FrameAllocator<Size4KiB> for BitmapFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        BitmapFrameAllocator::allocate_frame(self)
    }
}

impl FrameDeallocator<Size4KiB> for BitmapFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        self.free_frame(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RegionKind;

    const F: u64 = FRAME_SIZE as u64;

    /// Simulated physical memory: a leaked, page-aligned buffer reached
    /// through a synthetic direct-map offset, exactly as real frames are
    /// reached through the bootloader's higher-half map.
    fn phys_offset(frames: usize) -> VirtAddr {
        let buf = vec![0u8; (frames + 1) * FRAME_SIZE].leak();
        let aligned = (buf.as_mut_ptr() as u64 + F - 1) & !(F - 1);
        VirtAddr::new(aligned)
    }

    /// 64 synthetic frames: two reserved holes, two usable runs of 30 and
    /// 24 frames. The bitmap needs one word and reserves one frame of the
    /// first usable run, leaving 53 allocatable frames.
    fn fixture() -> BitmapFrameAllocator {
        let offset = phys_offset(64);
        let regions = [
            PhysRegion { base: 0, length: 2 * F, kind: RegionKind::Reserved },
            PhysRegion { base: 2 * F, length: 30 * F, kind: RegionKind::Usable },
            PhysRegion { base: 32 * F, length: 8 * F, kind: RegionKind::Reserved },
            PhysRegion { base: 40 * F, length: 24 * F, kind: RegionKind::Usable },
        ];
        unsafe { BitmapFrameAllocator::init(&regions, offset) }.unwrap()
    }

    fn frame(index: u64) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new(index * F))
    }

    #[test]
    fn init_reserves_holes_and_bitmap() {
        let allocator = fixture();
        assert_eq!(allocator.free_frame_count(), 53);
        // Reserved holes stay allocated forever.
        assert!(allocator.is_frame_used(frame(0)));
        assert!(allocator.is_frame_used(frame(35)));
        // The bitmap hosts itself in the first usable frame.
        assert!(allocator.is_frame_used(frame(2)));
        assert!(!allocator.is_frame_used(frame(3)));
    }

    #[test]
    fn init_fails_without_a_host_region() {
        let offset = phys_offset(8);
        let regions = [PhysRegion { base: 0, length: 0, kind: RegionKind::Reserved }];
        assert!(unsafe { BitmapFrameAllocator::init(&regions, offset) }.is_none());
    }

    #[test]
    fn free_count_plus_allocated_is_conserved() {
        let mut allocator = fixture();
        let total = allocator.free_frame_count();

        let mut held = Vec::new();
        for _ in 0..20 {
            held.push(allocator.allocate_frame().unwrap());
            assert_eq!(allocator.free_frame_count() + held.len(), total);
        }
        for _ in 0..10 {
            allocator.free_frame(held.pop().unwrap());
            assert_eq!(allocator.free_frame_count() + held.len(), total);
        }
    }

    #[test]
    fn allocation_zeroes_and_free_scrubs() {
        let mut allocator = fixture();
        let offset = allocator.phys_offset;

        let frame = allocator.allocate_frame().unwrap();
        let contents = unsafe {
            slice::from_raw_parts_mut(
                (offset + frame.start_address().as_u64()).as_mut_ptr::<u8>(),
                FRAME_SIZE,
            )
        };
        assert!(contents.iter().all(|&b| b == 0));

        contents.fill(0xAB);
        allocator.free_frame(frame);
        assert!(contents.iter().all(|&b| b == 0));
    }

    #[test]
    fn cursor_rotates_instead_of_rescanning_low_frames() {
        let mut allocator = fixture();
        let first = allocator.allocate_frame().unwrap();
        let second = allocator.allocate_frame().unwrap();
        assert_ne!(first, second);

        // The freed frame is not rediscovered until the cursor wraps.
        allocator.free_frame(first);
        let third = allocator.allocate_frame().unwrap();
        assert_ne!(third, first);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut allocator = fixture();
        for _ in 0..53 {
            assert!(allocator.allocate_frame().is_some());
        }
        assert!(allocator.allocate_frame().is_none());
        assert_eq!(allocator.free_frame_count(), 0);
    }

    #[test]
    fn contiguous_run_is_consecutive_and_disjoint_from_singles() {
        let mut allocator = fixture();
        let singles: Vec<PhysFrame> =
            (0..4).map(|_| allocator.allocate_frame().unwrap()).collect();

        let run = allocator.allocate_contiguous(6).unwrap();
        let run_base = run.start_address().as_u64();
        for i in 0..6 {
            let frame = PhysFrame::containing_address(PhysAddr::new(run_base + i * F));
            assert!(allocator.is_frame_used(frame));
            assert!(!singles.contains(&frame));
        }
    }

    #[test]
    fn contiguous_never_spans_a_reserved_hole() {
        let mut allocator = fixture();
        // The longest free runs are 29 frames (first region minus the
        // bitmap) and 24 frames; nothing crosses the reserved hole.
        assert!(allocator.allocate_contiguous(31).is_none());

        let run = allocator.allocate_contiguous(24).unwrap();
        assert_eq!(run.start_address().as_u64(), 3 * F);
    }

    #[test]
    fn contiguous_wraps_back_to_low_frames() {
        let mut allocator = fixture();
        // Leave the cursor high in the second usable run with only four
        // free frames above it; the next run must come from a wrap.
        allocator.allocate_contiguous(24).unwrap();
        allocator.allocate_contiguous(20).unwrap();
        let run = allocator.allocate_contiguous(5).unwrap();
        assert_eq!(run.start_address().as_u64(), 27 * F);
    }

    #[test]
    fn zero_count_is_rejected() {
        let mut allocator = fixture();
        assert!(allocator.allocate_contiguous(0).is_none());
        assert!(allocator.allocate_contiguous(64).is_none());
    }
}
