use crate::memory::bitmap_frame_allocator::BitmapFrameAllocator;
use spin::Mutex;

use x86_64::structures::paging::{PhysFrame, Size4KiB};

/// Global frame allocator that makes it so we just have one actual allocator throughout codebase
/// Requires some basic synchronization
pub static FRAME_ALLOCATOR: Mutex<Option<BitmapFrameAllocator>> = Mutex::new(None);

/// Exposed function to allocate a frame that runs the global's allocate_frame
pub fn alloc_frame() -> Option<PhysFrame> {
    with_frame_allocator(|allocator| allocator.allocate_frame())
}

/// Exposed function to release a frame back to the global allocator
pub fn dealloc_frame(frame: PhysFrame<Size4KiB>) {
    with_frame_allocator(|allocator| allocator.free_frame(frame))
}

pub fn with_frame_allocator<F, R>(f: F) -> R
where
    F: FnOnce(&mut BitmapFrameAllocator) -> R,
{
    let mut guard = FRAME_ALLOCATOR.lock();
    if let Some(ref mut allocator) = *guard {
        f(allocator)
    } else {
        panic!("Allocator does not exist.");
    }
}
