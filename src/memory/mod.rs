//! Memory management.
//!
//! Three layers, each depending only on those before it: the bitmap frame
//! allocator owns physical frames, the address space manager builds the
//! 4-level page tables on top of it, and the kernel heap carves sub-page
//! allocations out of one contiguous, mapped arena.

pub mod bitmap_frame_allocator;
pub mod frame_allocator;
pub mod heap;
pub mod paging;

use bitmap_frame_allocator::BitmapFrameAllocator;
use frame_allocator::{with_frame_allocator, FRAME_ALLOCATOR};
use paging::{AddressSpace, PagingError};
use spin::Mutex;
use x86_64::{
    registers::model_specific::{Efer, EferFlags},
    structures::paging::PageTableFlags,
    VirtAddr,
};

/// One entry of the memory map distilled from the bootloader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysRegion {
    pub base: u64,
    pub length: u64,
    pub kind: RegionKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    Usable,
    BootloaderReclaimable,
    Kernel,
    Framebuffer,
    Reserved,
}

impl RegionKind {
    /// Only usable frames are ever handed out by the frame allocator.
    pub fn is_usable(self) -> bool {
        self == RegionKind::Usable
    }

    /// Regions the kernel address space mirrors (identity and higher half).
    fn is_mirrored(self) -> bool {
        self != RegionKind::Reserved
    }
}

/// Physical and virtual load addresses reported by the bootloader.
#[derive(Clone, Copy, Debug)]
pub struct KernelPlacement {
    pub phys_base: u64,
    pub virt_base: u64,
}

/// The kernel's address space, installed by [`init`].
pub static KERNEL_SPACE: Mutex<Option<AddressSpace>> = Mutex::new(None);

/// Bring up the memory subsystem: frame allocator, kernel address space,
/// heap. Failures here are fatal, there is nothing to fall back to.
pub fn init(regions: &[PhysRegion], hhdm_offset: VirtAddr, kernel: KernelPlacement) {
    let allocator = unsafe { BitmapFrameAllocator::init(regions, hhdm_offset) }
        .expect("no usable region can host the frame bitmap");
    log::info!(
        "frame allocator ready, {} frames free",
        allocator.free_frame_count()
    );
    *FRAME_ALLOCATOR.lock() = Some(allocator);

    let mut space = with_frame_allocator(|alloc| {
        new_address_space(regions, hhdm_offset, kernel, alloc)
            .expect("failed to build the kernel address space")
    });

    unsafe {
        // NX leaf entries fault unless EFER.NXE is set first.
        Efer::update(|flags| {
            flags.insert(EferFlags::NO_EXECUTE_ENABLE);
        });
        space.activate();
    }
    log::info!("kernel address space active");

    with_frame_allocator(|alloc| heap::init_heap(&mut space, alloc))
        .expect("heap initialization failed");
    log::info!("heap initialized");

    *KERNEL_SPACE.lock() = Some(space);
}

/// Create an address space carrying the shared kernel mappings.
///
/// Every space, the kernel's own and each process's, reproduces the shared
/// ranges through this one routine. The node frames backing the new tree
/// belong to the returned space; the target frames of the shared ranges are
/// referenced, not owned.
pub fn new_address_space(
    regions: &[PhysRegion],
    hhdm_offset: VirtAddr,
    kernel: KernelPlacement,
    alloc: &mut BitmapFrameAllocator,
) -> Result<AddressSpace, PagingError> {
    let mut space = AddressSpace::new(hhdm_offset, alloc)?;
    build_kernel_mappings(&mut space, regions, hhdm_offset, kernel, alloc)?;
    Ok(space)
}

/// Map the shared kernel ranges onto `space`: identity and higher-half
/// mirrors of boot memory, plus the kernel image at its linked addresses.
fn build_kernel_mappings(
    space: &mut AddressSpace,
    regions: &[PhysRegion],
    hhdm_offset: VirtAddr,
    kernel: KernelPlacement,
    alloc: &mut BitmapFrameAllocator,
) -> Result<(), PagingError> {
    let data = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE;

    for region in regions.iter().filter(|r| r.kind.is_mirrored()) {
        let end = region.base + region.length;
        space.map_range(
            VirtAddr::new(region.base),
            VirtAddr::new(end),
            0,
            data,
            alloc,
        )?;
        space.map_range(
            hhdm_offset + region.base,
            hhdm_offset + end,
            hhdm_offset.as_u64().wrapping_neg(),
            data,
            alloc,
        )?;
    }

    // The kernel image stays executable at the virtual base it was linked
    // against; modules and everything else are reached through the mirrors.
    let image = regions
        .iter()
        .filter(|r| r.kind == RegionKind::Kernel && r.base == kernel.phys_base);
    for region in image {
        space.map_range(
            VirtAddr::new(kernel.virt_base),
            VirtAddr::new(kernel.virt_base + region.length),
            kernel.phys_base.wrapping_sub(kernel.virt_base),
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
            alloc,
        )?;
    }

    Ok(())
}
