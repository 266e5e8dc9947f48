//! Limine boot path.
//!
//! Collects the bootloader responses, distills them into the memory
//! subsystem's inputs and brings the machine to an idle loop once the
//! memory stack is live.

use alloc::boxed::Box;
use arrayvec::ArrayVec;
use limine::memory_map::EntryType;
use limine::request::{
    HhdmRequest, KernelAddressRequest, MemoryMapRequest, RequestsEndMarker, RequestsStartMarker,
};
use limine::BaseRevision;
use x86_64::{structures::paging::PageTableFlags, VirtAddr};

use vesper::constants::memory::EPHEMERAL_KERNEL_MAPPINGS_START;
use vesper::constants::memory::MAX_MEMORY_REGIONS;
use vesper::memory::frame_allocator::with_frame_allocator;
use vesper::memory::{self, KernelPlacement, PhysRegion, RegionKind, KERNEL_SPACE};
use vesper::{idle_loop, logging, serial_println};

#[used]
#[link_section = ".requests"]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[link_section = ".requests"]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[link_section = ".requests"]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[link_section = ".requests"]
static KERNEL_ADDRESS_REQUEST: KernelAddressRequest = KernelAddressRequest::new();

#[used]
#[link_section = ".requests_start_marker"]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

#[used]
#[link_section = ".requests_end_marker"]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

fn region_kind(entry_type: EntryType) -> RegionKind {
    if entry_type == EntryType::USABLE {
        RegionKind::Usable
    } else if entry_type == EntryType::BOOTLOADER_RECLAIMABLE {
        RegionKind::BootloaderReclaimable
    } else if entry_type == EntryType::KERNEL_AND_MODULES {
        RegionKind::Kernel
    } else if entry_type == EntryType::FRAMEBUFFER {
        RegionKind::Framebuffer
    } else {
        RegionKind::Reserved
    }
}

#[no_mangle]
extern "C" fn kmain() -> ! {
    assert!(BASE_REVISION.is_supported());

    logging::init();
    log::info!("Booting BSP...");

    let memory_map = MEMORY_MAP_REQUEST
        .get_response()
        .expect("Memory map request failed");
    let hhdm_offset = VirtAddr::new(
        HHDM_REQUEST
            .get_response()
            .expect("HHDM request failed")
            .offset(),
    );
    let kernel_address = KERNEL_ADDRESS_REQUEST
        .get_response()
        .expect("Kernel Address request failed");

    let mut regions: ArrayVec<PhysRegion, MAX_MEMORY_REGIONS> = ArrayVec::new();
    for entry in memory_map.entries().iter() {
        regions
            .try_push(PhysRegion {
                base: entry.base,
                length: entry.length,
                kind: region_kind(entry.entry_type),
            })
            .expect("memory map exceeds MAX_MEMORY_REGIONS");
    }

    memory::init(
        &regions,
        hhdm_offset,
        KernelPlacement {
            phys_base: kernel_address.physical_base(),
            virt_base: kernel_address.virtual_base(),
        },
    );

    // The heap is live: exercise it the way the rest of the kernel will.
    let x: Box<i32> = Box::new(10);
    let y: Box<i32> = Box::new(20);
    serial_println!(
        "Heap object allocated at: {:p}",
        Box::as_ref(&x) as *const i32
    );
    serial_println!(
        "Heap object allocated at: {:p}",
        Box::as_ref(&y) as *const i32
    );

    // Walk a scratch page through its whole lifecycle.
    let mut space_guard = KERNEL_SPACE.lock();
    let space = space_guard.as_mut().expect("kernel space not initialized");
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE;

    let scratch = VirtAddr::new(EPHEMERAL_KERNEL_MAPPINGS_START);
    let frame = with_frame_allocator(|alloc| alloc.allocate_frame()).expect("no more frames");
    with_frame_allocator(|alloc| space.map_page(scratch, frame.start_address(), flags, alloc))
        .expect("scratch mapping failed");
    serial_println!("{:?} -> {:?}", scratch, space.translate(scratch));

    let moved = scratch + 0xA000u64;
    with_frame_allocator(|alloc| space.remap(scratch, moved, flags, alloc))
        .expect("scratch remap failed")
        .flush();
    serial_println!("{:?} -> {:?}", moved, space.translate(moved));

    serial_println!("Now unmapping the page");
    space.unmap_page(moved).expect("unmap failed").flush();
    match space.translate(moved) {
        Ok(phys) => {
            serial_println!("Mapping still exists at physical address: {:?}", phys);
        }
        Err(_) => {
            serial_println!("Translation failed, as expected");
        }
    }
    with_frame_allocator(|alloc| alloc.free_frame(frame));
    drop(space_guard);

    serial_println!(
        "{} frames free",
        with_frame_allocator(|alloc| alloc.free_frame_count())
    );

    log::info!("BSP entering idle loop");
    idle_loop();
}

#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    serial_println!("Kernel panic: {}", info);
    idle_loop();
}
