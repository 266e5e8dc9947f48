//! Address space management
//!
//! Builds and walks the 4-level page table tree by hand. Every operation
//! takes an explicit root (the [`AddressSpace`]) and the allocator backing
//! its node frames, so a process's private space and the shared kernel
//! space use identical primitives.

use crate::constants::memory::PAGE_SIZE;
use x86_64::{
    registers::control::{Cr3, Cr3Flags},
    structures::paging::{
        page_table::PageTableEntry, FrameAllocator, PageTable, PageTableFlags, PageTableIndex,
        PhysFrame, Size4KiB,
    },
    PhysAddr, VirtAddr,
};

/// Failure modes of the table walkers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PagingError {
    /// A node frame could not be obtained from the frame allocator.
    FrameAllocationFailed,
    /// An intermediate node or the leaf itself was absent.
    NotMapped,
}

/// Tagged view of a page table entry. An entry is exactly one of these;
/// the only transitions are absent to present on map and frame to absent
/// on unmap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageEntryKind {
    Absent,
    /// Intermediate entry referencing a child node.
    Table(PhysFrame),
    /// Leaf entry referencing a mapped frame.
    Frame(PhysFrame, PageTableFlags),
}

/// Pending TLB invalidation for one address.
///
/// Mutating a space does not invalidate cached translations; the caller
/// decides whether to `flush` or, for spaces that are not active, `ignore`.
#[must_use = "the TLB still holds the old translation until flushed"]
pub struct TlbFlush(VirtAddr);

impl TlbFlush {
    pub fn flush(self) {
        x86_64::instructions::tlb::flush(self.0);
    }

    pub fn ignore(self) {}
}

/// A 4-level address space rooted at one physical frame.
///
/// Node frames are reached through `phys_offset`, the higher-half direct
/// map of physical memory. The space owns the frames backing its private
/// tree nodes; the frames its leaves target are referenced, not owned.
pub struct AddressSpace {
    root: PhysFrame,
    phys_offset: VirtAddr,
}

impl AddressSpace {
    /// Create an empty space with a freshly allocated, zeroed root node.
    pub fn new<A>(phys_offset: VirtAddr, alloc: &mut A) -> Result<Self, PagingError>
    where
        A: FrameAllocator<Size4KiB>,
    {
        let root = alloc
            .allocate_frame()
            .ok_or(PagingError::FrameAllocationFailed)?;
        let space = Self { root, phys_offset };
        space.table_mut(root).zero();
        Ok(space)
    }

    /// Adopt the root the CPU is currently translating through.
    ///
    /// # Safety
    /// `phys_offset` must map every frame of the live tables.
    pub unsafe fn from_active(phys_offset: VirtAddr) -> Self {
        let (root, _) = Cr3::read();
        Self { root, phys_offset }
    }

    pub fn root(&self) -> PhysFrame {
        self.root
    }

    /// Load this space's root into CR3.
    ///
    /// # Safety
    /// The space must map the executing code, the stack and all live
    /// kernel data, or the next instruction fetch faults.
    pub unsafe fn activate(&self) {
        unsafe { Cr3::write(self.root, Cr3Flags::empty()) };
    }

    /// Map one page. Walks level 4 down to level 2, creating intermediate
    /// nodes as needed, then writes the leaf as `paddr | flags`. An already
    /// mapped address is silently overwritten; no unmap bookkeeping occurs.
    pub fn map_page<A>(
        &mut self,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        flags: PageTableFlags,
        alloc: &mut A,
    ) -> Result<(), PagingError>
    where
        A: FrameAllocator<Size4KiB>,
    {
        let node_flags = PageTableFlags::PRESENT
            | PageTableFlags::WRITABLE
            | (flags & PageTableFlags::USER_ACCESSIBLE);

        let mut table = self.table_mut(self.root);
        for index in [vaddr.p4_index(), vaddr.p3_index(), vaddr.p2_index()] {
            table = self.get_or_create_table(table, index, node_flags, alloc)?;
        }
        table[vaddr.p1_index()].set_addr(paddr, flags | PageTableFlags::PRESENT);
        Ok(())
    }

    /// Map every frame-aligned address in `[base, bound)` to its
    /// `offset`-shifted physical counterpart. Stops at the first failure,
    /// leaving the range partially mapped; boot callers treat that as
    /// fatal since no rollback exists.
    pub fn map_range<A>(
        &mut self,
        base: VirtAddr,
        bound: VirtAddr,
        offset: u64,
        flags: PageTableFlags,
        alloc: &mut A,
    ) -> Result<(), PagingError>
    where
        A: FrameAllocator<Size4KiB>,
    {
        let mut vaddr = base.align_down(PAGE_SIZE);
        while vaddr < bound {
            let paddr = PhysAddr::new(vaddr.as_u64().wrapping_add(offset));
            self.map_page(vaddr, paddr, flags, alloc)?;
            vaddr += PAGE_SIZE;
        }
        Ok(())
    }

    /// Unmap one page, reporting [`PagingError::NotMapped`] when any level
    /// of the walk is absent. The stale translation is handed back as a
    /// [`TlbFlush`].
    pub fn unmap_page(&mut self, vaddr: VirtAddr) -> Result<TlbFlush, PagingError> {
        let table = self.leaf_table(vaddr)?;
        let entry = &mut table[vaddr.p1_index()];
        match Self::entry_kind(entry, true) {
            PageEntryKind::Frame(..) => {
                entry.set_unused();
                Ok(TlbFlush(vaddr))
            }
            _ => Err(PagingError::NotMapped),
        }
    }

    /// Translate a virtual address, stripping the flag bits off the leaf.
    pub fn translate(&self, vaddr: VirtAddr) -> Result<PhysAddr, PagingError> {
        match Self::entry_kind(&self.leaf_table(vaddr)?[vaddr.p1_index()], true) {
            PageEntryKind::Frame(frame, _) => Ok(frame.start_address()),
            _ => Err(PagingError::NotMapped),
        }
    }

    /// Flag bits of the leaf entry for `vaddr`.
    pub fn translate_flags(&self, vaddr: VirtAddr) -> Result<PageTableFlags, PagingError> {
        match Self::entry_kind(&self.leaf_table(vaddr)?[vaddr.p1_index()], true) {
            PageEntryKind::Frame(_, flags) => Ok(flags),
            _ => Err(PagingError::NotMapped),
        }
    }

    /// Move a mapping: translate `old`, unmap it, map `new` to the same
    /// frame with the given flags. Used when the true placement of a
    /// structure is only known once the bootloader reports it.
    pub fn remap<A>(
        &mut self,
        old: VirtAddr,
        new: VirtAddr,
        flags: PageTableFlags,
        alloc: &mut A,
    ) -> Result<TlbFlush, PagingError>
    where
        A: FrameAllocator<Size4KiB>,
    {
        let paddr = self.translate(old)?;
        let flush = self.unmap_page(old)?;
        self.map_page(new, paddr, flags, alloc)?;
        Ok(flush)
    }

    /// Return the child node behind `table[index]`, allocating and
    /// recording a fresh zeroed node when the entry is absent.
    fn get_or_create_table<A>(
        &self,
        table: &mut PageTable,
        index: PageTableIndex,
        flags: PageTableFlags,
        alloc: &mut A,
    ) -> Result<&'static mut PageTable, PagingError>
    where
        A: FrameAllocator<Size4KiB>,
    {
        match Self::entry_kind(&table[index], false) {
            PageEntryKind::Table(frame) => Ok(self.table_mut(frame)),
            _ => {
                let frame = alloc
                    .allocate_frame()
                    .ok_or(PagingError::FrameAllocationFailed)?;
                let child = self.table_mut(frame);
                child.zero();
                table[index].set_addr(frame.start_address(), flags);
                Ok(child)
            }
        }
    }

    /// Walk to the level-1 node holding `vaddr`'s leaf entry.
    fn leaf_table(&self, vaddr: VirtAddr) -> Result<&'static mut PageTable, PagingError> {
        let mut table = self.table_mut(self.root);
        for index in [vaddr.p4_index(), vaddr.p3_index(), vaddr.p2_index()] {
            match Self::entry_kind(&table[index], false) {
                PageEntryKind::Table(frame) => table = self.table_mut(frame),
                _ => return Err(PagingError::NotMapped),
            }
        }
        Ok(table)
    }

    /// Reach a node's memory through the direct map.
    fn table_mut(&self, frame: PhysFrame) -> &'static mut PageTable {
        let virt = self.phys_offset + frame.start_address().as_u64();
        unsafe { &mut *virt.as_mut_ptr() }
    }

    /// `leaf` selects the level-1 reading of a present entry.
    fn entry_kind(entry: &PageTableEntry, leaf: bool) -> PageEntryKind {
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            PageEntryKind::Absent
        } else if leaf {
            PageEntryKind::Frame(PhysFrame::containing_address(entry.addr()), entry.flags())
        } else {
            PageEntryKind::Table(PhysFrame::containing_address(entry.addr()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::memory::FRAME_SIZE;

    /// Hands out sequential frames from a leaked, page-aligned pool,
    /// addressed with a synthetic direct-map offset like the real HHDM.
    struct FramePool {
        next: usize,
        capacity: usize,
        offset: VirtAddr,
    }

    fn pool(frames: usize) -> FramePool {
        let buf = vec![0u8; (frames + 1) * FRAME_SIZE].leak();
        let aligned =
            (buf.as_mut_ptr() as u64 + FRAME_SIZE as u64 - 1) & !(FRAME_SIZE as u64 - 1);
        FramePool {
            next: 0,
            capacity: frames,
            offset: VirtAddr::new(aligned),
        }
    }

    unsafe impl FrameAllocator<Size4KiB> for FramePool {
        fn allocate_frame(&mut self) -> Option<PhysFrame> {
            if self.next == self.capacity {
                return None;
            }
            let addr = PhysAddr::new((self.next * FRAME_SIZE) as u64);
            self.next += 1;
            Some(PhysFrame::containing_address(addr))
        }
    }

    fn space(pool: &mut FramePool) -> AddressSpace {
        AddressSpace::new(pool.offset, pool).unwrap()
    }

    const RW: PageTableFlags = PageTableFlags::PRESENT.union(PageTableFlags::WRITABLE);

    #[test]
    fn map_translate_unmap_round_trip() {
        let mut pool = pool(16);
        let mut space = space(&mut pool);

        space
            .map_page(VirtAddr::new(0x1000), PhysAddr::new(0x2000), RW, &mut pool)
            .unwrap();
        assert_eq!(
            space.translate(VirtAddr::new(0x1000)),
            Ok(PhysAddr::new(0x2000))
        );

        space.unmap_page(VirtAddr::new(0x1000)).unwrap().ignore();
        assert_eq!(
            space.translate(VirtAddr::new(0x1000)),
            Err(PagingError::NotMapped)
        );
    }

    #[test]
    fn leaf_carries_exactly_the_requested_flags() {
        let mut pool = pool(16);
        let mut space = space(&mut pool);
        let flags = RW | PageTableFlags::USER_ACCESSIBLE | PageTableFlags::NO_EXECUTE;

        space
            .map_page(VirtAddr::new(0x40_0000), PhysAddr::new(0x7000), flags, &mut pool)
            .unwrap();
        assert_eq!(space.translate_flags(VirtAddr::new(0x40_0000)), Ok(flags));
    }

    #[test]
    fn walk_failures_report_not_mapped_at_every_level() {
        let mut pool = pool(16);
        let mut space = space(&mut pool);

        // Nothing mapped at all: the level-4 entry is absent.
        assert_eq!(
            space.translate(VirtAddr::new(0x1000)),
            Err(PagingError::NotMapped)
        );
        assert!(space.unmap_page(VirtAddr::new(0x1000)).is_err());

        // Sibling leaf present, requested leaf absent.
        space
            .map_page(VirtAddr::new(0x1000), PhysAddr::new(0x2000), RW, &mut pool)
            .unwrap();
        assert_eq!(
            space.translate(VirtAddr::new(0x3000)),
            Err(PagingError::NotMapped)
        );
    }

    #[test]
    fn remapping_an_address_silently_overwrites() {
        let mut pool = pool(16);
        let mut space = space(&mut pool);
        let vaddr = VirtAddr::new(0x1000);

        space.map_page(vaddr, PhysAddr::new(0x2000), RW, &mut pool).unwrap();
        space.map_page(vaddr, PhysAddr::new(0x5000), RW, &mut pool).unwrap();
        assert_eq!(space.translate(vaddr), Ok(PhysAddr::new(0x5000)));
    }

    #[test]
    fn remap_moves_the_frame_to_the_new_address() {
        let mut pool = pool(16);
        let mut space = space(&mut pool);
        let old = VirtAddr::new(0x1000);
        let new = VirtAddr::new(0x8000_0000);

        space.map_page(old, PhysAddr::new(0x6000), RW, &mut pool).unwrap();
        space.remap(old, new, RW, &mut pool).unwrap().ignore();

        assert_eq!(space.translate(new), Ok(PhysAddr::new(0x6000)));
        assert_eq!(space.translate(old), Err(PagingError::NotMapped));
    }

    #[test]
    fn remap_of_an_unmapped_address_fails() {
        let mut pool = pool(16);
        let mut space = space(&mut pool);
        assert_eq!(
            space
                .remap(VirtAddr::new(0x1000), VirtAddr::new(0x2000), RW, &mut pool)
                .map(TlbFlush::ignore),
            Err(PagingError::NotMapped)
        );
    }

    #[test]
    fn map_range_shifts_by_the_offset() {
        let mut pool = pool(32);
        let mut space = space(&mut pool);

        let base = VirtAddr::new(0x40_0000);
        let bound = VirtAddr::new(0x40_4000);
        space.map_range(base, bound, 0x1000_0000, RW, &mut pool).unwrap();

        for page in 0..4u64 {
            let vaddr = base + page * 0x1000;
            assert_eq!(
                space.translate(vaddr),
                Ok(PhysAddr::new(vaddr.as_u64() + 0x1000_0000))
            );
        }
        assert_eq!(space.translate(bound), Err(PagingError::NotMapped));
    }

    #[test]
    fn map_range_failure_leaves_prefix_mapped() {
        // Root plus the three nodes for the first pages leaves nothing for
        // the level-2 crossing at 2 MiB.
        let mut pool = pool(4);
        let mut space = space(&mut pool);

        let base = VirtAddr::new(0x1F_E000);
        let bound = VirtAddr::new(0x20_2000);
        assert_eq!(
            space.map_range(base, bound, 0, RW, &mut pool),
            Err(PagingError::FrameAllocationFailed)
        );

        assert_eq!(space.translate(base), Ok(PhysAddr::new(base.as_u64())));
        assert_eq!(space.translate(VirtAddr::new(0x20_0000)), Err(PagingError::NotMapped));
    }

    #[test]
    fn spaces_are_independent() {
        let mut pool = pool(32);
        let mut first = space(&mut pool);
        let mut second = space(&mut pool);
        let vaddr = VirtAddr::new(0x1000);

        first.map_page(vaddr, PhysAddr::new(0x2000), RW, &mut pool).unwrap();
        second.map_page(vaddr, PhysAddr::new(0x9000), RW, &mut pool).unwrap();

        assert_eq!(first.translate(vaddr), Ok(PhysAddr::new(0x2000)));
        assert_eq!(second.translate(vaddr), Ok(PhysAddr::new(0x9000)));
    }

    #[test]
    fn node_exhaustion_surfaces_as_map_failure() {
        let mut pool = pool(1);
        let mut space = space(&mut pool);
        assert_eq!(
            space.map_page(VirtAddr::new(0x1000), PhysAddr::new(0x2000), RW, &mut pool),
            Err(PagingError::FrameAllocationFailed)
        );
    }
}
