//! Minimal placement allocator for the time before paging exists.
//!
//! Frames are handed out by bumping a watermark; nothing is ever freed. The
//! allocator also owns the two fixed page tables used to bring up paging:
//! one covering the identity-mapped low megabytes, one covering the start of
//! the kernel half. Everything mapped here must be identity-mapped, because
//! pointers captured before the paging switch are dereferenced after it.

use core::ptr::NonNull;

use machine::cpu::mmu;
use machine::{Alignable, PhysAddr, VirtAddr};

use crate::layout;
use crate::memory::PAGE_SIZE;
use crate::paging::{self, Entry, EntryFlags, PageTable, TableSource};

/// Which of the two fixed bootstrap tables covers a virtual address.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MappingBand {
    /// Identity-mapped low memory, `[0, 4 MiB)`.
    Low,
    /// Start of the kernel half, `[KERNEL_BASE, KERNEL_BASE + 4 MiB)`.
    High,
}

/// The band covering `vaddr`, or `None` for the unmapped middle band.
pub fn band_for(vaddr: VirtAddr) -> Option<MappingBand> {
    if vaddr.0 < layout::TABLE_SPAN {
        Some(MappingBand::Low)
    } else if vaddr.0 >= layout::KERNEL_BASE.0
        && vaddr.0 < layout::KERNEL_BASE.0 + layout::TABLE_SPAN
    {
        Some(MappingBand::High)
    } else {
        None
    }
}

pub struct BootstrapAllocator {
    alloc_start: PhysAddr,
    directory: Option<NonNull<PageTable>>,
    directory_phys: PhysAddr,
    low_table: Option<NonNull<PageTable>>,
    high_table: Option<NonNull<PageTable>>,
}

impl BootstrapAllocator {
    pub const fn new() -> BootstrapAllocator {
        BootstrapAllocator {
            alloc_start: PhysAddr(0),
            directory: None,
            directory_phys: PhysAddr(0),
            low_table: None,
            high_table: None,
        }
    }

    /// Move the watermark above `new_start` if it is not already, and round
    /// it up to the next page boundary.
    pub fn adjust_alloc_start(&mut self, new_start: PhysAddr) {
        self.alloc_start = self.alloc_start.max(new_start);
        self.align_placement_address();
    }

    /// Round the watermark up to the next page boundary. Required before any
    /// page-granular bootstrap operation.
    pub fn align_placement_address(&mut self) {
        self.alloc_start = self.alloc_start.align_up(PAGE_SIZE);
    }

    pub fn alloc_start(&self) -> PhysAddr {
        self.alloc_start
    }

    /// Pure bump allocation: returns the watermark and advances it by one
    /// page. Bootstrap frames are never reused and never freed.
    pub fn alloc_next_page(&mut self) -> PhysAddr {
        let allocated = self.alloc_start;
        self.alloc_start += PAGE_SIZE;
        allocated
    }

    /// Allocate a frame and identity-map it in one step.
    pub unsafe fn alloc_page(&mut self) -> PhysAddr {
        let frame = self.alloc_next_page();
        self.mapping_enter(VirtAddr(frame.0), frame);
        frame
    }

    /// Allocate and install the paging directory and the two fixed tables.
    /// All three are identity-mapped so they stay reachable once paging is
    /// on.
    pub unsafe fn setup_pagetables(&mut self) {
        debug_assert!(self.directory.is_none(), "bootstrap tables set up twice");

        let directory = self.alloc_zeroed_table();
        self.directory_phys = PhysAddr(directory.as_ptr() as usize);
        self.directory = Some(directory);
        let low = self.alloc_zeroed_table();
        self.low_table = Some(low);
        let high = self.alloc_zeroed_table();
        self.high_table = Some(high);

        self.mapping_enter(VirtAddr(self.directory_phys.0), self.directory_phys);
        let low_phys = PhysAddr(low.as_ptr() as usize);
        self.mapping_enter(VirtAddr(low_phys.0), low_phys);
        let high_phys = PhysAddr(high.as_ptr() as usize);
        self.mapping_enter(VirtAddr(high_phys.0), high_phys);

        let table_flags = EntryFlags::PRESENT | EntryFlags::WRITABLE;
        let dir = directory.as_ptr();
        (*dir)
            .entry_mut(paging::dir_index(VirtAddr(0)))
            .set(low_phys, table_flags);
        (*dir)
            .entry_mut(paging::dir_index(layout::KERNEL_BASE))
            .set(high_phys, table_flags);

        // leave virtual page 0 unmapped so null dereferences fault
        (*low.as_ptr()).entry_mut(0).clear();
    }

    /// Write one entry into the fixed table covering `vaddr`. Addresses in
    /// the unmapped middle band are a fatal error; there is no general
    /// purpose table allocation this early.
    pub unsafe fn mapping_enter(&mut self, vaddr: VirtAddr, paddr: PhysAddr) {
        let entry = self
            .fixed_entry(vaddr)
            .unwrap_or_else(|| panic!("bootstrap mapping outside fixed bands: {:p}", vaddr));
        (*entry).set(paddr, EntryFlags::PRESENT | EntryFlags::WRITABLE);
    }

    /// Whether `mapping_enter` was already called for `vaddr`.
    pub unsafe fn mapping_entered(&mut self, vaddr: VirtAddr) -> bool {
        match self.fixed_entry(vaddr) {
            Some(entry) => !(*entry).is_unused(),
            None => false,
        }
    }

    /// Identity-map every page of `[start, end)`.
    pub unsafe fn identity_map_range(&mut self, start: PhysAddr, end: PhysAddr) {
        let mut frame = start.align_down(PAGE_SIZE);
        while frame < end {
            self.mapping_enter(VirtAddr(frame.0), frame);
            frame += PAGE_SIZE;
        }
    }

    /// Install the bootstrap directory and switch the CPU into paged mode.
    pub unsafe fn start_paging(&self) {
        assert!(self.directory.is_some(), "setup_pagetables must run first");
        mmu::set_active_directory(self.directory_phys);
        mmu::enable_paged_mode();
        log::debug!("enabled paging, directory at {:p}", self.directory_phys);
    }

    unsafe fn alloc_zeroed_table(&mut self) -> NonNull<PageTable> {
        let frame = self.alloc_next_page();
        let table = frame.0 as *mut PageTable;
        core::ptr::write_bytes(table as *mut u8, 0, PAGE_SIZE);
        NonNull::new(table).unwrap_or_else(|| panic!("bootstrap watermark at page zero"))
    }

    unsafe fn fixed_entry(&mut self, vaddr: VirtAddr) -> Option<*mut Entry> {
        let (table, index) = match band_for(vaddr)? {
            MappingBand::Low => (self.low_table, vaddr.0 >> 12),
            MappingBand::High => (self.high_table, (vaddr.0 - layout::KERNEL_BASE.0) >> 12),
        };
        let table = table.expect("bootstrap tables not set up");
        Some((*table.as_ptr()).entry_mut(index) as *mut Entry)
    }
}

/// Before the frame allocator exists, new page tables come straight from the
/// placement watermark. The frames are identity-mapped, so their physical
/// address doubles as their kernel-visible location.
impl TableSource for BootstrapAllocator {
    fn alloc_table(&mut self) -> Option<(NonNull<PageTable>, PhysAddr)> {
        unsafe {
            let table = self.alloc_zeroed_table();
            let phys = PhysAddr(table.as_ptr() as usize);
            self.mapping_enter(VirtAddr(phys.0), phys);
            Some((table, phys))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bump_allocation_is_sequential() {
        let mut boot = BootstrapAllocator::new();
        boot.adjust_alloc_start(PhysAddr(0x10_0234));

        let first = boot.alloc_next_page();
        let second = boot.alloc_next_page();
        assert_eq!(first, PhysAddr(0x10_1000));
        assert_eq!(second, PhysAddr(0x10_2000));
        assert_eq!(boot.alloc_start(), PhysAddr(0x10_3000));
    }

    #[test]
    fn watermark_never_moves_backwards() {
        let mut boot = BootstrapAllocator::new();
        boot.adjust_alloc_start(PhysAddr(0x50_0000));
        boot.adjust_alloc_start(PhysAddr(0x20_0000));
        assert_eq!(boot.alloc_start(), PhysAddr(0x50_0000));
    }

    #[test]
    fn fixed_band_selection() {
        assert_eq!(band_for(VirtAddr(0x0)), Some(MappingBand::Low));
        assert_eq!(band_for(VirtAddr(0xB_8000)), Some(MappingBand::Low));
        assert_eq!(band_for(VirtAddr(0x3F_FFFF)), Some(MappingBand::Low));
        assert_eq!(band_for(VirtAddr(0x40_0000)), None);
        assert_eq!(band_for(VirtAddr(0x8000_0000)), None);
        assert_eq!(band_for(VirtAddr(0xC000_0000)), Some(MappingBand::High));
        assert_eq!(band_for(VirtAddr(0xC03F_F000)), Some(MappingBand::High));
        assert_eq!(band_for(VirtAddr(0xC040_0000)), None);
    }
}
