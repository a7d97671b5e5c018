//! Physical frame allocation.
//!
//! Two interchangeable allocators satisfy the same contract: the
//! [`stack::StackFrameAllocator`] threads a free-stack through the free
//! frames themselves (O(1) both ways, needs a scratch mapping), the
//! [`bitmap::BitmapFrameAllocator`] keeps one bit per frame (O(n) allocate,
//! no scratch mapping). The backend is chosen once at startup; nothing
//! dispatches per call.

pub mod bitmap;
pub mod stack;

use core::ptr::NonNull;

use machine::cpu::mmu;
use machine::{PhysAddr, VirtAddr};

use crate::layout;
use crate::memory::PAGE_SIZE;
use crate::paging::{self, Entry, EntryFlags, PageDirectory};

/// Capability to reach a physical frame that is not otherwise mapped.
/// The stack allocator stores its free-stack links through this.
pub trait FrameWindow {
    /// Read the first machine word of `frame`.
    fn read_link(&mut self, frame: PhysAddr) -> PhysAddr;
    /// Write the first machine word of `frame`.
    fn write_link(&mut self, frame: PhysAddr, link: PhysAddr);
    /// Zero the whole frame, so stale free-list links never leak into
    /// freshly handed out memory.
    fn wipe(&mut self, frame: PhysAddr);
}

/// Bookkeeping shared by all frame allocator backends.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameStats {
    pub total_frames: usize,
    pub free_frames: usize,
    pub reserved_frames: usize,
}

impl FrameStats {
    pub const fn new() -> FrameStats {
        FrameStats {
            total_frames: 0,
            free_frames: 0,
            reserved_frames: 0,
        }
    }

    /// Frames currently handed out to callers.
    pub fn allocated_frames(&self) -> usize {
        self.total_frames - self.reserved_frames - self.free_frames
    }

    /// Counter sanity; a violation means an earlier undetected bug, so it is
    /// fatal rather than recoverable.
    fn check(&self) {
        assert!(
            self.free_frames + self.reserved_frames <= self.total_frames,
            "frame counters corrupt: {:?}",
            self
        );
    }
}

/// Generic interface for a page frame allocator.
pub trait FrameAllocator {
    /// Allocate one frame, or `None` when the pool is exhausted.
    fn alloc_frame(&mut self) -> Option<PhysAddr>;

    /// Return a frame to the pool. Exact inverse of [`alloc_frame`].
    ///
    /// [`alloc_frame`]: FrameAllocator::alloc_frame
    fn free_frame(&mut self, frame: PhysAddr);

    fn stats(&self) -> FrameStats;

    /// Allocate a frame and install it into a page table entry with the
    /// requested permission bits.
    fn alloc_frame_into(
        &mut self,
        entry: &mut Entry,
        is_kernel: bool,
        is_writeable: bool,
    ) -> Option<PhysAddr> {
        let frame = self.alloc_frame()?;
        let mut flags = EntryFlags::PRESENT;
        if is_writeable {
            flags |= EntryFlags::WRITABLE;
        }
        if !is_kernel {
            flags |= EntryFlags::USER;
        }
        entry.set(frame, flags);
        Some(frame)
    }
}

/// The kernel's [`FrameWindow`]: one reserved page table entry whose virtual
/// page is transiently pointed at whatever frame needs touching.
///
/// Every access runs map -> touch -> unmap with a single-page TLB flush on
/// both edges. The slot is claimed exclusively at boot; no other subsystem
/// may map this virtual page.
pub struct ScratchMapping {
    entry: NonNull<Entry>,
    window: VirtAddr,
}

impl ScratchMapping {
    /// Claim an unused page-table-entry slot in the kernel half by linearly
    /// scanning the tables that already exist in `directory`.
    ///
    /// Finding no free slot is a boot-time precondition failure; the caller
    /// is expected to halt. There is no fallback.
    pub fn locate(directory: &mut PageDirectory) -> Option<ScratchMapping> {
        let first = paging::dir_index(layout::KERNEL_BASE);
        for dir_idx in first..paging::ENTRY_COUNT {
            let base = VirtAddr(dir_idx << 22);
            let table = match directory.existing_table(base) {
                Some(table) => table,
                None => continue,
            };
            for table_idx in 0..paging::ENTRY_COUNT {
                let entry = table.entry_mut(table_idx);
                if entry.is_unused() {
                    entry.set_flags(EntryFlags::OS_RESERVED);
                    let window = VirtAddr(base.0 | (table_idx << 12));
                    log::debug!("frame allocator scratch window at {:p}", window);
                    return Some(ScratchMapping {
                        entry: NonNull::from(entry),
                        window,
                    });
                }
            }
        }
        None
    }

    pub fn window(&self) -> VirtAddr {
        self.window
    }

    fn map(&mut self, frame: PhysAddr) {
        unsafe {
            self.entry.as_mut().set(
                frame,
                EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::OS_RESERVED,
            );
            mmu::flush_tlb_entry(self.window);
        }
    }

    fn unmap(&mut self) {
        unsafe {
            self.entry.as_mut().set_flags(EntryFlags::OS_RESERVED);
            mmu::flush_tlb_entry(self.window);
        }
    }
}

impl FrameWindow for ScratchMapping {
    fn read_link(&mut self, frame: PhysAddr) -> PhysAddr {
        self.map(frame);
        let link = unsafe { (self.window.as_ptr::<usize>()).read_volatile() };
        self.unmap();
        PhysAddr(link)
    }

    fn write_link(&mut self, frame: PhysAddr, link: PhysAddr) {
        self.map(frame);
        unsafe { (self.window.as_mut_ptr::<usize>()).write_volatile(link.0) };
        self.unmap();
    }

    fn wipe(&mut self, frame: PhysAddr) {
        self.map(frame);
        unsafe { core::ptr::write_bytes(self.window.as_mut_ptr::<u8>(), 0, PAGE_SIZE) };
        self.unmap();
    }
}

#[cfg(test)]
pub mod testutil {
    use super::*;
    use std::collections::HashMap;

    /// Model physical memory: one word per frame, plus an access journal for
    /// asserting the map/touch/unmap discipline where needed.
    pub struct FakeWindow {
        words: HashMap<usize, usize>,
        pub wipes: usize,
    }

    impl FakeWindow {
        pub fn new() -> FakeWindow {
            FakeWindow {
                words: HashMap::new(),
                wipes: 0,
            }
        }
    }

    impl FrameWindow for FakeWindow {
        fn read_link(&mut self, frame: PhysAddr) -> PhysAddr {
            PhysAddr(*self.words.get(&frame.0).expect("read of unwritten frame"))
        }

        fn write_link(&mut self, frame: PhysAddr, link: PhysAddr) {
            assert_eq!(frame.0 % PAGE_SIZE, 0, "unaligned frame");
            self.words.insert(frame.0, link.0);
        }

        fn wipe(&mut self, frame: PhysAddr) {
            self.wipes += 1;
            self.words.insert(frame.0, 0);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::paging::testutil::LeakedTables;

    #[test]
    fn scratch_slot_is_found_and_claimed() {
        let mut source = LeakedTables::new();
        let mut directory = PageDirectory::new(&mut source).unwrap();

        // no kernel-space table exists yet, so there is nothing to scan
        assert!(ScratchMapping::locate(&mut directory).is_none());

        // a single mapping brings a table with 1023 free slots
        directory
            .create_mapping(
                layout::KERNEL_BASE,
                PhysAddr(0x10_0000),
                EntryFlags::WRITABLE,
                &mut source,
            )
            .unwrap();

        let scratch = ScratchMapping::locate(&mut directory).unwrap();
        let window = scratch.window();
        assert!(window.0 >= layout::KERNEL_BASE.0);
        assert_ne!(window, layout::KERNEL_BASE, "must not steal a live slot");

        // the slot is claimed: a second scan takes a different one
        assert!(directory.mapping_exists(window));
        let second = ScratchMapping::locate(&mut directory).unwrap();
        assert_ne!(second.window(), window);
    }

    #[test]
    fn alloc_frame_into_sets_permission_bits() {
        use super::stack::StackFrameAllocator;
        use super::testutil::FakeWindow;
        use crate::memory::FrameRegion;
        use bootinfo::memmap::{Region, RegionKind};

        let mut alloc = StackFrameAllocator::new(FakeWindow::new());
        let map = [Region::new(0x5000, 0x1000, RegionKind::FREE)];
        alloc.init_from_map(map.iter().copied(), FrameRegion::empty());

        let mut entry = Entry::new();
        let frame = alloc
            .alloc_frame_into(&mut entry, false, true)
            .expect("one frame is free");
        assert_eq!(frame, PhysAddr(0x5000));
        assert_eq!(entry.frame(), frame);
        assert!(entry.flags().contains(EntryFlags::PRESENT));
        assert!(entry.flags().contains(EntryFlags::WRITABLE));
        assert!(entry.flags().contains(EntryFlags::USER));
    }
}
