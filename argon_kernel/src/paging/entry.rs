//! Hardware format of a single translation entry.
//!
//! The same 32-bit layout is used at both levels: directory entries point at
//! page tables, table entries point at frames.

use machine::PhysAddr;

/// An entry in a page table or in the page directory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct Entry(u32);

bitflags! {
    pub struct EntryFlags: u32 {
        const PRESENT       = 0b0000_0001;
        const WRITABLE      = 0b0000_0010;
        const USER          = 0b0000_0100;
        const WRITE_THROUGH = 0b0000_1000;
        const NO_CACHE      = 0b0001_0000;
        const ACCESSED      = 0b0010_0000;
        const DIRTY         = 0b0100_0000;
        /// Ignored by the hardware; claims a slot for kernel-internal use
        /// (the frame allocator's scratch window) without making it present.
        const OS_RESERVED   = 0b10_0000_0000;
    }
}

impl Entry {
    // mask for valid physical base addresses
    const ADDR_MASK: u32 = 0xFFFF_F000;

    pub const fn new() -> Entry {
        Entry(0)
    }

    /// An all-zero entry maps nothing and holds no claim.
    pub fn is_unused(&self) -> bool {
        self.0 == 0
    }

    pub fn is_present(&self) -> bool {
        self.flags().contains(EntryFlags::PRESENT)
    }

    pub fn flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    pub fn set_flags(&mut self, flags: EntryFlags) {
        self.0 = (self.0 & Self::ADDR_MASK) | flags.bits();
    }

    /// The physical base address of the frame or table this entry points at.
    pub fn frame(&self) -> PhysAddr {
        PhysAddr((self.0 & Self::ADDR_MASK) as usize)
    }

    /// Point the entry at `frame` with the given permission bits.
    pub fn set(&mut self, frame: PhysAddr, flags: EntryFlags) {
        debug_assert!(frame.0 as u64 <= u64::from(Self::ADDR_MASK));
        debug_assert!(frame.0 % crate::memory::PAGE_SIZE == 0);
        self.0 = (frame.0 as u32 & Self::ADDR_MASK) | flags.bits();
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}
