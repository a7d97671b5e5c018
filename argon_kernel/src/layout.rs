//! The virtual memory layout of the kernel.

use machine::{PhysAddr, VirtAddr};

/// Base of the kernel half of the address space.
pub const KERNEL_BASE: VirtAddr = VirtAddr(0xC000_0000);

/// Virtual range backed on demand for the kernel heap.
pub const KERNEL_HEAP_START: VirtAddr = VirtAddr(0xC100_0000);
pub const KERNEL_HEAP_END: VirtAddr = VirtAddr(0xD000_0000);

/// Bytes of the heap range that are eagerly backed with frames at boot.
pub const KERNEL_HEAP_INITIAL_SIZE: usize = 0x10_0000;

/// VGA text buffer, identity-mapped so that early diagnostics survive the
/// switch into paged mode.
pub const VIDEO_RAM_START: PhysAddr = PhysAddr(0xB_8000);
pub const VIDEO_RAM_END: PhysAddr = PhysAddr(0xC_0000);

/// Span covered by one page table (1024 entries of 4 KiB).
pub const TABLE_SPAN: usize = 0x40_0000;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn heap_range_is_sane() {
        assert!(KERNEL_HEAP_START.0 >= KERNEL_BASE.0);
        assert!(KERNEL_HEAP_START.0 + KERNEL_HEAP_INITIAL_SIZE <= KERNEL_HEAP_END.0);
        assert_eq!(KERNEL_HEAP_START.0 % 0x1000, 0);
        assert_eq!(KERNEL_HEAP_END.0 % 0x1000, 0);
    }
}
