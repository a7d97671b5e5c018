//! Control-register access for the paging unit.
//!
//! A single-entry invalidation (`flush_tlb_entry`) is preferred after a
//! single mapping change; reloading CR3 (`flush_tlb_all`) is the always
//! correct, slower fallback and is required after a bulk structural change
//! such as installing a new directory.

use crate::addr::{PhysAddr, VirtAddr};

/// Install `directory` as the active translation root (CR3). This implies a
/// full TLB flush.
#[inline]
pub unsafe fn set_active_directory(directory: PhysAddr) {
    #[cfg(target_arch = "x86")]
    core::arch::asm!("mov cr3, {}", in(reg) directory.0, options(nostack));
    #[cfg(not(target_arch = "x86"))]
    let _ = directory;
}

/// Turn on the paging bit in CR0. The active directory must already map the
/// currently executing code, or the next instruction fetch faults.
#[inline]
pub unsafe fn enable_paged_mode() {
    #[cfg(target_arch = "x86")]
    {
        let mut cr0: usize;
        core::arch::asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack));
        cr0 |= 0x8000_0000;
        core::arch::asm!("mov cr0, {}", in(reg) cr0, options(nostack));
    }
}

/// Whether the CPU currently translates addresses through the paging unit.
#[inline]
pub fn paged_mode_enabled() -> bool {
    #[cfg(target_arch = "x86")]
    {
        let cr0: usize;
        unsafe {
            core::arch::asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack));
        }
        cr0 & 0x8000_0000 != 0
    }
    #[cfg(not(target_arch = "x86"))]
    false
}

/// Invalidate the translation for a single page.
#[inline]
pub unsafe fn flush_tlb_entry(addr: VirtAddr) {
    #[cfg(target_arch = "x86")]
    core::arch::asm!("invlpg [{}]", in(reg) addr.0, options(nostack));
    #[cfg(not(target_arch = "x86"))]
    let _ = addr;
}

/// Invalidate all non-global translations by reloading CR3.
#[inline]
pub unsafe fn flush_tlb_all() {
    #[cfg(target_arch = "x86")]
    {
        let cr3: usize;
        core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack));
        core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack));
    }
}
