//! Interrupt-free critical sections with a nesting counter.
//!
//! On a single CPU the only source of concurrency is interrupt reentrancy,
//! so every mutation of a shared memory-management structure runs inside a
//! critical section. Sections nest: only the outermost entry disables
//! interrupts and only the outermost exit re-enables them.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicUsize, Ordering};

static DEPTH: AtomicUsize = AtomicUsize::new(0);

/// RAII token for one level of critical-section nesting.
///
/// Not `Send`: the section must be exited on the CPU that entered it.
pub struct CriticalSection {
    _not_send: PhantomData<*const ()>,
}

/// Enter a critical section. Interrupts are disabled on the first entry;
/// nested entries only bump the counter.
pub fn enter_critical() -> CriticalSection {
    if DEPTH.fetch_add(1, Ordering::SeqCst) == 0 {
        unsafe { disable() }
    }
    CriticalSection {
        _not_send: PhantomData,
    }
}

/// Current nesting depth. Zero means interrupts are not masked by us.
pub fn critical_depth() -> usize {
    DEPTH.load(Ordering::SeqCst)
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        if DEPTH.fetch_sub(1, Ordering::SeqCst) == 1 {
            unsafe { enable() }
        }
    }
}

#[inline]
unsafe fn disable() {
    #[cfg(target_arch = "x86")]
    core::arch::asm!("cli", options(nomem, nostack));
}

#[inline]
unsafe fn enable() {
    #[cfg(target_arch = "x86")]
    core::arch::asm!("sti", options(nomem, nostack));
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn critical_sections_nest() {
        assert_eq!(critical_depth(), 0);
        let outer = enter_critical();
        assert_eq!(critical_depth(), 1);
        {
            let _inner = enter_critical();
            assert_eq!(critical_depth(), 2);
        }
        assert_eq!(critical_depth(), 1);
        drop(outer);
        assert_eq!(critical_depth(), 0);
    }
}
