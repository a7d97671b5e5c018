//! Freestanding panic handler. Fatal conditions in the memory core halt the
//! CPU; there is no unwinding in the kernel.

#[cfg(not(test))]
use core::panic::PanicInfo;

#[panic_handler]
#[cfg(not(test))]
fn panic(panic_info: &PanicInfo) -> ! {
    log::error!("kernel panic: {}", panic_info);
    unsafe { machine::cpu::hang() }
}
