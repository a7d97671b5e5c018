//! Access to the data structures handed over by the boot loader: the
//! physical memory map and the record of already-loaded boot images.

#![cfg_attr(not(test), no_std)]

mod boot;
pub mod memmap;

pub use self::boot::*;
