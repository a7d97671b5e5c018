//! Free-stack frame allocator.
//!
//! The pool of free frames is a singly linked stack threaded through the
//! frames themselves: the first word of every free frame holds the physical
//! address of the next one. Only the stack top lives in kernel data, so the
//! allocator costs a handful of words no matter how much memory it manages.

use bootinfo::memmap::Region;
use machine::PhysAddr;

use super::{FrameAllocator, FrameStats, FrameWindow};
use crate::memory::FrameRegion;

/// End-of-stack marker stored in the last free frame's link word. Distinct
/// from every real frame address (which are page-aligned).
const NIL: PhysAddr = PhysAddr(usize::max_value());

pub struct StackFrameAllocator<W> {
    window: W,
    top: PhysAddr,
    stats: FrameStats,
}

impl<W: FrameWindow> StackFrameAllocator<W> {
    pub fn new(window: W) -> StackFrameAllocator<W> {
        StackFrameAllocator {
            window,
            top: NIL,
            stats: FrameStats::new(),
        }
    }

    /// Build the free stack from the boot loader's memory map.
    ///
    /// Every frame of every free region is pushed, except those inside
    /// `reserved_boot` (the bootstrap watermark range, already occupied by
    /// the kernel image and early tables). Frames of non-free regions are
    /// only counted, never pooled.
    pub fn init_from_map<I>(&mut self, regions: I, reserved_boot: FrameRegion)
    where
        I: Iterator<Item = Region>,
    {
        for region in regions {
            let (base, length) = match region.addressable_span() {
                Some(span) => span,
                None => continue,
            };
            let frames = FrameRegion::included_in(base, base + length);
            self.stats.total_frames += frames.length();

            if region.is_free() {
                for frame in frames.frames() {
                    if reserved_boot.contains(frame) {
                        self.stats.reserved_frames += 1;
                    } else {
                        self.free_frame(frame);
                    }
                }
            } else {
                self.stats.reserved_frames += frames.length();
            }
        }
        log::info!(
            "frame allocator: {} frames total, {} reserved, {} free",
            self.stats.total_frames,
            self.stats.reserved_frames,
            self.stats.free_frames
        );
    }
}

impl<W: FrameWindow> FrameAllocator for StackFrameAllocator<W> {
    fn alloc_frame(&mut self) -> Option<PhysAddr> {
        if self.top == NIL {
            return None;
        }
        let frame = self.top;
        self.top = self.window.read_link(frame);
        self.window.wipe(frame);
        self.stats.free_frames -= 1;
        self.stats.check();
        Some(frame)
    }

    fn free_frame(&mut self, frame: PhysAddr) {
        debug_assert!(frame.0 % crate::memory::PAGE_SIZE == 0);
        self.window.write_link(frame, self.top);
        self.top = frame;
        self.stats.free_frames += 1;
        self.stats.check();
    }

    fn stats(&self) -> FrameStats {
        self.stats
    }
}

#[cfg(test)]
mod test {
    use super::super::testutil::FakeWindow;
    use super::*;
    use bootinfo::memmap::RegionKind;

    fn conventional_memory() -> Vec<Region> {
        vec![
            Region::new(0x0, 0xA0000, RegionKind::FREE),
            Region::new(0xA0000, 0x60000, RegionKind::RESERVED),
        ]
    }

    fn fresh_allocator(reserved_boot: FrameRegion) -> StackFrameAllocator<FakeWindow> {
        let mut alloc = StackFrameAllocator::new(FakeWindow::new());
        alloc.init_from_map(conventional_memory().into_iter(), reserved_boot);
        alloc
    }

    #[test]
    fn init_counts_and_pools() {
        let alloc = fresh_allocator(FrameRegion::empty());
        let stats = alloc.stats();
        assert_eq!(stats.total_frames, 0x100);
        assert_eq!(stats.reserved_frames, 0x60);
        assert_eq!(stats.free_frames, 0xA0);
        assert_eq!(stats.allocated_frames(), 0);
    }

    #[test]
    fn reserved_region_is_never_allocated() {
        let mut alloc = fresh_allocator(FrameRegion::empty());
        let mut seen_9f000 = false;
        let mut handed_out = 0;
        while let Some(frame) = alloc.alloc_frame() {
            assert!(frame < PhysAddr(0xA0000), "reserved frame {:p} leaked", frame);
            seen_9f000 |= frame == PhysAddr(0x9F000);
            handed_out += 1;
        }
        assert!(seen_9f000, "frame 0x9F000 was never returned");
        assert_eq!(handed_out, 0xA0);
        assert_eq!(alloc.alloc_frame(), None, "pool exhausted");
    }

    #[test]
    fn alloc_free_round_trip_preserves_state() {
        let mut alloc = fresh_allocator(FrameRegion::empty());
        let before = alloc.stats();

        let frame = alloc.alloc_frame().unwrap();
        alloc.free_frame(frame);

        assert_eq!(alloc.stats(), before);
        assert_eq!(alloc.alloc_frame(), Some(frame), "stack order restored");
    }

    #[test]
    fn conservation_holds_after_every_call() {
        let mut alloc = fresh_allocator(FrameRegion::empty());
        let total_pool = alloc.stats().total_frames - alloc.stats().reserved_frames;

        let mut outstanding = Vec::new();
        for round in 0..64 {
            if round % 3 == 2 {
                if let Some(frame) = outstanding.pop() {
                    alloc.free_frame(frame);
                }
            } else if let Some(frame) = alloc.alloc_frame() {
                outstanding.push(frame);
            }
            let stats = alloc.stats();
            assert_eq!(stats.free_frames + outstanding.len(), total_pool);
            assert_eq!(stats.allocated_frames(), outstanding.len());
        }
    }

    #[test]
    fn watermark_frames_stay_reserved() {
        let reserved_boot = FrameRegion::included_in(PhysAddr(0x0), PhysAddr(0x4000));
        let mut alloc = fresh_allocator(reserved_boot);

        assert_eq!(alloc.stats().reserved_frames, 0x60 + 4);
        while let Some(frame) = alloc.alloc_frame() {
            assert!(frame >= PhysAddr(0x4000), "watermark frame {:p} leaked", frame);
        }
    }

    #[test]
    fn frames_are_wiped_before_reuse() {
        let mut alloc = fresh_allocator(FrameRegion::empty());
        alloc.alloc_frame().unwrap();
        alloc.alloc_frame().unwrap();
        assert_eq!(alloc.window.wipes, 2);
    }
}
