//! The memory manager facade.
//!
//! One [`MemorySubsystem`] is constructed at startup and passed by reference
//! to everything that needs memory; there are no ambient statics. The facade
//! owns the page directory, the frame allocator and the heap, drives the
//! transition from bootstrap placement allocation to the steady state, and
//! serializes every heap call behind a spin lock inside an interrupt-free
//! critical section.
//!
//! Nothing running under that lock may call back into the allocator;
//! in particular, diagnostic output must not allocate.

use bootinfo::BootRecord;
use machine::cpu::{interrupts, mmu};
use machine::{Alignable, PhysAddr, VirtAddr};
use spinlock::Mutex;

use crate::layout;
use crate::memory::bootstrap::BootstrapAllocator;
use crate::memory::frames::bitmap::BitmapFrameAllocator;
use crate::memory::frames::stack::StackFrameAllocator;
use crate::memory::frames::{FrameAllocator, FrameStats, ScratchMapping};
use crate::memory::heap::{Arena, Heap, HeapStats};
use crate::memory::{FrameRegion, PAGE_SIZE};
use crate::paging::PageDirectory;

/// The production configuration: free-stack frame allocator over the scratch
/// window.
pub type KernelMemory = MemorySubsystem<StackFrameAllocator<ScratchMapping>>;

pub struct MemorySubsystem<A: FrameAllocator> {
    directory: PageDirectory,
    frames: A,
    heap: Mutex<Heap>,
}

impl KernelMemory {
    /// Bring the memory subsystem from bootstrap placement allocation to the
    /// steady state. Expects paging to be live on the bootstrap tables
    /// (i.e. `bootstrap.start_paging()` already ran).
    pub fn init(boot: &BootRecord, bootstrap: &mut BootstrapAllocator) -> KernelMemory {
        // Nothing below the loader's images is ever placement-allocated.
        bootstrap.adjust_alloc_start(boot.highest_reserved());

        let mut directory = match PageDirectory::new(bootstrap) {
            Some(directory) => directory,
            None => panic!("out of bootstrap memory for the page directory"),
        };

        // Create (but do not yet back) the tables covering the heap range.
        // Frames cannot be allocated yet, the frame allocator needs the
        // directory first.
        let mut vaddr = layout::KERNEL_HEAP_START;
        while vaddr < layout::KERNEL_HEAP_END {
            if directory.get_page(vaddr, true, bootstrap).is_none() {
                panic!("out of bootstrap memory for heap page tables");
            }
            vaddr += PAGE_SIZE;
        }

        // Everything handed out by the placement allocator (kernel image,
        // directory, tables) plus the loader structures and the video
        // memory must stay identity-mapped across the directory switch:
        // pointers captured before it are dereferenced after. Mapping can
        // itself allocate tables and move the watermark, so chase it.
        let mut mapped_end = boot.kernel.start.align_down(PAGE_SIZE);
        while mapped_end < bootstrap.alloc_start() {
            let target = bootstrap.alloc_start();
            Self::identity_map(&mut directory, bootstrap, mapped_end, target);
            mapped_end = target;
        }
        Self::identity_map(
            &mut directory,
            bootstrap,
            boot.boot_info.start.align_down(PAGE_SIZE),
            boot.boot_info.end,
        );
        Self::identity_map(
            &mut directory,
            bootstrap,
            layout::VIDEO_RAM_START,
            layout::VIDEO_RAM_END,
        );

        // Bulk structural change: switch to the steady-state directory.
        unsafe { directory.activate() };

        // The frame allocator needs one spare page-table slot as its
        // scratch window; a directory without one cannot boot.
        let scratch = match ScratchMapping::locate(&mut directory) {
            Some(scratch) => scratch,
            None => panic!("no free page-table slot for the frame allocator scratch window"),
        };

        bootstrap.align_placement_address();
        let reserved_boot =
            FrameRegion::covering(boot.kernel.start.align_down(PAGE_SIZE), bootstrap.alloc_start());
        let mut frames = StackFrameAllocator::new(scratch);
        frames.init_from_map(boot.memory_map.regions(), reserved_boot);

        // Eagerly back the heap's initial slice with real frames.
        let mut vaddr = layout::KERNEL_HEAP_START;
        while vaddr < layout::KERNEL_HEAP_START + layout::KERNEL_HEAP_INITIAL_SIZE {
            let entry = match directory.get_page(vaddr, true, bootstrap) {
                Some(entry) => entry,
                None => panic!("heap page table vanished"),
            };
            if frames.alloc_frame_into(entry, true, true).is_none() {
                panic!("out of physical memory while backing the kernel heap");
            }
            unsafe { mmu::flush_tlb_entry(vaddr) };
            vaddr += PAGE_SIZE;
        }

        let arena = unsafe {
            Arena::from_raw(
                layout::KERNEL_HEAP_START.as_mut_ptr(),
                layout::KERNEL_HEAP_INITIAL_SIZE,
            )
        };
        let heap = Heap::init(arena);

        MemorySubsystem {
            directory,
            frames,
            heap: Mutex::new(heap),
        }
    }

    fn identity_map(
        directory: &mut PageDirectory,
        bootstrap: &mut BootstrapAllocator,
        start: PhysAddr,
        end: PhysAddr,
    ) {
        let mut frame = start.align_down(PAGE_SIZE);
        while frame < end {
            let made = directory.create_mapping(
                VirtAddr(frame.0),
                frame,
                crate::paging::EntryFlags::WRITABLE,
                bootstrap,
            );
            if made.is_none() {
                panic!("out of bootstrap memory while identity mapping {:p}", frame);
            }
            frame += PAGE_SIZE;
        }
    }
}

impl MemorySubsystem<BitmapFrameAllocator> {
    /// Alternative startup configuration using the bitmap allocator; no
    /// scratch window required. `bitmap_storage` must come from the
    /// bootstrap placement region and cover `capacity` frames.
    pub fn init_with_bitmap(
        boot: &BootRecord,
        bootstrap: &mut BootstrapAllocator,
        bitmap_storage: &'static mut [usize],
        capacity: usize,
    ) -> MemorySubsystem<BitmapFrameAllocator> {
        bootstrap.adjust_alloc_start(boot.highest_reserved());

        let mut directory = match PageDirectory::new(bootstrap) {
            Some(directory) => directory,
            None => panic!("out of bootstrap memory for the page directory"),
        };
        let mut vaddr = layout::KERNEL_HEAP_START;
        while vaddr < layout::KERNEL_HEAP_END {
            if directory.get_page(vaddr, true, bootstrap).is_none() {
                panic!("out of bootstrap memory for heap page tables");
            }
            vaddr += PAGE_SIZE;
        }
        let mut mapped_end = boot.kernel.start.align_down(PAGE_SIZE);
        while mapped_end < bootstrap.alloc_start() {
            let target = bootstrap.alloc_start();
            KernelMemory::identity_map(&mut directory, bootstrap, mapped_end, target);
            mapped_end = target;
        }
        KernelMemory::identity_map(
            &mut directory,
            bootstrap,
            boot.boot_info.start.align_down(PAGE_SIZE),
            boot.boot_info.end,
        );
        KernelMemory::identity_map(
            &mut directory,
            bootstrap,
            layout::VIDEO_RAM_START,
            layout::VIDEO_RAM_END,
        );
        unsafe { directory.activate() };

        bootstrap.align_placement_address();
        let reserved_boot =
            FrameRegion::covering(boot.kernel.start.align_down(PAGE_SIZE), bootstrap.alloc_start());
        let mut frames = BitmapFrameAllocator::new(bitmap_storage, capacity);
        frames.init_from_map(boot.memory_map.regions(), reserved_boot);

        let mut vaddr = layout::KERNEL_HEAP_START;
        while vaddr < layout::KERNEL_HEAP_START + layout::KERNEL_HEAP_INITIAL_SIZE {
            let entry = match directory.get_page(vaddr, true, bootstrap) {
                Some(entry) => entry,
                None => panic!("heap page table vanished"),
            };
            if frames.alloc_frame_into(entry, true, true).is_none() {
                panic!("out of physical memory while backing the kernel heap");
            }
            unsafe { mmu::flush_tlb_entry(vaddr) };
            vaddr += PAGE_SIZE;
        }

        let arena = unsafe {
            Arena::from_raw(
                layout::KERNEL_HEAP_START.as_mut_ptr(),
                layout::KERNEL_HEAP_INITIAL_SIZE,
            )
        };
        let heap = Heap::init(arena);

        MemorySubsystem {
            directory,
            frames,
            heap: Mutex::new(heap),
        }
    }
}

impl<A: FrameAllocator> MemorySubsystem<A> {
    /// Assemble a subsystem from already-initialized parts.
    pub fn from_parts(directory: PageDirectory, frames: A, heap: Heap) -> MemorySubsystem<A> {
        MemorySubsystem {
            directory,
            frames,
            heap: Mutex::new(heap),
        }
    }

    /// Allocate kernel memory. With `page_align` the returned address is
    /// page-aligned; with `physical` the backing physical address is
    /// resolved through the page directory (for DMA-style callers).
    pub fn allocate(
        &mut self,
        size: usize,
        page_align: bool,
        physical: Option<&mut PhysAddr>,
    ) -> Option<VirtAddr> {
        let addr = {
            let _guard = interrupts::enter_critical();
            let mut heap = self.heap.lock();
            let offset = if page_align {
                heap.allocate_aligned(size, PAGE_SIZE)?
            } else {
                heap.allocate(size)?
            };
            heap.base_addr() + offset
        };

        if let Some(physical) = physical {
            *physical = match self.directory.translate(addr) {
                Some(paddr) => paddr,
                None => panic!("heap address {:p} has no backing frame", addr),
            };
        }
        Some(addr)
    }

    /// Resize an allocation; see [`Heap::realloc`] for the exact semantics.
    pub fn reallocate(&mut self, ptr: VirtAddr, size: usize) -> Option<VirtAddr> {
        let _guard = interrupts::enter_critical();
        let mut heap = self.heap.lock();
        let offset = heap.offset_of(ptr);
        let moved = heap.realloc(offset, size)?;
        Some(heap.base_addr() + moved)
    }

    /// Release an allocation. Null pointers and the zero-size sentinel are
    /// ignored.
    pub fn free(&mut self, ptr: VirtAddr) {
        if ptr.0 == 0 {
            return;
        }
        let _guard = interrupts::enter_critical();
        let mut heap = self.heap.lock();
        let offset = heap.offset_of(ptr);
        heap.free(offset);
    }

    /// Merge and re-file the heap's free blocks.
    pub fn coalesce(&mut self) {
        let _guard = interrupts::enter_critical();
        self.heap.lock().coalesce();
    }

    /// Validate the heap's block chain; fatal on corruption.
    pub fn check_integrity(&self) {
        let _guard = interrupts::enter_critical();
        self.heap.lock().check_integrity();
    }

    pub fn heap_stats(&self) -> HeapStats {
        let _guard = interrupts::enter_critical();
        self.heap.lock().stats()
    }

    /// Usable bytes of the heap region.
    pub fn heap_size(&self) -> usize {
        self.heap.lock().usable_size()
    }

    pub fn frame_stats(&self) -> FrameStats {
        self.frames.stats()
    }

    /// The page directory, e.g. for the page-fault handler to probe
    /// translations.
    pub fn directory(&self) -> &PageDirectory {
        &self.directory
    }

    pub fn directory_mut(&mut self) -> &mut PageDirectory {
        &mut self.directory
    }

    /// The frame allocator, e.g. for the page-fault handler to demand-map a
    /// fresh frame.
    pub fn frames_mut(&mut self) -> &mut A {
        &mut self.frames
    }
}
