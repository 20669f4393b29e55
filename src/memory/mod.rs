//! Kernel memory management
//!
//! Three subsystems in strict boot order: the virtual memory manager
//! builds and activates the translation hierarchy, the physical frame
//! allocator ingests the firmware memory map (growing its record list
//! through the VMM's bootstrap mapping), and the kernel heap carves its
//! size classes out of whole kernel pages. Everything else in the kernel
//! goes through the free functions here.

pub mod frame_allocator;
pub mod heap;
pub mod vmm;

use core::mem::align_of;

use spin::Mutex;
use x86_64::{
    align_up,
    structures::paging::{PhysFrame, Size2MiB},
    PhysAddr, VirtAddr,
};

use crate::constants::memory::KERNEL_VIRTUAL_BASE;
use frame_allocator::{FrameRecord, ListFrameAllocator, MemoryStats};
use heap::PageProvider;
use vmm::KernelAddressSpace;

pub use heap::{allocate, release};

/// Classification of a firmware memory map row. Anything the firmware
/// does not report as usable is treated as reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Usable,
    Reserved,
}

/// One row of the bootloader-supplied physical memory map. The rows are
/// assumed ordered by base address; overlaps within the input are the
/// boot parser's problem, not re-validated here.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: RegionKind,
}

/// Load geometry of the kernel image. The image is linked at
/// `KERNEL_VIRTUAL_BASE` with its physical base at 1 MiB, so physical
/// addresses of image structures are a fixed offset away.
#[derive(Debug, Clone, Copy)]
pub struct KernelLayout {
    /// Linker-reported end of the loaded image (virtual).
    pub kernel_end: VirtAddr,
}

impl KernelLayout {
    pub fn physical_end(&self) -> PhysAddr {
        PhysAddr::new(self.kernel_end.as_u64() - KERNEL_VIRTUAL_BASE)
    }
}

/// The active translation hierarchy.
pub static ADDRESS_SPACE: Mutex<KernelAddressSpace> = Mutex::new(KernelAddressSpace::new());

/// The physical frame allocator.
pub static FRAME_ALLOCATOR: Mutex<ListFrameAllocator> = Mutex::new(ListFrameAllocator::new());

/// Page source that borrows already-locked subsystems, used while
/// `init` still holds both guards.
struct BorrowedProvider<'a> {
    space: &'a mut KernelAddressSpace,
    frames: &'a mut ListFrameAllocator,
}

impl PageProvider for BorrowedProvider<'_> {
    fn new_kernel_page(&mut self) -> VirtAddr {
        self.space.new_kernel_page(self.frames)
    }
}

/// Bring up all three subsystems. Strictly linear: hierarchy built and
/// activated, memory map ingested, heap classes carved.
pub fn init(regions: &[MemoryRegion], layout: KernelLayout) {
    let mut space = ADDRESS_SPACE.lock();
    space.initialize(&layout);
    unsafe { space.activate() };
    log::info!("address space active, kernel mapped through {:#x}", space.mapping_end());

    let mut frames = FRAME_ALLOCATOR.lock();
    let record_base = VirtAddr::new(align_up(
        layout.kernel_end.as_u64(),
        align_of::<FrameRecord>() as u64,
    ));
    {
        let mut bootstrap = space.bootstrap();
        frames.init(regions, &layout, record_base, &mut bootstrap);
    }
    log::info!(
        "frame allocator ready: {} free / {} tracked",
        frames.free_frames(),
        frames.frame_count()
    );

    heap::init_heap(&mut BorrowedProvider {
        space: &mut *space,
        frames: &mut *frames,
    });
    log::info!("kernel heap ready");
}

/// Allocate one 2 MiB physical frame. `None` means exhaustion.
pub fn alloc_frame() -> Option<PhysFrame<Size2MiB>> {
    FRAME_ALLOCATOR.lock().allocate_frame()
}

/// Return a frame from `alloc_frame`. The caller clears its contents.
pub fn free_frame(addr: PhysAddr) {
    if !FRAME_ALLOCATOR.lock().free_frame(addr) {
        log::error!("free_frame({:#x}) matches no allocated frame", addr);
    }
}

/// Back a fresh kernel virtual page with a frame and return its address.
pub fn new_kernel_page() -> VirtAddr {
    let mut space = ADDRESS_SPACE.lock();
    let mut frames = FRAME_ALLOCATOR.lock();
    space.new_kernel_page(&mut *frames)
}

/// Keep `[base, base + size)` out of the free-frame list.
pub fn reserve_memory(base: u64, size: u64) {
    FRAME_ALLOCATOR.lock().reserve(base, size);
}

/// Map a device framebuffer into the kernel window and reserve it.
pub fn map_framebuffer(phys: PhysAddr, size: u64) -> VirtAddr {
    let mut space = ADDRESS_SPACE.lock();
    let mut frames = FRAME_ALLOCATOR.lock();
    space.map_framebuffer(&mut *frames, phys, size)
}

/// Translate a virtual address through the active hierarchy.
pub fn virt_to_phys(virt: VirtAddr) -> Option<PhysAddr> {
    ADDRESS_SPACE.lock().virtual_to_physical(virt)
}

/// Aggregate byte counts derived from the memory map.
pub fn memory_stats() -> MemoryStats {
    FRAME_ALLOCATOR.lock().stats()
}

/// (free, used) frame counts.
pub fn frame_counts() -> (usize, usize) {
    let frames = FRAME_ALLOCATOR.lock();
    (frames.free_frames(), frames.used_frames())
}

/// Log the system-information report: map totals, frame counts and
/// per-slab heap occupancy. Read-only; diagnostics, not contract.
pub fn log_memory_report() {
    let stats = memory_stats();
    let (free, used) = frame_counts();
    log::info!(
        "memory: {} KiB total, {} KiB usable, {} KiB reserved",
        stats.total_bytes / 1024,
        stats.usable_bytes / 1024,
        stats.reserved_bytes / 1024
    );
    log::info!("frames: {} free, {} used", free, used);
    heap::ALLOCATOR.slab_stats(|slab| {
        log::info!(
            "slab[{} B]: {} / {} slots used",
            slab.object_size,
            slab.used_slots,
            slab.total_slots
        );
    });
}
