//! Physical frame allocator
//!
//! Turns the firmware memory map into a list of allocatable 2 MiB frames.
//! The frame records are written back-to-back starting at the end of the
//! kernel image, inside the very memory they describe; while the list is
//! growing it asks the address space for bootstrap mappings whenever the
//! next record would cross the mapped window.

use core::mem::size_of;
use core::ptr::NonNull;

use arrayvec::ArrayVec;
use x86_64::{
    align_up,
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size2MiB},
    PhysAddr, VirtAddr,
};

use crate::constants::memory::{FRAME_SIZE, MAX_RESERVED_REGIONS};
use crate::memory::vmm::BootstrapMapper;
use crate::memory::{KernelLayout, MemoryRegion, RegionKind};

/// One 2 MiB-aligned physical frame. The free flag is the sole arbiter of
/// allocability; neighbors are reached by index, not embedded pointers.
#[derive(Debug, Clone, Copy)]
pub struct FrameRecord {
    base: PhysAddr,
    free: bool,
}

impl FrameRecord {
    pub fn base(&self) -> PhysAddr {
        self.base
    }

    pub fn is_free(&self) -> bool {
        self.free
    }
}

/// Index-addressed record array over a fixed backing region. The caller
/// guarantees the backing stays addressable as the list grows; every
/// access is bounds-checked against the current length.
pub struct FrameList {
    base: NonNull<FrameRecord>,
    len: usize,
}

// The list is only ever touched through the allocator's global lock.
unsafe impl Send for FrameList {}

impl FrameList {
    /// # Safety
    ///
    /// `base` must point at writable memory with room for every record
    /// subsequently pushed (the ingestion path maps pages ahead of the
    /// write cursor to keep that true).
    unsafe fn new(base: NonNull<FrameRecord>) -> Self {
        FrameList { base, len: 0 }
    }

    fn len(&self) -> usize {
        self.len
    }

    /// First byte past the last record.
    fn end_address(&self) -> u64 {
        self.base.as_ptr() as u64 + (self.len * size_of::<FrameRecord>()) as u64
    }

    fn get(&self, index: usize) -> &FrameRecord {
        assert!(index < self.len, "frame record index out of bounds");
        unsafe { &*self.base.as_ptr().add(index) }
    }

    fn get_mut(&mut self, index: usize) -> &mut FrameRecord {
        assert!(index < self.len, "frame record index out of bounds");
        unsafe { &mut *self.base.as_ptr().add(index) }
    }

    fn push(&mut self, record: FrameRecord) {
        unsafe { self.base.as_ptr().add(self.len).write(record) };
        self.len += 1;
    }

    fn iter(&self) -> impl Iterator<Item = &FrameRecord> {
        (0..self.len).map(move |i| self.get(i))
    }
}

/// A physical range that must never enter the free-frame list.
#[derive(Debug, Clone, Copy)]
pub struct ReservedRegion {
    pub base: u64,
    pub size: u64,
}

/// Aggregate byte counts derived once from the memory map.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStats {
    pub total_bytes: u64,
    pub usable_bytes: u64,
    pub reserved_bytes: u64,
}

/// The physical frame allocator context.
pub struct ListFrameAllocator {
    records: Option<FrameList>,
    /// Record probed first on the next allocation.
    next_probe: usize,
    reserved: ArrayVec<ReservedRegion, MAX_RESERVED_REGIONS>,
    stats: MemoryStats,
}

impl ListFrameAllocator {
    pub const fn new() -> Self {
        ListFrameAllocator {
            records: None,
            next_probe: 0,
            reserved: ArrayVec::new_const(),
            stats: MemoryStats {
                total_bytes: 0,
                usable_bytes: 0,
                reserved_bytes: 0,
            },
        }
    }

    /// Register `[base, base + size)` as off limits.
    ///
    /// Before ingestion this drives the clipping pass; afterwards it
    /// retires any free record the range overlaps, so a late device
    /// mapping cannot race an already-built list. The table bound is a
    /// programming contract, not a runtime condition.
    pub fn reserve(&mut self, base: u64, size: u64) {
        if self
            .reserved
            .try_push(ReservedRegion { base, size })
            .is_err()
        {
            panic!("reserved-region table overflow ({} entries)", MAX_RESERVED_REGIONS);
        }
        if let Some(list) = &mut self.records {
            for i in 0..list.len() {
                let record = list.get_mut(i);
                if record.free && ranges_overlap(record.base.as_u64(), FRAME_SIZE, base, size) {
                    record.free = false;
                }
            }
        }
    }

    /// Ingest the memory map.
    ///
    /// Usable regions are clipped against the image footprint and every
    /// registered reservation, their surviving starts rounded up to 2 MiB,
    /// and one record emitted per frame base in range. Records are written
    /// at `record_base` onward; the prefix of frames covered by the image
    /// plus the finished record list is marked used at the end.
    pub fn init<M: BootstrapMapper>(
        &mut self,
        regions: &[MemoryRegion],
        layout: &KernelLayout,
        record_base: VirtAddr,
        bootstrap: &mut M,
    ) {
        assert!(self.records.is_none(), "frame allocator initialized twice");

        let image_end = layout.physical_end().as_u64();
        let mut list = unsafe {
            FrameList::new(
                NonNull::new(record_base.as_mut_ptr::<FrameRecord>())
                    .expect("record area has a null base"),
            )
        };

        for region in regions {
            self.stats.total_bytes += region.length;
            match region.kind {
                RegionKind::Usable => self.stats.usable_bytes += region.length,
                RegionKind::Reserved => {
                    self.stats.reserved_bytes += region.length;
                    continue;
                }
            }
            // Clip the image footprint; everything below its end belongs
            // to the kernel or to boot-time structures.
            let start = region.base.max(image_end);
            let end = region.base + region.length;
            if start >= end {
                continue;
            }
            ingest_range(&mut list, start, end, &self.reserved, 0, bootstrap);
        }

        // The records start at the image end, so the combined footprint is
        // the image plus the list itself. Frames under it are not free.
        let footprint_end = align_up(image_end, core::mem::align_of::<FrameRecord>() as u64)
            + (list.len() * size_of::<FrameRecord>()) as u64;
        for i in 0..list.len() {
            let record = list.get_mut(i);
            if record.base.as_u64() >= footprint_end {
                break;
            }
            record.free = false;
        }

        log::info!(
            "physical memory: {} frames tracked, {} KiB of records",
            list.len(),
            (list.len() * size_of::<FrameRecord>()) / 1024
        );
        self.records = Some(list);
    }

    /// Take the first free frame, probing the record after the last
    /// allocation before falling back to a full scan. `None` means
    /// exhaustion; callers that cannot tolerate it escalate themselves.
    pub fn allocate_frame(&mut self) -> Option<PhysFrame<Size2MiB>> {
        let index = {
            let list = self.records.as_ref()?;
            let probe = self.next_probe;
            if probe < list.len() && list.get(probe).free {
                probe
            } else {
                (0..list.len()).find(|&i| list.get(i).free)?
            }
        };
        let list = self.records.as_mut().expect("records checked above");
        let record = list.get_mut(index);
        record.free = false;
        let base = record.base;
        self.next_probe = index + 1;
        Some(PhysFrame::from_start_address(base).expect("frame records are 2 MiB aligned"))
    }

    /// Mark the frame at `addr` free again. The caller is responsible for
    /// having cleared the frame's contents; nothing is zeroed here.
    ///
    /// Returns false for addresses that match no record and for frames
    /// that are already free.
    pub fn free_frame(&mut self, addr: PhysAddr) -> bool {
        let Some(list) = self.records.as_mut() else {
            return false;
        };
        for i in 0..list.len() {
            let record = list.get_mut(i);
            if record.base == addr {
                if record.free {
                    return false;
                }
                record.free = true;
                return true;
            }
        }
        false
    }

    pub fn frame_count(&self) -> usize {
        self.records.as_ref().map_or(0, FrameList::len)
    }

    pub fn free_frames(&self) -> usize {
        self.records
            .as_ref()
            .map_or(0, |list| list.iter().filter(|r| r.free).count())
    }

    pub fn used_frames(&self) -> usize {
        self.frame_count() - self.free_frames()
    }

    pub fn stats(&self) -> MemoryStats {
        self.stats
    }

    pub fn records(&self) -> impl Iterator<Item = &FrameRecord> {
        self.records.iter().flat_map(FrameList::iter)
    }
}

unsafe impl FrameAllocator<Size2MiB> for ListFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size2MiB>> {
        ListFrameAllocator::allocate_frame(self)
    }
}

impl FrameDeallocator<Size2MiB> for ListFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size2MiB>) {
        if !self.free_frame(frame.start_address()) {
            log::error!(
                "freeing unknown or already-free frame at {:#x}",
                frame.start_address()
            );
        }
    }
}

fn ranges_overlap(a_base: u64, a_size: u64, b_base: u64, b_size: u64) -> bool {
    a_base < b_base.saturating_add(b_size) && b_base < a_base.saturating_add(a_size)
}

/// Split `[start, end)` against the reservations at `from..`, then emit
/// one record per 2 MiB frame base in each surviving sub-range. A trailing
/// frame may overhang an unaligned usable tail, but never a reservation.
fn ingest_range<M: BootstrapMapper>(
    list: &mut FrameList,
    start: u64,
    end: u64,
    reserved: &[ReservedRegion],
    from: usize,
    bootstrap: &mut M,
) {
    for i in from..reserved.len() {
        let region = reserved[i];
        let region_end = region.base.saturating_add(region.size);
        if region.base < end && start < region_end {
            if start < region.base {
                ingest_range(list, start, region.base, reserved, i + 1, bootstrap);
            }
            if region_end < end {
                ingest_range(list, region_end, end, reserved, i + 1, bootstrap);
            }
            return;
        }
    }

    let mut base = align_up(start, FRAME_SIZE);
    while base < end {
        let clear = reserved
            .iter()
            .all(|r| !ranges_overlap(base, FRAME_SIZE, r.base, r.size));
        if clear {
            push_record(list, PhysAddr::new(base), bootstrap);
        }
        base += FRAME_SIZE;
    }
}

/// Append one record, mapping further record pages first if the write
/// would cross the currently-backed window.
fn push_record<M: BootstrapMapper>(list: &mut FrameList, base: PhysAddr, bootstrap: &mut M) {
    let write_end = list.end_address() + size_of::<FrameRecord>() as u64;
    while write_end > bootstrap.mapped_end().as_u64() {
        let next_page = bootstrap.mapped_end();
        bootstrap.map_record_page(next_page);
    }
    list.push(FrameRecord { base, free: true });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::memory::{KERNEL_VIRTUAL_BASE, PAGE_2MIB};
    use core::mem::MaybeUninit;

    /// Backing window so large the growth path never triggers.
    struct OpenWindow;

    impl BootstrapMapper for OpenWindow {
        fn mapped_end(&self) -> VirtAddr {
            VirtAddr::new(0xFFFF_FFFF_FFFF_F000)
        }

        fn map_record_page(&mut self, _virt: VirtAddr) {
            unreachable!("open window never needs growth");
        }
    }

    /// Window that starts just past `end` and counts every growth call.
    struct CountingWindow {
        end: u64,
        maps: usize,
    }

    impl BootstrapMapper for CountingWindow {
        fn mapped_end(&self) -> VirtAddr {
            VirtAddr::new(self.end)
        }

        fn map_record_page(&mut self, virt: VirtAddr) {
            self.end = virt.align_down(PAGE_2MIB).as_u64() + PAGE_2MIB;
            self.maps += 1;
        }
    }

    fn layout(image_end: u64) -> KernelLayout {
        KernelLayout {
            kernel_end: VirtAddr::new(KERNEL_VIRTUAL_BASE + image_end),
        }
    }

    fn usable(base: u64, length: u64) -> MemoryRegion {
        MemoryRegion {
            base,
            length,
            kind: RegionKind::Usable,
        }
    }

    fn record_base(buffer: &mut [MaybeUninit<FrameRecord>]) -> VirtAddr {
        VirtAddr::new(buffer.as_mut_ptr() as u64)
    }

    #[test_case]
    fn four_mib_map_scenario() {
        // 4 MiB usable at 1 MiB, image through 0x180000: frames at
        // 0x200000 and 0x400000 and nothing else.
        let mut buffer = [MaybeUninit::<FrameRecord>::uninit(); 16];
        let mut pfa = ListFrameAllocator::new();
        pfa.init(
            &[usable(0x10_0000, 0x40_0000)],
            &layout(0x18_0000),
            record_base(&mut buffer),
            &mut OpenWindow,
        );
        assert_eq!(pfa.frame_count(), 2);

        let first = pfa.allocate_frame().expect("first frame");
        let second = pfa.allocate_frame().expect("second frame");
        assert_eq!(first.start_address().as_u64(), 0x20_0000);
        assert_eq!(second.start_address().as_u64(), 0x40_0000);
        assert!(pfa.allocate_frame().is_none());
    }

    #[test_case]
    fn frames_are_disjoint_and_aligned() {
        let mut buffer = [MaybeUninit::<FrameRecord>::uninit(); 64];
        let mut pfa = ListFrameAllocator::new();
        pfa.init(
            &[usable(0x10_0000, 0x40_0000), usable(0x100_0000, 0x80_0000)],
            &layout(0x18_0000),
            record_base(&mut buffer),
            &mut OpenWindow,
        );
        assert!(pfa.frame_count() > 0);
        let mut prev_end = 0u64;
        for record in pfa.records() {
            let base = record.base().as_u64();
            assert_eq!(base % FRAME_SIZE, 0);
            assert!(base >= prev_end, "records overlap or run backwards");
            prev_end = base + FRAME_SIZE;
        }
    }

    #[test_case]
    fn allocate_free_round_trip() {
        let mut buffer = [MaybeUninit::<FrameRecord>::uninit(); 16];
        let mut pfa = ListFrameAllocator::new();
        pfa.init(
            &[usable(0x10_0000, 0x40_0000)],
            &layout(0x18_0000),
            record_base(&mut buffer),
            &mut OpenWindow,
        );
        let before = pfa.free_frames();
        let frame = pfa.allocate_frame().expect("frame available");
        assert_eq!(pfa.free_frames(), before - 1);
        assert!(pfa.free_frame(frame.start_address()));
        assert_eq!(pfa.free_frames(), before);
    }

    #[test_case]
    fn reservations_are_excluded() {
        let mut buffer = [MaybeUninit::<FrameRecord>::uninit(); 16];
        let mut pfa = ListFrameAllocator::new();
        pfa.reserve(0x40_0000, 0x10_0000);
        pfa.init(
            &[usable(0x10_0000, 0x40_0000)],
            &layout(0x18_0000),
            record_base(&mut buffer),
            &mut OpenWindow,
        );
        for record in pfa.records() {
            assert!(!ranges_overlap(
                record.base().as_u64(),
                FRAME_SIZE,
                0x40_0000,
                0x10_0000
            ));
        }
        assert_eq!(pfa.frame_count(), 1);
    }

    #[test_case]
    fn foreign_and_double_frees_are_rejected() {
        let mut buffer = [MaybeUninit::<FrameRecord>::uninit(); 16];
        let mut pfa = ListFrameAllocator::new();
        pfa.init(
            &[usable(0x10_0000, 0x40_0000)],
            &layout(0x18_0000),
            record_base(&mut buffer),
            &mut OpenWindow,
        );
        assert!(!pfa.free_frame(PhysAddr::new(0x7000_0000)));
        let frame = pfa.allocate_frame().expect("frame available");
        assert!(pfa.free_frame(frame.start_address()));
        assert!(!pfa.free_frame(frame.start_address()));
    }

    #[test_case]
    fn record_growth_requests_bootstrap_pages() {
        let mut buffer = [MaybeUninit::<FrameRecord>::uninit(); 16];
        let base = record_base(&mut buffer);
        // Window ends mid-way through the first record, so the very first
        // push has to grow it.
        let mut window = CountingWindow {
            end: base.as_u64() + 8,
            maps: 0,
        };
        let mut pfa = ListFrameAllocator::new();
        pfa.init(
            &[usable(0x10_0000, 0x40_0000)],
            &layout(0x18_0000),
            base,
            &mut window,
        );
        assert!(window.maps >= 1);
        assert_eq!(pfa.frame_count(), 2);
    }
}
