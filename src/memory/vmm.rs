//! Virtual memory manager
//!
//! Owns the active four-level translation hierarchy. The kernel is linked
//! in the top 2 GiB of the address space and the low 2 MiB stays identity
//! mapped for boot-time structures, so two top-level slots alias the same
//! kernel PDP. The kernel window itself is built from 2 MiB leaves; only
//! the first directory entry carries a 4 KiB table.

use x86_64::{
    instructions::tlb,
    registers::control::{Cr3, Cr3Flags},
    structures::paging::{FrameAllocator, PageTable, PageTableFlags, PhysFrame, Size2MiB},
    PhysAddr, VirtAddr,
};

use crate::constants::memory::{
    KERNEL_DIRECTORY_SPAN, KERNEL_VIRTUAL_BASE, PAGE_2MIB, PAGE_4KIB, TABLE_ENTRIES,
};
use crate::memory::KernelLayout;

/// Seam between the frame-record list and the address space while the
/// physical allocator is still ingesting the memory map. The list grows
/// through this and nothing else.
pub trait BootstrapMapper {
    /// Exclusive end of the virtual window currently backed by frames.
    fn mapped_end(&self) -> VirtAddr;

    /// Make the 2 MiB page containing `virt` addressable. The backing
    /// frame is assumed to sit directly below `virt` in the kernel's
    /// contiguous physical layout.
    fn map_record_page(&mut self, virt: VirtAddr);
}

/// The kernel's translation hierarchy: one top-level table, the kernel
/// PDP/PD/PT and a user PDP/PD whose leaves stay unbacked. All tables are
/// statically allocated and 4 KiB aligned via `PageTable`'s own layout.
#[repr(C)]
pub struct KernelAddressSpace {
    pml4: PageTable,
    kpdp: PageTable,
    kpde: PageTable,
    kpte: PageTable,
    user_pdp: PageTable,
    user_pde: PageTable,
    /// Physical end (exclusive) of the contiguously mapped kernel window.
    mapping_end: u64,
}

impl KernelAddressSpace {
    pub const fn new() -> Self {
        KernelAddressSpace {
            pml4: PageTable::new(),
            kpdp: PageTable::new(),
            kpde: PageTable::new(),
            kpte: PageTable::new(),
            user_pdp: PageTable::new(),
            user_pde: PageTable::new(),
            mapping_end: 0,
        }
    }

    /// Physical address of one of our own tables. Image structures live at
    /// `KERNEL_VIRTUAL_BASE + phys`, so the offset is a plain subtraction.
    fn table_phys(&self, table: &PageTable) -> PhysAddr {
        PhysAddr::new(table as *const PageTable as u64 - KERNEL_VIRTUAL_BASE)
    }

    /// Build the boot hierarchy.
    ///
    /// Top-level slots 0 and 511 alias the kernel PDP and PDP slots 0 and
    /// 510 alias the kernel PD, so the low identity window and the high
    /// kernel window resolve through shared tables. The first 2 MiB gets
    /// 4 KiB identity leaves, the rest of the image 2 MiB leaves, and the
    /// user window a present path down to leaves that stay unbacked.
    ///
    /// Panics if the image needs more 2 MiB leaves than the directory
    /// holds; nothing can recover that early.
    pub fn initialize(&mut self, layout: &KernelLayout) {
        self.pml4.zero();
        self.kpdp.zero();
        self.kpde.zero();
        self.kpte.zero();
        self.user_pdp.zero();
        self.user_pde.zero();

        let kpdp_phys = self.table_phys(&self.kpdp);
        let kpde_phys = self.table_phys(&self.kpde);
        let kpte_phys = self.table_phys(&self.kpte);
        let user_pdp_phys = self.table_phys(&self.user_pdp);
        let user_pde_phys = self.table_phys(&self.user_pde);

        let kw = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;

        self.pml4[511].set_addr(kpdp_phys, kw);
        self.pml4[0].set_addr(kpdp_phys, kw);

        self.kpdp[510].set_addr(kpde_phys, kw);
        self.kpdp[0].set_addr(kpde_phys, kw);

        // 4 KiB identity leaves for the first 2 MiB.
        self.kpde[0].set_addr(kpte_phys, kw);
        for i in 0..TABLE_ENTRIES {
            self.kpte[i].set_addr(PhysAddr::new(PAGE_4KIB * i as u64), kw);
        }

        // 2 MiB leaves covering the rest of the loaded image.
        let image_bytes = layout.kernel_end.as_u64() - KERNEL_VIRTUAL_BASE;
        let image_pages = (image_bytes + PAGE_2MIB) / PAGE_2MIB;
        if image_pages > KERNEL_DIRECTORY_SPAN {
            panic!(
                "kernel image of {} bytes exceeds the {} leaves of its directory",
                image_bytes, KERNEL_DIRECTORY_SPAN
            );
        }
        for i in 1..=image_pages {
            self.kpde[i as usize].set_addr(
                PhysAddr::new(PAGE_2MIB * i),
                kw | PageTableFlags::HUGE_PAGE,
            );
        }
        self.mapping_end = PAGE_2MIB * (image_pages + 1);

        let uw = kw | PageTableFlags::USER_ACCESSIBLE;
        self.pml4[1].set_addr(user_pdp_phys, uw);
        self.user_pdp[0].set_addr(user_pde_phys, uw);
        for i in 0..TABLE_ENTRIES {
            // User leaves are prepared but not present; nothing backs them.
            self.user_pde[i].set_addr(
                PhysAddr::new(PAGE_2MIB * i as u64),
                PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
            );
        }
    }

    /// Load this hierarchy into the translation-root register.
    ///
    /// # Safety
    ///
    /// The tables must describe the memory the kernel is currently
    /// executing from; activating a half-built hierarchy faults instantly.
    pub unsafe fn activate(&self) {
        let root = PhysFrame::containing_address(self.table_phys(&self.pml4));
        Cr3::write(root, Cr3Flags::empty());
    }

    /// Physical end (exclusive) of the contiguously mapped kernel window.
    pub fn mapping_end(&self) -> u64 {
        self.mapping_end
    }

    /// Hand out the bootstrap mapping handle. It borrows the address space
    /// exclusively, so the unchecked primitive is unreachable once frame
    /// ingestion returns and the borrow ends.
    pub fn bootstrap(&mut self) -> Bootstrap<'_> {
        Bootstrap { space: self }
    }

    /// Back the first absent kernel directory leaf with a fresh 2 MiB
    /// frame and return its virtual address.
    ///
    /// PDP slots are probed starting at the two nearest the kernel load
    /// window, then wrapping through the remainder. Panics when the frame
    /// allocator or the whole kernel region is exhausted; there is no
    /// reclaim to fall back on.
    pub fn new_kernel_page(&mut self, frames: &mut impl FrameAllocator<Size2MiB>) -> VirtAddr {
        let kpde_phys = self.table_phys(&self.kpde);
        for pdp_index in [510usize, 511].into_iter().chain(0..510) {
            let entry_addr = {
                let entry = &self.kpdp[pdp_index];
                if !entry.flags().contains(PageTableFlags::PRESENT) {
                    continue;
                }
                entry.addr()
            };
            if entry_addr != kpde_phys {
                continue;
            }
            for pde_index in 0..TABLE_ENTRIES {
                if self.kpde[pde_index].is_unused() {
                    let frame = frames
                        .allocate_frame()
                        .expect("out of physical frames while growing the kernel region");
                    self.kpde[pde_index].set_addr(
                        frame.start_address(),
                        PageTableFlags::PRESENT
                            | PageTableFlags::WRITABLE
                            | PageTableFlags::HUGE_PAGE,
                    );
                    tlb::flush_all();
                    return kernel_page_virt(pdp_index, pde_index);
                }
            }
        }
        panic!("kernel virtual region exhausted");
    }

    /// Map a physical device range at its identity-offset position in the
    /// kernel window, cache-disabled, and register it reserved so the
    /// frame allocator never hands it out. Remapping the same range with
    /// the same parameters rewrites identical leaves.
    pub fn map_framebuffer(
        &mut self,
        frames: &mut super::frame_allocator::ListFrameAllocator,
        phys: PhysAddr,
        size: u64,
    ) -> VirtAddr {
        frames.reserve(phys.as_u64(), size);

        let end = phys.as_u64() + size;
        let mut base = phys.align_down(PAGE_2MIB).as_u64();
        while base < end {
            let virt = VirtAddr::new(KERNEL_VIRTUAL_BASE + base);
            if usize::from(virt.p3_index()) != 510 {
                panic!("framebuffer at {:#x} falls outside the kernel directory window", base);
            }
            self.kpde[usize::from(virt.p2_index())].set_addr(
                PhysAddr::new(base),
                PageTableFlags::PRESENT
                    | PageTableFlags::WRITABLE
                    | PageTableFlags::HUGE_PAGE
                    | PageTableFlags::NO_CACHE,
            );
            base += PAGE_2MIB;
        }
        tlb::flush_all();
        VirtAddr::new(KERNEL_VIRTUAL_BASE + phys.as_u64())
    }

    /// Walk the hierarchy for `virt`. Both leaf sizes resolve; absent
    /// entries at any level return `None`.
    pub fn virtual_to_physical(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let pml4_index = usize::from(virt.p4_index());
        let pdp = match pml4_index {
            0 | 511 => &self.kpdp,
            1 => &self.user_pdp,
            _ => return None,
        };
        if !self.pml4[pml4_index].flags().contains(PageTableFlags::PRESENT) {
            return None;
        }

        let pdp_entry = &pdp[usize::from(virt.p3_index())];
        if !pdp_entry.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        // The hierarchy is fixed: only two directories exist.
        let directory = if pdp_entry.addr() == self.table_phys(&self.kpde) {
            &self.kpde
        } else if pdp_entry.addr() == self.table_phys(&self.user_pde) {
            &self.user_pde
        } else {
            return None;
        };

        let dir_entry = &directory[usize::from(virt.p2_index())];
        let flags = dir_entry.flags();
        if !flags.contains(PageTableFlags::PRESENT) {
            return None;
        }
        if flags.contains(PageTableFlags::HUGE_PAGE) {
            return Some(dir_entry.addr() + (virt.as_u64() & (PAGE_2MIB - 1)));
        }

        // 4 KiB path: the only page table hangs off directory entry 0.
        if dir_entry.addr() != self.table_phys(&self.kpte) {
            return None;
        }
        let pte = &self.kpte[usize::from(virt.p1_index())];
        if !pte.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        Some(pte.addr() + (virt.as_u64() & (PAGE_4KIB - 1)))
    }
}

/// Virtual address of the kernel-window page at (pdp slot, directory slot).
fn kernel_page_virt(pdp_index: usize, pde_index: usize) -> VirtAddr {
    let raw = (511u64 << 39) | ((pdp_index as u64) << 30) | ((pde_index as u64) << 21);
    VirtAddr::new(raw | 0xFFFF_0000_0000_0000)
}

/// Type-state handle for the pre-allocator mapping primitive. Only the
/// frame allocator's ingestion ever sees one.
pub struct Bootstrap<'a> {
    space: &'a mut KernelAddressSpace,
}

impl BootstrapMapper for Bootstrap<'_> {
    fn mapped_end(&self) -> VirtAddr {
        VirtAddr::new(KERNEL_VIRTUAL_BASE + self.space.mapping_end)
    }

    fn map_record_page(&mut self, virt: VirtAddr) {
        let base = virt.align_down(PAGE_2MIB);
        let phys = PhysAddr::new(base.as_u64() - KERNEL_VIRTUAL_BASE);
        self.space.kpde[usize::from(base.p2_index())].set_addr(
            phys,
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::HUGE_PAGE,
        );
        self.space.mapping_end = phys.as_u64() + PAGE_2MIB;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    fn test_layout(image_bytes: u64) -> KernelLayout {
        KernelLayout {
            kernel_end: VirtAddr::new(KERNEL_VIRTUAL_BASE + image_bytes),
        }
    }

    fn built_space(image_bytes: u64) -> Box<KernelAddressSpace> {
        let mut space = Box::new(KernelAddressSpace::new());
        space.initialize(&test_layout(image_bytes));
        space
    }

    /// Hands out a fixed sequence of frames without a real memory map.
    struct CannedFrames(u64);

    unsafe impl FrameAllocator<Size2MiB> for CannedFrames {
        fn allocate_frame(&mut self) -> Option<PhysFrame<Size2MiB>> {
            let frame = PhysFrame::from_start_address(PhysAddr::new(self.0)).ok()?;
            self.0 += PAGE_2MIB;
            Some(frame)
        }
    }

    #[test_case]
    fn identity_window_translates() {
        let space = built_space(0x18_0000);
        // Low identity window and high kernel window agree byte for byte.
        let phys = space
            .virtual_to_physical(VirtAddr::new(0x1234))
            .expect("low window mapped");
        assert_eq!(phys.as_u64(), 0x1234);
        let high = space
            .virtual_to_physical(VirtAddr::new(KERNEL_VIRTUAL_BASE + 0x1234))
            .expect("kernel window mapped");
        assert_eq!(high.as_u64(), 0x1234);
    }

    #[test_case]
    fn image_leaves_translate() {
        let space = built_space(0x18_0000);
        // A 1.5 MiB image occupies one 2 MiB leaf past the identity page.
        let phys = space
            .virtual_to_physical(VirtAddr::new(KERNEL_VIRTUAL_BASE + 0x25_0000))
            .expect("image leaf mapped");
        assert_eq!(phys.as_u64(), 0x25_0000);
        assert_eq!(space.mapping_end(), 2 * PAGE_2MIB);
    }

    #[test_case]
    fn user_window_is_unbacked() {
        let space = built_space(0x18_0000);
        // The user path is present down to the directory, but no leaf is.
        assert!(space
            .virtual_to_physical(VirtAddr::new(1u64 << 39))
            .is_none());
    }

    #[test_case]
    fn bootstrap_mapping_extends_window() {
        let mut space = built_space(0x18_0000);
        let mut bootstrap = space.bootstrap();
        let first_unmapped = bootstrap.mapped_end();
        bootstrap.map_record_page(first_unmapped);
        assert_eq!(
            bootstrap.mapped_end().as_u64(),
            first_unmapped.as_u64() + PAGE_2MIB
        );
        let phys = space
            .virtual_to_physical(first_unmapped)
            .expect("bootstrap page mapped");
        assert_eq!(phys.as_u64(), first_unmapped.as_u64() - KERNEL_VIRTUAL_BASE);
    }

    #[test_case]
    fn new_kernel_page_follows_image() {
        let mut space = built_space(0x18_0000);
        let mut frames = CannedFrames(0x80_0000);
        let page = space.new_kernel_page(&mut frames);
        // Directory leaves 0 and 1 are taken by the image, so the first
        // absent leaf is slot 2.
        assert_eq!(page.as_u64(), KERNEL_VIRTUAL_BASE + 2 * PAGE_2MIB);
        let phys = space.virtual_to_physical(page).expect("new page mapped");
        assert_eq!(phys.as_u64(), 0x80_0000);
    }

    #[test_case]
    fn framebuffer_mapping_is_idempotent() {
        let mut space = built_space(0x18_0000);
        let mut frames = super::super::frame_allocator::ListFrameAllocator::new();
        let fb = PhysAddr::new(0x3000_0000);
        let first = space.map_framebuffer(&mut frames, fb, PAGE_2MIB);
        let before = space.virtual_to_physical(first).expect("mapped");
        let second = space.map_framebuffer(&mut frames, fb, PAGE_2MIB);
        let after = space.virtual_to_physical(second).expect("still mapped");
        assert_eq!(first, second);
        assert_eq!(before, after);
        assert_eq!(before.as_u64(), fb.as_u64());
    }
}
