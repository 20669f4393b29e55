#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(osmium::testing::test_runner)]
#![reexport_test_harness_main = "test_main"]

use arrayvec::ArrayVec;
use limine::memory_map::EntryType;
use limine::request::{MemoryMapRequest, RequestsEndMarker, RequestsStartMarker};
use limine::BaseRevision;
use x86_64::VirtAddr;

extern crate alloc;
use alloc::boxed::Box;
use alloc::vec::Vec;

use osmium::constants::memory::MAX_MEMORY_REGIONS;
use osmium::memory::{self, KernelLayout, MemoryRegion, RegionKind};
use osmium::{idle_loop, logging, serial_println};

#[used]
#[link_section = ".requests"]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[link_section = ".requests"]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[link_section = ".requests_start_marker"]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

#[used]
#[link_section = ".requests_end_marker"]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

extern "C" {
    static _kernel_end: u64;
}

#[no_mangle]
extern "C" fn kmain() -> ! {
    assert!(BASE_REVISION.is_supported());

    logging::init();
    serial_println!("Booting...");

    let response = MEMORY_MAP_REQUEST
        .get_response()
        .expect("Memory map request failed");
    let mut regions: ArrayVec<MemoryRegion, MAX_MEMORY_REGIONS> = ArrayVec::new();
    for entry in response.entries().iter() {
        let kind = if entry.entry_type == EntryType::USABLE {
            RegionKind::Usable
        } else {
            RegionKind::Reserved
        };
        regions
            .try_push(MemoryRegion {
                base: entry.base,
                length: entry.length,
                kind,
            })
            .expect("memory map exceeds MAX_MEMORY_REGIONS");
    }

    let kernel_end = VirtAddr::new(unsafe { core::ptr::addr_of!(_kernel_end) } as u64);
    memory::init(&regions, KernelLayout { kernel_end });

    #[cfg(test)]
    test_main();

    // Exercise the heap the way the rest of the kernel will.
    let value = Box::new(10u64);
    serial_println!("Heap object allocated at: {:p}", Box::as_ref(&value));
    let mut numbers = Vec::new();
    for i in 0..16u64 {
        numbers.push(i);
    }
    serial_println!("Vec of {} numbers at: {:p}", numbers.len(), numbers.as_ptr());

    let raw = memory::heap::allocate(24);
    serial_println!("Raw 24-byte allocation at: {:#x}", raw as u64);
    memory::heap::release(raw);

    memory::log_memory_report();

    serial_println!("Boot complete, entering idle loop");
    idle_loop();
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("Kernel panic: {}", info);
    idle_loop();
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    osmium::testing::test_panic_handler(info)
}
