#![no_std]
#![cfg_attr(test, no_main)]
#![feature(custom_test_frameworks)]
#![test_runner(crate::testing::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use x86_64::instructions::hlt;

pub mod constants;
pub mod devices;
pub mod logging;
pub mod memory;
pub mod testing;

pub use devices::serial;

pub mod prelude {
    pub use crate::debug_print;
    pub use crate::debug_println;
    pub use crate::serial_print;
    pub use crate::serial_println;
}

#[macro_export]
macro_rules! debug_print {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        $crate::serial_print!($($arg)*);
    }
}

#[macro_export]
macro_rules! debug_println {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        $crate::serial_println!($($arg)*);
    }
}

pub fn idle_loop() -> ! {
    loop {
        hlt();
    }
}

// Boot scaffolding for `cargo test` images of the library itself: the
// allocators have to be live before the test list runs.

#[cfg(test)]
#[used]
#[link_section = ".requests"]
static BASE_REVISION: limine::BaseRevision = limine::BaseRevision::new();

#[cfg(test)]
#[used]
#[link_section = ".requests"]
static MEMORY_MAP_REQUEST: limine::request::MemoryMapRequest =
    limine::request::MemoryMapRequest::new();

#[cfg(test)]
#[used]
#[link_section = ".requests_start_marker"]
static _START_MARKER: limine::request::RequestsStartMarker =
    limine::request::RequestsStartMarker::new();

#[cfg(test)]
#[used]
#[link_section = ".requests_end_marker"]
static _END_MARKER: limine::request::RequestsEndMarker =
    limine::request::RequestsEndMarker::new();

#[cfg(test)]
extern "C" {
    static _kernel_end: u64;
}

#[cfg(test)]
#[no_mangle]
extern "C" fn kmain() -> ! {
    use arrayvec::ArrayVec;
    use limine::memory_map::EntryType;
    use x86_64::VirtAddr;

    use crate::constants::memory::MAX_MEMORY_REGIONS;
    use crate::memory::{KernelLayout, MemoryRegion, RegionKind};

    assert!(BASE_REVISION.is_supported());
    logging::init();

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

    test_main();
    idle_loop();
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    testing::test_panic_handler(info)
}
