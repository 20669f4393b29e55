//! I/O port assignments.

/// First serial port (COM1), used for all kernel logging.
pub const SERIAL_PORT: u16 = 0x3F8;

/// QEMU `isa-debug-exit` device, used by the test harness.
pub const QEMU_EXIT_PORT: u16 = 0xF4;
