//! PCI configuration space registers (conventional Type 0 header layout).

use bitfield_struct::bitfield;

/// Size of the synthetic configuration space.
pub const CONFIG_SPACE_SIZE: usize = 256;

/// Size of the Type 0 configuration header.
pub const CONFIG_HEADER_SIZE: usize = 0x40;

/// Byte offsets of Type 0 header registers.
#[allow(missing_docs)] // names match the PCI spec
pub mod offset {
    pub const VENDOR_ID: usize = 0x00;
    pub const DEVICE_ID: usize = 0x02;
    pub const COMMAND: usize = 0x04;
    pub const STATUS: usize = 0x06;
    pub const REVISION_ID: usize = 0x08;
    pub const PROG_IF: usize = 0x09;
    pub const SUB_CLASS: usize = 0x0a;
    pub const BASE_CLASS: usize = 0x0b;
    pub const CACHE_LINE_SIZE: usize = 0x0c;
    pub const LATENCY_TIMER: usize = 0x0d;
    pub const HEADER_TYPE: usize = 0x0e;
    pub const BIST: usize = 0x0f;
    pub const BAR0: usize = 0x10;
    pub const BAR5: usize = 0x24;
    pub const SUBSYSTEM_VENDOR_ID: usize = 0x2c;
    pub const SUBSYSTEM_ID: usize = 0x2e;
    pub const INTERRUPT_LINE: usize = 0x3c;
    pub const INTERRUPT_PIN: usize = 0x3d;
}

/// The COMMAND register.
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct Command {
    /// Respond to port IO accesses
    pub pio_enabled: bool,
    /// Respond to MMIO accesses
    pub mmio_enabled: bool,
    /// Can act as a bus master
    pub bus_master: bool,
    /// Monitor special cycle operations
    pub special_cycles: bool,
    /// Can generate the memory write and invalidate command
    pub memory_write_invalidate: bool,
    /// VGA palette snooping
    pub vga_palette_snoop: bool,
    /// Respond to parity errors
    pub parity_error_response: bool,
    _reserved: bool,
    /// SERR# driver enabled
    pub enable_serr: bool,
    /// Fast back-to-back transactions allowed
    pub enable_fast_b2b: bool,
    /// Legacy INT#x interrupts disabled
    pub intx_disable: bool,
    #[bits(5)]
    _reserved2: u8,
}

impl Command {
    /// The command bits a guest is allowed to flip.
    pub const WRITABLE_BITS: u16 = Command::new()
        .with_pio_enabled(true)
        .with_mmio_enabled(true)
        .with_bus_master(true)
        .with_intx_disable(true)
        .into_bits();
}

/// Address bits of a memory BAR (low 4 bits carry the encoding).
pub const BAR_MEM_ADDR_MASK: u32 = !0xf;

/// Address bits of an IO BAR (low 2 bits carry the encoding).
pub const BAR_IO_ADDR_MASK: u32 = !0x3;

/// BAR bit 0: this BAR claims IO space rather than memory space.
pub const BAR_SPACE_IO: u32 = 0x1;
