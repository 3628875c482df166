//! A synthetic PCI function for hypervisor device models.
//!
//! Emulates the configuration space of a single Type 0 PCI function and
//! routes guest I/O request descriptors to per-BAR handlers. Guest-writable
//! configuration bits are governed by a per-byte mask, so only the command
//! register, BAR addresses, cache line size, and interrupt line ever mutate.
//! BAR reprogramming keeps the hypervisor's I/O routing in sync through the
//! [`ioreq::PciPlatform`] capability.
//!
//! The function knows nothing about what its BARs contain; owners implement
//! [`bar::BarHandler`] and dispatch through [`PciFunction::find_bar`].

#![forbid(unsafe_code)]

pub mod bar;
pub mod cfg_space;
pub mod ioreq;

use bar::AccessWidth;
use bar::AccessWidths;
use cfg_space::offset;
use cfg_space::Command;
use cfg_space::BAR_IO_ADDR_MASK;
use cfg_space::BAR_MEM_ADDR_MASK;
use cfg_space::BAR_SPACE_IO;
use cfg_space::CONFIG_SPACE_SIZE;
use ioreq::IoDirection;
use ioreq::IoKind;
use ioreq::IoTransaction;
use ioreq::PciPlatform;
use ioreq::PciPlatformError;
use thiserror::Error;

/// A PCI bus/device/function address.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Bdf {
    /// Bus (0..=255)
    pub bus: u8,
    /// Device (0..=31)
    pub device: u8,
    /// Function (0..=7)
    pub function: u8,
}

impl Bdf {
    /// Create a new [`Bdf`], checking the device/function ranges.
    pub fn new(bus: u8, device: u8, function: u8) -> Option<Bdf> {
        if device & !0x1f != 0 || function & !0x07 != 0 {
            return None;
        }
        Some(Bdf {
            bus,
            device,
            function,
        })
    }

    /// The 16-bit bus/device/function encoding used by config cycles.
    pub fn encode(&self) -> u16 {
        (self.bus as u16) << 8 | (self.device as u16) << 3 | self.function as u16
    }
}

impl std::fmt::Display for Bdf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// Static PCI identification registers.
#[derive(Debug, Copy, Clone)]
#[allow(missing_docs)] // names match the config space registers
pub struct HardwareIds {
    pub vendor_id: u16,
    pub device_id: u16,
    pub revision_id: u8,
    pub prog_if: u8,
    pub sub_class: u8,
    pub base_class: u8,
    pub type0_sub_vendor_id: u16,
    pub type0_sub_system_id: u16,
}

/// Which address space a BAR claims.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BarSpace {
    /// Memory-mapped IO
    Mmio,
    /// Port IO
    Pio,
}

impl BarSpace {
    fn is_mmio(self) -> bool {
        matches!(self, BarSpace::Mmio)
    }

    fn addr_mask(self) -> u32 {
        match self {
            BarSpace::Mmio => BAR_MEM_ADDR_MASK,
            BarSpace::Pio => BAR_IO_ADDR_MASK,
        }
    }
}

/// Errors from [`PciFunction::register_bar`].
#[derive(Debug, Error)]
pub enum BarRegistrationError {
    /// BAR index out of range
    #[error("BAR index {0} out of range")]
    BadIndex(usize),
    /// BAR already registered
    #[error("BAR {0} already registered")]
    AlreadyRegistered(usize),
    /// handlers must support byte accesses so any access can be synthesized
    #[error("BAR handler must support byte accesses")]
    MissingByteWidth,
}

#[derive(Debug)]
struct BarSlot {
    space: BarSpace,
    size: u32,
    base: Option<u32>,
}

/// A synthetic Type 0 PCI function.
pub struct PciFunction {
    bdf: Bdf,
    config: [u8; CONFIG_SPACE_SIZE],
    mask: [u8; CONFIG_SPACE_SIZE],
    bars: [Option<BarSlot>; 6],
}

impl PciFunction {
    /// Create a function at `bdf` with the given identification registers.
    ///
    /// `interrupt_pin` is the INT#x pin number (1 = INTA#) if the device
    /// signals legacy interrupts.
    pub fn new(bdf: Bdf, ids: HardwareIds, interrupt_pin: Option<u8>) -> PciFunction {
        let mut config = [0; CONFIG_SPACE_SIZE];
        let mut mask = [0; CONFIG_SPACE_SIZE];

        config[offset::VENDOR_ID..][..2].copy_from_slice(&ids.vendor_id.to_le_bytes());
        config[offset::DEVICE_ID..][..2].copy_from_slice(&ids.device_id.to_le_bytes());
        config[offset::REVISION_ID] = ids.revision_id;
        config[offset::PROG_IF] = ids.prog_if;
        config[offset::SUB_CLASS] = ids.sub_class;
        config[offset::BASE_CLASS] = ids.base_class;
        config[offset::HEADER_TYPE] = 0; // Type 0, single function
        config[offset::SUBSYSTEM_VENDOR_ID..][..2]
            .copy_from_slice(&ids.type0_sub_vendor_id.to_le_bytes());
        config[offset::SUBSYSTEM_ID..][..2]
            .copy_from_slice(&ids.type0_sub_system_id.to_le_bytes());
        config[offset::INTERRUPT_PIN] = interrupt_pin.unwrap_or(0);

        mask[offset::COMMAND..][..2].copy_from_slice(&Command::WRITABLE_BITS.to_le_bytes());
        mask[offset::CACHE_LINE_SIZE] = 0xff;
        mask[offset::INTERRUPT_LINE] = 0xff;

        PciFunction {
            bdf,
            config,
            mask,
            bars: Default::default(),
        }
    }

    /// The function's bus/device/function address.
    pub fn bdf(&self) -> Bdf {
        self.bdf
    }

    /// Claim config cycles for this function with the hypervisor.
    pub fn register(&self, platform: &mut dyn PciPlatform) -> Result<(), PciPlatformError> {
        tracing::debug!(bdf = %self.bdf, "registering PCI function");
        platform.register_device(self.bdf.bus, self.bdf.device, self.bdf.function)
    }

    /// Release this function and any mapped BAR ranges.
    pub fn unregister(&mut self, platform: &mut dyn PciPlatform) {
        tracing::debug!(bdf = %self.bdf, "deregistering PCI function");
        for slot in self.bars.iter_mut().flatten() {
            if let Some(base) = slot.base.take() {
                platform.unmap_io_range(
                    slot.space.is_mmio(),
                    base as u64,
                    base as u64 + (slot.size - 1) as u64,
                );
            }
        }
        platform.unregister_device(self.bdf.bus, self.bdf.device, self.bdf.function);
    }

    /// Register a BAR of `2^size_order` bytes.
    ///
    /// `widths` declares the access widths the BAR's handler services
    /// natively; it must include byte access so any guest access can be
    /// synthesized.
    pub fn register_bar(
        &mut self,
        index: usize,
        space: BarSpace,
        size_order: u32,
        widths: AccessWidths,
    ) -> Result<(), BarRegistrationError> {
        if index >= self.bars.len() {
            return Err(BarRegistrationError::BadIndex(index));
        }
        if self.bars[index].is_some() {
            return Err(BarRegistrationError::AlreadyRegistered(index));
        }
        if !widths.byte() {
            return Err(BarRegistrationError::MissingByteWidth);
        }

        let size = 1u32 << size_order;
        let bar_offset = offset::BAR0 + index * 4;

        // encoding bits are fixed in the config space; only address bits are
        // guest-writable
        let encoding: u32 = match space {
            BarSpace::Mmio => 0,
            BarSpace::Pio => BAR_SPACE_IO,
        };
        self.config[bar_offset..][..4].copy_from_slice(&encoding.to_le_bytes());
        self.mask[bar_offset..][..4].copy_from_slice(&(!(size - 1)).to_le_bytes());

        self.bars[index] = Some(BarSlot {
            space,
            size,
            base: None,
        });
        Ok(())
    }

    /// Read `width` bytes of config space at `offset`. Unimplemented bytes
    /// read as 0xFF.
    pub fn config_read(&self, offset: u64, width: AccessWidth) -> u32 {
        let mut val: u32 = 0;
        for i in 0..width.bytes() {
            let byte = match usize::try_from(offset + i) {
                Ok(idx) if idx < CONFIG_SPACE_SIZE => self.config[idx],
                _ => 0xff,
            };
            val |= (byte as u32) << (i * 8);
        }
        val
    }

    /// Write the low `width` bytes of `value` to config space at `offset`,
    /// honoring the writable-bits mask, then re-sync BAR mappings.
    pub fn config_write(
        &mut self,
        offset: u64,
        width: AccessWidth,
        value: u32,
        platform: &mut dyn PciPlatform,
    ) {
        for i in 0..width.bytes() {
            let Ok(idx) = usize::try_from(offset + i) else {
                continue;
            };
            if idx >= CONFIG_SPACE_SIZE {
                continue;
            }
            let mask = self.mask[idx];
            let byte = (value >> (i * 8)) as u8;
            self.config[idx] = (self.config[idx] & !mask) | (byte & mask);
        }

        self.update_bar_mappings(platform);
    }

    fn command(&self) -> Command {
        Command::from_bits(u16::from_le_bytes(
            self.config[offset::COMMAND..][..2].try_into().unwrap(),
        ))
    }

    /// Bring hypervisor I/O routing in line with the programmed BARs.
    fn update_bar_mappings(&mut self, platform: &mut dyn PciPlatform) {
        let command = self.command();

        for (index, slot) in self.bars.iter_mut().enumerate() {
            let Some(slot) = slot else { continue };

            let bar_offset = offset::BAR0 + index * 4;
            let programmed = u32::from_le_bytes(self.config[bar_offset..][..4].try_into().unwrap())
                & slot.space.addr_mask();

            let space_enabled = match slot.space {
                BarSpace::Mmio => command.mmio_enabled(),
                BarSpace::Pio => command.pio_enabled(),
            };

            // an all-ones address is a sizing probe, not a mapping
            let addr_mask = !(slot.size - 1);
            let target = (space_enabled && programmed != 0 && programmed != addr_mask)
                .then_some(programmed);

            if slot.base == target {
                continue;
            }

            if let Some(base) = slot.base.take() {
                tracing::debug!(index, base = format_args!("{base:#x}"), "unmapping BAR");
                platform.unmap_io_range(
                    slot.space.is_mmio(),
                    base as u64,
                    base as u64 + (slot.size - 1) as u64,
                );
            }

            if let Some(base) = target {
                tracing::debug!(index, base = format_args!("{base:#x}"), "mapping BAR");
                platform.map_io_range(
                    slot.space.is_mmio(),
                    base as u64,
                    base as u64 + (slot.size - 1) as u64,
                );
                slot.base = Some(base);
            }
        }
    }

    /// Resolve a guest address to a mapped BAR, returning the BAR index and
    /// the offset within the BAR.
    pub fn find_bar(&self, space: BarSpace, addr: u64) -> Option<(usize, u64)> {
        for (index, slot) in self.bars.iter().enumerate() {
            let Some(slot) = slot else { continue };
            if slot.space != space {
                continue;
            }
            let Some(base) = slot.base else { continue };
            let base = base as u64;
            if (base..base + slot.size as u64).contains(&addr) {
                return Some((index, addr - base));
            }
        }
        None
    }

    /// Service a config-space transaction, returning the read value for
    /// reads. Transactions for other functions are ignored (reads float to
    /// all-ones).
    pub fn handle_config(
        &mut self,
        txn: IoTransaction,
        platform: &mut dyn PciPlatform,
    ) -> Option<u32> {
        debug_assert_eq!(txn.kind, IoKind::PciConfig);

        let sbdf = (txn.addr >> 32) as u32;
        if sbdf != self.bdf.encode() as u32 {
            return match txn.direction {
                IoDirection::Read => Some(!0),
                IoDirection::Write => None,
            };
        }

        let offset = txn.addr & 0xff;
        match txn.direction {
            IoDirection::Read => Some(self.config_read(offset, txn.width)),
            IoDirection::Write => {
                self.config_write(offset, txn.width, txn.data, platform);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MockPlatform {
        mapped: Vec<(bool, u64, u64)>,
        events: Vec<String>,
    }

    impl PciPlatform for MockPlatform {
        fn register_device(
            &mut self,
            bus: u8,
            device: u8,
            function: u8,
        ) -> Result<(), PciPlatformError> {
            self.events.push(format!("register {bus}:{device}.{function}"));
            Ok(())
        }

        fn unregister_device(&mut self, bus: u8, device: u8, function: u8) {
            self.events.push(format!("unregister {bus}:{device}.{function}"));
        }

        fn map_io_range(&mut self, is_mmio: bool, lo: u64, hi: u64) {
            self.mapped.push((is_mmio, lo, hi));
            self.events.push(format!("map {lo:#x}..={hi:#x}"));
        }

        fn unmap_io_range(&mut self, is_mmio: bool, lo: u64, hi: u64) {
            self.mapped.retain(|r| *r != (is_mmio, lo, hi));
            self.events.push(format!("unmap {lo:#x}..={hi:#x}"));
        }
    }

    fn test_function() -> PciFunction {
        let mut func = PciFunction::new(
            Bdf::new(0, 2, 0).unwrap(),
            HardwareIds {
                vendor_id: 0x5853,
                device_id: 0xc117,
                revision_id: 1,
                prog_if: 0,
                sub_class: 0x80,
                base_class: 0x08,
                type0_sub_vendor_id: 0x5853,
                type0_sub_system_id: 0xc117,
            },
            Some(1),
        );
        func.register_bar(0, BarSpace::Mmio, 12, AccessWidths::ALL)
            .unwrap();
        func
    }

    #[test]
    fn id_registers() {
        let func = test_function();
        assert_eq!(
            func.config_read(offset::VENDOR_ID as u64, AccessWidth::Dword),
            0xc117_5853
        );
        assert_eq!(
            func.config_read(offset::REVISION_ID as u64, AccessWidth::Dword),
            0x0880_0001
        );
        assert_eq!(
            func.config_read(offset::INTERRUPT_PIN as u64, AccessWidth::Byte),
            1
        );
    }

    #[test]
    fn read_only_bits_hold() {
        let mut func = test_function();
        let mut platform = MockPlatform::default();

        func.config_write(
            offset::VENDOR_ID as u64,
            AccessWidth::Dword,
            0xdead_beef,
            &mut platform,
        );
        assert_eq!(
            func.config_read(offset::VENDOR_ID as u64, AccessWidth::Dword),
            0xc117_5853
        );

        // only the supported command bits stick
        func.config_write(
            offset::COMMAND as u64,
            AccessWidth::Word,
            0xffff,
            &mut platform,
        );
        let cmd = func.config_read(offset::COMMAND as u64, AccessWidth::Word);
        assert_eq!(cmd as u16, Command::WRITABLE_BITS);

        // cache line size and interrupt line are scratch space
        func.config_write(
            offset::CACHE_LINE_SIZE as u64,
            AccessWidth::Byte,
            0x40,
            &mut platform,
        );
        func.config_write(
            offset::INTERRUPT_LINE as u64,
            AccessWidth::Byte,
            0x0b,
            &mut platform,
        );
        assert_eq!(
            func.config_read(offset::CACHE_LINE_SIZE as u64, AccessWidth::Byte),
            0x40
        );
        assert_eq!(
            func.config_read(offset::INTERRUPT_LINE as u64, AccessWidth::Byte),
            0x0b
        );
    }

    #[test]
    fn unimplemented_offsets_float_high() {
        let func = test_function();
        assert_eq!(func.config_read(0x100, AccessWidth::Dword), 0xffff_ffff);
        // a dword read straddling the end of config space pads with 0xff
        let val = func.config_read(0xfe, AccessWidth::Dword);
        assert_eq!(val & 0xffff_0000, 0xffff_0000);
    }

    #[test]
    fn bar_sizing_probe() {
        let mut func = test_function();
        let mut platform = MockPlatform::default();

        func.config_write(
            offset::BAR0 as u64,
            AccessWidth::Dword,
            0xffff_ffff,
            &mut platform,
        );
        // 4 KiB BAR: address mask 0xfffff000, memory space encoding in low bits
        assert_eq!(
            func.config_read(offset::BAR0 as u64, AccessWidth::Dword),
            0xffff_f000
        );
        // a sizing probe never maps anything
        assert!(platform.mapped.is_empty());
    }

    #[test]
    fn bar_map_unmap() {
        let mut func = test_function();
        let mut platform = MockPlatform::default();

        // program an address while MMIO decoding is off: no mapping yet
        func.config_write(
            offset::BAR0 as u64,
            AccessWidth::Dword,
            0xf000_0000,
            &mut platform,
        );
        assert!(platform.mapped.is_empty());
        assert!(func.find_bar(BarSpace::Mmio, 0xf000_0000).is_none());

        // enable MMIO decoding: the BAR maps
        func.config_write(
            offset::COMMAND as u64,
            AccessWidth::Word,
            Command::new().with_mmio_enabled(true).into_bits() as u32,
            &mut platform,
        );
        assert_eq!(platform.mapped, vec![(true, 0xf000_0000, 0xf000_0fff)]);
        assert_eq!(
            func.find_bar(BarSpace::Mmio, 0xf000_0800),
            Some((0, 0x800))
        );
        assert!(func.find_bar(BarSpace::Mmio, 0xf000_1000).is_none());

        // moving the BAR remaps it
        func.config_write(
            offset::BAR0 as u64,
            AccessWidth::Dword,
            0xe000_0000,
            &mut platform,
        );
        assert_eq!(platform.mapped, vec![(true, 0xe000_0000, 0xe000_0fff)]);

        // disabling decoding unmaps
        func.config_write(offset::COMMAND as u64, AccessWidth::Word, 0, &mut platform);
        assert!(platform.mapped.is_empty());
    }

    #[test]
    fn config_transactions_route_by_bdf() {
        let mut func = test_function();
        let mut platform = MockPlatform::default();
        let bdf_bits = (func.bdf().encode() as u64) << 32;

        let val = func.handle_config(
            IoTransaction {
                kind: IoKind::PciConfig,
                addr: bdf_bits | offset::VENDOR_ID as u64,
                width: AccessWidth::Word,
                direction: IoDirection::Read,
                data: 0,
            },
            &mut platform,
        );
        assert_eq!(val, Some(0x5853));

        // some other device's config cycle floats high
        let val = func.handle_config(
            IoTransaction {
                kind: IoKind::PciConfig,
                addr: (0x0008u64 << 32) | offset::VENDOR_ID as u64,
                width: AccessWidth::Word,
                direction: IoDirection::Read,
                data: 0,
            },
            &mut platform,
        );
        assert_eq!(val, Some(!0));
    }
}
