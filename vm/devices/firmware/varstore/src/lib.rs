//! The varstore device: a UEFI variable service backend for a
//! hardware-virtualized guest.
//!
//! The device presents a synthetic PCI function with a single 4 KiB MMIO BAR
//! (see [`uefi_specs::varstore`] for the register and command-buffer layout).
//! Guest firmware copies a command into the buffer and rings the doorbell;
//! the write completes only after the command has been executed and the
//! response written back, so the guest never observes a partial reply.
//!
//! The engine is strictly single-threaded: hypervisor I/O request descriptors
//! are serviced one at a time to completion by [`VarstoreDevice::run`].

#![forbid(unsafe_code)]

pub mod service;

use pci_func::bar;
use pci_func::bar::AccessWidth;
use pci_func::bar::BarHandler;
use pci_func::ioreq::IoDirection;
use pci_func::ioreq::IoKind;
use pci_func::ioreq::IoRing;
use pci_func::ioreq::IoTransaction;
use pci_func::ioreq::PciPlatform;
use pci_func::ioreq::PciPlatformError;
use pci_func::BarSpace;
use pci_func::Bdf;
use pci_func::HardwareIds;
use pci_func::PciFunction;
use service::nvram::InitialVar;
use service::nvram::NvramServices;
use service::nvram::NvramSetupError;
use thiserror::Error;
use uefi_specs::varstore as protocol;
use varstore_storage::NvramStorage;

/// Static device configuration.
pub struct VarstoreConfig {
    /// Where the PCI function lives.
    pub bdf: Bdf,
    /// PCI identification registers.
    pub hardware_ids: HardwareIds,
    /// Variables injected on first boot (see [`InitialVar`]).
    pub initial_vars: Vec<InitialVar>,
}

impl Default for VarstoreConfig {
    fn default() -> Self {
        Self {
            bdf: Bdf::new(0, 2, 0).unwrap(),
            hardware_ids: HardwareIds {
                vendor_id: 0x5853,
                device_id: 0xc117,
                revision_id: 0x01,
                prog_if: 0x00,
                // base class 0x08 (system peripheral), subclass 0x80 (other)
                sub_class: 0x80,
                base_class: 0x08,
                type0_sub_vendor_id: 0x5853,
                type0_sub_system_id: 0xc117,
            },
            initial_vars: Vec::new(),
        }
    }
}

/// Errors which may occur during device construction.
#[derive(Debug, Error)]
pub enum VarstoreInitError {
    /// nvram setup failed
    #[error("nvram setup error")]
    Nvram(#[from] NvramSetupError),
    /// the BAR could not be registered
    #[error("BAR registration error")]
    Bar(#[from] pci_func::BarRegistrationError),
    /// the hypervisor rejected the device
    #[error("PCI registration error")]
    Pci(#[from] PciPlatformError),
}

/// The BAR register file: doorbell/signature registers plus the command
/// buffer the guest fills before ringing the doorbell.
struct BarRegs {
    comm: Box<[u8]>,
    doorbell: bool,
}

impl BarRegs {
    fn new() -> BarRegs {
        BarRegs {
            comm: vec![0; protocol::COMMAND_BUFFER_SIZE].into_boxed_slice(),
            doorbell: false,
        }
    }

    fn read_byte(&self, offset: u64) -> u8 {
        match offset {
            protocol::REG_DOORBELL..protocol::REG_SIGNATURE => 0,
            protocol::REG_SIGNATURE..protocol::COMMAND_BUFFER_OFFSET => {
                protocol::DEVICE_SIGNATURE.to_le_bytes()[(offset - protocol::REG_SIGNATURE) as usize]
            }
            _ => self
                .comm
                .get((offset - protocol::COMMAND_BUFFER_OFFSET) as usize)
                .copied()
                .unwrap_or(0xff),
        }
    }

    fn write_byte(&mut self, offset: u64, value: u8) {
        match offset {
            // any write touching the doorbell register fires it
            protocol::REG_DOORBELL..protocol::REG_SIGNATURE => {
                if value != 0 {
                    self.doorbell = true;
                }
            }
            protocol::REG_SIGNATURE..protocol::COMMAND_BUFFER_OFFSET => {}
            _ => {
                let idx = (offset - protocol::COMMAND_BUFFER_OFFSET) as usize;
                if let Some(byte) = self.comm.get_mut(idx) {
                    *byte = value;
                }
            }
        }
    }
}

/// The UEFI variable service device.
pub struct VarstoreDevice {
    // Transport shim
    pci: PciFunction,

    // Volatile state
    regs: BarRegs,

    // Sub-emulators
    nvram: NvramServices,
}

impl VarstoreDevice {
    /// Construct the device, loading (or initializing) the variable store.
    pub fn new(
        storage: Box<dyn NvramStorage>,
        cfg: VarstoreConfig,
    ) -> Result<VarstoreDevice, VarstoreInitError> {
        let mut pci = PciFunction::new(cfg.bdf, cfg.hardware_ids, Some(1));
        pci.register_bar(
            0,
            BarSpace::Mmio,
            protocol::BAR_SIZE.trailing_zeros(),
            bar::AccessWidths::ALL,
        )?;

        Ok(VarstoreDevice {
            pci,
            regs: BarRegs::new(),
            nvram: NvramServices::new(storage, &cfg.initial_vars)?,
        })
    }

    /// Claim the PCI function with the hypervisor.
    pub fn register(&self, platform: &mut dyn PciPlatform) -> Result<(), PciPlatformError> {
        self.pci.register(platform)
    }

    /// Release the PCI function and any mapped BAR ranges.
    pub fn unregister(&mut self, platform: &mut dyn PciPlatform) {
        self.pci.unregister(platform)
    }

    /// Access the nvram service (host-side reads, tests).
    pub fn nvram_mut(&mut self) -> &mut NvramServices {
        &mut self.nvram
    }

    /// Service one guest I/O access, returning the value for reads.
    pub fn service_transaction(
        &mut self,
        txn: IoTransaction,
        platform: &mut dyn PciPlatform,
    ) -> Option<u32> {
        match txn.kind {
            IoKind::PciConfig => self.pci.handle_config(txn, platform),
            IoKind::Mmio => {
                let Some((_bar, offset)) = self.pci.find_bar(BarSpace::Mmio, txn.addr) else {
                    // not ours; reads float high
                    return match txn.direction {
                        IoDirection::Read => Some(!0),
                        IoDirection::Write => None,
                    };
                };

                match txn.direction {
                    IoDirection::Read => Some(bar::read_with(self, offset, txn.width)),
                    IoDirection::Write => {
                        bar::write_with(self, offset, txn.width, txn.data);
                        self.process_doorbell();
                        None
                    }
                }
            }
            IoKind::Pio => {
                // this device claims no port IO
                match txn.direction {
                    IoDirection::Read => Some(!0),
                    IoDirection::Write => None,
                }
            }
        }
    }

    /// Run the device against the hypervisor's I/O request ring. One request
    /// is handled to completion (response written, event channel notified)
    /// before the next is consumed. Returns when the ring is drained.
    pub fn run(&mut self, ring: &mut dyn IoRing, platform: &mut dyn PciPlatform) {
        while let Some(txn) = ring.next_request() {
            let value = self.service_transaction(txn, platform);
            ring.complete(value);
            ring.notify();
        }
    }

    fn process_doorbell(&mut self) {
        if !self.regs.doorbell {
            return;
        }
        self.regs.doorbell = false;
        self.nvram.handle_command(&mut self.regs.comm);
    }
}

impl BarHandler for VarstoreDevice {
    fn bar_read(&mut self, offset: u64, width: AccessWidth) -> u32 {
        let mut val: u32 = 0;
        for i in 0..width.bytes() {
            val |= (self.regs.read_byte(offset + i) as u32) << (i * 8);
        }
        val
    }

    fn bar_write(&mut self, offset: u64, width: AccessWidth, value: u32) {
        for i in 0..width.bytes() {
            self.regs.write_byte(offset + i, (value >> (i * 8)) as u8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guid::Guid;
    use pci_func::cfg_space::offset;
    use pci_func::cfg_space::Command;
    use crate::service::nvram::VariableServicesExt;
    use ucs2::Ucs2LeVec;
    use uefi_specs::uefi::common::EfiStatus;
    use uefi_specs::uefi::nvram::EfiVariableAttributes;
    use uefi_specs::varstore::CommandDescriptor;
    use uefi_specs::varstore::VariableCommand;
    use uefi_specs::varstore::VarstoreOp;
    use varstore_storage::in_memory::InMemoryNvram;
    use zerocopy::FromBytes;
    use zerocopy::IntoBytes;

    const BAR_BASE: u64 = 0xf000_0000;

    #[derive(Default)]
    struct NullPlatform;

    impl PciPlatform for NullPlatform {
        fn register_device(&mut self, _: u8, _: u8, _: u8) -> Result<(), PciPlatformError> {
            Ok(())
        }
        fn unregister_device(&mut self, _: u8, _: u8, _: u8) {}
        fn map_io_range(&mut self, _: bool, _: u64, _: u64) {}
        fn unmap_io_range(&mut self, _: bool, _: u64, _: u64) {}
    }

    fn mmio(addr: u64, direction: IoDirection, data: u32) -> IoTransaction {
        IoTransaction {
            kind: IoKind::Mmio,
            addr,
            width: AccessWidth::Dword,
            direction,
            data,
        }
    }

    /// Bring up a device with its BAR mapped at `BAR_BASE`.
    fn mapped_device() -> (VarstoreDevice, NullPlatform) {
        let mut platform = NullPlatform;
        let mut dev =
            VarstoreDevice::new(Box::new(InMemoryNvram::new()), VarstoreConfig::default())
                .unwrap();

        let bdf_bits = (dev.pci.bdf().encode() as u64) << 32;
        let cfg_write = |dev: &mut VarstoreDevice, platform: &mut NullPlatform, off, data| {
            dev.service_transaction(
                IoTransaction {
                    kind: IoKind::PciConfig,
                    addr: bdf_bits | off,
                    width: AccessWidth::Dword,
                    direction: IoDirection::Write,
                    data,
                },
                platform,
            );
        };

        cfg_write(&mut dev, &mut platform, offset::BAR0 as u64, BAR_BASE as u32);
        cfg_write(
            &mut dev,
            &mut platform,
            offset::COMMAND as u64,
            Command::new().with_mmio_enabled(true).into_bits() as u32,
        );

        (dev, platform)
    }

    fn write_buf(dev: &mut VarstoreDevice, platform: &mut NullPlatform, buf: &[u8]) {
        let base = BAR_BASE + protocol::COMMAND_BUFFER_OFFSET;
        for (i, chunk) in buf.chunks(4).enumerate() {
            let mut bytes = [0u8; 4];
            bytes[..chunk.len()].copy_from_slice(chunk);
            dev.service_transaction(
                mmio(base + (i * 4) as u64, IoDirection::Write, u32::from_le_bytes(bytes)),
                platform,
            );
        }
    }

    fn read_buf(dev: &mut VarstoreDevice, platform: &mut NullPlatform, len: usize) -> Vec<u8> {
        let base = BAR_BASE + protocol::COMMAND_BUFFER_OFFSET;
        let mut out = Vec::with_capacity(len);
        for i in (0..len).step_by(4) {
            let val = dev
                .service_transaction(mmio(base + i as u64, IoDirection::Read, 0), platform)
                .unwrap();
            out.extend_from_slice(&val.to_le_bytes());
        }
        out.truncate(len);
        out
    }

    #[test]
    fn signature_register() {
        let (mut dev, mut platform) = mapped_device();
        let val = dev
            .service_transaction(
                mmio(BAR_BASE + protocol::REG_SIGNATURE, IoDirection::Read, 0),
                &mut platform,
            )
            .unwrap();
        assert_eq!(val, protocol::DEVICE_SIGNATURE);
    }

    #[test]
    fn unmapped_mmio_floats_high() {
        let mut platform = NullPlatform;
        let mut dev =
            VarstoreDevice::new(Box::new(InMemoryNvram::new()), VarstoreConfig::default())
                .unwrap();

        // BAR not programmed yet
        let val = dev.service_transaction(mmio(BAR_BASE, IoDirection::Read, 0), &mut platform);
        assert_eq!(val, Some(!0));
    }

    #[test]
    fn doorbell_executes_command() {
        let (mut dev, mut platform) = mapped_device();

        let vendor = Guid::new_random();
        let name = Ucs2LeVec::from("ViaMmio");
        let mut buf = Vec::new();
        buf.extend_from_slice(
            CommandDescriptor {
                opcode: VarstoreOp::SET_VARIABLE,
                status: EfiStatus::SUCCESS.into(),
            }
            .as_bytes(),
        );
        buf.extend_from_slice(
            VariableCommand {
                vendor,
                attributes: EfiVariableAttributes::DEFAULT_ATTRIBUTES.into(),
                name_bytes: name.as_bytes().len() as u32,
                data_bytes: 4,
            }
            .as_bytes(),
        );
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b"mmio");

        write_buf(&mut dev, &mut platform, &buf);

        // ring the doorbell
        dev.service_transaction(
            mmio(BAR_BASE + protocol::REG_DOORBELL, IoDirection::Write, 1),
            &mut platform,
        );

        // status was written back into the buffer
        let resp = read_buf(&mut dev, &mut platform, size_of::<CommandDescriptor>());
        let (desc, _) = CommandDescriptor::read_from_prefix(&resp[..]).unwrap();
        assert_eq!(EfiStatus::from(desc.status), EfiStatus::SUCCESS);

        // and the variable is visible through the service API
        let (_, data) = dev
            .nvram_mut()
            .services_mut()
            .get_variable(vendor, "ViaMmio")
            .unwrap();
        assert_eq!(data, b"mmio");
    }

    #[test]
    fn ring_driven_run_loop() {
        struct ScriptedRing {
            requests: Vec<IoTransaction>,
            completions: Vec<Option<u32>>,
            notifies: usize,
        }

        impl IoRing for ScriptedRing {
            fn next_request(&mut self) -> Option<IoTransaction> {
                if self.requests.is_empty() {
                    None
                } else {
                    Some(self.requests.remove(0))
                }
            }
            fn complete(&mut self, read_value: Option<u32>) {
                self.completions.push(read_value);
            }
            fn notify(&mut self) {
                self.notifies += 1;
            }
        }

        let (mut dev, mut platform) = mapped_device();
        let mut ring = ScriptedRing {
            requests: vec![
                mmio(BAR_BASE + protocol::REG_SIGNATURE, IoDirection::Read, 0),
                mmio(BAR_BASE + protocol::REG_DOORBELL, IoDirection::Write, 1),
            ],
            completions: Vec::new(),
            notifies: 0,
        };

        dev.run(&mut ring, &mut platform);

        assert_eq!(
            ring.completions,
            vec![Some(protocol::DEVICE_SIGNATURE), None]
        );
        assert_eq!(ring.notifies, 2);
    }
}
