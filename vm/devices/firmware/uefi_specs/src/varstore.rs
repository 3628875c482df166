//! The varstore device's guest protocol.
//!
//! The device exposes a single 4 KiB MMIO BAR. The first 8 bytes are
//! registers; the rest is a command buffer the guest firmware fills with a
//! [`CommandDescriptor`] and a command-specific body before ringing the
//! doorbell. Responses (including the final [`EfiStatus64`]) are written back
//! into the same buffer before the doorbell write completes, so the guest
//! never observes a partial reply.

use crate::uefi::common::EfiStatus64;
use guid::Guid;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::LittleEndian;
use zerocopy::U64;

/// Total size of the MMIO BAR.
pub const BAR_SIZE: u64 = 0x1000;

/// Write 1 here to execute the command currently in the buffer.
pub const REG_DOORBELL: u64 = 0x0;

/// Reads as [`DEVICE_SIGNATURE`]; used by guest firmware to probe the device.
pub const REG_SIGNATURE: u64 = 0x4;

/// "VARS"
pub const DEVICE_SIGNATURE: u32 = u32::from_le_bytes(*b"VARS");

/// Offset of the command buffer within the BAR.
pub const COMMAND_BUFFER_OFFSET: u64 = 0x8;

/// Size of the command buffer.
pub const COMMAND_BUFFER_SIZE: usize = (BAR_SIZE - COMMAND_BUFFER_OFFSET) as usize;

/// Command opcodes.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct VarstoreOp(pub u32);

#[allow(missing_docs)] // self-explanatory constants
impl VarstoreOp {
    pub const GET_VARIABLE: Self = Self(1);
    pub const GET_NEXT_VARIABLE_NAME: Self = Self(2);
    pub const SET_VARIABLE: Self = Self(3);
    pub const QUERY_VARIABLE_INFO: Self = Self(4);
    pub const EXIT_BOOT_SERVICES: Self = Self(5);
}

impl core::fmt::Debug for VarstoreOp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match *self {
            Self::GET_VARIABLE => "GET_VARIABLE",
            Self::GET_NEXT_VARIABLE_NAME => "GET_NEXT_VARIABLE_NAME",
            Self::SET_VARIABLE => "SET_VARIABLE",
            Self::QUERY_VARIABLE_INFO => "QUERY_VARIABLE_INFO",
            Self::EXIT_BOOT_SERVICES => "EXIT_BOOT_SERVICES",
            Self(other) => return write!(f, "VarstoreOp({other})"),
        };
        f.write_str(name)
    }
}

/// Header at offset 0 of the command buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct CommandDescriptor {
    /// One of the [`VarstoreOp`] opcodes.
    pub opcode: VarstoreOp,
    /// Completion status, written by the device.
    pub status: EfiStatus64,
}

const_assert_eq!(size_of::<CommandDescriptor>(), 12);

/// Body for GetVariable / SetVariable / GetNextVariableName.
///
/// The variable name (UCS-2, null-terminated) immediately follows this
/// struct; variable data immediately follows the name region.
///
/// - GetVariable: `name_bytes` is the length of the name, `data_bytes` the
///   capacity of the data region on input and the (required) data length on
///   output. `attributes` is an output.
/// - SetVariable: `name_bytes` and `data_bytes` are exact lengths;
///   `attributes` is an input.
/// - GetNextVariableName: `name_bytes` is the capacity of the name region on
///   input and the (required) length of the next name on output; the region
///   holds the previous name on input (empty string to start) and the next
///   name on output. `vendor` is in/out.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct VariableCommand {
    /// Vendor GUID half of the variable identity.
    pub vendor: Guid,
    /// UEFI variable attributes.
    pub attributes: u32,
    /// Length in bytes of the name region following this struct.
    pub name_bytes: u32,
    /// Length in bytes of the data region following the name region.
    pub data_bytes: u32,
    // UINT16 Name[];
    // UINT8 Data[];
}

const_assert_eq!(size_of::<VariableCommand>(), 28);

/// Body for QueryVariableInfo.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct QueryInfoCommand {
    /// Attribute mask selecting the storage class being queried.
    pub attributes: u32,
    /// (out) Maximum size of the variable storage, in bytes.
    pub maximum_variable_storage: U64<LittleEndian>,
    /// (out) Remaining storage, in bytes.
    pub remaining_variable_storage: U64<LittleEndian>,
    /// (out) Maximum size of an individual variable (name + data), in bytes.
    pub maximum_variable_size: U64<LittleEndian>,
}

const_assert_eq!(size_of::<QueryInfoCommand>(), 28);
