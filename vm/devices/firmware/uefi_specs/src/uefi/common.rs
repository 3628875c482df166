//! Common UEFI spec types.

use core::fmt::Debug;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::LittleEndian;
use zerocopy::U64;

/// UEFI spec Appendix D - Status Codes
///
/// EFI_STATUS is encoded as a `UINTN` in UEFI, so it is either 32 or 64 bits
/// wide (with the error bit always being the high bit). This type is 64 bits
/// wide so it does not lose any (invalid) high bits when handed a
/// guest-provided 64-bit value.
///
/// This type is not intended for direct sharing with the guest (it is not
/// `IntoBytes`). Use [`EfiStatus64`] when writing a status into shared memory.
#[derive(Copy, Clone, PartialEq, Eq)]
#[must_use]
pub struct EfiStatus(pub u64);

#[allow(missing_docs)] // self-explanatory constants
impl EfiStatus {
    pub const ERROR_BIT: u64 = 1 << 63;

    pub const SUCCESS: Self = Self(0);
    pub const LOAD_ERROR: Self = Self(1 | Self::ERROR_BIT);
    pub const INVALID_PARAMETER: Self = Self(2 | Self::ERROR_BIT);
    pub const UNSUPPORTED: Self = Self(3 | Self::ERROR_BIT);
    pub const BAD_BUFFER_SIZE: Self = Self(4 | Self::ERROR_BIT);
    pub const BUFFER_TOO_SMALL: Self = Self(5 | Self::ERROR_BIT);
    pub const NOT_READY: Self = Self(6 | Self::ERROR_BIT);
    pub const DEVICE_ERROR: Self = Self(7 | Self::ERROR_BIT);
    pub const WRITE_PROTECTED: Self = Self(8 | Self::ERROR_BIT);
    pub const OUT_OF_RESOURCES: Self = Self(9 | Self::ERROR_BIT);
    pub const NOT_FOUND: Self = Self(14 | Self::ERROR_BIT);
    pub const ACCESS_DENIED: Self = Self(15 | Self::ERROR_BIT);
    pub const SECURITY_VIOLATION: Self = Self(26 | Self::ERROR_BIT);
}

impl Default for EfiStatus {
    fn default() -> Self {
        Self::SUCCESS
    }
}

impl Debug for EfiStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match *self {
            Self::SUCCESS => "SUCCESS",
            Self::LOAD_ERROR => "LOAD_ERROR",
            Self::INVALID_PARAMETER => "INVALID_PARAMETER",
            Self::UNSUPPORTED => "UNSUPPORTED",
            Self::BAD_BUFFER_SIZE => "BAD_BUFFER_SIZE",
            Self::BUFFER_TOO_SMALL => "BUFFER_TOO_SMALL",
            Self::NOT_READY => "NOT_READY",
            Self::DEVICE_ERROR => "DEVICE_ERROR",
            Self::WRITE_PROTECTED => "WRITE_PROTECTED",
            Self::OUT_OF_RESOURCES => "OUT_OF_RESOURCES",
            Self::NOT_FOUND => "NOT_FOUND",
            Self::ACCESS_DENIED => "ACCESS_DENIED",
            Self::SECURITY_VIOLATION => "SECURITY_VIOLATION",
            Self(other) => return write!(f, "EfiStatus({other:#x})"),
        };
        f.write_str(name)
    }
}

/// A 64-bit, unaligned, little-endian encoding of [`EfiStatus`], appropriate
/// for sharing with the guest.
#[repr(transparent)]
#[derive(Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct EfiStatus64(pub U64<LittleEndian>);

impl Debug for EfiStatus64 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        EfiStatus::from(*self).fmt(f)
    }
}

impl From<EfiStatus> for EfiStatus64 {
    fn from(value: EfiStatus) -> Self {
        Self(value.0.into())
    }
}

impl From<EfiStatus64> for EfiStatus {
    fn from(value: EfiStatus64) -> Self {
        Self(value.0.get())
    }
}
