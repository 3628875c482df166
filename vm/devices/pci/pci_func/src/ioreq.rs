//! Hypervisor I/O request plumbing.
//!
//! The hypervisor delivers guest accesses as I/O request descriptors pulled
//! off a shared ring. The ring itself (slot layout, event channels, device
//! model registration) belongs to the host integration layer; this module
//! only defines the traits the device emulation consumes.

use crate::bar::AccessWidth;
use thiserror::Error;

/// Direction of a guest access.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoDirection {
    /// Guest read; the device supplies the value.
    Read,
    /// Guest write; the descriptor carries the value.
    Write,
}

/// Address space of a guest access.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoKind {
    /// Memory-mapped IO.
    Mmio,
    /// Port IO.
    Pio,
    /// PCI configuration space. `addr` carries the segment/bus/device/function
    /// in its high 32 bits and the register offset in its low bits.
    PciConfig,
}

/// One guest I/O access, decoded from a ring descriptor.
///
/// The access is always (address, width): descriptors never overload the size
/// field with additional offset bits.
#[derive(Debug, Copy, Clone)]
pub struct IoTransaction {
    /// Address space.
    pub kind: IoKind,
    /// Access address (see [`IoKind::PciConfig`] for config encoding).
    pub addr: u64,
    /// Access width.
    pub width: AccessWidth,
    /// Access direction.
    pub direction: IoDirection,
    /// Value being written (ignored for reads).
    pub data: u32,
}

/// The hypervisor's I/O request ring.
pub trait IoRing {
    /// Fetch the next pending request, if any.
    fn next_request(&mut self) -> Option<IoTransaction>;

    /// Complete the in-flight request, supplying the read value when the
    /// request was a read. Must be called exactly once per fetched request,
    /// before the next [`Self::next_request`] call.
    fn complete(&mut self, read_value: Option<u32>);

    /// Post the event-channel notification for the completed request. Called
    /// after [`Self::complete`], so the guest never observes an incomplete
    /// reply.
    fn notify(&mut self);
}

/// Error from [`PciPlatform`] registration calls.
#[derive(Debug, Error)]
#[error("error registering with the hypervisor")]
pub struct PciPlatformError(#[from] anyhow::Error);

impl PciPlatformError {
    /// Create a new [`PciPlatformError`]
    pub fn new(e: impl Into<anyhow::Error>) -> PciPlatformError {
        Self(e.into())
    }
}

/// Hypervisor services for hosting a synthetic PCI function.
pub trait PciPlatform {
    /// Claim config-space accesses for the given bus/device/function.
    fn register_device(&mut self, bus: u8, device: u8, function: u8)
        -> Result<(), PciPlatformError>;

    /// Release a previously claimed bus/device/function.
    fn unregister_device(&mut self, bus: u8, device: u8, function: u8);

    /// Route guest accesses in `[lo, hi]` (MMIO or port IO) to this device
    /// model.
    fn map_io_range(&mut self, is_mmio: bool, lo: u64, hi: u64);

    /// Stop routing guest accesses in `[lo, hi]`.
    fn unmap_io_range(&mut self, is_mmio: bool, lo: u64, hi: u64);
}
