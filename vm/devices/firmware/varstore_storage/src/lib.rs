//! Pluggable UEFI nvram variable storage (in-memory, blob-persisted).
//!
//! Storage backends store and retrieve variables without enforcing any UEFI
//! attribute semantics (that is the variable service engine's job), but they
//! _do_ own the storage quota: a mutation that would overshoot the configured
//! limits fails up front, before anything is modified.

#![forbid(unsafe_code)]

pub use uefi_specs::uefi::time::EFI_TIME;

pub mod in_memory;
pub mod persistent;
mod snapshot;
pub mod storage_backend;

use guid::Guid;
use thiserror::Error;
use ucs2::Ucs2LeSlice;
use ucs2::Ucs2LeVec;

/// Errors returned by [`NvramStorage`] operations.
#[derive(Debug, Error)]
pub enum NvramStorageError {
    /// stored data could not be decoded
    #[error("error deserializing nvram storage")]
    Deserialize,
    /// the backing store could not be read
    #[error("error loading data from nvram storage")]
    Load(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// the backing store could not be written
    #[error("error committing data to nvram storage")]
    Commit(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// the total storage quota would be exceeded
    #[error("nvram is out of space")]
    OutOfSpace,
    /// a single variable's name + data would exceed the per-variable cap
    #[error("variable name + data too large")]
    VariableTooLarge,
}

/// Result of [`NvramStorage::next_variable`].
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum NextVariable {
    /// The provided key does not name an existing variable.
    InvalidKey,
    /// Enumeration is complete.
    EndOfList,
    /// The next variable in enumeration order.
    Exists {
        /// Variable name.
        name: Ucs2LeVec,
        /// Vendor GUID.
        vendor: Guid,
        /// Variable attributes.
        attr: u32,
    },
}

/// Storage quota configuration.
///
/// A record costs `name bytes (sans terminator) + data bytes` against
/// `max_storage`; the same sum is bounded per-variable by
/// `max_variable_size`.
#[derive(Debug, Copy, Clone)]
pub struct VariableLimits {
    /// Total persistent storage budget, in bytes.
    pub max_storage: usize,
    /// Per-variable name + data cap, in bytes.
    pub max_variable_size: usize,
}

impl Default for VariableLimits {
    fn default() -> Self {
        Self {
            max_storage: 64 * 1024,
            max_variable_size: 32 * 1024,
        }
    }
}

/// Abstraction over nvram variable storage (in-memory, blob-persisted, etc.).
///
/// Implementors are **not required** to perform attribute validation beyond
/// quota accounting, and should simply store/retrieve data.
pub trait NvramStorage: Send {
    /// Return the `attr` + `data` + `timestamp` of the variable identified by
    /// `name` + `vendor`.
    fn get_variable(
        &mut self,
        name: &Ucs2LeSlice,
        vendor: Guid,
    ) -> Result<Option<(u32, Vec<u8>, EFI_TIME)>, NvramStorageError>;

    /// Set the variable identified by `name` + `vendor` to the provided
    /// `attr` + `data`, persisting the modification.
    fn set_variable(
        &mut self,
        name: &Ucs2LeSlice,
        vendor: Guid,
        attr: u32,
        data: Vec<u8>,
        timestamp: EFI_TIME,
    ) -> Result<(), NvramStorageError>;

    /// Append `data` to the variable identified by `name` + `vendor`,
    /// updating its timestamp and persisting the modification.
    ///
    /// Returns `false` if the variable could not be found.
    fn append_variable(
        &mut self,
        name: &Ucs2LeSlice,
        vendor: Guid,
        data: Vec<u8>,
        timestamp: EFI_TIME,
    ) -> Result<bool, NvramStorageError>;

    /// Remove the variable identified by `name` + `vendor`, persisting the
    /// modification. Its bytes return to the quota pool.
    ///
    /// Returns `false` if the variable could not be found.
    fn remove_variable(
        &mut self,
        name: &Ucs2LeSlice,
        vendor: Guid,
    ) -> Result<bool, NvramStorageError>;

    /// Return the variable key immediately after the variable identified by
    /// `name_vendor`, in a stable implementation-defined order that does not
    /// depend on request history. If `name_vendor` is `None`, return the
    /// first variable.
    fn next_variable(
        &mut self,
        name_vendor: Option<(&Ucs2LeSlice, Guid)>,
    ) -> Result<NextVariable, NvramStorageError>;

    /// Bytes currently charged against the quota by variables whose
    /// attributes contain every bit of `attr_mask`.
    fn used_storage(&mut self, attr_mask: u32) -> Result<u64, NvramStorageError>;

    /// The configured storage quota.
    fn limits(&self) -> VariableLimits;

    /// Return `true` if the store doesn't contain any vars.
    fn is_empty(&mut self) -> Result<bool, NvramStorageError> {
        Ok(matches!(self.next_variable(None)?, NextVariable::EndOfList))
    }
}

// Boilerplate: forward `NvramStorage` methods for `Box<dyn NvramStorage>`
impl NvramStorage for Box<dyn NvramStorage> {
    fn get_variable(
        &mut self,
        name: &Ucs2LeSlice,
        vendor: Guid,
    ) -> Result<Option<(u32, Vec<u8>, EFI_TIME)>, NvramStorageError> {
        (**self).get_variable(name, vendor)
    }

    fn set_variable(
        &mut self,
        name: &Ucs2LeSlice,
        vendor: Guid,
        attr: u32,
        data: Vec<u8>,
        timestamp: EFI_TIME,
    ) -> Result<(), NvramStorageError> {
        (**self).set_variable(name, vendor, attr, data, timestamp)
    }

    fn append_variable(
        &mut self,
        name: &Ucs2LeSlice,
        vendor: Guid,
        data: Vec<u8>,
        timestamp: EFI_TIME,
    ) -> Result<bool, NvramStorageError> {
        (**self).append_variable(name, vendor, data, timestamp)
    }

    fn remove_variable(
        &mut self,
        name: &Ucs2LeSlice,
        vendor: Guid,
    ) -> Result<bool, NvramStorageError> {
        (**self).remove_variable(name, vendor)
    }

    fn next_variable(
        &mut self,
        name_vendor: Option<(&Ucs2LeSlice, Guid)>,
    ) -> Result<NextVariable, NvramStorageError> {
        (**self).next_variable(name_vendor)
    }

    fn used_storage(&mut self, attr_mask: u32) -> Result<u64, NvramStorageError> {
        (**self).used_storage(attr_mask)
    }

    fn limits(&self) -> VariableLimits {
        (**self).limits()
    }
}
