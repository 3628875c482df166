use super::NvramError;
use super::NvramResult;
use super::VariableServices;
use guid::Guid;
use ucs2::Ucs2LeSlice;
use uefi_specs::uefi::common::EfiStatus;
use varstore_storage::NvramStorage;

/// Extension trait around [`VariableServices`] that makes it easier to use
/// the API outside the guest command path (host-side injection, tests).
///
/// These helpers hide the nitty-gritty details of UCS-2 string encoding,
/// pointer sizes/nullness, etc...
pub trait VariableServicesExt {
    /// Get a variable identified by `name` (as a Rust string) + `vendor`,
    /// returning the variable's attributes and data.
    fn get_variable(
        &mut self,
        vendor: Guid,
        name: &str,
    ) -> Result<(u32, Vec<u8>), (EfiStatus, Option<NvramError>)>;

    /// Get a variable identified by `name` (as a UCS-2 string) + `vendor`,
    /// returning the variable's attributes and data.
    fn get_variable_ucs2(
        &mut self,
        vendor: Guid,
        name: &Ucs2LeSlice,
    ) -> Result<(u32, Vec<u8>), (EfiStatus, Option<NvramError>)>;

    /// Set a variable identified by `name` (as a Rust string) + `vendor` with
    /// the specified `attr` and `data`.
    fn set_variable(
        &mut self,
        vendor: Guid,
        name: &str,
        attr: u32,
        data: Vec<u8>,
    ) -> Result<(), (EfiStatus, Option<NvramError>)>;

    /// Set a variable identified by `name` (as a UCS-2 string) + `vendor`
    /// with the specified `attr` and `data`.
    fn set_variable_ucs2(
        &mut self,
        vendor: Guid,
        name: &Ucs2LeSlice,
        attr: u32,
        data: Vec<u8>,
    ) -> Result<(), (EfiStatus, Option<NvramError>)>;
}

impl<S: NvramStorage> VariableServicesExt for VariableServices<S> {
    fn get_variable(
        &mut self,
        vendor: Guid,
        name: &str,
    ) -> Result<(u32, Vec<u8>), (EfiStatus, Option<NvramError>)> {
        let name = ucs2::Ucs2LeVec::from(name);
        self.get_variable_ucs2(vendor, &name)
    }

    fn get_variable_ucs2(
        &mut self,
        vendor: Guid,
        name: &Ucs2LeSlice,
    ) -> Result<(u32, Vec<u8>), (EfiStatus, Option<NvramError>)> {
        let mut attr = 0;
        // The low-level UEFI API takes `in_out_data_size` so it can validate
        // the guest-provided buffer is large enough. That validation isn't
        // relevant here, where the returned Vec is used directly.
        let mut in_out_data_size = u32::MAX;
        let NvramResult(data, status, err) = self.uefi_get_variable(
            Some(name.as_bytes()),
            vendor,
            &mut attr,
            &mut in_out_data_size,
            false,
        );

        if matches!(status, EfiStatus::SUCCESS) {
            Ok((attr, data.expect("data will not be None on EFI_SUCCESS")))
        } else {
            Err((status, err))
        }
    }

    fn set_variable(
        &mut self,
        vendor: Guid,
        name: &str,
        attr: u32,
        data: Vec<u8>,
    ) -> Result<(), (EfiStatus, Option<NvramError>)> {
        let name = ucs2::Ucs2LeVec::from(name);
        self.set_variable_ucs2(vendor, &name, attr, data)
    }

    fn set_variable_ucs2(
        &mut self,
        vendor: Guid,
        name: &Ucs2LeSlice,
        attr: u32,
        data: Vec<u8>,
    ) -> Result<(), (EfiStatus, Option<NvramError>)> {
        let NvramResult((), status, err) = self.uefi_set_variable(
            Some(name.as_bytes()),
            vendor,
            attr,
            data.len() as u32,
            Some(data),
        );

        if matches!(status, EfiStatus::SUCCESS) {
            Ok(())
        } else {
            Err((status, err))
        }
    }
}
