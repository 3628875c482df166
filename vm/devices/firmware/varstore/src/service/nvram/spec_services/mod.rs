//! An implementation of UEFI spec 8.2 - Variable Services
//!
//! This implementation is a direct transcription of the UEFI spec's variable
//! service semantics, including the secure boot policy machinery from section
//! 32: time-based authenticated writes, the PK/KEK/db/dbx trust hierarchy,
//! and the Setup/User/Audit/Deployed mode lifecycle.

pub use services_ext::VariableServicesExt;

use bitfield_struct::bitfield;
use guid::Guid;
use thiserror::Error;
use ucs2::Ucs2LeSlice;
use ucs2::Ucs2ParseError;
use uefi_specs::uefi::common::EfiStatus;
use uefi_specs::uefi::nvram::is_secure_boot_hierarchy_var;
use uefi_specs::uefi::nvram::is_secure_boot_policy_var;
use uefi_specs::uefi::nvram::vars;
use uefi_specs::uefi::nvram::EfiVariableAttributes;
use uefi_specs::uefi::time::EFI_TIME;
use varstore_storage::NextVariable;
use varstore_storage::NvramStorage;
use varstore_storage::NvramStorageError;
use zerocopy::FromBytes;
use zerocopy::FromZeros;

pub mod auth_var_crypto;
mod services_ext;

#[derive(Debug, Error)]
#[allow(missing_docs)] // error strings say it all
pub enum NvramError {
    #[error("storage backend error")]
    NvramStorage(#[source] NvramStorageError),
    #[error("storage backend previously failed a commit; writes are disabled")]
    StoragePoisoned,
    #[error("variable name cannot be null/None")]
    NameNull,
    #[error("variable data of non-zero len cannot be null")]
    DataNull,
    #[error("variable name validation failed")]
    NameValidation(#[from] Ucs2ParseError),
    #[error("cannot pass empty string to SetVariable")]
    NameEmpty,
    #[error("attributes include non-spec values")]
    AttributeNonSpec,
    #[error("invalid runtime access")]
    InvalidRuntimeAccess,
    #[error("invalid attr: hardware error records are not supported")]
    UnsupportedHardwareErrorRecord,
    #[error("invalid attr: enhanced authenticated access unsupported")]
    UnsupportedEnhancedAuthAccess,
    #[error("invalid attr: volatile variables unsupported")]
    UnsupportedVolatile,
    #[error("attribute mismatch with existing variable")]
    AttributeMismatch,
    #[error("secure boot hierarchy variables carry fixed attributes")]
    HierarchyAttributes,
    #[error("variable is read-only")]
    ReadOnlyVariable,
    #[error("authenticated variable error")]
    AuthError(#[from] AuthError),
    #[error("updating secure boot mode variables")]
    UpdateModeVars(#[source] NvramStorageError),
    #[error("parsing signature list")]
    SignatureList(#[from] uefi_sigdb::ParseError),
}

#[derive(Debug, Error)]
#[allow(missing_docs)] // error strings say it all
pub enum AuthError {
    #[error("data too short (cannot extract EFI_VARIABLE_AUTHENTICATION_2 header)")]
    NotEnoughHdrData,
    #[error("data too short (cannot extract WIN_CERTIFICATE_UEFI_GUID cert)")]
    NotEnoughCertData,
    #[error("invalid WIN_CERTIFICATE header")]
    InvalidWinCertHeader,
    #[error("incorrect cert type (must be WIN_CERTIFICATE_UEFI_GUID)")]
    IncorrectCertType,
    #[error("incorrect timestamp values")]
    IncorrectTimestamp,
    #[error("new timestamp is not later than current timestamp")]
    OldTimestamp,
    #[error("variable requires a time-based authenticated write")]
    AuthRequired,
    #[error("could not verify auth var")]
    CryptoError,
    #[error("error in crypto payload format")]
    CryptoFormat(#[from] auth_var_crypto::FormatError),
}

/// `SetVariable` validation is incredibly tricky, since there are a _lot_ of
/// subtle logic branches that are predicated on the presence (or lack
/// thereof) of various attribute bits.
///
/// To make the implementation easier to follow, the full-featured
/// [`EfiVariableAttributes`] type is swapped for this restricted subset of
/// flags part-way through SetVariable, once the operation-selector bits have
/// been consumed.
#[bitfield(u32)]
#[derive(PartialEq)]
pub struct SupportedAttrs {
    pub non_volatile: bool,
    pub bootservice_access: bool,
    pub runtime_access: bool,
    pub hardware_error_record: bool,
    _reserved: bool,
    pub time_based_authenticated_write_access: bool,
    #[bits(26)]
    _reserved2: u32,
}

impl SupportedAttrs {
    pub fn contains_unsupported_bits(&self) -> bool {
        u32::from(*self)
            & !u32::from(
                Self::new()
                    .with_non_volatile(true)
                    .with_bootservice_access(true)
                    .with_runtime_access(true)
                    .with_hardware_error_record(true)
                    .with_time_based_authenticated_write_access(true),
            )
            != 0
    }
}

/// Helper struct to collect various properties of a parsed authenticated var
#[derive(Debug, Clone, Copy)]
pub struct ParsedAuthVar<'a> {
    pub name: &'a Ucs2LeSlice,
    pub vendor: Guid,
    pub attr: u32,
    pub timestamp: EFI_TIME,
    pub pkcs7_data: &'a [u8],
    pub var_data: &'a [u8],
}

/// Unlike a typical result type, NvramResults contain _both_ a payload _and_
/// an error code. Depending on the error code, an optional [`NvramError`]
/// might be included as well, which provides more context for logging.
///
/// Notably, **this result type cannot be propagated via the `?` operator!**
#[derive(Debug)]
pub struct NvramResult<T>(pub T, pub EfiStatus, pub Option<NvramError>);

impl<T> NvramResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self.1, EfiStatus::SUCCESS)
    }
}

impl<T> std::fmt::Display for NvramResult<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.2 {
            Some(_) => write!(f, "{:?} (with error context)", self.1),
            None => write!(f, "{:?}", self.1),
        }
    }
}

impl<T> std::error::Error for NvramResult<T>
where
    T: std::fmt::Debug,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.2
            .as_ref()
            .map(|s| s as &(dyn std::error::Error + 'static))
    }
}

#[derive(Clone, Copy, Debug)]
enum RuntimeState {
    /// Host-side state, whereby read-only and authenticated variable checks
    /// are bypassed in order to inject initial nvram variables.
    ///
    /// Transitions into `Boot` once all pre-boot nvram variables have been
    /// successfully injected.
    PreBoot,
    /// UEFI firmware hasn't called `ExitBootServices`
    Boot,
    /// UEFI firmware has called `ExitBootServices`
    Runtime,
}

impl RuntimeState {
    fn is_pre_boot(&self) -> bool {
        matches!(&self, RuntimeState::PreBoot)
    }

    fn is_boot(&self) -> bool {
        matches!(&self, RuntimeState::Boot)
    }

    fn is_runtime(&self) -> bool {
        matches!(&self, RuntimeState::Runtime)
    }
}

/// The secure boot policy lifecycle, derived from the presence of PK and the
/// AuditMode/DeployedMode booleans (UEFI spec 32.3, Figure 32-4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecureBootMode {
    /// No platform key enrolled; policy variables are writable without
    /// authentication.
    Setup,
    /// PK enrolled; policy updates must chain to the trust hierarchy.
    User,
    /// AuditMode==1: image verification is recorded, not enforced.
    Audit,
    /// DeployedMode==1: the most restrictive state.
    Deployed,
}

impl SecureBootMode {
    /// Value of the SetupMode variable in this mode.
    fn setup_mode(&self) -> bool {
        matches!(self, SecureBootMode::Setup | SecureBootMode::Audit)
    }

    /// Value of the SecureBoot variable in this mode.
    fn secure_boot(&self) -> bool {
        matches!(self, SecureBootMode::User | SecureBootMode::Deployed)
    }
}

/// An implementation of UEFI spec 8.2 - Variable Services
///
/// This API tries to match the API defined by the UEFI spec 1:1, hence why it
/// doesn't look very "Rust-y".
///
/// For interacting with `VariableServices` outside the guest command path
/// (host-side injection, tests), the [`VariableServicesExt`] trait provides
/// helpers that hide the nitty-gritty details of UCS-2 string encoding,
/// pointer sizes/nullness, etc...
///
/// Instead of returning a typical `Result` type, these methods all return a
/// [`NvramResult`], where the `EfiStatus` field should be unconditionally
/// returned to the guest, while the `NvramError` provides additional host-side
/// context as to what went wrong.
#[derive(Debug)]
pub struct VariableServices<S: NvramStorage> {
    storage: S,
    runtime_state: RuntimeState,
    /// Set when the storage backend fails to commit a mutation that was
    /// already applied in memory. Rolling back would break timestamp
    /// monotonicity from the guest's perspective, so instead all further
    /// writes are refused until a commit goes through.
    storage_poisoned: bool,
}

impl<S: NvramStorage> VariableServices<S> {
    /// Construct a new `VariableServices` instance from an existing storage
    /// backend.
    pub fn new(storage: S) -> VariableServices<S> {
        VariableServices {
            storage,
            runtime_state: RuntimeState::PreBoot,
            storage_poisoned: false,
        }
    }

    /// Check if the nvram store is empty.
    pub fn is_empty(&mut self) -> Result<bool, NvramStorageError> {
        self.storage.is_empty()
    }

    /// Nvram behavior changes after the guest signals that ExitBootServices
    /// has been called (e.g: hiding variables that are only accessible at
    /// boot-time). This transition is one-way for the lifetime of the boot.
    pub fn exit_boot_services(&mut self) {
        if self.runtime_state.is_boot() {
            tracing::debug!("NVRAM has entered runtime mode");
            self.runtime_state = RuntimeState::Runtime;
        }
    }

    /// Called when the VM resets to return to the preboot state.
    pub fn reset(&mut self) {
        self.runtime_state = RuntimeState::PreBoot;
    }

    /// Called after injecting any pre-boot nvram vars, transitioning the
    /// nvram store to start accepting calls from guest UEFI.
    pub fn prepare_for_boot(&mut self) {
        assert!(self.runtime_state.is_pre_boot());
        tracing::debug!("NVRAM has entered boot mode");
        self.runtime_state = RuntimeState::Boot;
    }

    fn read_bool_var(
        &mut self,
        (vendor, name): (Guid, &Ucs2LeSlice),
    ) -> Result<bool, NvramStorageError> {
        Ok(match self.storage.get_variable(name, vendor)? {
            None => false,
            Some((_, data, _)) => data.first().map(|b| *b == 0x01).unwrap_or(false),
        })
    }

    /// Derive the current secure boot mode from PK and the mode booleans.
    pub fn secure_boot_mode(&mut self) -> Result<SecureBootMode, NvramStorageError> {
        if self.read_bool_var(vars::DEPLOYED_MODE())? {
            return Ok(SecureBootMode::Deployed);
        }
        if self.read_bool_var(vars::AUDIT_MODE())? {
            return Ok(SecureBootMode::Audit);
        }

        let (pk_vendor, pk_name) = vars::PK();
        Ok(if self.storage.get_variable(pk_name, pk_vendor)?.is_some() {
            SecureBootMode::User
        } else {
            SecureBootMode::Setup
        })
    }

    fn set_control_var(
        &mut self,
        (vendor, name): (Guid, &Ucs2LeSlice),
        value: u8,
    ) -> Result<(), NvramStorageError> {
        self.storage.set_variable(
            name,
            vendor,
            EfiVariableAttributes::DEFAULT_ATTRIBUTES.into(),
            vec![value],
            EFI_TIME::new_zeroed(),
        )
    }

    /// Bring SecureBoot/SetupMode (and, on first boot, the mode booleans) in
    /// line with the derived secure boot mode.
    ///
    /// From UEFI spec section 32.3
    ///
    /// While no Platform Key is enrolled, the SetupMode variable shall be
    /// equal to 1. After the Platform Key is enrolled, the SetupMode variable
    /// shall be equal to 0. While SetupMode == 0, the platform firmware shall
    /// require authentication in order to modify the Platform Key, Key
    /// Enrollment Key, and image security databases.
    pub fn sync_mode_vars(&mut self) -> Result<(), NvramStorageError> {
        let (audit_vendor, audit_name) = vars::AUDIT_MODE();
        if self
            .storage
            .get_variable(audit_name, audit_vendor)?
            .is_none()
        {
            self.set_control_var(vars::AUDIT_MODE(), 0)?;
        }

        let (depl_vendor, depl_name) = vars::DEPLOYED_MODE();
        if self.storage.get_variable(depl_name, depl_vendor)?.is_none() {
            self.set_control_var(vars::DEPLOYED_MODE(), 0)?;
        }

        let mode = self.secure_boot_mode()?;
        self.set_control_var(vars::SETUP_MODE(), mode.setup_mode() as u8)?;
        self.set_control_var(vars::SECURE_BOOT(), mode.secure_boot() as u8)?;

        tracing::debug!(?mode, "secure boot mode");
        Ok(())
    }

    fn get_variable_inner(
        &mut self,
        name: &Ucs2LeSlice,
        vendor: Guid,
    ) -> Result<Option<(SupportedAttrs, Vec<u8>, EFI_TIME)>, (EfiStatus, Option<NvramError>)> {
        match self.storage.get_variable(name, vendor) {
            Ok(None) => Ok(None),
            Ok(Some((attr, data, timestamp))) => {
                let attr = SupportedAttrs::from(attr);
                assert!(
                    !attr.contains_unsupported_bits(),
                    "underlying storage should only ever contain valid attributes"
                );

                Ok(Some((attr, data, timestamp)))
            }
            Err(e) => Err((
                EfiStatus::DEVICE_ERROR,
                Some(NvramError::NvramStorage(e)),
            )),
        }
    }

    /// Map a storage error from a mutation to a guest status, poisoning the
    /// engine when the in-memory state may have outrun the persistent blob.
    fn mutation_error(&mut self, e: NvramStorageError) -> (EfiStatus, Option<NvramError>) {
        let status = match &e {
            NvramStorageError::OutOfSpace | NvramStorageError::VariableTooLarge => {
                EfiStatus::OUT_OF_RESOURCES
            }
            NvramStorageError::Commit(_) => {
                tracing::error!("nvram commit failed; refusing further writes");
                self.storage_poisoned = true;
                EfiStatus::DEVICE_ERROR
            }
            NvramStorageError::Load(_) | NvramStorageError::Deserialize => EfiStatus::DEVICE_ERROR,
        };
        (status, Some(NvramError::NvramStorage(e)))
    }

    /// Get a variable identified by `name` + `vendor`, returning the
    /// variable's attributes and data.
    ///
    /// - `name`
    ///     - (In) Variable name (a null-terminated UCS-2 string, or `None` if
    ///       the guest passed a `nullptr`)
    /// - `in_vendor`
    ///     - (In) Variable vendor guid
    /// - `out_attr`
    ///     - (Out) Variable's attributes
    ///     - _Note:_ According to the UEFI spec: `attr` will be populated on
    ///       both EFI_SUCCESS _and_ when EFI_BUFFER_TOO_SMALL is returned.
    /// - `in_out_data_size`
    ///     - (In) Size of available data buffer (provided by guest)
    ///     - (Out) Size of data to be written into buffer
    ///     - _Note:_ If `data_is_null` is `true`, and `in_out_data_size` is
    ///       set to `0`, `in_out_data_size` will be updated with the size
    ///       required to store the variable.
    /// - `data_is_null`
    ///     - (In) bool indicating if guest passed `nullptr` as the data addr
    pub fn uefi_get_variable(
        &mut self,
        name: Option<&[u8]>,
        in_vendor: Guid,
        out_attr: &mut u32,
        in_out_data_size: &mut u32,
        data_is_null: bool,
    ) -> NvramResult<Option<Vec<u8>>> {
        let name = match name {
            Some(name) => {
                Ucs2LeSlice::from_slice_with_nul(name).map_err(NvramError::NameValidation)
            }
            None => Err(NvramError::NameNull),
        };

        let name = match name {
            Ok(name) => name,
            Err(e) => return NvramResult(None, EfiStatus::INVALID_PARAMETER, Some(e)),
        };

        tracing::trace!(
            ?in_vendor,
            ?name,
            in_out_data_size,
            data_is_null,
            "Get NVRAM variable",
        );

        let (attr, data) = match self.get_variable_inner(name, in_vendor) {
            Ok(Some((attr, data, _))) => (attr, data),
            Ok(None) => return NvramResult(None, EfiStatus::NOT_FOUND, None),
            Err((status, err)) => return NvramResult(None, status, err),
        };

        if self.runtime_state.is_runtime() && !attr.runtime_access() {
            // From UEFI spec section 8.2:
            //
            // If EFI_BOOT_SERVICES.ExitBootServices() has already been
            // executed, data variables without the EFI_VARIABLE_RUNTIME_ACCESS
            // attribute set will not be visible to GetVariable() and will
            // return an EFI_NOT_FOUND error.
            return NvramResult(
                None,
                EfiStatus::NOT_FOUND,
                Some(NvramError::InvalidRuntimeAccess),
            );
        }

        *out_attr = attr.into();
        match (*in_out_data_size, data_is_null) {
            (0, true) => *in_out_data_size = data.len() as u32,
            (_, true) => return NvramResult(None, EfiStatus::INVALID_PARAMETER, None),
            (_, false) => {
                let guest_buf_len = *in_out_data_size as usize;
                *in_out_data_size = data.len() as u32;
                if guest_buf_len < data.len() {
                    return NvramResult(None, EfiStatus::BUFFER_TOO_SMALL, None);
                }
            }
        }

        NvramResult(Some(data), EfiStatus::SUCCESS, None)
    }

    /// Set a variable identified by `name` + `vendor` with the specified
    /// `attr` and `data`.
    ///
    /// - `name`
    ///     - (In) Variable name (a null-terminated UCS-2 string, or `None` if
    ///       the guest passed a `nullptr`)
    ///     - _Note:_ `name` must contain one or more character.
    /// - `in_vendor`
    ///     - (In) Variable vendor guid
    /// - `in_attr`
    ///     - (In) Variable's attributes
    /// - `in_data_size`
    ///     - (In) Length of data to be written
    ///     - If len is `0`, and EFI_VARIABLE_APPEND_WRITE is not set, the
    ///       variable will be deleted.
    /// - `data`
    ///     - (In) Variable data (or `None` if the guest passed a `nullptr`)
    pub fn uefi_set_variable(
        &mut self,
        name: Option<&[u8]>,
        in_vendor: Guid,
        in_attr: u32,
        in_data_size: u32,
        data: Option<Vec<u8>>,
    ) -> NvramResult<()> {
        let name = match name {
            Some(name) => {
                Ucs2LeSlice::from_slice_with_nul(name).map_err(NvramError::NameValidation)
            }
            None => Err(NvramError::NameNull),
        };

        let name = match name {
            Ok(name) => name,
            Err(e) => return NvramResult((), EfiStatus::INVALID_PARAMETER, Some(e)),
        };

        if name.as_bytes() == [0, 0] {
            return NvramResult(
                (),
                EfiStatus::INVALID_PARAMETER,
                Some(NvramError::NameEmpty),
            );
        }

        tracing::trace!(
            %in_vendor,
            %name,
            in_attr,
            in_data_size,
            data = if data.is_some() { "Some([..])" } else { "None" },
            "Set NVRAM variable",
        );

        if self.storage_poisoned {
            return NvramResult(
                (),
                EfiStatus::DEVICE_ERROR,
                Some(NvramError::StoragePoisoned),
            );
        }

        // Perform some basic attribute validation
        let attr = {
            // Validate that set bits correspond to valid attribute flags
            let attr = EfiVariableAttributes::from(in_attr);
            if attr.contains_unsupported_bits() {
                return NvramResult(
                    (),
                    EfiStatus::INVALID_PARAMETER,
                    Some(NvramError::AttributeNonSpec),
                );
            }

            // From UEFI spec section 8.2:
            //
            // Runtime access to a data variable implies boot service access.
            // Attributes that have EFI_VARIABLE_RUNTIME_ACCESS set must also
            // have EFI_VARIABLE_BOOTSERVICE_ACCESS set. The caller is
            // responsible for following this rule.
            if attr.runtime_access() && !attr.bootservice_access() {
                return NvramResult((), EfiStatus::INVALID_PARAMETER, None);
            }

            // From UEFI spec section 8.2:
            //
            // If both the EFI_VARIABLE_TIME_BASED_AUTHENTICATED_WRITE_ACCESS
            // and the EFI_VARIABLE_ENHANCED_AUTHENTICATED_ACCESS attribute are
            // set in a SetVariable() call, then the firmware must return
            // EFI_INVALID_PARAMETER.
            if attr.time_based_authenticated_write_access() && attr.enhanced_authenticated_access()
            {
                return NvramResult((), EfiStatus::INVALID_PARAMETER, None);
            }

            attr
        };

        // Report EFI_UNSUPPORTED for any attributes this implementation
        // doesn't support
        {
            if attr.hardware_error_record() {
                return NvramResult(
                    (),
                    EfiStatus::UNSUPPORTED,
                    Some(NvramError::UnsupportedHardwareErrorRecord),
                );
            }

            if attr.enhanced_authenticated_access() {
                return NvramResult(
                    (),
                    EfiStatus::UNSUPPORTED,
                    Some(NvramError::UnsupportedEnhancedAuthAccess),
                );
            }

            // From UEFI spec section 8.2:
            //
            // EFI_VARIABLE_AUTHENTICATED_WRITE_ACCESS is deprecated and should
            // not be used. Platforms should return EFI_UNSUPPORTED if a caller
            // to SetVariable() specifies this attribute.
            if attr.authenticated_write_access() {
                return NvramResult((), EfiStatus::UNSUPPORTED, None);
            }
        }

        // From UEFI spec section 8.2:
        //
        // Once ExitBootServices() is performed, only variables that have
        // EFI_VARIABLE_RUNTIME_ACCESS and EFI_VARIABLE_NON_VOLATILE set can
        // be set with SetVariable(). Variables that have runtime access but
        // that are not nonvolatile are readonly data variables once
        // ExitBootServices() is performed.
        if self.runtime_state.is_runtime() {
            // If neither access attribute is set the write is delete-shaped,
            // and the runtime access check is punted to the delete operation,
            // which verifies the variable being deleted has the correct
            // attributes.
            let missing_access_attrs = !(attr.runtime_access() || attr.bootservice_access());

            if !missing_access_attrs && !(attr.runtime_access() && attr.non_volatile()) {
                return NvramResult(
                    (),
                    EfiStatus::WRITE_PROTECTED,
                    Some(NvramError::InvalidRuntimeAccess),
                );
            }
        }

        // The mode state machine gets consulted in several places below
        let mode = match self.secure_boot_mode() {
            Ok(mode) => mode,
            Err(e) => return NvramResult((), EfiStatus::DEVICE_ERROR, Some(NvramError::NvramStorage(e))),
        };
        let in_setup_mode = mode.setup_mode();

        // Check if the variable being set is read-only from the guest, or is
        // one of the mode booleans with their bespoke transition rules.
        //
        // These checks are bypassed during pre-boot in order to set the vars'
        // initial values.
        if !self.runtime_state.is_pre_boot() {
            let read_only_vars = [vars::SECURE_BOOT(), vars::SETUP_MODE()];
            if read_only_vars.into_iter().any(|v| v == (in_vendor, name)) {
                return NvramResult(
                    (),
                    EfiStatus::WRITE_PROTECTED,
                    Some(NvramError::ReadOnlyVariable),
                );
            }

            if (in_vendor, name) == vars::AUDIT_MODE() {
                return self.mode_boolean_write(vars::AUDIT_MODE(), mode, SecureBootMode::Setup, in_attr, data);
            }
            if (in_vendor, name) == vars::DEPLOYED_MODE() {
                return self.mode_boolean_write(vars::DEPLOYED_MODE(), mode, SecureBootMode::User, in_attr, data);
            }
        }

        // The secure boot trust hierarchy always requires time-based
        // authenticated writes, and its variables carry a fixed attribute
        // set.
        let is_hierarchy = is_secure_boot_hierarchy_var(in_vendor, name);
        if !self.runtime_state.is_pre_boot() && is_hierarchy {
            if !attr.time_based_authenticated_write_access() {
                return NvramResult(
                    (),
                    EfiStatus::SECURITY_VIOLATION,
                    Some(NvramError::AuthError(AuthError::AuthRequired)),
                );
            }

            if attr.with_append_write(false)
                != EfiVariableAttributes::DEFAULT_ATTRIBUTES_TIME_BASED_AUTH
            {
                return NvramResult(
                    (),
                    EfiStatus::INVALID_PARAMETER,
                    Some(NvramError::HierarchyAttributes),
                );
            }
        }

        // The behavior of various operations changes depending on whether or
        // not the specified variable already exists, so go ahead and try to
        // fetch it
        let existing_var = match self.get_variable_inner(name, in_vendor) {
            Ok(v) => v,
            Err((status, err)) => return NvramResult((), status, err),
        };

        let (in_data_size, data, timestamp) = {
            if !attr.time_based_authenticated_write_access() {
                // nothing fancy here, just some regular 'ol data...
                (in_data_size, data, EFI_TIME::new_zeroed())
            } else {
                // the payload leads with an EFI_VARIABLE_AUTHENTICATION_2
                // descriptor
                //
                // UEFI spec 8.2.2 - Using the EFI_VARIABLE_AUTHENTICATION_2
                // descriptor
                let data = match data {
                    Some(data) => data,
                    None => {
                        return NvramResult(
                            (),
                            EfiStatus::INVALID_PARAMETER,
                            Some(NvramError::DataNull),
                        )
                    }
                };

                let parsed = match parse_auth2_descriptor(&data) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        return NvramResult(
                            (),
                            EfiStatus::SECURITY_VIOLATION,
                            Some(NvramError::AuthError(e)),
                        )
                    }
                };

                // if the variable already exists, enforce timestamp
                // monotonicity: replacements must be strictly newer, appends
                // may match the stored timestamp but never predate it
                let orig_timestamp = parsed.timestamp; // signed message uses the original value
                let timestamp = {
                    let mut timestamp = parsed.timestamp;
                    if let Some((_, _, existing_timestamp)) = &existing_var {
                        let is_newer = timestamp.ymdhms() > existing_timestamp.ymdhms();
                        if !is_newer {
                            let append_at_same_time = attr.append_write()
                                && timestamp.ymdhms() == existing_timestamp.ymdhms();
                            if !append_at_same_time {
                                return NvramResult(
                                    (),
                                    EfiStatus::SECURITY_VIOLATION,
                                    Some(NvramError::AuthError(AuthError::OldTimestamp)),
                                );
                            }
                            timestamp = *existing_timestamp;
                        }
                    }
                    timestamp
                };

                // From UEFI spec section 8.2.2:
                //
                // If the variable SetupMode==1, and the variable is a secure
                // boot policy variable, then the firmware implementation shall
                // consider the checks in the following steps 4 and 5 to have
                // passed, and proceed with updating the variable value as
                // outlined below.
                //
                // (this implementation extends the bypass to the pre-boot
                // injection state)
                let bypass_auth = self.runtime_state.is_pre_boot()
                    || (in_setup_mode && is_secure_boot_policy_var(in_vendor, name));

                // With no PK enrolled there is no trust root to chain to, so
                // the cryptographic check is vacuous; descriptor framing and
                // timestamp checks above still apply.
                let pk_exists = {
                    let (pk_vendor, pk_name) = vars::PK();
                    match self.get_variable_inner(pk_name, pk_vendor) {
                        Ok(v) => v.is_some(),
                        Err((status, err)) => return NvramResult((), status, err),
                    }
                };

                if pk_exists && !bypass_auth {
                    let parsed_auth_var = ParsedAuthVar {
                        name,
                        vendor: in_vendor,
                        attr: in_attr,
                        timestamp: orig_timestamp,
                        pkcs7_data: parsed.pkcs7_data,
                        var_data: parsed.payload,
                    };

                    // From UEFI spec section 8.2.2:
                    //
                    // If the variable is the global PK or KEK variable, verify
                    // that the signature has been made with the current
                    // Platform Key. If the variable is one of the image
                    // security databases, verify that the signer chains to a
                    // certificate in the Key Exchange Key database (or that
                    // the signature was made with the current Platform Key).
                    // Other time-based authenticated variables accept the
                    // same roots as the databases.
                    let pk_or_kek = [vars::PK(), vars::KEK()]
                        .into_iter()
                        .any(|v| v == (in_vendor, name));

                    let pk_root = [vars::PK()];
                    let kek_then_pk = [vars::KEK(), vars::PK()];
                    let key_vars: &[(Guid, &Ucs2LeSlice)] = if pk_or_kek {
                        &pk_root
                    } else {
                        &kek_then_pk
                    };

                    if let Err((status, err)) = self.authenticate_var(key_vars, parsed_auth_var) {
                        return NvramResult((), status, err);
                    }
                }

                // now that everything has been validated, strip off the auth
                // descriptor and go on to performing the requested operation
                // on the remaining payload
                let payload_len = parsed.payload.len();
                let auth_len = data.len() - payload_len;

                (payload_len as u32, {
                    let mut data = data;
                    data.drain(..auth_len);
                    Some(data)
                }, timestamp)
            }
        };

        // SetVariable is pretty weird, as it overloads a single method to
        // perform a whole bunch of different variable operations, such as
        // removing, updating, appending, and setting variables.
        //
        // Determining which specific operation is being requested requires
        // navigating a hodgepodge of various rules and indicators, such as
        // the length of the data passed in, what attributes are set, etc...
        #[derive(Debug)]
        enum VariableOperation {
            Set,
            Append,
            Delete,
        }

        let op = {
            let is_doing_append = attr.append_write();
            let is_doing_delete = {
                // From UEFI spec section 8.2:
                //
                // If a preexisting variable is rewritten with no access
                // attributes specified, the variable will be deleted. Unless
                // the EFI_VARIABLE_APPEND_WRITE attribute is set, using
                // SetVariable() with a DataSize of zero will also cause the
                // entire variable to be deleted.
                let missing_access_attrs = !(attr.runtime_access() || attr.bootservice_access());
                let zero_data_size = in_data_size == 0 && !is_doing_append;

                missing_access_attrs || zero_data_size
            };

            // append takes precedence over delete/set
            if is_doing_append {
                VariableOperation::Append
            } else if is_doing_delete {
                VariableOperation::Delete
            } else {
                VariableOperation::Set
            }
        };

        tracing::trace!(?op, "SetVariable is performing");

        // normalize attr bits (i.e: strip off APPEND_WRITE indicator)
        let attr = attr.with_append_write(false);

        // Drop down to using `SupportedAttrs` instead of
        // `EfiVariableAttributes` to make things easier to follow.
        let attr = SupportedAttrs::from(u32::from(attr));

        let res = match op {
            VariableOperation::Append => {
                // This implementation only supports non-volatile variables.
                // Volatile variables should be handled within UEFI itself.
                if !attr.non_volatile() {
                    return NvramResult(
                        (),
                        EfiStatus::UNSUPPORTED,
                        Some(NvramError::UnsupportedVolatile),
                    );
                }

                // data *might* get modified in the case that it contains an
                // EFI_SIGNATURE_LIST, and duplicates need to get filtered out
                // (hence the use of `mut`)
                let mut data = match (in_data_size, data) {
                    // Appending with zero data will silently do nothing,
                    // regardless if a variable already exists
                    (0, _) => return NvramResult((), EfiStatus::SUCCESS, None),
                    // If data len is non-zero, data cannot be nullptr
                    (_, None) => {
                        return NvramResult(
                            (),
                            EfiStatus::INVALID_PARAMETER,
                            Some(NvramError::DataNull),
                        )
                    }
                    (_, Some(data)) => data,
                };

                if let Some((existing_attr, existing_data, _)) = existing_var {
                    // attempting to append to a boot-time variable at runtime
                    if self.runtime_state.is_runtime() && !existing_attr.runtime_access() {
                        // ...will fail, since the variable "doesn't exist" at
                        // runtime
                        return NvramResult(
                            (),
                            EfiStatus::NOT_FOUND,
                            Some(NvramError::InvalidRuntimeAccess),
                        );
                    }

                    // From UEFI spec section 8.2:
                    //
                    // If a preexisting variable is rewritten with different
                    // attributes, SetVariable() shall not modify the variable
                    // and shall return EFI_INVALID_PARAMETER.
                    if attr != existing_attr {
                        return NvramResult(
                            (),
                            EfiStatus::INVALID_PARAMETER,
                            Some(NvramError::AttributeMismatch),
                        );
                    }

                    // From UEFI spec section 8.2:
                    //
                    // For variables with the GUID EFI_IMAGE_SECURITY_DATABASE_GUID
                    // (i.e. where the data buffer is formatted as EFI_SIGNATURE_LIST),
                    // the driver shall not perform an append of EFI_SIGNATURE_DATA
                    // values that are already part of the existing variable value.
                    //
                    // Note: This situation is not considered an error, and shall in
                    // itself not cause a status code other than EFI_SUCCESS to be
                    // returned or the timestamp associated with the variable not to
                    // be updated.
                    if attr.time_based_authenticated_write_access() {
                        let existing_lists = uefi_sigdb::parse_signature_lists(&existing_data)
                            .expect("existing var must contain valid list of EFI_SIGNATURE_LIST");
                        let existing_signatures = uefi_sigdb::signature_set(&existing_lists);

                        let incoming = match uefi_sigdb::parse_signature_lists(&data) {
                            Ok(lists) => lists,
                            // it *is* an error if the provided signature list
                            // is malformed
                            Err(e) => {
                                return NvramResult(
                                    (),
                                    EfiStatus::INVALID_PARAMETER,
                                    Some(NvramError::SignatureList(e)),
                                )
                            }
                        };

                        let filtered: Vec<_> = incoming
                            .into_iter()
                            .filter_map(|list| {
                                list.filter_entries(|key| {
                                    !existing_signatures.contains(&key.clone().into_owned())
                                })
                            })
                            .collect();

                        data = uefi_sigdb::write_signature_lists(&filtered);
                    }
                }

                // All validation checks have passed, so perform the operation
                match self.storage.append_variable(name, in_vendor, data, timestamp) {
                    Ok(true) => NvramResult((), EfiStatus::SUCCESS, None),
                    Ok(false) => NvramResult((), EfiStatus::NOT_FOUND, None),
                    Err(e) => {
                        let (status, err) = self.mutation_error(e);
                        NvramResult((), status, err)
                    }
                }
            }
            VariableOperation::Delete => {
                if let Some((existing_attr, _, _)) = existing_var {
                    // attempting to delete an existing boot-time variable at
                    // runtime
                    if self.runtime_state.is_runtime() && !existing_attr.runtime_access() {
                        // ...will fail, since the variable "doesn't exist" at
                        // runtime
                        return NvramResult(
                            (),
                            EfiStatus::NOT_FOUND,
                            Some(NvramError::InvalidRuntimeAccess),
                        );
                    }
                }

                // DeployedMode is irreversible via variable writes, and a PK
                // deletion would transition back to setup mode
                if (in_vendor, name) == vars::PK()
                    && mode == SecureBootMode::Deployed
                    && !self.runtime_state.is_pre_boot()
                {
                    return NvramResult(
                        (),
                        EfiStatus::WRITE_PROTECTED,
                        Some(NvramError::ReadOnlyVariable),
                    );
                }

                // All validation checks have passed, so perform the operation
                match self.storage.remove_variable(name, in_vendor) {
                    Ok(true) => NvramResult((), EfiStatus::SUCCESS, None),
                    Ok(false) => NvramResult((), EfiStatus::NOT_FOUND, None),
                    Err(e) => {
                        let (status, err) = self.mutation_error(e);
                        NvramResult((), status, err)
                    }
                }
            }
            VariableOperation::Set => {
                // This implementation only supports non-volatile variables.
                // Volatile variables should be handled within UEFI itself.
                // (The mode control variables are stored non-volatile and
                // re-derived on boot.)
                if !attr.non_volatile() {
                    return NvramResult(
                        (),
                        EfiStatus::UNSUPPORTED,
                        Some(NvramError::UnsupportedVolatile),
                    );
                }

                // if we are doing a variable set, then data cannot be a
                // nullptr
                let data = match data {
                    Some(data) => data,
                    None => {
                        return NvramResult(
                            (),
                            EfiStatus::INVALID_PARAMETER,
                            Some(NvramError::DataNull),
                        )
                    }
                };

                if let Some((existing_attr, _, _)) = existing_var {
                    // attempting to overwrite an existing boot-time variable
                    // at runtime
                    if self.runtime_state.is_runtime() && !existing_attr.runtime_access() {
                        // GetVariable would report EFI_NOT_FOUND for this
                        // variable (it is "hidden" at runtime), implying the
                        // set should succeed. Failing with WRITE_PROTECTED
                        // leaks the fact that the boot-time variable exists,
                        // but not its contents, and matches every deployed
                        // implementation of this corner case.
                        return NvramResult(
                            (),
                            EfiStatus::WRITE_PROTECTED,
                            Some(NvramError::InvalidRuntimeAccess),
                        );
                    }

                    // From UEFI spec section 8.2:
                    //
                    // If a preexisting variable is rewritten with different
                    // attributes, SetVariable() shall not modify the variable
                    // and shall return EFI_INVALID_PARAMETER.
                    if attr != existing_attr {
                        return NvramResult(
                            (),
                            EfiStatus::INVALID_PARAMETER,
                            Some(NvramError::AttributeMismatch),
                        );
                    }
                }

                // All validation checks have passed, so perform the operation
                match self
                    .storage
                    .set_variable(name, in_vendor, attr.into(), data, timestamp)
                {
                    Ok(()) => NvramResult((), EfiStatus::SUCCESS, None),
                    Err(e) => {
                        let (status, err) = self.mutation_error(e);
                        NvramResult((), status, err)
                    }
                }
            }
        };

        // Mutating PK moves the secure boot mode state machine: enrollment
        // leaves setup (or audit) mode, deletion returns to it.
        if res.is_success() && (in_vendor, name) == vars::PK() {
            let enrolled = !matches!(op, VariableOperation::Delete);
            let sync_res = (|| {
                if enrolled {
                    self.set_control_var(vars::AUDIT_MODE(), 0)?;
                }
                self.sync_mode_vars()
            })();

            if let Err(e) = sync_res {
                return NvramResult(
                    (),
                    EfiStatus::DEVICE_ERROR,
                    Some(NvramError::UpdateModeVars(e)),
                );
            }
        }

        res
    }

    /// Handle a guest write to AuditMode or DeployedMode: a 1-byte write of
    /// 0x01, permitted only in `allowed_from`, flips the boolean; everything
    /// else is rejected.
    fn mode_boolean_write(
        &mut self,
        var: (Guid, &Ucs2LeSlice),
        mode: SecureBootMode,
        allowed_from: SecureBootMode,
        in_attr: u32,
        data: Option<Vec<u8>>,
    ) -> NvramResult<()> {
        if mode != allowed_from {
            return NvramResult(
                (),
                EfiStatus::WRITE_PROTECTED,
                Some(NvramError::ReadOnlyVariable),
            );
        }

        if EfiVariableAttributes::from(in_attr) != EfiVariableAttributes::DEFAULT_ATTRIBUTES {
            return NvramResult(
                (),
                EfiStatus::INVALID_PARAMETER,
                Some(NvramError::AttributeMismatch),
            );
        }

        if data.as_deref() != Some(&[0x01][..]) {
            return NvramResult(
                (),
                EfiStatus::WRITE_PROTECTED,
                Some(NvramError::ReadOnlyVariable),
            );
        }

        let res = (|| {
            self.set_control_var(var, 0x01)?;
            self.sync_mode_vars()
        })();

        match res {
            Ok(()) => NvramResult((), EfiStatus::SUCCESS, None),
            Err(e) => NvramResult(
                (),
                EfiStatus::DEVICE_ERROR,
                Some(NvramError::UpdateModeVars(e)),
            ),
        }
    }

    /// Authenticate the given variable against the certs stored in the
    /// specified key variables, in order, accepting the write if any root
    /// verifies the signature.
    fn authenticate_var(
        &mut self,
        key_vars: &[(Guid, &Ucs2LeSlice)],
        auth_var: ParsedAuthVar<'_>,
    ) -> Result<(), (EfiStatus, Option<NvramError>)> {
        for (key_vendor, key_name) in key_vars {
            let signature_lists = match self.get_variable_inner(key_name, *key_vendor)? {
                Some((_, data, _)) => data,
                None => continue,
            };

            match auth_var_crypto::authenticate_variable(&signature_lists, auth_var) {
                Ok(true) => return Ok(()),
                Ok(false) => continue,
                Err(e) if e.key_var_error() => {
                    panic!("existing signature list must contain valid data: {}", e)
                }
                // all other errors are due to malformed auth_var data
                Err(e) => {
                    return Err((
                        EfiStatus::SECURITY_VIOLATION,
                        Some(NvramError::AuthError(AuthError::CryptoFormat(e))),
                    ))
                }
            }
        }

        Err((
            EfiStatus::SECURITY_VIOLATION,
            Some(NvramError::AuthError(AuthError::CryptoError)),
        ))
    }

    /// Return the variable immediately following the variable identified by
    /// `name` + `vendor`.
    ///
    /// If `name` is an empty string, the first variable is returned.
    ///
    /// - `in_out_name_size`
    ///     - (In) Size of the guest's name buffer
    ///     - (Out) Size of the next variable name
    ///     - _Note:_ If there is insufficient space in the name buffer to
    ///       store the next variable name, `in_out_name_size` is updated with
    ///       the required size.
    /// - `name`
    ///     - (In) Variable name (a null-terminated UCS-2 string, or `None` if
    ///       the guest passed a `nullptr`)
    /// - `vendor`
    ///     - (In) Variable vendor guid
    pub fn uefi_get_next_variable(
        &mut self,
        in_out_name_size: &mut u32,
        name: Option<&[u8]>,
        vendor: Guid,
    ) -> NvramResult<Option<(Vec<u8>, Guid)>> {
        let name = match name {
            Some(name) => {
                Ucs2LeSlice::from_slice_with_nul(name).map_err(NvramError::NameValidation)
            }
            None => Err(NvramError::NameNull),
        };

        let name = match name {
            Ok(name) => name,
            Err(e) => return NvramResult(None, EfiStatus::INVALID_PARAMETER, Some(e)),
        };

        tracing::trace!(?vendor, ?name, in_out_name_size, "Next NVRAM variable");

        // As per UEFI spec: if an empty null-terminated string is passed to
        // GetNextVariableName, the first variable should be returned
        let mut res = if name.as_bytes() == [0, 0] {
            self.storage.next_variable(None)
        } else {
            self.storage.next_variable(Some((name, vendor)))
        };

        loop {
            match res {
                Ok(NextVariable::EndOfList) => {
                    return NvramResult(None, EfiStatus::NOT_FOUND, None)
                }
                Ok(NextVariable::InvalidKey) => {
                    return NvramResult(None, EfiStatus::INVALID_PARAMETER, None);
                }
                Ok(NextVariable::Exists { name, vendor, attr }) => {
                    let attr = SupportedAttrs::from(attr);
                    assert!(
                        !attr.contains_unsupported_bits(),
                        "underlying storage should only ever contain valid attributes"
                    );

                    // From UEFI spec section 8.2:
                    //
                    // Once EFI_BOOT_SERVICES.ExitBootServices() is performed,
                    // variables that are only visible during boot services
                    // will no longer be returned.
                    //
                    // i.e: continue iterating
                    if self.runtime_state.is_runtime() && !attr.runtime_access() {
                        res = self.storage.next_variable(Some((name.as_ref(), vendor)));
                        continue;
                    }

                    let guest_buf_len = *in_out_name_size as usize;
                    *in_out_name_size = name.as_bytes().len() as u32;
                    if guest_buf_len < name.as_bytes().len() {
                        return NvramResult(None, EfiStatus::BUFFER_TOO_SMALL, None);
                    }

                    return NvramResult(
                        Some((name.into_inner(), vendor)),
                        EfiStatus::SUCCESS,
                        None,
                    );
                }
                Err(e) => {
                    return NvramResult(
                        None,
                        EfiStatus::DEVICE_ERROR,
                        Some(NvramError::NvramStorage(e)),
                    );
                }
            }
        }
    }

    /// Report storage quota information for the class of variables selected
    /// by `in_attr`, as (maximum storage, remaining storage, maximum single
    /// variable size).
    pub fn uefi_query_variable_info(&mut self, in_attr: u32) -> NvramResult<Option<(u64, u64, u64)>> {
        let attr = EfiVariableAttributes::from(in_attr);

        if in_attr == 0 || attr.contains_unsupported_bits() {
            return NvramResult(
                (),
                EfiStatus::INVALID_PARAMETER,
                Some(NvramError::AttributeNonSpec),
            )
            .map_none();
        }

        if attr.runtime_access() && !attr.bootservice_access() {
            return NvramResult((), EfiStatus::INVALID_PARAMETER, None).map_none();
        }

        if attr.hardware_error_record() {
            return NvramResult(
                (),
                EfiStatus::UNSUPPORTED,
                Some(NvramError::UnsupportedHardwareErrorRecord),
            )
            .map_none();
        }

        // After ExitBootServices only runtime-accessible storage may be
        // queried.
        if self.runtime_state.is_runtime() && !attr.runtime_access() {
            return NvramResult(
                (),
                EfiStatus::INVALID_PARAMETER,
                Some(NvramError::InvalidRuntimeAccess),
            )
            .map_none();
        }

        // quota matching only considers the storage class bits (NV/BS/RT)
        let class_mask = in_attr
            & u32::from(
                EfiVariableAttributes::new()
                    .with_non_volatile(true)
                    .with_bootservice_access(true)
                    .with_runtime_access(true),
            );

        let limits = self.storage.limits();
        let used = match self.storage.used_storage(class_mask) {
            Ok(used) => used,
            Err(e) => {
                return NvramResult(
                    (),
                    EfiStatus::DEVICE_ERROR,
                    Some(NvramError::NvramStorage(e)),
                )
                .map_none()
            }
        };

        let max_storage = limits.max_storage as u64;
        NvramResult(
            Some((
                max_storage,
                max_storage.saturating_sub(used),
                limits.max_variable_size as u64,
            )),
            EfiStatus::SUCCESS,
            None,
        )
    }
}

impl NvramResult<()> {
    fn map_none<T>(self) -> NvramResult<Option<T>> {
        NvramResult(None, self.1, self.2)
    }
}

/// The pieces of an `EFI_VARIABLE_AUTHENTICATION_2`-prefixed payload.
struct ParsedAuth2<'a> {
    timestamp: EFI_TIME,
    pkcs7_data: &'a [u8],
    payload: &'a [u8],
}

/// Split `descriptor || PKCS#7 || payload`, validating every declared length
/// against the buffer before use.
fn parse_auth2_descriptor(data: &[u8]) -> Result<ParsedAuth2<'_>, AuthError> {
    use uefi_specs::uefi::nvram::EFI_VARIABLE_AUTHENTICATION_2;
    use uefi_specs::uefi::signing::EFI_CERT_TYPE_PKCS7_GUID;
    use uefi_specs::uefi::signing::WIN_CERTIFICATE_UEFI_GUID;
    use uefi_specs::uefi::signing::WIN_CERT_REVISION;
    use uefi_specs::uefi::signing::WIN_CERT_TYPE_EFI_GUID;

    let Ok((auth_hdr, _)) = EFI_VARIABLE_AUTHENTICATION_2::read_from_prefix(data) else {
        return Err(AuthError::NotEnoughHdrData);
    };

    // validate WIN_CERTIFICATE header construction
    if auth_hdr.auth_info.header.revision != WIN_CERT_REVISION {
        return Err(AuthError::InvalidWinCertHeader);
    }
    if auth_hdr.auth_info.header.certificate_type != WIN_CERT_TYPE_EFI_GUID
        || auth_hdr.auth_info.cert_type != EFI_CERT_TYPE_PKCS7_GUID
    {
        return Err(AuthError::IncorrectCertType);
    }

    // the declared length covers the WIN_CERTIFICATE_UEFI_GUID struct plus
    // the PKCS#7 blob, and must lie within the buffer
    let wincert_len = auth_hdr.auth_info.header.length as usize;
    if wincert_len < size_of::<WIN_CERTIFICATE_UEFI_GUID>() {
        return Err(AuthError::InvalidWinCertHeader);
    }
    let after_time = &data[size_of::<EFI_TIME>()..];
    if after_time.len() < wincert_len {
        return Err(AuthError::NotEnoughCertData);
    }
    let (wincert_and_pkcs7, payload) = after_time.split_at(wincert_len);
    let pkcs7_data = &wincert_and_pkcs7[size_of::<WIN_CERTIFICATE_UEFI_GUID>()..];

    // validate timestamp according to spec
    let timestamp = auth_hdr.timestamp;
    if !timestamp.is_normalized() {
        return Err(AuthError::IncorrectTimestamp);
    }

    Ok(ParsedAuth2 {
        timestamp,
        pkcs7_data,
        payload,
    })
}
