//! UEFI nvram variable services subsystem.
//!
//! The [`spec_services`] module implements the UEFI-spec-mandated variable
//! service semantics; this module layers the device-specific pieces on top:
//! decoding guest commands out of the BAR command buffer, and injecting
//! host-configured variables on first boot.

pub use spec_services::NvramError;
pub use spec_services::NvramResult;
pub use spec_services::SecureBootMode;
pub use spec_services::VariableServices;
pub use spec_services::VariableServicesExt;

use guid::Guid;
use thiserror::Error;
use uefi_specs::uefi::common::EfiStatus;
use uefi_specs::uefi::nvram::EfiVariableAttributes;
use uefi_specs::uefi::nvram::EFI_VARIABLE_AUTHENTICATION_2;
use uefi_specs::varstore::CommandDescriptor;
use uefi_specs::varstore::QueryInfoCommand;
use uefi_specs::varstore::VariableCommand;
use uefi_specs::varstore::VarstoreOp;
use varstore_storage::NvramStorage;
use varstore_storage::NvramStorageError;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

pub mod spec_services;

/// Errors which may occur while setting up the nvram store.
#[derive(Debug, Error)]
pub enum NvramSetupError {
    /// could not query the backing storage
    #[error("could not query backing nvram storage")]
    BadNvramStorage(#[source] NvramStorageError),
    /// a configured initial variable could not be written
    #[error("could not inject initial var '{0}': {1:?}")]
    InjectVar(String, EfiStatus, #[source] Option<NvramError>),
    /// the mode control variables could not be written
    #[error("could not initialize secure boot mode variables")]
    ModeVars(#[source] NvramStorageError),
}

/// A host-configured variable injected into the store on first boot.
///
/// Injection happens in list order, while authenticated-variable checks are
/// bypassed. When provisioning a secure boot hierarchy, PK must come last:
/// once PK lands, the store leaves setup mode.
#[derive(Debug, Clone)]
pub struct InitialVar {
    /// Vendor GUID.
    pub vendor: Guid,
    /// Variable name.
    pub name: String,
    /// Variable attributes.
    pub attr: u32,
    /// Variable payload. For TIME_BASED_AUTHENTICATED_WRITE_ACCESS variables
    /// this is the bare payload; a dummy authentication descriptor is
    /// prepended during injection.
    pub data: Vec<u8>,
}

/// The nvram service: guest command decoding over [`VariableServices`].
pub struct NvramServices {
    services: VariableServices<Box<dyn NvramStorage>>,
}

impl NvramServices {
    /// Construct the service, injecting `initial_vars` if the backing store
    /// has never been written.
    pub fn new(
        storage: Box<dyn NvramStorage>,
        initial_vars: &[InitialVar],
    ) -> Result<NvramServices, NvramSetupError> {
        let mut nvram = NvramServices {
            services: VariableServices::new(storage),
        };

        nvram.inject_vars_on_first_boot(initial_vars)?;
        nvram.services.prepare_for_boot();

        Ok(nvram)
    }

    /// Called when the VM resets.
    pub fn reset(&mut self) {
        self.services.reset();
        self.services.prepare_for_boot();
    }

    /// Access the underlying variable services (host-side reads, tests).
    pub fn services_mut(&mut self) -> &mut VariableServices<Box<dyn NvramStorage>> {
        &mut self.services
    }

    fn inject_vars_on_first_boot(
        &mut self,
        initial_vars: &[InitialVar],
    ) -> Result<(), NvramSetupError> {
        // "first boot" is marked by having no variables in storage
        if !self
            .services
            .is_empty()
            .map_err(NvramSetupError::BadNvramStorage)?
        {
            return Ok(());
        }

        tracing::info!("no NVRAM variables (first boot), loading initial values");

        self.services
            .sync_mode_vars()
            .map_err(NvramSetupError::ModeVars)?;

        for var in initial_vars {
            tracing::debug!(name = %var.name, "injecting initial var");

            let attr = EfiVariableAttributes::from(var.attr);
            let data = if attr.time_based_authenticated_write_access() {
                // authenticated variables always lead with a descriptor, even
                // though no validation is performed before the first PK lands
                let mut data =
                    Vec::with_capacity(size_of::<EFI_VARIABLE_AUTHENTICATION_2>() + var.data.len());
                data.extend_from_slice(EFI_VARIABLE_AUTHENTICATION_2::DUMMY.as_bytes());
                data.extend_from_slice(&var.data);
                data
            } else {
                var.data.clone()
            };

            self.services
                .set_variable(var.vendor, &var.name, var.attr, data)
                .map_err(|(status, err)| {
                    NvramSetupError::InjectVar(var.name.clone(), status, err)
                })?;
        }

        Ok(())
    }

    /// Execute the command currently in the BAR command buffer, writing
    /// responses (and the final status) back into the buffer.
    pub fn handle_command(&mut self, buf: &mut [u8]) {
        let Ok((desc, _)) = CommandDescriptor::read_from_prefix(&*buf) else {
            tracing::warn!("command buffer too small for command descriptor");
            return;
        };

        let status = self.handle_command_inner(desc.opcode, buf);

        if status != EfiStatus::SUCCESS {
            tracing::trace!(opcode = ?desc.opcode, ?status, "nvram status");
        }

        let desc = CommandDescriptor {
            opcode: desc.opcode,
            status: status.into(),
        };
        desc.write_to_prefix(buf)
            .expect("descriptor was read from this buffer");
    }

    fn handle_command_inner(&mut self, opcode: VarstoreOp, buf: &mut [u8]) -> EfiStatus {
        let body = &mut buf[size_of::<CommandDescriptor>()..];

        let (status, err) = match opcode {
            VarstoreOp::GET_VARIABLE => {
                let Some((mut cmd, name_region, data_region)) = split_variable_command(body)
                else {
                    return EfiStatus::INVALID_PARAMETER;
                };
                let name = name_region.to_vec();

                let NvramResult(data, status, err) = self.services.uefi_get_variable(
                    Some(&name),
                    cmd.vendor,
                    &mut cmd.attributes,
                    &mut cmd.data_bytes,
                    false,
                );

                // bounds were validated within `uefi_get_variable`
                if let Some(data) = &data {
                    data_region[..data.len()].copy_from_slice(data);
                }
                cmd.write_to_prefix(body).unwrap();

                (status, err)
            }
            VarstoreOp::SET_VARIABLE => {
                let Some((cmd, name_region, data_region)) = split_variable_command(body) else {
                    return EfiStatus::INVALID_PARAMETER;
                };
                let name = name_region.to_vec();
                let data = data_region[..cmd.data_bytes as usize].to_vec();

                let NvramResult((), status, err) = self.services.uefi_set_variable(
                    Some(&name),
                    cmd.vendor,
                    cmd.attributes,
                    cmd.data_bytes,
                    Some(data),
                );

                (status, err)
            }
            VarstoreOp::GET_NEXT_VARIABLE_NAME => {
                let Some((mut cmd, name_region, _)) = split_variable_command(body) else {
                    return EfiStatus::INVALID_PARAMETER;
                };
                let name = name_region.to_vec();

                let NvramResult(next, status, err) = self.services.uefi_get_next_variable(
                    &mut cmd.name_bytes,
                    Some(&name),
                    cmd.vendor,
                );

                // bounds were validated within `uefi_get_next_variable`
                if let Some((next_name, vendor)) = next {
                    cmd.vendor = vendor;
                    name_region[..next_name.len()].copy_from_slice(&next_name);
                }
                cmd.write_to_prefix(body).unwrap();

                (status, err)
            }
            VarstoreOp::QUERY_VARIABLE_INFO => {
                let Ok((mut cmd, _)) = QueryInfoCommand::read_from_prefix(&*body) else {
                    return EfiStatus::INVALID_PARAMETER;
                };

                let NvramResult(info, status, err) =
                    self.services.uefi_query_variable_info(cmd.attributes);

                if let Some((max_storage, remaining, max_var)) = info {
                    cmd.maximum_variable_storage = max_storage.into();
                    cmd.remaining_variable_storage = remaining.into();
                    cmd.maximum_variable_size = max_var.into();
                    cmd.write_to_prefix(body).unwrap();
                }

                (status, err)
            }
            VarstoreOp::EXIT_BOOT_SERVICES => {
                self.services.exit_boot_services();
                (EfiStatus::SUCCESS, None)
            }
            opcode => {
                tracing::warn!(?opcode, "unknown nvram command");
                (EfiStatus::UNSUPPORTED, None)
            }
        };

        if let Some(err) = err {
            let err: &(dyn std::error::Error + 'static) = &err;
            tracing::warn!(?opcode, ?status, error = err, "nvram error");
        }

        status
    }
}

/// Split a command body into its [`VariableCommand`] header, name region, and
/// data region, validating the declared lengths against the buffer.
fn split_variable_command(body: &mut [u8]) -> Option<(VariableCommand, &mut [u8], &mut [u8])> {
    let (cmd, _) = VariableCommand::read_from_prefix(&*body).ok()?;
    let name_bytes = cmd.name_bytes as usize;
    let data_bytes = cmd.data_bytes as usize;

    let rest = &mut body[size_of::<VariableCommand>()..];
    if name_bytes > rest.len() || data_bytes > rest.len() - name_bytes {
        return None;
    }

    let (name_region, data_region) = rest.split_at_mut(name_bytes);
    Some((cmd, name_region, data_region))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ucs2::Ucs2LeVec;
    use varstore_storage::in_memory::InMemoryNvram;
    use zerocopy::LittleEndian;
    use zerocopy::U64;

    fn make_services() -> NvramServices {
        NvramServices::new(Box::new(InMemoryNvram::new()), &[]).unwrap()
    }

    fn ucs2(name: &str) -> Vec<u8> {
        Ucs2LeVec::from(name).into_inner()
    }

    /// Build a command buffer: descriptor, variable command, name region,
    /// data region (data padded out to `data_capacity`).
    fn variable_command_buf(
        opcode: VarstoreOp,
        vendor: Guid,
        attributes: u32,
        name: &[u8],
        data: &[u8],
        data_capacity: usize,
    ) -> Vec<u8> {
        assert!(data.len() <= data_capacity);
        let mut buf = Vec::new();
        buf.extend_from_slice(
            CommandDescriptor {
                opcode,
                status: EfiStatus::SUCCESS.into(),
            }
            .as_bytes(),
        );
        buf.extend_from_slice(
            VariableCommand {
                vendor,
                attributes,
                name_bytes: name.len() as u32,
                data_bytes: data_capacity as u32,
            }
            .as_bytes(),
        );
        buf.extend_from_slice(name);
        buf.extend_from_slice(data);
        buf.resize(buf.len() + (data_capacity - data.len()), 0);
        buf
    }

    fn parse_response(buf: &[u8]) -> (EfiStatus, VariableCommand, &[u8]) {
        let (desc, rest) = CommandDescriptor::read_from_prefix(buf).unwrap();
        let (cmd, rest) = VariableCommand::read_from_prefix(rest).unwrap();
        (desc.status.into(), cmd, &rest[cmd.name_bytes as usize..])
    }

    #[test]
    fn set_then_get() {
        let mut nvram = make_services();
        let vendor = Guid::new_random();
        let name = ucs2("TestVar");
        let attr = EfiVariableAttributes::DEFAULT_ATTRIBUTES.into();

        let mut buf = variable_command_buf(
            VarstoreOp::SET_VARIABLE,
            vendor,
            attr,
            &name,
            b"hello",
            5,
        );
        nvram.handle_command(&mut buf);
        let (status, _, _) = parse_response(&buf);
        assert_eq!(status, EfiStatus::SUCCESS);

        let mut buf =
            variable_command_buf(VarstoreOp::GET_VARIABLE, vendor, 0, &name, &[], 64);
        nvram.handle_command(&mut buf);
        let (status, cmd, data) = parse_response(&buf);
        assert_eq!(status, EfiStatus::SUCCESS);
        assert_eq!(cmd.attributes, attr);
        assert_eq!(cmd.data_bytes, 5);
        assert_eq!(&data[..5], b"hello");
    }

    #[test]
    fn get_missing_is_not_found() {
        let mut nvram = make_services();
        let mut buf = variable_command_buf(
            VarstoreOp::GET_VARIABLE,
            Guid::new_random(),
            0,
            &ucs2("Nope"),
            &[],
            16,
        );
        nvram.handle_command(&mut buf);
        let (status, _, _) = parse_response(&buf);
        assert_eq!(status, EfiStatus::NOT_FOUND);
    }

    #[test]
    fn short_output_buffer_reports_required_size() {
        let mut nvram = make_services();
        let vendor = Guid::new_random();
        let name = ucs2("BigVar");
        let attr = EfiVariableAttributes::DEFAULT_ATTRIBUTES.into();
        let payload = [0xab; 100];

        let mut buf = variable_command_buf(
            VarstoreOp::SET_VARIABLE,
            vendor,
            attr,
            &name,
            &payload,
            payload.len(),
        );
        nvram.handle_command(&mut buf);
        assert_eq!(parse_response(&buf).0, EfiStatus::SUCCESS);

        // only give the response 10 bytes of room
        let mut buf = variable_command_buf(VarstoreOp::GET_VARIABLE, vendor, 0, &name, &[], 10);
        nvram.handle_command(&mut buf);
        let (status, cmd, _) = parse_response(&buf);
        assert_eq!(status, EfiStatus::BUFFER_TOO_SMALL);
        assert_eq!(cmd.data_bytes, 100);
    }

    #[test]
    fn enumeration_walks_every_var() {
        let mut nvram = make_services();
        let vendor = Guid::new_random();
        let attr = EfiVariableAttributes::DEFAULT_ATTRIBUTES.into();

        for name in ["alpha", "beta", "gamma"] {
            let mut buf = variable_command_buf(
                VarstoreOp::SET_VARIABLE,
                vendor,
                attr,
                &ucs2(name),
                b"x",
                1,
            );
            nvram.handle_command(&mut buf);
            assert_eq!(parse_response(&buf).0, EfiStatus::SUCCESS);
        }

        // the mode control variables are also present; collect everything
        let mut seen = Vec::new();
        let mut prev = ucs2("");
        let mut prev_vendor = Guid::default();
        loop {
            let mut region = prev.clone();
            region.resize(512, 0);
            let mut buf = variable_command_buf(
                VarstoreOp::GET_NEXT_VARIABLE_NAME,
                prev_vendor,
                0,
                &region,
                &[],
                0,
            );
            nvram.handle_command(&mut buf);
            let (status, cmd, _) = parse_response(&buf);
            if status == EfiStatus::NOT_FOUND {
                break;
            }
            assert_eq!(status, EfiStatus::SUCCESS);

            let (_, rest) = CommandDescriptor::read_from_prefix(&buf[..]).unwrap();
            let (_, name_region) = VariableCommand::read_from_prefix(rest).unwrap();
            let name = ucs2::Ucs2LeSlice::from_slice_with_nul(&name_region[..512])
                .unwrap()
                .to_ucs2_le_vec();
            prev = name.as_bytes().to_vec();
            prev_vendor = cmd.vendor;
            seen.push(name.to_string());
        }

        for expected in ["alpha", "beta", "gamma", "SecureBoot", "SetupMode"] {
            assert!(seen.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn query_variable_info() {
        let mut nvram = make_services();

        let mut buf = Vec::new();
        buf.extend_from_slice(
            CommandDescriptor {
                opcode: VarstoreOp::QUERY_VARIABLE_INFO,
                status: EfiStatus::SUCCESS.into(),
            }
            .as_bytes(),
        );
        buf.extend_from_slice(
            QueryInfoCommand {
                attributes: EfiVariableAttributes::DEFAULT_ATTRIBUTES.into(),
                maximum_variable_storage: U64::<LittleEndian>::new(0),
                remaining_variable_storage: U64::<LittleEndian>::new(0),
                maximum_variable_size: U64::<LittleEndian>::new(0),
            }
            .as_bytes(),
        );

        nvram.handle_command(&mut buf);

        let (desc, rest) = CommandDescriptor::read_from_prefix(&buf[..]).unwrap();
        let (cmd, _) = QueryInfoCommand::read_from_prefix(rest).unwrap();
        assert_eq!(EfiStatus::from(desc.status), EfiStatus::SUCCESS);
        assert_eq!(cmd.maximum_variable_storage.get(), 64 * 1024);
        assert_eq!(cmd.maximum_variable_size.get(), 32 * 1024);
        // the mode control variables already consume a few bytes
        assert!(cmd.remaining_variable_storage.get() < 64 * 1024);
    }

    #[test]
    fn runtime_write_protect() {
        let mut nvram = make_services();
        let vendor = Guid::new_random();
        let bs_only: u32 = EfiVariableAttributes::new()
            .with_non_volatile(true)
            .with_bootservice_access(true)
            .into();

        let mut buf = variable_command_buf(
            VarstoreOp::SET_VARIABLE,
            vendor,
            bs_only,
            &ucs2("BootOnly"),
            b"data",
            4,
        );
        nvram.handle_command(&mut buf);
        assert_eq!(parse_response(&buf).0, EfiStatus::SUCCESS);

        // signal ExitBootServices
        let mut buf = Vec::new();
        buf.extend_from_slice(
            CommandDescriptor {
                opcode: VarstoreOp::EXIT_BOOT_SERVICES,
                status: EfiStatus::SUCCESS.into(),
            }
            .as_bytes(),
        );
        nvram.handle_command(&mut buf);
        let (desc, _) = CommandDescriptor::read_from_prefix(&buf[..]).unwrap();
        assert_eq!(EfiStatus::from(desc.status), EfiStatus::SUCCESS);

        // boot-services-only variables can no longer be written...
        let mut buf = variable_command_buf(
            VarstoreOp::SET_VARIABLE,
            vendor,
            bs_only,
            &ucs2("BootOnly"),
            b"datb",
            4,
        );
        nvram.handle_command(&mut buf);
        assert_eq!(parse_response(&buf).0, EfiStatus::WRITE_PROTECTED);

        // ...or read
        let mut buf =
            variable_command_buf(VarstoreOp::GET_VARIABLE, vendor, 0, &ucs2("BootOnly"), &[], 16);
        nvram.handle_command(&mut buf);
        assert_eq!(parse_response(&buf).0, EfiStatus::NOT_FOUND);
    }

    #[test]
    fn unknown_opcode() {
        let mut nvram = make_services();
        let mut buf = Vec::new();
        buf.extend_from_slice(
            CommandDescriptor {
                opcode: VarstoreOp(0x99),
                status: EfiStatus::SUCCESS.into(),
            }
            .as_bytes(),
        );
        nvram.handle_command(&mut buf);
        let (desc, _) = CommandDescriptor::read_from_prefix(&buf[..]).unwrap();
        assert_eq!(EfiStatus::from(desc.status), EfiStatus::UNSUPPORTED);
    }

    #[test]
    fn malformed_lengths_rejected() {
        let mut nvram = make_services();
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
                vendor: Guid::new_random(),
                attributes: EfiVariableAttributes::DEFAULT_ATTRIBUTES.into(),
                // name length escapes the buffer
                name_bytes: 0x1000,
                data_bytes: 0,
            }
            .as_bytes(),
        );
        nvram.handle_command(&mut buf);
        let (desc, _) = CommandDescriptor::read_from_prefix(&buf[..]).unwrap();
        assert_eq!(EfiStatus::from(desc.status), EfiStatus::INVALID_PARAMETER);
    }

    #[test]
    fn first_boot_injection() {
        let vendor = Guid::new_random();
        let mut nvram = NvramServices::new(
            Box::new(InMemoryNvram::new()),
            &[InitialVar {
                vendor,
                name: "OemConfig".into(),
                attr: EfiVariableAttributes::DEFAULT_ATTRIBUTES.into(),
                data: vec![1, 2, 3],
            }],
        )
        .unwrap();

        let (_, data) = nvram
            .services_mut()
            .get_variable(vendor, "OemConfig")
            .unwrap();
        assert_eq!(data, vec![1, 2, 3]);

        // mode variables were derived: no PK means setup mode
        let (_, data) = nvram
            .services_mut()
            .get_variable(
                uefi_specs::uefi::nvram::vars::EFI_GLOBAL_VARIABLE,
                "SetupMode",
            )
            .unwrap();
        assert_eq!(data, vec![1]);
    }
}
