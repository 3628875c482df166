//! Build-time generation of authenticated variable payloads.
//!
//! An "auth" file contains an `EFI_VARIABLE_AUTHENTICATION_2` descriptor, a
//! detached PKCS#7 signature, and an `EFI_SIGNATURE_LIST` payload, and is
//! used to provision secure variables (PK, KEK, db, ...) during VM start.
//! Auth files are prepared at build time because the private key used to
//! sign the data is ephemeral.

#![forbid(unsafe_code)]

use guid::Guid;
use openssl::pkcs7::Pkcs7;
use openssl::pkcs7::Pkcs7Flags;
use openssl::pkey::PKey;
use openssl::pkey::Private;
use openssl::stack::Stack;
use openssl::x509::X509;
use thiserror::Error;
use ucs2::Ucs2LeVec;
use uefi_sigdb::SignatureList;
use uefi_specs::uefi::nvram::EFI_VARIABLE_AUTHENTICATION_2;
use uefi_specs::uefi::signing::EFI_CERT_TYPE_PKCS7_GUID;
use uefi_specs::uefi::signing::WIN_CERTIFICATE;
use uefi_specs::uefi::signing::WIN_CERTIFICATE_UEFI_GUID;
use uefi_specs::uefi::signing::WIN_CERT_REVISION;
use uefi_specs::uefi::signing::WIN_CERT_TYPE_EFI_GUID;
use uefi_specs::uefi::time::EFI_TIME;
use zerocopy::IntoBytes;

/// Vendor GUID used by the enrolled platform key.
pub const PLATFORM_VENDOR_GUID: Guid = Guid::from_static_str("e4e47095-7c03-4dab-ae10-8f4e22e9e7de");

/// Microsoft's vendor GUID, used as the signature owner for KEK/db/dbx.
pub const MICROSOFT_VENDOR_GUID: Guid = Guid::from_static_str("77fa9abd-0359-4d32-bd60-28f4e78f784b");

/// Errors building an auth payload.
#[derive(Debug, Error)]
pub enum AuthGenError {
    /// openssl failure
    #[error("crypto error")]
    Crypto(#[from] openssl::error::ErrorStack),
}

/// Convert X.509 certificates into a buffer of `EFI_SIGNATURE_LIST`s, one
/// single-cert list per certificate, each owned by `owner`.
pub fn certs_to_signature_lists(certs: &[X509], owner: Guid) -> Result<Vec<u8>, AuthGenError> {
    let mut lists = Vec::with_capacity(certs.len());
    for cert in certs {
        lists.push(SignatureList::X509 {
            owner,
            cert: cert.to_der()?.into(),
        });
    }
    Ok(uefi_sigdb::write_signature_lists(&lists))
}

/// Build a complete authenticated write blob for SetVariable:
/// `EFI_VARIABLE_AUTHENTICATION_2 descriptor || PKCS#7 DER || payload`.
///
/// The signed message is `name (UCS-2, no terminator) || vendor ||
/// attributes || timestamp || payload`, signed detached with SHA-256 and no
/// signed attributes. With no `signer`, the descriptor carries an empty
/// signature (only accepted while the target store is in setup mode).
pub fn signed_variable_update(
    name: &str,
    vendor: Guid,
    attributes: u32,
    timestamp: EFI_TIME,
    payload: &[u8],
    signer: Option<(&X509, &PKey<Private>)>,
) -> Result<Vec<u8>, AuthGenError> {
    let signature = match signer {
        Some((cert, key)) => {
            let name = Ucs2LeVec::from(name);

            let mut message = Vec::new();
            message.extend_from_slice(name.as_bytes_without_nul());
            message.extend_from_slice(vendor.as_bytes());
            message.extend_from_slice(attributes.as_bytes());
            message.extend_from_slice(timestamp.as_bytes());
            message.extend_from_slice(payload);

            let certs = Stack::new()?;
            let pkcs7 = Pkcs7::sign(
                cert,
                key,
                &certs,
                &message,
                Pkcs7Flags::BINARY | Pkcs7Flags::DETACHED | Pkcs7Flags::NOATTR,
            )?;
            pkcs7.to_der()?
        }
        None => Vec::new(),
    };

    let descriptor = EFI_VARIABLE_AUTHENTICATION_2 {
        timestamp,
        auth_info: WIN_CERTIFICATE_UEFI_GUID {
            header: WIN_CERTIFICATE {
                length: (size_of::<WIN_CERTIFICATE_UEFI_GUID>() + signature.len()) as u32,
                revision: WIN_CERT_REVISION,
                certificate_type: WIN_CERT_TYPE_EFI_GUID,
            },
            cert_type: EFI_CERT_TYPE_PKCS7_GUID,
        },
    };

    let mut out = Vec::new();
    out.extend_from_slice(descriptor.as_bytes());
    out.extend_from_slice(&signature);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Generate an ephemeral RSA-2048 signing identity: a private key and a
/// self-signed certificate with the given common name.
pub fn generate_signing_identity(
    common_name: &str,
) -> Result<(PKey<Private>, X509), AuthGenError> {
    let key = PKey::from_rsa(openssl::rsa::Rsa::generate(2048)?)?;

    let name = {
        let mut name = openssl::x509::X509NameBuilder::new()?;
        name.append_entry_by_text("CN", common_name)?;
        name.build()
    };

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&key)?;
    builder.set_serial_number(
        openssl::bn::BigNum::from_u32(1)?
            .to_asn1_integer()?
            .as_ref(),
    )?;
    builder.set_not_before(openssl::asn1::Asn1Time::days_from_now(0)?.as_ref())?;
    builder.set_not_after(openssl::asn1::Asn1Time::days_from_now(3650)?.as_ref())?;
    builder.sign(&key, openssl::hash::MessageDigest::sha256())?;

    Ok((key, builder.build()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uefi_specs::uefi::nvram::EfiVariableAttributes;
    use zerocopy::FromBytes;

    #[test]
    fn blob_layout() {
        let (key, cert) = generate_signing_identity("test signer").unwrap();
        let payload = certs_to_signature_lists(&[cert.clone()], MICROSOFT_VENDOR_GUID).unwrap();

        let timestamp = EFI_TIME {
            year: 2024,
            month: 6,
            day: 1,
            ..EFI_TIME::ZEROED
        };

        let blob = signed_variable_update(
            "db",
            uefi_specs::uefi::nvram::vars::IMAGE_SECURITY_DATABASE_GUID,
            EfiVariableAttributes::DEFAULT_ATTRIBUTES_TIME_BASED_AUTH.into(),
            timestamp,
            &payload,
            Some((&cert, &key)),
        )
        .unwrap();

        // descriptor leads the blob and its declared length lines up with
        // the trailing payload
        let (descriptor, rest) = EFI_VARIABLE_AUTHENTICATION_2::read_from_prefix(&blob[..]).unwrap();
        assert_eq!(descriptor.timestamp, timestamp);
        assert_eq!(
            descriptor.auth_info.header.certificate_type,
            WIN_CERT_TYPE_EFI_GUID
        );

        let sig_len =
            descriptor.auth_info.header.length as usize - size_of::<WIN_CERTIFICATE_UEFI_GUID>();
        assert_eq!(&rest[sig_len..], &payload[..]);

        // the signature parses as PKCS#7
        Pkcs7::from_der(&rest[..sig_len]).unwrap();
    }

    #[test]
    fn unsigned_blob_has_empty_signature() {
        let blob = signed_variable_update(
            "PK",
            uefi_specs::uefi::nvram::vars::EFI_GLOBAL_VARIABLE,
            EfiVariableAttributes::DEFAULT_ATTRIBUTES_TIME_BASED_AUTH.into(),
            EFI_TIME::ZEROED,
            b"payload",
            None,
        )
        .unwrap();

        let (descriptor, rest) = EFI_VARIABLE_AUTHENTICATION_2::read_from_prefix(&blob[..]).unwrap();
        assert_eq!(
            descriptor.auth_info.header.length as usize,
            size_of::<WIN_CERTIFICATE_UEFI_GUID>()
        );
        assert_eq!(rest, b"payload");
    }
}
