//! Cryptographic operations to validate authenticated variables

use super::ParsedAuthVar;
use thiserror::Error;
use zerocopy::IntoBytes;

/// Errors that occur due to various formatting issues in the crypto objects.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("parsing signature list from key var")]
    SignatureList(#[from] uefi_sigdb::ParseError),
    #[error("decoding x509 cert from signature list")]
    SignatureListX509(#[source] openssl::error::ErrorStack),

    #[error("parsing auth var's pkcs7_data as pkcs#7 DER")]
    AuthVarPkcs7Der(#[source] openssl::error::ErrorStack),
    #[error("could not reconstruct signedData header for auth var's pkcs#7 data: {0}")]
    AuthVarPkcs7DerHeader(der::Error),
    #[error("could not extract digest algorithms from pkcs#7 data: {0}")]
    AuthVarPkcs7Digests(der::Error),
    #[error("pkcs#7 digest algorithm is not sha256")]
    UnsupportedDigest,
}

impl FormatError {
    /// Whether the error is due to malformed data in the trusted signature
    /// lists (as opposed to the guest-controlled auth descriptor).
    pub fn key_var_error(&self) -> bool {
        match self {
            FormatError::SignatureList(_) | FormatError::SignatureListX509(_) => true,
            FormatError::AuthVarPkcs7Der(_)
            | FormatError::AuthVarPkcs7DerHeader(_)
            | FormatError::AuthVarPkcs7Digests(_)
            | FormatError::UnsupportedDigest => false,
        }
    }
}

/// Authenticate the variable against the certs in the provided
/// signature_lists, returning `true` if the auth was successful.
pub fn authenticate_variable(
    signature_lists: &[u8],
    var: ParsedAuthVar<'_>,
) -> Result<bool, FormatError> {
    let ParsedAuthVar {
        name,
        vendor,
        attr,
        timestamp,
        pkcs7_data,
        var_data,
    } = var;

    // stage 1 - parse the pkcs7_data into an openssl Pkcs7 object
    let (var_pkcs7, pkcs7_der) = match openssl::pkcs7::Pkcs7::from_der(pkcs7_data) {
        Ok(pkcs7) => (pkcs7, std::borrow::Cow::Borrowed(pkcs7_data)),
        Err(_) => {
            // From UEFI spec 8.2.2 Using the EFI_VARIABLE_AUTHENTICATION_2 descriptor
            //
            // > Construct a DER-encoded SignedData structure per PKCS#7 version 1.5
            // > (RFC 2315), which shall be supported **both with and without**
            // > a DER-encoded ContentInfo structure per PKCS#7 version 1.5 [..]
            //
            // (emphasis mine)
            //
            // Yes, you read that right.
            //
            // The UEFI spec explicitly allows _malformed_ PKCS#7 payloads that
            // are missing a ContentInfo header. _sigh_

            // stage 1.5 - if parsing fails the first time, construct an
            // appropriate ContentInfo header and retry parsing the payload as
            // a PKCS#7 DER
            let buf = pkcs7_details::encapsulate_in_content_info(pkcs7_data)
                .map_err(FormatError::AuthVarPkcs7DerHeader)?;
            match openssl::pkcs7::Pkcs7::from_der(&buf) {
                Ok(pkcs7) => (pkcs7, std::borrow::Cow::Owned(buf)),
                // ...but if that also fails, there's nothing else we can do
                Err(e) => return Err(FormatError::AuthVarPkcs7Der(e)),
            }
        }
    };

    // stage 2 - the digest algorithm must be SHA-256, and nothing else
    {
        let digests = pkcs7_details::signed_data_digest_oids(&pkcs7_der)
            .map_err(FormatError::AuthVarPkcs7Digests)?;
        if digests.is_empty() || !digests.iter().all(|oid| *oid == pkcs7_details::SHA256_OID) {
            return Err(FormatError::UnsupportedDigest);
        }
    }

    // stage 3 - extract all the x509 certs from the signature list(s) into
    //           openssl x509 objects
    let certs = {
        let lists = uefi_sigdb::parse_signature_lists(signature_lists)?;
        let mut parsed_certs = Vec::new();
        for der in uefi_sigdb::x509_certs(&lists) {
            let cert =
                openssl::x509::X509::from_der(der).map_err(FormatError::SignatureListX509)?;
            parsed_certs.push(cert);
        }
        parsed_certs
    };

    // stage 4 - reconstruct the signed message
    //
    // See bullet point 2. in UEFI spec 8.2.2
    let mut verify_buf = Vec::new();
    verify_buf.extend(name.as_bytes_without_nul());
    verify_buf.extend(vendor.as_bytes());
    verify_buf.extend(attr.as_bytes());
    verify_buf.extend(timestamp.as_bytes());
    verify_buf.extend(var_data);

    // stage 5 - package the trusted certs into an openssl X509Store object
    let store = {
        let mut store = openssl::x509::store::X509StoreBuilder::new().unwrap();

        for cert in certs {
            store.add_cert(cert).unwrap();
        }

        // PARTIAL_CHAIN rationale: the certs in the EFI_SIGNATURE_LIST are not
        // root certs, and no full cert chain is available. Chain verification
        // terminates at whatever certs are present in the signature lists,
        // and never consults system CA roots.
        //
        // NO_CHECK_TIME rationale: enrolled signing certs routinely outlive
        // their validity window, and every deployed implementation accepts
        // them regardless.
        let store_flags = openssl::x509::verify::X509VerifyFlags::PARTIAL_CHAIN
            | openssl::x509::verify::X509VerifyFlags::NO_CHECK_TIME;
        store.set_flags(store_flags).unwrap();

        // X509Purpose::Any rationale: openssl expects the trusted certs to
        // have certain capabilities that enrolled certs do not. Omitting this
        // call results in "unsupported certificate purpose" failures.
        store
            .set_purpose(openssl::x509::X509PurposeId::ANY)
            .unwrap();

        store.build()
    };

    // stage 6 - actually perform the verification
    match var_pkcs7.verify(
        // `certs` should be nullable (i.e: represented using an optional).
        // This is an oversight in the openssl-rs API, so instead, we use an
        // empty stack...
        &openssl::stack::Stack::new().unwrap(),
        &store,
        Some(&verify_buf),
        None,
        openssl::pkcs7::Pkcs7Flags::empty(),
    ) {
        Ok(()) => Ok(true),
        Err(e) => {
            tracing::trace!(
                error = &e as &dyn std::error::Error,
                "could not verify auth var"
            );
            Ok(false)
        }
    }
}

mod pkcs7_details {
    use der::asn1::AnyRef;
    use der::asn1::ContextSpecific;
    use der::asn1::ObjectIdentifier;
    use der::Decode;
    use der::Encode;
    use der::Header;
    use der::Reader;
    use der::Sequence;
    use der::Tag;
    use der::TagMode;
    use der::TagNumber;

    /// id-sha256, from RFC 5754
    pub const SHA256_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");

    /// pkcs7-signedData, from RFC 2315 section 14
    const PKCS_7_SIGNED_DATA_OID: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.2");

    #[derive(Copy, Clone, Debug, Eq, PartialEq, Sequence)]
    struct ContentInfo<'a> {
        pub content_type: ObjectIdentifier,
        pub content: ContextSpecific<AnyRef<'a>>,
    }

    /// Construct a ASN.1 `ContentInfo` header with `ContentType = signedData`
    /// as specified by the PKCS#7 RFC2315.
    ///
    /// See https://datatracker.ietf.org/doc/html/rfc2315#section-7
    ///
    /// ```text
    /// ContentInfo ::= SEQUENCE {
    ///   contentType ContentType,
    ///   content
    ///     [0] EXPLICIT ANY DEFINED BY contentType OPTIONAL }
    /// ```
    pub fn encapsulate_in_content_info(content: &[u8]) -> der::Result<Vec<u8>> {
        let content_info = ContentInfo {
            content_type: PKCS_7_SIGNED_DATA_OID,
            content: ContextSpecific {
                tag_number: TagNumber::new(0),
                value: AnyRef::try_from(content)?,
                tag_mode: TagMode::Explicit,
            },
        };

        Encode::to_der(&content_info)
    }

    /// Walk a DER `ContentInfo(SignedData)` and extract the OIDs in the
    /// `digestAlgorithms` set.
    ///
    /// ```text
    /// SignedData ::= SEQUENCE {
    ///   version Version,
    ///   digestAlgorithms DigestAlgorithmIdentifiers,
    ///   ... }
    /// ```
    pub fn signed_data_digest_oids(buf: &[u8]) -> der::Result<Vec<ObjectIdentifier>> {
        let mut reader = der::SliceReader::new(buf)?;

        // ContentInfo ::= SEQUENCE
        let header = Header::decode(&mut reader)?;
        header.tag.assert_eq(Tag::Sequence)?;
        reader.read_nested(header.length, |r| {
            let content_type: ObjectIdentifier = r.decode()?;
            if content_type != PKCS_7_SIGNED_DATA_OID {
                return Err(Tag::ObjectIdentifier.value_error());
            }

            // content [0] EXPLICIT
            let header = Header::decode(r)?;
            header.tag.assert_eq(Tag::ContextSpecific {
                constructed: true,
                number: TagNumber::new(0),
            })?;
            r.read_nested(header.length, |r| {
                // SignedData ::= SEQUENCE
                let header = Header::decode(r)?;
                header.tag.assert_eq(Tag::Sequence)?;
                r.read_nested(header.length, |r| {
                    let _version: u8 = r.decode()?;

                    // digestAlgorithms ::= SET OF AlgorithmIdentifier
                    let header = Header::decode(r)?;
                    header.tag.assert_eq(Tag::Set)?;
                    let oids = r.read_nested(header.length, |r| {
                        let mut oids = Vec::new();
                        while !r.is_finished() {
                            // AlgorithmIdentifier ::= SEQUENCE { algorithm, parameters }
                            let header = Header::decode(r)?;
                            header.tag.assert_eq(Tag::Sequence)?;
                            let oid = r.read_nested(header.length, |r| {
                                let oid: ObjectIdentifier = r.decode()?;
                                skip_remaining(r)?;
                                Ok(oid)
                            })?;
                            oids.push(oid);
                        }
                        Ok(oids)
                    })?;

                    // certificates, crls, signerInfos, etc.
                    skip_remaining(r)?;
                    Ok(oids)
                })
            })
        })
    }

    fn skip_remaining<'a>(r: &mut impl Reader<'a>) -> der::Result<()> {
        while !r.is_finished() {
            let _: AnyRef<'_> = r.decode()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::pkcs7_details::signed_data_digest_oids;
    use super::pkcs7_details::SHA256_OID;

    // a ContentInfo(SignedData) with a single sha256 digestAlgorithm and
    // empty certificate/signerInfo sets
    const MINIMAL_SIGNED_DATA: &[u8] = &[
        0x30, 0x32, // ContentInfo SEQUENCE
        0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x02, // signedData OID
        0xa0, 0x25, // [0] EXPLICIT
        0x30, 0x23, // SignedData SEQUENCE
        0x02, 0x01, 0x01, // version 1
        0x31, 0x0f, // digestAlgorithms SET
        0x30, 0x0d, // AlgorithmIdentifier SEQUENCE
        0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01, // sha256 OID
        0x05, 0x00, // NULL params
        0x30, 0x0b, // contentInfo SEQUENCE
        0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x01, // data OID
        0x31, 0x00, // signerInfos SET (empty)
    ];

    #[test]
    fn extracts_digest_oids() {
        let oids = signed_data_digest_oids(MINIMAL_SIGNED_DATA).unwrap();
        assert_eq!(oids, vec![SHA256_OID]);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(signed_data_digest_oids(&[0xde, 0xad, 0xbe, 0xef]).is_err());
    }
}
