//! Code to parse, manipulate, and emit [`EFI_SIGNATURE_LIST`] structures.
//!
//! Signature database variables (db, dbx, KEK, ...) hold a concatenation of
//! `EFI_SIGNATURE_LIST` containers, each holding uniformly-sized entries of a
//! single signature type. This crate turns such buffers into typed
//! [`SignatureList`] values and back, with every length field checked against
//! the containing slice before descent.

#![forbid(unsafe_code)]

use guid::Guid;
use std::borrow::Cow;
use std::collections::BTreeSet;
use thiserror::Error;
use uefi_specs::uefi::nvram::signature_list::EFI_CERT_SHA256_GUID;
use uefi_specs::uefi::nvram::signature_list::EFI_CERT_X509_GUID;
use uefi_specs::uefi::nvram::signature_list::EFI_SIGNATURE_DATA;
use uefi_specs::uefi::nvram::signature_list::EFI_SIGNATURE_LIST;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Errors which may occur during `EFI_SIGNATURE_LIST` parsing.
#[derive(Debug, Error)]
pub enum ParseError {
    /// buffer too short for the EFI_SIGNATURE_LIST header
    #[error("could not read signature list header")]
    TruncatedHeader,
    /// signature_list_size is smaller than the header itself
    #[error("signature_list_size too small: {0}")]
    ListSizeTooSmall(u32),
    /// buffer contains less data than signature_list_size
    #[error("buffer contains less data than specified in EFI_SIGNATURE_LIST header")]
    TruncatedData,
    /// signature_header_size escapes the list
    #[error("signature_header_size too large: {0}")]
    HeaderSizeTooLarge(u32),
    /// signature_size cannot hold an EFI_SIGNATURE_DATA header
    #[error("signature_size too small: {0}")]
    SignatureSizeTooSmall(u32),
    /// entry area is not a whole number of signature_size entries
    #[error("signature data area is not a multiple of signature_size")]
    UnevenSignatureData,
    /// sha256 entries must be exactly 32 bytes + owner
    #[error("invalid signature_size for sha256 entries: {0}")]
    Sha256InvalidSigSize(u32),
    /// this implementation assumes a single cert per x509 list
    #[error("x509 signature list does not contain exactly one cert")]
    X509NotSingleCert,
}

/// One parsed `EFI_SIGNATURE_LIST`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureList<'a> {
    /// A list of SHA-256 digests, as `(owner, digest)` pairs.
    Sha256(Vec<(Guid, Cow<'a, [u8; 32]>)>),
    /// A single X.509 (DER) certificate.
    ///
    /// The UEFI spec _technically_ allows stuffing multiple certs into one list,
    /// but that requires the certs to have exactly the same length, which
    /// never happens in practice. Producers (including this workspace's
    /// signing tool) emit one list per cert.
    X509 {
        /// Agent which added this cert.
        owner: Guid,
        /// DER-encoded certificate.
        cert: Cow<'a, [u8]>,
    },
    /// A list with an unrecognized signature type, preserved whole (header
    /// included) but not interpreted.
    Opaque(Cow<'a, [u8]>),
}

impl<'a> SignatureList<'a> {
    /// The signature type GUID this list serializes under.
    pub fn signature_type(&self) -> Guid {
        match self {
            SignatureList::Sha256(_) => EFI_CERT_SHA256_GUID,
            SignatureList::X509 { .. } => EFI_CERT_X509_GUID,
            SignatureList::Opaque(raw) => {
                // infallible: Opaque is only constructed from a validated list
                let (header, _) = EFI_SIGNATURE_LIST::read_from_prefix(raw).unwrap();
                header.signature_type
            }
        }
    }

    /// Serialize the list as an `EFI_SIGNATURE_LIST` into `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        let (sig_data_len, count) = match self {
            SignatureList::Sha256(sigs) => (32, sigs.len()),
            SignatureList::X509 { cert, .. } => (cert.len(), 1),
            SignatureList::Opaque(raw) => {
                out.extend_from_slice(raw);
                return;
            }
        };

        let signature_size = size_of::<EFI_SIGNATURE_DATA>() + sig_data_len;
        let header = EFI_SIGNATURE_LIST {
            signature_type: self.signature_type(),
            signature_list_size: (size_of::<EFI_SIGNATURE_LIST>() + signature_size * count) as u32,
            signature_header_size: 0, // always zero
            signature_size: signature_size as u32,
        };
        out.extend_from_slice(header.as_bytes());

        match self {
            SignatureList::Sha256(sigs) => {
                for (owner, digest) in sigs {
                    out.extend_from_slice(owner.as_bytes());
                    out.extend_from_slice(digest.as_bytes());
                }
            }
            SignatureList::X509 { owner, cert } => {
                out.extend_from_slice(owner.as_bytes());
                out.extend_from_slice(cert);
            }
            SignatureList::Opaque(_) => unreachable!(),
        }
    }

    /// Drop entries for which `keep` returns false, returning `None` if no
    /// entries survive. Opaque lists are kept or dropped as a unit.
    pub fn filter_entries<F>(self, mut keep: F) -> Option<SignatureList<'a>>
    where
        F: FnMut(&SignatureKey<'_>) -> bool,
    {
        match self {
            SignatureList::Sha256(sigs) => {
                let sigs: Vec<_> = sigs
                    .into_iter()
                    .filter(|(owner, digest)| {
                        keep(&SignatureKey {
                            signature_type: EFI_CERT_SHA256_GUID,
                            owner: *owner,
                            data: Cow::Borrowed(digest.as_ref()),
                        })
                    })
                    .collect();
                (!sigs.is_empty()).then_some(SignatureList::Sha256(sigs))
            }
            SignatureList::X509 { owner, cert } => keep(&SignatureKey {
                signature_type: EFI_CERT_X509_GUID,
                owner,
                data: Cow::Borrowed(&cert),
            })
            .then_some(SignatureList::X509 { owner, cert }),
            SignatureList::Opaque(raw) => keep(&SignatureKey {
                signature_type: Guid::ZERO,
                owner: Guid::ZERO,
                data: Cow::Borrowed(&raw),
            })
            .then_some(SignatureList::Opaque(raw)),
        }
    }

    /// Visit every entry in the list as a [`SignatureKey`].
    pub fn keys(&self) -> Vec<SignatureKey<'_>> {
        match self {
            SignatureList::Sha256(sigs) => sigs
                .iter()
                .map(|(owner, digest)| SignatureKey {
                    signature_type: EFI_CERT_SHA256_GUID,
                    owner: *owner,
                    data: Cow::Borrowed(digest.as_ref()),
                })
                .collect(),
            SignatureList::X509 { owner, cert } => vec![SignatureKey {
                signature_type: EFI_CERT_X509_GUID,
                owner: *owner,
                data: Cow::Borrowed(cert),
            }],
            SignatureList::Opaque(raw) => vec![SignatureKey {
                signature_type: Guid::ZERO,
                owner: Guid::ZERO,
                data: Cow::Borrowed(raw),
            }],
        }
    }
}

/// Identity of a single signature entry, used to deduplicate appends.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SignatureKey<'a> {
    /// The containing list's signature type.
    pub signature_type: Guid,
    /// EFI_SIGNATURE_DATA.SignatureOwner.
    pub owner: Guid,
    /// The entry payload bytes.
    pub data: Cow<'a, [u8]>,
}

impl SignatureKey<'_> {
    pub fn into_owned(self) -> SignatureKey<'static> {
        SignatureKey {
            signature_type: self.signature_type,
            owner: self.owner,
            data: Cow::Owned(self.data.into_owned()),
        }
    }
}

/// Parse a buffer of concatenated `EFI_SIGNATURE_LIST`s.
pub fn parse_signature_lists(buf: &[u8]) -> Result<Vec<SignatureList<'_>>, ParseError> {
    let mut lists = Vec::new();
    let mut buf = buf;
    while !buf.is_empty() {
        let (list, rest) = parse_one_list(buf)?;
        lists.push(list);
        buf = rest;
    }
    Ok(lists)
}

/// Collect every entry of every list into a set, for dedup checks.
pub fn signature_set(lists: &[SignatureList<'_>]) -> BTreeSet<SignatureKey<'static>> {
    lists
        .iter()
        .flat_map(|l| l.keys())
        .map(SignatureKey::into_owned)
        .collect()
}

/// Extract the DER bytes of every X.509 cert across all lists.
pub fn x509_certs<'a>(lists: &'a [SignatureList<'_>]) -> impl Iterator<Item = &'a [u8]> {
    lists.iter().filter_map(|l| match l {
        SignatureList::X509 { cert, .. } => Some(&**cert),
        _ => None,
    })
}

/// Serialize a series of lists back into spec format.
pub fn write_signature_lists(lists: &[SignatureList<'_>]) -> Vec<u8> {
    let mut out = Vec::new();
    for list in lists {
        list.write_to(&mut out);
    }
    out
}

fn parse_one_list(buf: &[u8]) -> Result<(SignatureList<'_>, &[u8]), ParseError> {
    let (header, _) =
        EFI_SIGNATURE_LIST::read_from_prefix(buf).map_err(|_| ParseError::TruncatedHeader)?;

    let header_len = size_of::<EFI_SIGNATURE_LIST>();
    let list_size = header.signature_list_size as usize;
    if list_size < header_len {
        return Err(ParseError::ListSizeTooSmall(header.signature_list_size));
    }
    if buf.len() < list_size {
        return Err(ParseError::TruncatedData);
    }
    let (list_buf, rest) = buf.split_at(list_size);

    // SignatureHeaderSize opaque bytes precede the entry array. In practice
    // this is always zero, but the wire format says to skip it.
    let entries_buf = &list_buf[header_len..];
    let sig_header_size = header.signature_header_size as usize;
    if sig_header_size > entries_buf.len() {
        return Err(ParseError::HeaderSizeTooLarge(header.signature_header_size));
    }
    let entries_buf = &entries_buf[sig_header_size..];

    // Unrecognized signature types are preserved whole, entries uninterpreted.
    let sig_size = header.signature_size as usize;
    let list = match header.signature_type {
        EFI_CERT_SHA256_GUID => {
            if sig_size != size_of::<EFI_SIGNATURE_DATA>() + 32 {
                return Err(ParseError::Sha256InvalidSigSize(header.signature_size));
            }
            if entries_buf.len() % sig_size != 0 {
                return Err(ParseError::UnevenSignatureData);
            }
            let mut sigs = Vec::with_capacity(entries_buf.len() / sig_size);
            for entry in entries_buf.chunks_exact(sig_size) {
                let (data_header, digest) = EFI_SIGNATURE_DATA::read_from_prefix(entry)
                    .expect("sig_size validated above");
                let digest: &[u8; 32] = digest.try_into().unwrap();
                sigs.push((data_header.signature_owner, Cow::Borrowed(digest)));
            }
            SignatureList::Sha256(sigs)
        }
        EFI_CERT_X509_GUID => {
            if sig_size < size_of::<EFI_SIGNATURE_DATA>() {
                return Err(ParseError::SignatureSizeTooSmall(header.signature_size));
            }
            if entries_buf.len() != sig_size {
                return Err(ParseError::X509NotSingleCert);
            }
            let (data_header, cert) = EFI_SIGNATURE_DATA::read_from_prefix(entries_buf)
                .expect("sig_size validated above");
            SignatureList::X509 {
                owner: data_header.signature_owner,
                cert: Cow::Borrowed(cert),
            }
        }
        _ => SignatureList::Opaque(Cow::Borrowed(list_buf)),
    };

    Ok((list, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER_1: Guid = Guid::from_static_str("00000001-0000-0000-0000-000000000000");
    const OWNER_2: Guid = Guid::from_static_str("00000002-0000-0000-0000-000000000000");

    fn test_lists() -> Vec<SignatureList<'static>> {
        vec![
            SignatureList::Sha256(vec![
                (OWNER_1, Cow::Owned([0; 32])),
                (OWNER_2, Cow::Owned([1; 32])),
                (OWNER_1, Cow::Owned([2; 32])),
            ]),
            SignatureList::X509 {
                owner: OWNER_2,
                cert: b"some cert data"[..].into(),
            },
            SignatureList::Sha256(vec![(OWNER_1, Cow::Owned([0; 32]))]),
            SignatureList::X509 {
                owner: OWNER_1,
                cert: b"more cert data"[..].into(),
            },
        ]
    }

    #[test]
    fn round_trip() {
        let lists = test_lists();
        let buf = write_signature_lists(&lists);
        let reparsed = parse_signature_lists(&buf).unwrap();
        assert_eq!(lists, reparsed);
    }

    #[test]
    fn filter_by_owner() {
        let buf = write_signature_lists(&test_lists());
        let filtered: Vec<_> = parse_signature_lists(&buf)
            .unwrap()
            .into_iter()
            .filter_map(|l| l.filter_entries(|key| key.owner != OWNER_1))
            .collect();

        assert_eq!(
            filtered,
            vec![
                SignatureList::Sha256(vec![(OWNER_2, Cow::Owned([1; 32]))]),
                SignatureList::X509 {
                    owner: OWNER_2,
                    cert: b"some cert data"[..].into(),
                },
            ]
        );
    }

    #[test]
    fn dedup_set() {
        let lists = test_lists();
        let set = signature_set(&lists);
        // [0; 32] appears twice under OWNER_1, so the set is one smaller
        assert_eq!(set.len(), 5);

        let keys = lists[2].keys();
        assert!(set.contains(&keys[0].clone().into_owned()));
    }

    #[test]
    fn x509_extraction() {
        let lists = test_lists();
        let certs: Vec<_> = x509_certs(&lists).collect();
        assert_eq!(certs, vec![&b"some cert data"[..], &b"more cert data"[..]]);
    }

    #[test]
    fn opaque_preserved() {
        let unknown_type = Guid::from_static_str("deadbeef-0000-0000-0000-000000000000");
        let mut buf = Vec::new();
        let header = EFI_SIGNATURE_LIST {
            signature_type: unknown_type,
            signature_list_size: (size_of::<EFI_SIGNATURE_LIST>() + 16 + 4) as u32,
            signature_header_size: 0,
            signature_size: 16 + 4,
        };
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(OWNER_1.as_bytes());
        buf.extend_from_slice(&[0xaa; 4]);

        let lists = parse_signature_lists(&buf).unwrap();
        assert!(matches!(lists[0], SignatureList::Opaque(_)));
        assert_eq!(lists[0].signature_type(), unknown_type);
        assert_eq!(write_signature_lists(&lists), buf);
    }

    #[test]
    fn truncation_detected() {
        let buf = write_signature_lists(&test_lists());
        let res = parse_signature_lists(&buf[..buf.len() - 1]);
        assert!(matches!(res, Err(ParseError::TruncatedData)));

        let res = parse_signature_lists(&buf[..10]);
        assert!(matches!(res, Err(ParseError::TruncatedHeader)));
    }

    #[test]
    fn skips_signature_header() {
        // a sha256 list with a 4-byte signature header, which real producers
        // never emit but the wire format permits
        let mut buf = Vec::new();
        let header = EFI_SIGNATURE_LIST {
            signature_type: EFI_CERT_SHA256_GUID,
            signature_list_size: (size_of::<EFI_SIGNATURE_LIST>() + 4 + 48) as u32,
            signature_header_size: 4,
            signature_size: 48,
        };
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(&[0xff; 4]);
        buf.extend_from_slice(OWNER_1.as_bytes());
        buf.extend_from_slice(&[7; 32]);

        let lists = parse_signature_lists(&buf).unwrap();
        assert_eq!(
            lists,
            vec![SignatureList::Sha256(vec![(OWNER_1, Cow::Owned([7; 32]))])]
        );
    }
}
