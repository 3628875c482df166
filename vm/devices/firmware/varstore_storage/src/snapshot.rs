//! The persistent snapshot encoding.
//!
//! A snapshot is the concatenation, for every non-volatile record, of:
//!
//! ```text
//! name_len: u32 | name (UCS-2 LE, no terminator) | vendor: GUID (16 bytes)
//! | attrs: u32 | timestamp: EFI_TIME (16 bytes) | data_len: u32 | data
//! ```
//!
//! All integers little-endian, no padding. Names are stored without their
//! null terminator; it is re-attached on load.

use crate::in_memory::VariableEntry;
use crate::NvramStorageError;
use crate::EFI_TIME;
use guid::Guid;
use ucs2::Ucs2LeVec;
use uefi_specs::uefi::nvram::EfiVariableAttributes;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// An owned record decoded from a snapshot.
pub(crate) struct SnapshotEntry {
    pub name: Ucs2LeVec,
    pub vendor: Guid,
    pub attr: u32,
    pub timestamp: EFI_TIME,
    pub data: Vec<u8>,
}

/// Serialize every non-volatile entry into a fresh snapshot.
pub(crate) fn serialize<'a>(entries: impl Iterator<Item = VariableEntry<'a>>) -> Vec<u8> {
    let mut buf = Vec::new();
    for entry in entries {
        if !EfiVariableAttributes::from(entry.attr).non_volatile() {
            continue;
        }

        let name = entry.name.as_bytes_without_nul();
        buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
        buf.extend_from_slice(name);
        buf.extend_from_slice(entry.vendor.as_bytes());
        buf.extend_from_slice(&entry.attr.to_le_bytes());
        buf.extend_from_slice(entry.timestamp.as_bytes());
        buf.extend_from_slice(&(entry.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(entry.data);
    }
    buf
}

/// Decode a snapshot back into records.
pub(crate) fn parse(buf: &[u8]) -> Result<Vec<SnapshotEntry>, NvramStorageError> {
    let mut r = Reader(buf);
    let mut entries = Vec::new();
    while !r.0.is_empty() {
        let name_len = r.u32()? as usize;
        let name = r.bytes(name_len)?;
        let vendor = r.read::<Guid>()?;
        let attr = r.u32()?;
        let timestamp = r.read::<EFI_TIME>()?;
        let data_len = r.u32()? as usize;
        let data = r.bytes(data_len)?;

        let name = {
            let mut v = name.to_vec();
            v.extend_from_slice(&[0, 0]);
            Ucs2LeVec::from_vec_with_nul(v).map_err(|_| NvramStorageError::Deserialize)?
        };

        entries.push(SnapshotEntry {
            name,
            vendor,
            attr,
            timestamp,
            data: data.to_vec(),
        });
    }
    Ok(entries)
}

/// Byte reader where every descent is checked against the remaining slice.
struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn bytes(&mut self, len: usize) -> Result<&'a [u8], NvramStorageError> {
        if self.0.len() < len {
            return Err(NvramStorageError::Deserialize);
        }
        let (out, rest) = self.0.split_at(len);
        self.0 = rest;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, NvramStorageError> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn read<T: FromBytes>(&mut self) -> Result<T, NvramStorageError> {
        let (val, rest) =
            T::read_from_prefix(self.0).map_err(|_| NvramStorageError::Deserialize)?;
        self.0 = rest;
        Ok(val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryNvram;
    use crate::NvramStorage;

    #[test]
    fn round_trip() {
        let mut nvram = InMemoryNvram::new();
        let vendor = Guid::new_random();
        let nv_attr = u32::from(EfiVariableAttributes::DEFAULT_ATTRIBUTES);

        nvram
            .set_variable(
                &Ucs2LeVec::from("first"),
                vendor,
                nv_attr,
                vec![1, 2, 3],
                EFI_TIME::ZEROED,
            )
            .unwrap();
        nvram
            .set_variable(
                &Ucs2LeVec::from("second"),
                vendor,
                nv_attr,
                vec![],
                EFI_TIME::ZEROED,
            )
            .unwrap();

        let blob = serialize(nvram.iter());
        let entries = parse(&blob).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, Ucs2LeVec::from("first"));
        assert_eq!(entries[0].data, vec![1, 2, 3]);
        assert_eq!(entries[1].name, Ucs2LeVec::from("second"));
        assert!(entries[1].data.is_empty());

        // serialization is deterministic
        let mut nvram2 = InMemoryNvram::new();
        for e in entries {
            nvram2
                .set_variable(&e.name, e.vendor, e.attr, e.data, e.timestamp)
                .unwrap();
        }
        assert_eq!(serialize(nvram2.iter()), blob);
    }

    #[test]
    fn volatile_records_not_persisted() {
        let mut nvram = InMemoryNvram::new();
        let vendor = Guid::new_random();

        nvram
            .set_variable(
                &Ucs2LeVec::from("volatile"),
                vendor,
                EfiVariableAttributes::DEFAULT_ATTRIBUTES_VOLATILE.into(),
                vec![1],
                EFI_TIME::ZEROED,
            )
            .unwrap();

        assert!(serialize(nvram.iter()).is_empty());
    }

    #[test]
    fn truncation_detected() {
        let mut nvram = InMemoryNvram::new();
        nvram
            .set_variable(
                &Ucs2LeVec::from("var"),
                Guid::new_random(),
                EfiVariableAttributes::DEFAULT_ATTRIBUTES.into(),
                vec![1, 2, 3, 4],
                EFI_TIME::ZEROED,
            )
            .unwrap();

        let blob = serialize(nvram.iter());
        for cut in 1..blob.len() {
            assert!(
                parse(&blob[..cut]).is_err(),
                "truncation at {cut} went undetected"
            );
        }
    }
}
