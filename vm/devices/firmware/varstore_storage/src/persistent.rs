//! [`NvramStorage`] layered over a [`StorageBackend`]: every committed
//! mutation re-serializes the store and persists the whole snapshot.

use crate::in_memory::InMemoryNvram;
use crate::snapshot;
use crate::storage_backend::StorageBackend;
use crate::NextVariable;
use crate::NvramStorage;
use crate::NvramStorageError;
use crate::VariableLimits;
use crate::EFI_TIME;
use guid::Guid;
use ucs2::Ucs2LeSlice;

/// Blob-persisted nvram storage.
///
/// The snapshot is loaded lazily on first access; mutations are applied to
/// the in-memory store (which owns the quota) and then flushed in full to the
/// backend before the mutation is reported committed.
pub struct PersistentNvram<S> {
    backend: S,
    cache: InMemoryNvram,
    loaded: bool,
}

impl<S: StorageBackend> PersistentNvram<S> {
    /// Create a store persisted through `backend` with default limits.
    pub fn new(backend: S) -> Self {
        Self::with_limits(backend, VariableLimits::default())
    }

    /// Create a store persisted through `backend` with the given limits.
    pub fn with_limits(backend: S, limits: VariableLimits) -> Self {
        Self {
            backend,
            cache: InMemoryNvram::with_limits(limits),
            loaded: false,
        }
    }

    fn lazy_load(&mut self) -> Result<(), NvramStorageError> {
        if self.loaded {
            return Ok(());
        }

        let blob = self
            .backend
            .restore()
            .map_err(|e| NvramStorageError::Load(e.into()))?;

        if let Some(blob) = blob {
            tracing::debug!(len = blob.len(), "restoring nvram snapshot");
            self.cache.clear();
            for entry in snapshot::parse(&blob)? {
                self.cache
                    .set_variable(&entry.name, entry.vendor, entry.attr, entry.data, entry.timestamp)?;
            }
        }

        self.loaded = true;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), NvramStorageError> {
        let blob = snapshot::serialize(self.cache.iter());
        self.backend
            .persist(blob)
            .map_err(|e| NvramStorageError::Commit(e.into()))
    }
}

impl<S: StorageBackend> NvramStorage for PersistentNvram<S> {
    fn get_variable(
        &mut self,
        name: &Ucs2LeSlice,
        vendor: Guid,
    ) -> Result<Option<(u32, Vec<u8>, EFI_TIME)>, NvramStorageError> {
        self.lazy_load()?;
        self.cache.get_variable(name, vendor)
    }

    fn set_variable(
        &mut self,
        name: &Ucs2LeSlice,
        vendor: Guid,
        attr: u32,
        data: Vec<u8>,
        timestamp: EFI_TIME,
    ) -> Result<(), NvramStorageError> {
        self.lazy_load()?;
        self.cache.set_variable(name, vendor, attr, data, timestamp)?;
        self.flush()
    }

    fn append_variable(
        &mut self,
        name: &Ucs2LeSlice,
        vendor: Guid,
        data: Vec<u8>,
        timestamp: EFI_TIME,
    ) -> Result<bool, NvramStorageError> {
        self.lazy_load()?;
        let found = self.cache.append_variable(name, vendor, data, timestamp)?;
        if found {
            self.flush()?;
        }
        Ok(found)
    }

    fn remove_variable(
        &mut self,
        name: &Ucs2LeSlice,
        vendor: Guid,
    ) -> Result<bool, NvramStorageError> {
        self.lazy_load()?;
        let removed = self.cache.remove_variable(name, vendor)?;
        if removed {
            self.flush()?;
        }
        Ok(removed)
    }

    fn next_variable(
        &mut self,
        name_vendor: Option<(&Ucs2LeSlice, Guid)>,
    ) -> Result<NextVariable, NvramStorageError> {
        self.lazy_load()?;
        self.cache.next_variable(name_vendor)
    }

    fn used_storage(&mut self, attr_mask: u32) -> Result<u64, NvramStorageError> {
        self.lazy_load()?;
        self.cache.used_storage(attr_mask)
    }

    fn limits(&self) -> VariableLimits {
        self.cache.limits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::impl_agnostic_tests;
    use crate::storage_backend::EphemeralBackend;
    use crate::storage_backend::StorageBackendError;
    use ucs2::Ucs2LeVec;
    use uefi_specs::uefi::nvram::EfiVariableAttributes;

    #[test]
    fn test_single_variable() {
        let mut storage = EphemeralBackend::default();
        let mut nvram = PersistentNvram::new(&mut storage);
        impl_agnostic_tests::test_single_variable(&mut nvram);
    }

    #[test]
    fn test_multiple_variable() {
        let mut storage = EphemeralBackend::default();
        let mut nvram = PersistentNvram::new(&mut storage);
        impl_agnostic_tests::test_multiple_variable(&mut nvram);
    }

    #[test]
    fn test_next() {
        let mut storage = EphemeralBackend::default();
        let mut nvram = PersistentNvram::new(&mut storage);
        impl_agnostic_tests::test_next(&mut nvram);
    }

    #[test]
    fn load_reload() {
        let mut storage = EphemeralBackend::default();

        let vendor1 = Guid::new_random();
        let name1 = Ucs2LeVec::from("var1");
        let vendor2 = Guid::new_random();
        let name2 = Ucs2LeVec::from("var2");
        let attr = EfiVariableAttributes::DEFAULT_ATTRIBUTES.into();
        let data = vec![0x1, 0x2, 0x3, 0x4, 0x5];
        let timestamp = EFI_TIME::ZEROED;

        let mut nvram = PersistentNvram::new(&mut storage);
        nvram
            .set_variable(&name1, vendor1, attr, data.clone(), timestamp)
            .unwrap();
        nvram
            .set_variable(&name2, vendor2, attr, data.clone(), timestamp)
            .unwrap();
        drop(nvram);

        // reload from the persisted blob
        let mut nvram = PersistentNvram::new(&mut storage);
        let (result_attr, result_data, _) = nvram.get_variable(&name1, vendor1).unwrap().unwrap();
        assert_eq!(result_attr, attr);
        assert_eq!(result_data, data);

        let (result_attr, result_data, _) = nvram.get_variable(&name2, vendor2).unwrap().unwrap();
        assert_eq!(result_attr, attr);
        assert_eq!(result_data, data);
    }

    #[test]
    fn save_load_is_byte_stable() {
        let mut storage = EphemeralBackend::default();
        let vendor = Guid::new_random();
        let attr = EfiVariableAttributes::DEFAULT_ATTRIBUTES.into();

        let mut nvram = PersistentNvram::new(&mut storage);
        nvram
            .set_variable(&Ucs2LeVec::from("a"), vendor, attr, vec![1], EFI_TIME::ZEROED)
            .unwrap();
        nvram
            .set_variable(&Ucs2LeVec::from("b"), vendor, attr, vec![2], EFI_TIME::ZEROED)
            .unwrap();
        drop(nvram);

        let blob1 = storage.restore().unwrap().unwrap();

        // reload and rewrite one variable with identical contents
        let mut nvram = PersistentNvram::new(&mut storage);
        nvram
            .set_variable(&Ucs2LeVec::from("a"), vendor, attr, vec![1], EFI_TIME::ZEROED)
            .unwrap();
        drop(nvram);

        let blob2 = storage.restore().unwrap().unwrap();
        assert_eq!(blob1, blob2);
    }

    #[test]
    fn corrupt_blob_fails_load() {
        struct Corrupt;
        impl StorageBackend for Corrupt {
            fn persist(&mut self, _data: Vec<u8>) -> Result<(), StorageBackendError> {
                Ok(())
            }
            fn restore(&mut self) -> Result<Option<Vec<u8>>, StorageBackendError> {
                Ok(Some(vec![0xff; 7]))
            }
        }

        let mut nvram = PersistentNvram::new(Corrupt);
        let res = nvram.get_variable(&Ucs2LeVec::from("var"), Guid::new_random());
        assert!(matches!(res, Err(NvramStorageError::Deserialize)));
    }
}
