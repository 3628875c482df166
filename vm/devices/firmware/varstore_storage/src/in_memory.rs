//! An in-memory implementation of [`NvramStorage`] with quota accounting that
//! doesn't automatically persist anywhere.

use crate::NextVariable;
use crate::NvramStorage;
use crate::NvramStorageError;
use crate::VariableLimits;
use crate::EFI_TIME;
use guid::Guid;
use std::collections::BTreeMap;
use std::fmt::Display;
use ucs2::Ucs2LeSlice;
use ucs2::Ucs2LeVec;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct VariableKey {
    vendor: Guid,
    name: Ucs2LeVec,
}

impl Display for VariableKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.vendor, self.name)
    }
}

impl VariableKey {
    fn new(name: &Ucs2LeSlice, vendor: Guid) -> VariableKey {
        VariableKey {
            vendor,
            name: name.to_ucs2_le_vec(),
        }
    }

    /// Bytes this key's name costs against the quota (terminator excluded).
    fn name_cost(&self) -> usize {
        self.name.as_bytes_without_nul().len()
    }
}

#[derive(Clone, Debug)]
struct Variable {
    data: Vec<u8>,
    timestamp: EFI_TIME,
    attr: u32,
}

/// An in-memory implementation of [`NvramStorage`].
///
/// Enumeration order is the `BTreeMap` key order, which is stable and
/// independent of request history.
#[derive(Debug)]
pub struct InMemoryNvram {
    nvram: BTreeMap<VariableKey, Variable>,
    limits: VariableLimits,
    used: usize,
}

/// A borrowed view of a stored variable, for snapshotting.
pub struct VariableEntry<'a> {
    /// Vendor GUID.
    pub vendor: Guid,
    /// Variable name.
    pub name: &'a Ucs2LeSlice,
    /// Variable data.
    pub data: &'a [u8],
    /// Authenticated-write timestamp (zeroed otherwise).
    pub timestamp: EFI_TIME,
    /// Variable attributes.
    pub attr: u32,
}

impl InMemoryNvram {
    /// Create an empty store with the default [`VariableLimits`].
    pub fn new() -> Self {
        Self::with_limits(VariableLimits::default())
    }

    /// Create an empty store with the given quota.
    pub fn with_limits(limits: VariableLimits) -> Self {
        Self {
            nvram: BTreeMap::new(),
            limits,
            used: 0,
        }
    }

    /// Iterate over every stored variable in enumeration order.
    pub fn iter(&self) -> impl Iterator<Item = VariableEntry<'_>> {
        self.nvram.iter().map(|(k, v)| VariableEntry {
            vendor: k.vendor,
            name: k.name.as_ref(),
            data: v.data.as_slice(),
            timestamp: v.timestamp,
            attr: v.attr,
        })
    }

    /// Remove all variables, returning their bytes to the quota pool.
    pub fn clear(&mut self) {
        self.nvram.clear();
        self.used = 0;
    }
}

impl Default for InMemoryNvram {
    fn default() -> Self {
        Self::new()
    }
}

impl NvramStorage for InMemoryNvram {
    fn get_variable(
        &mut self,
        name: &Ucs2LeSlice,
        vendor: Guid,
    ) -> Result<Option<(u32, Vec<u8>, EFI_TIME)>, NvramStorageError> {
        Ok(self
            .nvram
            .get(&VariableKey::new(name, vendor))
            .map(|v| (v.attr, v.data.clone(), v.timestamp)))
    }

    fn set_variable(
        &mut self,
        name: &Ucs2LeSlice,
        vendor: Guid,
        attr: u32,
        data: Vec<u8>,
        timestamp: EFI_TIME,
    ) -> Result<(), NvramStorageError> {
        let key = VariableKey::new(name, vendor);
        let new_cost = key.name_cost() + data.len();
        if new_cost > self.limits.max_variable_size {
            return Err(NvramStorageError::VariableTooLarge);
        }

        let old_cost = self
            .nvram
            .get(&key)
            .map(|v| key.name_cost() + v.data.len())
            .unwrap_or(0);

        let new_used = self.used - old_cost + new_cost;
        if new_used > self.limits.max_storage {
            return Err(NvramStorageError::OutOfSpace);
        }

        self.nvram.insert(
            key,
            Variable {
                data,
                timestamp,
                attr,
            },
        );
        self.used = new_used;
        Ok(())
    }

    fn append_variable(
        &mut self,
        name: &Ucs2LeSlice,
        vendor: Guid,
        data: Vec<u8>,
        timestamp: EFI_TIME,
    ) -> Result<bool, NvramStorageError> {
        let key = VariableKey::new(name, vendor);
        let Some(existing) = self.nvram.get(&key) else {
            return Ok(false);
        };

        if key.name_cost() + existing.data.len() + data.len() > self.limits.max_variable_size {
            return Err(NvramStorageError::VariableTooLarge);
        }
        if self.used + data.len() > self.limits.max_storage {
            return Err(NvramStorageError::OutOfSpace);
        }

        let var = self.nvram.get_mut(&key).unwrap();
        var.data.extend_from_slice(&data);
        var.timestamp = timestamp;
        self.used += data.len();
        Ok(true)
    }

    fn remove_variable(
        &mut self,
        name: &Ucs2LeSlice,
        vendor: Guid,
    ) -> Result<bool, NvramStorageError> {
        let key = VariableKey::new(name, vendor);
        match self.nvram.remove(&key) {
            Some(var) => {
                self.used -= key.name_cost() + var.data.len();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn next_variable(
        &mut self,
        name_vendor: Option<(&Ucs2LeSlice, Guid)>,
    ) -> Result<NextVariable, NvramStorageError> {
        let Some((name, vendor)) = name_vendor else {
            return Ok(match self.nvram.iter().next() {
                Some((k, v)) => NextVariable::Exists {
                    name: k.name.clone(),
                    vendor: k.vendor,
                    attr: v.attr,
                },
                None => NextVariable::EndOfList,
            });
        };

        let key = VariableKey::new(name, vendor);
        let mut range = self.nvram.range(&key..);
        match range.next() {
            Some((found, _)) if *found == key => Ok(match range.next() {
                Some((k, v)) => NextVariable::Exists {
                    name: k.name.clone(),
                    vendor: k.vendor,
                    attr: v.attr,
                },
                None => NextVariable::EndOfList,
            }),
            // the provided key must name an existing variable
            _ => Ok(NextVariable::InvalidKey),
        }
    }

    fn used_storage(&mut self, attr_mask: u32) -> Result<u64, NvramStorageError> {
        Ok(self
            .nvram
            .iter()
            .filter(|(_, v)| v.attr & attr_mask == attr_mask)
            .map(|(k, v)| (k.name_cost() + v.data.len()) as u64)
            .sum())
    }

    fn limits(&self) -> VariableLimits {
        self.limits
    }
}

/// A collection of test helpers that operate on a generic implementation of
/// [`NvramStorage`].
pub mod impl_agnostic_tests {
    use crate::NextVariable;
    use crate::NvramStorage;
    use crate::EFI_TIME;
    use guid::Guid;
    use ucs2::Ucs2LeVec;

    fn name(s: &str) -> Ucs2LeVec {
        Ucs2LeVec::from(s)
    }

    /// Set / get / overwrite / remove a single variable.
    pub fn test_single_variable(nvram: &mut dyn NvramStorage) {
        let vendor = Guid::new_random();
        let name = name("var1");
        let attr = 0x1234;
        let data = vec![0x1, 0x2, 0x3, 0x4, 0x5];
        let data1 = vec![0xa, 0xb, 0xc];
        let timestamp = EFI_TIME::ZEROED;

        nvram
            .set_variable(&name, vendor, attr, data.clone(), timestamp)
            .unwrap();

        let (result_attr, result_data, result_timestamp) =
            nvram.get_variable(&name, vendor).unwrap().unwrap();
        assert_eq!(result_attr, attr);
        assert_eq!(result_data, data);
        assert_eq!(result_timestamp, timestamp);

        let result = nvram.next_variable(Some((&name, vendor))).unwrap();
        assert!(matches!(result, NextVariable::EndOfList));

        // overwrite with new data
        nvram
            .set_variable(&name, vendor, attr, data1.clone(), timestamp)
            .unwrap();

        let (_, result_data, _) = nvram.get_variable(&name, vendor).unwrap().unwrap();
        assert_eq!(result_data, data1);

        assert!(nvram.remove_variable(&name, vendor).unwrap());
        assert!(nvram.get_variable(&name, vendor).unwrap().is_none());
        assert!(!nvram.remove_variable(&name, vendor).unwrap());
    }

    /// Enumerate several variables, checking stability and completeness.
    pub fn test_next(nvram: &mut dyn NvramStorage) {
        let vars = [
            (Guid::new_random(), name("var1")),
            (Guid::new_random(), name("var2")),
            (Guid::new_random(), name("var3")),
        ];
        let attr = 0x1234;
        let data = vec![0x1, 0x2, 0x3];
        let timestamp = EFI_TIME::ZEROED;

        for (vendor, name) in &vars {
            nvram
                .set_variable(name, *vendor, attr, data.clone(), timestamp)
                .unwrap();
        }

        // a full traversal visits every variable exactly once
        let mut seen = Vec::new();
        let mut key: Option<(Ucs2LeVec, Guid)> = None;
        loop {
            let next = nvram
                .next_variable(key.as_ref().map(|(n, v)| (n.as_ref(), *v)))
                .unwrap();
            match next {
                NextVariable::InvalidKey => panic!("key was returned by next_variable"),
                NextVariable::EndOfList => break,
                NextVariable::Exists { name, vendor, .. } => {
                    seen.push((name.clone(), vendor));
                    key = Some((name, vendor));
                }
            }
        }
        assert_eq!(seen.len(), vars.len());
        for (vendor, name) in &vars {
            assert!(seen.iter().any(|(n, v)| n == name && v == vendor));
        }

        // next_variable is idempotent
        let first1 = nvram.next_variable(None).unwrap();
        let first2 = nvram.next_variable(None).unwrap();
        assert_eq!(first1, first2);

        // an unknown key is reported as invalid
        let bogus = name("nonexistent");
        let res = nvram
            .next_variable(Some((&bogus, Guid::new_random())))
            .unwrap();
        assert!(matches!(res, NextVariable::InvalidKey));
    }

    /// Multiple variables + append.
    pub fn test_multiple_variable(nvram: &mut dyn NvramStorage) {
        let vendor1 = Guid::new_random();
        let name1 = name("var1");
        let vendor2 = Guid::new_random();
        let name2 = name("var2");
        let attr = 0x1234;
        let data = vec![0x1, 0x2, 0x3, 0x4, 0x5];
        let timestamp = EFI_TIME::ZEROED;

        nvram
            .set_variable(&name1, vendor1, attr, data.clone(), timestamp)
            .unwrap();
        nvram
            .set_variable(&name2, vendor2, attr, data.clone(), timestamp)
            .unwrap();

        let (_, result_data, _) = nvram.get_variable(&name2, vendor2).unwrap().unwrap();
        assert_eq!(result_data, data);

        // append to an existing variable
        assert!(nvram
            .append_variable(&name1, vendor1, vec![6, 7, 8], timestamp)
            .unwrap());
        let (_, result_data, _) = nvram.get_variable(&name1, vendor1).unwrap().unwrap();
        assert_eq!(result_data, (1..=8).collect::<Vec<u8>>());

        // append to a missing variable reports not-found
        assert!(!nvram
            .append_variable(&name("nope"), vendor1, vec![1], timestamp)
            .unwrap());
    }
}

#[cfg(test)]
mod tests {
    use super::impl_agnostic_tests;
    use super::*;
    use crate::NvramStorage;

    #[test]
    fn nvram_trait_single_variable() {
        let mut nvram = InMemoryNvram::new();
        impl_agnostic_tests::test_single_variable(&mut nvram);
    }

    #[test]
    fn nvram_trait_next() {
        let mut nvram = InMemoryNvram::new();
        impl_agnostic_tests::test_next(&mut nvram);
    }

    #[test]
    fn nvram_trait_multiple_variable() {
        let mut nvram = InMemoryNvram::new();
        impl_agnostic_tests::test_multiple_variable(&mut nvram);
    }

    #[test]
    fn quota_accounting() {
        let mut nvram = InMemoryNvram::with_limits(VariableLimits {
            max_storage: 64,
            max_variable_size: 40,
        });
        let vendor = Guid::new_random();
        let name = Ucs2LeVec::from("ab"); // 4 bytes sans terminator
        let name2 = Ucs2LeVec::from("cd");

        // per-variable cap: 4 + 37 > 40
        let res = nvram.set_variable(&name, vendor, 0, vec![0; 37], EFI_TIME::ZEROED);
        assert!(matches!(res, Err(NvramStorageError::VariableTooLarge)));
        assert!(nvram.get_variable(&name, vendor).unwrap().is_none());

        nvram
            .set_variable(&name, vendor, 0, vec![0; 28], EFI_TIME::ZEROED)
            .unwrap();
        assert_eq!(nvram.used_storage(0).unwrap(), 32);

        // filling the total budget exactly is fine...
        nvram
            .set_variable(&name2, vendor, 0, vec![0; 28], EFI_TIME::ZEROED)
            .unwrap();
        assert_eq!(nvram.used_storage(0).unwrap(), 64);

        // ...but one more byte is not, and the failed append did not mutate
        let res = nvram.append_variable(&name2, vendor, vec![0; 4], EFI_TIME::ZEROED);
        assert!(matches!(res, Err(NvramStorageError::OutOfSpace)));
        let (_, data, _) = nvram.get_variable(&name2, vendor).unwrap().unwrap();
        assert_eq!(data.len(), 28);

        // shrinking an existing variable returns bytes to the pool
        nvram
            .set_variable(&name, vendor, 0, vec![0; 4], EFI_TIME::ZEROED)
            .unwrap();
        assert_eq!(nvram.used_storage(0).unwrap(), 40);

        // now the append fits
        assert!(nvram
            .append_variable(&name2, vendor, vec![0; 4], EFI_TIME::ZEROED)
            .unwrap());
        assert_eq!(nvram.used_storage(0).unwrap(), 44);

        // append is also bounded by the per-variable cap: 4 + 32 + 5 > 40
        let res = nvram.append_variable(&name2, vendor, vec![0; 5], EFI_TIME::ZEROED);
        assert!(matches!(res, Err(NvramStorageError::VariableTooLarge)));

        // removal frees the quota
        assert!(nvram.remove_variable(&name2, vendor).unwrap());
        assert_eq!(nvram.used_storage(0).unwrap(), 8);
    }

    #[test]
    fn used_storage_attr_mask() {
        let mut nvram = InMemoryNvram::new();
        let vendor = Guid::new_random();

        nvram
            .set_variable(&Ucs2LeVec::from("nv"), vendor, 0x1, vec![0; 10], EFI_TIME::ZEROED)
            .unwrap();
        nvram
            .set_variable(
                &Ucs2LeVec::from("vol"),
                vendor,
                0x6,
                vec![0; 10],
                EFI_TIME::ZEROED,
            )
            .unwrap();

        assert_eq!(nvram.used_storage(0x1).unwrap(), 4 + 10);
        assert_eq!(nvram.used_storage(0x2).unwrap(), 6 + 10);
        assert_eq!(nvram.used_storage(0).unwrap(), 4 + 10 + 6 + 10);
    }
}
