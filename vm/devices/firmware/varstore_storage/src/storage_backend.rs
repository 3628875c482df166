//! Trait for abstracting the backend used for nvram snapshot storage.

use std::path::PathBuf;
use thiserror::Error;

/// Error when accessing a [`StorageBackend`]
#[derive(Error, Debug)]
#[error("error accessing nvram storage backend")]
pub struct StorageBackendError(#[from] anyhow::Error);

impl StorageBackendError {
    /// Create a new [`StorageBackendError`]
    pub fn new(e: impl Into<anyhow::Error>) -> StorageBackendError {
        Self(e.into())
    }
}

/// Whole-blob storage for the nvram snapshot.
///
/// `persist` must be atomic: a reader (including a post-crash `restore`)
/// observes either the previous blob or the new blob, never a torn write.
pub trait StorageBackend: Send {
    /// Write `data` to a non-volatile storage medium.
    fn persist(&mut self, data: Vec<u8>) -> Result<(), StorageBackendError>;

    /// Read any previously written `data`. Returns `None` if no data exists.
    fn restore(&mut self) -> Result<Option<Vec<u8>>, StorageBackendError>;
}

// Boilerplate: forward `StorageBackend` methods for `Box<dyn StorageBackend>`
impl StorageBackend for Box<dyn StorageBackend> {
    fn persist(&mut self, data: Vec<u8>) -> Result<(), StorageBackendError> {
        (**self).persist(data)
    }

    fn restore(&mut self) -> Result<Option<Vec<u8>>, StorageBackendError> {
        (**self).restore()
    }
}

// Boilerplate: forward `StorageBackend` methods for `&mut T`
impl<T: StorageBackend> StorageBackend for &mut T {
    fn persist(&mut self, data: Vec<u8>) -> Result<(), StorageBackendError> {
        (**self).persist(data)
    }

    fn restore(&mut self) -> Result<Option<Vec<u8>>, StorageBackendError> {
        (**self).restore()
    }
}

/// An ephemeral [`StorageBackend`] backed by an in-memory buffer. Useful for
/// tests and stateless VM scenarios.
#[derive(Default)]
pub struct EphemeralBackend(Option<Vec<u8>>);

impl StorageBackend for EphemeralBackend {
    fn persist(&mut self, data: Vec<u8>) -> Result<(), StorageBackendError> {
        self.0 = Some(data);
        Ok(())
    }

    fn restore(&mut self) -> Result<Option<Vec<u8>>, StorageBackendError> {
        Ok(self.0.clone())
    }
}

/// A file-backed [`StorageBackend`].
///
/// Writes go to a sibling temp file which is fsync'd and renamed over the
/// real path, so a crash mid-write leaves the previous blob intact.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    /// Create a backend storing the blob at `path`.
    pub fn new(path: impl Into<PathBuf>) -> FileBackend {
        FileBackend { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        tmp.into()
    }
}

impl StorageBackend for FileBackend {
    fn persist(&mut self, data: Vec<u8>) -> Result<(), StorageBackendError> {
        use std::io::Write;

        let tmp = self.temp_path();
        let res = (|| {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
            std::fs::rename(&tmp, &self.path)
        })();

        res.map_err(StorageBackendError::new)
    }

    fn restore(&mut self) -> Result<Option<Vec<u8>>, StorageBackendError> {
        match std::fs::read(&self.path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageBackendError::new(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_backend_round_trip() {
        let path = std::env::temp_dir().join(format!("varstore-test-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let mut backend = FileBackend::new(&path);
        assert!(backend.restore().unwrap().is_none());

        backend.persist(vec![1, 2, 3]).unwrap();
        assert_eq!(backend.restore().unwrap(), Some(vec![1, 2, 3]));

        backend.persist(vec![4, 5]).unwrap();
        assert_eq!(backend.restore().unwrap(), Some(vec![4, 5]));

        // no stray temp file is left behind
        assert!(!backend.temp_path().exists());

        std::fs::remove_file(&path).unwrap();
    }
}
