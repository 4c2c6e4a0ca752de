//! In-memory stores for tests and ephemeral nodes.
//!
//! Each can be switched into a failing mode to exercise the fatal paths of
//! the chain state machine.

use std::collections::HashMap;

use crate::error::FatalError;
use crate::traits::{DiskIndexEntry, DiskPos, FlatStore, IndexMetaKey, IndexStore};
use crate::types::Hash256;

/// Flat store holding records in a single growable buffer per "file".
#[derive(Debug, Default, Clone)]
pub struct MemoryFlatStore {
    files: Vec<Vec<u8>>,
    max_file_size: Option<usize>,
    fail_writes: bool,
}

impl MemoryFlatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rotate to a new file once the current one would exceed `max`.
    pub fn with_max_file_size(max: usize) -> Self {
        Self {
            max_file_size: Some(max),
            ..Self::default()
        }
    }

    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

impl FlatStore for MemoryFlatStore {
    fn write(&mut self, bytes: &[u8]) -> Result<DiskPos, FatalError> {
        if self.fail_writes {
            return Err(FatalError::Storage("injected write failure".into()));
        }
        let len = u32::try_from(bytes.len())
            .map_err(|_| FatalError::Storage(format!("record too large: {}", bytes.len())))?;
        let rotate = match (self.files.last(), self.max_file_size) {
            (None, _) => true,
            (Some(current), Some(max)) => !current.is_empty() && current.len() + bytes.len() > max,
            (Some(_), None) => false,
        };
        if rotate {
            self.files.push(Vec::new());
        }
        let file = self.files.len() - 1;
        let current = &mut self.files[file];
        let offset = current.len() as u64;
        current.extend_from_slice(bytes);
        Ok(DiskPos {
            file: file as u32,
            offset,
            len,
        })
    }

    fn read(&self, pos: &DiskPos) -> Result<Vec<u8>, FatalError> {
        let missing = || FatalError::MissingBlockData(format!("{}:{}", pos.file, pos.offset));
        let file = self.files.get(pos.file as usize).ok_or_else(missing)?;
        let start = usize::try_from(pos.offset).map_err(|_| missing())?;
        let end = start + pos.len as usize;
        file.get(start..end).map(<[u8]>::to_vec).ok_or_else(missing)
    }

    fn flush(&mut self) -> Result<(), FatalError> {
        if self.fail_writes {
            return Err(FatalError::Storage("injected flush failure".into()));
        }
        Ok(())
    }
}

/// Index store backed by hash maps.
#[derive(Debug, Default, Clone)]
pub struct MemoryIndexStore {
    entries: HashMap<Hash256, DiskIndexEntry>,
    meta: HashMap<IndexMetaKey, Vec<u8>>,
    fail_writes: bool,
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IndexStore for MemoryIndexStore {
    fn load_all(&self) -> Result<Vec<DiskIndexEntry>, FatalError> {
        Ok(self.entries.values().cloned().collect())
    }

    fn write_batch(
        &mut self,
        entries: &[DiskIndexEntry],
        meta: &[(IndexMetaKey, Vec<u8>)],
    ) -> Result<(), FatalError> {
        if self.fail_writes {
            return Err(FatalError::Storage("injected write failure".into()));
        }
        for entry in entries {
            self.entries.insert(entry.hash, entry.clone());
        }
        for (key, value) in meta {
            self.meta.insert(*key, value.clone());
        }
        Ok(())
    }

    fn read_meta(&self, key: IndexMetaKey) -> Result<Option<Vec<u8>>, FatalError> {
        Ok(self.meta.get(&key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_store_roundtrip_and_rotation() {
        let mut store = MemoryFlatStore::with_max_file_size(10);
        let a = store.write(b"hello").unwrap();
        let b = store.write(b"world!").unwrap();
        assert_eq!(a.file, 0);
        assert_eq!(b.file, 1);
        assert_eq!(store.read(&a).unwrap(), b"hello");
        assert_eq!(store.read(&b).unwrap(), b"world!");
        assert_eq!(store.file_count(), 2);
    }

    #[test]
    fn flat_store_missing_record() {
        let store = MemoryFlatStore::new();
        let pos = DiskPos { file: 3, offset: 0, len: 1 };
        assert!(matches!(store.read(&pos), Err(FatalError::MissingBlockData(_))));
    }

    #[test]
    fn failing_stores_report_storage_errors() {
        let mut flat = MemoryFlatStore::new();
        flat.set_fail_writes(true);
        assert!(matches!(flat.write(b"x"), Err(FatalError::Storage(_))));

        let mut index = MemoryIndexStore::new();
        index.set_fail_writes(true);
        assert!(index.write_batch(&[], &[]).is_err());
    }

    #[test]
    fn index_meta_roundtrip() {
        let mut index = MemoryIndexStore::new();
        index
            .write_batch(&[], &[(IndexMetaKey::LastFile, vec![2, 0, 0, 0])])
            .unwrap();
        assert_eq!(index.read_meta(IndexMetaKey::LastFile).unwrap(), Some(vec![2, 0, 0, 0]));
        assert_eq!(index.read_meta(IndexMetaKey::Reindexing).unwrap(), None);
    }
}
