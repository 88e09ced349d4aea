//! Client-registered shared memory.
//!
//! Every `(shm_id, shm_offset, size)` triple in the command stream is resolved through
//! [`SharedMemoryRegistry::resolve`]; nothing else indexes client memory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::id_allocator::IdAllocator;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("unknown shared memory id {0}")]
    UnknownRegion(u32),
    #[error("shared memory id {id}: range {offset}+{size} exceeds region of {len} bytes")]
    OutOfBounds { id: u32, offset: u32, size: u32, len: usize },
    #[error("shared memory id {0} is already registered")]
    IdInUse(u32),
    #[error("shared memory id {0}: referenced pixel data has no computable size")]
    UnsizedRange(u32),
}

/// A byte region shared between client and service.
#[derive(Debug)]
pub struct SharedMemory {
    data: Mutex<Vec<u8>>,
}

impl SharedMemory {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(vec![0; size]),
        })
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Arc<Self> {
        Arc::new(Self { data: Mutex::new(bytes) })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `len` bytes at `offset`, or `None` when out of range.
    pub fn read(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let data = self.lock();
        let end = offset.checked_add(len)?;
        data.get(offset..end).map(<[u8]>::to_vec)
    }

    /// Returns `false` (and writes nothing) when out of range.
    pub fn write(&self, offset: usize, src: &[u8]) -> bool {
        let mut data = self.lock();
        let Some(end) = offset.checked_add(src.len()) else {
            return false;
        };
        match data.get_mut(offset..end) {
            Some(dst) => {
                dst.copy_from_slice(src);
                true
            }
            None => false,
        }
    }

    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        let bytes = self.read(offset, 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&self, offset: usize) -> Option<u64> {
        let bytes = self.read(offset, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes);
        Some(u64::from_le_bytes(buf))
    }

    pub fn write_u32(&self, offset: usize, value: u32) -> bool {
        self.write(offset, &value.to_le_bytes())
    }

    /// Copy `words` as little-endian `u32`s starting at `offset`.
    pub fn write_words(&self, offset: usize, words: &[u32]) -> bool {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.write(offset, &bytes)
    }
}

/// A validated window into a [`SharedMemory`] region. Keeps the region alive.
#[derive(Clone, Debug)]
pub struct MemoryRange {
    memory: Arc<SharedMemory>,
    offset: u32,
    size: u32,
}

impl MemoryRange {
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn memory(&self) -> &Arc<SharedMemory> {
        &self.memory
    }

    pub fn read_all(&self) -> Vec<u8> {
        // Regions never shrink, so a range validated once stays valid.
        self.memory
            .read(self.offset as usize, self.size as usize)
            .unwrap_or_else(|| vec![0; self.size as usize])
    }

    pub fn read_words(&self) -> Vec<u32> {
        self.read_all()
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Write `src` at `rel` bytes into the range.
    pub fn write(&self, rel: u32, src: &[u8]) -> bool {
        let fits = (rel as usize)
            .checked_add(src.len())
            .is_some_and(|end| end <= self.size as usize);
        fits && self.memory.write(self.offset as usize + rel as usize, src)
    }

    pub fn write_u32(&self, rel: u32, value: u32) -> bool {
        self.write(rel, &value.to_le_bytes())
    }

    pub fn write_u64(&self, rel: u32, value: u64) -> bool {
        self.write(rel, &value.to_le_bytes())
    }
}

#[derive(Debug, Default)]
pub struct SharedMemoryRegistry {
    regions: HashMap<u32, Arc<SharedMemory>>,
    ids: IdAllocator,
}

impl SharedMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a region under a freshly allocated id (never 0).
    pub fn register(&mut self, memory: Arc<SharedMemory>) -> u32 {
        let id = self.ids.allocate_id();
        self.regions.insert(id, memory);
        id
    }

    pub fn register_at(&mut self, id: u32, memory: Arc<SharedMemory>) -> Result<(), MemoryError> {
        if !self.ids.mark_as_used(id) {
            return Err(MemoryError::IdInUse(id));
        }
        self.regions.insert(id, memory);
        Ok(())
    }

    pub fn unregister(&mut self, id: u32) -> Option<Arc<SharedMemory>> {
        let memory = self.regions.remove(&id)?;
        self.ids.free_id(id);
        Some(memory)
    }

    pub fn get(&self, id: u32) -> Option<&Arc<SharedMemory>> {
        self.regions.get(&id)
    }

    pub fn resolve(&self, id: u32, offset: u32, size: u32) -> Result<MemoryRange, MemoryError> {
        let memory = self.regions.get(&id).ok_or(MemoryError::UnknownRegion(id))?;
        let len = memory.len();
        let end = u64::from(offset) + u64::from(size);
        if end > len as u64 {
            return Err(MemoryError::OutOfBounds { id, offset, size, len });
        }
        Ok(MemoryRange {
            memory: Arc::clone(memory),
            offset,
            size,
        })
    }
}
