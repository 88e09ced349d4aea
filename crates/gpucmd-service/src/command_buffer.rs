//! Ring-buffer front end for a [`GpuDecoder`].
//!
//! The client writes packets into a registered shared-memory region and advances `put`; the
//! service consumes `[get, put)` on [`CommandBufferService::flush`]. A packet never straddles the
//! end of the ring: clients pad the tail with a `Noop` and continue at offset 0.

use std::sync::Arc;

use gpucmd_protocol::CommandStatus;
use thiserror::Error;
use tracing::{debug, warn};

use crate::decoder::{ExecuteResult, GpuDecoder};
use crate::shared_memory::SharedMemory;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RingError {
    #[error("unknown shared memory id {0}")]
    UnknownRegion(u32),
    #[error("ring of {0} bytes is empty or not word aligned")]
    BadSize(usize),
}

/// Client-visible state after a flush.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommandBufferState {
    /// Word offset of the next packet the service will read.
    pub get_offset: u32,
    pub put_offset: u32,
    pub token: u32,
    /// Status of the most recent failing batch, or `NoError`.
    pub error: CommandStatus,
}

#[derive(Debug)]
struct Ring {
    memory: Arc<SharedMemory>,
    size_words: u32,
}

impl Ring {
    fn words(&self, start: u32, end: u32) -> Vec<u32> {
        let bytes = self
            .memory
            .read(start as usize * 4, (end - start) as usize * 4)
            .unwrap_or_default();
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

pub struct CommandBufferService {
    decoder: GpuDecoder,
    ring: Option<Ring>,
    get: u32,
    put: u32,
    error: CommandStatus,
}

impl CommandBufferService {
    pub fn new(decoder: GpuDecoder) -> Self {
        Self {
            decoder,
            ring: None,
            get: 0,
            put: 0,
            error: CommandStatus::NoError,
        }
    }

    pub fn decoder(&self) -> &GpuDecoder {
        &self.decoder
    }

    pub fn decoder_mut(&mut self) -> &mut GpuDecoder {
        &mut self.decoder
    }

    /// Use the region registered as `shm_id` as the ring. Resets both offsets.
    pub fn set_get_buffer(&mut self, shm_id: u32) -> Result<(), RingError> {
        let memory = self
            .decoder
            .shared_memory()
            .get(shm_id)
            .cloned()
            .ok_or(RingError::UnknownRegion(shm_id))?;
        let len = memory.len();
        if len == 0 || len % 4 != 0 || u32::try_from(len / 4).is_err() {
            return Err(RingError::BadSize(len));
        }
        self.ring = Some(Ring {
            size_words: (len / 4) as u32,
            memory,
        });
        self.get = 0;
        self.put = 0;
        Ok(())
    }

    pub fn state(&self) -> CommandBufferState {
        CommandBufferState {
            get_offset: self.get,
            put_offset: self.put,
            token: self.decoder.token(),
            error: self.error,
        }
    }

    /// Execute everything between `get` and `put`.
    ///
    /// A failing batch leaves `get` on the offending packet so a corrected stream can be
    /// flushed again. After `LostContext` nothing is executed anymore.
    pub fn flush(&mut self, put: u32) -> CommandBufferState {
        if self.error == CommandStatus::LostContext {
            return self.state();
        }
        let Some(size_words) = self.ring.as_ref().map(|r| r.size_words) else {
            warn!("flush without a ring buffer");
            self.error = CommandStatus::InvalidArguments;
            return self.state();
        };
        if put >= size_words {
            warn!(put, size_words, "put offset outside the ring");
            self.error = CommandStatus::OutOfBounds;
            return self.state();
        }
        self.put = put;
        self.error = CommandStatus::NoError;

        while self.get != self.put {
            // Up to the end of the ring first, then wrap.
            let end = if self.put > self.get { self.put } else { size_words };
            let result = self.run(self.get, end);
            self.get += result.words_processed as u32;
            if result.status.is_error() {
                self.error = result.status;
                debug!(?result.status, get = self.get, "command buffer stopped");
                break;
            }
            if self.get == size_words {
                self.get = 0;
            }
        }
        if self.decoder.is_context_lost() {
            self.error = CommandStatus::LostContext;
        }
        self.state()
    }

    fn run(&mut self, start: u32, end: u32) -> ExecuteResult {
        let words = match &self.ring {
            Some(ring) => ring.words(start, end),
            None => Vec::new(),
        };
        self.decoder.execute(&words)
    }
}
