use bitflags::bitflags;
use gpucmd_protocol::{gl, CommandStatus};
use thiserror::Error;
use tracing::debug;

use crate::shared_memory::MemoryError;

/// GL-level validation error, recorded per context and never surfaced mid-stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GlError {
    InvalidEnum,
    InvalidValue,
    InvalidOperation,
    OutOfMemory,
    InvalidFramebufferOperation,
    ContextLost,
}

impl GlError {
    pub const fn code(self) -> u32 {
        match self {
            Self::InvalidEnum => gl::INVALID_ENUM,
            Self::InvalidValue => gl::INVALID_VALUE,
            Self::InvalidOperation => gl::INVALID_OPERATION,
            Self::OutOfMemory => gl::OUT_OF_MEMORY,
            Self::InvalidFramebufferOperation => gl::INVALID_FRAMEBUFFER_OPERATION,
            Self::ContextLost => gl::CONTEXT_LOST,
        }
    }

    const fn flag(self) -> ErrorFlags {
        match self {
            Self::InvalidEnum => ErrorFlags::INVALID_ENUM,
            Self::InvalidValue => ErrorFlags::INVALID_VALUE,
            Self::InvalidOperation => ErrorFlags::INVALID_OPERATION,
            Self::OutOfMemory => ErrorFlags::OUT_OF_MEMORY,
            Self::InvalidFramebufferOperation => ErrorFlags::INVALID_FRAMEBUFFER_OPERATION,
            Self::ContextLost => ErrorFlags::CONTEXT_LOST,
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ErrorFlags: u32 {
        const INVALID_ENUM = 1 << 0;
        const INVALID_VALUE = 1 << 1;
        const INVALID_OPERATION = 1 << 2;
        const OUT_OF_MEMORY = 1 << 3;
        const INVALID_FRAMEBUFFER_OPERATION = 1 << 4;
        const CONTEXT_LOST = 1 << 5;
    }
}

const ALL_ERRORS: [GlError; 6] = [
    GlError::InvalidEnum,
    GlError::InvalidValue,
    GlError::InvalidOperation,
    GlError::OutOfMemory,
    GlError::InvalidFramebufferOperation,
    GlError::ContextLost,
];

/// Sticky error queue: each distinct error is reported once until drained.
#[derive(Debug, Default)]
pub struct ErrorState {
    pending: ErrorFlags,
}

impl ErrorState {
    pub fn record(&mut self, err: GlError, function: &'static str, msg: &str) {
        debug!(function, code = err.code(), msg, "GL error");
        self.pending |= err.flag();
    }

    /// Drain the lowest pending error, or `GL_NO_ERROR`.
    pub fn take(&mut self) -> u32 {
        for err in ALL_ERRORS {
            if self.pending.contains(err.flag()) {
                self.pending.remove(err.flag());
                return err.code();
            }
        }
        gl::NO_ERROR
    }

    pub fn pending(&self) -> ErrorFlags {
        self.pending
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Failure that halts the current batch.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("invalid command arguments")]
    InvalidArguments,
    #[error("command references memory out of bounds: {0}")]
    OutOfBounds(#[from] MemoryError),
    #[error("inline payload shorter than declared")]
    PayloadTruncated,
    #[error("unknown or disabled command 0x{0:03x}")]
    UnknownCommand(u32),
    #[error("context lost")]
    LostContext,
}

impl ExecError {
    pub fn status(&self) -> CommandStatus {
        match self {
            Self::InvalidArguments => CommandStatus::InvalidArguments,
            Self::OutOfBounds(_) | Self::PayloadTruncated => CommandStatus::OutOfBounds,
            Self::UnknownCommand(_) => CommandStatus::UnknownCommand,
            Self::LostContext => CommandStatus::LostContext,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_sticky_and_reported_once() {
        let mut state = ErrorState::default();
        state.record(GlError::InvalidOperation, "glTest", "first");
        state.record(GlError::InvalidOperation, "glTest", "second");
        state.record(GlError::InvalidEnum, "glTest", "third");

        assert_eq!(state.take(), gl::INVALID_ENUM);
        assert_eq!(state.take(), gl::INVALID_OPERATION);
        assert_eq!(state.take(), gl::NO_ERROR);
        assert!(!state.has_pending());
    }
}
