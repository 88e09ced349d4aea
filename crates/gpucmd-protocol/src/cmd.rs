//! Command stream layout.
//!
//! A command stream is a sequence of little-endian 32-bit words. Every command starts with a
//! single header word: the low 21 bits carry the command size in words (header included), the
//! high 11 bits carry the opcode. Arguments follow the header. "Immediate" commands carry a
//! variable payload inline after their fixed arguments; everything larger is referenced through a
//! `(shm_id, shm_offset)` pair resolved against client-registered shared memory.

use core::fmt;

pub const CMD_SIZE_BITS: u32 = 21;
pub const MAX_CMD_SIZE_WORDS: u32 = (1 << CMD_SIZE_BITS) - 1;
pub const MAX_OPCODE: u32 = (1 << (32 - CMD_SIZE_BITS)) - 1;

/// Shared memory id that means "no client memory" (e.g. `TexImage2D` without pixels).
pub const NO_SHARED_MEMORY: u32 = 0;

/// Size in bytes of the `QuerySync` block a `BeginQuery` points at.
///
/// Layout: `process_count: u32`, 4 bytes padding, `result: u64`.
pub const QUERY_SYNC_SIZE_BYTES: u32 = 16;
pub const QUERY_SYNC_RESULT_OFFSET: u32 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CmdHeader {
    pub opcode: u32,
    pub size_words: u32,
}

impl CmdHeader {
    pub const fn new(opcode: u32, size_words: u32) -> Self {
        Self { opcode, size_words }
    }

    pub const fn pack(self) -> u32 {
        ((self.opcode & MAX_OPCODE) << CMD_SIZE_BITS) | (self.size_words & MAX_CMD_SIZE_WORDS)
    }

    pub const fn unpack(word: u32) -> Self {
        Self {
            opcode: word >> CMD_SIZE_BITS,
            size_words: word & MAX_CMD_SIZE_WORDS,
        }
    }
}

/// Per-batch status reported back to the client.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum CommandStatus {
    #[default]
    NoError = 0,
    InvalidArguments = 1,
    OutOfBounds = 2,
    UnknownCommand = 3,
    LostContext = 4,
}

impl CommandStatus {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::NoError),
            1 => Some(Self::InvalidArguments),
            2 => Some(Self::OutOfBounds),
            3 => Some(Self::UnknownCommand),
            4 => Some(Self::LostContext),
            _ => None,
        }
    }

    pub const fn is_error(self) -> bool {
        !matches!(self, Self::NoError)
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoError => "no error",
            Self::InvalidArguments => "invalid arguments",
            Self::OutOfBounds => "out of bounds",
            Self::UnknownCommand => "unknown command",
            Self::LostContext => "lost context",
        };
        f.write_str(s)
    }
}

/// Optional service capabilities that gate whole opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    Mailbox,
    SyncPoints,
    AsyncPixelTransfers,
    Images,
}

/// How the words following a command header are interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgLayout {
    /// Exactly this many argument words.
    Fixed(u32),
    /// At least `fixed` argument words followed by an inline payload whose length depends on the
    /// arguments.
    Immediate { fixed: u32 },
    /// Any number of words; the service ignores them.
    Variable,
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    Noop = 0x000,
    SetToken = 0x001,
    GetError = 0x002,

    GenTexturesImmediate = 0x010,
    DeleteTexturesImmediate = 0x011,
    BindTexture = 0x012,
    ActiveTexture = 0x013,
    TexImage2D = 0x014,
    TexSubImage2D = 0x015,
    TexParameteri = 0x016,

    GenBuffersImmediate = 0x020,
    DeleteBuffersImmediate = 0x021,
    BindBuffer = 0x022,
    BufferData = 0x023,
    BufferSubData = 0x024,

    GenFramebuffersImmediate = 0x030,
    DeleteFramebuffersImmediate = 0x031,
    BindFramebuffer = 0x032,
    FramebufferTexture2D = 0x033,
    FramebufferRenderbuffer = 0x034,
    CheckFramebufferStatus = 0x035,
    GenRenderbuffersImmediate = 0x038,
    DeleteRenderbuffersImmediate = 0x039,
    BindRenderbuffer = 0x03A,
    RenderbufferStorage = 0x03B,

    CreateShader = 0x040,
    DeleteShader = 0x041,
    CreateProgram = 0x042,
    DeleteProgram = 0x043,
    AttachShader = 0x044,
    LinkProgram = 0x045,
    UseProgram = 0x046,

    ClearColor = 0x050,
    Clear = 0x051,
    DrawArrays = 0x052,
    ReadPixels = 0x053,

    GenQueriesImmediate = 0x060,
    DeleteQueriesImmediate = 0x061,
    BeginQuery = 0x062,
    EndQuery = 0x063,

    ProduceTextureImmediate = 0x070,
    ConsumeTextureImmediate = 0x071,
    GenSyncPoint = 0x072,
    WaitSyncPoint = 0x073,

    BindTexImage2D = 0x078,
    ReleaseTexImage2D = 0x079,

    AsyncTexImage2D = 0x080,
    AsyncTexSubImage2D = 0x081,
    WaitAsyncTexImage2D = 0x082,
}

impl Opcode {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0x000 => Some(Self::Noop),
            0x001 => Some(Self::SetToken),
            0x002 => Some(Self::GetError),
            0x010 => Some(Self::GenTexturesImmediate),
            0x011 => Some(Self::DeleteTexturesImmediate),
            0x012 => Some(Self::BindTexture),
            0x013 => Some(Self::ActiveTexture),
            0x014 => Some(Self::TexImage2D),
            0x015 => Some(Self::TexSubImage2D),
            0x016 => Some(Self::TexParameteri),
            0x020 => Some(Self::GenBuffersImmediate),
            0x021 => Some(Self::DeleteBuffersImmediate),
            0x022 => Some(Self::BindBuffer),
            0x023 => Some(Self::BufferData),
            0x024 => Some(Self::BufferSubData),
            0x030 => Some(Self::GenFramebuffersImmediate),
            0x031 => Some(Self::DeleteFramebuffersImmediate),
            0x032 => Some(Self::BindFramebuffer),
            0x033 => Some(Self::FramebufferTexture2D),
            0x034 => Some(Self::FramebufferRenderbuffer),
            0x035 => Some(Self::CheckFramebufferStatus),
            0x038 => Some(Self::GenRenderbuffersImmediate),
            0x039 => Some(Self::DeleteRenderbuffersImmediate),
            0x03A => Some(Self::BindRenderbuffer),
            0x03B => Some(Self::RenderbufferStorage),
            0x040 => Some(Self::CreateShader),
            0x041 => Some(Self::DeleteShader),
            0x042 => Some(Self::CreateProgram),
            0x043 => Some(Self::DeleteProgram),
            0x044 => Some(Self::AttachShader),
            0x045 => Some(Self::LinkProgram),
            0x046 => Some(Self::UseProgram),
            0x050 => Some(Self::ClearColor),
            0x051 => Some(Self::Clear),
            0x052 => Some(Self::DrawArrays),
            0x053 => Some(Self::ReadPixels),
            0x060 => Some(Self::GenQueriesImmediate),
            0x061 => Some(Self::DeleteQueriesImmediate),
            0x062 => Some(Self::BeginQuery),
            0x063 => Some(Self::EndQuery),
            0x070 => Some(Self::ProduceTextureImmediate),
            0x071 => Some(Self::ConsumeTextureImmediate),
            0x072 => Some(Self::GenSyncPoint),
            0x073 => Some(Self::WaitSyncPoint),
            0x078 => Some(Self::BindTexImage2D),
            0x079 => Some(Self::ReleaseTexImage2D),
            0x080 => Some(Self::AsyncTexImage2D),
            0x081 => Some(Self::AsyncTexSubImage2D),
            0x082 => Some(Self::WaitAsyncTexImage2D),
            _ => None,
        }
    }

    pub const fn layout(self) -> ArgLayout {
        use ArgLayout::{Fixed, Immediate, Variable};
        match self {
            Self::Noop => Variable,
            Self::SetToken => Fixed(1),
            Self::GetError => Fixed(2),

            Self::GenTexturesImmediate
            | Self::DeleteTexturesImmediate
            | Self::GenBuffersImmediate
            | Self::DeleteBuffersImmediate
            | Self::GenFramebuffersImmediate
            | Self::DeleteFramebuffersImmediate
            | Self::GenRenderbuffersImmediate
            | Self::DeleteRenderbuffersImmediate
            | Self::GenQueriesImmediate
            | Self::DeleteQueriesImmediate => Immediate { fixed: 1 },
            Self::ProduceTextureImmediate | Self::ConsumeTextureImmediate => {
                Immediate { fixed: 1 }
            }

            Self::BindTexture => Fixed(2),
            Self::ActiveTexture => Fixed(1),
            Self::TexImage2D => Fixed(10),
            Self::TexSubImage2D => Fixed(10),
            Self::TexParameteri => Fixed(3),

            Self::BindBuffer => Fixed(2),
            Self::BufferData => Fixed(5),
            Self::BufferSubData => Fixed(5),

            Self::BindFramebuffer => Fixed(2),
            Self::FramebufferTexture2D => Fixed(5),
            Self::FramebufferRenderbuffer => Fixed(4),
            Self::CheckFramebufferStatus => Fixed(3),
            Self::BindRenderbuffer => Fixed(2),
            Self::RenderbufferStorage => Fixed(4),

            Self::CreateShader => Fixed(2),
            Self::DeleteShader => Fixed(1),
            Self::CreateProgram => Fixed(1),
            Self::DeleteProgram => Fixed(1),
            Self::AttachShader => Fixed(2),
            Self::LinkProgram => Fixed(1),
            Self::UseProgram => Fixed(1),

            Self::ClearColor => Fixed(4),
            Self::Clear => Fixed(1),
            Self::DrawArrays => Fixed(3),
            Self::ReadPixels => Fixed(8),

            Self::BeginQuery => Fixed(4),
            Self::EndQuery => Fixed(2),

            Self::GenSyncPoint => Fixed(2),
            Self::WaitSyncPoint => Fixed(1),

            Self::BindTexImage2D => Fixed(2),
            Self::ReleaseTexImage2D => Fixed(2),

            Self::AsyncTexImage2D => Fixed(10),
            Self::AsyncTexSubImage2D => Fixed(10),
            Self::WaitAsyncTexImage2D => Fixed(1),
        }
    }

    pub const fn capability(self) -> Option<Capability> {
        match self {
            Self::ProduceTextureImmediate | Self::ConsumeTextureImmediate => {
                Some(Capability::Mailbox)
            }
            Self::GenSyncPoint | Self::WaitSyncPoint => Some(Capability::SyncPoints),
            Self::BindTexImage2D | Self::ReleaseTexImage2D => Some(Capability::Images),
            Self::AsyncTexImage2D | Self::AsyncTexSubImage2D | Self::WaitAsyncTexImage2D => {
                Some(Capability::AsyncPixelTransfers)
            }
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmdStreamError {
    /// The header claims zero words, which would never advance the stream.
    ZeroSize { offset: usize },
    /// The header claims more words than remain in the buffer.
    Truncated {
        offset: usize,
        size_words: u32,
        remaining: usize,
    },
}

impl fmt::Display for CmdStreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroSize { offset } => write!(f, "zero-sized command at word {offset}"),
            Self::Truncated {
                offset,
                size_words,
                remaining,
            } => write!(
                f,
                "command at word {offset} claims {size_words} words but only {remaining} remain"
            ),
        }
    }
}

impl std::error::Error for CmdStreamError {}

#[derive(Clone, Copy, Debug)]
pub struct CmdPacket<'a> {
    pub header: CmdHeader,
    pub opcode: Option<Opcode>,
    pub args: &'a [u32],
}

impl CmdPacket<'_> {
    pub fn size_words(&self) -> usize {
        self.header.size_words as usize
    }
}

/// Read the packet starting at `offset`.
///
/// Only structural checks happen here; opcode gating and argument layout are the service's job.
pub fn read_packet(words: &[u32], offset: usize) -> Result<CmdPacket<'_>, CmdStreamError> {
    let remaining = words.len().saturating_sub(offset);
    let Some(&word) = words.get(offset) else {
        return Err(CmdStreamError::Truncated {
            offset,
            size_words: 1,
            remaining,
        });
    };
    let header = CmdHeader::unpack(word);
    if header.size_words == 0 {
        return Err(CmdStreamError::ZeroSize { offset });
    }
    let size = header.size_words as usize;
    if size > remaining {
        return Err(CmdStreamError::Truncated {
            offset,
            size_words: header.size_words,
            remaining,
        });
    }
    Ok(CmdPacket {
        header,
        opcode: Opcode::from_u32(header.opcode),
        args: &words[offset + 1..offset + size],
    })
}

/// Iterates `(word_offset, packet)` pairs, stopping after the first structural error.
pub struct CmdStreamIter<'a> {
    words: &'a [u32],
    offset: usize,
    done: bool,
}

impl<'a> CmdStreamIter<'a> {
    pub fn new(words: &'a [u32]) -> Self {
        Self {
            words,
            offset: 0,
            done: false,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for CmdStreamIter<'a> {
    type Item = Result<(usize, CmdPacket<'a>), CmdStreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.words.len() {
            return None;
        }
        match read_packet(self.words, self.offset) {
            Ok(packet) => {
                let at = self.offset;
                self.offset += packet.size_words();
                Some(Ok((at, packet)))
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
