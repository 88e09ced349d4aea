//! Wire format shared by GPU command clients and the service that executes them.

pub mod cmd;
pub mod gl;
pub mod mailbox;
pub mod writer;

pub use cmd::{
    read_packet, ArgLayout, Capability, CmdHeader, CmdPacket, CmdStreamError, CmdStreamIter, CommandStatus, Opcode,
    QUERY_SYNC_RESULT_OFFSET, QUERY_SYNC_SIZE_BYTES,
};
pub use mailbox::Mailbox;
pub use writer::CmdWriter;
