//! Protocol constants shared by the codec and the connection engine.

/// Sentinel byte marking the start of every nceph frame.
pub const GENESIS: u8 = 0x4E;

/// Total header size in bytes, genesis included.
pub const HEADER_SIZE: usize = 16;

/// Header bytes remaining once the genesis byte has been consumed.
pub const HEADER_REMAINDER: usize = HEADER_SIZE - 1;

/// Trace flag: bit 0 of the flags byte.
pub const FLAG_TRACE: u8 = 0b0000_0001;

/// Upper bound for `data_length`; frames above this are treated as corruption.
pub const MAX_DATA_LENGTH: usize = 16 * 1024 * 1024;

/// Message ids are carried in 6 bytes on the wire.
pub const MAX_MESSAGE_ID: u64 = (1 << 48) - 1;
