//! NBD wire constants and decoded request types
//!
//! Fixed newstyle handshake with a single export-name option, followed by the
//! simple request/reply transmission phase. All integers are big-endian.

use bytes::Bytes;

// ── Handshake ─────────────────────────────────────────────────────────────────

pub const NBD_MAGIC: u64 = 0x4e42_444d_4147_4943; // "NBDMAGIC"
pub const NBD_IHAVEOPT: u64 = 0x4948_4156_454f_5054; // "IHAVEOPT"

/// Protocol version announced after the banner magics
pub const NBD_PROTOCOL_VERSION: u16 = 1;

/// banner: magic(8) + ihaveopt(8) + version(2)
pub const BANNER_LEN: usize = 18;

/// Client acknowledgement following the banner; must be all zero
pub const CLIENT_ACK_LEN: usize = 8;

// ── Options ───────────────────────────────────────────────────────────────────

pub const NBD_OPT_EXPORT_NAME: u32 = 1;

/// option header: magic(8) + code(4) + length(4)
pub const OPTION_HEADER_LEN: usize = 16;

/// Longest export name accepted
pub const MAX_OPTION_LENGTH: u32 = 4096;

/// export reply: size(8) + transport flags(2) + zeroes(124)
pub const EXPORT_INFO_LEN: usize = 134;
pub const EXPORT_INFO_PADDING: usize = 124;

// Transmission flags
pub const NBD_FLAG_HAS_FLAGS: u16 = 0x0001;
pub const NBD_FLAG_SEND_FLUSH: u16 = 0x0004;
/// Trims obey the same `max_transfer_size` as reads and writes; a longer
/// one is a fatal protocol error like any oversized request.
pub const NBD_FLAG_SEND_TRIM: u16 = 0x0008;

/// Flags advertised with every export
pub const TRANSMISSION_FLAGS: u16 = NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH | NBD_FLAG_SEND_TRIM;

// ── Transmission ──────────────────────────────────────────────────────────────

pub const NBD_REQUEST_MAGIC: u32 = 0x2560_9513;
pub const NBD_REPLY_MAGIC: u32 = 0x6744_6698;

/// request header: magic(4) + opcode(4) + handle(8) + offset(8) + length(4)
pub const REQUEST_HEADER_LEN: usize = 28;

/// reply header: magic(4) + error(4) + handle(8)
pub const REPLY_HEADER_LEN: usize = 16;

pub const NBD_CMD_READ: u16 = 0;
pub const NBD_CMD_WRITE: u16 = 1;
pub const NBD_CMD_DISC: u16 = 2;
pub const NBD_CMD_FLUSH: u16 = 3;
pub const NBD_CMD_TRIM: u16 = 4;

/// Client command selected by the low 16 bits of the opcode field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Read,
    Write,
    Disconnect,
    Flush,
    Trim,
}

impl Command {
    pub fn from_wire(cmd: u16) -> Option<Self> {
        match cmd {
            NBD_CMD_READ => Some(Self::Read),
            NBD_CMD_WRITE => Some(Self::Write),
            NBD_CMD_DISC => Some(Self::Disconnect),
            NBD_CMD_FLUSH => Some(Self::Flush),
            NBD_CMD_TRIM => Some(Self::Trim),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u16 {
        match self {
            Self::Read => NBD_CMD_READ,
            Self::Write => NBD_CMD_WRITE,
            Self::Disconnect => NBD_CMD_DISC,
            Self::Flush => NBD_CMD_FLUSH,
            Self::Trim => NBD_CMD_TRIM,
        }
    }

    /// Carries a payload after the header
    pub fn has_payload(self) -> bool {
        self == Self::Write
    }
}

/// One fully decoded transmission-phase request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    pub command: Command,
    /// Upper 16 bits of the opcode field (FUA and friends); not acted on
    pub flags: u16,
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
    /// Write data, exactly `length` bytes; empty otherwise
    pub payload: Bytes,
}

/// Split the 32-bit opcode field into (command, flags).
pub fn split_opcode(opcode: u32) -> (u16, u16) {
    ((opcode & 0xffff) as u16, (opcode >> 16) as u16)
}
