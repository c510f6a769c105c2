//! NBD connector error types

use objnbd_block::BlockError;
use thiserror::Error;

/// Fatal framing violation by the peer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("client handshake acknowledgement must be zero, got {0:#018x}")]
    NonZeroAck(u64),

    #[error("bad option magic: {0:#018x}")]
    BadOptionMagic(u64),

    #[error("unsupported option {0}")]
    UnsupportedOption(u32),

    #[error("option data of {length}B exceeds {max}B")]
    OptionTooLarge { length: u32, max: u32 },

    #[error("bad request magic: {0:#010x}")]
    BadRequestMagic(u32),

    #[error("unknown command {0}")]
    UnknownCommand(u16),

    #[error("request length {length}B exceeds maximum transfer size {max}B")]
    TransferTooLarge { length: u32, max: u32 },
}

/// NBD connector error
#[derive(Error, Debug)]
pub enum NbdError {
    /// Socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer broke the wire protocol
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Block engine refused the request
    #[error("block error: {0}")]
    Block(#[from] BlockError),

    /// The requested export could not be attached
    #[error("export '{export}' unavailable: {source}")]
    Attach {
        export: String,
        #[source]
        source: BlockError,
    },

    /// Frame processing was entered while already running
    #[error("connection dispatch re-entered")]
    Reentered,
}

/// Result type for NBD connector operations
pub type NbdResult<T> = Result<T, NbdError>;
