//! objnbd NBD Server
//!
//! Speaks the NBD fixed-newstyle handshake and the simple transmission
//! protocol, and serves each client's requests through the block engine in
//! `objnbd-block`.
//!
//! # Layers
//!
//! - [`codec`]: incremental frame decoder and frame encoders, no I/O
//! - [`dispatcher`]: ordered outbound frame queue
//! - [`connection`]: per-client state machine driving one socket
//! - [`server`]: TCP accept loop with graceful shutdown

pub mod codec;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod server;

pub use codec::{FrameEvent, FrameKind, OutboundFrame, WireDecoder};
pub use connection::{Connection, ConnectionState, ConnectionStats, DispatchPhase, DispatchState};
pub use dispatcher::ReplyDispatcher;
pub use error::{NbdError, NbdResult, ProtocolError};
pub use protocol::{ClientRequest, Command};
pub use server::NbdServer;
