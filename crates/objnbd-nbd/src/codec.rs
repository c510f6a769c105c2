//! Incremental NBD frame codec
//!
//! [`WireDecoder`] owns the inbound byte buffer and turns whatever has
//! arrived so far into complete frames. It never blocks and never touches
//! the socket: the connection appends bytes and asks for the next frame.
//! Headers are consumed once they are complete, so a frame split across
//! reads resumes exactly where the previous read stopped.
//!
//! Outbound frames are [`OutboundFrame`] values implementing [`Buf`], which
//! lets a partially written frame pick up at the first unsent byte.

use crate::error::ProtocolError;
use crate::protocol::{
    BANNER_LEN, CLIENT_ACK_LEN, ClientRequest, Command, EXPORT_INFO_LEN, EXPORT_INFO_PADDING,
    MAX_OPTION_LENGTH, NBD_IHAVEOPT, NBD_MAGIC, NBD_OPT_EXPORT_NAME, NBD_PROTOCOL_VERSION,
    NBD_REPLY_MAGIC, NBD_REQUEST_MAGIC, OPTION_HEADER_LEN, REPLY_HEADER_LEN, REQUEST_HEADER_LEN,
    TRANSMISSION_FLAGS, split_opcode,
};

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Result of asking the decoder for a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// The buffered bytes do not complete a frame yet
    NeedMoreData,
    /// The client acknowledged the banner
    HandshakeReady,
    /// The client asked for an export by name
    OptionReady(String),
    /// A complete transmission-phase request
    RequestReady(ClientRequest),
    /// The stream is unusable; every later call repeats this
    ProtocolError(ProtocolError),
}

/// Which frame the decoder expects next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePhase {
    HandshakeAck,
    Options,
    Transmission,
    Failed,
}

#[derive(Debug, Clone, Copy)]
struct OptionHeader {
    length: u32,
}

#[derive(Debug, Clone, Copy)]
struct RequestHeader {
    command: Command,
    flags: u16,
    handle: u64,
    offset: u64,
    length: u32,
}

/// Inbound half of the codec
pub struct WireDecoder {
    buffer: BytesMut,
    phase: DecodePhase,
    max_transfer_size: u32,
    pending_option: Option<OptionHeader>,
    pending_request: Option<RequestHeader>,
    failure: Option<ProtocolError>,
}

impl WireDecoder {
    pub fn new(max_transfer_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            phase: DecodePhase::HandshakeAck,
            max_transfer_size,
            pending_option: None,
            pending_request: None,
            failure: None,
        }
    }

    pub fn phase(&self) -> DecodePhase {
        self.phase
    }

    /// Bytes received but not yet consumed by a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Receive buffer for reading straight from the socket
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Append `data` and decode the next frame.
    pub fn feed(&mut self, data: &[u8]) -> FrameEvent {
        self.buffer.extend_from_slice(data);
        self.next_frame()
    }

    /// Decode the next frame from what is already buffered.
    pub fn next_frame(&mut self) -> FrameEvent {
        if let Some(err) = &self.failure {
            return FrameEvent::ProtocolError(err.clone());
        }

        let decoded = match self.phase {
            DecodePhase::HandshakeAck => self.decode_ack(),
            DecodePhase::Options => self.decode_option(),
            DecodePhase::Transmission => self.decode_request(),
            DecodePhase::Failed => Ok(FrameEvent::NeedMoreData),
        };

        decoded.unwrap_or_else(|err| {
            self.phase = DecodePhase::Failed;
            self.failure = Some(err.clone());
            self.buffer.clear();
            FrameEvent::ProtocolError(err)
        })
    }

    fn decode_ack(&mut self) -> Result<FrameEvent, ProtocolError> {
        if self.buffer.len() < CLIENT_ACK_LEN {
            return Ok(FrameEvent::NeedMoreData);
        }
        let ack = self.buffer.get_u64();
        if ack != 0 {
            return Err(ProtocolError::NonZeroAck(ack));
        }
        self.phase = DecodePhase::Options;
        Ok(FrameEvent::HandshakeReady)
    }

    fn decode_option(&mut self) -> Result<FrameEvent, ProtocolError> {
        let header = match self.pending_option {
            Some(header) => header,
            None => {
                if self.buffer.len() < OPTION_HEADER_LEN {
                    return Ok(FrameEvent::NeedMoreData);
                }
                let magic = self.buffer.get_u64();
                let code = self.buffer.get_u32();
                let length = self.buffer.get_u32();
                if magic != NBD_IHAVEOPT {
                    return Err(ProtocolError::BadOptionMagic(magic));
                }
                if code != NBD_OPT_EXPORT_NAME {
                    return Err(ProtocolError::UnsupportedOption(code));
                }
                if length > MAX_OPTION_LENGTH {
                    return Err(ProtocolError::OptionTooLarge {
                        length,
                        max: MAX_OPTION_LENGTH,
                    });
                }
                let header = OptionHeader { length };
                self.pending_option = Some(header);
                header
            }
        };

        if self.buffer.len() < header.length as usize {
            return Ok(FrameEvent::NeedMoreData);
        }
        let data = self.buffer.split_to(header.length as usize);
        self.pending_option = None;
        self.phase = DecodePhase::Transmission;
        Ok(FrameEvent::OptionReady(
            String::from_utf8_lossy(&data).into_owned(),
        ))
    }

    fn decode_request(&mut self) -> Result<FrameEvent, ProtocolError> {
        let header = match self.pending_request {
            Some(header) => header,
            None => {
                if self.buffer.len() < REQUEST_HEADER_LEN {
                    return Ok(FrameEvent::NeedMoreData);
                }
                let magic = self.buffer.get_u32();
                let opcode = self.buffer.get_u32();
                let handle = self.buffer.get_u64();
                let offset = self.buffer.get_u64();
                let length = self.buffer.get_u32();

                if magic != NBD_REQUEST_MAGIC {
                    return Err(ProtocolError::BadRequestMagic(magic));
                }
                let (cmd, flags) = split_opcode(opcode);
                let command = Command::from_wire(cmd).ok_or(ProtocolError::UnknownCommand(cmd))?;
                if length > self.max_transfer_size {
                    return Err(ProtocolError::TransferTooLarge {
                        length,
                        max: self.max_transfer_size,
                    });
                }

                let header = RequestHeader {
                    command,
                    flags,
                    handle,
                    offset,
                    length,
                };
                if command.has_payload() {
                    self.buffer.reserve(length as usize);
                }
                self.pending_request = Some(header);
                header
            }
        };

        let payload = if header.command.has_payload() {
            if self.buffer.len() < header.length as usize {
                return Ok(FrameEvent::NeedMoreData);
            }
            self.buffer.split_to(header.length as usize).freeze()
        } else {
            Bytes::new()
        };
        self.pending_request = None;

        Ok(FrameEvent::RequestReady(ClientRequest {
            command: header.command,
            flags: header.flags,
            handle: header.handle,
            offset: header.offset,
            length: header.length,
            payload,
        }))
    }
}

/// What an outbound frame is, so the connection can react once it is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Banner,
    ExportInfo,
    Reply,
}

/// Encoded frame: fixed header plus optional payload
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    kind: FrameKind,
    head: Bytes,
    body: Bytes,
}

impl OutboundFrame {
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Total size of the frame as encoded
    pub fn encoded_len(&self) -> usize {
        self.head.len() + self.body.len()
    }
}

impl Buf for OutboundFrame {
    fn remaining(&self) -> usize {
        self.head.remaining() + self.body.remaining()
    }

    fn chunk(&self) -> &[u8] {
        if self.head.has_remaining() {
            self.head.chunk()
        } else {
            self.body.chunk()
        }
    }

    fn advance(&mut self, mut cnt: usize) {
        let from_head = cnt.min(self.head.remaining());
        self.head.advance(from_head);
        cnt -= from_head;
        if cnt > 0 {
            self.body.advance(cnt);
        }
    }
}

/// Server greeting: magic, option magic, protocol version
pub fn encode_banner() -> OutboundFrame {
    let mut head = BytesMut::with_capacity(BANNER_LEN);
    head.put_u64(NBD_MAGIC);
    head.put_u64(NBD_IHAVEOPT);
    head.put_u16(NBD_PROTOCOL_VERSION);
    OutboundFrame {
        kind: FrameKind::Banner,
        head: head.freeze(),
        body: Bytes::new(),
    }
}

/// Reply to the export-name option: size, transmission flags, zero padding
pub fn encode_export_info(export_size: u64) -> OutboundFrame {
    let mut head = BytesMut::with_capacity(EXPORT_INFO_LEN);
    head.put_u64(export_size);
    head.put_u16(TRANSMISSION_FLAGS);
    head.put_bytes(0, EXPORT_INFO_PADDING);
    OutboundFrame {
        kind: FrameKind::ExportInfo,
        head: head.freeze(),
        body: Bytes::new(),
    }
}

/// Simple reply; `payload` only for successful reads
pub fn encode_reply(handle: u64, error: u32, payload: Bytes) -> OutboundFrame {
    let mut head = BytesMut::with_capacity(REPLY_HEADER_LEN);
    head.put_u32(NBD_REPLY_MAGIC);
    head.put_u32(error);
    head.put_u64(handle);
    OutboundFrame {
        kind: FrameKind::Reply,
        head: head.freeze(),
        body: payload,
    }
}
