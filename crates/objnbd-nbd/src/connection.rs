//! Per-client connection state machine
//!
//! ```text
//! PreInit ──banner sent──▶ PostInit ──ack──▶ AwaitingOptions
//!    ──export name, attach──▶ SendingOptions ──export info sent──▶ ServingRequests
//! any ──fatal error | shutdown | disconnect | EOF──▶ Draining ──tasks done──▶ Stopped
//! ```
//!
//! One driver task owns the socket. Each loop iteration waits for whichever
//! comes first: a finished task, write progress on the front reply, inbound
//! bytes, the attach result, or shutdown. Inbound bytes are only read while
//! the state accepts frames and the in-flight cap leaves room. A request
//! holds its slot until its reply has been fully written.

#![allow(clippy::cast_possible_truncation)]

use crate::codec::{DecodePhase, FrameEvent, FrameKind, OutboundFrame, WireDecoder};
use crate::dispatcher::ReplyDispatcher;
use crate::error::{NbdError, NbdResult};
use crate::protocol::{ClientRequest, Command};

use bytes::{Buf, BytesMut};
use futures::future::BoxFuture;
use objnbd_block::{
    AttachmentHandle, AttachmentRegistry, BlockResult, CompletionSink, IoRequest, OpKind,
    PendingTable, Task, VolumeIo,
};
use objnbd_common::ConnectorConfig;
use std::fmt;
use std::future::pending;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

const READ_CHUNK: usize = 64 * 1024;

/// Lifecycle of one client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    PreInit,
    PostInit,
    AwaitingOptions,
    SendingOptions,
    ServingRequests,
    Draining,
    Stopped,
}

impl ConnectionState {
    /// States in which inbound frames are decoded
    fn accepts_frames(self) -> bool {
        matches!(
            self,
            Self::PostInit | Self::AwaitingOptions | Self::ServingRequests
        )
    }
}

/// Whether frame processing is currently running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    Idle,
    Processing,
}

/// Non-reentrant guard around decode/dispatch
#[derive(Debug, Clone, Default)]
pub struct DispatchState {
    processing: Arc<AtomicBool>,
}

impl DispatchState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> DispatchPhase {
        if self.processing.load(Ordering::Acquire) {
            DispatchPhase::Processing
        } else {
            DispatchPhase::Idle
        }
    }

    /// Move Idle to Processing, or refuse if already processing.
    pub fn enter(&self) -> NbdResult<DispatchGuard> {
        self.processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| NbdError::Reentered)?;
        Ok(DispatchGuard {
            processing: Arc::clone(&self.processing),
        })
    }
}

/// Returns the dispatch state to Idle on drop
pub struct DispatchGuard {
    processing: Arc<AtomicBool>,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        self.processing.store(false, Ordering::Release);
    }
}

/// Counters reported when a connection ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub requests: u64,
    pub reads: u64,
    pub writes: u64,
    pub trims: u64,
    pub flushes: u64,
    /// Payload bytes returned to the client
    pub bytes_read: u64,
    /// Payload bytes received from the client
    pub bytes_written: u64,
    /// Replies carrying a non-zero error
    pub errors: u64,
    /// Replies dropped because the socket failed
    pub abandoned: u64,
}

impl fmt::Display for ConnectionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} requests ({} read, {} write, {} trim, {} flush), {}B out, {}B in, {} errors, {} abandoned",
            self.requests,
            self.reads,
            self.writes,
            self.trims,
            self.flushes,
            self.bytes_read,
            self.bytes_written,
            self.errors,
            self.abandoned
        )
    }
}

type AttachFuture = BoxFuture<'static, BlockResult<Arc<AttachmentHandle>>>;

/// One NBD client session over any byte stream
pub struct Connection<S> {
    id: Uuid,
    peer: String,
    stream: S,
    config: Arc<ConnectorConfig>,
    registry: Arc<AttachmentRegistry>,
    shutdown: watch::Receiver<bool>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    pub fn new(
        stream: S,
        peer: impl fmt::Display,
        config: Arc<ConnectorConfig>,
        registry: Arc<AttachmentRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer: peer.to_string(),
            stream,
            config,
            registry,
            shutdown,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Serve the client until the connection stops.
    ///
    /// Returns the fatal error that ended the session, if any. The volume
    /// attachment is released before returning in every case.
    pub async fn run(self) -> NbdResult<ConnectionStats> {
        let span = info_span!("nbd_conn", id = %self.id, peer = %self.peer);
        self.drive().instrument(span).await
    }

    async fn drive(self) -> NbdResult<ConnectionStats> {
        let Self {
            stream,
            config,
            registry,
            mut shutdown,
            ..
        } = self;
        info!("NBD: client connected");

        let capacity = config.max_inflight_requests.max(1);
        let (ready_tx, mut ready_rx) = mpsc::channel(capacity);
        let mut session = Session {
            state: ConnectionState::PreInit,
            dispatch: DispatchState::new(),
            decoder: WireDecoder::new(config.max_transfer_size),
            replies: ReplyDispatcher::new(),
            table: Arc::new(PendingTable::new()),
            ready_tx,
            config,
            registry,
            attach: None,
            export: None,
            io: None,
            attachment: None,
            read_open: true,
            write_failed: false,
            shutdown_armed: true,
            failure: None,
            stats: ConnectionStats::default(),
        };
        session.replies.push_banner();
        if *shutdown.borrow() {
            session.begin_drain("server shutting down");
        }

        let (mut reader, mut writer) = tokio::io::split(stream);

        loop {
            if session.drained() {
                break;
            }
            let want_read = session.wants_read();
            let want_write = !session.write_failed;

            tokio::select! {
                Some(task) = ready_rx.recv() => {
                    session.on_task_ready(task).await;
                }
                result = write_front(&mut writer, session.replies.front_mut(), want_write) => {
                    session.on_write(result).await;
                }
                result = read_into(&mut reader, session.decoder.buffer_mut(), want_read) => {
                    session.on_read(result).await;
                }
                result = await_attach(&mut session.attach) => {
                    session.on_attached(result);
                }
                changed = shutdown.changed(), if session.shutdown_armed => {
                    session.shutdown_armed = false;
                    if changed.is_ok() && *shutdown.borrow() {
                        session.begin_drain("server shutting down");
                    }
                }
            }
        }

        session.stop().await
    }
}

/// Mutable per-connection state owned by the driver loop
struct Session {
    state: ConnectionState,
    dispatch: DispatchState,
    decoder: WireDecoder,
    replies: ReplyDispatcher,
    table: Arc<PendingTable>,
    ready_tx: mpsc::Sender<Arc<Task>>,
    config: Arc<ConnectorConfig>,
    registry: Arc<AttachmentRegistry>,
    attach: Option<AttachFuture>,
    export: Option<String>,
    io: Option<VolumeIo>,
    attachment: Option<Arc<AttachmentHandle>>,
    read_open: bool,
    write_failed: bool,
    shutdown_armed: bool,
    failure: Option<NbdError>,
    stats: ConnectionStats,
}

impl Session {
    fn wants_read(&self) -> bool {
        self.read_open && self.state.accepts_frames() && !self.at_inflight_cap()
    }

    /// Outstanding tasks plus replies not yet fully written
    fn at_inflight_cap(&self) -> bool {
        self.table.len() + self.replies.len() >= self.config.max_inflight_requests.max(1)
    }

    /// Draining is over: nothing outstanding and nothing left to send
    fn drained(&self) -> bool {
        self.state == ConnectionState::Draining
            && self.table.is_empty()
            && self.attach.is_none()
            && (self.replies.is_empty() || self.write_failed)
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!("NBD: {:?} -> {next:?}", self.state);
            self.state = next;
        }
    }

    fn begin_drain(&mut self, reason: &str) {
        if matches!(
            self.state,
            ConnectionState::Draining | ConnectionState::Stopped
        ) {
            return;
        }
        debug!("NBD: draining: {reason}");
        self.read_open = false;
        self.transition(ConnectionState::Draining);
    }

    fn fail(&mut self, err: NbdError) {
        warn!("NBD: {err}");
        if self.failure.is_none() {
            self.failure = Some(err);
        }
        self.begin_drain("fatal error");
    }

    /// Decode and dispatch every complete buffered frame the state allows.
    async fn process_frames(&mut self) {
        let _guard = match self.dispatch.enter() {
            Ok(guard) => guard,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        while self.state.accepts_frames() && !self.at_inflight_cap() {
            match self.decoder.next_frame() {
                FrameEvent::NeedMoreData => break,
                FrameEvent::HandshakeReady => {
                    self.transition(ConnectionState::AwaitingOptions);
                }
                FrameEvent::OptionReady(export) => self.begin_attach(export),
                FrameEvent::RequestReady(request) => self.dispatch_request(request).await,
                FrameEvent::ProtocolError(e) => self.fail(e.into()),
            }
        }
    }

    fn begin_attach(&mut self, export: String) {
        info!("NBD: client requested export '{export}'");
        let registry = Arc::clone(&self.registry);
        let name = export.clone();
        self.attach = Some(Box::pin(async move { registry.acquire(&name).await }));
        self.export = Some(export);
        self.transition(ConnectionState::SendingOptions);
    }

    fn on_attached(&mut self, result: BlockResult<Arc<AttachmentHandle>>) {
        let export = self.export.clone().unwrap_or_default();
        match result {
            Ok(attachment) => {
                let geometry = attachment.geometry();
                self.attachment = Some(Arc::clone(&attachment));
                if self.state != ConnectionState::SendingOptions {
                    // Shut down while attaching; released in stop()
                    return;
                }
                let sink = Arc::new(CompletionSink::new(
                    Arc::clone(&self.table),
                    self.ready_tx.clone(),
                ));
                self.io = Some(VolumeIo::new(
                    self.registry.backend(),
                    attachment,
                    self.config.blob.as_str(),
                    sink,
                ));
                self.replies.push_export_info(geometry.capacity);
                info!(
                    "NBD: serving '{export}' ({}B, {}B objects)",
                    geometry.capacity, geometry.object_size
                );
            }
            Err(source) => self.fail(NbdError::Attach { export, source }),
        }
    }

    async fn dispatch_request(&mut self, request: ClientRequest) {
        self.stats.requests += 1;
        let kind = match request.command {
            Command::Disconnect => {
                info!("NBD: client sent disconnect");
                self.begin_drain("client disconnect");
                return;
            }
            Command::Read => {
                self.stats.reads += 1;
                OpKind::Read
            }
            Command::Write => {
                self.stats.writes += 1;
                self.stats.bytes_written += u64::from(request.length);
                OpKind::Write
            }
            Command::Trim => {
                self.stats.trims += 1;
                OpKind::Trim
            }
            Command::Flush => {
                self.stats.flushes += 1;
                OpKind::Flush
            }
        };

        let Some(io) = &self.io else {
            self.fail(NbdError::Io(io::Error::other("request before export attached")));
            return;
        };
        let submitted = io
            .submit(IoRequest {
                handle: request.handle,
                kind,
                offset: request.offset,
                length: request.length,
                payload: request.payload,
            })
            .await;
        if let Err(e) = submitted {
            self.fail(e.into());
        }
    }

    async fn on_task_ready(&mut self, task: Arc<Task>) {
        self.table.finish(task.handle());
        if task.errno() != 0 {
            self.stats.errors += 1;
            debug!(
                "NBD: handle {:#x} failed: {}",
                task.handle(),
                task.error().map(ToString::to_string).unwrap_or_default()
            );
        }

        if self.write_failed {
            self.stats.abandoned += 1;
        } else {
            let sent = self.replies.push_reply(&task);
            self.stats.bytes_read += sent as u64;
        }

        // Only frees a slot if the reply was abandoned
        self.process_frames().await;
    }

    async fn on_write(&mut self, result: io::Result<FrameKind>) {
        match result {
            Ok(kind) => {
                self.replies.pop_sent();
                match kind {
                    FrameKind::Banner => {
                        if self.state == ConnectionState::PreInit {
                            self.transition(ConnectionState::PostInit);
                        }
                        self.process_frames().await;
                    }
                    FrameKind::ExportInfo => {
                        if self.state == ConnectionState::SendingOptions {
                            self.transition(ConnectionState::ServingRequests);
                        }
                        self.process_frames().await;
                    }
                    FrameKind::Reply => {
                        // Freed an in-flight slot
                        self.process_frames().await;
                    }
                }
            }
            Err(e) => {
                warn!("NBD: write failed: {e}");
                self.write_failed = true;
                self.stats.abandoned += self.replies.abandon() as u64;
                self.begin_drain("write failed");
            }
        }
    }

    async fn on_read(&mut self, result: io::Result<usize>) {
        match result {
            Ok(0) => {
                if self.decoder.buffered() > 0 {
                    debug!(
                        "NBD: client closed with {}B undecoded",
                        self.decoder.buffered()
                    );
                }
                if self.decoder.phase() != DecodePhase::Transmission {
                    debug!("NBD: client closed during negotiation");
                }
                self.begin_drain("client closed");
            }
            Ok(_) => self.process_frames().await,
            Err(e) => {
                warn!("NBD: read failed: {e}");
                self.begin_drain("read failed");
            }
        }
    }

    /// Release the attachment exactly once and report.
    async fn stop(mut self) -> NbdResult<ConnectionStats> {
        self.io = None;
        if let Some(attachment) = self.attachment.take()
            && let Err(e) = self.registry.release(&attachment).await
        {
            warn!("NBD: release of '{}' failed: {e}", attachment.volume());
        }
        self.transition(ConnectionState::Stopped);
        info!("NBD: client disconnected: {}", self.stats);

        match self.failure {
            Some(err) => Err(err),
            None => Ok(self.stats),
        }
    }
}

/// Write progress on the front frame; resolves once that frame is fully sent.
async fn write_front<W>(
    writer: &mut W,
    frame: Option<&mut OutboundFrame>,
    enabled: bool,
) -> io::Result<FrameKind>
where
    W: AsyncWrite + Unpin,
{
    let Some(frame) = frame.filter(|_| enabled) else {
        return pending().await;
    };
    while frame.has_remaining() {
        if writer.write_buf(frame).await? == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
    }
    writer.flush().await?;
    Ok(frame.kind())
}

async fn read_into<R>(reader: &mut R, buffer: &mut BytesMut, enabled: bool) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    if !enabled {
        return pending().await;
    }
    buffer.reserve(READ_CHUNK);
    reader.read_buf(buffer).await
}

async fn await_attach(attach: &mut Option<AttachFuture>) -> BlockResult<Arc<AttachmentHandle>> {
    let result = match attach.as_mut() {
        Some(fut) => fut.await,
        None => return pending().await,
    };
    *attach = None;
    result
}
