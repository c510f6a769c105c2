//! End-to-end NBD sessions over an in-memory duplex stream

use objnbd_block::{AttachmentRegistry, BlockError, MemoryBackend};
use objnbd_common::ConnectorConfig;
use objnbd_nbd::protocol::{
    NBD_CMD_DISC, NBD_CMD_FLUSH, NBD_CMD_READ, NBD_CMD_TRIM, NBD_CMD_WRITE, NBD_IHAVEOPT,
    NBD_OPT_EXPORT_NAME, NBD_REPLY_MAGIC, NBD_REQUEST_MAGIC, TRANSMISSION_FLAGS,
};
use objnbd_nbd::{ConnectionStats, NbdError, NbdResult, NbdServer, ProtocolError};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const OBJECT_SIZE: u64 = 4096;
const CAPACITY: u64 = 64 * OBJECT_SIZE;

struct Harness {
    backend: Arc<MemoryBackend>,
    registry: Arc<AttachmentRegistry>,
    server: NbdServer,
    _shutdown: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Harness {
    fn new(config: ConnectorConfig) -> Self {
        let backend = Arc::new(MemoryBackend::new());
        backend.add_volume("vol0", OBJECT_SIZE, CAPACITY);
        let registry = Arc::new(AttachmentRegistry::new(backend.clone(), "test"));
        let server = NbdServer::new(config, Arc::clone(&registry));
        let (shutdown, shutdown_rx) = watch::channel(false);
        Self {
            backend,
            registry,
            server,
            _shutdown: shutdown,
            shutdown_rx,
        }
    }

    fn connect(&self) -> (Client, JoinHandle<NbdResult<ConnectionStats>>) {
        self.connect_with_buffer(1 << 20)
    }

    /// Connect through a duplex pipe holding at most `buffer` bytes per direction
    fn connect_with_buffer(&self, buffer: usize) -> (Client, JoinHandle<NbdResult<ConnectionStats>>) {
        let (client, server_side) = tokio::io::duplex(buffer);
        let conn = self
            .server
            .connection(server_side, "duplex", self.shutdown_rx.clone());
        (Client { stream: client }, tokio::spawn(conn.run()))
    }
}

struct Client {
    stream: DuplexStream,
}

impl Client {
    async fn read_banner(&mut self) {
        let mut banner = [0u8; 18];
        self.stream.read_exact(&mut banner).await.unwrap();
        assert_eq!(&banner[..8], b"NBDMAGIC");
        assert_eq!(&banner[8..16], b"IHAVEOPT");
        assert_eq!(&banner[16..], &[0, 1]);
    }

    fn option_frame(name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&NBD_IHAVEOPT.to_be_bytes());
        out.extend_from_slice(&NBD_OPT_EXPORT_NAME.to_be_bytes());
        out.extend_from_slice(&(name.len() as u32).to_be_bytes());
        out.extend_from_slice(name.as_bytes());
        out
    }

    /// Full handshake; returns (export size, transmission flags)
    async fn negotiate(&mut self, export: &str) -> (u64, u16) {
        self.read_banner().await;
        self.stream.write_all(&[0u8; 8]).await.unwrap();
        self.stream
            .write_all(&Self::option_frame(export))
            .await
            .unwrap();

        let mut info = [0u8; 134];
        self.stream.read_exact(&mut info).await.unwrap();
        assert!(info[10..].iter().all(|b| *b == 0));
        (
            u64::from_be_bytes(info[..8].try_into().unwrap()),
            u16::from_be_bytes(info[8..10].try_into().unwrap()),
        )
    }

    fn request_frame(opcode: u32, handle: u64, offset: u64, length: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        out.extend_from_slice(&opcode.to_be_bytes());
        out.extend_from_slice(&handle.to_be_bytes());
        out.extend_from_slice(&offset.to_be_bytes());
        out.extend_from_slice(&length.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    async fn send(&mut self, opcode: u16, handle: u64, offset: u64, length: u32, payload: &[u8]) {
        let frame = Self::request_frame(u32::from(opcode), handle, offset, length, payload);
        self.stream.write_all(&frame).await.unwrap();
    }

    /// (error, handle)
    async fn reply(&mut self) -> (u32, u64) {
        let mut header = [0u8; 16];
        self.stream.read_exact(&mut header).await.unwrap();
        assert_eq!(
            u32::from_be_bytes(header[..4].try_into().unwrap()),
            NBD_REPLY_MAGIC
        );
        (
            u32::from_be_bytes(header[4..8].try_into().unwrap()),
            u64::from_be_bytes(header[8..].try_into().unwrap()),
        )
    }

    async fn write(&mut self, handle: u64, offset: u64, data: &[u8]) -> u32 {
        self.send(NBD_CMD_WRITE, handle, offset, data.len() as u32, data)
            .await;
        let (error, got) = self.reply().await;
        assert_eq!(got, handle);
        error
    }

    async fn read(&mut self, handle: u64, offset: u64, length: u32) -> Vec<u8> {
        self.send(NBD_CMD_READ, handle, offset, length, &[]).await;
        let (error, got) = self.reply().await;
        assert_eq!(error, 0);
        assert_eq!(got, handle);
        let mut data = vec![0u8; length as usize];
        self.stream.read_exact(&mut data).await.unwrap();
        data
    }

    /// Everything left until the server closes
    async fn drain(&mut self) -> Vec<u8> {
        let mut rest = Vec::new();
        self.stream.read_to_end(&mut rest).await.unwrap();
        rest
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8).collect()
}

#[tokio::test]
async fn handshake_advertises_export() {
    let harness = Harness::new(ConnectorConfig::default());
    let (mut client, conn) = harness.connect();

    let (size, flags) = client.negotiate("vol0").await;
    assert_eq!(size, CAPACITY);
    assert_eq!(flags, TRANSMISSION_FLAGS);
    assert_eq!(harness.registry.ref_count("vol0").await, 1);

    client.send(NBD_CMD_DISC, 1, 0, 0, &[]).await;
    assert!(client.drain().await.is_empty());
    let stats = conn.await.unwrap().unwrap();
    assert_eq!(stats.requests, 1);
    assert_eq!(harness.registry.ref_count("vol0").await, 0);
    assert_eq!(harness.backend.calls().detach, 1);
}

#[tokio::test]
async fn write_then_read_across_objects() {
    let harness = Harness::new(ConnectorConfig::default());
    let (mut client, conn) = harness.connect();
    client.negotiate("vol0").await;

    let payload = pattern(8192);
    assert_eq!(client.write(1, 100, &payload).await, 0);
    assert_eq!(client.read(2, 100, 8192).await, payload);

    // Unwritten space reads as zeros
    let zeros = client.read(3, 20 * OBJECT_SIZE, 5000).await;
    assert!(zeros.iter().all(|b| *b == 0));

    client.send(NBD_CMD_DISC, 4, 0, 0, &[]).await;
    client.drain().await;
    let stats = conn.await.unwrap().unwrap();
    assert_eq!(stats.writes, 1);
    assert_eq!(stats.reads, 2);
    assert_eq!(stats.bytes_written, 8192);
    assert_eq!(stats.bytes_read, 8192 + 5000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pipelined_requests_all_answered() {
    let config = ConnectorConfig {
        max_inflight_requests: 2,
        ..ConnectorConfig::default()
    };
    let harness = Harness::new(config);
    let (mut client, conn) = harness.connect();
    client.negotiate("vol0").await;

    // Same object, disjoint ranges, all in flight before any reply is read
    let mut frames = Vec::new();
    for handle in 0..16u64 {
        let data = vec![handle as u8 + 1; 100];
        frames.extend(Client::request_frame(
            u32::from(NBD_CMD_WRITE),
            handle,
            handle * 200,
            100,
            &data,
        ));
    }
    client.stream.write_all(&frames).await.unwrap();

    let mut seen = HashSet::new();
    for _ in 0..16 {
        let (error, handle) = client.reply().await;
        assert_eq!(error, 0);
        assert!(seen.insert(handle), "duplicate reply for {handle}");
    }
    assert_eq!(seen.len(), 16);

    let data = client.read(100, 0, 16 * 200).await;
    for handle in 0..16usize {
        let start = handle * 200;
        assert!(data[start..start + 100].iter().all(|b| *b == handle as u8 + 1));
        assert!(data[start + 100..start + 200].iter().all(|b| *b == 0));
    }

    client.send(NBD_CMD_DISC, 101, 0, 0, &[]).await;
    client.drain().await;
    conn.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unread_replies_pause_request_intake() {
    let config = ConnectorConfig {
        max_inflight_requests: 2,
        ..ConnectorConfig::default()
    };
    let harness = Harness::new(config);
    let (mut client, conn) = harness.connect_with_buffer(4096);
    client.negotiate("vol0").await;

    // Every read spans 4 objects and its reply is larger than the pipe
    let length = 4 * OBJECT_SIZE as u32;
    let mut frames = Vec::new();
    for handle in 0..64u64 {
        frames.extend(Client::request_frame(
            u32::from(NBD_CMD_READ),
            handle,
            0,
            length,
            &[],
        ));
    }
    client.stream.write_all(&frames).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    // Two slots, plus one request that may finish while the first reply drains
    let gets = harness.backend.calls().get;
    assert!(gets <= 3 * 4, "{gets} gets issued while no reply was read");

    let mut seen = HashSet::new();
    for _ in 0..64 {
        let (error, handle) = client.reply().await;
        assert_eq!(error, 0);
        assert!(seen.insert(handle));
        let mut data = vec![0u8; length as usize];
        client.stream.read_exact(&mut data).await.unwrap();
        assert!(data.iter().all(|b| *b == 0));
    }
    assert_eq!(harness.backend.calls().get, 64 * 4);

    client.send(NBD_CMD_DISC, 100, 0, 0, &[]).await;
    client.drain().await;
    let stats = conn.await.unwrap().unwrap();
    assert_eq!(stats.reads, 64);
    assert_eq!(stats.bytes_read, 64 * u64::from(length));
}

#[tokio::test]
async fn trim_and_flush() {
    let harness = Harness::new(ConnectorConfig::default());
    let (mut client, conn) = harness.connect();
    client.negotiate("vol0").await;

    client.write(1, 0, &vec![0xEE; 8192]).await;
    client.send(NBD_CMD_TRIM, 2, 1000, 5000, &[]).await;
    assert_eq!(client.reply().await, (0, 2));
    client.send(NBD_CMD_FLUSH, 3, 0, 0, &[]).await;
    assert_eq!(client.reply().await, (0, 3));

    let data = client.read(4, 0, 8192).await;
    assert!(data[..1000].iter().all(|b| *b == 0xEE));
    assert!(data[1000..6000].iter().all(|b| *b == 0));
    assert!(data[6000..].iter().all(|b| *b == 0xEE));

    drop(client);
    let stats = conn.await.unwrap().unwrap();
    assert_eq!(stats.trims, 1);
    assert_eq!(stats.flushes, 1);
}

#[tokio::test]
async fn out_of_range_gets_error_reply() {
    let harness = Harness::new(ConnectorConfig::default());
    let (mut client, conn) = harness.connect();
    client.negotiate("vol0").await;

    client.send(NBD_CMD_READ, 1, CAPACITY - 10, 20, &[]).await;
    assert_eq!(client.reply().await, (22, 1));

    // Connection still serves
    assert_eq!(client.write(2, CAPACITY - 10, &[1u8; 10]).await, 0);

    drop(client);
    let stats = conn.await.unwrap().unwrap();
    assert_eq!(stats.errors, 1);
}

#[tokio::test]
async fn backend_failure_gets_eio() {
    let harness = Harness::new(ConnectorConfig::default());
    let (mut client, conn) = harness.connect();
    client.negotiate("vol0").await;

    harness.backend.fail_get(1);
    client.send(NBD_CMD_READ, 1, 0, 3 * OBJECT_SIZE as u32, &[]).await;
    // Error replies carry no payload
    assert_eq!(client.reply().await, (5, 1));

    harness.backend.clear_faults();
    assert_eq!(client.read(2, 0, 16).await, vec![0u8; 16]);

    drop(client);
    conn.await.unwrap().unwrap();
}

#[tokio::test]
async fn option_before_ack_closes_without_backend_calls() {
    let harness = Harness::new(ConnectorConfig::default());
    let (mut client, conn) = harness.connect();

    client.read_banner().await;
    client
        .stream
        .write_all(&Client::option_frame("vol0"))
        .await
        .unwrap();

    assert!(client.drain().await.is_empty());
    let err = conn.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        NbdError::Protocol(ProtocolError::NonZeroAck(_))
    ));
    assert_eq!(harness.backend.calls().total(), 0);
}

#[tokio::test]
async fn bad_option_magic_closes_without_backend_calls() {
    let harness = Harness::new(ConnectorConfig::default());
    let (mut client, conn) = harness.connect();

    client.read_banner().await;
    client.stream.write_all(&[0u8; 8]).await.unwrap();
    let mut frame = Client::option_frame("vol0");
    frame[..8].copy_from_slice(b"NOTMAGIC");
    client.stream.write_all(&frame).await.unwrap();

    assert!(client.drain().await.is_empty());
    let err = conn.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        NbdError::Protocol(ProtocolError::BadOptionMagic(_))
    ));
    assert_eq!(harness.backend.calls().total(), 0);
}

#[tokio::test]
async fn bad_request_magic_releases_attachment() {
    let harness = Harness::new(ConnectorConfig::default());
    let (mut client, conn) = harness.connect();
    client.negotiate("vol0").await;

    let mut frame = Client::request_frame(u32::from(NBD_CMD_READ), 1, 0, 512, &[]);
    frame[0] = 0xff;
    client.stream.write_all(&frame).await.unwrap();

    assert!(client.drain().await.is_empty());
    let err = conn.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        NbdError::Protocol(ProtocolError::BadRequestMagic(_))
    ));
    assert_eq!(harness.registry.ref_count("vol0").await, 0);
    assert_eq!(harness.backend.calls().attach, 1);
    assert_eq!(harness.backend.calls().detach, 1);
}

#[tokio::test]
async fn oversized_request_is_fatal() {
    let config = ConnectorConfig {
        max_transfer_size: 64 * 1024,
        ..ConnectorConfig::default()
    };
    let harness = Harness::new(config);
    let (mut client, conn) = harness.connect();
    client.negotiate("vol0").await;

    client.send(NBD_CMD_READ, 1, 0, 64 * 1024 + 1, &[]).await;
    assert!(client.drain().await.is_empty());
    let err = conn.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        NbdError::Protocol(ProtocolError::TransferTooLarge { length, max })
            if length == 64 * 1024 + 1 && max == 64 * 1024
    ));
    assert_eq!(harness.backend.calls().get, 0);
}

#[tokio::test]
async fn trim_up_to_transfer_size_spans_objects() {
    let config = ConnectorConfig {
        max_transfer_size: 16 * 1024,
        ..ConnectorConfig::default()
    };
    let harness = Harness::new(config);
    let (mut client, conn) = harness.connect();
    client.negotiate("vol0").await;

    assert_eq!(client.write(1, 0, &vec![0xEE; 16 * 1024]).await, 0);
    client.send(NBD_CMD_TRIM, 2, 0, 16 * 1024, &[]).await;
    assert_eq!(client.reply().await, (0, 2));
    assert!(client.read(3, 0, 16 * 1024).await.iter().all(|b| *b == 0));

    // One byte over the limit ends the session like any oversized request
    client.send(NBD_CMD_TRIM, 4, 0, 16 * 1024 + 1, &[]).await;
    assert!(client.drain().await.is_empty());
    let err = conn.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        NbdError::Protocol(ProtocolError::TransferTooLarge { .. })
    ));
}

#[tokio::test]
async fn reused_handle_is_fatal_but_first_reply_arrives() {
    let harness = Harness::new(ConnectorConfig::default());
    let (mut client, conn) = harness.connect();
    client.negotiate("vol0").await;

    let mut frames = Client::request_frame(u32::from(NBD_CMD_WRITE), 7, 0, 4, b"abcd");
    frames.extend(Client::request_frame(
        u32::from(NBD_CMD_WRITE),
        7,
        8192,
        4,
        b"efgh",
    ));
    client.stream.write_all(&frames).await.unwrap();

    assert_eq!(client.reply().await, (0, 7));
    assert!(client.drain().await.is_empty());
    let err = conn.await.unwrap().unwrap_err();
    assert!(matches!(err, NbdError::Block(BlockError::HandleConflict(7))));
    assert_eq!(harness.registry.ref_count("vol0").await, 0);
}

#[tokio::test]
async fn unknown_export_closes_after_banner() {
    let harness = Harness::new(ConnectorConfig::default());
    let (mut client, conn) = harness.connect();

    client.read_banner().await;
    client.stream.write_all(&[0u8; 8]).await.unwrap();
    client
        .stream
        .write_all(&Client::option_frame("missing"))
        .await
        .unwrap();

    assert!(client.drain().await.is_empty());
    let err = conn.await.unwrap().unwrap_err();
    assert!(matches!(err, NbdError::Attach { ref export, .. } if export == "missing"));
    assert_eq!(harness.backend.calls().detach, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connections_share_one_attachment() {
    let harness = Harness::new(ConnectorConfig::default());
    let (mut a, conn_a) = harness.connect();
    let (mut b, conn_b) = harness.connect();
    a.negotiate("vol0").await;
    b.negotiate("vol0").await;
    assert_eq!(harness.backend.calls().attach, 1);
    assert_eq!(harness.registry.ref_count("vol0").await, 2);

    assert_eq!(a.write(1, 0, &[0xA1; 100]).await, 0);
    assert_eq!(b.write(1, 200, &[0xB2; 100]).await, 0);
    let data = a.read(2, 0, 300).await;
    assert!(data[..100].iter().all(|x| *x == 0xA1));
    assert!(data[200..].iter().all(|x| *x == 0xB2));

    drop(a);
    conn_a.await.unwrap().unwrap();
    assert_eq!(harness.backend.calls().detach, 0);
    drop(b);
    conn_b.await.unwrap().unwrap();
    assert_eq!(harness.backend.calls().detach, 1);
}

#[tokio::test]
async fn shutdown_drains_connection() {
    let harness = Harness::new(ConnectorConfig::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (stream, server_side) = tokio::io::duplex(1 << 16);
    let mut client = Client { stream };
    let conn = tokio::spawn(
        harness
            .server
            .connection(server_side, "duplex", shutdown_rx)
            .run(),
    );
    client.negotiate("vol0").await;
    assert_eq!(client.write(1, 0, &[1u8; 10]).await, 0);

    shutdown_tx.send(true).unwrap();
    assert!(client.drain().await.is_empty());
    conn.await.unwrap().unwrap();
    assert_eq!(harness.registry.ref_count("vol0").await, 0);
}
