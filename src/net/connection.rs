//! One TCP connection: framed requests out, demultiplexed responses in.
//!
//! The writer half stays with the `Connection`; a spawned reader thread
//! owns a clone of the socket and runs the read loop. The correlation
//! table (opaque to waiter) is the only thing that pipelines on the wire:
//! the pool serialises writes, responses stream back in any order.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, bounded};

use crate::config::KvConfig;
use crate::error::KvError;
use crate::proto::{HEADER_LEN, KvRequest, ResponseHeader, ServerResponse};

use super::Endpoint;

pub type CompletionSender = Sender<Result<ServerResponse, KvError>>;
pub type CompletionReceiver = Receiver<Result<ServerResponse, KvError>>;

/// One-shot completion channel for a single operation.
pub fn completion_channel() -> (CompletionSender, CompletionReceiver) {
    bounded(1)
}

/// Registered continuation for an in-flight opaque.
///
/// Dropping `settled` is what releases the pool worker, so the worker is
/// freed exactly when the response is delivered or the connection dies.
struct Waiter {
    complete: CompletionSender,
    settled: Sender<()>,
}

struct Shared {
    endpoint: Endpoint,
    dead: AtomicBool,
    inflight: Mutex<HashMap<u32, Waiter>>,
    bytes_received: AtomicU64,
    last_activity: Mutex<Instant>,
}

impl Shared {
    fn transport_error(&self, reason: impl Into<String>, during_send: bool) -> KvError {
        KvError::Transport {
            endpoint: self.endpoint.to_string(),
            reason: reason.into(),
            during_send,
        }
    }

    /// Monotonic death: once set, pending waiters fail and new sends are
    /// refused.
    fn mark_dead_and_fail(&self, reason: &str) {
        let already = self.dead.swap(true, Ordering::SeqCst);
        let mut inflight = self.inflight.lock().expect("correlation table lock poisoned");
        if !already && !inflight.is_empty() {
            tracing::warn!(
                endpoint = %self.endpoint,
                pending = inflight.len(),
                "failing in-flight operations: {reason}"
            );
        }
        for (_, waiter) in inflight.drain() {
            let _ = waiter
                .complete
                .send(Err(self.transport_error(reason.to_string(), false)));
        }
    }
}

pub struct Connection {
    shared: Arc<Shared>,
    writer: Mutex<TcpStream>,
    opaque: AtomicU32,
    bytes_sent: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
    max_packet_bytes: usize,
}

impl Connection {
    /// Wrap an established socket and start its read loop.
    pub fn from_stream(
        endpoint: Endpoint,
        stream: TcpStream,
        max_packet_bytes: usize,
    ) -> std::io::Result<Self> {
        let reader_stream = stream.try_clone()?;
        let shared = Arc::new(Shared {
            endpoint,
            dead: AtomicBool::new(false),
            inflight: Mutex::new(HashMap::new()),
            bytes_received: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
        });
        let reader_shared = Arc::clone(&shared);
        let reader = thread::spawn(move || {
            run_read_loop(reader_stream, reader_shared, max_packet_bytes);
        });
        Ok(Self {
            shared,
            writer: Mutex::new(stream),
            opaque: AtomicU32::new(1),
            bytes_sent: AtomicU64::new(0),
            reader: Mutex::new(Some(reader)),
            max_packet_bytes,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    pub fn is_dead(&self) -> bool {
        self.shared.dead.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.shared
            .inflight
            .lock()
            .expect("correlation table lock poisoned")
            .len()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.shared.bytes_received.load(Ordering::Relaxed)
    }

    pub fn last_activity(&self) -> Instant {
        *self
            .shared
            .last_activity
            .lock()
            .expect("activity lock poisoned")
    }

    /// Frame and send one request, registering its continuation.
    ///
    /// Returns a receiver that disconnects when the waiter settles, which
    /// is how the pool worker knows this connection is free again. The
    /// caller's completion is delivered by the read loop.
    pub fn execute(
        &self,
        request: &KvRequest,
        complete: CompletionSender,
    ) -> Result<Receiver<()>, KvError> {
        if self.is_dead() {
            return Err(self.shared.transport_error("connection is dead", true));
        }

        let opaque = self.opaque.fetch_add(1, Ordering::Relaxed);
        let frame = request.encode(opaque, self.max_packet_bytes)?;

        let (settled_tx, settled_rx) = bounded(1);
        {
            let mut inflight = self
                .shared
                .inflight
                .lock()
                .expect("correlation table lock poisoned");
            debug_assert!(!inflight.contains_key(&opaque));
            inflight.insert(
                opaque,
                Waiter {
                    complete,
                    settled: settled_tx,
                },
            );
        }

        let write_result = {
            let mut writer = self.writer.lock().expect("writer lock poisoned");
            writer.write_all(&frame)
        };
        if let Err(err) = write_result {
            // Fail this send distinctly: the frame never left, so the
            // caller may requeue. Everything else in flight is ambiguous.
            self.shared
                .inflight
                .lock()
                .expect("correlation table lock poisoned")
                .remove(&opaque);
            self.shared.mark_dead_and_fail(&err.to_string());
            self.shutdown_socket();
            return Err(self.shared.transport_error(err.to_string(), true));
        }
        self.bytes_sent.fetch_add(frame.len() as u64, Ordering::Relaxed);
        Ok(settled_rx)
    }

    fn shutdown_socket(&self) {
        let writer = self.writer.lock().expect("writer lock poisoned");
        let _ = writer.shutdown(Shutdown::Both);
    }

    /// Tear the connection down: fail waiters, close the socket, join the
    /// reader.
    pub fn close(&self) {
        self.shared.mark_dead_and_fail("connection closed");
        self.shutdown_socket();
        let handle = self
            .reader
            .lock()
            .expect("reader handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Do not join here: the reader exits on its own once the socket
        // shuts down.
        self.shared.dead.store(true, Ordering::SeqCst);
        self.shutdown_socket();
    }
}

fn run_read_loop(mut stream: TcpStream, shared: Arc<Shared>, max_packet_bytes: usize) {
    loop {
        let mut header_bytes = [0u8; HEADER_LEN];
        if let Err(err) = stream.read_exact(&mut header_bytes) {
            shared.mark_dead_and_fail(&format!("read failed: {err}"));
            tracing::debug!(endpoint = %shared.endpoint, "read loop ended: {err}");
            return;
        }

        let header = match ResponseHeader::parse(&header_bytes) {
            Ok(header) => header,
            Err(err) => {
                tracing::warn!(endpoint = %shared.endpoint, "protocol-impossible frame: {err}");
                shared.mark_dead_and_fail(&format!("protocol violation: {err}"));
                return;
            }
        };

        let body_len = header.total_body_len as usize;
        if HEADER_LEN + body_len > max_packet_bytes {
            tracing::warn!(
                endpoint = %shared.endpoint,
                body_len,
                "response exceeds the frame ceiling"
            );
            shared.mark_dead_and_fail("response exceeds the frame ceiling");
            return;
        }

        let mut packet = vec![0u8; HEADER_LEN + body_len];
        packet[..HEADER_LEN].copy_from_slice(&header_bytes);
        if let Err(err) = stream.read_exact(&mut packet[HEADER_LEN..]) {
            shared.mark_dead_and_fail(&format!("read failed mid-frame: {err}"));
            return;
        }

        shared
            .bytes_received
            .fetch_add(packet.len() as u64, Ordering::Relaxed);
        *shared
            .last_activity
            .lock()
            .expect("activity lock poisoned") = Instant::now();

        let waiter = shared
            .inflight
            .lock()
            .expect("correlation table lock poisoned")
            .remove(&header.opaque);
        match waiter {
            Some(waiter) => {
                let response = ServerResponse::new(header, Bytes::from(packet));
                if waiter.complete.send(Ok(response)).is_err() {
                    // Caller stopped waiting (timeout or cancellation); the
                    // correlation entry is already gone, nothing leaks.
                    tracing::debug!(
                        endpoint = %shared.endpoint,
                        opaque = header.opaque,
                        "dropping response for an abandoned waiter"
                    );
                }
            }
            None => {
                tracing::debug!(
                    endpoint = %shared.endpoint,
                    opaque = header.opaque,
                    "discarding response with unknown opaque"
                );
            }
        }
    }
}

/// Produces ready sockets: transport establishment plus whatever handshake
/// the initializer performs.
pub trait ConnectionFactory: Send + Sync {
    fn create(&self, endpoint: &Endpoint) -> crate::Result<Connection>;
}

/// Post-connect handshake hook (bucket selection, feature negotiation).
pub trait ConnectionInitializer: Send + Sync {
    fn initialize(&self, connection: &Connection) -> crate::Result<()>;
}

/// Initializer for servers that need no handshake.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopInitializer;

impl ConnectionInitializer for NoopInitializer {
    fn initialize(&self, _connection: &Connection) -> crate::Result<()> {
        Ok(())
    }
}

pub struct TcpConnectionFactory {
    connect_timeout: Duration,
    max_packet_bytes: usize,
    initializer: Arc<dyn ConnectionInitializer>,
}

impl TcpConnectionFactory {
    pub fn new(config: &KvConfig) -> Self {
        Self::with_initializer(config, Arc::new(NoopInitializer))
    }

    pub fn with_initializer(
        config: &KvConfig,
        initializer: Arc<dyn ConnectionInitializer>,
    ) -> Self {
        Self {
            connect_timeout: config.kv_connect_timeout(),
            max_packet_bytes: config.max_packet_bytes,
            initializer,
        }
    }
}

impl ConnectionFactory for TcpConnectionFactory {
    fn create(&self, endpoint: &Endpoint) -> crate::Result<Connection> {
        let transport = |reason: String| KvError::Transport {
            endpoint: endpoint.to_string(),
            reason,
            during_send: true,
        };

        let addr = endpoint
            .as_str()
            .to_socket_addrs()
            .map_err(|err| transport(format!("resolve: {err}")))?
            .next()
            .ok_or_else(|| transport("endpoint resolved to no addresses".into()))?;
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|err| transport(format!("connect: {err}")))?;
        stream
            .set_nodelay(true)
            .map_err(|err| transport(format!("nodelay: {err}")))?;

        let connection = Connection::from_stream(endpoint.clone(), stream, self.max_packet_bytes)
            .map_err(|err| transport(format!("socket split: {err}")))?;
        self.initializer.initialize(&connection)?;
        Ok(connection)
    }
}
