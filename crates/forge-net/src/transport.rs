//! Server and client transports.
//!
//! A [`Transport`] owns an I/O thread pool (a dedicated multi-threaded tokio
//! runtime) while started. Accepting, reading, decoding and writing all
//! happen there. The thread that calls [`Transport::update`] is the logic
//! thread: it drains the dispatch queue and runs the [`NetHandler`]
//! callbacks, so callbacks never run concurrently with each other.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::watch;

use crate::codec::MessageHeader;
use crate::config::TransportConfig;
use crate::connection;
use crate::dispatch::{Dispatched, NetEvent};
use crate::entity::CloseReason;
use crate::error::NetError;
use crate::guid::ConnectionId;
use crate::outbox::{Outbox, Shared};
use crate::platform::{create_listener, resolve_address};
use crate::registry::EntityRegistry;
use crate::stats::NetStats;

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Extra time given to connection tasks beyond the flush grace period.
const TEARDOWN_SLACK: Duration = Duration::from_millis(200);

/// How a message is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Raw byte stream; frames are delimited by the header's body length.
    Tcp,
    /// HTTP-upgraded WebSocket; one binary message carries one frame.
    #[serde(alias = "ws")]
    WebSocket,
}

/// Whether the transport accepts or initiates connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Listens and accepts any number of peers.
    Server,
    /// Holds a single outbound connection.
    Client,
}

/// Parameters for [`Transport::start_server`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    /// Bind address. Empty or `*` binds the wildcard address.
    pub address: String,
    /// Port to listen on, 0 for an ephemeral port.
    pub port: u16,
    /// I/O worker threads. Default: 2.
    pub thread_count: usize,
    /// Concurrent connection limit, 0 for unlimited. Default: 0.
    pub max_connections: usize,
    /// Prefer an IPv6 (dual-stack) listener.
    pub ipv6: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 0,
            thread_count: 2,
            max_connections: 0,
            ipv6: false,
        }
    }
}

/// Parameters for [`Transport::start_client`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Server host name or address.
    pub address: String,
    /// Server port.
    pub port: u16,
    /// Prefer IPv6 when the name resolves to both families.
    pub ipv6: bool,
}

/// Callbacks invoked on the logic thread during [`Transport::update`].
pub trait NetHandler: Send {
    /// A message arrived on connection `id`.
    fn on_receive(&mut self, net: &Outbox, id: ConnectionId, header: &MessageHeader, body: &[u8]);

    /// A lifecycle event for connection `id`.
    ///
    /// For `Disconnected` the code is a [`CloseReason`] code; for `RecvError`
    /// a [`CodecError`](crate::CodecError) code; for `SendError` the OS error.
    fn on_event(&mut self, net: &Outbox, id: ConnectionId, event: NetEvent, code: i32);
}

struct Running {
    runtime: Runtime,
    shutdown_tx: watch::Sender<bool>,
    local_addr: Option<SocketAddr>,
}

/// A TCP or WebSocket endpoint in the server or client role.
///
/// Created stopped. Call [`start_server`](Self::start_server) or
/// [`start_client`](Self::start_client), then [`update`](Self::update) once
/// per logic tick. A stopped transport may be started again; identities are
/// never reused across restarts.
pub struct Transport<H: NetHandler> {
    kind: TransportKind,
    shared: Arc<Shared>,
    outbox: Outbox,
    handler: H,
    running: Option<Running>,
}

impl<H: NetHandler> Transport<H> {
    /// Create a stopped transport.
    pub fn new(kind: TransportKind, config: TransportConfig, handler: H) -> Self {
        let shared = Arc::new(Shared::new(config));
        Self {
            kind,
            outbox: Outbox::new(Arc::clone(&shared)),
            shared,
            handler,
            running: None,
        }
    }

    fn build_runtime(threads: usize) -> Result<Runtime, NetError> {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name("forge-net-io")
            .enable_all()
            .build()
            .map_err(NetError::Runtime)
    }

    /// Bind a listener and begin accepting connections.
    pub fn start_server(&mut self, options: ServerOptions) -> Result<(), NetError> {
        if self.running.is_some() {
            return Err(NetError::AlreadyStarted);
        }

        let addr = resolve_address(&options.address, options.port, options.ipv6).map_err(|source| {
            NetError::Resolve {
                address: options.address.clone(),
                port: options.port,
                source,
            }
        })?;
        let runtime = Self::build_runtime(options.thread_count)?;
        let listener = {
            let _guard = runtime.enter();
            create_listener(addr, &self.shared.config.socket).map_err(|source| NetError::Bind { addr, source })?
        };
        let local_addr = listener.local_addr().ok();

        let max = if options.max_connections == 0 {
            usize::MAX
        } else {
            options.max_connections
        };
        self.shared.registry.set_max_entries(max);
        self.shared.set_role(Role::Server);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        runtime.spawn(accept_loop(
            Arc::clone(&self.shared),
            listener,
            self.kind,
            shutdown_rx,
        ));

        tracing::info!(
            "{:?} server listening on {} ({} I/O threads)",
            self.kind,
            local_addr.unwrap_or(addr),
            options.thread_count.max(1)
        );
        self.running = Some(Running {
            runtime,
            shutdown_tx,
            local_addr,
        });
        Ok(())
    }

    /// Begin connecting to a server.
    ///
    /// Returns once the attempt is under way. Success is reported through a
    /// `Connected` event; failure through `Disconnected` with
    /// [`CloseReason::ConnectFailed`].
    pub fn start_client(&mut self, options: ClientOptions) -> Result<(), NetError> {
        if self.running.is_some() {
            return Err(NetError::AlreadyStarted);
        }

        let addr = resolve_address(&options.address, options.port, options.ipv6).map_err(|source| {
            NetError::Resolve {
                address: options.address.clone(),
                port: options.port,
                source,
            }
        })?;
        let runtime = Self::build_runtime(1)?;
        self.shared.registry.set_max_entries(1);
        self.shared.set_role(Role::Client);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let kind = self.kind;
        runtime.spawn(async move {
            let id = shared.ids.next_id();
            let timeout = shared.config.connect_timeout();
            match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(socket)) => {
                    connection::run(shared, id, socket, addr, kind, Role::Client, shutdown_rx).await;
                }
                Ok(Err(e)) => {
                    tracing::warn!("Failed to connect to {addr}: {e}");
                    connection::connect_failed(&shared, id);
                }
                Err(_) => {
                    tracing::warn!("Connecting to {addr} timed out after {timeout:?}");
                    connection::connect_failed(&shared, id);
                }
            }
        });

        tracing::info!("{:?} client connecting to {addr}", self.kind);
        self.running = Some(Running {
            runtime,
            shutdown_tx,
            local_addr: None,
        });
        Ok(())
    }

    /// Stop accepting, close every connection and stop the I/O threads.
    ///
    /// Queued sends get the configured grace period to flush. Connections
    /// still registered afterwards are force-closed. Every connection that
    /// was announced with `Connected` gets exactly one `Disconnected`,
    /// delivered by the next [`update`](Self::update).
    ///
    /// Returns false if the transport was not running. Safe to call, and to
    /// drop the transport, from inside another tokio runtime.
    pub fn shutdown(&mut self) -> bool {
        let Some(Running {
            runtime, shutdown_tx, ..
        }) = self.running.take()
        else {
            return false;
        };

        let _ = shutdown_tx.send(true);
        let wait = self.shared.config.shutdown_grace() + TEARDOWN_SLACK;
        let registry = &self.shared.registry;
        let drained = if tokio::runtime::Handle::try_current().is_ok() {
            // Blocking on or dropping a runtime panics on a runtime thread.
            thread::scope(|s| {
                s.spawn(move || stop_runtime(runtime, registry, wait))
                    .join()
                    .unwrap_or(false)
            })
        } else {
            stop_runtime(runtime, registry, wait)
        };
        if !drained {
            tracing::warn!(
                "{} connections still open after {wait:?}, forcing close",
                self.shared.registry.len()
            );
        }

        for handle in self.shared.registry.drain() {
            handle.mark_closed();
            self.shared
                .queue
                .push_event(handle.id(), NetEvent::Disconnected, CloseReason::Shutdown.code());
        }

        tracing::info!("{:?} transport stopped", self.kind);
        true
    }

    /// Drain everything queued since the last call and run the callbacks.
    ///
    /// Returns the number of items dispatched.
    pub fn update(&mut self) -> usize {
        let batch = self.shared.queue.drain_all();
        let count = batch.len();
        for item in batch {
            match item {
                Dispatched::Message { id, header, body } => {
                    self.handler.on_receive(&self.outbox, id, &header, &body);
                }
                Dispatched::Event { id, event, code } => {
                    self.handler.on_event(&self.outbox, id, event, code);
                }
            }
        }
        count
    }

    /// See [`Outbox::send_message`].
    pub fn send_message(&self, msg_id: u16, body: &[u8], id: ConnectionId, route: ConnectionId) -> bool {
        self.outbox.send_message(msg_id, body, id, route)
    }

    /// See [`Outbox::send_to_all`].
    pub fn send_to_all(&self, msg_id: u16, body: &[u8], route: ConnectionId, exclude: &[ConnectionId]) -> bool {
        self.outbox.send_to_all(msg_id, body, route, exclude)
    }

    /// See [`Outbox::close_connection`].
    pub fn close_connection(&self, id: ConnectionId) -> bool {
        self.outbox.close_connection(id)
    }

    /// Whether the transport was last started in the server role.
    pub fn is_server(&self) -> bool {
        self.shared.role() == Some(Role::Server)
    }

    /// Whether the transport is started.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Framing used by this transport.
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Address the listener is bound to, if running as a server.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().and_then(|r| r.local_addr)
    }

    /// Number of `Open` connections.
    pub fn connection_count(&self) -> usize {
        self.outbox.connection_count()
    }

    /// Cloneable send handle.
    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    /// Traffic counters and dispatch queue statistics.
    pub fn stats(&self) -> NetStats {
        self.shared.counters.snapshot(self.shared.queue.stats())
    }

    /// The callback handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// The callback handler, mutably.
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }
}

impl<H: NetHandler> Drop for Transport<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Wait up to `wait` for every connection task to deregister, then stop the
/// I/O threads. Returns whether the registry emptied in time.
fn stop_runtime(runtime: Runtime, registry: &EntityRegistry, wait: Duration) -> bool {
    let drained = runtime.block_on(async { tokio::time::timeout(wait, registry.wait_empty()).await.is_ok() });
    runtime.shutdown_timeout(Duration::from_millis(100));
    drained
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    kind: TransportKind,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    if shared.registry.len() >= shared.registry.max_entries() {
                        tracing::warn!("Connection limit reached, rejecting {peer}");
                        shared.counters.record_rejected();
                        continue;
                    }
                    let id = shared.ids.next_id();
                    tracing::debug!("Accepted {peer} as {id}");
                    tokio::spawn(connection::run(
                        Arc::clone(&shared),
                        id,
                        socket,
                        peer,
                        kind,
                        Role::Server,
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::debug!("Accept loop stopped");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecError, Decoded, HEADER_LEN, WireCodec};
    use std::io::{Read, Write};
    use std::time::Instant;

    #[derive(Default)]
    struct Recorder {
        echo: bool,
        events: Vec<(ConnectionId, NetEvent, i32)>,
        messages: Vec<(ConnectionId, u16, Vec<u8>)>,
    }

    impl Recorder {
        fn count(&self, event: NetEvent) -> usize {
            self.events.iter().filter(|(_, e, _)| *e == event).count()
        }

        fn first(&self, event: NetEvent) -> Option<(ConnectionId, i32)> {
            self.events
                .iter()
                .find(|(_, e, _)| *e == event)
                .map(|(id, _, code)| (*id, *code))
        }
    }

    impl NetHandler for Recorder {
        fn on_receive(&mut self, net: &Outbox, id: ConnectionId, header: &MessageHeader, body: &[u8]) {
            self.messages.push((id, header.msg_id, body.to_vec()));
            if self.echo {
                net.send_message(header.msg_id, body, id, header.route);
            }
        }

        fn on_event(&mut self, _net: &Outbox, id: ConnectionId, event: NetEvent, code: i32) {
            self.events.push((id, event, code));
        }
    }

    fn test_config() -> TransportConfig {
        TransportConfig {
            shutdown_grace_ms: 200,
            connect_timeout_ms: 1_000,
            handshake_timeout_ms: 1_000,
            ..Default::default()
        }
    }

    fn server(kind: TransportKind, handler: Recorder, max_connections: usize) -> Transport<Recorder> {
        let mut transport = Transport::new(kind, test_config(), handler);
        transport
            .start_server(ServerOptions {
                address: "127.0.0.1".into(),
                max_connections,
                ..Default::default()
            })
            .unwrap();
        transport
    }

    fn pump_until(transport: &mut Transport<Recorder>, mut done: impl FnMut(&Recorder) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            transport.update();
            if done(transport.handler()) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn connect_raw(transport: &Transport<Recorder>) -> std::net::TcpStream {
        let stream = std::net::TcpStream::connect(transport.local_addr().unwrap()).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }

    fn read_frame(stream: &mut std::net::TcpStream) -> (MessageHeader, Vec<u8>) {
        let codec = WireCodec::default();
        let mut header = [0u8; HEADER_LEN];
        stream.read_exact(&mut header).unwrap();
        let body_len = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
        let mut frame = header.to_vec();
        frame.resize(HEADER_LEN + body_len, 0);
        stream.read_exact(&mut frame[HEADER_LEN..]).unwrap();
        match codec.decode(&frame).unwrap() {
            Decoded::Frame { header, body, .. } => (header, body.to_vec()),
            Decoded::NeedMoreData => panic!("incomplete frame"),
        }
    }

    fn reads_eof(stream: &mut std::net::TcpStream) -> bool {
        let mut buf = [0u8; 64];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(e) => return e.kind() == std::io::ErrorKind::ConnectionReset,
            }
        }
    }

    #[test]
    fn test_ping_scenario() {
        let mut transport = server(TransportKind::Tcp, Recorder::default(), 0);
        let codec = WireCodec::default();
        let mut client = connect_raw(&transport);

        assert!(pump_until(&mut transport, |r| r.count(NetEvent::Connected) == 1));
        let (id, _) = transport.handler().first(NetEvent::Connected).unwrap();
        assert!(!id.is_none());

        client.write_all(&codec.encode(1, ConnectionId::NONE, b"ping").unwrap()).unwrap();
        assert!(pump_until(&mut transport, |r| !r.messages.is_empty()));

        drop(client);
        assert!(pump_until(&mut transport, |r| r.count(NetEvent::Disconnected) == 1));

        let handler = transport.handler();
        assert_eq!(handler.messages, vec![(id, 1, b"ping".to_vec())]);
        assert_eq!(handler.first(NetEvent::Disconnected), Some((id, CloseReason::Remote.code())));
        assert_eq!(handler.count(NetEvent::Connected), 1);
        assert!(!transport.send_message(2, b"late", id, ConnectionId::NONE));
        assert_eq!(transport.connection_count(), 0);
    }

    #[test]
    fn test_per_connection_order_is_preserved() {
        let mut transport = server(TransportKind::Tcp, Recorder::default(), 0);
        let codec = WireCodec::default();
        let mut client = connect_raw(&transport);

        let mut wire = Vec::new();
        for i in 0..200u16 {
            wire.extend_from_slice(&codec.encode(i, ConnectionId::NONE, &i.to_be_bytes()).unwrap());
        }
        // Uneven writes so headers and bodies straddle reads.
        for chunk in wire.chunks(37) {
            client.write_all(chunk).unwrap();
        }

        assert!(pump_until(&mut transport, |r| r.messages.len() == 200));
        let ids: Vec<u16> = transport.handler().messages.iter().map(|(_, id, _)| *id).collect();
        assert_eq!(ids, (0..200).collect::<Vec<_>>());
        for (_, msg_id, body) in &transport.handler().messages {
            assert_eq!(body, &msg_id.to_be_bytes());
        }
    }

    #[test]
    fn test_reply_from_callback_reaches_client() {
        let handler = Recorder {
            echo: true,
            ..Default::default()
        };
        let mut transport = server(TransportKind::Tcp, handler, 0);
        let codec = WireCodec::default();
        let mut client = connect_raw(&transport);

        client.write_all(&codec.encode(9, ConnectionId(77), b"echo me").unwrap()).unwrap();
        assert!(pump_until(&mut transport, |r| r.messages.len() == 1));

        let (header, body) = read_frame(&mut client);
        assert_eq!(header.msg_id, 9);
        assert_eq!(header.route, ConnectionId(77));
        assert_eq!(body, b"echo me");
        assert!(transport.stats().messages_out >= 1);
    }

    #[test]
    fn test_oversized_header_closes_connection() {
        let mut transport = server(TransportKind::Tcp, Recorder::default(), 0);
        let mut client = connect_raw(&transport);

        let mut header = Vec::new();
        header.extend_from_slice(&3u16.to_be_bytes());
        header.extend_from_slice(&1_000_000u32.to_be_bytes());
        header.extend_from_slice(&0u64.to_be_bytes());
        client.write_all(&header).unwrap();

        assert!(pump_until(&mut transport, |r| r.count(NetEvent::Disconnected) == 1));
        let handler = transport.handler();
        let too_large = CodecError::BodyTooLarge {
            size: 1_000_000,
            max: 65_536,
        };
        assert_eq!(handler.first(NetEvent::RecvError).map(|(_, c)| c), Some(too_large.code()));
        assert_eq!(
            handler.first(NetEvent::Disconnected).map(|(_, c)| c),
            Some(CloseReason::Protocol.code())
        );
        assert!(handler.messages.is_empty());
        assert!(reads_eof(&mut client));
    }

    #[test]
    fn test_close_connection_flushes_then_disconnects() {
        let mut transport = server(TransportKind::Tcp, Recorder::default(), 0);
        let mut client = connect_raw(&transport);
        assert!(pump_until(&mut transport, |r| r.count(NetEvent::Connected) == 1));
        let (id, _) = transport.handler().first(NetEvent::Connected).unwrap();

        assert!(transport.send_message(4, b"bye", id, ConnectionId::NONE));
        assert!(transport.close_connection(id));
        assert!(!transport.close_connection(id));
        assert!(!transport.send_message(4, b"too late", id, ConnectionId::NONE));

        let (header, body) = read_frame(&mut client);
        assert_eq!(header.msg_id, 4);
        assert_eq!(body, b"bye");
        assert!(reads_eof(&mut client));

        assert!(pump_until(&mut transport, |r| r.count(NetEvent::Disconnected) == 1));
        assert_eq!(
            transport.handler().first(NetEvent::Disconnected),
            Some((id, CloseReason::Local.code()))
        );
    }

    #[test]
    fn test_max_connections_rejects_excess() {
        let mut transport = server(TransportKind::Tcp, Recorder::default(), 1);
        let _first = connect_raw(&transport);
        assert!(pump_until(&mut transport, |r| r.count(NetEvent::Connected) == 1));

        let mut second = connect_raw(&transport);
        assert!(reads_eof(&mut second));

        let deadline = Instant::now() + Duration::from_secs(5);
        while transport.stats().connections_rejected == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        transport.update();
        assert_eq!(transport.stats().connections_rejected, 1);
        assert_eq!(transport.handler().count(NetEvent::Connected), 1);
        assert_eq!(transport.connection_count(), 1);
    }

    #[test]
    fn test_shutdown_disconnects_once_and_restarts() {
        let mut transport = server(TransportKind::Tcp, Recorder::default(), 0);
        let _a = connect_raw(&transport);
        let _b = connect_raw(&transport);
        assert!(pump_until(&mut transport, |r| r.count(NetEvent::Connected) == 2));

        assert!(matches!(
            transport.start_server(ServerOptions::default()),
            Err(NetError::AlreadyStarted)
        ));
        assert!(transport.shutdown());
        assert!(!transport.shutdown());
        assert!(!transport.is_running());

        transport.update();
        let handler = transport.handler();
        assert_eq!(handler.count(NetEvent::Disconnected), 2);
        assert!(
            handler
                .events
                .iter()
                .filter(|(_, e, _)| *e == NetEvent::Disconnected)
                .all(|(_, _, code)| *code == CloseReason::Shutdown.code())
        );

        transport
            .start_server(ServerOptions {
                address: "127.0.0.1".into(),
                ..Default::default()
            })
            .unwrap();
        let _c = connect_raw(&transport);
        assert!(pump_until(&mut transport, |r| r.count(NetEvent::Connected) == 3));
        let ids: Vec<ConnectionId> = transport
            .handler()
            .events
            .iter()
            .filter(|(_, e, _)| *e == NetEvent::Connected)
            .map(|(id, _, _)| *id)
            .collect();
        assert!(ids[2] > ids[0] && ids[2] > ids[1], "identities are not reused");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_from_async_context() {
        let mut transport = server(TransportKind::Tcp, Recorder::default(), 0);
        let _client = connect_raw(&transport);
        assert!(pump_until(&mut transport, |r| r.count(NetEvent::Connected) == 1));

        assert!(transport.shutdown());
        assert!(!transport.is_running());
        transport.update();
        let handler = transport.handler();
        assert_eq!(handler.count(NetEvent::Disconnected), 1);
        assert_eq!(
            handler.first(NetEvent::Disconnected).map(|(_, c)| c),
            Some(CloseReason::Shutdown.code())
        );
    }

    #[tokio::test]
    async fn test_drop_from_async_context() {
        let transport = server(TransportKind::WebSocket, Recorder::default(), 0);
        let _client = connect_raw(&transport);
        drop(transport);
    }

    #[test]
    fn test_client_reports_failed_connect() {
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let mut client = Transport::new(TransportKind::Tcp, test_config(), Recorder::default());
        client
            .start_client(ClientOptions {
                address: "127.0.0.1".into(),
                port,
                ipv6: false,
            })
            .unwrap();

        assert!(pump_until(&mut client, |r| r.count(NetEvent::Disconnected) == 1));
        let handler = client.handler();
        assert_eq!(handler.count(NetEvent::Connected), 0);
        assert_eq!(
            handler.first(NetEvent::Disconnected).map(|(_, c)| c),
            Some(CloseReason::ConnectFailed.code())
        );
        assert!(!client.is_server());
    }

    fn client_server_exchange(kind: TransportKind) {
        let echo = Recorder {
            echo: true,
            ..Default::default()
        };
        let mut server = server(kind, echo, 0);
        let port = server.local_addr().unwrap().port();
        assert!(server.is_server());

        let mut client = Transport::new(kind, test_config(), Recorder::default());
        client
            .start_client(ClientOptions {
                address: "127.0.0.1".into(),
                port,
                ipv6: false,
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while client.handler().count(NetEvent::Connected) == 0 && Instant::now() < deadline {
            server.update();
            client.update();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(client.handler().count(NetEvent::Connected), 1);

        assert!(client.send_message(1, b"ping", ConnectionId::NONE, ConnectionId::NONE));
        assert!(client.send_message(2, b"pong", ConnectionId::NONE, ConnectionId::NONE));

        let deadline = Instant::now() + Duration::from_secs(5);
        while client.handler().messages.len() < 2 && Instant::now() < deadline {
            server.update();
            client.update();
            thread::sleep(Duration::from_millis(5));
        }

        let server_seen: Vec<(u16, Vec<u8>)> = server
            .handler()
            .messages
            .iter()
            .map(|(_, m, b)| (*m, b.clone()))
            .collect();
        assert_eq!(server_seen, vec![(1, b"ping".to_vec()), (2, b"pong".to_vec())]);
        let client_seen: Vec<(u16, Vec<u8>)> = client
            .handler()
            .messages
            .iter()
            .map(|(_, m, b)| (*m, b.clone()))
            .collect();
        assert_eq!(client_seen, server_seen);

        assert!(client.shutdown());
        assert!(pump_until(&mut server, |r| r.count(NetEvent::Disconnected) == 1));
        client.update();
        assert_eq!(client.handler().count(NetEvent::Disconnected), 1);
    }

    #[test]
    fn test_tcp_client_server_exchange() {
        client_server_exchange(TransportKind::Tcp);
    }

    #[test]
    fn test_websocket_client_server_exchange() {
        client_server_exchange(TransportKind::WebSocket);
    }

    #[test]
    fn test_websocket_oversized_message_closes_connection() {
        let config = TransportConfig {
            max_body_len: 1024,
            ..test_config()
        };
        let mut server = Transport::new(TransportKind::WebSocket, config, Recorder::default());
        server
            .start_server(ServerOptions {
                address: "127.0.0.1".into(),
                ..Default::default()
            })
            .unwrap();
        let port = server.local_addr().unwrap().port();

        let mut client = Transport::new(TransportKind::WebSocket, test_config(), Recorder::default());
        client
            .start_client(ClientOptions {
                address: "127.0.0.1".into(),
                port,
                ipv6: false,
            })
            .unwrap();
        assert!(pump_until(&mut client, |r| r.count(NetEvent::Connected) == 1));

        let body = vec![0u8; 32 * 1024];
        assert!(client.send_message(3, &body, ConnectionId::NONE, ConnectionId::NONE));
        assert!(pump_until(&mut server, |r| r.count(NetEvent::Disconnected) == 1));

        let handler = server.handler();
        assert_eq!(handler.first(NetEvent::RecvError).map(|(_, c)| c), Some(1));
        assert_eq!(
            handler.first(NetEvent::Disconnected).map(|(_, c)| c),
            Some(CloseReason::Protocol.code())
        );
        assert!(handler.messages.is_empty());
        assert!(server.stats().bytes_in < body.len() as u64);
    }

    #[test]
    fn test_websocket_rejects_raw_tcp_peer() {
        let mut transport = server(TransportKind::WebSocket, Recorder::default(), 0);
        let mut client = connect_raw(&transport);
        client.write_all(b"not an http request\r\n\r\n").unwrap();

        assert!(reads_eof(&mut client));
        transport.update();
        assert_eq!(transport.handler().count(NetEvent::Connected), 0);
        assert_eq!(transport.handler().count(NetEvent::Disconnected), 0);
    }

    #[test]
    fn test_send_to_all_skips_excluded() {
        let mut transport = server(TransportKind::Tcp, Recorder::default(), 0);
        let mut a = connect_raw(&transport);
        assert!(pump_until(&mut transport, |r| r.count(NetEvent::Connected) == 1));
        let mut b = connect_raw(&transport);
        assert!(pump_until(&mut transport, |r| r.count(NetEvent::Connected) == 2));
        let id_a = transport.handler().events[0].0;

        assert!(transport.send_to_all(6, b"all but a", ConnectionId::NONE, &[id_a]));
        assert!(transport.send_to_all(7, b"everyone", ConnectionId::NONE, &[]));

        let (first, _) = read_frame(&mut b);
        let (second, _) = read_frame(&mut b);
        assert_eq!((first.msg_id, second.msg_id), (6, 7));
        let (only, body) = read_frame(&mut a);
        assert_eq!(only.msg_id, 7);
        assert_eq!(body, b"everyone");
    }

    #[test]
    fn test_idle_connection_times_out() {
        let config = TransportConfig {
            idle_timeout_ms: 100,
            ..test_config()
        };
        let mut transport = Transport::new(TransportKind::Tcp, config, Recorder::default());
        transport
            .start_server(ServerOptions {
                address: "127.0.0.1".into(),
                ..Default::default()
            })
            .unwrap();
        let _client = connect_raw(&transport);

        assert!(pump_until(&mut transport, |r| r.count(NetEvent::Disconnected) == 1));
        assert_eq!(
            transport.handler().first(NetEvent::Disconnected).map(|(_, c)| c),
            Some(CloseReason::IdleTimeout.code())
        );
    }
}
