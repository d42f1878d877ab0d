//! Logic-thread handlers for the two host modes.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use forge_net::{ConnectionId, MessageHeader, NetEvent, NetHandler, Outbox};
use tracing::{debug, info, warn};

/// Message id of a ping; replies carry the same id and body.
pub const PING_MSG: u16 = 1;

/// Server mode: sends every message straight back to its sender.
#[derive(Debug, Default)]
pub struct EchoHandler {
    pub connected: HashSet<ConnectionId>,
    pub echoed: u64,
    pub refused: u64,
}

impl NetHandler for EchoHandler {
    fn on_receive(&mut self, net: &Outbox, id: ConnectionId, header: &MessageHeader, body: &[u8]) {
        if net.send_message(header.msg_id, body, id, header.route) {
            self.echoed += 1;
        } else {
            self.refused += 1;
            debug!("Echo of message {} to {id} refused", header.msg_id);
        }
    }

    fn on_event(&mut self, _net: &Outbox, id: ConnectionId, event: NetEvent, code: i32) {
        match event {
            NetEvent::Connected => {
                self.connected.insert(id);
                info!("Client {id} connected ({} online)", self.connected.len());
            }
            NetEvent::Disconnected => {
                self.connected.remove(&id);
                info!("Client {id} disconnected, reason {code} ({} online)", self.connected.len());
            }
            NetEvent::RecvError => warn!("Client {id} sent malformed data (code {code})"),
            NetEvent::SendError => warn!("Send to client {id} failed (os error {code})"),
        }
    }
}

/// Client mode: pings the server at a fixed interval and measures round trips.
#[derive(Debug)]
pub struct PingHandler {
    interval: Duration,
    started: Instant,
    last_ping: Option<Instant>,
    pub server: Option<ConnectionId>,
    pub sent: u64,
    pub replies: u64,
    pub closed: bool,
}

impl PingHandler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            started: Instant::now(),
            last_ping: None,
            server: None,
            sent: 0,
            replies: 0,
            closed: false,
        }
    }

    /// Send a ping if connected and the interval has elapsed.
    pub fn tick(&mut self, net: &Outbox) {
        if self.server.is_none() || self.last_ping.is_some_and(|at| at.elapsed() < self.interval) {
            return;
        }
        let stamp = self.started.elapsed().as_micros() as u64;
        if net.send_message(PING_MSG, &stamp.to_be_bytes(), ConnectionId::NONE, ConnectionId::NONE) {
            self.sent += 1;
            self.last_ping = Some(Instant::now());
        }
    }
}

impl NetHandler for PingHandler {
    fn on_receive(&mut self, _net: &Outbox, id: ConnectionId, header: &MessageHeader, body: &[u8]) {
        if header.msg_id != PING_MSG {
            debug!("Ignoring message {} from {id}", header.msg_id);
            return;
        }
        let Ok(stamp) = <[u8; 8]>::try_from(body) else {
            warn!("Malformed ping reply from {id} ({} bytes)", body.len());
            return;
        };
        self.replies += 1;
        let now = self.started.elapsed().as_micros() as u64;
        let rtt = now.saturating_sub(u64::from_be_bytes(stamp));
        debug!("Ping reply from {id}: {rtt} us");
    }

    fn on_event(&mut self, _net: &Outbox, id: ConnectionId, event: NetEvent, code: i32) {
        match event {
            NetEvent::Connected => {
                info!("Connected to server as {id}");
                self.server = Some(id);
            }
            NetEvent::Disconnected => {
                info!("Disconnected from server, reason {code}");
                self.server = None;
                self.closed = true;
            }
            NetEvent::RecvError | NetEvent::SendError => warn!("{event:?} on {id} (code {code})"),
        }
    }
}
