//! The multiplexing core: registries, message handlers, event application.
//!
//! `ProxyCore` owns every piece of broker state and is only ever touched by
//! the event-loop task, so none of it is locked. Handlers mutate the
//! in-queue request in place and release-store its status exactly once;
//! asynchronous opens park the slot pointer until the upstream driver
//! reports completion.

use crate::connection::{ConnState, Connection, ConnectionTable, Subscription};
use crate::registry::ClientTable;
use crate::upstream::{Upstream, UpstreamEvent};
use common::wire::{self, MsgType, Status};
use common::{RingQueue, HEARTBEAT_INTERVAL_MS, SHUTDOWN_GRACE_MS};
use metrics::{counter, gauge};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// An OpenWs request whose upstream handshake is still in flight. The slot
/// stays `Pending` in the client→server ring until completion.
struct PendingOpen {
    slot: *mut u8,
    client_pid: u64,
}

pub struct ProxyCore<U: Upstream> {
    pub pid: u64,
    /// Server→client ring; everything the broker says goes through here.
    pub sc: RingQueue,
    pub upstream: U,
    pub clients: ClientTable,
    pub connections: ConnectionTable,
    pending_opens: HashMap<u64, PendingOpen>,
    next_conn: u64,
    last_publish_ms: u64,
    shutdown_at_ms: Option<u64>,
}

impl<U: Upstream> ProxyCore<U> {
    pub fn new(pid: u64, sc: RingQueue, upstream: U) -> Self {
        Self {
            pid,
            sc,
            upstream,
            clients: ClientTable::new(),
            connections: ConnectionTable::new(),
            pending_opens: HashMap::new(),
            next_conn: 0,
            last_publish_ms: 0,
            shutdown_at_ms: None,
        }
    }

    /// Dispatch one client→server message. The pointer stays valid for the
    /// whole call; async opens keep it parked until completion.
    ///
    /// # Safety
    /// `ptr` must point at a well-formed frame inside the client→server
    /// mapping, which must outlive the core.
    pub unsafe fn handle_message(&mut self, ptr: *mut u8, now: u64) {
        let hdr = wire::header(ptr);
        let pid = hdr.pid;
        match hdr.type_tag() {
            Some(MsgType::Register) => {
                counter!("wsmux_messages_total", "type" => "register").increment(1);
                self.on_register(ptr, now);
            }
            Some(MsgType::Unregister) => {
                counter!("wsmux_messages_total", "type" => "unregister").increment(1);
                self.unregister(pid, now);
                hdr.set_status(Status::Success);
            }
            Some(MsgType::Heartbeat) => {
                self.clients.touch(pid, now);
                hdr.set_status(Status::Success);
            }
            Some(MsgType::OpenWs) => {
                counter!("wsmux_messages_total", "type" => "open").increment(1);
                self.on_open(ptr, now);
            }
            Some(MsgType::CloseWs) => {
                counter!("wsmux_messages_total", "type" => "close").increment(1);
                self.on_close(ptr, now);
            }
            Some(MsgType::WsRequest) => {
                counter!("wsmux_messages_total", "type" => "request").increment(1);
                self.on_request(ptr, now);
            }
            Some(MsgType::Subscribe) => {
                counter!("wsmux_messages_total", "type" => "subscribe").increment(1);
                self.on_subscribe(ptr, now);
            }
            Some(MsgType::Unsubscribe) => {
                counter!("wsmux_messages_total", "type" => "unsubscribe").increment(1);
                self.on_unsubscribe(ptr, now);
            }
            // Server→client tags have no business on this ring; skip them.
            Some(MsgType::WsData) | Some(MsgType::WsError) => {}
            None => {
                warn!(pid, tag = hdr.msg_type, "unknown message type; skipping");
            }
        }
    }

    unsafe fn on_register(&mut self, ptr: *mut u8, now: u64) {
        let hdr = wire::header(ptr);
        let pid = hdr.pid;
        let body = wire::body_mut::<wire::RegisterBody>(ptr);
        let name = wire::read_str(&body.name);
        body.server_pid = self.pid;
        // A returning client cancels any pending idle shutdown.
        self.shutdown_at_ms = None;
        self.clients.register(pid, &name, now);
        gauge!("wsmux_clients").set(self.clients.len() as f64);
        hdr.set_status(Status::Success);
    }

    /// Remove a client and everything it holds. No-op for unknown PIDs.
    pub fn unregister(&mut self, pid: u64, now: u64) {
        if self.clients.remove(pid).is_none() {
            return;
        }
        info!(pid, "client unregistered");
        let mut to_close = Vec::new();
        for conn in self.connections.iter_mut() {
            if conn.clients.contains(&pid) && conn.detach_client(pid) {
                to_close.push(conn.id);
            }
        }
        for id in to_close {
            self.close_connection(id);
        }
        gauge!("wsmux_clients").set(self.clients.len() as f64);
        if self.clients.is_empty() {
            info!("last client disconnected; arming shutdown timer");
            self.shutdown_at_ms = Some(now);
        }
    }

    unsafe fn on_open(&mut self, ptr: *mut u8, now: u64) {
        let hdr = wire::header(ptr);
        let pid = hdr.pid;
        let body = wire::body_mut::<wire::OpenWsBody>(ptr);
        if !self.clients.touch(pid, now) {
            wire::write_str(&mut body.err, &format!("client {pid} not registered"));
            hdr.set_status(Status::Failed);
            return;
        }
        let url = wire::read_str(&body.url);
        let key = wire::read_str(&body.key);

        // Dedup: join a live or still-connecting socket for the same key.
        let live = self
            .connections
            .id_for_key(&url, &key)
            .and_then(|id| self.connections.get_mut(id))
            .filter(|c| matches!(c.state, ConnState::Connecting | ConnState::Connected));
        if let Some(conn) = live {
            conn.clients.insert(pid);
            let id = conn.id;
            let connecting = conn.state == ConnState::Connecting;
            body.id = id;
            body.client_pid = pid;
            body.new_connection = connecting as u8;
            info!(id, %url, pid, new = connecting, "websocket already open; attached client");
            self.emit_opened(id, pid, now);
            hdr.set_status(Status::Success);
            return;
        }

        self.next_conn += 1;
        let id = self.pid * 10_000 + self.next_conn;
        let mut conn = Connection::new(id, url.clone(), key);
        conn.clients.insert(pid);
        self.connections.insert(conn);
        gauge!("wsmux_connections").set(self.connections.len() as f64);
        body.id = id;
        body.client_pid = pid;
        body.new_connection = 1;
        self.pending_opens.insert(
            id,
            PendingOpen {
                slot: ptr,
                client_pid: pid,
            },
        );
        info!(id, %url, pid, "opening new upstream websocket");
        self.upstream.open(id, &url);
        // Status stays Pending; the client polls until the open completes.
    }

    unsafe fn on_close(&mut self, ptr: *mut u8, now: u64) {
        let hdr = wire::header(ptr);
        let pid = hdr.pid;
        let body = wire::body::<wire::CloseWsBody>(ptr);
        let id = body.id;
        if self.clients.touch(pid, now) {
            let emptied = match self.connections.get_mut(id) {
                Some(conn) if conn.clients.contains(&pid) => {
                    info!(id, pid, "client detached from websocket");
                    conn.detach_client(pid)
                }
                Some(_) => {
                    debug!(id, pid, "close from client not attached");
                    false
                }
                None => {
                    debug!(id, "close for unknown websocket");
                    false
                }
            };
            if emptied {
                self.close_connection(id);
            }
        }
        // Unconditional ack: the request was accepted.
        hdr.set_status(Status::Success);
    }

    unsafe fn on_request(&mut self, ptr: *mut u8, now: u64) {
        let hdr = wire::header(ptr);
        let pid = hdr.pid;
        let body = wire::body::<wire::WsRequestBody>(ptr);
        let id = body.id;
        let len = body.len;
        if !self.clients.touch(pid, now) {
            let err = format!("cannot forward: client {pid} not registered");
            self.emit_error(id, err.as_bytes(), now);
            hdr.set_status(Status::Failed);
            return;
        }
        if self.connections.get(id).is_some() {
            let data = wire::tail::<wire::WsRequestBody>(ptr, len).to_vec();
            self.upstream.send(id, data);
            hdr.set_status(Status::Success);
        } else {
            let err = format!("cannot forward: websocket {id} not found");
            self.emit_error(id, err.as_bytes(), now);
            hdr.set_status(Status::Failed);
        }
    }

    unsafe fn on_subscribe(&mut self, ptr: *mut u8, now: u64) {
        let hdr = wire::header(ptr);
        let pid = hdr.pid;
        let body = wire::body_mut::<wire::SubscribeBody>(ptr);
        let id = body.id;
        let request_len = body.request_len;
        let channels = body.channels;
        let symbol = wire::read_str(&body.symbol);
        if !self.clients.touch(pid, now) {
            debug!(pid, "subscribe from unregistered client");
            hdr.set_status(Status::Failed);
            return;
        }
        let Some(conn) = self.connections.get_mut(id) else {
            debug!(id, "subscribe for unknown websocket");
            hdr.set_status(Status::Failed);
            return;
        };
        let request = wire::tail::<wire::SubscribeBody>(ptr, request_len).to_vec();
        match conn.subscriptions.entry(symbol.clone()) {
            Entry::Vacant(slot) => {
                info!(id, %symbol, pid, channels, "new subscription");
                slot.insert(Subscription {
                    channels,
                    clients: [pid].into_iter().collect(),
                });
                self.upstream.send(id, request);
            }
            Entry::Occupied(mut slot) => {
                let sub = slot.get_mut();
                sub.clients.insert(pid);
                if channels & !sub.channels != 0 {
                    // The mask widens; the upstream needs to hear about it.
                    sub.channels |= channels;
                    info!(id, %symbol, pid, channels = sub.channels, "subscription widened");
                    self.upstream.send(id, request);
                } else {
                    debug!(id, %symbol, pid, "subscription already covers request");
                    body.existing = 1;
                }
            }
        }
        hdr.set_status(Status::Success);
    }

    unsafe fn on_unsubscribe(&mut self, ptr: *mut u8, now: u64) {
        let hdr = wire::header(ptr);
        let pid = hdr.pid;
        let body = wire::body::<wire::SubscribeBody>(ptr);
        let id = body.id;
        let request_len = body.request_len;
        let symbol = wire::read_str(&body.symbol);
        if self.clients.touch(pid, now) {
            if let Some(conn) = self.connections.get_mut(id) {
                if let Some(sub) = conn.subscriptions.get_mut(&symbol) {
                    sub.clients.remove(&pid);
                    if sub.clients.is_empty() {
                        conn.subscriptions.remove(&symbol);
                        info!(id, %symbol, "last holder gone; unsubscribing upstream");
                        let request = wire::tail::<wire::SubscribeBody>(ptr, request_len).to_vec();
                        self.upstream.send(id, request);
                    }
                } else {
                    debug!(id, %symbol, "unsubscribe for unknown symbol");
                }
            } else {
                debug!(id, "unsubscribe for unknown websocket");
            }
        }
        hdr.set_status(Status::Success);
    }

    /// Apply one event from the upstream driver. This is the well-defined
    /// point where closed sockets leave both indices.
    pub fn apply_event(&mut self, event: UpstreamEvent, now: u64) {
        match event {
            UpstreamEvent::Opened { id } => {
                match self.connections.get_mut(id) {
                    // Teardown may already be in flight; never walk the
                    // state machine backwards.
                    Some(conn) if conn.state == ConnState::Connecting => {
                        conn.state = ConnState::Connected;
                    }
                    Some(_) => {}
                    None => debug!(id, "opened for unknown websocket"),
                }
                if let Some(pending) = self.pending_opens.remove(&id) {
                    unsafe {
                        let hdr = wire::header(pending.slot);
                        let body = wire::body_mut::<wire::OpenWsBody>(pending.slot);
                        body.id = id;
                        body.client_pid = pending.client_pid;
                        body.new_connection = 1;
                        self.emit_opened(id, pending.client_pid, now);
                        hdr.set_status(Status::Success);
                    }
                }
            }
            UpstreamEvent::OpenFailed { id, error } => {
                warn!(id, %error, "websocket open failed");
                if let Some(pending) = self.pending_opens.remove(&id) {
                    unsafe {
                        let hdr = wire::header(pending.slot);
                        let body = wire::body_mut::<wire::OpenWsBody>(pending.slot);
                        wire::write_str(&mut body.err, &error);
                        hdr.set_status(Status::Failed);
                    }
                }
                self.emit_error(id, error.as_bytes(), now);
                self.emit_closed(id, now);
                self.connections.remove(id);
                self.upstream.forget(id);
                gauge!("wsmux_connections").set(self.connections.len() as f64);
            }
            UpstreamEvent::Data {
                id,
                payload,
                remaining,
            } => {
                if self.connections.get(id).is_some() {
                    self.emit_data(id, &payload, remaining, now);
                } else {
                    debug!(id, "data after teardown; dropped");
                }
            }
            UpstreamEvent::Error { id, error } => {
                self.emit_error(id, error.as_bytes(), now);
            }
            UpstreamEvent::Closed { id } => {
                self.emit_closed(id, now);
                if let Some(conn) = self.connections.remove(id) {
                    info!(id, url = %conn.url, "websocket removed");
                }
                self.upstream.forget(id);
                gauge!("wsmux_connections").set(self.connections.len() as f64);
            }
        }
    }

    /// Move a connection with no clients left into teardown.
    fn close_connection(&mut self, id: u64) {
        if let Some(conn) = self.connections.get_mut(id) {
            if matches!(conn.state, ConnState::Connecting | ConnState::Connected) {
                info!(id, url = %conn.url, "no clients left; closing upstream");
                conn.state = ConnState::Disconnecting;
                self.upstream.close(id);
            }
        }
    }

    /// Heartbeat emission plus the eviction sweep.
    pub fn check_heartbeats(&mut self, now: u64) {
        if self.clients.is_empty() {
            return;
        }
        self.maybe_send_heartbeat(now);
        for pid in self.clients.stale(now) {
            info!(pid, "client heartbeat lost; evicting");
            self.unregister(pid, now);
        }
    }

    /// Emit a heartbeat unless some other publish already proved liveness
    /// within the interval.
    pub fn maybe_send_heartbeat(&mut self, now: u64) {
        if now.saturating_sub(self.last_publish_ms) > HEARTBEAT_INTERVAL_MS {
            self.send_heartbeat(now);
        }
    }

    /// Emit a heartbeat unconditionally (startup announcement).
    pub fn send_heartbeat(&mut self, now: u64) {
        let size = wire::BARE_MESSAGE_SIZE;
        let (index, ptr) = self.sc.reserve(size);
        unsafe {
            wire::init_message(ptr, size, self.pid, MsgType::Heartbeat);
        }
        self.publish(index, size, now);
    }

    /// Whether the post-last-client grace window has elapsed.
    pub fn shutdown_due(&self, now: u64) -> bool {
        self.shutdown_at_ms
            .is_some_and(|t| now.saturating_sub(t) >= SHUTDOWN_GRACE_MS)
    }

    /// Begin closing every connection; used at shutdown.
    pub fn close_all(&mut self) {
        for id in self.connections.ids() {
            if let Some(conn) = self.connections.get_mut(id) {
                if matches!(conn.state, ConnState::Connecting | ConnState::Connected) {
                    conn.state = ConnState::Disconnecting;
                    self.upstream.close(id);
                }
            }
        }
    }

    fn emit_opened(&mut self, id: u64, client_pid: u64, now: u64) {
        let size = wire::message_size::<wire::OpenWsBody>(0);
        let (index, ptr) = self.sc.reserve(size);
        unsafe {
            wire::init_message(ptr, size, self.pid, MsgType::OpenWs);
            let body = wire::body_mut::<wire::OpenWsBody>(ptr);
            body.id = id;
            body.client_pid = client_pid;
            body.new_connection = 1;
        }
        self.publish(index, size, now);
    }

    fn emit_closed(&mut self, id: u64, now: u64) {
        let size = wire::message_size::<wire::CloseWsBody>(0);
        let (index, ptr) = self.sc.reserve(size);
        unsafe {
            wire::init_message(ptr, size, self.pid, MsgType::CloseWs);
            wire::body_mut::<wire::CloseWsBody>(ptr).id = id;
        }
        self.publish(index, size, now);
    }

    fn emit_error(&mut self, id: u64, error: &[u8], now: u64) {
        let size = wire::message_size::<wire::WsErrorBody>(error.len());
        let (index, ptr) = self.sc.reserve(size);
        unsafe {
            wire::init_message(ptr, size, self.pid, MsgType::WsError);
            let body = wire::body_mut::<wire::WsErrorBody>(ptr);
            body.id = id;
            body.len = error.len() as u32;
            wire::tail_mut::<wire::WsErrorBody>(ptr, error.len() as u32).copy_from_slice(error);
        }
        self.publish(index, size, now);
    }

    fn emit_data(&mut self, id: u64, payload: &[u8], remaining: u32, now: u64) {
        let size = wire::message_size::<wire::WsDataBody>(payload.len());
        if size as u64 > self.sc.capacity() {
            warn!(id, bytes = payload.len(), "frame exceeds ring capacity; dropped");
            return;
        }
        let (index, ptr) = self.sc.reserve(size);
        unsafe {
            wire::init_message(ptr, size, self.pid, MsgType::WsData);
            let body = wire::body_mut::<wire::WsDataBody>(ptr);
            body.id = id;
            body.len = payload.len() as u32;
            body.remaining = remaining;
            wire::tail_mut::<wire::WsDataBody>(ptr, payload.len() as u32).copy_from_slice(payload);
        }
        counter!("wsmux_frames_out_total").increment(1);
        self.publish(index, size, now);
    }

    fn publish(&mut self, index: u64, size: u32, now: u64) {
        self.sc.publish(index, size);
        self.last_publish_ms = now;
    }
}
