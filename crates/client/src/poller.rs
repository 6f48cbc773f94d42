//! The background thread servicing the server→client ring.
//!
//! Reads with this client's private cursor, filters frames by the bound
//! broker PID (stale ring contents from a previous broker carry its PID and
//! are skipped), publishes client heartbeats, and declares the broker lost
//! after prolonged silence, synthesizing close events for every tracked id.

use crate::client::{QueuePair, Shared};
use common::wire::{self, MsgType};
use common::{clock, HEARTBEAT_INTERVAL_MS};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Idle backoff while no broker is bound.
const UNBOUND_BACKOFF: Duration = Duration::from_millis(250);

pub(crate) fn run(shared: Arc<Shared>) {
    let mut current: Option<Arc<QueuePair>> = None;
    let mut cursor = 0u64;

    while shared.run.load(Ordering::Acquire) {
        let pair = shared
            .queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let Some(pair) = pair else {
            std::thread::sleep(UNBOUND_BACKOFF);
            continue;
        };

        // A re-attach swaps the mapping; start past whatever the ring
        // already holds.
        let fresh = !current
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(c, &pair));
        if fresh {
            cursor = pair.sc.initial_reading_index();
            current = Some(Arc::clone(&pair));
        }

        let server_pid = shared.server_pid.load(Ordering::Acquire);
        if server_pid == 0 {
            std::thread::sleep(UNBOUND_BACKOFF);
            continue;
        }

        let now = clock::now_ms();
        let mut busy = false;

        if let Some((ptr, _len)) = pair.sc.read(&mut cursor) {
            busy = true;
            shared
                .last_server_heartbeat_ms
                .store(now, Ordering::Release);
            let hdr = unsafe { wire::header(ptr) };
            let from = hdr.pid;
            if from == server_pid {
                dispatch(&shared, ptr);
            }
        }

        if now.saturating_sub(shared.last_publish_ms.load(Ordering::Relaxed))
            > HEARTBEAT_INTERVAL_MS
        {
            publish_heartbeat(&shared, &pair);
            shared.last_publish_ms.store(now, Ordering::Relaxed);
            busy = true;
        }

        if !busy {
            let last_seen = shared.last_server_heartbeat_ms.load(Ordering::Acquire);
            if last_seen != 0 && now.saturating_sub(last_seen) > shared.broker_timeout_ms {
                declare_broker_lost(&shared, server_pid, now, last_seen);
            } else {
                std::thread::yield_now();
            }
        }
    }
}

fn dispatch(shared: &Shared, ptr: *mut u8) {
    let hdr = unsafe { wire::header(ptr) };
    match hdr.type_tag() {
        Some(MsgType::OpenWs) => {
            let body = unsafe { wire::body::<wire::OpenWsBody>(ptr) };
            let client_pid = body.client_pid;
            let id = body.id;
            // Acks for other clients' opens are not ours to act on.
            if client_pid == shared.pid {
                shared.websockets.insert(id);
                shared.handler.on_opened(id);
            }
        }
        Some(MsgType::CloseWs) => {
            let id = unsafe { wire::body::<wire::CloseWsBody>(ptr) }.id;
            if shared.websockets.remove(&id).is_some() {
                shared.handler.on_closed(id);
            } else {
                debug!(id, "close for untracked websocket");
            }
        }
        Some(MsgType::WsError) => {
            let body = unsafe { wire::body::<wire::WsErrorBody>(ptr) };
            let id = body.id;
            let len = body.len;
            if shared.websockets.contains(&id) {
                // Copy out before the user callback; the slot may be
                // overwritten by the producer at any time.
                let error = unsafe { wire::tail::<wire::WsErrorBody>(ptr, len) }.to_vec();
                shared.handler.on_error(id, &error);
            }
        }
        Some(MsgType::WsData) => {
            let body = unsafe { wire::body::<wire::WsDataBody>(ptr) };
            let id = body.id;
            let len = body.len;
            let remaining = body.remaining;
            if shared.websockets.contains(&id) {
                let data = unsafe { wire::tail::<wire::WsDataBody>(ptr, len) }.to_vec();
                shared.handler.on_data(id, &data, remaining);
            }
        }
        Some(MsgType::Heartbeat) => {}
        _ => {}
    }
}

fn publish_heartbeat(shared: &Shared, pair: &QueuePair) {
    let size = wire::BARE_MESSAGE_SIZE;
    let (index, ptr) = pair.cs.reserve(size);
    unsafe { wire::init_message(ptr, size, shared.pid, MsgType::Heartbeat) };
    pair.cs.publish(index, size);
}

fn declare_broker_lost(shared: &Shared, server_pid: u64, now: u64, last_seen: u64) {
    info!(
        server_pid,
        now, last_seen, "broker heartbeat timeout; dropping connection state"
    );
    shared.server_pid.store(0, Ordering::Release);
    let ids: Vec<u64> = shared.websockets.iter().map(|entry| *entry).collect();
    shared.websockets.clear();
    for id in ids {
        shared.handler.on_closed(id);
    }
    shared.handler.on_broker_lost();
}
