//! The embeddable client: registration handshake, request publication, and
//! status-word waits.
//!
//! Requests are serialized into the client→server ring and awaited by
//! busy-waiting (with yields) on the message's status word; the broker
//! flips it in place once the response fields are populated. A background
//! poller thread (see `poller`) services the server→client ring.

use crate::error::{ClientError, Result};
use crate::handler::ClientHandler;
use crate::poller;
use common::wire::{self, MsgType, Status};
use common::{
    clock, client_queue_name, owner_name, process, server_queue_name, OwnerWord, RingQueue,
    DEFAULT_PREFIX, HEARTBEAT_TIMEOUT_MS,
};
use dashmap::DashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name reported to the broker at registration.
    pub name: String,
    /// Prefix of the shared object names; must match the broker's.
    pub prefix: String,
    /// Broker executable to spawn when none is running. With `None` the
    /// client only attaches to an already-running broker.
    pub broker_path: Option<PathBuf>,
    /// Extra arguments for the spawned broker.
    pub broker_args: Vec<String>,
    /// Registration handshake bound.
    pub register_timeout: Duration,
    /// Bound for ordinary requests.
    pub request_timeout: Duration,
    /// Bound for websocket opens, which ride an upstream handshake.
    pub open_timeout: Duration,
    /// How long to wait for the rings to appear after spawning the broker.
    pub attach_deadline: Duration,
    /// Silence on the server→client ring after which the broker is
    /// declared lost.
    pub broker_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "wsmux-client".to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            broker_path: None,
            broker_args: Vec::new(),
            register_timeout: Duration::from_secs(20),
            request_timeout: Duration::from_secs(10),
            open_timeout: Duration::from_secs(30),
            attach_deadline: Duration::from_secs(10),
            broker_timeout: Duration::from_millis(HEARTBEAT_TIMEOUT_MS),
        }
    }
}

/// Both rings, attached as a unit.
pub(crate) struct QueuePair {
    pub cs: RingQueue,
    pub sc: RingQueue,
}

/// State shared between the API threads and the poller thread.
pub(crate) struct Shared {
    pub pid: u64,
    pub server_pid: AtomicU64,
    pub last_server_heartbeat_ms: AtomicU64,
    pub last_publish_ms: AtomicU64,
    pub run: AtomicBool,
    pub websockets: DashSet<u64>,
    pub queues: Mutex<Option<Arc<QueuePair>>>,
    pub handler: Arc<dyn ClientHandler>,
    pub broker_timeout_ms: u64,
}

/// Handle to the wsmux broker for one client process.
pub struct ProxyClient {
    config: ClientConfig,
    shared: Arc<Shared>,
    poller: Option<JoinHandle<()>>,
}

impl ProxyClient {
    /// Build the client and start its poller thread. No broker contact
    /// happens until the first operation.
    pub fn new(config: ClientConfig, handler: Arc<dyn ClientHandler>) -> Self {
        let shared = Arc::new(Shared {
            pid: process::current_pid(),
            server_pid: AtomicU64::new(0),
            last_server_heartbeat_ms: AtomicU64::new(0),
            last_publish_ms: AtomicU64::new(0),
            run: AtomicBool::new(true),
            websockets: DashSet::new(),
            queues: Mutex::new(None),
            handler,
            broker_timeout_ms: config.broker_timeout.as_millis() as u64,
        });
        let poller = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("wsmux-poller".to_string())
                .spawn(move || poller::run(shared))
                .ok()
        };
        Self {
            config,
            shared,
            poller,
        }
    }

    /// PID of the broker this client is bound to; zero when unbound.
    pub fn server_pid(&self) -> u64 {
        self.shared.server_pid.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.server_pid() != 0
    }

    /// Bind to a broker: attach the rings (spawning the executable if
    /// needed) and run the registration handshake. Idempotent while bound.
    pub fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let pair = self.attach_or_spawn()?;
        self.register(&pair)
    }

    /// Open (or join) an upstream websocket. Returns the connection id and
    /// whether this client caused a new upstream connection.
    pub fn open_ws(&self, url: &str, key: &str) -> Result<(u64, bool)> {
        check_cap("url", url, wire::MAX_URL)?;
        check_cap("key", key, wire::MAX_KEY)?;
        self.connect()?;
        let pair = self.queues()?;

        let (index, ptr, size) = reserve::<wire::OpenWsBody>(&pair.cs, self.shared.pid, MsgType::OpenWs, 0);
        let body = unsafe { wire::body_mut::<wire::OpenWsBody>(ptr) };
        wire::write_str(&mut body.url, url);
        wire::write_str(&mut body.key, key);
        self.publish(&pair, index, size);

        match wait_for_status(ptr, self.config.open_timeout, "websocket open")? {
            Status::Failed => Err(ClientError::Rejected(wire::read_str(&body.err))),
            _ => {
                self.shared
                    .last_server_heartbeat_ms
                    .store(clock::now_ms(), Ordering::Release);
                let id = body.id;
                let new_connection = body.new_connection != 0;
                debug!(id, new_connection, "websocket open acknowledged");
                Ok((id, new_connection))
            }
        }
    }

    /// Detach from a websocket. Fire-and-forget: the broker acks the
    /// request unconditionally and tears the upstream down when the last
    /// client leaves.
    pub fn close_ws(&self, id: u64) -> Result<()> {
        let pair = self.queues()?;
        let (index, ptr, size) = reserve::<wire::CloseWsBody>(&pair.cs, self.shared.pid, MsgType::CloseWs, 0);
        unsafe { wire::body_mut::<wire::CloseWsBody>(ptr).id = id };
        info!(id, "closing websocket");
        self.publish(&pair, index, size);
        Ok(())
    }

    /// Forward raw bytes to the upstream socket. Fire-and-forget; delivery
    /// failures come back asynchronously as error events.
    pub fn send(&self, id: u64, data: &[u8]) -> Result<()> {
        let pair = self.queues()?;
        let (index, ptr, size) =
            reserve::<wire::WsRequestBody>(&pair.cs, self.shared.pid, MsgType::WsRequest, data.len());
        unsafe {
            let body = wire::body_mut::<wire::WsRequestBody>(ptr);
            body.id = id;
            body.len = data.len() as u32;
            wire::tail_mut::<wire::WsRequestBody>(ptr, data.len() as u32).copy_from_slice(data);
        }
        self.publish(&pair, index, size);
        Ok(())
    }

    /// Subscribe to a symbol on an open websocket. `request` is forwarded
    /// verbatim upstream when the broker needs to widen the subscription.
    /// Returns whether the subscription already covered the request (no
    /// upstream forward happened).
    pub fn subscribe(&self, id: u64, symbol: &str, channel_mask: u8, request: &[u8]) -> Result<bool> {
        let ptr = self.subscription_request(MsgType::Subscribe, id, symbol, channel_mask, request)?;
        let body = unsafe { wire::body::<wire::SubscribeBody>(ptr) };
        Ok(body.existing != 0)
    }

    /// Drop this client's interest in a symbol. `request` goes upstream
    /// only when the last holder leaves.
    pub fn unsubscribe(&self, id: u64, symbol: &str, request: &[u8]) -> Result<()> {
        self.subscription_request(MsgType::Unsubscribe, id, symbol, 0, request)?;
        Ok(())
    }

    fn subscription_request(
        &self,
        t: MsgType,
        id: u64,
        symbol: &str,
        channel_mask: u8,
        request: &[u8],
    ) -> Result<*mut u8> {
        check_cap("symbol", symbol, wire::MAX_SYMBOL)?;
        let pair = self.queues()?;
        let (index, ptr, size) =
            reserve::<wire::SubscribeBody>(&pair.cs, self.shared.pid, t, request.len());
        unsafe {
            let body = wire::body_mut::<wire::SubscribeBody>(ptr);
            wire::write_str(&mut body.symbol, symbol);
            body.id = id;
            body.request_len = request.len() as u32;
            body.channels = channel_mask;
            wire::tail_mut::<wire::SubscribeBody>(ptr, request.len() as u32).copy_from_slice(request);
        }
        self.publish(&pair, index, size);
        match wait_for_status(ptr, self.config.request_timeout, "subscription change")? {
            Status::Failed => Err(ClientError::Rejected(format!(
                "{symbol}: broker has no such client or websocket"
            ))),
            _ => Ok(ptr),
        }
    }

    /// Tell the broker this client is going away. Called from `Drop`.
    pub fn unregister(&self) {
        if !self.is_connected() {
            return;
        }
        if let Ok(pair) = self.queues() {
            let (index, ptr, size) =
                reserve::<()>(&pair.cs, self.shared.pid, MsgType::Unregister, 0);
            let _ = ptr;
            self.publish(&pair, index, size);
        }
        self.shared.server_pid.store(0, Ordering::Release);
        info!(pid = self.shared.pid, "unregistered");
    }

    fn queues(&self) -> Result<Arc<QueuePair>> {
        self.shared
            .queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(ClientError::NotConnected)
    }

    fn publish(&self, pair: &QueuePair, index: u64, size: u32) {
        pair.cs.publish(index, size);
        self.shared
            .last_publish_ms
            .store(clock::now_ms(), Ordering::Relaxed);
    }

    fn attach_or_spawn(&self) -> Result<Arc<QueuePair>> {
        // Stale rings survive a crashed broker; only attach behind a live
        // owner, otherwise spawn a fresh broker and wait for its rings.
        if broker_alive(&self.config.prefix) {
            if let Ok(pair) = attach(&self.config.prefix) {
                return Ok(self.install(pair));
            }
        }

        let Some(path) = &self.config.broker_path else {
            return Err(ClientError::BrokerUnavailable(
                "no broker running and no executable configured".to_string(),
            ));
        };
        process::spawn_detached(path, &self.config.broker_args)?;

        let deadline = Instant::now() + self.config.attach_deadline;
        loop {
            match attach(&self.config.prefix) {
                Ok(pair) => return Ok(self.install(pair)),
                Err(e) => {
                    if Instant::now() >= deadline {
                        warn!(error = %e, "broker rings never appeared");
                        return Err(ClientError::Timeout("broker rings"));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }

    fn install(&self, pair: QueuePair) -> Arc<QueuePair> {
        let pair = Arc::new(pair);
        *self
            .shared
            .queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::clone(&pair));
        pair
    }

    fn register(&self, pair: &QueuePair) -> Result<()> {
        let (index, ptr, size) =
            reserve::<wire::RegisterBody>(&pair.cs, self.shared.pid, MsgType::Register, 0);
        let body = unsafe { wire::body_mut::<wire::RegisterBody>(ptr) };
        wire::write_str(&mut body.name, &self.config.name);
        self.publish(pair, index, size);

        match wait_for_status(ptr, self.config.register_timeout, "registration")? {
            Status::Failed => Err(ClientError::Rejected(wire::read_str(&body.err))),
            _ => {
                let server_pid = body.server_pid;
                self.shared
                    .last_server_heartbeat_ms
                    .store(clock::now_ms(), Ordering::Release);
                self.shared.server_pid.store(server_pid, Ordering::Release);
                info!(server_pid, "registered with broker");
                Ok(())
            }
        }
    }
}

impl Drop for ProxyClient {
    fn drop(&mut self) {
        self.unregister();
        self.shared.run.store(false, Ordering::Release);
        if let Some(handle) = self.poller.take() {
            let _ = handle.join();
        }
    }
}

/// Attach both rings. The server→client ring is created last by the
/// broker, so probing it first means both exist on success.
fn attach(prefix: &str) -> common::Result<QueuePair> {
    let sc = RingQueue::attach(&server_queue_name(prefix))?;
    let cs = RingQueue::attach(&client_queue_name(prefix))?;
    Ok(QueuePair { cs, sc })
}

/// Whether the owner word names a live broker process.
fn broker_alive(prefix: &str) -> bool {
    match OwnerWord::read(&owner_name(prefix)) {
        Ok(pid) => pid != 0 && process::is_alive(pid),
        Err(_) => false,
    }
}

fn reserve<T>(queue: &RingQueue, pid: u64, t: MsgType, tail: usize) -> (u64, *mut u8, u32) {
    let size = wire::message_size::<T>(tail);
    let (index, ptr) = queue.reserve(size);
    unsafe { wire::init_message(ptr, size, pid, t) };
    (index, ptr, size)
}

/// Spin on the status word with cooperative yields until the broker flips
/// it or the bound expires.
fn wait_for_status(ptr: *mut u8, timeout: Duration, what: &'static str) -> Result<Status> {
    let deadline = Instant::now() + timeout;
    loop {
        let status = unsafe { wire::header(ptr) }.status();
        if status != Status::Pending {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            return Err(ClientError::Timeout(what));
        }
        std::thread::yield_now();
    }
}

fn check_cap(field: &'static str, value: &str, max: usize) -> Result<()> {
    if value.len() >= max {
        return Err(ClientError::FieldTooLong {
            field,
            len: value.len(),
            max: max - 1,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::wire::channels;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex as StdMutex;

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn unique_prefix() -> String {
        format!(
            "wsmuxct{}x{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn test_config(prefix: &str) -> ClientConfig {
        ClientConfig {
            name: "t1".to_string(),
            prefix: prefix.to_string(),
            ..ClientConfig::default()
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Opened(u64),
        Closed(u64),
        Error(u64, Vec<u8>),
        Data(u64, Vec<u8>, u32),
        BrokerLost,
    }

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<Event>>,
    }

    impl Recorder {
        fn push(&self, event: Event) {
            self.events
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(event);
        }

        fn snapshot(&self) -> Vec<Event> {
            self.events
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone()
        }

        fn wait_for(&self, pred: impl Fn(&[Event]) -> bool, timeout: Duration) -> bool {
            let deadline = Instant::now() + timeout;
            while Instant::now() < deadline {
                if pred(&self.snapshot()) {
                    return true;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            false
        }
    }

    impl ClientHandler for Recorder {
        fn on_opened(&self, id: u64) {
            self.push(Event::Opened(id));
        }
        fn on_closed(&self, id: u64) {
            self.push(Event::Closed(id));
        }
        fn on_error(&self, id: u64, error: &[u8]) {
            self.push(Event::Error(id, error.to_vec()));
        }
        fn on_data(&self, id: u64, data: &[u8], remaining: u32) {
            self.push(Event::Data(id, data.to_vec(), remaining));
        }
        fn on_broker_lost(&self) {
            self.push(Event::BrokerLost);
        }
    }

    const STUB_WS_ID: u64 = 555;

    /// The stub answers with the test process's own PID so the client's
    /// owner-word liveness probe sees a live broker.
    fn stub_pid() -> u64 {
        process::current_pid()
    }

    /// A scripted broker living on a thread: answers the handshake and the
    /// request messages the way the real one does, over real shared rings,
    /// holding the owner word like the real process.
    struct StubBroker {
        stop: Arc<AtomicBool>,
        muted: Arc<AtomicBool>,
        handle: Option<std::thread::JoinHandle<()>>,
        _cs: Arc<RingQueue>,
        _sc: Arc<RingQueue>,
        _owner: OwnerWord,
    }

    impl StubBroker {
        fn start(prefix: &str) -> Self {
            let owner = OwnerWord::acquire(&owner_name(prefix), stub_pid()).unwrap();
            let cs = Arc::new(RingQueue::create(&client_queue_name(prefix), 1 << 16).unwrap());
            let sc = Arc::new(RingQueue::create(&server_queue_name(prefix), 1 << 16).unwrap());
            let stop = Arc::new(AtomicBool::new(false));
            let muted = Arc::new(AtomicBool::new(false));
            let handle = {
                let cs = Arc::clone(&cs);
                let sc = Arc::clone(&sc);
                let stop = Arc::clone(&stop);
                let muted = Arc::clone(&muted);
                std::thread::spawn(move || stub_loop(&cs, &sc, &stop, &muted))
            };
            Self {
                stop,
                muted,
                handle: Some(handle),
                _cs: cs,
                _sc: sc,
                _owner: owner,
            }
        }

        fn mute(&self) {
            self.muted.store(true, Ordering::Release);
        }
    }

    impl Drop for StubBroker {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Release);
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    fn stub_loop(cs: &RingQueue, sc: &RingQueue, stop: &AtomicBool, muted: &AtomicBool) {
        let mut cursor = cs.initial_reading_index();
        let mut last_beat = 0u64;
        while !stop.load(Ordering::Acquire) {
            let now = clock::now_ms();
            if !muted.load(Ordering::Acquire) && now.saturating_sub(last_beat) > 100 {
                emit_bare(sc, MsgType::Heartbeat);
                last_beat = now;
            }
            let Some((ptr, _len)) = cs.read(&mut cursor) else {
                std::thread::sleep(Duration::from_millis(1));
                continue;
            };
            let hdr = unsafe { wire::header(ptr) };
            let from = hdr.pid;
            match hdr.type_tag() {
                Some(MsgType::Register) => {
                    let body = unsafe { wire::body_mut::<wire::RegisterBody>(ptr) };
                    body.server_pid = stub_pid();
                    hdr.set_status(Status::Success);
                }
                Some(MsgType::OpenWs) => {
                    let body = unsafe { wire::body_mut::<wire::OpenWsBody>(ptr) };
                    body.id = STUB_WS_ID;
                    body.client_pid = from;
                    body.new_connection = 1;
                    emit_open(sc, STUB_WS_ID, from);
                    emit_data(sc, STUB_WS_ID, b"hi\n");
                    hdr.set_status(Status::Success);
                }
                Some(MsgType::Subscribe) => {
                    let body = unsafe { wire::body_mut::<wire::SubscribeBody>(ptr) };
                    body.existing = 1;
                    hdr.set_status(Status::Success);
                }
                Some(MsgType::CloseWs) => {
                    let id = unsafe { wire::body::<wire::CloseWsBody>(ptr) }.id;
                    emit_close(sc, id);
                    hdr.set_status(Status::Success);
                }
                _ => hdr.set_status(Status::Success),
            }
        }
    }

    fn emit_bare(sc: &RingQueue, t: MsgType) {
        let size = wire::BARE_MESSAGE_SIZE;
        let (index, ptr) = sc.reserve(size);
        unsafe { wire::init_message(ptr, size, stub_pid(), t) };
        sc.publish(index, size);
    }

    fn emit_open(sc: &RingQueue, id: u64, client_pid: u64) {
        let size = wire::message_size::<wire::OpenWsBody>(0);
        let (index, ptr) = sc.reserve(size);
        unsafe {
            wire::init_message(ptr, size, stub_pid(), MsgType::OpenWs);
            let body = wire::body_mut::<wire::OpenWsBody>(ptr);
            body.id = id;
            body.client_pid = client_pid;
            body.new_connection = 1;
        }
        sc.publish(index, size);
    }

    fn emit_data(sc: &RingQueue, id: u64, payload: &[u8]) {
        let size = wire::message_size::<wire::WsDataBody>(payload.len());
        let (index, ptr) = sc.reserve(size);
        unsafe {
            wire::init_message(ptr, size, stub_pid(), MsgType::WsData);
            let body = wire::body_mut::<wire::WsDataBody>(ptr);
            body.id = id;
            body.len = payload.len() as u32;
            wire::tail_mut::<wire::WsDataBody>(ptr, payload.len() as u32).copy_from_slice(payload);
        }
        sc.publish(index, size);
    }

    fn emit_close(sc: &RingQueue, id: u64) {
        let size = wire::message_size::<wire::CloseWsBody>(0);
        let (index, ptr) = sc.reserve(size);
        unsafe {
            wire::init_message(ptr, size, stub_pid(), MsgType::CloseWs);
            wire::body_mut::<wire::CloseWsBody>(ptr).id = id;
        }
        sc.publish(index, size);
    }

    #[test]
    fn status_wait_returns_when_the_responder_flips() {
        let size = wire::message_size::<wire::CloseWsBody>(0);
        let mut frame = vec![0u8; size as usize];
        let ptr = frame.as_mut_ptr();
        unsafe { wire::init_message(ptr, size, 1, MsgType::CloseWs) };

        let addr = ptr as usize;
        let responder = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            unsafe { wire::header(addr as *mut u8) }.set_status(Status::Success);
        });
        let status = wait_for_status(ptr, Duration::from_secs(5), "test").unwrap();
        assert_eq!(status, Status::Success);
        responder.join().unwrap();
    }

    #[test]
    fn status_wait_times_out_on_silence() {
        let size = wire::BARE_MESSAGE_SIZE;
        let mut frame = vec![0u8; size as usize];
        let ptr = frame.as_mut_ptr();
        unsafe { wire::init_message(ptr, size, 1, MsgType::Heartbeat) };
        let err = wait_for_status(ptr, Duration::from_millis(30), "test").unwrap_err();
        assert!(matches!(err, ClientError::Timeout("test")));
    }

    #[test]
    fn oversize_fields_are_rejected_before_any_broker_contact() {
        let recorder = Arc::new(Recorder::default());
        let client = ProxyClient::new(test_config(&unique_prefix()), recorder);
        let long_url = "w".repeat(wire::MAX_URL + 10);
        let err = client.open_ws(&long_url, "K").unwrap_err();
        assert!(matches!(err, ClientError::FieldTooLong { field: "url", .. }));
    }

    #[test]
    fn connect_without_broker_or_executable_fails() {
        let recorder = Arc::new(Recorder::default());
        let client = ProxyClient::new(test_config(&unique_prefix()), recorder);
        let err = client.open_ws("wss://x.test/v1", "K").unwrap_err();
        assert!(matches!(err, ClientError::BrokerUnavailable(_)));
    }

    #[test]
    fn open_subscribe_and_stream_against_stub_broker() {
        let prefix = unique_prefix();
        let stub = StubBroker::start(&prefix);
        let recorder = Arc::new(Recorder::default());
        let client = ProxyClient::new(
            test_config(&prefix),
            Arc::clone(&recorder) as Arc<dyn ClientHandler>,
        );

        let (id, new_connection) = client.open_ws("wss://x.test/v1", "K").unwrap();
        assert_eq!(id, STUB_WS_ID);
        assert!(new_connection);
        assert!(client.is_connected());
        assert_eq!(client.server_pid(), stub_pid());

        let existing = client
            .subscribe(id, "AAPL", channels::QUOTES | channels::TRADES, b"sub-req")
            .unwrap();
        assert!(existing);

        assert!(recorder.wait_for(
            |events| {
                events.contains(&Event::Opened(STUB_WS_ID))
                    && events.contains(&Event::Data(STUB_WS_ID, b"hi\n".to_vec(), 0))
            },
            Duration::from_secs(5)
        ));
        // The ack lands before the first frame on the same cursor.
        let events = recorder.snapshot();
        let opened_at = events
            .iter()
            .position(|e| *e == Event::Opened(STUB_WS_ID))
            .unwrap();
        let data_at = events
            .iter()
            .position(|e| matches!(e, Event::Data(..)))
            .unwrap();
        assert!(opened_at < data_at);

        client.close_ws(id).unwrap();
        assert!(recorder.wait_for(
            |events| events.contains(&Event::Closed(STUB_WS_ID)),
            Duration::from_secs(5)
        ));
        drop(client);
        drop(stub);
    }

    #[test]
    fn broker_silence_synthesizes_closes() {
        let prefix = unique_prefix();
        let stub = StubBroker::start(&prefix);
        let recorder = Arc::new(Recorder::default());
        let config = ClientConfig {
            broker_timeout: Duration::from_millis(400),
            ..test_config(&prefix)
        };
        let client = ProxyClient::new(config, Arc::clone(&recorder) as Arc<dyn ClientHandler>);

        let (id, _) = client.open_ws("wss://x.test/v1", "K").unwrap();
        assert!(recorder.wait_for(
            |events| events.contains(&Event::Opened(id)),
            Duration::from_secs(5)
        ));

        stub.mute();
        assert!(recorder.wait_for(
            |events| {
                events.contains(&Event::Closed(id)) && events.contains(&Event::BrokerLost)
            },
            Duration::from_secs(5)
        ));
        assert!(!client.is_connected());
        drop(stub);
    }
}
