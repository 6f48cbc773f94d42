//! The broker process: ownership, rings, and the event loop.
//!
//! One `Broker` per host. Startup runs the owner arbitration, then creates
//! both rings; a contended owner word aborts before any segment is touched.
//! The loop is a single task on a current-thread runtime: it drains the
//! client→server ring, applies upstream events, and runs the heartbeat and
//! eviction sweep. No other task mutates broker state.

use crate::config::BrokerConfig;
use crate::error::Result;
use crate::proxy::ProxyCore;
use crate::upstream::{TokioUpstream, UpstreamEvent};
use common::{clock, owner_name, process, server_queue_name, client_queue_name};
use common::{OwnerWord, RingQueue, CLIENT_QUEUE_SIZE};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// How often the loop polls the client→server ring when idle.
const POLL_PERIOD: Duration = Duration::from_millis(1);

/// How often the heartbeat/eviction sweep runs. Emission itself is gated on
/// the 500 ms publish interval.
const SWEEP_PERIOD: Duration = Duration::from_millis(100);

/// Close-frame drain budget at shutdown.
const DRAIN_BUDGET: Duration = Duration::from_secs(5);

/// Messages drained from the ring per poll tick before yielding back to the
/// reactor, so a chatty client cannot starve upstream I/O.
const DRAIN_BATCH: usize = 128;

pub struct Broker {
    // Field order pins teardown: rings unmap before the owner word clears.
    cs: RingQueue,
    cursor: u64,
    core: ProxyCore<TokioUpstream>,
    events: mpsc::UnboundedReceiver<UpstreamEvent>,
    _owner: OwnerWord,
}

impl Broker {
    /// Arbitrate ownership and build both rings. `Err(OwnerContended)` means
    /// another live broker holds the queues; the process should exit nonzero
    /// without touching them.
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        let pid = process::current_pid();
        let owner = OwnerWord::acquire(&owner_name(&config.prefix), pid)?;

        let cs = RingQueue::create(&client_queue_name(&config.prefix), CLIENT_QUEUE_SIZE)?;
        let sc = RingQueue::create(
            &server_queue_name(&config.prefix),
            config.server_queue_size,
        )?;
        let cursor = cs.initial_reading_index();

        let (event_tx, events) = mpsc::unbounded_channel();
        let core = ProxyCore::new(pid, sc, TokioUpstream::new(event_tx));

        info!(
            pid,
            prefix = %config.prefix,
            sc_bytes = config.server_queue_size,
            "broker initialized"
        );
        Ok(Self {
            cs,
            cursor,
            core,
            events,
            _owner: owner,
        })
    }

    /// Run until a signal arrives or the post-last-client grace elapses.
    pub async fn run(mut self) -> Result<()> {
        // Announce liveness immediately so spawning clients bind fast.
        self.core.send_heartbeat(clock::now_ms());

        let mut poll = interval(POLL_PERIOD);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep = interval(SWEEP_PERIOD);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("shutdown signal received");
                    break;
                }

                Some(event) = self.events.recv() => {
                    self.core.apply_event(event, clock::now_ms());
                }

                _ = sweep.tick() => {
                    let now = clock::now_ms();
                    self.core.check_heartbeats(now);
                    if self.core.shutdown_due(now) {
                        info!("no clients for the grace window; shutting down");
                        break;
                    }
                }

                _ = poll.tick() => {
                    let now = clock::now_ms();
                    let mut budget = DRAIN_BATCH;
                    while budget > 0 {
                        let Some((ptr, _len)) = self.cs.read(&mut self.cursor) else {
                            break;
                        };
                        unsafe { self.core.handle_message(ptr, now) };
                        budget -= 1;
                    }
                }
            }
        }

        self.drain().await;
        info!("broker exit");
        Ok(())
    }

    /// Close every upstream socket and give the close frames a bounded
    /// window to flush before the reactor stops.
    async fn drain(&mut self) {
        self.core.close_all();
        let deadline = Instant::now() + DRAIN_BUDGET;
        while !self.core.connections.is_empty() {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) => self.core.apply_event(event, clock::now_ms()),
                Ok(None) => break,
                Err(_) => {
                    debug!(
                        remaining = self.core.connections.len(),
                        "drain budget exhausted"
                    );
                    break;
                }
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received terminate signal"),
    }
}
