//! Engine handler: the worker task that owns the registry.
//!
//! Every registry and engine mutation happens here, serially:
//! - requests from stream tasks arrive on one unbounded channel,
//! - a fixed-rate interval drives `timer_tick` (120 Hz by default),
//! - a one-minute interval drives `timer_minute_tick` and reaping,
//! - blocking jobs run on `spawn_blocking` and report back through the
//!   same channel.
//!
//! After each step the registry output is routed to the stream writers.
//! [`EngineHandler`] is the cheap, cloneable façade stream tasks use; its
//! calls never wait for the worker.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use session_core::{Clock, Credential, EngineKind, EngineRegistry, Output, RegistrySettings, StreamId, UserDirectory};
use session_protocol::ServerFrame;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::types::{HandlerRequest, HandlerRx, HandlerTx, Outbound, StreamRegistry};

const MINUTE: Duration = Duration::from_secs(60);

/// Thread-safe entry point into the worker.
#[derive(Debug, Clone)]
pub struct EngineHandler {
    tx: HandlerTx,
}

impl EngineHandler {
    /// Start the worker owning a fresh registry.
    pub fn spawn(
        settings: RegistrySettings,
        streams: StreamRegistry,
        directory: Arc<dyn UserDirectory>,
    ) -> (EngineHandler, JoinHandle<()>) {
        let (tx, rx): (HandlerTx, HandlerRx) = mpsc::unbounded_channel();
        let tick = Duration::from_millis(settings.tick_interval_ms.max(1));
        let registry = EngineRegistry::new(settings);

        let worker = Worker {
            registry,
            streams,
            directory,
            jobs: tx.clone(),
        };
        let handle = tokio::spawn(worker.run(rx, tick));

        (EngineHandler { tx }, handle)
    }

    fn send(&self, req: HandlerRequest) {
        if self.tx.send(req).is_err() {
            warn!("engine handler closed");
        }
    }

    pub fn stream_opened(&self, stream: StreamId, host: String, agent: String) {
        self.send(HandlerRequest::StreamOpened { stream, host, agent });
    }

    pub fn authenticated(&self, stream: StreamId, credential: Credential) {
        self.send(HandlerRequest::Authenticated { stream, credential });
    }

    pub fn observer_add(&self, stream: StreamId, kind: EngineKind) {
        self.send(HandlerRequest::ObserverAdd { stream, kind });
    }

    pub fn observer_remove(&self, stream: StreamId, kind: EngineKind) {
        self.send(HandlerRequest::ObserverRemove { stream, kind });
    }

    pub fn message(&self, stream: StreamId, kind: EngineKind, payload: Value) {
        self.send(HandlerRequest::Message { stream, kind, payload });
    }

    pub fn stream_closed(&self, stream: StreamId) {
        self.send(HandlerRequest::StreamClosed { stream });
    }

    /// Close every stream and stop the worker.
    pub fn shutdown(&self) {
        self.send(HandlerRequest::Shutdown);
    }
}

struct Worker {
    registry: EngineRegistry,
    streams: StreamRegistry,
    directory: Arc<dyn UserDirectory>,

    /// Back into our own queue, for finished jobs.
    jobs: HandlerTx,
}

impl Worker {
    async fn run(mut self, mut rx: HandlerRx, tick: Duration) {
        let mut ticker = interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut minute = interval_at(Instant::now() + MINUTE, MINUTE);
        minute.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(tick_ms = tick.as_millis() as u64, "engine worker started");

        loop {
            let keep_running = tokio::select! {
                req = rx.recv() => match req {
                    Some(req) => self.handle(req),
                    None => false,
                },
                _ = ticker.tick() => {
                    self.registry.set_clock(Clock::system());
                    self.registry.timer_tick();
                    true
                }
                _ = minute.tick() => {
                    self.registry.set_clock(Clock::system());
                    self.registry.timer_minute_tick();
                    debug!(engines = self.registry.engine_count(), streams = self.registry.stream_count(), "minute tick");
                    true
                }
            };

            self.route().await;

            if !keep_running {
                break;
            }
        }

        info!("engine worker shutting down");
    }

    /// Apply one request. Returns `false` once the worker should stop.
    fn handle(&mut self, req: HandlerRequest) -> bool {
        self.registry.set_clock(Clock::system());

        match req {
            HandlerRequest::StreamOpened { stream, host, agent } => {
                self.registry.stream_add(stream, host, agent);
            }
            HandlerRequest::Authenticated { stream, credential } => {
                if !self.registry.stream_authenticated(stream, credential) {
                    warn!(stream = %stream, "authentication not applied");
                }
            }
            HandlerRequest::ObserverAdd { stream, kind } => {
                self.registry.observer_add(stream, kind);
            }
            HandlerRequest::ObserverRemove { stream, kind } => {
                self.registry.observer_remove(stream, kind);
            }
            HandlerRequest::Message { stream, kind, payload } => {
                self.registry.handle_message(stream, kind, &payload);
            }
            HandlerRequest::StreamClosed { stream } => {
                self.registry.stream_remove(stream);
            }
            HandlerRequest::JobFinished { engine, result } => {
                self.registry.job_finished(engine, result);
            }
            HandlerRequest::Shutdown => {
                self.registry.close_all();
                return false;
            }
        }

        true
    }

    /// Route everything the registry queued.
    async fn route(&mut self) {
        let outputs = self.registry.drain();
        if outputs.is_empty() {
            return;
        }

        // Snapshot of current streams to minimize lock hold time.
        let streams = {
            let guard = self.streams.read().await;
            guard.clone()
        };

        for out in outputs {
            match out {
                Output::Send { stream, op, data } => {
                    if let Some(tx) = streams.get(&stream) {
                        let _ = tx.send(Outbound::Frame(ServerFrame::new(op, data)));
                    } else {
                        trace!(stream = %stream, "dropping frame for closed stream");
                    }
                }
                Output::Close { stream } => {
                    if let Some(tx) = streams.get(&stream) {
                        let _ = tx.send(Outbound::Close);
                    }
                }
                Output::Job { engine, job } => {
                    let directory = Arc::clone(&self.directory);
                    let jobs = self.jobs.clone();
                    tokio::task::spawn_blocking(move || {
                        let result = job.run(directory.as_ref());
                        let _ = jobs.send(HandlerRequest::JobFinished { engine, result });
                    });
                }
            }
        }
    }
}
