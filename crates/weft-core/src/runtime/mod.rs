//! The service runtime: the event loop every stage runs.
//!
//! A runtime owns one data-in socket, one data-out socket, and one
//! locally-bound control channel. Its lifecycle is
//! `Init -> Ready -> Running -> Terminating -> Closed`, published through
//! a watch channel. The loop blocks on a multiplexed wait over
//! {data-in, control, flush tick, sweep tick}; exactly one envelope is
//! read and dispatched per wake. A failing handler is logged with the
//! envelope's route trace and never kills the loop — only a `Terminate`
//! on the control channel does.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::envelope::{decode_envelope, Envelope, EnvelopeKind, PartInfo, Payload};
use crate::stage::{Stage, StageOutput};
use crate::transport::{
    ControlChannel, ControlClient, ControlRequest, DataInbound, DataOutbound, FanMode,
    TransportConfig, TransportError,
};

/// Lifecycle states of a service runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    /// Sockets not yet bound or connected.
    Init,
    /// Sockets are set up; the loop is about to run.
    Ready,
    /// The event loop is processing envelopes.
    Running,
    /// A terminate was acknowledged; the loop is winding down.
    Terminating,
    /// All sockets closed. Terminal.
    Closed,
}

/// Counters kept by the event loop, reported through `Status`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RuntimeStats {
    /// Envelopes received on data-in.
    pub received: u64,
    /// Envelopes forwarded on data-out.
    pub forwarded: u64,
    /// Handler invocations that returned an error.
    pub handler_errors: u64,
    /// Frames that failed to decode or validate.
    pub decode_errors: u64,
    /// Envelopes a stage intentionally dropped.
    pub dropped: u64,
    /// Envelopes flushed by the sweep hook (evicted aggregations).
    pub swept: u64,
}

/// How one side of the data plane is wired.
#[derive(Debug, Clone)]
pub enum SocketSpec {
    /// Bind a listener. `mode` and `expected_peers` only apply to the
    /// outbound side; the inbound side accepts and merges unconditionally.
    Bind {
        /// Local address to bind.
        addr: SocketAddr,
        /// Fan discipline for an outbound bind.
        mode: FanMode,
        /// Peers that must connect before the first outbound frame.
        expected_peers: usize,
    },
    /// Connect to already-resolved peer endpoints.
    Connect {
        /// Remote addresses (one, except for multi-publisher subscribes).
        peers: Vec<SocketAddr>,
    },
}

/// Static configuration of one runtime instance.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Instance name, recorded in route hops and log lines.
    pub name: String,
    /// Data-in wiring; `None` for a pure producer.
    pub data_in: Option<SocketSpec>,
    /// Data-out wiring; `None` for a pure consumer.
    pub data_out: Option<SocketSpec>,
    /// Local control endpoint; always bound.
    pub control_addr: SocketAddr,
    /// Part level stamped on every data envelope as it arrives.
    ///
    /// Set for consumers on a multi-consumer broadcast edge: every
    /// consumer receives an identical frame, so the sibling identity that
    /// a matching reduce router aggregates on can only be assigned here,
    /// by the branch that processed the copy.
    pub branch: Option<PartInfo>,
    /// Auto-persistence interval; `None` disables flushing.
    pub flush_interval: Option<Duration>,
    /// Interval of the sweep (eviction) tick.
    pub sweep_interval: Duration,
    /// Transport tuning.
    pub transport: TransportConfig,
}

impl RuntimeConfig {
    /// Creates a config with no data sockets and default intervals; the
    /// supervisor fills in the wiring.
    #[must_use]
    pub fn named(name: impl Into<String>, control_addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            data_in: None,
            data_out: None,
            control_addr,
            branch: None,
            flush_interval: None,
            sweep_interval: Duration::from_millis(500),
            transport: TransportConfig::default(),
        }
    }
}

/// Errors raised while starting or stopping a runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Socket setup failed.
    #[error("runtime '{name}' failed to start: {source}")]
    Start {
        /// Instance name.
        name: String,
        /// Underlying transport error.
        source: TransportError,
    },

    /// The control exchange during close failed.
    #[error("runtime '{name}' close failed: {source}")]
    Close {
        /// Instance name.
        name: String,
        /// Underlying transport error.
        source: TransportError,
    },

    /// The loop task ended without reaching `Closed`.
    #[error("runtime '{0}' loop task failed")]
    LoopTask(String),
}

/// A running stage worker.
///
/// Constructing via [`start`](Self::start) performs the whole
/// `Init -> Ready` transition; the value is only handed out once `Ready`,
/// which is what makes start idempotent to observe. [`close`](Self::close)
/// drives `Terminating -> Closed` through the control channel.
pub struct ServiceRuntime {
    name: String,
    control_addr: SocketAddr,
    state_rx: watch::Receiver<RuntimeState>,
    task: JoinHandle<()>,
    transport: TransportConfig,
}

impl ServiceRuntime {
    /// Binds/connects all sockets and spawns the event loop.
    ///
    /// Bind failures are reported here, before the loop exists; connect
    /// sides establish lazily with retry, so peer start order is free.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Start`] when a bind fails.
    pub async fn start(
        config: RuntimeConfig,
        stage: Box<dyn Stage>,
    ) -> Result<Self, RuntimeError> {
        let name = config.name.clone();
        let wrap = |source: TransportError| RuntimeError::Start {
            name: name.clone(),
            source,
        };

        let control = ControlChannel::bind(config.control_addr, &config.transport)
            .await
            .map_err(&wrap)?;
        let control_addr = control.local_addr();

        let data_in = match &config.data_in {
            Some(SocketSpec::Bind { addr, .. }) => {
                Some(DataInbound::bind(*addr, &config.transport).await.map_err(&wrap)?)
            }
            Some(SocketSpec::Connect { peers }) => {
                Some(DataInbound::connect(peers, &config.transport))
            }
            None => None,
        };
        let data_out = match &config.data_out {
            Some(SocketSpec::Bind {
                addr,
                mode,
                expected_peers,
            }) => Some(
                DataOutbound::bind(*addr, *mode, *expected_peers, &config.transport)
                    .await
                    .map_err(&wrap)?,
            ),
            Some(SocketSpec::Connect { peers }) => peers
                .first()
                .map(|addr| DataOutbound::connect(*addr, &config.transport)),
            None => None,
        };

        let (state_tx, state_rx) = watch::channel(RuntimeState::Ready);
        let transport = config.transport.clone();
        let worker = Worker {
            name: name.clone(),
            stage,
            control,
            data_in,
            data_out,
            branch: config.branch,
            flush_interval: config.flush_interval,
            sweep_interval: config.sweep_interval,
            stats: RuntimeStats::default(),
            state_tx,
        };
        let task = tokio::spawn(worker.run());
        info!(stage = %name, control = %control_addr, "runtime ready");

        Ok(Self {
            name,
            control_addr,
            state_rx,
            task,
            transport,
        })
    }

    /// Instance name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bound control endpoint.
    #[must_use]
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RuntimeState {
        *self.state_rx.borrow()
    }

    /// Hard-aborts the loop task without the terminate handshake. Used by
    /// supervisors tearing down a flow whose handle was dropped.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Sends `Terminate` over the control channel and blocks until the
    /// loop reaches `Closed`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Close`] when the control exchange fails, or
    /// [`RuntimeError::LoopTask`] when the loop task died early.
    pub async fn close(mut self) -> Result<(), RuntimeError> {
        let mut client = ControlClient::connect(self.control_addr, &self.transport)
            .await
            .map_err(|source| RuntimeError::Close {
                name: self.name.clone(),
                source,
            })?;
        client
            .terminate()
            .await
            .map_err(|source| RuntimeError::Close {
                name: self.name.clone(),
                source,
            })?;
        while *self.state_rx.borrow() != RuntimeState::Closed {
            if self.state_rx.changed().await.is_err() {
                break;
            }
        }
        self.task
            .await
            .map_err(|_| RuntimeError::LoopTask(self.name.clone()))
    }
}

/// Everything the event loop owns.
struct Worker {
    name: String,
    stage: Box<dyn Stage>,
    control: ControlChannel,
    data_in: Option<DataInbound>,
    data_out: Option<DataOutbound>,
    branch: Option<PartInfo>,
    flush_interval: Option<Duration>,
    sweep_interval: Duration,
    stats: RuntimeStats,
    state_tx: watch::Sender<RuntimeState>,
}

impl Worker {
    async fn run(mut self) {
        let _ = self.state_tx.send(RuntimeState::Running);

        let mut flush = tokio::time::interval(
            self.flush_interval.unwrap_or(Duration::from_secs(3600)),
        );
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        flush.reset(); // skip the immediate first tick
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        sweep.reset();

        loop {
            let frame = tokio::select! {
                request = self.control.recv() => {
                    match request {
                        Some(request) => {
                            if self.handle_control(request).await {
                                break;
                            }
                            continue;
                        }
                        None => {
                            // Control accept task died; without it the
                            // runtime can never be stopped cleanly.
                            error!(stage = %self.name, "control channel lost; terminating");
                            break;
                        }
                    }
                }
                body = recv_data(self.data_in.as_mut()) => {
                    match body {
                        Some(body) => body,
                        None => {
                            warn!(stage = %self.name, "data-in closed");
                            self.data_in = None;
                            continue;
                        }
                    }
                }
                _ = flush.tick(), if self.flush_interval.is_some() => {
                    if let Err(err) = self.stage.flush() {
                        warn!(stage = %self.name, error = %err, "flush failed");
                    }
                    continue;
                }
                _ = sweep.tick() => {
                    self.run_sweep().await;
                    continue;
                }
            };
            self.handle_frame(frame).await;
        }

        let _ = self.state_tx.send(RuntimeState::Terminating);
        // Dropping the sockets closes them and aborts their tasks.
        self.data_in = None;
        self.data_out = None;
        info!(stage = %self.name, "runtime closed");
        let _ = self.state_tx.send(RuntimeState::Closed);
    }

    /// Handles one control request. Returns true when the loop must exit.
    async fn handle_control(&mut self, request: ControlRequest) -> bool {
        match request.envelope.kind {
            EnvelopeKind::Terminate => {
                info!(stage = %self.name, "terminate acknowledged");
                let ack = request.envelope.reply(Payload::Empty);
                let written = request.respond(ack);
                // The ack must reach the wire before teardown closes the
                // control socket underneath it.
                let _ = tokio::time::timeout(Duration::from_secs(1), written).await;
                true
            }
            EnvelopeKind::Status => {
                let body = serde_json::to_string(&self.stats)
                    .unwrap_or_else(|_| "{}".to_string());
                let reply = request.envelope.reply(Payload::Json(body));
                let _ = request.respond(reply);
                false
            }
            other => {
                warn!(stage = %self.name, kind = ?other, "unexpected kind on control channel");
                let reply = request.envelope.reply(Payload::Empty);
                let _ = request.respond(reply);
                false
            }
        }
    }

    async fn handle_frame(&mut self, body: Bytes) {
        self.stats.received += 1;
        let mut env = match decode_envelope(&body) {
            Ok(env) => env,
            Err(err) => {
                self.stats.decode_errors += 1;
                warn!(stage = %self.name, error = %err, "undecodable frame dropped");
                return;
            }
        };
        if let Err(err) = env.validate() {
            self.stats.decode_errors += 1;
            warn!(stage = %self.name, error = %err, "invalid envelope dropped");
            return;
        }
        if let Some(level) = self.branch {
            if !env.kind.is_control() {
                env.push_parts(level.part_id, level.num_parts);
            }
        }

        // Kept for provenance in case the handler consumes the envelope
        // and then fails.
        let request_id = env.request_id;
        let route: Vec<String> = env.route.iter().map(|h| h.stage.clone()).collect();

        let outcome = match env.kind {
            EnvelopeKind::Request | EnvelopeKind::Response => self.stage.apply(env).await,
            EnvelopeKind::Train => {
                if self.stage.is_trainable() {
                    match self.stage.train(&env).await {
                        Ok(()) => Ok(StageOutput::Forward(env)),
                        Err(err) => Err(err),
                    }
                } else {
                    // Untrained stages pass training traffic along.
                    Ok(StageOutput::Forward(env))
                }
            }
            EnvelopeKind::Status | EnvelopeKind::Terminate => {
                warn!(stage = %self.name, kind = ?env.kind, "control kind on data plane dropped");
                Ok(StageOutput::Dropped)
            }
        };

        match outcome {
            Ok(StageOutput::Forward(env)) => self.forward(env).await,
            Ok(StageOutput::Fanout(envs)) => {
                for env in envs {
                    self.forward(env).await;
                }
            }
            Ok(StageOutput::Pending) => {}
            Ok(StageOutput::Dropped) => self.stats.dropped += 1,
            Err(err) => {
                self.stats.handler_errors += 1;
                error!(
                    stage = %self.name,
                    %request_id,
                    route = ?route,
                    error = %err,
                    "stage handler failed; envelope discarded"
                );
            }
        }
    }

    async fn forward(&mut self, mut env: Envelope) {
        env.record_hop(&self.name);
        match self.data_out.as_mut() {
            Some(out) => match out.send(&env).await {
                Ok(()) => self.stats.forwarded += 1,
                Err(err) => {
                    warn!(
                        stage = %self.name,
                        request_id = %env.request_id,
                        error = %err,
                        "forward failed"
                    );
                }
            },
            None => {
                debug!(stage = %self.name, "no data-out; envelope dropped at sink");
            }
        }
    }

    async fn run_sweep(&mut self) {
        let flushed = self.stage.sweep(Instant::now());
        for env in flushed {
            self.stats.swept += 1;
            self.forward(env).await;
        }
    }
}

/// Awaits the next data frame, or parks forever when there is no data-in.
async fn recv_data(data_in: Option<&mut DataInbound>) -> Option<Bytes> {
    match data_in {
        Some(socket) => socket.recv().await,
        None => std::future::pending().await,
    }
}
