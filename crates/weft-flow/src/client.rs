//! The client-facing RPC boundary.
//!
//! A [`FrontendClient`] plays the compiled frontend node: it owns the
//! graph-entry outbound socket and the graph-exit inbound socket, plus a
//! pending map from request id to reply slot. Every logical request
//! becomes exactly one envelope entering the graph; replies are matched
//! by request id as they come back off the last stage.

use std::sync::Arc;
use std::time::Duration;

use fxhash::FxHashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};
use uuid::Uuid;

use weft_core::envelope::{decode_envelope, Envelope, Payload};
use weft_core::transport::{DataInbound, DataOutbound, FanMode, TransportConfig};

use crate::error::FlowError;
use crate::topology::{CompiledFlow, EndpointPlan};

enum Waiter {
    One(oneshot::Sender<Envelope>),
    Stream(mpsc::Sender<Envelope>),
}

type PendingMap = Arc<Mutex<FxHashMap<Uuid, Waiter>>>;

/// Client handle to a deployed flow.
pub struct FrontendClient {
    client_id: String,
    out: tokio::sync::Mutex<DataOutbound>,
    pending: PendingMap,
    pump: JoinHandle<()>,
    default_timeout: Duration,
}

impl FrontendClient {
    /// Wires the client into the compiled frontend endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::MissingFrontendEndpoints`] when the plan has
    /// no frontend node or its endpoints are unresolved, or the transport
    /// error of the initial socket setup.
    pub async fn connect(
        flow: &CompiledFlow,
        transport: &TransportConfig,
    ) -> Result<Self, FlowError> {
        let frontend = flow.frontend().ok_or(FlowError::MissingFrontendEndpoints)?;
        let out_plan = frontend
            .data_out
            .as_ref()
            .ok_or(FlowError::MissingFrontendEndpoints)?;
        let in_plan = frontend
            .data_in
            .as_ref()
            .ok_or(FlowError::MissingFrontendEndpoints)?;

        let host_addr = |port: u16| {
            flow.host_addr(port).map_err(|source| FlowError::BadHost {
                host: flow.host.clone(),
                source,
            })
        };

        let out = match out_plan {
            EndpointPlan::Bind {
                port,
                expected_peers,
                ..
            } => {
                DataOutbound::bind(
                    host_addr(*port)?,
                    FanMode::Single,
                    *expected_peers,
                    transport,
                )
                .await?
            }
            EndpointPlan::Connect { peers, .. } => {
                let &port = peers.first().ok_or(FlowError::MissingFrontendEndpoints)?;
                DataOutbound::connect(host_addr(port)?, transport)
            }
        };
        let inbound = match in_plan {
            EndpointPlan::Bind { port, .. } => {
                DataInbound::bind(host_addr(*port)?, transport).await?
            }
            EndpointPlan::Connect { peers, .. } => {
                let peers = peers
                    .iter()
                    .map(|&p| host_addr(p))
                    .collect::<Result<Vec<_>, _>>()?;
                DataInbound::connect(&peers, transport)
            }
        };

        let pending: PendingMap = Arc::new(Mutex::new(FxHashMap::default()));
        let pump = tokio::spawn(pump_replies(inbound, Arc::clone(&pending)));

        Ok(Self {
            client_id: format!("client-{}", Uuid::new_v4()),
            out: tokio::sync::Mutex::new(out),
            pending,
            pump,
            default_timeout: Duration::from_secs(30),
        })
    }

    /// One request in, one response out: sends the payload as a single
    /// envelope and returns the reply payload, envelope stripped.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::RequestTimeout`] when no reply arrives before
    /// the envelope's deadline, or the underlying transport error.
    pub async fn call(&self, payload: Payload) -> Result<Payload, FlowError> {
        self.call_envelope(Envelope::request(&self.client_id, payload))
            .await
            .map(|env| env.payload)
    }

    /// Like [`call`](Self::call), but returns the full reply envelope
    /// with its route trace.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn call_envelope(&self, env: Envelope) -> Result<Envelope, FlowError> {
        let request_id = env.request_id;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, Waiter::One(tx));

        if let Err(err) = self.out.lock().await.send(&env).await {
            self.pending.lock().remove(&request_id);
            return Err(err.into());
        }

        let deadline = if env.timeout.is_zero() {
            self.default_timeout
        } else {
            env.timeout
        };
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(FlowError::ReplyChannelClosed(request_id)),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(FlowError::RequestTimeout(request_id))
            }
        }
    }

    /// Streaming call: every payload becomes one request envelope; the
    /// returned stream yields the reply envelopes in arrival order.
    ///
    /// # Errors
    ///
    /// Returns the transport error of any send; requests already sent
    /// keep their reply slots until the stream is dropped.
    pub async fn stream(
        &self,
        payloads: Vec<Payload>,
    ) -> Result<impl Stream<Item = Envelope> + Unpin, FlowError> {
        let count = payloads.len();
        let (tx, rx) = mpsc::channel(count.max(1));
        for payload in payloads {
            let env = Envelope::request(&self.client_id, payload);
            self.pending
                .lock()
                .insert(env.request_id, Waiter::Stream(tx.clone()));
            if let Err(err) = self.out.lock().await.send(&env).await {
                self.pending.lock().remove(&env.request_id);
                return Err(err.into());
            }
        }
        drop(tx);
        Ok(ReceiverStream::new(rx).take(count))
    }
}

impl Drop for FrontendClient {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump_replies(mut inbound: DataInbound, pending: PendingMap) {
    while let Some(body) = inbound.recv().await {
        let env = match decode_envelope(&body) {
            Ok(env) => env,
            Err(err) => {
                warn!(error = %err, "undecodable reply dropped");
                continue;
            }
        };
        let waiter = pending.lock().remove(&env.request_id);
        match waiter {
            Some(Waiter::One(tx)) => {
                let _ = tx.send(env);
            }
            Some(Waiter::Stream(tx)) => {
                let _ = tx.send(env).await;
            }
            None => {
                debug!(request_id = %env.request_id, "late or unmatched reply dropped");
            }
        }
    }
}
