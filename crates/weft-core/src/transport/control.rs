//! Control pair socket.
//!
//! Every runtime binds its own control endpoint locally, independent of
//! the data-plane pattern. The protocol is strict request/ack: one
//! `Terminate` or `Status` envelope in, one reply envelope out, on the
//! same connection.

use std::net::SocketAddr;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::envelope::{decode_envelope, encode_envelope, Envelope, EnvelopeKind};

use super::frame::{read_frame, write_frame};
use super::retry::connect_with_retry;
use super::{TransportConfig, TransportError};

/// One pending control exchange: the decoded envelope plus the slot for
/// the reply frame.
pub struct ControlRequest {
    /// The control envelope as received.
    pub envelope: Envelope,
    reply_tx: oneshot::Sender<(Envelope, oneshot::Sender<()>)>,
}

impl ControlRequest {
    /// Sends the reply back over the originating connection.
    ///
    /// The returned receiver resolves once the reply frame has been
    /// written to the socket; a terminating runtime awaits it so the ack
    /// cannot be lost to its own teardown.
    pub fn respond(self, reply: Envelope) -> oneshot::Receiver<()> {
        let (written_tx, written_rx) = oneshot::channel();
        let _ = self.reply_tx.send((reply, written_tx));
        written_rx
    }
}

/// The bound (controlled) end of a control pair.
pub struct ControlChannel {
    rx: mpsc::Receiver<ControlRequest>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl ControlChannel {
    /// Binds the control endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] when the listener cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = listener.local_addr().map_err(TransportError::Io)?;
        let (tx, rx) = mpsc::channel(16);
        let max = config.max_frame_bytes;
        let accept_task = tokio::spawn(async move {
            let mut conns = JoinSet::new();
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        conns.spawn(serve_control_conn(stream, peer, tx.clone(), max));
                    }
                    Err(err) => {
                        warn!(error = %err, "control accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                }
            }
        });
        Ok(Self {
            rx,
            local_addr,
            accept_task,
        })
    }

    /// Receives the next control request.
    pub async fn recv(&mut self) -> Option<ControlRequest> {
        self.rx.recv().await
    }

    /// The bound control address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_control_conn(
    stream: TcpStream,
    peer: SocketAddr,
    tx: mpsc::Sender<ControlRequest>,
    max_frame_bytes: usize,
) {
    let _ = stream.set_nodelay(true);
    let (mut read, mut write) = stream.into_split();
    loop {
        let envelope = match read_control_frame(&mut read, max_frame_bytes).await {
            Some(env) => env,
            None => return,
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if tx
            .send(ControlRequest { envelope, reply_tx })
            .await
            .is_err()
        {
            return; // runtime gone
        }
        let Ok((reply, written_tx)) = reply_rx.await else {
            // The loop terminated without replying (it only does so on
            // its way out); drop the connection.
            return;
        };
        if let Err(err) = write_reply(&mut write, &reply, max_frame_bytes).await {
            debug!(%peer, error = %err, "control reply failed");
            return;
        }
        let _ = written_tx.send(());
    }
}

async fn read_control_frame(
    read: &mut OwnedReadHalf,
    max_frame_bytes: usize,
) -> Option<Envelope> {
    match read_frame(read, max_frame_bytes).await {
        Ok(body) => match decode_envelope(&body) {
            Ok(env) => Some(env),
            Err(err) => {
                warn!(error = %err, "undecodable control frame dropped");
                None
            }
        },
        Err(_) => None,
    }
}

async fn write_reply(
    write: &mut OwnedWriteHalf,
    reply: &Envelope,
    max_frame_bytes: usize,
) -> Result<(), TransportError> {
    let body = encode_envelope(reply)?;
    write_frame(write, &body, max_frame_bytes).await
}

/// The controlling end of a control pair.
pub struct ControlClient {
    read: OwnedReadHalf,
    write: OwnedWriteHalf,
    config: TransportConfig,
}

impl ControlClient {
    /// Connects to a runtime's control endpoint, with retry.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] once the retry budget is spent.
    pub async fn connect(
        addr: SocketAddr,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        let stream = connect_with_retry(addr, &config.retry).await?;
        let (read, write) = stream.into_split();
        Ok(Self {
            read,
            write,
            config: config.clone(),
        })
    }

    /// Sends one control envelope and awaits its reply, bounded by the
    /// envelope's timeout.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Timeout`] when the reply does not arrive
    /// in time, or the underlying io/codec error.
    pub async fn request(&mut self, env: &Envelope) -> Result<Envelope, TransportError> {
        let body = encode_envelope(env)?;
        write_frame(&mut self.write, &body, self.config.max_frame_bytes).await?;
        let deadline = env.timeout;
        let reply = if deadline.is_zero() {
            read_frame(&mut self.read, self.config.max_frame_bytes).await?
        } else {
            tokio::time::timeout(
                deadline,
                read_frame(&mut self.read, self.config.max_frame_bytes),
            )
            .await
            .map_err(|_| TransportError::Timeout { after: deadline })??
        };
        Ok(decode_envelope(&reply)?)
    }

    /// Sends `Terminate` and awaits the acknowledgement.
    ///
    /// # Errors
    ///
    /// Propagates the transport error of the exchange.
    pub async fn terminate(&mut self) -> Result<Envelope, TransportError> {
        self.request(&Envelope::control(EnvelopeKind::Terminate)).await
    }

    /// Sends `Status` and awaits the statistics snapshot.
    ///
    /// # Errors
    ///
    /// Propagates the transport error of the exchange.
    pub async fn status(&mut self) -> Result<Envelope, TransportError> {
        self.request(&Envelope::control(EnvelopeKind::Status)).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_addr;
    use super::*;
    use crate::envelope::Payload;

    #[tokio::test]
    async fn test_control_request_ack() {
        let cfg = TransportConfig::default();
        let addr = test_addr();
        let mut channel = ControlChannel::bind(addr, &cfg).await.unwrap();
        let server = tokio::spawn(async move {
            let req = channel.recv().await.expect("request");
            assert_eq!(req.envelope.kind, EnvelopeKind::Status);
            let reply = req.envelope.reply(Payload::Json("{\"ok\":true}".to_string()));
            let _ = req.respond(reply);
        });
        let mut client = ControlClient::connect(addr, &cfg).await.unwrap();
        let reply = client.status().await.unwrap();
        assert_eq!(reply.kind, EnvelopeKind::Response);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_round_trip() {
        let cfg = TransportConfig::default();
        let addr = test_addr();
        let mut channel = ControlChannel::bind(addr, &cfg).await.unwrap();
        let server = tokio::spawn(async move {
            let req = channel.recv().await.expect("request");
            assert_eq!(req.envelope.kind, EnvelopeKind::Terminate);
            let reply = req.envelope.reply(Payload::Empty);
            let _ = req.respond(reply);
        });
        let mut client = ControlClient::connect(addr, &cfg).await.unwrap();
        let ack = client.terminate().await.unwrap();
        assert_eq!(ack.payload, Payload::Empty);
        server.await.unwrap();
    }
}
