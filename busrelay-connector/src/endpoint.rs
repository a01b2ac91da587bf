//! Local delivery endpoints
//!
//! Producers and consumers on this host reach the relay either through an
//! in-process queue ([`QueueEndpoint`]) or over a line-delimited TCP
//! socket ([`LineSocketServer`]). Inbound bus traffic fans out to socket
//! clients through [`SocketConsumer`].

use busrelay_core::Message;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::forwarder::{Consumer, RelayHandle};

/// In-process consumer handing deliveries to an application queue
pub struct QueueEndpoint {
    tx: mpsc::Sender<Message>,
}

impl QueueEndpoint {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl Consumer for QueueEndpoint {
    async fn process(&self, msg: Message) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| Error::Transport("Queue endpoint closed".to_string()))
    }
}

/// Consumer fanning deliveries out to connected socket clients.
///
/// With no client attached the delivery is refused, so the listener
/// requeues it on the bus instead of dropping it on the floor.
pub struct SocketConsumer {
    tx: broadcast::Sender<Message>,
}

impl SocketConsumer {
    pub fn new(tx: broadcast::Sender<Message>) -> Self {
        Self { tx }
    }
}

#[async_trait::async_trait]
impl Consumer for SocketConsumer {
    async fn process(&self, msg: Message) -> Result<()> {
        if self.tx.receiver_count() == 0 {
            return Err(Error::Transport("No socket clients attached".to_string()));
        }
        self.tx
            .send(msg)
            .map(|_| ())
            .map_err(|_| Error::Transport("No socket clients attached".to_string()))
    }
}

/// Line-delimited TCP endpoint: every inbound line becomes one relay
/// message, every delivery goes out as one line to each client.
pub struct LineSocketServer {
    listener: TcpListener,
    ingress: RelayHandle,
    egress: broadcast::Sender<Message>,
    cancel: CancellationToken,
}

impl LineSocketServer {
    pub async fn bind(
        addr: &str,
        ingress: RelayHandle,
        egress: broadcast::Sender<Message>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Transport(format!("Failed to bind {addr}: {e}")))?;
        Ok(Self {
            listener,
            ingress,
            egress,
            cancel,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| Error::Transport(format!("No local address: {e}")))
    }

    pub async fn run(self) {
        match self.listener.local_addr() {
            Ok(addr) => info!(%addr, "Socket endpoint listening"),
            Err(_) => info!("Socket endpoint listening"),
        }
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Socket client connected");
                        let ingress = self.ingress.clone();
                        let egress_rx = self.egress.subscribe();
                        let cancel = self.cancel.clone();
                        tokio::spawn(handle_client(stream, peer, ingress, egress_rx, cancel));
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
            }
        }
        debug!("Socket endpoint stopped");
    }
}

async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    ingress: RelayHandle,
    mut egress_rx: broadcast::Receiver<Message>,
    cancel: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    let mut lines_in = FramedRead::new(read_half, LinesCodec::new());
    let mut lines_out = FramedWrite::new(write_half, LinesCodec::new());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            line = lines_in.next() => match line {
                Some(Ok(line)) => {
                    if !line.is_empty() {
                        ingress.write(Message::new(line));
                    }
                }
                Some(Err(e)) => {
                    warn!(%peer, error = %e, "Socket read failed");
                    break;
                }
                None => break,
            },

            delivery = egress_rx.recv() => match delivery {
                Ok(msg) => {
                    if lines_out.send(msg.payload).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%peer, skipped, "Slow socket client, deliveries skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!(%peer, "Socket client disconnected");
}
