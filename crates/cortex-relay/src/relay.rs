//! # Broadcast Relay
//!
//! Fans every accepted sample out to all connected downstream consumers.
//!
//! The relay task owns the consumer set and is fed from two channels: a
//! command channel (consumer register/deregister from the accept loop) and
//! the sample channel filled by the session side. That hand-off is the
//! boundary between the acquisition context and the consumer-serving
//! context — the session loop never touches consumer state directly.
//!
//! Delivery rules:
//! - each packet is serialized once and offered to every consumer
//!   connected at the moment of acceptance,
//! - per-consumer delivery order matches acceptance order,
//! - a failed delivery removes only the failing consumer and never aborts
//!   delivery to the rest,
//! - consumers may attach at any time; they receive future samples only.

use std::collections::HashMap;

use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{WebSocketStream, accept_async};

use crate::protocol::frames::SamplePacket;

/// Identity of one downstream consumer connection.
pub type ConsumerId = u64;

/// Outbound half of a consumer connection. The seam between the relay's
/// fan-out logic and the concrete transport.
#[allow(async_fn_in_trait)]
pub trait ConsumerSink: Send {
    type Error: std::fmt::Display + Send;

    /// Deliver one serialized packet to this consumer.
    async fn send_text(&mut self, text: Utf8Bytes) -> Result<(), Self::Error>;
}

/// The set of currently connected consumers.
///
/// Add and remove are idempotent; no consumer is ever duplicated or
/// double-removed.
pub struct BroadcastRelay<S> {
    consumers: HashMap<ConsumerId, S>,
}

impl<S: ConsumerSink> BroadcastRelay<S> {
    pub fn new() -> Self {
        Self {
            consumers: HashMap::new(),
        }
    }

    /// Number of currently connected consumers.
    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Attach a consumer. Safe at any time, including before any sample
    /// has ever been accepted.
    pub fn add_consumer(&mut self, id: ConsumerId, sink: S) {
        self.consumers.insert(id, sink);
    }

    /// Detach a consumer. Returns whether it was still present.
    pub fn remove_consumer(&mut self, id: ConsumerId) -> bool {
        self.consumers.remove(&id).is_some()
    }

    /// Deliver one serialized packet to every consumer, pruning those
    /// whose delivery fails. Returns the number of successful deliveries.
    pub async fn broadcast(&mut self, text: &Utf8Bytes) -> usize {
        let mut failed = Vec::new();

        for (id, sink) in &mut self.consumers {
            if let Err(error) = sink.send_text(text.clone()).await {
                tracing::warn!(consumer = id, %error, "consumer delivery failed; dropping");
                failed.push(*id);
            }
        }

        for id in failed {
            self.consumers.remove(&id);
        }

        self.consumers.len()
    }
}

impl<S: ConsumerSink> Default for BroadcastRelay<S> {
    fn default() -> Self {
        Self::new()
    }
}

// ─── WebSocket consumer transport ───────────────────────────────────────

/// A consumer reached over a server-side WebSocket.
pub(crate) struct WsConsumer {
    sink: SplitSink<WebSocketStream<TcpStream>, Message>,
}

impl ConsumerSink for WsConsumer {
    type Error = tokio_tungstenite::tungstenite::Error;

    async fn send_text(&mut self, text: Utf8Bytes) -> Result<(), Self::Error> {
        self.sink.send(Message::Text(text)).await
    }
}

/// Consumer membership changes from the accept loop.
pub(crate) enum ConsumerCommand {
    Register { id: ConsumerId, sink: WsConsumer },
    Deregister { id: ConsumerId },
}

/// The broadcast loop: applies membership changes and fans out samples
/// until both input channels close.
pub(crate) async fn run_relay(
    mut commands: mpsc::Receiver<ConsumerCommand>,
    mut samples: mpsc::Receiver<SamplePacket>,
) {
    let mut relay: BroadcastRelay<WsConsumer> = BroadcastRelay::new();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ConsumerCommand::Register { id, sink }) => {
                    relay.add_consumer(id, sink);
                    tracing::debug!(consumer = id, consumers = relay.len(), "consumer registered");
                }
                Some(ConsumerCommand::Deregister { id }) => {
                    relay.remove_consumer(id);
                    tracing::debug!(consumer = id, consumers = relay.len(), "consumer deregistered");
                }
                None => break,
            },
            packet = samples.recv() => match packet {
                Some(packet) => match serde_json::to_string(&packet) {
                    Ok(json) => {
                        relay.broadcast(&Utf8Bytes::from(json)).await;
                    }
                    Err(error) => {
                        tracing::warn!(%error, "failed to serialize sample packet");
                    }
                },
                None => break,
            },
        }
    }

    tracing::debug!("broadcast relay loop exiting");
}

/// Accept downstream consumer connections and register them with the
/// relay. Each connection gets a drain task that watches for disconnect.
pub(crate) async fn accept_consumers(
    listener: TcpListener,
    commands: mpsc::Sender<ConsumerCommand>,
) {
    let mut next_id: ConsumerId = 0;

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(error) => {
                tracing::warn!(%error, "consumer accept failed");
                break;
            }
        };

        let ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(error) => {
                tracing::warn!(%error, "consumer handshake failed");
                continue;
            }
        };

        let id = next_id;
        next_id += 1;
        tracing::info!(consumer = id, %addr, "consumer connected");

        let (sink, mut source) = ws.split();
        if commands
            .send(ConsumerCommand::Register {
                id,
                sink: WsConsumer { sink },
            })
            .await
            .is_err()
        {
            break;
        }

        let commands = commands.clone();
        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            tracing::info!(consumer = id, "consumer disconnected");
            let _ = commands.send(ConsumerCommand::Deregister { id }).await;
        });
    }
}
