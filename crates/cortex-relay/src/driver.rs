//! # Reconnect Driver
//!
//! Owns the physical control connection. An infinite loop opens a fresh
//! WebSocket to the Cortex service, hands it to the session negotiator,
//! and runs the connection event loop until the socket closes — by error,
//! by remote close, or by a hard reset's explicit close. Then it waits a
//! fixed interval and rebuilds everything.
//!
//! The driver never resets session fields itself; the negotiator clears
//! negotiated state whenever a new connection is bound, and a hard reset
//! clears the rest. Opening the connection, pumping it, and closing it is
//! all this module does on the control side.
//!
//! The consumer-facing broadcast server and the relay loop are spawned
//! once at startup and run for the process lifetime, independent of any
//! control connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use native_tls::TlsConnector as NativeTlsConnector;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config,
    tungstenite::{Message, http},
};

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::events::{EventBus, LifecycleEvent};
use crate::relay;
use crate::session::{SessionNegotiator, TimerFired};
use crate::signal::{Passthrough, SignalConditioner};

/// Connection timeout for the control WebSocket handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Buffer for the sample hand-off into the broadcast loop.
const SAMPLE_CHANNEL_BUFFER: usize = 256;

type ControlStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The resilient acquisition service: reconnect driver, session
/// negotiator, liveness watchdogs, and broadcast relay wired together.
///
/// ```no_run
/// use cortex_relay::{CortexRelay, RelayConfig};
///
/// # async fn demo() -> cortex_relay::RelayResult<()> {
/// let config = RelayConfig::discover(None)?;
/// let mut relay = CortexRelay::new(config);
/// let addr = relay.bind().await?;
/// tracing::info!(%addr, "consumers can connect now");
/// relay.run().await
/// # }
/// ```
pub struct CortexRelay {
    config: RelayConfig,
    events: EventBus,
    conditioner: Arc<dyn SignalConditioner>,
    listener: Option<TcpListener>,
}

impl CortexRelay {
    /// Build the service. Samples pass through unconditioned unless
    /// `signal.apply_filtering` is set and a conditioner is attached.
    pub fn new(config: RelayConfig) -> Self {
        let events = EventBus::new(config.emit_event_lines);
        Self {
            config,
            events,
            conditioner: Arc::new(Passthrough),
            listener: None,
        }
    }

    /// Attach the signal conditioner applied to each sample vector when
    /// `signal.apply_filtering` is enabled.
    #[must_use]
    pub fn with_conditioner(mut self, conditioner: Arc<dyn SignalConditioner>) -> Self {
        self.conditioner = conditioner;
        self
    }

    /// Subscribe to lifecycle events emitted after this call.
    pub fn event_receiver(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Bind the consumer-facing broadcast server ahead of [`run`](Self::run),
    /// returning the bound address. Useful with a `:0` port.
    pub async fn bind(&mut self) -> RelayResult<SocketAddr> {
        let listener = TcpListener::bind(&self.config.broadcast.bind_addr).await?;
        let addr = listener.local_addr()?;
        self.listener = Some(listener);
        Ok(addr)
    }

    /// Run the service until the process ends: start the broadcast server
    /// and relay loop, then drive the control connection forever, waiting
    /// a fixed interval between rebuild attempts.
    pub async fn run(mut self) -> RelayResult<()> {
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => TcpListener::bind(&self.config.broadcast.bind_addr).await?,
        };
        let addr = listener.local_addr()?;
        tracing::info!(%addr, "broadcast server listening");

        let (consumer_tx, consumer_rx) = mpsc::channel(16);
        let (sample_tx, sample_rx) = mpsc::channel(SAMPLE_CHANNEL_BUFFER);
        tokio::spawn(relay::run_relay(consumer_rx, sample_rx));
        tokio::spawn(relay::accept_consumers(listener, consumer_tx));
        self.events.emit(LifecycleEvent::ServerReady);

        let (timer_tx, mut timer_rx) = mpsc::channel(8);
        let mut negotiator = SessionNegotiator::new(
            &self.config,
            sample_tx,
            self.events.clone(),
            timer_tx,
            Arc::clone(&self.conditioner),
        );

        let retry_interval = Duration::from_millis(self.config.reconnect.retry_interval_ms);
        let watchdog_tick = Duration::from_millis(self.config.liveness.watchdog_tick_ms);

        loop {
            match connect_control(&self.config).await {
                Ok(ws) => {
                    self.drive_connection(ws, &mut negotiator, &mut timer_rx, watchdog_tick)
                        .await;
                    tracing::info!("control connection ended; rebuilding");
                }
                Err(error) => {
                    tracing::warn!(%error, "control connection attempt failed");
                    self.events.emit(LifecycleEvent::Error {
                        message: error.to_string(),
                    });
                }
            }
            tokio::time::sleep(retry_interval).await;
        }
    }

    /// Pump one control connection: outgoing requests, inbound messages,
    /// timer fires, and watchdog ticks, until the socket dies or a
    /// handler requests teardown.
    async fn drive_connection(
        &self,
        ws: ControlStream,
        negotiator: &mut SessionNegotiator,
        timer_rx: &mut mpsc::Receiver<TimerFired>,
        watchdog_tick: Duration,
    ) {
        let (mut writer, mut reader) = ws.split();

        // Timer fires queued against the previous connection are stale.
        while timer_rx.try_recv().is_ok() {}

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        negotiator.begin_connection(out_tx);

        let mut watchdog = tokio::time::interval(watchdog_tick);

        loop {
            tokio::select! {
                request = out_rx.recv() => {
                    let Some(request) = request else { break };
                    let text = match serde_json::to_string(&request) {
                        Ok(text) => text,
                        Err(error) => {
                            tracing::warn!(%error, "failed to serialize control request");
                            continue;
                        }
                    };
                    tracing::debug!(request = ?request.id, "sending control request");
                    if let Err(error) = writer.send(Message::Text(text.into())).await {
                        tracing::warn!(%error, "control send failed");
                        self.events.emit(LifecycleEvent::Error {
                            message: error.to_string(),
                        });
                        break;
                    }
                }
                message = reader.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        negotiator.handle_inbound(text.as_str()).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!("control connection closed by peer");
                        break;
                    }
                    Some(Ok(_)) => {} // binary, ping, pong
                    Some(Err(error)) => {
                        tracing::warn!(%error, "control read error");
                        self.events.emit(LifecycleEvent::Error {
                            message: error.to_string(),
                        });
                        break;
                    }
                    None => {
                        tracing::info!("control stream ended");
                        break;
                    }
                },
                fired = timer_rx.recv() => {
                    let Some(fired) = fired else { break };
                    negotiator.handle_timer(fired);
                }
                _ = watchdog.tick() => negotiator.check_stream_silence(),
            }

            if negotiator.close_requested() {
                let _ = writer.close().await;
                break;
            }
        }

        negotiator.end_connection();
    }
}

/// Open the control WebSocket, accepting the service's self-signed
/// certificate for localhost per the config.
async fn connect_control(config: &RelayConfig) -> RelayResult<ControlStream> {
    let url = &config.cortex_url;

    let tls_connector = NativeTlsConnector::builder()
        .danger_accept_invalid_certs(config.should_accept_invalid_certs())
        .build()
        .map_err(|e| RelayError::ConnectionFailed {
            url: url.clone(),
            reason: format!("TLS configuration failed: {e}"),
        })?;
    let connector = Connector::NativeTls(tls_connector);

    let uri: http::Uri = url
        .parse()
        .map_err(|e: http::uri::InvalidUri| RelayError::ConnectionFailed {
            url: url.clone(),
            reason: format!("invalid URL: {e}"),
        })?;

    let connect_fut = connect_async_tls_with_config(
        uri,
        None, // WebSocket config
        true, // disable_nagle
        Some(connector),
    );

    let (ws, response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_fut)
        .await
        .map_err(|_| RelayError::Timeout {
            seconds: CONNECT_TIMEOUT.as_secs(),
        })?
        .map_err(|e| RelayError::ConnectionFailed {
            url: url.clone(),
            reason: format!("WebSocket connection failed: {e}"),
        })?;

    tracing::info!(url, status = %response.status(), "connected to Cortex control service");
    Ok(ws)
}
