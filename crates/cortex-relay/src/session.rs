//! # Session State Machine
//!
//! Owns one control connection's lifecycle: access, authorization, headset
//! discovery, connect, session create/reuse, and stream subscription. The
//! negotiator consumes classified inbound messages, emits outgoing
//! requests, and reports lifecycle events.
//!
//! ## Recovery layers
//!
//! 1. **Distinguished error codes** each route to a specific action:
//!    `-32005` reuses the existing session via `querySessions`, `-32004`
//!    re-enters headset discovery, `-32007` forces a hard reset. All other
//!    codes fall back to a throttled headset re-query.
//! 2. **Subscribe guard** — armed after every subscribe ack; if no sample
//!    arrives within the grace period it re-issues the subscribe up to a
//!    bounded number of attempts, then performs a hard reset.
//! 3. **Stream watchdog** — ticks continuously; prolonged silence flags the
//!    headset disconnected (exactly once per silence episode), clears the
//!    negotiated identifiers, and re-enters discovery.
//!
//! A hard reset cancels all timers, clears the [`Session`], and requests a
//! connection close. The close is the reconnect driver's only signal to
//! rebuild the transport; the negotiator itself never reconnects.
//!
//! ## Execution model
//!
//! The negotiator is driven by a single task (the connection event loop in
//! [`driver`](crate::driver)): one handler runs at a time, so response
//! handling always observes the `Session` exactly as the previous handler
//! left it, and a watchdog firing can never overlap an in-flight reset.
//! Timers are single-slot — arming one cancels its predecessor, and
//! cancelling an absent or already-fired timer is a no-op.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::events::{EventBus, LifecycleEvent};
use crate::protocol::Streams;
use crate::protocol::frames::{
    ChannelSelection, DataFrame, DevFrame, EegFrame, EqFrame, MetadataBlob, SamplePacket,
};
use crate::protocol::rpc::{Inbound, RequestId, RpcError, RpcRequest, RpcResponse, classify};
use crate::signal::SignalConditioner;

/// Negotiation states, in protocol order. `Streaming` is the only state in
/// which inbound sample frames are accepted into the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    AwaitingAccess,
    AwaitingAuthorization,
    AwaitingHeadsetDiscovery,
    AwaitingHeadsetConnect,
    AwaitingSessionCreateOrReuse,
    AwaitingSubscribeAck,
    Streaming,
}

/// The negotiated control-session state. Owned exclusively by the
/// [`SessionNegotiator`]; mutated only by its handlers.
///
/// Invariant: `subscribed` implies `auth_token` and `session_id` are
/// present. `resubscribe_attempts` resets to 0 on every accepted sample.
#[derive(Debug, Clone, Default)]
pub struct Session {
    /// Access has been granted (or assumed granted) for this process.
    pub access_granted: bool,
    /// Cortex token from `authorize`.
    pub auth_token: Option<String>,
    /// Discovered headset id.
    pub headset_id: Option<String>,
    /// Active or reused session id.
    pub session_id: Option<String>,
    /// A subscribe has been acknowledged for the current session.
    pub subscribed: bool,
    /// When the last sample frame was accepted.
    pub last_sample_at: Option<Instant>,
    /// Consecutive silent subscribe-guard fires.
    pub resubscribe_attempts: u32,
    /// Set by the stream watchdog when the data stream goes silent;
    /// cleared by every accepted sample.
    pub disconnected: bool,
}

impl Session {
    /// Clear everything negotiated on the wire, keeping the access flag.
    /// Run whenever a fresh control connection is opened.
    fn clear_negotiated(&mut self) {
        self.auth_token = None;
        self.headset_id = None;
        self.session_id = None;
        self.subscribed = false;
        self.last_sample_at = None;
        self.resubscribe_attempts = 0;
        self.disconnected = true;
    }

    /// Clear the whole session, access flag included. Run on hard reset,
    /// after which negotiation restarts from the access request.
    fn clear(&mut self) {
        self.clear_negotiated();
        self.access_granted = false;
    }
}

/// Internal timer fire notifications delivered to the connection loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerFired {
    /// The throttled retry slot fired.
    Retry(RetryKind),
    /// The post-subscribe guard fired.
    SubscribeGuard,
}

/// What the retry slot does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryKind {
    /// Re-run the entry sequence (access once, then authorize).
    Authorize,
    /// Re-query available headsets.
    HeadsetQuery,
}

/// The session state machine.
///
/// Inputs arrive through [`handle_inbound`](Self::handle_inbound),
/// [`handle_timer`](Self::handle_timer), and
/// [`check_stream_silence`](Self::check_stream_silence); outputs leave as
/// [`RpcRequest`]s on the bound transport channel, [`SamplePacket`]s on the
/// relay channel, and [`LifecycleEvent`]s on the event bus.
pub struct SessionNegotiator {
    client_id: String,
    client_secret: String,

    subscribe_grace: Duration,
    silence_timeout: Duration,
    max_resubscribe_attempts: u32,
    retry_interval: Duration,

    selection: ChannelSelection,
    sampling_rate_hz: f64,
    apply_filtering: bool,
    conditioner: Arc<dyn SignalConditioner>,

    session: Session,
    phase: SessionPhase,
    latest_device_data: Option<MetadataBlob>,
    latest_quality_data: Option<MetadataBlob>,

    outbound: Option<mpsc::UnboundedSender<RpcRequest>>,
    samples: mpsc::Sender<SamplePacket>,
    events: EventBus,
    timer_tx: mpsc::Sender<TimerFired>,

    retry_timer: Option<AbortHandle>,
    guard_timer: Option<AbortHandle>,

    close_requested: bool,
}

impl SessionNegotiator {
    /// Build a negotiator with no transport bound yet. The driver binds a
    /// fresh transport each time it opens a control connection.
    pub fn new(
        config: &RelayConfig,
        samples: mpsc::Sender<SamplePacket>,
        events: EventBus,
        timer_tx: mpsc::Sender<TimerFired>,
        conditioner: Arc<dyn SignalConditioner>,
    ) -> Self {
        Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            subscribe_grace: Duration::from_millis(config.liveness.subscribe_grace_ms),
            silence_timeout: Duration::from_millis(config.liveness.silence_timeout_ms),
            max_resubscribe_attempts: config.liveness.max_resubscribe_attempts,
            retry_interval: Duration::from_millis(config.reconnect.retry_interval_ms),
            selection: config.signal.channel_selection,
            sampling_rate_hz: config.signal.sampling_rate_hz,
            apply_filtering: config.signal.apply_filtering,
            conditioner,
            session: Session::default(),
            phase: SessionPhase::Idle,
            latest_device_data: None,
            latest_quality_data: None,
            outbound: None,
            samples,
            events,
            timer_tx,
            retry_timer: None,
            guard_timer: None,
            close_requested: false,
        }
    }

    /// Current negotiation phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Read-only view of the session state.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Whether a handler asked for the control connection to be torn down.
    pub fn close_requested(&self) -> bool {
        self.close_requested
    }

    // ─── Connection lifecycle ───────────────────────────────────────────

    /// Bind a fresh transport and start negotiating. Clears everything
    /// negotiated on the previous connection; the access flag survives, so
    /// the first connection sends `requestAccess` and every later one
    /// skips straight to `authorize`.
    pub fn begin_connection(&mut self, outbound: mpsc::UnboundedSender<RpcRequest>) {
        self.cancel_retry_timer();
        self.cancel_guard_timer();
        self.outbound = Some(outbound);
        self.close_requested = false;
        self.session.clear_negotiated();
        self.phase = SessionPhase::Idle;
        self.run_sequence();
    }

    /// Unbind the transport after the connection loop exits, cancelling
    /// any timers still scheduled against it.
    pub fn end_connection(&mut self) {
        self.cancel_retry_timer();
        self.cancel_guard_timer();
        self.outbound = None;
    }

    /// Full teardown: cancel all timers, clear the session (access flag
    /// included), and request the connection close that makes the driver
    /// rebuild everything. Safe to invoke any number of times.
    pub fn hard_reset(&mut self, reason: &str) {
        tracing::warn!(reason, "performing full session reset");
        self.cancel_retry_timer();
        self.cancel_guard_timer();
        self.session.clear();
        self.phase = SessionPhase::Idle;
        self.close_requested = true;
    }

    // ─── Inbound dispatch ───────────────────────────────────────────────

    /// Route one raw control-channel message. Malformed or unroutable
    /// messages are logged and discarded without a state transition.
    pub async fn handle_inbound(&mut self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(%error, "discarding unparseable control message");
                return;
            }
        };

        match classify(value) {
            Inbound::Response(response) => self.handle_response(&response),
            Inbound::Frame(frame) => self.handle_frame(frame).await,
            Inbound::Unroutable(value) => {
                tracing::warn!(message = %value, "discarding unroutable control message");
            }
        }
    }

    fn handle_response(&mut self, response: &RpcResponse) {
        let Some(raw_id) = response.id else {
            tracing::warn!("discarding response without id");
            return;
        };
        let Some(id) = RequestId::from_wire(raw_id) else {
            tracing::debug!(id = raw_id, "response for unknown request id");
            return;
        };

        if let Some(error) = &response.error {
            self.handle_error_response(id, error);
            return;
        }

        let null = Value::Null;
        let result = response.result.as_ref().unwrap_or(&null);
        match id {
            RequestId::AccessRequest => self.on_access_result(result),
            RequestId::Authorize => self.on_authorize_result(result),
            RequestId::QueryHeadsets => self.on_headsets_result(result),
            RequestId::ConnectHeadset => self.on_headset_connected(),
            RequestId::CreateSession => self.on_session_created(result),
            RequestId::Subscribe => self.on_subscribe_ack(result),
            RequestId::QuerySessions => self.on_sessions_result(result),
        }
    }

    fn handle_error_response(&mut self, id: RequestId, error: &RpcError) {
        tracing::warn!(
            request = ?id,
            code = error.code,
            message = %error.message,
            "control request failed",
        );
        let error = RelayError::from_api_error(error.code, error.message.clone());

        match id {
            RequestId::AccessRequest => {
                // An access error usually means the app is already
                // registered; assume so and move on to authorize.
                self.session.access_granted = true;
                if matches!(error, RelayError::InvalidCredentials { .. }) {
                    self.events.emit(LifecycleEvent::CredentialsInvalid);
                }
                self.authorize();
            }
            RequestId::Authorize => self.schedule_authorize_retry(),
            RequestId::CreateSession => match error {
                RelayError::SessionAlreadyExists { .. } => {
                    tracing::info!("session already exists; querying sessions to reuse");
                    self.query_sessions();
                }
                _ => self.schedule_headset_requery(),
            },
            RequestId::Subscribe => match error {
                RelayError::SessionNotFound { .. } => {
                    self.hard_reset("subscribe rejected: session does not exist");
                }
                _ => self.schedule_headset_requery(),
            },
            RequestId::QuerySessions => {
                // No session list to work with — fall back to creating one.
                self.create_session();
            }
            RequestId::QueryHeadsets | RequestId::ConnectHeadset => {
                self.schedule_headset_requery();
            }
        }
    }

    // ─── Success handlers ───────────────────────────────────────────────

    fn on_access_result(&mut self, result: &Value) {
        let granted = result
            .get("accessGranted")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if granted {
            self.session.access_granted = true;
            tracing::info!("access granted; proceeding to authorize");
            self.events.emit(LifecycleEvent::CredentialsValid);
            self.authorize();
        } else {
            tracing::warn!("access not granted yet; will retry");
            self.schedule_authorize_retry();
        }
    }

    fn on_authorize_result(&mut self, result: &Value) {
        match result.get("cortexToken").and_then(Value::as_str) {
            Some(token) => {
                self.session.auth_token = Some(token.to_string());
                tracing::info!("authenticated; token received");
                self.query_headsets();
            }
            None => {
                tracing::warn!("authorize response missing token; will retry");
                self.schedule_authorize_retry();
            }
        }
    }

    fn on_headsets_result(&mut self, result: &Value) {
        let Some(headsets) = result.as_array() else {
            tracing::warn!("malformed headset list; re-querying");
            self.schedule_headset_requery();
            return;
        };

        match headsets
            .first()
            .and_then(|h| h.get("id"))
            .and_then(Value::as_str)
        {
            Some(id) => {
                tracing::info!(headset = id, "headset found");
                self.session.headset_id = Some(id.to_string());
                self.connect_headset();
            }
            None => {
                tracing::warn!("no headset found; continuing to poll");
                self.schedule_headset_requery();
            }
        }
    }

    fn on_headset_connected(&mut self) {
        tracing::info!("headset connected");
        self.events.emit(LifecycleEvent::HeadsetConnected);
        self.create_session();
    }

    fn on_session_created(&mut self, result: &Value) {
        match result.get("id").and_then(Value::as_str) {
            Some(id) => {
                let session_id = id.to_string();
                tracing::info!(session_id = %session_id, "session created");
                self.session.session_id = Some(session_id.clone());
                self.events
                    .emit(LifecycleEvent::SessionCreated { session_id });
                self.subscribe();
            }
            None => {
                tracing::warn!("createSession response missing session id");
                self.schedule_headset_requery();
            }
        }
    }

    fn on_sessions_result(&mut self, result: &Value) {
        let sessions = result.as_array().cloned().unwrap_or_default();
        let chosen = choose_session(&sessions, self.session.headset_id.as_deref())
            .and_then(|s| s.get("id").and_then(Value::as_str))
            .map(String::from);

        match chosen {
            Some(session_id) => {
                tracing::info!(session_id = %session_id, "reusing existing session");
                self.session.session_id = Some(session_id.clone());
                self.events
                    .emit(LifecycleEvent::SessionReused { session_id });
                self.subscribe();
            }
            None => {
                tracing::warn!("no reusable session found; creating a new one");
                self.create_session();
            }
        }
    }

    fn on_subscribe_ack(&mut self, result: &Value) {
        if result.is_null() {
            tracing::warn!("subscribe ack without result; re-entering discovery");
            self.schedule_headset_requery();
            return;
        }
        if self.session.auth_token.is_none() || self.session.session_id.is_none() {
            // The session was torn down while the ack was in flight.
            tracing::debug!("subscribe ack after session teardown; ignoring");
            return;
        }

        self.session.subscribed = true;
        let streams = ack_stream_names(result);
        tracing::info!(streams = ?streams, "subscription confirmed");
        self.events
            .emit(LifecycleEvent::SubscriptionConfirmed { streams });
        self.phase = SessionPhase::Streaming;
        self.arm_subscribe_guard();
    }

    // ─── Data frames ────────────────────────────────────────────────────

    async fn handle_frame(&mut self, frame: DataFrame) {
        match frame {
            DataFrame::Eeg(frame) => self.accept_sample(frame).await,
            DataFrame::Dev(DevFrame { time, dev }) => {
                self.latest_device_data = Some(MetadataBlob {
                    timestamp: time,
                    data: dev,
                });
            }
            DataFrame::Eq(EqFrame { time, eq }) => {
                self.latest_quality_data = Some(MetadataBlob {
                    timestamp: time,
                    data: eq,
                });
            }
        }
    }

    async fn accept_sample(&mut self, frame: EegFrame) {
        if self.phase != SessionPhase::Streaming {
            tracing::debug!(phase = ?self.phase, "sample frame outside streaming state; dropped");
            return;
        }

        self.session.last_sample_at = Some(Instant::now());
        self.session.disconnected = false;
        self.session.resubscribe_attempts = 0;
        if self.session.auth_token.is_some() && self.session.session_id.is_some() {
            self.session.subscribed = true;
        }

        let Some((raw_values, channel_names)) = self.selection.extract(&frame.eeg) else {
            tracing::warn!("no usable channel values in sample frame");
            return;
        };

        let values = if self.apply_filtering {
            self.conditioner
                .condition(&raw_values, self.sampling_rate_hz)
        } else {
            raw_values
        };

        let packet = SamplePacket {
            time: frame.time,
            values,
            device_data: self.latest_device_data.clone(),
            quality_data: self.latest_quality_data.clone(),
            channel_names,
        };

        if self.samples.send(packet).await.is_err() {
            tracing::debug!("relay channel closed; sample dropped");
        }
    }

    // ─── Timers ─────────────────────────────────────────────────────────

    /// Dispatch a timer fire from the connection loop.
    pub fn handle_timer(&mut self, fired: TimerFired) {
        match fired {
            TimerFired::Retry(RetryKind::Authorize) => {
                self.retry_timer = None;
                self.run_sequence();
            }
            TimerFired::Retry(RetryKind::HeadsetQuery) => {
                self.retry_timer = None;
                self.query_headsets();
            }
            TimerFired::SubscribeGuard => {
                self.guard_timer = None;
                self.on_subscribe_guard();
            }
        }
    }

    /// Stream watchdog body, invoked on every tick for the process
    /// lifetime. Silence past the threshold flags the headset gone exactly
    /// once per episode and re-enters discovery.
    pub fn check_stream_silence(&mut self) {
        let Some(last) = self.session.last_sample_at else {
            return;
        };
        let silence = last.elapsed();
        if silence <= self.silence_timeout || self.session.disconnected {
            return;
        }

        tracing::warn!(
            silence_ms = silence.as_millis() as u64,
            "no samples received; headset presumed disconnected",
        );
        self.session.disconnected = true;
        self.events.emit(LifecycleEvent::HeadsetDisconnected);
        self.session.session_id = None;
        self.session.headset_id = None;
        self.session.subscribed = false;
        self.schedule_headset_requery();
    }

    fn on_subscribe_guard(&mut self) {
        let recent = self
            .session
            .last_sample_at
            .is_some_and(|t| t.elapsed() <= self.subscribe_grace);
        if recent {
            // Data is flowing; the guard simply does not re-arm.
            return;
        }

        if self.session.resubscribe_attempts < self.max_resubscribe_attempts {
            self.session.resubscribe_attempts += 1;
            tracing::warn!(
                attempt = self.session.resubscribe_attempts,
                max = self.max_resubscribe_attempts,
                "no data after subscribe; re-subscribing",
            );
            if self.session.auth_token.is_some() && self.session.session_id.is_some() {
                self.subscribe();
            } else {
                self.schedule_authorize_retry();
            }
        } else {
            self.session.resubscribe_attempts = 0;
            self.hard_reset("no data after repeated subscribe attempts");
        }
    }

    fn cancel_retry_timer(&mut self) {
        if let Some(handle) = self.retry_timer.take() {
            handle.abort();
        }
    }

    fn cancel_guard_timer(&mut self) {
        if let Some(handle) = self.guard_timer.take() {
            handle.abort();
        }
    }

    /// Throttle headset re-queries to one per retry interval.
    fn schedule_headset_requery(&mut self) {
        self.schedule_retry(RetryKind::HeadsetQuery);
    }

    /// Schedule a full retry of the entry sequence.
    fn schedule_authorize_retry(&mut self) {
        self.schedule_retry(RetryKind::Authorize);
    }

    fn schedule_retry(&mut self, kind: RetryKind) {
        self.cancel_retry_timer();
        let tx = self.timer_tx.clone();
        let delay = self.retry_interval;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(TimerFired::Retry(kind)).await;
        });
        self.retry_timer = Some(handle.abort_handle());
    }

    fn arm_subscribe_guard(&mut self) {
        self.cancel_guard_timer();
        let tx = self.timer_tx.clone();
        let delay = self.subscribe_grace;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(TimerFired::SubscribeGuard).await;
        });
        self.guard_timer = Some(handle.abort_handle());
    }

    // ─── Outgoing requests ──────────────────────────────────────────────

    fn send_request(&mut self, request: RpcRequest) {
        let Some(outbound) = &self.outbound else {
            tracing::warn!(request = ?request.id, "no transport bound; dropping request");
            return;
        };
        if outbound.send(request).is_err() {
            tracing::warn!("control transport gone; requesting teardown");
            self.close_requested = true;
        }
    }

    fn run_sequence(&mut self) {
        if self.session.access_granted {
            self.authorize();
        } else {
            self.request_access();
        }
    }

    fn request_access(&mut self) {
        self.phase = SessionPhase::AwaitingAccess;
        let request = RpcRequest::request_access(&self.client_id, &self.client_secret);
        self.send_request(request);
    }

    fn authorize(&mut self) {
        self.phase = SessionPhase::AwaitingAuthorization;
        let request = RpcRequest::authorize(&self.client_id, &self.client_secret);
        self.send_request(request);
    }

    fn query_headsets(&mut self) {
        self.phase = SessionPhase::AwaitingHeadsetDiscovery;
        self.send_request(RpcRequest::query_headsets());
    }

    fn connect_headset(&mut self) {
        let Some(headset_id) = self.session.headset_id.clone() else {
            self.schedule_headset_requery();
            return;
        };
        self.phase = SessionPhase::AwaitingHeadsetConnect;
        self.send_request(RpcRequest::connect_headset(&headset_id));
    }

    fn create_session(&mut self) {
        let (Some(token), Some(headset_id)) = (
            self.session.auth_token.clone(),
            self.session.headset_id.clone(),
        ) else {
            self.schedule_authorize_retry();
            return;
        };
        self.phase = SessionPhase::AwaitingSessionCreateOrReuse;
        self.send_request(RpcRequest::create_session(&token, &headset_id));
    }

    fn query_sessions(&mut self) {
        let Some(token) = self.session.auth_token.clone() else {
            self.schedule_authorize_retry();
            return;
        };
        self.phase = SessionPhase::AwaitingSessionCreateOrReuse;
        self.send_request(RpcRequest::query_sessions(&token));
    }

    fn subscribe(&mut self) {
        let (Some(token), Some(session_id)) = (
            self.session.auth_token.clone(),
            self.session.session_id.clone(),
        ) else {
            self.schedule_authorize_retry();
            return;
        };
        self.session.subscribed = false;
        self.cancel_guard_timer();
        self.phase = SessionPhase::AwaitingSubscribeAck;
        tracing::info!(streams = ?Streams::ALL, "subscribing to data streams");
        self.send_request(RpcRequest::subscribe(&token, &session_id, Streams::ALL));
    }
}

// ─── Session selection ──────────────────────────────────────────────────

/// Pick the best session to reuse for a headset: prefer an
/// active/open/opened session on this headset, else any session on this
/// headset, else the first session in the list.
fn choose_session<'a>(sessions: &'a [Value], headset_id: Option<&str>) -> Option<&'a Value> {
    let mut fallback = None;

    if let Some(headset_id) = headset_id {
        for session in sessions {
            if session_headset_id(session) != Some(headset_id) {
                continue;
            }
            let status = session.get("status").and_then(Value::as_str);
            if matches!(status, Some("active" | "open" | "opened")) {
                return Some(session);
            }
            if fallback.is_none() {
                fallback = Some(session);
            }
        }
    }

    fallback.or_else(|| sessions.first())
}

/// The headset a session entry belongs to. The `headset` field is either a
/// bare id string or an object carrying an `id`; older payloads used
/// `headsetId`.
fn session_headset_id(session: &Value) -> Option<&str> {
    match session.get("headset") {
        Some(Value::String(id)) => Some(id),
        Some(object) => object.get("id").and_then(Value::as_str),
        None => session.get("headsetId").and_then(Value::as_str),
    }
}

/// Stream names from a subscribe ack, when the result carries them.
fn ack_stream_names(result: &Value) -> Option<Vec<String>> {
    let entries = result
        .get("success")
        .or_else(|| result.get("streams"))?
        .as_array()?;

    Some(
        entries
            .iter()
            .filter_map(|entry| {
                entry
                    .get("streamName")
                    .and_then(Value::as_str)
                    .or_else(|| entry.as_str())
                    .map(String::from)
            })
            .collect(),
    )
}
