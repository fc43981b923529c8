//! # Lifecycle Events
//!
//! Line-oriented lifecycle event records — the only externally observable
//! signal of the relay's negotiation and recovery progress. Each event is
//! emitted exactly once per corresponding transition.
//!
//! Events are fanned out two ways: over a `tokio::sync::broadcast` channel
//! for in-process observers, and (optionally) as one JSON-RPC-style record
//! per line on stdout for a supervising process:
//!
//! ```text
//! {"jsonrpc":"2.0","method":"event","params":{"type":"session-created","sessionId":"..."}}
//! ```

use tokio::sync::broadcast;

/// Buffer size for the in-process event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle events emitted by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The consumer-facing broadcast server is listening.
    ServerReady,

    /// The access request was granted — credentials are valid.
    CredentialsValid,

    /// The access request was rejected for invalid credentials.
    CredentialsInvalid,

    /// The headset accepted the connect command.
    HeadsetConnected,

    /// A new session was created.
    SessionCreated { session_id: String },

    /// An existing session was adopted instead of creating a new one.
    SessionReused { session_id: String },

    /// The stream subscription was acknowledged.
    SubscriptionConfirmed { streams: Option<Vec<String>> },

    /// The stream went silent past the watchdog threshold.
    HeadsetDisconnected,

    /// A control-transport error occurred.
    Error { message: String },
}

impl LifecycleEvent {
    /// The `type` tag carried in the emitted record.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ServerReady => "server-ready",
            Self::CredentialsValid => "credentials-valid",
            Self::CredentialsInvalid => "credentials-invalid",
            Self::HeadsetConnected => "headset-connected",
            Self::SessionCreated { .. } => "session-created",
            Self::SessionReused { .. } => "session-reused",
            Self::SubscriptionConfirmed { .. } => "subscription-confirmed",
            Self::HeadsetDisconnected => "headset-disconnected",
            Self::Error { .. } => "error",
        }
    }

    /// Render the event as a single-line JSON-RPC record.
    pub fn to_line(&self) -> String {
        let mut params = serde_json::json!({ "type": self.event_type() });

        match self {
            Self::SessionCreated { session_id } | Self::SessionReused { session_id } => {
                params["sessionId"] = serde_json::json!(session_id);
            }
            Self::SubscriptionConfirmed {
                streams: Some(streams),
            } => {
                params["streams"] = serde_json::json!(streams);
            }
            Self::Error { message } => {
                params["message"] = serde_json::json!(message);
            }
            _ => {}
        }

        serde_json::json!({
            "jsonrpc": "2.0",
            "method": "event",
            "params": params,
        })
        .to_string()
    }
}

/// Fan-out point for lifecycle events.
///
/// Cloneable; all clones share the same broadcast channel. Emission never
/// fails — events sent with no live subscribers are simply dropped.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
    line_output: bool,
}

impl EventBus {
    /// Create an event bus. When `line_output` is set, every event is also
    /// printed as a JSON record on its own stdout line.
    pub fn new(line_output: bool) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx, line_output }
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    /// Emit one event to all observers.
    pub fn emit(&self, event: LifecycleEvent) {
        tracing::info!(event = event.event_type(), "lifecycle event");
        if self.line_output {
            println!("{}", event.to_line());
        }
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_line_shapes() {
        let line = LifecycleEvent::ServerReady.to_line();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "event");
        assert_eq!(value["params"]["type"], "server-ready");

        let line = LifecycleEvent::SessionCreated {
            session_id: "abc-123".into(),
        }
        .to_line();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["params"]["type"], "session-created");
        assert_eq!(value["params"]["sessionId"], "abc-123");

        let line = LifecycleEvent::SubscriptionConfirmed {
            streams: Some(vec!["eeg".into(), "dev".into()]),
        }
        .to_line();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["params"]["streams"][0], "eeg");

        let line = LifecycleEvent::Error {
            message: "socket closed".into(),
        }
        .to_line();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["params"]["message"], "socket closed");
    }

    #[test]
    fn test_event_types_are_kebab_case() {
        for event in [
            LifecycleEvent::ServerReady,
            LifecycleEvent::CredentialsValid,
            LifecycleEvent::CredentialsInvalid,
            LifecycleEvent::HeadsetConnected,
            LifecycleEvent::HeadsetDisconnected,
        ] {
            let tag = event.event_type();
            assert!(tag.chars().all(|c| c.is_ascii_lowercase() || c == '-'));
        }
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = EventBus::new(false);
        let mut rx = bus.subscribe();

        bus.emit(LifecycleEvent::HeadsetConnected);
        assert_eq!(rx.recv().await.unwrap(), LifecycleEvent::HeadsetConnected);
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::new(false);
        bus.emit(LifecycleEvent::HeadsetDisconnected);
    }
}
