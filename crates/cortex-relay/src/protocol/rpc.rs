//! JSON-RPC request/response envelopes for the Cortex control channel.
//!
//! Unlike a generic JSON-RPC client, the negotiation flow uses
//! protocol-fixed request ids: each step of the flow always carries the
//! same small integer, and a later response for an id supersedes any
//! earlier one. [`RequestId`] is therefore an enum, not a counter.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::protocol::constants::Methods;
use crate::protocol::frames::DataFrame;

/// Protocol-fixed request ids, one per negotiation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestId {
    AccessRequest = 0,
    Authorize = 1,
    QueryHeadsets = 2,
    ConnectHeadset = 3,
    CreateSession = 4,
    Subscribe = 5,
    QuerySessions = 6,
}

impl RequestId {
    /// Map a wire id back to its negotiation step.
    pub fn from_wire(id: u64) -> Option<Self> {
        match id {
            0 => Some(Self::AccessRequest),
            1 => Some(Self::Authorize),
            2 => Some(Self::QueryHeadsets),
            3 => Some(Self::ConnectHeadset),
            4 => Some(Self::CreateSession),
            5 => Some(Self::Subscribe),
            6 => Some(Self::QuerySessions),
            _ => None,
        }
    }

    /// The Cortex method name this step invokes.
    pub fn method(self) -> &'static str {
        match self {
            Self::AccessRequest => Methods::REQUEST_ACCESS,
            Self::Authorize => Methods::AUTHORIZE,
            Self::QueryHeadsets => Methods::QUERY_HEADSETS,
            Self::ConnectHeadset => Methods::CONTROL_DEVICE,
            Self::CreateSession => Methods::CREATE_SESSION,
            Self::Subscribe => Methods::SUBSCRIBE,
            Self::QuerySessions => Methods::QUERY_SESSIONS,
        }
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(*self as u64)
    }
}

/// A JSON-RPC 2.0 request to the Cortex API.
#[derive(Debug, Serialize)]
pub struct RpcRequest {
    pub id: RequestId,
    pub jsonrpc: &'static str,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    /// Build a request for the given step. Empty params are omitted
    /// entirely, matching the official Cortex examples.
    fn new(id: RequestId, params: Value) -> Self {
        let params = if params.is_object() && params.as_object().is_some_and(|m| m.is_empty()) {
            None
        } else {
            Some(params)
        };

        Self {
            id,
            jsonrpc: "2.0",
            method: id.method(),
            params,
        }
    }

    /// `requestAccess` — ask the user to approve this application.
    pub fn request_access(client_id: &str, client_secret: &str) -> Self {
        Self::new(
            RequestId::AccessRequest,
            serde_json::json!({
                "clientId": client_id,
                "clientSecret": client_secret,
            }),
        )
    }

    /// `authorize` — obtain a cortex token.
    pub fn authorize(client_id: &str, client_secret: &str) -> Self {
        Self::new(
            RequestId::Authorize,
            serde_json::json!({
                "clientId": client_id,
                "clientSecret": client_secret,
                "debit": 1,
            }),
        )
    }

    /// `queryHeadsets` — discover available headsets.
    pub fn query_headsets() -> Self {
        Self::new(RequestId::QueryHeadsets, serde_json::json!({}))
    }

    /// `controlDevice` — connect a discovered headset.
    pub fn connect_headset(headset_id: &str) -> Self {
        Self::new(
            RequestId::ConnectHeadset,
            serde_json::json!({
                "command": "connect",
                "headset": headset_id,
            }),
        )
    }

    /// `createSession` — open an active session on a connected headset.
    pub fn create_session(cortex_token: &str, headset_id: &str) -> Self {
        Self::new(
            RequestId::CreateSession,
            serde_json::json!({
                "cortexToken": cortex_token,
                "headset": headset_id,
                "status": "active",
            }),
        )
    }

    /// `subscribe` — subscribe the session to data streams.
    pub fn subscribe(cortex_token: &str, session_id: &str, streams: &[&str]) -> Self {
        Self::new(
            RequestId::Subscribe,
            serde_json::json!({
                "cortexToken": cortex_token,
                "session": session_id,
                "streams": streams,
            }),
        )
    }

    /// `querySessions` — list existing sessions for reuse.
    pub fn query_sessions(cortex_token: &str) -> Self {
        Self::new(
            RequestId::QuerySessions,
            serde_json::json!({
                "cortexToken": cortex_token,
            }),
        )
    }
}

/// A JSON-RPC 2.0 response from the Cortex API.
#[derive(Debug, Deserialize)]
pub struct RpcResponse {
    pub id: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<RpcError>,
}

/// A JSON-RPC 2.0 error payload.
///
/// This is the raw error object from the wire; use
/// [`RelayError::from_api_error`](crate::RelayError::from_api_error) to get
/// the semantic variant the state machine routes on.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Cortex API error {}: {}", self.code, self.message)
    }
}

/// An inbound control-channel message, routed by shape.
#[derive(Debug)]
pub enum Inbound {
    /// A response to one of our numbered requests.
    Response(RpcResponse),
    /// A data frame from a subscribed stream.
    Frame(DataFrame),
    /// Anything else — logged and discarded by the caller.
    Unroutable(Value),
}

/// Classify an inbound message by the presence of an `id` key (response)
/// or a data-kind key (`eeg`/`dev`/`eq` frame).
pub fn classify(value: Value) -> Inbound {
    if value.get("id").is_some() {
        return match serde_json::from_value(value.clone()) {
            Ok(response) => Inbound::Response(response),
            Err(_) => Inbound::Unroutable(value),
        };
    }

    match DataFrame::from_value(&value) {
        Some(frame) => Inbound::Frame(frame),
        None => Inbound::Unroutable(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::ErrorCodes;

    #[test]
    fn test_request_ids_are_protocol_fixed() {
        assert_eq!(RpcRequest::request_access("a", "b").id, RequestId::AccessRequest);
        assert_eq!(RpcRequest::authorize("a", "b").id, RequestId::Authorize);
        assert_eq!(RpcRequest::query_headsets().id, RequestId::QueryHeadsets);
        assert_eq!(RpcRequest::connect_headset("h").id, RequestId::ConnectHeadset);
        assert_eq!(RpcRequest::create_session("t", "h").id, RequestId::CreateSession);
        assert_eq!(RpcRequest::subscribe("t", "s", &["eeg"]).id, RequestId::Subscribe);
        assert_eq!(RpcRequest::query_sessions("t").id, RequestId::QuerySessions);

        for wire in 0..7u64 {
            let id = RequestId::from_wire(wire).unwrap();
            assert_eq!(id as u64, wire);
        }
        assert!(RequestId::from_wire(7).is_none());
    }

    #[test]
    fn test_serialize_request_no_params() {
        // Empty params are omitted entirely, matching official examples.
        let req = RpcRequest::query_headsets();
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"queryHeadsets\""));
        assert!(json.contains("\"id\":2"));
        assert!(!json.contains("\"params\""), "empty params present: {json}");
    }

    #[test]
    fn test_serialize_request_with_params() {
        let req = RpcRequest::subscribe("tok", "sess", &["eeg", "dev", "eq"]);
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["id"], 5);
        assert_eq!(value["method"], "subscribe");
        assert_eq!(value["params"]["cortexToken"], "tok");
        assert_eq!(value["params"]["session"], "sess");
        assert_eq!(value["params"]["streams"][0], "eeg");
    }

    #[test]
    fn test_connect_headset_uses_control_device() {
        let req = RpcRequest::connect_headset("EPOCX-1234");
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["method"], "controlDevice");
        assert_eq!(value["params"]["command"], "connect");
        assert_eq!(value["params"]["headset"], "EPOCX-1234");
    }

    #[test]
    fn test_classify_response() {
        let value = serde_json::json!({
            "id": 4,
            "jsonrpc": "2.0",
            "error": { "code": ErrorCodes::SESSION_ALREADY_EXISTS, "message": "exists" },
        });
        match classify(value) {
            Inbound::Response(resp) => {
                assert_eq!(resp.id, Some(4));
                assert_eq!(resp.error.unwrap().code, ErrorCodes::SESSION_ALREADY_EXISTS);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_frame() {
        let value = serde_json::json!({
            "time": 1.25,
            "eeg": [12, 0, 1.0, 2.0],
        });
        assert!(matches!(classify(value), Inbound::Frame(DataFrame::Eeg(_))));
    }

    #[test]
    fn test_classify_unroutable() {
        let value = serde_json::json!({ "warning": { "code": 1 } });
        assert!(matches!(classify(value), Inbound::Unroutable(_)));
    }
}
