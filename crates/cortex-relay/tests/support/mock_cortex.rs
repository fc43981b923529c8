#![allow(dead_code)]

//! In-process mock of the Cortex control service. Speaks plain `ws://` on
//! an ephemeral port; tests drive the negotiation by answering the relay's
//! numbered requests and pushing data frames.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

pub const STEP_TIMEOUT: Duration = Duration::from_secs(3);

pub const HEADSET_ID: &str = "EPOCX-4F021234";
pub const SESSION_ID: &str = "5b9c1ad4-1d17-4c3c-9a2e-5a3b9d4e8f01";
pub const TOKEN: &str = "mock-cortex-token";

enum ConnectionCommand {
    SendJson(Value),
    ForceClose,
}

/// One accepted control connection, as seen from the mock service side.
pub struct MockConnection {
    index: usize,
    request_rx: mpsc::Receiver<Value>,
    command_tx: mpsc::Sender<ConnectionCommand>,
}

impl MockConnection {
    pub fn index(&self) -> usize {
        self.index
    }

    pub async fn recv_request(&mut self) -> Value {
        timeout(STEP_TIMEOUT, self.request_rx.recv())
            .await
            .expect("timed out waiting for request")
            .expect("mock connection request channel closed")
    }

    /// Receive the next request and assert its method name.
    pub async fn recv_request_method(&mut self, expected_method: &str) -> Value {
        let request = self.recv_request().await;
        let method = request.get("method").and_then(Value::as_str);
        assert_eq!(method, Some(expected_method), "unexpected method request");
        request
    }

    pub async fn send_json(&self, value: Value) {
        self.command_tx
            .send(ConnectionCommand::SendJson(value))
            .await
            .expect("failed to send command to mock connection");
    }

    pub async fn send_result(&self, id: u64, result: Value) {
        self.send_json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result,
        }))
        .await;
    }

    pub async fn send_error(&self, id: u64, code: i32, message: &str) {
        self.send_json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": code,
                "message": message,
            }
        }))
        .await;
    }

    /// Push one raw `eeg` frame: sequence marker, reserved slot, then 14
    /// channel values offset from `base`.
    pub async fn push_eeg_frame(&self, time: f64, base: f64) {
        let mut eeg = vec![json!(1), json!(0)];
        for channel in 0..14 {
            eeg.push(json!(base + f64::from(channel)));
        }
        self.send_json(json!({ "time": time, "eeg": eeg })).await;
    }

    /// Push a device-status frame (battery, signal, contact quality).
    pub async fn push_dev_frame(&self, time: f64) {
        self.send_json(json!({
            "time": time,
            "dev": [100, 2, [4, 4, 4, 4]],
        }))
        .await;
    }

    /// Push an EEG-quality frame.
    pub async fn push_eq_frame(&self, time: f64) {
        self.send_json(json!({
            "time": time,
            "eq": [4, 4, 4, 4],
        }))
        .await;
    }

    /// Drop the TCP connection without a close handshake.
    pub async fn force_close(&self) {
        let _ = self.command_tx.send(ConnectionCommand::ForceClose).await;
    }

    /// Answer the entry steps: access request (first connection only),
    /// then authorize.
    pub async fn drive_entry(&mut self, expect_access_request: bool) {
        if expect_access_request {
            let access = self.recv_request_method("requestAccess").await;
            self.send_result(rpc_id(&access), json!({ "accessGranted": true }))
                .await;
        }
        let authorize = self.recv_request_method("authorize").await;
        self.send_result(rpc_id(&authorize), json!({ "cortexToken": TOKEN }))
            .await;
    }

    /// Answer every step from access through the subscribe ack, leaving
    /// the relay in its streaming state.
    pub async fn drive_full_negotiation(&mut self, expect_access_request: bool) {
        self.drive_entry(expect_access_request).await;

        let query = self.recv_request_method("queryHeadsets").await;
        self.send_result(rpc_id(&query), json!([{ "id": HEADSET_ID }]))
            .await;

        let connect = self.recv_request_method("controlDevice").await;
        assert_eq!(connect["params"]["command"], "connect");
        assert_eq!(connect["params"]["headset"], HEADSET_ID);
        self.send_result(rpc_id(&connect), json!({ "command": "connect" }))
            .await;

        let create = self.recv_request_method("createSession").await;
        assert_eq!(create["params"]["cortexToken"], TOKEN);
        self.send_result(rpc_id(&create), json!({ "id": SESSION_ID }))
            .await;

        let subscribe = self.recv_request_method("subscribe").await;
        assert_eq!(subscribe["params"]["session"], SESSION_ID);
        self.ack_subscribe(rpc_id(&subscribe)).await;
    }

    /// Acknowledge a subscribe request for all three streams.
    pub async fn ack_subscribe(&self, id: u64) {
        self.send_result(
            id,
            json!({
                "success": [
                    { "streamName": "eeg" },
                    { "streamName": "dev" },
                    { "streamName": "eq" },
                ],
                "failure": [],
            }),
        )
        .await;
    }
}

/// Extract the numeric request id from an envelope.
pub fn rpc_id(request: &Value) -> u64 {
    request
        .get("id")
        .and_then(Value::as_u64)
        .expect("request missing numeric id")
}

pub struct MockCortexServer {
    addr: SocketAddr,
    connection_rx: mpsc::Receiver<MockConnection>,
    server_task: JoinHandle<()>,
}

impl MockCortexServer {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let (connection_tx, connection_rx) = mpsc::channel(16);
        let next_connection_index = Arc::new(AtomicUsize::new(0));

        let server_task = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => break,
                };

                let connection_tx = connection_tx.clone();
                let connection_index = next_connection_index.fetch_add(1, Ordering::SeqCst);

                tokio::spawn(async move {
                    let ws_stream = match accept_async(stream).await {
                        Ok(ws) => ws,
                        Err(_) => return,
                    };

                    let (mut ws_sink, mut ws_source) = ws_stream.split();
                    let (request_tx, request_rx) = mpsc::channel(64);
                    let (command_tx, mut command_rx) = mpsc::channel(64);

                    let connection = MockConnection {
                        index: connection_index,
                        request_rx,
                        command_tx: command_tx.clone(),
                    };

                    if connection_tx.send(connection).await.is_err() {
                        return;
                    }

                    loop {
                        tokio::select! {
                            maybe_command = command_rx.recv() => {
                                match maybe_command {
                                    Some(ConnectionCommand::SendJson(value)) => {
                                        let message = Message::Text(value.to_string().into());
                                        if ws_sink.send(message).await.is_err() {
                                            break;
                                        }
                                    }
                                    Some(ConnectionCommand::ForceClose) => {
                                        break;
                                    }
                                    None => break,
                                }
                            }
                            maybe_message = ws_source.next() => {
                                match maybe_message {
                                    Some(Ok(Message::Text(text))) => {
                                        if let Ok(value) = serde_json::from_str::<Value>(&text) {
                                            let _ = request_tx.send(value).await;
                                        }
                                    }
                                    Some(Ok(Message::Close(_))) => break,
                                    Some(Ok(_)) => {}
                                    Some(Err(_)) => break,
                                    None => break,
                                }
                            }
                        }
                    }
                });
            }
        });

        Ok(Self {
            addr,
            connection_rx,
            server_task,
        })
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn accept_connection(&mut self) -> MockConnection {
        timeout(STEP_TIMEOUT, self.connection_rx.recv())
            .await
            .expect("timed out waiting for control connection")
            .expect("mock server connection channel closed")
    }

    pub async fn try_accept_connection(&mut self, wait: Duration) -> Option<MockConnection> {
        match timeout(wait, self.connection_rx.recv()).await {
            Ok(Some(connection)) => Some(connection),
            _ => None,
        }
    }
}

impl Drop for MockCortexServer {
    fn drop(&mut self) {
        self.server_task.abort();
    }
}
