mod support;

use std::net::SocketAddr;
use std::time::Duration;

use cortex_relay::{CortexRelay, RelayConfig};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use support::mock_cortex::{MockConnection, MockCortexServer};

type Consumer = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_config(url: String) -> RelayConfig {
    let mut config = RelayConfig::new("test-client-id", "test-client-secret");
    config.cortex_url = url;
    config.emit_event_lines = false;
    config.broadcast.bind_addr = "127.0.0.1:0".into();
    config.reconnect.retry_interval_ms = 50;
    config.liveness.subscribe_grace_ms = 2000;
    config.liveness.watchdog_tick_ms = 100;
    config.liveness.silence_timeout_ms = 2000;
    config
}

async fn start_server_or_skip(test_name: &str) -> Option<MockCortexServer> {
    match MockCortexServer::start().await {
        Ok(server) => Some(server),
        Err(err) => {
            eprintln!("Skipping {test_name}: unable to start mock server: {err}");
            None
        }
    }
}

async fn attach_consumer(addr: SocketAddr) -> Consumer {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .expect("consumer failed to connect");
    // Give the accept loop a moment to register the consumer with the
    // relay before samples start flowing.
    tokio::time::sleep(Duration::from_millis(100)).await;
    ws
}

async fn next_packet(consumer: &mut Consumer) -> Value {
    loop {
        let message = timeout(Duration::from_secs(3), consumer.next())
            .await
            .expect("timed out waiting for sample packet")
            .expect("consumer stream ended")
            .expect("consumer websocket error");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn push_samples(connection: &MockConnection, times: std::ops::RangeInclusive<u32>) {
    for n in times {
        connection.push_eeg_frame(f64::from(n), 4100.0).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn every_consumer_receives_every_sample_in_order() {
    let mut server = match start_server_or_skip("every_consumer_receives_every_sample_in_order").await {
        Some(server) => server,
        None => return,
    };
    let config = test_config(server.ws_url());

    let mut relay = CortexRelay::new(config);
    let addr = relay.bind().await.unwrap();
    let relay_task = tokio::spawn(relay.run());

    let mut first = attach_consumer(addr).await;
    let mut second = attach_consumer(addr).await;

    let mut connection = server.accept_connection().await;
    connection.drive_full_negotiation(true).await;
    push_samples(&connection, 1..=4).await;

    for n in 1..=4u32 {
        assert_eq!(next_packet(&mut first).await["time"], f64::from(n));
        assert_eq!(next_packet(&mut second).await["time"], f64::from(n));
    }

    relay_task.abort();
}

#[tokio::test]
async fn departing_consumer_does_not_disturb_the_rest() {
    let mut server = match start_server_or_skip("departing_consumer_does_not_disturb_the_rest").await {
        Some(server) => server,
        None => return,
    };
    let config = test_config(server.ws_url());

    let mut relay = CortexRelay::new(config);
    let addr = relay.bind().await.unwrap();
    let relay_task = tokio::spawn(relay.run());

    let mut healthy = attach_consumer(addr).await;
    let mut doomed = attach_consumer(addr).await;

    let mut connection = server.accept_connection().await;
    connection.drive_full_negotiation(true).await;
    push_samples(&connection, 1..=2).await;

    assert_eq!(next_packet(&mut doomed).await["time"], 1.0);
    assert_eq!(next_packet(&mut healthy).await["time"], 1.0);

    // One consumer disappears mid-stream.
    doomed.close(None).await.unwrap();
    drop(doomed);
    tokio::time::sleep(Duration::from_millis(100)).await;

    push_samples(&connection, 3..=5).await;

    // The survivor still receives every sample, in acceptance order.
    for n in 2..=5u32 {
        assert_eq!(next_packet(&mut healthy).await["time"], f64::from(n));
    }

    relay_task.abort();
}

#[tokio::test]
async fn late_consumer_receives_only_later_samples() {
    let mut server = match start_server_or_skip("late_consumer_receives_only_later_samples").await {
        Some(server) => server,
        None => return,
    };
    let config = test_config(server.ws_url());

    let mut relay = CortexRelay::new(config);
    let addr = relay.bind().await.unwrap();
    let relay_task = tokio::spawn(relay.run());

    let mut early = attach_consumer(addr).await;

    let mut connection = server.accept_connection().await;
    connection.drive_full_negotiation(true).await;
    push_samples(&connection, 1..=2).await;

    assert_eq!(next_packet(&mut early).await["time"], 1.0);
    assert_eq!(next_packet(&mut early).await["time"], 2.0);

    let mut late = attach_consumer(addr).await;
    push_samples(&connection, 3..=3).await;

    // No retroactive delivery: the late consumer starts at sample 3.
    assert_eq!(next_packet(&mut late).await["time"], 3.0);
    assert_eq!(next_packet(&mut early).await["time"], 3.0);

    relay_task.abort();
}
