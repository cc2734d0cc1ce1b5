#![allow(dead_code)]

use client_core::SignalingClient;
use shared::{ClientEvent, RoomJoin, ServerEvent};
use signaling_server::{serve, AppState, SignalingServerConfig};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);
pub const QUIET_PERIOD: Duration = Duration::from_millis(300);

pub struct TestRelay {
    pub url: String,
    pub state: AppState,
}

/// Starts a relay on an ephemeral loopback port.
pub async fn start_relay() -> TestRelay {
    start_relay_with(SignalingServerConfig::ephemeral()).await
}

pub async fn start_relay_with(config: SignalingServerConfig) -> TestRelay {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
    let addr = listener.local_addr().expect("relay address");
    let state = AppState::new(config);
    tokio::spawn(serve(listener, state.clone(), std::future::pending()));
    TestRelay {
        url: format!("ws://{addr}/ws"),
        state,
    }
}

pub struct Peer {
    pub client: SignalingClient,
    pub events: UnboundedReceiver<ServerEvent>,
}

impl Peer {
    pub async fn connect(relay: &TestRelay) -> Self {
        let (client, events) = SignalingClient::connect(&relay.url)
            .await
            .expect("connect to relay");
        Self { client, events }
    }

    pub fn send(&self, event: ClientEvent) {
        self.client.send(event).expect("send to relay");
    }

    pub fn join(&self, email: &str, room: &str) {
        self.send(ClientEvent::RoomJoin(RoomJoin {
            email: email.to_string(),
            room: room.to_string(),
        }));
    }

    pub async fn recv(&mut self) -> ServerEvent {
        tokio::time::timeout(RECV_TIMEOUT, self.events.recv())
            .await
            .expect("relay event within timeout")
            .expect("relay connection open")
    }

    /// Asserts nothing arrives for a short while.
    pub async fn expect_silence(&mut self) {
        if let Ok(Some(event)) = tokio::time::timeout(QUIET_PERIOD, self.events.recv()).await {
            panic!("unexpected event {event:?}");
        }
    }
}

/// Polls until the relay's registry holds `connections` live connections.
pub async fn wait_for_connections(relay: &TestRelay, connections: usize) {
    for _ in 0..100 {
        if relay.state.registry().stats().await.connections == connections {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("relay never reached {connections} connections");
}
