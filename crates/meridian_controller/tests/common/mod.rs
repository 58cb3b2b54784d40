//! Shared helpers for integration tests: in-process controller nodes and
//! scripted peers speaking the real wire codec over loopback.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use meridian_controller::config::ControllerSettings;
use meridian_controller::controller::Controller;
use meridian_controller::node::{NodeDefinition, NodeType};
use meridian_controller::wire::{
    Frame, FrameCodec, JoinAttempt, JoinSuccess, Payload, PeerSettings,
};
use meridian_controller::{start_controller, ControllerHandle};

/// Timeout for node startup, elections, and message round-trips.
pub const IO_TIMEOUT: Duration = Duration::from_secs(20);
/// Poll interval for state-based waits.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Reserve a loopback port by binding and immediately dropping a listener.
pub fn pick_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe listener");
    listener.local_addr().expect("probe listener addr").port()
}

pub fn local_node(port: u16) -> NodeDefinition {
    NodeDefinition::new("127.0.0.1", port)
}

pub fn connection_string(ports: &[u16]) -> String {
    ports
        .iter()
        .map(|p| format!("127.0.0.1:{p}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Settings with test-friendly reconciler intervals.
pub fn test_settings(port: u16, connection_string: &str) -> ControllerSettings {
    ControllerSettings {
        connection_string: connection_string.to_string(),
        node_name: "127.0.0.1".to_string(),
        port,
        log_level: "info".to_string(),
        max_chunk_item_count: 4096,
        redundant_nodes_per_location: 1,
        web_interface_port: 0,
        reconcile_min: Duration::from_millis(100),
        reconcile_max: Duration::from_millis(900),
    }
}

pub async fn start_node(port: u16, connection_string: &str) -> ControllerHandle {
    start_controller(test_settings(port, connection_string))
        .await
        .expect("start controller node")
}

/// Poll a synchronous condition until it holds or the deadline passes.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + IO_TIMEOUT;
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Wait until every replica agrees on one primary and exactly one of them
/// holds the role itself.
pub async fn wait_for_agreed_primary(controllers: &[&Arc<Controller>]) -> NodeDefinition {
    let deadline = Instant::now() + IO_TIMEOUT;
    loop {
        let primaries: Vec<Option<NodeDefinition>> =
            controllers.iter().map(|c| c.primary()).collect();
        if let Some(Some(first)) = primaries.first() {
            let agreed = primaries.iter().all(|p| p.as_ref() == Some(first));
            let holders = controllers.iter().filter(|c| c.is_primary()).count();
            if agreed && holders == 1 {
                return first.clone();
            }
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for an agreed primary; saw {primaries:?}");
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// A scripted peer: one framed loopback connection driven by the test.
pub struct TestPeer {
    link: Framed<TcpStream, FrameCodec>,
    /// Canonical identity this peer declares when joining.
    pub local: NodeDefinition,
}

impl TestPeer {
    pub async fn connect(target: &NodeDefinition) -> TestPeer {
        let socket = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .expect("connect test peer");
        socket.set_nodelay(true).expect("set nodelay");
        let local_addr = socket.local_addr().expect("local addr");
        TestPeer {
            link: Framed::new(socket, FrameCodec),
            local: NodeDefinition::new(local_addr.ip().to_string(), local_addr.port()),
        }
    }

    /// Send a payload; returns the allocated message id.
    pub async fn send(&mut self, payload: &Payload, waiting_for_response: bool) -> u32 {
        let frame = Frame::request(payload, waiting_for_response).expect("build frame");
        let id = frame.id;
        self.link.send(frame).await.expect("send frame");
        id
    }

    /// Send a response to a previously received frame.
    pub async fn reply(&mut self, in_response_to: u32, payload: &Payload) {
        let frame = Frame::reply(in_response_to, payload, false).expect("build reply");
        self.link.send(frame).await.expect("send reply");
    }

    /// Read the next frame, or `None` once the controller closed the link.
    pub async fn recv_opt(&mut self) -> Option<(Frame, Payload)> {
        let next = tokio::time::timeout(IO_TIMEOUT, self.link.next())
            .await
            .expect("timed out reading frame");
        let frame = next?.expect("read frame");
        let payload = frame.decode_payload().expect("decode payload");
        Some((frame, payload))
    }

    pub async fn recv(&mut self) -> (Frame, Payload) {
        self.recv_opt().await.expect("connection closed by controller")
    }

    /// Read frames until one matches, acknowledging any skipped frame that
    /// expects a response. The matched frame is returned unacknowledged.
    pub async fn expect(
        &mut self,
        what: &str,
        mut pred: impl FnMut(&Payload) -> bool,
    ) -> (Frame, Payload) {
        let deadline = Instant::now() + IO_TIMEOUT;
        loop {
            if Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            let (frame, payload) = self.recv().await;
            if pred(&payload) {
                return (frame, payload);
            }
            if frame.waiting_for_response {
                self.reply(frame.id, &Payload::Acknowledgement).await;
            }
        }
    }

    /// `expect`, then acknowledge the matched frame as well.
    pub async fn expect_acked(
        &mut self,
        what: &str,
        pred: impl FnMut(&Payload) -> bool,
    ) -> Payload {
        let (frame, payload) = self.expect(what, pred).await;
        if frame.waiting_for_response {
            self.reply(frame.id, &Payload::Acknowledgement).await;
        }
        payload
    }

    /// Send a `JoinAttempt` under this peer's own identity and return the
    /// controller's raw response.
    pub async fn try_join(
        &mut self,
        node_type: NodeType,
        settings: PeerSettings,
    ) -> (Frame, Payload) {
        let identity = self.local.clone();
        self.try_join_as(identity, node_type, settings).await
    }

    pub async fn try_join_as(
        &mut self,
        identity: NodeDefinition,
        node_type: NodeType,
        settings: PeerSettings,
    ) -> (Frame, Payload) {
        let attempt = Payload::JoinAttempt(JoinAttempt {
            node_type,
            name: identity.host,
            port: identity.port,
            settings,
            is_primary_claim: false,
        });
        let id = self.send(&attempt, true).await;
        let deadline = Instant::now() + IO_TIMEOUT;
        loop {
            if Instant::now() > deadline {
                panic!("timed out waiting for join response");
            }
            let (frame, payload) = self.recv().await;
            if frame.in_response_to == id {
                return (frame, payload);
            }
            if frame.waiting_for_response {
                self.reply(frame.id, &Payload::Acknowledgement).await;
            }
        }
    }

    /// Complete a join that must succeed, acknowledging the success message.
    pub async fn join(&mut self, node_type: NodeType, settings: PeerSettings) -> JoinSuccess {
        let (frame, payload) = self.try_join(node_type, settings).await;
        let Payload::JoinSuccess(success) = payload else {
            panic!("join was not accepted: {payload:?}");
        };
        if frame.waiting_for_response {
            self.reply(frame.id, &Payload::Acknowledgement).await;
        }
        success
    }
}
