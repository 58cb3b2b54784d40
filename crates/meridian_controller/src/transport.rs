//! TCP transport: framed links, request/response correlation, and the peer
//! registry.
//!
//! The controller core addresses peers by `NodeDefinition` only; this module
//! owns the sockets. An outbound request flagged as waiting parks a oneshot
//! in the correlation table and `block_until_done` resolves when the inbound
//! demultiplexer sees a matching `in_response_to`, or fails after
//! `REQUEST_TIMEOUT` or when the link is torn down. Inbound messages that are
//! not correlated responses are surfaced as events to the dispatch loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::node::{NodeDefinition, NodeType};
use crate::wire::{Frame, FrameCodec, Payload};

/// How long a waiting request may stay unanswered before it fails.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Link is up but the peer has not completed its join handshake.
    Handshaking,
    /// Join succeeded; the peer is classified under its canonical address.
    Established,
}

/// Decoded inbound message together with its originating registry key.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub from: NodeDefinition,
    pub id: u32,
    pub in_response_to: u32,
    pub waiting_for_response: bool,
    pub payload: Payload,
}

/// Events surfaced to the controller's dispatch loop.
#[derive(Debug)]
pub enum TransportEvent {
    Message(InboundMessage),
    /// A link closed; `node_type` is unset when the peer never completed its
    /// handshake.
    ConnectionLost {
        addr: NodeDefinition,
        node_type: Option<NodeType>,
    },
}

struct PeerEntry {
    link: u64,
    outbound: mpsc::UnboundedSender<Frame>,
    node_type: Option<NodeType>,
    state: PeerState,
}

struct PendingSlot {
    addr: NodeDefinition,
    tx: oneshot::Sender<InboundMessage>,
}

pub struct Transport {
    peers: Mutex<HashMap<NodeDefinition, PeerEntry>>,
    pending: Mutex<HashMap<u32, PendingSlot>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    /// Observes every decoded inbound message, responses included; the
    /// controller uses it to track the primary's message-id high-water mark.
    inspector: OnceLock<Box<dyn Fn(&InboundMessage) + Send + Sync>>,
    next_link: AtomicU64,
    self_ref: Weak<Transport>,
}

impl Transport {
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            peers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            events,
            inspector: OnceLock::new(),
            next_link: AtomicU64::new(1),
            self_ref: self_ref.clone(),
        })
    }

    fn strong(&self) -> Arc<Transport> {
        // A live `&self` implies at least one strong reference.
        self.self_ref.upgrade().expect("transport dropped while in use")
    }

    pub fn set_inspector(&self, inspector: Box<dyn Fn(&InboundMessage) + Send + Sync>) {
        let _ = self.inspector.set(inspector);
    }

    /// Bind the listen socket and spawn the accept loop.
    pub async fn listen(&self, addr: SocketAddr) -> anyhow::Result<JoinHandle<()>> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind listener on {addr}"))?;
        let transport = self.strong();
        Ok(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer_addr)) => {
                        // Inbound links are registered under the ephemeral
                        // source address until the join handshake renames
                        // them to the peer's canonical identity.
                        let key = NodeDefinition::new(peer_addr.ip().to_string(), peer_addr.port());
                        transport.adopt(socket, key);
                    }
                    Err(err) => {
                        tracing::warn!(error = ?err, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }))
    }

    /// Open an outbound link registered directly under the target address.
    pub async fn connect(&self, addr: &NodeDefinition) -> anyhow::Result<()> {
        if self.has_peer(addr) {
            return Ok(());
        }
        let socket = TcpStream::connect((addr.host.as_str(), addr.port))
            .await
            .with_context(|| format!("connect to {addr}"))?;
        self.adopt(socket, addr.clone());
        Ok(())
    }

    /// Register a socket and spawn its reader/writer tasks.
    fn adopt(&self, socket: TcpStream, key: NodeDefinition) {
        let _ = socket.set_nodelay(true);
        let link = self.next_link.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        {
            let mut peers = self.peers.lock().unwrap();
            if peers.contains_key(&key) {
                tracing::warn!(peer = %key, "dropping duplicate connection");
                return;
            }
            peers.insert(
                key.clone(),
                PeerEntry {
                    link,
                    outbound: tx,
                    node_type: None,
                    state: PeerState::Handshaking,
                },
            );
        }

        let (mut sink, mut stream) = Framed::new(socket, FrameCodec).split();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            // Registry entry dropped or send failed: shut the write half so
            // the remote observes the close.
            let _ = sink.close().await;
        });

        let transport = self.strong();
        tokio::spawn(async move {
            while let Some(next) = stream.next().await {
                match next {
                    Ok(frame) => transport.route_inbound(link, frame),
                    Err(err) => {
                        tracing::debug!(link, error = ?err, "link read failed");
                        break;
                    }
                }
            }
            transport.link_closed(link);
        });
    }

    fn route_inbound(&self, link: u64, frame: Frame) {
        let Some(from) = self.key_for_link(link) else {
            return;
        };
        let payload = match frame.decode_payload() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(peer = %from, error = ?err, "dropping undecodable payload");
                return;
            }
        };
        let msg = InboundMessage {
            from,
            id: frame.id,
            in_response_to: frame.in_response_to,
            waiting_for_response: frame.waiting_for_response,
            payload,
        };
        if let Some(inspector) = self.inspector.get() {
            inspector(&msg);
        }
        if msg.in_response_to != 0 {
            let slot = self.pending.lock().unwrap().remove(&msg.in_response_to);
            if let Some(slot) = slot {
                let _ = slot.tx.send(msg);
                return;
            }
            // The waiter already timed out; fall through so the dispatcher
            // can at least log the stray response.
        }
        let _ = self.events.send(TransportEvent::Message(msg));
    }

    fn link_closed(&self, link: u64) {
        let removed = {
            let mut peers = self.peers.lock().unwrap();
            let key = peers
                .iter()
                .find(|(_, entry)| entry.link == link)
                .map(|(key, _)| key.clone());
            key.and_then(|key| peers.remove_entry(&key))
        };
        if let Some((addr, entry)) = removed {
            self.cancel_pending_for(&addr);
            let _ = self.events.send(TransportEvent::ConnectionLost {
                addr,
                node_type: entry.node_type,
            });
        }
    }

    fn key_for_link(&self, link: u64) -> Option<NodeDefinition> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .find(|(_, entry)| entry.link == link)
            .map(|(key, _)| key.clone())
    }

    /// Post an unsolicited message to `addr`. The returned handle reports
    /// delivery/response status; a missing peer fails without erroring.
    pub fn send_message(
        &self,
        addr: &NodeDefinition,
        payload: &Payload,
        waiting_for_response: bool,
    ) -> PendingReply {
        match Frame::request(payload, waiting_for_response) {
            Ok(frame) => self.dispatch_frame(addr, frame),
            Err(err) => {
                tracing::warn!(peer = %addr, error = ?err, "payload encode failed");
                PendingReply::failed()
            }
        }
    }

    /// Post a response to an inbound message over the same peer link.
    pub fn send_reply(
        &self,
        to: &InboundMessage,
        payload: &Payload,
        waiting_for_response: bool,
    ) -> PendingReply {
        self.send_reply_to(&to.from, to.id, payload, waiting_for_response)
    }

    /// Post a response addressed explicitly; needed when the peer's registry
    /// key changed (join rename) between request and reply.
    pub fn send_reply_to(
        &self,
        addr: &NodeDefinition,
        in_response_to: u32,
        payload: &Payload,
        waiting_for_response: bool,
    ) -> PendingReply {
        match Frame::reply(in_response_to, payload, waiting_for_response) {
            Ok(frame) => self.dispatch_frame(addr, frame),
            Err(err) => {
                tracing::warn!(peer = %addr, error = ?err, "payload encode failed");
                PendingReply::failed()
            }
        }
    }

    fn dispatch_frame(&self, addr: &NodeDefinition, frame: Frame) -> PendingReply {
        let id = frame.id;
        let waiting = frame.waiting_for_response;
        let rx = if waiting {
            let (tx, rx) = oneshot::channel();
            self.pending.lock().unwrap().insert(
                id,
                PendingSlot {
                    addr: addr.clone(),
                    tx,
                },
            );
            Some(rx)
        } else {
            None
        };

        let sender = {
            let peers = self.peers.lock().unwrap();
            peers.get(addr).map(|entry| entry.outbound.clone())
        };
        let sent = match sender {
            Some(sender) => sender.send(frame).is_ok(),
            None => false,
        };
        if !sent {
            self.pending.lock().unwrap().remove(&id);
            return PendingReply::failed();
        }
        PendingReply {
            id,
            sent: true,
            waiter: rx.map(|rx| (rx, self.strong())),
        }
    }

    fn forget(&self, id: u32) {
        self.pending.lock().unwrap().remove(&id);
    }

    fn cancel_pending_for(&self, addr: &NodeDefinition) {
        // Dropping the senders fails the parked waiters immediately.
        self.pending
            .lock()
            .unwrap()
            .retain(|_, slot| slot.addr != *addr);
    }

    /// Rebind a registry entry from its transport-level address to the
    /// canonical identity declared in the join handshake. When the canonical
    /// key is already taken the existing entry wins and the newcomer is
    /// dropped.
    pub fn rename(&self, old: &NodeDefinition, new: &NodeDefinition) -> bool {
        if old == new {
            return true;
        }
        let mut peers = self.peers.lock().unwrap();
        if peers.contains_key(new) {
            tracing::warn!(old = %old, new = %new, "canonical peer already registered; dropping newcomer");
            peers.remove(old);
            return false;
        }
        match peers.remove(old) {
            Some(entry) => {
                peers.insert(new.clone(), entry);
                true
            }
            None => false,
        }
    }

    pub fn mark_established(&self, addr: &NodeDefinition, node_type: NodeType) {
        let mut peers = self.peers.lock().unwrap();
        match peers.get_mut(addr) {
            Some(entry) => {
                entry.node_type = Some(node_type);
                entry.state = PeerState::Established;
            }
            None => tracing::warn!(peer = %addr, "cannot establish unknown peer"),
        }
    }

    /// Drop a link deliberately; no connection-lost event is emitted.
    pub fn close(&self, addr: &NodeDefinition) {
        self.peers.lock().unwrap().remove(addr);
        self.cancel_pending_for(addr);
    }

    pub fn has_peer(&self, addr: &NodeDefinition) -> bool {
        self.peers.lock().unwrap().contains_key(addr)
    }

    /// Classified type of an established peer, if any.
    pub fn peer_type(&self, addr: &NodeDefinition) -> Option<NodeType> {
        let peers = self.peers.lock().unwrap();
        peers.get(addr).and_then(|entry| {
            (entry.state == PeerState::Established)
                .then_some(entry.node_type)
                .flatten()
        })
    }

    pub fn list_peers(&self) -> Vec<(NodeDefinition, Option<NodeType>)> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .map(|(addr, entry)| (addr.clone(), entry.node_type))
            .collect()
    }

    /// Established peers of one type, in connection-name order so selection
    /// is deterministic.
    pub fn peers_of_type(&self, node_type: NodeType) -> Vec<NodeDefinition> {
        let mut nodes: Vec<NodeDefinition> = self
            .peers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, entry)| {
                entry.state == PeerState::Established && entry.node_type == Some(node_type)
            })
            .map(|(addr, _)| addr.clone())
            .collect();
        nodes.sort();
        nodes
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// Tear down every link and fail every in-flight request.
    pub fn shutdown(&self) {
        self.peers.lock().unwrap().clear();
        self.pending.lock().unwrap().clear();
    }
}

/// Handle for an outbound message, resolved by `block_until_done`.
pub struct PendingReply {
    id: u32,
    sent: bool,
    waiter: Option<(oneshot::Receiver<InboundMessage>, Arc<Transport>)>,
}

impl PendingReply {
    fn failed() -> Self {
        Self {
            id: 0,
            sent: false,
            waiter: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Wait for the correlated response (or just report delivery for
    /// fire-and-forget sends). Never blocks past `REQUEST_TIMEOUT`.
    pub async fn block_until_done(mut self) -> ReplyOutcome {
        let Some((rx, transport)) = self.waiter.take() else {
            return ReplyOutcome {
                success: self.sent,
                response: None,
            };
        };
        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(response)) => ReplyOutcome {
                success: true,
                response: Some(response),
            },
            // Sender dropped: the link was torn down under us.
            Ok(Err(_)) => ReplyOutcome {
                success: false,
                response: None,
            },
            Err(_) => {
                transport.forget(self.id);
                ReplyOutcome {
                    success: false,
                    response: None,
                }
            }
        }
    }
}

/// Result of a blocking request.
pub struct ReplyOutcome {
    pub success: bool,
    pub response: Option<InboundMessage>,
}

impl ReplyOutcome {
    pub fn payload(&self) -> Option<&Payload> {
        self.response.as_ref().map(|msg| &msg.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_transport() -> Arc<Transport> {
        let (events, _events_rx) = mpsc::unbounded_channel();
        Transport::new(events)
    }

    fn insert_peer(transport: &Transport, addr: &NodeDefinition) {
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = transport.next_link.fetch_add(1, Ordering::Relaxed);
        transport.peers.lock().unwrap().insert(
            addr.clone(),
            PeerEntry {
                link,
                outbound: tx,
                node_type: None,
                state: PeerState::Handshaking,
            },
        );
    }

    #[test]
    fn rename_moves_the_entry() {
        let transport = test_transport();
        let ephemeral = NodeDefinition::new("127.0.0.1", 49152);
        let canonical = NodeDefinition::new("alpha", 5100);
        insert_peer(&transport, &ephemeral);

        assert!(transport.rename(&ephemeral, &canonical));
        assert!(!transport.has_peer(&ephemeral));
        assert!(transport.has_peer(&canonical));
        assert_eq!(transport.peer_count(), 1);
    }

    #[test]
    fn rename_keeps_the_first_connection_on_collision() {
        let transport = test_transport();
        let canonical = NodeDefinition::new("alpha", 5100);
        let newcomer = NodeDefinition::new("127.0.0.1", 49153);
        insert_peer(&transport, &canonical);
        insert_peer(&transport, &newcomer);
        assert_eq!(transport.peer_count(), 2);

        assert!(!transport.rename(&newcomer, &canonical));
        // The canonical entry survives; the duplicate is gone entirely.
        assert!(transport.has_peer(&canonical));
        assert!(!transport.has_peer(&newcomer));
        assert_eq!(transport.peer_count(), 1);
    }

    #[test]
    fn handshaking_peers_have_no_type() {
        let transport = test_transport();
        let addr = NodeDefinition::new("alpha", 5100);
        insert_peer(&transport, &addr);
        assert_eq!(transport.peer_type(&addr), None);
        assert!(transport.peers_of_type(NodeType::Controller).is_empty());

        transport.mark_established(&addr, NodeType::Controller);
        assert_eq!(transport.peer_type(&addr), Some(NodeType::Controller));
        assert_eq!(transport.peers_of_type(NodeType::Controller), vec![addr]);
    }

    #[tokio::test]
    async fn send_to_missing_peer_fails_without_waiting() {
        let transport = test_transport();
        let outcome = transport
            .send_message(
                &NodeDefinition::new("ghost", 1),
                &Payload::VotingRequest,
                true,
            )
            .block_until_done()
            .await;
        assert!(!outcome.success);
        assert!(outcome.response.is_none());
        assert!(transport.pending.lock().unwrap().is_empty());
    }
}
