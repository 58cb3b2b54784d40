//! Controller node state and the message dispatch loop.
//!
//! One `Controller` lives for the whole process. The transport surfaces
//! decoded messages and connection-loss events to the dispatch loop here;
//! each inbound request is handled on its own task so handlers that issue
//! nested blocking requests (voting polls, chunk-list broadcasts, database
//! creation) can never starve the dispatcher.

use std::net::SocketAddr;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::chunk::ChunkMap;
use crate::config::ControllerSettings;
use crate::join;
use crate::node::{NodeDefinition, NodeType};
use crate::transport::{InboundMessage, Transport, TransportEvent};
use crate::wire::{
    ChunkListUpdate, ChunkMerge, ChunkSplit, DataOperationResult, DataOutcome,
    LastPrimaryMessageIdResponse, NodeList, Payload,
};
use crate::{election, reconciler};

pub struct Controller {
    pub(crate) settings: ControllerSettings,
    pub(crate) local: NodeDefinition,
    /// Configured controller replica set, immutable after startup.
    pub(crate) controllers: Vec<NodeDefinition>,
    pub(crate) primary: Mutex<Option<NodeDefinition>>,
    /// High-water mark of message ids seen from the current primary.
    pub(crate) last_primary_message_id: AtomicU32,
    pub(crate) chunk_map: ChunkMap,
    pub(crate) transport: Arc<Transport>,
    pub(crate) running: AtomicBool,
    fatal: mpsc::UnboundedSender<anyhow::Error>,
}

impl Controller {
    pub fn local(&self) -> &NodeDefinition {
        &self.local
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn primary(&self) -> Option<NodeDefinition> {
        self.primary.lock().unwrap().clone()
    }

    pub fn is_primary(&self) -> bool {
        self.primary.lock().unwrap().as_ref() == Some(&self.local)
    }

    pub fn last_primary_message_id(&self) -> u32 {
        self.last_primary_message_id.load(Ordering::Relaxed)
    }

    pub async fn chunk_snapshot(&self) -> Vec<crate::chunk::ChunkDefinition> {
        self.chunk_map.snapshot().await
    }

    pub fn peer_list(&self) -> Vec<(NodeDefinition, Option<NodeType>)> {
        self.transport.list_peers()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub(crate) fn other_controllers(&self) -> impl Iterator<Item = &NodeDefinition> {
        self.controllers.iter().filter(move |c| **c != self.local)
    }

    /// Install a new primary (or none). Every change restarts the
    /// message-id high-water mark.
    pub(crate) fn set_primary(&self, next: Option<NodeDefinition>) {
        let mut primary = self.primary.lock().unwrap();
        if *primary == next {
            return;
        }
        *primary = next;
        self.last_primary_message_id.store(0, Ordering::Relaxed);
    }

    /// Report an unrecoverable configuration error; the run loop stops the
    /// node with this error.
    pub(crate) fn fail_fatal(&self, err: anyhow::Error) {
        let _ = self.fatal.send(err);
    }

    async fn handle_message(self: Arc<Self>, msg: InboundMessage) {
        tracing::debug!(peer = %msg.from, kind = msg.payload.kind(), id = msg.id, "inbound message");
        match msg.payload.clone() {
            Payload::JoinAttempt(attempt) => join::handle_join_attempt(&self, &msg, &attempt).await,
            Payload::VotingRequest => election::handle_voting_request(&self, &msg).await,
            Payload::LastPrimaryMessageIdRequest => {
                let response = LastPrimaryMessageIdResponse {
                    last_primary_message_id: self.last_primary_message_id(),
                };
                let _ = self.transport.send_reply(
                    &msg,
                    &Payload::LastPrimaryMessageIdResponse(response),
                    false,
                );
            }
            Payload::PrimaryAnnouncement => election::handle_primary_announcement(&self, &msg),
            Payload::ChunkListUpdate(update) => self.handle_chunk_list_update(&msg, update).await,
            Payload::ChunkSplit(split) => self.handle_chunk_split(&msg, &split).await,
            Payload::ChunkMerge(merge) => self.handle_chunk_merge(&msg, &merge).await,
            Payload::DataOperation(_) => self.handle_data_operation(&msg).await,
            Payload::DatabaseCreate => {
                tracing::warn!(peer = %msg.from, "database create addressed to a controller; ignoring");
            }
            Payload::JoinSuccess(_)
            | Payload::JoinFailure(_)
            | Payload::Acknowledgement
            | Payload::VotingResponse(_)
            | Payload::LastPrimaryMessageIdResponse(_)
            | Payload::DataOperationResult(_)
            | Payload::NodeList(_) => {
                // Normally consumed by the correlation table; a stray copy
                // means the waiter gave up first.
                tracing::debug!(peer = %msg.from, kind = msg.payload.kind(), "uncorrelated response dropped");
            }
        }
    }

    async fn handle_chunk_list_update(&self, msg: &InboundMessage, update: ChunkListUpdate) {
        if self.is_primary() {
            tracing::warn!(peer = %msg.from, "chunk list update received while primary; ignoring");
        } else {
            self.chunk_map.replace(update.chunks).await;
        }
        if msg.waiting_for_response {
            let _ = self
                .transport
                .send_reply(msg, &Payload::Acknowledgement, false);
        }
    }

    async fn handle_chunk_split(&self, msg: &InboundMessage, split: &ChunkSplit) {
        let mutated = if self.is_primary() {
            let applied = self
                .chunk_map
                .apply_split(
                    &split.start1,
                    &split.end1,
                    &split.start2,
                    &split.end2,
                    msg.from.clone(),
                )
                .await;
            if !applied {
                tracing::warn!(peer = %msg.from, "split names no current chunk; stale view acknowledged");
            }
            applied
        } else {
            tracing::warn!(peer = %msg.from, "chunk split received by non-primary; acknowledged without effect");
            false
        };
        let _ = self
            .transport
            .send_reply(msg, &Payload::Acknowledgement, false);
        if mutated {
            self.broadcast_chunk_list().await;
        }
    }

    async fn handle_chunk_merge(&self, msg: &InboundMessage, merge: &ChunkMerge) {
        let mutated = if self.is_primary() {
            let applied = self
                .chunk_map
                .apply_merge(&merge.start, &merge.end, msg.from.clone())
                .await;
            if !applied {
                tracing::warn!(peer = %msg.from, "merge names no current chunk; stale view acknowledged");
            }
            applied
        } else {
            tracing::warn!(peer = %msg.from, "chunk merge received by non-primary; acknowledged without effect");
            false
        };
        let _ = self
            .transport
            .send_reply(msg, &Payload::Acknowledgement, false);
        if mutated {
            self.broadcast_chunk_list().await;
        }
    }

    /// Forward a data operation from a non-query client to the first
    /// connected query node and relay its answer.
    async fn handle_data_operation(&self, msg: &InboundMessage) {
        if self.transport.peer_type(&msg.from) == Some(NodeType::Query) {
            tracing::warn!(peer = %msg.from, "query node sent a data operation to a controller; dropping");
            return;
        }
        let failed = || {
            Payload::DataOperationResult(DataOperationResult {
                outcome: DataOutcome::FailedMessage,
                message: "Could not reach a query node.".to_string(),
            })
        };
        let queries = self.transport.peers_of_type(NodeType::Query);
        let reply = match queries.first() {
            None => failed(),
            Some(query) => {
                let outcome = self
                    .transport
                    .send_message(query, &msg.payload, true)
                    .block_until_done()
                    .await;
                match outcome.response {
                    Some(response) => response.payload,
                    None => failed(),
                }
            }
        };
        let _ = self.transport.send_reply(msg, &reply, false);
    }

    async fn handle_connection_lost(
        &self,
        addr: NodeDefinition,
        node_type: Option<NodeType>,
    ) {
        tracing::info!(peer = %addr, node_type = ?node_type, "connection lost");
        match node_type {
            Some(NodeType::Controller) => {
                if self.primary() == Some(addr.clone()) {
                    tracing::warn!(peer = %addr, "primary controller lost");
                    self.set_primary(None);
                }
                if self.primary().is_some() && !election::quorum_holds(self) {
                    tracing::warn!("controller quorum lost; clearing primary");
                    self.set_primary(None);
                }
            }
            Some(NodeType::Storage) => {
                let removed = self.chunk_map.remove_owner(&addr).await;
                if removed > 0 {
                    tracing::warn!(peer = %addr, removed, "storage node lost; its chunks dropped");
                    if self.is_primary() {
                        self.broadcast_chunk_list().await;
                    }
                }
            }
            _ => {}
        }
    }

    /// Send the current chunk list to every connected controller and query
    /// peer, serially and awaited. The chunk-map lock stays held for the
    /// whole round so the list cannot change mid-broadcast; the duration is
    /// bounded by peer count times the request timeout. Non-primaries no-op.
    pub(crate) async fn broadcast_chunk_list(&self) {
        if !self.is_primary() {
            return;
        }
        let chunks = self.chunk_map.lock().await;
        let update = Payload::ChunkListUpdate(ChunkListUpdate {
            chunks: chunks.clone(),
        });
        let mut targets = self.transport.peers_of_type(NodeType::Controller);
        targets.extend(self.transport.peers_of_type(NodeType::Query));
        for peer in targets {
            let outcome = self
                .transport
                .send_message(&peer, &update, true)
                .block_until_done()
                .await;
            if !outcome.success {
                tracing::warn!(peer = %peer, "chunk list update not acknowledged");
            }
        }
    }

    /// Send the list of connected `of`-type nodes to each recipient.
    /// Primary-only, like every broadcast.
    pub(crate) async fn send_node_list(&self, of: NodeType, recipients: &[NodeDefinition]) {
        if !self.is_primary() {
            return;
        }
        let payload = Payload::NodeList(NodeList {
            node_type: of,
            nodes: self.transport.peers_of_type(of),
        });
        for peer in recipients {
            let _ = self.transport.send_message(peer, &payload, false);
        }
    }
}

/// Build the node, perform the startup join, and spawn the run loop.
///
/// Fatal configuration errors (self missing from the connection string, a
/// rejected startup join) either return here or resolve the run task with an
/// error; transport-level failures never do.
pub async fn launch<F>(
    settings: ControllerSettings,
    shutdown: F,
) -> anyhow::Result<(Arc<Controller>, JoinHandle<anyhow::Result<()>>)>
where
    F: std::future::Future<Output = std::io::Result<()>> + Send + 'static,
{
    let controllers = settings.validate()?;
    let local = settings.self_node();

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
    let transport = Transport::new(events_tx);
    let listen_addr: SocketAddr = ([0, 0, 0, 0], settings.port).into();
    let accept_task = transport
        .listen(listen_addr)
        .await
        .context("start controller listener")?;

    let controller = Arc::new(Controller {
        settings,
        local: local.clone(),
        controllers,
        primary: Mutex::new(None),
        last_primary_message_id: AtomicU32::new(0),
        chunk_map: ChunkMap::new(),
        transport: Arc::clone(&transport),
        running: AtomicBool::new(true),
        fatal: fatal_tx,
    });

    // Track the primary's id high-water mark across every inbound message,
    // correlated responses included.
    let watcher: Weak<Controller> = Arc::downgrade(&controller);
    transport.set_inspector(Box::new(move |msg: &InboundMessage| {
        if let Some(controller) = watcher.upgrade() {
            if controller.primary.lock().unwrap().as_ref() == Some(&msg.from) {
                controller
                    .last_primary_message_id
                    .fetch_max(msg.id, Ordering::Relaxed);
            }
        }
    }));

    if controller.controllers.len() == 1 {
        tracing::info!(node = %local, "sole configured controller; assuming primary");
        controller.set_primary(Some(local.clone()));
    }

    // Startup join: a rejected join is fatal, an unreachable replica is the
    // reconciler's problem.
    for peer in controller.other_controllers().cloned().collect::<Vec<_>>() {
        match join::connect_to_controller(&controller, &peer).await {
            join::ConnectOutcome::Joined => {}
            join::ConnectOutcome::Unreachable => {
                tracing::warn!(peer = %peer, "controller unreachable during startup; will retry");
            }
            join::ConnectOutcome::Rejected(reason) => {
                transport.shutdown();
                accept_task.abort();
                anyhow::bail!("controller {peer} rejected join: {reason}");
            }
        }
    }

    reconciler::spawn(Arc::clone(&controller));

    let run = Arc::clone(&controller);
    let task = tokio::spawn(async move {
        let mut shutdown = pin!(shutdown);
        let result = loop {
            tokio::select! {
                res = &mut shutdown => {
                    if let Err(err) = res {
                        tracing::warn!(error = ?err, "shutdown signal failed");
                    }
                    break Ok(());
                }
                Some(err) = fatal_rx.recv() => break Err(err),
                event = events_rx.recv() => match event {
                    Some(TransportEvent::Message(msg)) => {
                        let controller = Arc::clone(&run);
                        tokio::spawn(async move {
                            controller.handle_message(msg).await;
                        });
                    }
                    Some(TransportEvent::ConnectionLost { addr, node_type }) => {
                        let controller = Arc::clone(&run);
                        tokio::spawn(async move {
                            controller.handle_connection_lost(addr, node_type).await;
                        });
                    }
                    None => break Ok(()),
                }
            }
        };
        run.running.store(false, Ordering::Relaxed);
        run.transport.shutdown();
        accept_task.abort();
        tracing::info!(node = %run.local, "controller stopped");
        result
    });

    Ok((controller, task))
}

/// Run a controller node until `shutdown` resolves.
pub async fn run_controller_with_shutdown<F>(
    settings: ControllerSettings,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: std::future::Future<Output = std::io::Result<()>> + Send + 'static,
{
    let (_controller, task) = launch(settings, shutdown).await?;
    task.await.context("controller run loop panicked")?
}
