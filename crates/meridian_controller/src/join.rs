//! Peer admission: inbound `JoinAttempt` handling and outbound controller
//! joins.
//!
//! A joining peer announces its type, canonical address, and compatibility
//! settings. The responder validates per type, rebinds the transport entry
//! from the ephemeral accept-side address to the canonical one, replies
//! `JoinSuccess` and waits for the acknowledgement before pushing cluster
//! state at the newcomer.

use std::sync::Arc;

use serde_json::Map;

use crate::controller::Controller;
use crate::node::{NodeDefinition, NodeType};
use crate::transport::InboundMessage;
use crate::wire::{
    JoinAttempt, JoinFailure, JoinSuccess, Payload, PeerSettings, DOC_MAX_CHUNK_ITEM_COUNT,
};

pub(crate) enum ConnectOutcome {
    Joined,
    /// Transport-level failure; the reconciler retries later.
    Unreachable,
    /// The peer refused us: this node is misconfigured. Fatal.
    Rejected(String),
}

/// Open a link to a configured controller replica and run the initiator side
/// of the join handshake.
pub(crate) async fn connect_to_controller(
    controller: &Arc<Controller>,
    peer: &NodeDefinition,
) -> ConnectOutcome {
    if let Err(err) = controller.transport.connect(peer).await {
        tracing::debug!(peer = %peer, error = ?err, "controller connect failed");
        return ConnectOutcome::Unreachable;
    }
    let attempt = Payload::JoinAttempt(JoinAttempt {
        node_type: NodeType::Controller,
        name: controller.local.host.clone(),
        port: controller.local.port,
        settings: PeerSettings::Document(controller.settings.compatibility()),
        is_primary_claim: controller.is_primary(),
    });
    let outcome = controller
        .transport
        .send_message(peer, &attempt, true)
        .block_until_done()
        .await;
    let Some(response) = outcome.response else {
        tracing::warn!(peer = %peer, "join attempt timed out");
        controller.transport.close(peer);
        return ConnectOutcome::Unreachable;
    };
    match &response.payload {
        Payload::JoinSuccess(success) => {
            let _ = controller
                .transport
                .send_reply(&response, &Payload::Acknowledgement, false);
            controller
                .transport
                .mark_established(peer, NodeType::Controller);
            if success.primary_controller {
                controller.set_primary(Some(peer.clone()));
            }
            tracing::info!(peer = %peer, primary = success.primary_controller, "joined controller");
            ConnectOutcome::Joined
        }
        Payload::JoinFailure(failure) => {
            controller.transport.close(peer);
            ConnectOutcome::Rejected(failure.reason.clone())
        }
        other => {
            tracing::warn!(peer = %peer, kind = other.kind(), "unexpected join response");
            controller.transport.close(peer);
            ConnectOutcome::Unreachable
        }
    }
}

/// Responder side of the admission protocol.
pub(crate) async fn handle_join_attempt(
    controller: &Arc<Controller>,
    msg: &InboundMessage,
    attempt: &JoinAttempt,
) {
    match attempt.node_type {
        NodeType::Controller => admit_controller(controller, msg, attempt).await,
        NodeType::Query => admit_query(controller, msg, attempt).await,
        NodeType::Storage => admit_storage(controller, msg, attempt).await,
        NodeType::Api => admit_api(controller, msg, attempt).await,
        NodeType::Console => admit_console(controller, msg, attempt).await,
    }
}

async fn admit_controller(controller: &Arc<Controller>, msg: &InboundMessage, attempt: &JoinAttempt) {
    let mismatch = match &attempt.settings {
        PeerSettings::Document(theirs) => {
            let ours = controller.settings.compatibility();
            if theirs.connection_string != ours.connection_string {
                Some("connection string differs")
            } else if theirs.max_chunk_item_count != ours.max_chunk_item_count {
                Some("max chunk item count differs")
            } else if theirs.redundant_nodes_per_location != ours.redundant_nodes_per_location {
                Some("redundant nodes per location differs")
            } else {
                None
            }
        }
        _ => Some("controller join carried no settings document"),
    };
    if let Some(reason) = mismatch {
        reject(controller, msg, attempt, reason);
        return;
    }

    let Some(canonical) = admit(controller, msg, attempt, NodeType::Controller) else {
        return;
    };
    if !succeed(controller, &canonical, msg.id, Map::new()).await {
        return;
    }
    if attempt.is_primary_claim {
        tracing::info!(peer = %canonical, "joining controller claims primary");
        controller.set_primary(Some(canonical));
    }
    controller.broadcast_chunk_list().await;
}

async fn admit_query(controller: &Arc<Controller>, msg: &InboundMessage, attempt: &JoinAttempt) {
    if !connection_string_matches(controller, &attempt.settings) {
        reject(controller, msg, attempt, "connection string differs");
        return;
    }
    let Some(canonical) = admit(controller, msg, attempt, NodeType::Query) else {
        return;
    };
    if !succeed(controller, &canonical, msg.id, Map::new()).await {
        return;
    }
    controller
        .send_node_list(NodeType::Storage, &[canonical])
        .await;
    let apis = controller.transport.peers_of_type(NodeType::Api);
    controller.send_node_list(NodeType::Query, &apis).await;
    controller.broadcast_chunk_list().await;
}

async fn admit_storage(controller: &Arc<Controller>, msg: &InboundMessage, attempt: &JoinAttempt) {
    if !connection_string_matches(controller, &attempt.settings) {
        reject(controller, msg, attempt, "connection string differs");
        return;
    }
    let Some(canonical) = admit(controller, msg, attempt, NodeType::Storage) else {
        return;
    };
    // Only the primary hands out the split threshold.
    let mut document = Map::new();
    if controller.is_primary() {
        document.insert(
            DOC_MAX_CHUNK_ITEM_COUNT.to_string(),
            controller.settings.max_chunk_item_count.into(),
        );
    }
    if !succeed(controller, &canonical, msg.id, document).await {
        return;
    }
    let queries = controller.transport.peers_of_type(NodeType::Query);
    controller.send_node_list(NodeType::Storage, &queries).await;

    if controller.is_primary() && controller.chunk_map.is_empty().await {
        bootstrap_database(controller, &canonical).await;
    }
}

async fn admit_api(controller: &Arc<Controller>, msg: &InboundMessage, attempt: &JoinAttempt) {
    let matches = matches!(
        &attempt.settings,
        PeerSettings::Raw(raw) if *raw == controller.settings.connection_string
    );
    if !matches {
        reject(controller, msg, attempt, "connection string differs");
        return;
    }
    let Some(canonical) = admit(controller, msg, attempt, NodeType::Api) else {
        return;
    };
    if !succeed(controller, &canonical, msg.id, Map::new()).await {
        return;
    }
    controller.send_node_list(NodeType::Query, &[canonical]).await;
}

async fn admit_console(controller: &Arc<Controller>, msg: &InboundMessage, attempt: &JoinAttempt) {
    // Consoles are always welcome; no compatibility check, no ack round.
    let Some(canonical) = admit(controller, msg, attempt, NodeType::Console) else {
        return;
    };
    let payload = Payload::JoinSuccess(JoinSuccess {
        primary_controller: controller.is_primary(),
        document: Map::new(),
    });
    let _ = controller
        .transport
        .send_reply_to(&canonical, msg.id, &payload, false);
}

/// Rebind the transport entry to the declared canonical address and classify
/// the peer. Returns `None` when a duplicate join lost to an existing link.
fn admit(
    controller: &Arc<Controller>,
    msg: &InboundMessage,
    attempt: &JoinAttempt,
    node_type: NodeType,
) -> Option<NodeDefinition> {
    let canonical = attempt.canonical();
    if !controller.transport.rename(&msg.from, &canonical) {
        tracing::warn!(peer = %canonical, node_type = %node_type, "duplicate join; keeping existing connection");
        return None;
    }
    controller.transport.mark_established(&canonical, node_type);
    tracing::info!(peer = %canonical, node_type = %node_type, "peer admitted");
    Some(canonical)
}

/// Reply `JoinSuccess` (addressed by the renamed canonical key) and wait for
/// the acknowledgement. A missed ack keeps the peer admitted but skips the
/// post-ack pushes.
async fn succeed(
    controller: &Arc<Controller>,
    canonical: &NodeDefinition,
    request_id: u32,
    document: Map<String, serde_json::Value>,
) -> bool {
    let payload = Payload::JoinSuccess(JoinSuccess {
        primary_controller: controller.is_primary(),
        document,
    });
    let outcome = controller
        .transport
        .send_reply_to(canonical, request_id, &payload, true)
        .block_until_done()
        .await;
    let acked = matches!(outcome.payload(), Some(Payload::Acknowledgement));
    if !acked {
        tracing::warn!(peer = %canonical, "join success was not acknowledged");
    }
    acked
}

fn reject(controller: &Arc<Controller>, msg: &InboundMessage, attempt: &JoinAttempt, reason: &str) {
    tracing::warn!(
        peer = %attempt.canonical(),
        node_type = %attempt.node_type,
        reason,
        "join rejected"
    );
    let failure = Payload::JoinFailure(JoinFailure {
        reason: reason.to_string(),
    });
    let _ = controller.transport.send_reply(msg, &failure, false);
}

fn connection_string_matches(controller: &Arc<Controller>, settings: &PeerSettings) -> bool {
    matches!(
        settings,
        PeerSettings::Document(doc) if doc.connection_string == controller.settings.connection_string
    )
}

/// First storage node of a fresh database: give it the whole key range, ask
/// one storage node to create the database, and either broadcast the new map
/// or roll the speculative chunk back.
async fn bootstrap_database(controller: &Arc<Controller>, owner: &NodeDefinition) {
    if !controller.chunk_map.install_initial(owner.clone()).await {
        return;
    }
    tracing::info!(owner = %owner, "installed initial full-range chunk");

    let mut created = false;
    for node in controller.transport.peers_of_type(NodeType::Storage) {
        let outcome = controller
            .transport
            .send_message(&node, &Payload::DatabaseCreate, true)
            .block_until_done()
            .await;
        if outcome.success && matches!(outcome.payload(), Some(Payload::Acknowledgement)) {
            created = true;
            break;
        }
        tracing::warn!(peer = %node, "database create rejected");
    }

    if created {
        controller.broadcast_chunk_list().await;
    } else {
        controller.chunk_map.clear().await;
        tracing::warn!("database create failed on every storage node; chunk map rolled back");
    }
}
