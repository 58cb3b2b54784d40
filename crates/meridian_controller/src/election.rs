//! Leader election: quorum checks, the vote exchange, and primary
//! announcements.
//!
//! A candidate only stands when no primary is known and a strict majority of
//! the configured controller set is reachable. Responders rank every
//! controller they can poll by its last-primary-message-id high-water mark;
//! the most recently informed replica wins, with ties broken by ascending
//! connection name so every responder reaches the same choice.

use std::sync::Arc;

use crate::controller::Controller;
use crate::node::{NodeDefinition, NodeType};
use crate::transport::InboundMessage;
use crate::wire::{Payload, VotingResponse};

/// Strict-majority precondition over the configured controller set: this
/// replica plus every configured peer currently established as a controller.
pub(crate) fn quorum_holds(controller: &Controller) -> bool {
    let total = controller.controllers.len();
    let active = 1 + controller
        .other_controllers()
        .filter(|peer| controller.transport.peer_type(peer) == Some(NodeType::Controller))
        .count();
    active > total / 2
}

/// Pick the election winner from collected `(peer, last_primary_message_id)`
/// pairs: highest id first, ties broken by ascending connection name.
pub(crate) fn elect_winner(candidates: &[(NodeDefinition, u32)]) -> Option<&NodeDefinition> {
    candidates
        .iter()
        .max_by(|(a_node, a_id), (b_node, b_id)| {
            a_id.cmp(b_id)
                .then_with(|| b_node.connection_name().cmp(&a_node.connection_name()))
        })
        .map(|(node, _)| node)
}

/// Stand for primary. Succeeds only when every received `VotingResponse`
/// approves and at least one arrived; non-responses are not votes.
pub(crate) async fn initiate_voting(controller: &Arc<Controller>) {
    if controller.primary().is_some() {
        return;
    }
    if !quorum_holds(controller) {
        tracing::info!("not initiating voting: no controller quorum");
        return;
    }
    tracing::info!(node = %controller.local, "initiating primary voting");

    let mut received = 0usize;
    let mut approvals = 0usize;
    for peer in controller.other_controllers() {
        let outcome = controller
            .transport
            .send_message(peer, &Payload::VotingRequest, true)
            .block_until_done()
            .await;
        match outcome.payload() {
            Some(Payload::VotingResponse(vote)) => {
                received += 1;
                if vote.answer {
                    approvals += 1;
                } else {
                    tracing::info!(peer = %peer, "vote denied");
                }
            }
            _ => tracing::debug!(peer = %peer, "no voting response"),
        }
    }

    if received == 0 || approvals != received {
        tracing::info!(received, approvals, "voting lost");
        return;
    }
    if let Some(existing) = controller.primary() {
        tracing::info!(primary = %existing, "primary discovered during voting");
        return;
    }

    controller.set_primary(Some(controller.local.clone()));
    tracing::info!(node = %controller.local, "elected self as primary");
    for peer in controller.other_controllers() {
        let _ = controller
            .transport
            .send_message(peer, &Payload::PrimaryAnnouncement, false);
    }
}

/// Responder side of a `VotingRequest`: deny outright when a primary is
/// already known, otherwise poll every other configured controller for its
/// high-water mark and approve only the deterministic winner.
pub(crate) async fn handle_voting_request(controller: &Arc<Controller>, msg: &InboundMessage) {
    let answer = if controller.primary().is_some() {
        false
    } else {
        let mut candidates = Vec::new();
        for peer in controller.other_controllers() {
            let outcome = controller
                .transport
                .send_message(peer, &Payload::LastPrimaryMessageIdRequest, true)
                .block_until_done()
                .await;
            if let Some(Payload::LastPrimaryMessageIdResponse(response)) = outcome.payload() {
                candidates.push((peer.clone(), response.last_primary_message_id));
            }
        }
        let winner = elect_winner(&candidates);
        tracing::debug!(
            requester = %msg.from,
            winner = ?winner.map(|w| w.connection_name()),
            polled = candidates.len(),
            "evaluated voting request"
        );
        winner == Some(&msg.from)
    };
    let _ = controller.transport.send_reply(
        msg,
        &Payload::VotingResponse(VotingResponse { answer }),
        false,
    );
}

/// A controller announced itself primary; adopt it. If our own candidacy is
/// mid-flight it will observe the new primary and defer.
pub(crate) fn handle_primary_announcement(controller: &Arc<Controller>, msg: &InboundMessage) {
    tracing::info!(primary = %msg.from, "primary announced");
    controller.set_primary(Some(msg.from.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeDefinition {
        NodeDefinition::new(name, 5100)
    }

    #[test]
    fn winner_is_highest_id() {
        let candidates = vec![(node("a"), 3), (node("b"), 9), (node("c"), 4)];
        assert_eq!(elect_winner(&candidates), Some(&node("b")));
    }

    #[test]
    fn ties_break_by_ascending_connection_name() {
        let candidates = vec![(node("c"), 7), (node("a"), 7), (node("b"), 7)];
        assert_eq!(elect_winner(&candidates), Some(&node("a")));

        let mixed = vec![(node("c"), 7), (node("a"), 2), (node("b"), 7)];
        assert_eq!(elect_winner(&mixed), Some(&node("b")));
    }

    #[test]
    fn no_candidates_means_no_winner() {
        assert_eq!(elect_winner(&[]), None);
    }
}
