//! Periodic liveness loop: reconnect missing controller replicas and stand
//! for election while no primary is known.
//!
//! Each iteration sleeps for a fresh uniform-random interval so replicas that
//! all observed the same network event do not stampede into synchronized
//! elections.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::controller::Controller;
use crate::{election, join};

pub(crate) fn spawn(controller: Arc<Controller>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(next_delay(&controller)).await;
            if !controller.is_running() {
                break;
            }
            reconcile_once(&controller).await;
            if !controller.is_running() {
                break;
            }
        }
        tracing::debug!(node = %controller.local(), "reconciler stopped");
    });
}

fn next_delay(controller: &Controller) -> Duration {
    let min = controller.settings().reconcile_min.as_millis() as u64;
    let max = controller.settings().reconcile_max.as_millis() as u64;
    let millis = if min >= max {
        min
    } else {
        rand::thread_rng().gen_range(min..=max)
    };
    Duration::from_millis(millis)
}

async fn reconcile_once(controller: &Arc<Controller>) {
    for peer in controller.other_controllers().cloned().collect::<Vec<_>>() {
        if controller.transport.has_peer(&peer) {
            continue;
        }
        match join::connect_to_controller(controller, &peer).await {
            join::ConnectOutcome::Joined => {}
            join::ConnectOutcome::Unreachable => {
                tracing::debug!(peer = %peer, "controller still unreachable");
            }
            join::ConnectOutcome::Rejected(reason) => {
                controller.fail_fatal(anyhow::anyhow!(
                    "controller {peer} rejected join: {reason}"
                ));
                return;
            }
        }
    }
    if controller.primary().is_none() {
        election::initiate_voting(controller).await;
    }
}
