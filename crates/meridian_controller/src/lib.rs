//! Controller-plane node for the Meridian sharded database.
//!
//! A fixed set of controller replicas discovers each other from a shared
//! connection string, elects a single primary by quorum vote, admits query,
//! storage, api, and console peers into the cluster, and maintains the chunk
//! map: the authoritative assignment of key ranges to storage nodes, mutated
//! only on the primary and pushed to peers as chunk-list broadcasts.
//!
//! The crate is both the `meridian-controller` binary and an embeddable
//! library: `start_controller` runs a full node inside the calling process,
//! which is how the integration tests drive multi-node clusters over
//! loopback.

pub mod chunk;
pub mod config;
pub mod controller;
pub mod node;
pub mod transport;
pub mod wire;

mod election;
mod join;
mod reconciler;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub use controller::{run_controller_with_shutdown, Controller};

/// A controller node running inside this process.
pub struct ControllerHandle {
    controller: Arc<Controller>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl ControllerHandle {
    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Stop the node and wait for its run loop to finish.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(anyhow::anyhow!("controller task join failed: {err}")),
        }
    }

    /// Whether the run loop already exited (fatal error or shutdown).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run loop to end without requesting shutdown.
    pub async fn join(self) -> anyhow::Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(anyhow::anyhow!("controller task join failed: {err}")),
        }
    }
}

/// Start an embedded controller node, returning once its listener is up and
/// the startup join pass completed.
pub async fn start_controller(
    settings: config::ControllerSettings,
) -> anyhow::Result<ControllerHandle> {
    let (tx, rx) = oneshot::channel::<()>();
    let shutdown = async move {
        let _ = rx.await;
        Ok::<(), std::io::Error>(())
    };
    let (controller, task) = controller::launch(settings, shutdown)
        .await
        .context("launch controller")?;
    Ok(ControllerHandle {
        controller,
        shutdown: Some(tx),
        task,
    })
}
