/// Background workers: replication and crash recovery.
///
/// Workers are tokio tasks owned by a `Workers` handle; there is no
/// global registry. Shutdown is cooperative via a `CancellationToken`
/// checked between cycles, so a worker is never cancelled mid-item.
pub mod recovery;
pub mod replication;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;

pub struct Workers {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    /// Spawn both worker loops against a shared engine.
    pub fn start(engine: Arc<Engine>) -> Self {
        let cancel = CancellationToken::new();
        let handles = vec![
            tokio::spawn(replication::run(engine.clone(), cancel.child_token())),
            tokio::spawn(recovery::run(engine, cancel.child_token())),
        ];
        tracing::info!("Background workers started");
        Self { cancel, handles }
    }

    /// Signal shutdown and wait for both loops to finish their current
    /// cycle and exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
        tracing::info!("Background workers stopped");
    }
}
