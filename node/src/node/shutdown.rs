use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

pub(crate) struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    pub(crate) external_shutdown: mpsc::UnboundedReceiver<()>,
    handles: Vec<JoinHandle<anyhow::Result<()>>>,
}

/// Task side of the shutdown signal.
pub(crate) struct Shutdown {
    shutdown_signal_rcv: broadcast::Receiver<()>,
}

impl Shutdown {
    /// Resolves when shutdown starts. A dropped manager counts as shutdown.
    pub(crate) async fn recv(&mut self) {
        let _ = self.shutdown_signal_rcv.recv().await;
    }
}

#[derive(Clone)]
pub struct ShutdownHandle {
    external_shutdown: mpsc::UnboundedSender<()>,
}

impl ShutdownHandle {
    /// Asks the node to stop. The node signals all its tasks and waits for them to finish.
    pub fn shutdown(&self) {
        if self.external_shutdown.send(()).is_err() {
            log::warn!("Node is already stopped");
        }
    }
}

impl ShutdownManager {
    pub(crate) fn init() -> (ShutdownManager, ShutdownHandle) {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (external_tx, external_rcv) = mpsc::unbounded_channel();
        let handle = ShutdownHandle {
            external_shutdown: external_tx,
        };
        let manager = Self {
            shutdown_tx,
            external_shutdown: external_rcv,
            handles: vec![],
        };
        (manager, handle)
    }

    pub(crate) async fn stop(self) {
        log::info!("Starting node shutdown");
        if self.shutdown_tx.send(()).is_err() {
            log::debug!("No tasks subscribed to shutdown");
        }
        log::info!("Waiting for tasks to finish");
        for handle in self.handles {
            match handle.await {
                Ok(Ok(())) => log::info!("Task finished successfully"),
                Ok(Err(err)) => log::error!("Task finished with error: {err}"),
                Err(err) => log::error!("Task failed to join: {err}"),
            }
        }
    }

    pub(crate) fn subscribe(&self) -> Shutdown {
        Shutdown {
            shutdown_signal_rcv: self.shutdown_tx.subscribe(),
        }
    }

    pub(crate) fn add_handle(&mut self, handle: JoinHandle<anyhow::Result<()>>) {
        self.handles.push(handle);
    }
}
