use std::sync::Arc;

use tokio::sync::watch;

/// Broadcasts pulse notifications to every live flow.
///
/// A pulse is only a hint. Flows observe it cooperatively, nothing is aborted.
#[derive(Clone, Debug)]
pub struct PulseController {
    generation: Arc<watch::Sender<u64>>,
}

impl PulseController {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            generation: Arc::new(generation),
        }
    }

    pub fn pulse(&self) {
        self.generation
            .send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Number of flows which are still subscribed, including orphaned ones whose caller timed out.
    pub fn live_flows(&self) -> usize {
        self.generation.receiver_count()
    }

    pub(crate) fn subscribe(&self) -> PulseSignal {
        let receiver = self.generation.subscribe();
        let started_at = *receiver.borrow();
        PulseSignal {
            receiver,
            started_at,
        }
    }
}

impl Default for PulseController {
    fn default() -> Self {
        Self::new()
    }
}

/// Flow side of [PulseController].
#[derive(Debug)]
pub(crate) struct PulseSignal {
    receiver: watch::Receiver<u64>,
    started_at: u64,
}

impl PulseSignal {
    /// True if at least one pulse happened since subscription.
    pub(crate) fn is_stale(&self) -> bool {
        *self.receiver.borrow() != self.started_at
    }

    /// Resolves on the next pulse which this signal hasn't seen yet.
    /// Never resolves if the controller is gone.
    pub(crate) async fn changed(&mut self) {
        if self.receiver.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}
