use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::PulseConfiguration;
use crate::epoch::Epoch;
use crate::node::shutdown::Shutdown;
use crate::utilities::time::PulseTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseInfo {
    pub epoch: Epoch,
    /// Unix time in milliseconds when the pulse was emitted.
    pub timestamp: u64,
}

/// Local stand-in for the consensus pulse source. Emits `last + step` every interval.
pub(crate) struct PulseTicker {
    interval: Duration,
    step: u32,
    last: Epoch,
}

impl PulseTicker {
    pub(crate) fn new(config: &PulseConfiguration, last: Epoch) -> Self {
        Self {
            interval: config.interval(),
            step: config.step.max(1),
            last,
        }
    }

    pub(crate) fn next_pulse(&mut self) -> Option<PulseInfo> {
        let epoch = self.last.checked_add(self.step)?;
        self.last = epoch;
        Some(PulseInfo {
            epoch,
            timestamp: PulseTime::now(),
        })
    }

    pub(crate) fn spawn(
        mut self,
        pulses: mpsc::Sender<PulseInfo>,
        mut shutdown: Shutdown,
    ) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            // First tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(pulse) = self.next_pulse() else {
                            anyhow::bail!("Epoch counter exhausted after {}", self.last);
                        };
                        log::debug!("New pulse {}", pulse.epoch);
                        if pulses.send(pulse).await.is_err() {
                            log::info!("Pulse receiver closed, stopping ticker");
                            return Ok(());
                        }
                    }
                    _ = shutdown.recv() => {
                        log::info!("Stopping pulse ticker");
                        return Ok(());
                    }
                }
            }
        })
    }
}
