//! Node wiring: clock, write barrier, record store and dispatcher driven by a pulse source.

use std::sync::Arc;

use rand::RngCore;
use tokio::sync::mpsc;

use crate::app::records::{RecordReply, RecordRequest, RecordStore};
use crate::barrier::WriteBarrier;
use crate::config::Configuration;
use crate::dispatcher::{Dispatcher, Request};
use crate::epoch::{Epoch, EpochClock};
use crate::node::shutdown::{ShutdownHandle, ShutdownManager};
use crate::node::ticker::{PulseInfo, PulseTicker};

pub mod shutdown;
pub mod ticker;

const PULSE_CHANNEL_SIZE: usize = 16;
const WORKLOAD_VALUE_SIZE: usize = 32;

pub type RecordDispatcher = Dispatcher<RecordRequest, RecordReply>;

#[derive(Clone)]
pub struct NodeHandle {
    /// Entry point for requests
    pub dispatcher: RecordDispatcher,
    pub store: RecordStore,
    pub barrier: WriteBarrier,
    /// Node shutdown handle
    pub shutdown: ShutdownHandle,
}

impl NodeHandle {
    /// Moves the node to `epoch`.
    ///
    /// The open epoch is closed first and all its in-flight writes are waited for. Then the new
    /// epoch is opened for writes and only after that the dispatcher is told about it, so a
    /// future flow woken by the pulse always finds its epoch open.
    pub async fn change_pulse(&self, epoch: Epoch) -> anyhow::Result<()> {
        let current = self.dispatcher.current_epoch();
        if epoch <= current {
            log::warn!("Ignoring pulse {epoch}, current epoch is {current}");
            return Ok(());
        }

        if let Some(open) = self.barrier.open_epoch() {
            log::debug!(
                "Closing epoch {open}, waiting for {} writes",
                self.barrier.active_leases()
            );
            self.barrier.close_and_wait(open).await?;
            log::info!(
                "Epoch {open} closed with {} records",
                self.store.records_in(open)
            );
        }

        self.barrier.open(epoch)?;
        self.dispatcher.change_pulse(epoch);
        log::info!("Epoch {epoch} open");
        Ok(())
    }
}

pub struct Node {
    config: Configuration,
    handle: NodeHandle,
    shutdown_manager: Option<ShutdownManager>,
}

impl Node {
    pub fn new(config: Configuration) -> anyhow::Result<Node> {
        let first_epoch = config.node.first_epoch;
        log::info!("Creating node {} at epoch {first_epoch}", config.node.name);

        let clock = Arc::new(EpochClock::new(first_epoch));
        let barrier = WriteBarrier::new();
        barrier.open(first_epoch)?;

        let store = RecordStore::new(barrier.clone());
        let dispatcher = Dispatcher::new(
            clock.clone(),
            store.present_handle(),
            store.future_handle(clock),
            &config.flow,
        );

        let (shutdown_manager, shutdown) = ShutdownManager::init();
        let handle = NodeHandle {
            dispatcher,
            store,
            barrier,
            shutdown,
        };

        Ok(Node {
            config,
            handle,
            shutdown_manager: Some(shutdown_manager),
        })
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    pub async fn change_pulse(&self, epoch: Epoch) -> anyhow::Result<()> {
        self.handle.change_pulse(epoch).await
    }

    /// Main loop of the node. Applies pulses from the local ticker until shutdown is requested.
    pub async fn run(mut self) {
        log::info!("Starting node {}", self.config.node.name);

        let Some(mut shutdown_manager) = self.shutdown_manager.take() else {
            log::error!("Node {} is already running", self.config.node.name);
            return;
        };

        let (pulses_tx, mut pulses_rcv) = mpsc::channel(PULSE_CHANNEL_SIZE);
        let ticker = PulseTicker::new(&self.config.pulse, self.handle.dispatcher.current_epoch());
        let ticker_handle = ticker.spawn(pulses_tx, shutdown_manager.subscribe());
        shutdown_manager.add_handle(ticker_handle);

        loop {
            tokio::select! {
                Some(pulse) = pulses_rcv.recv() => {
                    if let Err(err) = self.on_pulse(pulse).await {
                        log::error!("Error processing pulse {}: {err:?}", pulse.epoch);
                    }
                }

                _ = shutdown_manager.external_shutdown.recv() => {
                    log::info!("Shutting down node {}", self.config.node.name);
                    shutdown_manager.stop().await;
                    break;
                }
            }
        }
    }

    async fn on_pulse(&self, pulse: PulseInfo) -> anyhow::Result<()> {
        log::debug!("Pulse {} at {}", pulse.epoch, pulse.timestamp);
        self.change_pulse(pulse.epoch).await?;
        self.generate_workload(pulse.epoch);
        Ok(())
    }

    fn generate_workload(&self, epoch: Epoch) {
        let requests = self.config.workload.requests_per_pulse;
        if requests == 0 {
            return;
        }
        log::debug!("Generating {requests} writes for epoch {epoch}");

        let mut rng = rand::thread_rng();
        for _ in 0..requests {
            let mut value = vec![0u8; WORKLOAD_VALUE_SIZE];
            rng.fill_bytes(&mut value);
            let request = Request::new(
                epoch,
                RecordRequest::Put {
                    key: uuid::Uuid::new_v4().to_string(),
                    value,
                },
            );
            self.handle.dispatcher.spawn(request);
        }
    }
}
