use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::barrier::{self, WriteBarrier};
use crate::dispatcher::{MakeHandle, Message};
use crate::epoch::{Epoch, EpochClock};
use crate::flow::{handler, FlowContext};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordRequest {
    Put { key: String, value: Vec<u8> },
    Get { key: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordReply {
    Stored { epoch: Epoch, key: String },
    Found { key: String, record: Option<Record> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub epoch: Epoch,
    pub value: Vec<u8>,
}

/// In-memory, epoch versioned key value store.
#[derive(Clone)]
pub struct RecordStore {
    barrier: WriteBarrier,
    /// Versions of each key, ordered by epoch.
    records: Arc<RwLock<HashMap<String, Vec<Record>>>>,
}

impl RecordStore {
    pub fn new(barrier: WriteBarrier) -> Self {
        Self {
            barrier,
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Writes `value` under `epoch`. The write is admitted by the barrier and holds a lease
    /// until it is stored.
    pub fn put(&self, epoch: Epoch, key: String, value: Vec<u8>) -> barrier::Result<()> {
        let mut lease = self.barrier.begin(epoch)?;

        let mut records = self.records.write();
        let versions = records.entry(key).or_default();
        match versions.last_mut() {
            Some(last) if last.epoch == epoch => last.value = value,
            _ => versions.push(Record { epoch, value }),
        }
        drop(records);

        lease.release();
        Ok(())
    }

    /// Latest version of `key` visible at `epoch`.
    pub fn get(&self, epoch: Epoch, key: &str) -> Option<Record> {
        self.records.read().get(key).and_then(|versions| {
            versions
                .iter()
                .rev()
                .find(|record| record.epoch <= epoch)
                .cloned()
        })
    }

    /// Number of keys written in `epoch`.
    pub fn records_in(&self, epoch: Epoch) -> usize {
        self.records
            .read()
            .values()
            .filter(|versions| versions.iter().any(|record| record.epoch == epoch))
            .count()
    }

    pub fn present_handle(&self) -> MakeHandle<RecordRequest, RecordReply> {
        let store = self.clone();
        Arc::new(move |msg: Message<RecordRequest, RecordReply>| {
            let store = store.clone();
            handler(move |ctx| async move { store.process(ctx, msg) })
        })
    }

    /// Handler for requests ahead of the clock. It waits for the pulse which makes the request
    /// current and then processes it as a present one. It gives up when the caller stops
    /// waiting.
    pub fn future_handle(
        &self,
        clock: Arc<EpochClock>,
    ) -> MakeHandle<RecordRequest, RecordReply> {
        let store = self.clone();
        Arc::new(move |msg: Message<RecordRequest, RecordReply>| {
            let store = store.clone();
            let clock = clock.clone();
            handler(move |mut ctx| async move {
                let mut msg = msg;
                while clock.current() < msg.epoch {
                    tokio::select! {
                        _ = ctx.wait_pulse() => {}
                        _ = msg.reply_to.closed() => {
                            log::debug!("Caller gave up on future request for epoch {}", msg.epoch);
                            return Ok(());
                        }
                    }
                }
                store.process(ctx, msg)
            })
        })
    }

    fn process(
        &self,
        ctx: FlowContext,
        msg: Message<RecordRequest, RecordReply>,
    ) -> anyhow::Result<()> {
        let epoch = ctx.epoch();
        let reply = match msg.payload {
            RecordRequest::Put { key, value } => {
                self.put(epoch, key.clone(), value)?;
                log::trace!("Stored {key} in epoch {epoch}");
                RecordReply::Stored { epoch, key }
            }
            RecordRequest::Get { key } => {
                let record = self.get(epoch, &key);
                RecordReply::Found { key, record }
            }
        };
        msg.reply_to.ok(reply);
        Ok(())
    }
}
