//! # Write barrier
//!
//! Per epoch admission control for durable writes. A storage collaborator opens an epoch for
//! writing, takes a [WriteLease] for every mutation it performs and, when the epoch ends, closes
//! the epoch and waits until all leases are released.
//!
//! Epoch lifecycle:
//!
//! ```text
//! Unopened --open--> Open --close_and_wait--> Closing --last lease released--> Closed
//! ```
//!
//! - At most one epoch is `Open` or `Closing` at any time.
//! - Once an epoch is `Closed`, neither it nor any earlier epoch can be opened again.
//! - `open` never closes the previous epoch implicitly. Callers must `close_and_wait` it first.
//! - `begin` only admits writes for the epoch which is currently `Open`. Writes for a later epoch
//!   are rejected as well, they don't advance the barrier.
//!
//! Admission and the switch to `Closing` happen under the same lock, so no lease can be admitted
//! after a closer has started to drain.
//!
//! Draining has no timeout. A leaked lease makes `close_and_wait` wait forever and must be
//! detected by external liveness monitoring.

use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

use crate::epoch::Epoch;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BarrierError {
    /// The epoch is not admitting writes: never opened, already closed or another epoch is open.
    #[error("Write closed for epoch {0}")]
    WriteClosed(Epoch),
}

pub type Result<T> = std::result::Result<T, BarrierError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Unopened,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Closing,
}

/// The epoch which is currently open or being drained.
struct Window {
    epoch: Epoch,
    phase: Phase,
    leases: usize,
    /// Signalled once when `leases` drops to zero while `Closing`.
    drained: Arc<Notify>,
}

impl Window {
    fn open(epoch: Epoch) -> Self {
        Self {
            epoch,
            phase: Phase::Open,
            leases: 0,
            drained: Arc::new(Notify::new()),
        }
    }

    fn is_open_for(&self, epoch: Epoch) -> bool {
        self.epoch == epoch && self.phase == Phase::Open
    }
}

struct BarrierState {
    window: Option<Window>,
    /// Last epoch which reached `Closed`, [Epoch::NONE] if none did.
    last_closed: Epoch,
}

impl BarrierState {
    fn release(&mut self, epoch: Epoch) {
        match self.window.as_mut() {
            Some(window) if window.epoch == epoch => {
                if window.leases == 0 {
                    log::error!("Lease count underflow for epoch {epoch}, this is a bug!");
                    return;
                }
                window.leases -= 1;
                if window.leases == 0 && window.phase == Phase::Closing {
                    log::trace!("Last lease released for closing epoch {epoch}");
                    window.drained.notify_one();
                }
            }
            _ => {
                log::error!("Lease for epoch {epoch} outlived its epoch window, this is a bug!");
            }
        }
    }
}

/// Shared handle to the barrier. Cloning is cheap and all clones refer to the same barrier.
#[derive(Clone)]
pub struct WriteBarrier {
    state: Arc<Mutex<BarrierState>>,
}

impl WriteBarrier {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BarrierState {
                window: None,
                last_closed: Epoch::NONE,
            })),
        }
    }

    /// Opens `epoch` for writing.
    ///
    /// Opening the currently open epoch again is a no-op. Fails if another epoch is open or
    /// closing, or if `epoch` isn't newer than the last closed epoch.
    pub fn open(&self, epoch: Epoch) -> Result<()> {
        if !epoch.is_set() {
            return Err(BarrierError::WriteClosed(epoch));
        }

        let mut state = self.state.lock();
        match &state.window {
            Some(window) if window.is_open_for(epoch) => Ok(()),
            Some(window) => {
                log::debug!(
                    "Can't open epoch {epoch}, epoch {} is {:?}",
                    window.epoch,
                    window.phase
                );
                Err(BarrierError::WriteClosed(epoch))
            }
            None if epoch <= state.last_closed => {
                log::debug!(
                    "Can't open epoch {epoch}, epoch {} is already closed",
                    state.last_closed
                );
                Err(BarrierError::WriteClosed(epoch))
            }
            None => {
                state.window = Some(Window::open(epoch));
                log::debug!("Opened epoch {epoch} for writing");
                Ok(())
            }
        }
    }

    /// Admits one write for `epoch`.
    ///
    /// The returned lease must be released (or dropped) when the write is durable.
    pub fn begin(&self, epoch: Epoch) -> Result<WriteLease> {
        let mut state = self.state.lock();
        match state.window.as_mut() {
            Some(window) if window.is_open_for(epoch) => {
                window.leases += 1;
                Ok(WriteLease {
                    state: self.state.clone(),
                    epoch,
                    released: false,
                })
            }
            _ => Err(BarrierError::WriteClosed(epoch)),
        }
    }

    /// Stops admitting writes for `epoch` and waits until all its leases are released.
    ///
    /// Only one caller can close a given epoch. Everybody else, including callers racing the
    /// first one, gets [BarrierError::WriteClosed].
    ///
    /// If the returned future is dropped before completion the epoch stays `Closing`.
    pub async fn close_and_wait(&self, epoch: Epoch) -> Result<()> {
        let drained = {
            let mut state = self.state.lock();
            match state.window.as_mut() {
                Some(window) if window.is_open_for(epoch) => {
                    window.phase = Phase::Closing;
                    log::debug!(
                        "Closing epoch {epoch}, waiting for {} leases",
                        window.leases
                    );
                    (window.leases > 0).then(|| window.drained.clone())
                }
                _ => return Err(BarrierError::WriteClosed(epoch)),
            }
        };

        if let Some(drained) = drained {
            while !self.is_drained(epoch) {
                drained.notified().await;
            }
        }

        let mut state = self.state.lock();
        state.window = None;
        state.last_closed = epoch;
        log::debug!("Epoch {epoch} closed");
        Ok(())
    }

    pub fn state(&self, epoch: Epoch) -> WriteState {
        let state = self.state.lock();
        match &state.window {
            Some(window) if window.epoch == epoch => match window.phase {
                Phase::Open => WriteState::Open,
                Phase::Closing => WriteState::Closing,
            },
            Some(window) if epoch < window.epoch => WriteState::Closed,
            _ if state.last_closed.is_set() && epoch <= state.last_closed => WriteState::Closed,
            _ => WriteState::Unopened,
        }
    }

    /// Epoch which is `Open` or `Closing`.
    pub fn open_epoch(&self) -> Option<Epoch> {
        self.state.lock().window.as_ref().map(|window| window.epoch)
    }

    /// Number of unreleased leases of the open epoch.
    pub fn active_leases(&self) -> usize {
        self.state
            .lock()
            .window
            .as_ref()
            .map(|window| window.leases)
            .unwrap_or(0)
    }

    fn is_drained(&self, epoch: Epoch) -> bool {
        match self.state.lock().window.as_ref() {
            Some(window) if window.epoch == epoch => window.leases == 0,
            _ => true,
        }
    }
}

impl Default for WriteBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for WriteBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        let (epoch, phase, leases) = match &state.window {
            Some(window) => (Some(window.epoch), Some(window.phase), window.leases),
            None => (None, None, 0),
        };
        f.debug_struct("WriteBarrier")
            .field("epoch", &epoch)
            .field("phase", &phase)
            .field("leases", &leases)
            .field("last_closed", &state.last_closed)
            .finish()
    }
}

/// One admitted write. Released exactly once, either explicitly or when dropped.
pub struct WriteLease {
    state: Arc<Mutex<BarrierState>>,
    epoch: Epoch,
    released: bool,
}

impl WriteLease {
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Releasing an already released lease does nothing.
    pub fn release(&mut self) {
        if self.released {
            log::warn!("Lease for epoch {} released twice", self.epoch);
            return;
        }
        self.released = true;
        self.state.lock().release(self.epoch);
    }
}

impl Drop for WriteLease {
    fn drop(&mut self) {
        if !self.released {
            self.release();
        }
    }
}

impl Debug for WriteLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteLease")
            .field("epoch", &self.epoch)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use rand::Rng;

    use super::*;

    fn epoch(value: u32) -> Epoch {
        Epoch::new(value)
    }

    #[test]
    fn test_open_for_correct_epoch() {
        let barrier = WriteBarrier::new();
        assert!(barrier.open(epoch(1)).is_ok());
        assert_eq!(barrier.state(epoch(1)), WriteState::Open);
        assert_eq!(barrier.open_epoch(), Some(epoch(1)));
    }

    #[test]
    fn test_multiple_open_for_same_epoch() {
        let barrier = WriteBarrier::new();
        assert!(barrier.open(epoch(1)).is_ok());
        assert!(barrier.open(epoch(1)).is_ok());
        assert_eq!(barrier.state(epoch(1)), WriteState::Open);
    }

    #[test]
    fn test_open_previous_epoch() {
        let barrier = WriteBarrier::new();
        barrier.open(epoch(2)).unwrap();

        assert_matches!(barrier.open(epoch(1)), Err(BarrierError::WriteClosed(e)) if e == epoch(1));
    }

    #[test]
    fn test_open_next_epoch_without_closing_current() {
        let barrier = WriteBarrier::new();
        barrier.open(epoch(1)).unwrap();

        assert_matches!(barrier.open(epoch(2)), Err(BarrierError::WriteClosed(_)));
        assert_eq!(barrier.state(epoch(1)), WriteState::Open);
    }

    #[test]
    fn test_open_reserved_epoch() {
        let barrier = WriteBarrier::new();
        assert_matches!(barrier.open(Epoch::NONE), Err(BarrierError::WriteClosed(_)));
    }

    #[tokio::test]
    async fn test_close_correct_epoch() {
        let barrier = WriteBarrier::new();
        barrier.open(epoch(1)).unwrap();

        assert!(barrier.close_and_wait(epoch(1)).await.is_ok());
        assert_eq!(barrier.state(epoch(1)), WriteState::Closed);
        assert_eq!(barrier.open_epoch(), None);
    }

    #[tokio::test]
    async fn test_multiple_close_for_same_epoch() {
        let barrier = WriteBarrier::new();
        barrier.open(epoch(1)).unwrap();
        barrier.close_and_wait(epoch(1)).await.unwrap();

        assert_matches!(
            barrier.close_and_wait(epoch(1)).await,
            Err(BarrierError::WriteClosed(_))
        );
    }

    #[tokio::test]
    async fn test_close_incorrect_epoch() {
        let barrier = WriteBarrier::new();
        barrier.open(epoch(2)).unwrap();

        assert_matches!(
            barrier.close_and_wait(epoch(1)).await,
            Err(BarrierError::WriteClosed(_))
        );
        assert_matches!(
            barrier.close_and_wait(epoch(3)).await,
            Err(BarrierError::WriteClosed(_))
        );
        assert_eq!(barrier.state(epoch(2)), WriteState::Open);
    }

    #[tokio::test]
    async fn test_close_never_opened() {
        let barrier = WriteBarrier::new();
        assert_matches!(
            barrier.close_and_wait(epoch(5)).await,
            Err(BarrierError::WriteClosed(_))
        );
    }

    #[tokio::test]
    async fn test_reopen_after_close() {
        let barrier = WriteBarrier::new();
        barrier.open(epoch(1)).unwrap();
        barrier.close_and_wait(epoch(1)).await.unwrap();

        assert_matches!(barrier.open(epoch(1)), Err(BarrierError::WriteClosed(_)));
        assert!(barrier.open(epoch(2)).is_ok());
    }

    #[test]
    fn test_begin_for_not_opened_epoch() {
        let barrier = WriteBarrier::new();
        assert_matches!(barrier.begin(epoch(1)), Err(BarrierError::WriteClosed(_)));
    }

    #[tokio::test]
    async fn test_begin_for_closed_epoch() {
        let barrier = WriteBarrier::new();
        barrier.open(epoch(1)).unwrap();
        barrier.close_and_wait(epoch(1)).await.unwrap();

        assert_matches!(barrier.begin(epoch(1)), Err(BarrierError::WriteClosed(_)));
    }

    #[test]
    fn test_begin_for_future_epoch_does_not_advance() {
        let barrier = WriteBarrier::new();
        barrier.open(epoch(1)).unwrap();

        assert_matches!(barrier.begin(epoch(2)), Err(BarrierError::WriteClosed(_)));
        assert_eq!(barrier.open_epoch(), Some(epoch(1)));
        assert_eq!(barrier.state(epoch(2)), WriteState::Unopened);
    }

    #[tokio::test]
    async fn test_monotonic_admission() {
        let barrier = WriteBarrier::new();
        barrier.open(epoch(1)).unwrap();
        barrier.close_and_wait(epoch(1)).await.unwrap();
        barrier.open(epoch(3)).unwrap();

        for e in [1, 2] {
            assert_matches!(barrier.begin(epoch(e)), Err(BarrierError::WriteClosed(_)));
            assert_matches!(barrier.open(epoch(e)), Err(BarrierError::WriteClosed(_)));
            assert_eq!(barrier.state(epoch(e)), WriteState::Closed);
        }
        assert!(barrier.begin(epoch(3)).is_ok());
    }

    #[test]
    fn test_lease_release_is_idempotent() {
        let barrier = WriteBarrier::new();
        barrier.open(epoch(1)).unwrap();

        let mut first = barrier.begin(epoch(1)).unwrap();
        let _second = barrier.begin(epoch(1)).unwrap();
        assert_eq!(barrier.active_leases(), 2);
        assert_eq!(first.epoch(), epoch(1));

        first.release();
        first.release();
        assert_eq!(barrier.active_leases(), 1);

        drop(first);
        assert_eq!(barrier.active_leases(), 1);
    }

    #[test]
    fn test_dropped_lease_is_released() {
        let barrier = WriteBarrier::new();
        barrier.open(epoch(1)).unwrap();

        {
            let _lease = barrier.begin(epoch(1)).unwrap();
            assert_eq!(barrier.active_leases(), 1);
        }
        assert_eq!(barrier.active_leases(), 0);
    }

    #[tokio::test]
    async fn test_close_waits_for_outstanding_lease() {
        let barrier = WriteBarrier::new();
        barrier.open(epoch(1)).unwrap();
        let mut lease = barrier.begin(epoch(1)).unwrap();

        let closer = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.close_and_wait(epoch(1)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!closer.is_finished());
        assert_eq!(barrier.state(epoch(1)), WriteState::Closing);

        lease.release();

        let result = tokio::time::timeout(Duration::from_secs(1), closer)
            .await
            .expect("Close didn't finish after last lease was released")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(barrier.state(epoch(1)), WriteState::Closed);
    }

    #[tokio::test]
    async fn test_no_admission_while_draining() {
        let barrier = WriteBarrier::new();
        barrier.open(epoch(1)).unwrap();
        let lease = barrier.begin(epoch(1)).unwrap();

        let closer = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.close_and_wait(epoch(1)).await })
        };
        while barrier.state(epoch(1)) != WriteState::Closing {
            tokio::task::yield_now().await;
        }

        assert_matches!(barrier.begin(epoch(1)), Err(BarrierError::WriteClosed(_)));
        assert_matches!(barrier.open(epoch(1)), Err(BarrierError::WriteClosed(_)));
        assert_matches!(barrier.open(epoch(2)), Err(BarrierError::WriteClosed(_)));

        drop(lease);
        assert!(closer.await.unwrap().is_ok());
        assert!(barrier.open(epoch(2)).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_waits_for_many_leases() {
        let barrier = WriteBarrier::new();
        barrier.open(epoch(1)).unwrap();

        let released = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        for _ in 0..1000 {
            let mut lease = barrier.begin(epoch(1)).unwrap();
            let delay = rand::thread_rng().gen_range(0..1000);
            let released = released.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                released.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                lease.release();
            });
        }

        barrier.close_and_wait(epoch(1)).await.unwrap();

        assert_eq!(released.load(std::sync::atomic::Ordering::SeqCst), 1000);
        assert_eq!(barrier.active_leases(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_begin_while_waiting_epoch_closing() {
        let barrier = WriteBarrier::new();
        barrier.open(epoch(1)).unwrap();

        let writer = {
            let barrier = barrier.clone();
            tokio::spawn(async move {
                for _ in 0..1000 {
                    let lease = barrier.begin(epoch(1)).unwrap();
                    let delay = rand::thread_rng().gen_range(0..1000);
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        drop(lease);
                    });
                }
                barrier.close_and_wait(epoch(1)).await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        let result = barrier.begin(epoch(1));

        assert!(writer.await.unwrap().is_ok());
        assert_matches!(result, Err(BarrierError::WriteClosed(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_begin_and_close() {
        use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

        let barrier = WriteBarrier::new();
        barrier.open(epoch(1)).unwrap();

        let closed = Arc::new(AtomicBool::new(false));
        let outstanding = Arc::new(AtomicUsize::new(0));

        let writers = (0..1000)
            .map(|_| {
                let barrier = barrier.clone();
                let closed = closed.clone();
                let outstanding = outstanding.clone();
                tokio::spawn(async move {
                    let delay = rand::thread_rng().gen_range(0..1000);
                    let Ok(mut lease) = barrier.begin(epoch(1)) else {
                        return;
                    };
                    outstanding.fetch_add(1, Ordering::SeqCst);
                    assert!(!closed.load(Ordering::SeqCst), "Lease admitted after close");

                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    outstanding.fetch_sub(1, Ordering::SeqCst);
                    lease.release();
                })
            })
            .collect::<Vec<_>>();

        let closer = {
            let barrier = barrier.clone();
            let closed = closed.clone();
            let outstanding = outstanding.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                barrier.close_and_wait(epoch(1)).await.unwrap();
                assert_eq!(outstanding.load(Ordering::SeqCst), 0);
                closed.store(true, Ordering::SeqCst);
            })
        };

        closer.await.unwrap();
        assert_eq!(barrier.active_leases(), 0);
        assert_matches!(barrier.begin(epoch(1)), Err(BarrierError::WriteClosed(_)));

        for writer in writers {
            writer.await.unwrap();
        }
        assert_eq!(outstanding.load(Ordering::SeqCst), 0);
        assert!(barrier.open(epoch(2)).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_closers_exactly_one_succeeds() {
        let barrier = WriteBarrier::new();
        barrier.open(epoch(7)).unwrap();
        let lease = barrier.begin(epoch(7)).unwrap();

        let closers = (0..8)
            .map(|_| {
                let barrier = barrier.clone();
                tokio::spawn(async move { barrier.close_and_wait(epoch(7)).await })
            })
            .collect::<Vec<_>>();

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(lease);

        let mut succeeded = 0;
        for closer in closers {
            match closer.await.unwrap() {
                Ok(()) => succeeded += 1,
                Err(err) => assert_eq!(err, BarrierError::WriteClosed(epoch(7))),
            }
        }
        assert_eq!(succeeded, 1);
        assert_eq!(barrier.state(epoch(7)), WriteState::Closed);
    }
}
