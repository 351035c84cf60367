//! The worker thread: card bring-up once, then in-order execution of queued
//! transactions until shutdown.

use core::sync::atomic::Ordering;
use std::sync::Arc;

use driver_base::{DevicePlatform, DriverError};

use crate::{
    bringup::{BringupOutcome, CardBringup},
    card::CardInfo,
    device::Shared,
    executor::TxnExecutor,
    host::SdmmcHost,
    queue::{TxnQueue, WakeSignals},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    BringUp,
    Idle,
    Executing,
    ShuttingDown,
    Terminated,
}

/// Raises `SHUTDOWN_DONE` when the worker exits, unwinding included, so a
/// releaser waiting on it is never stranded.
struct ShutdownDone<'a>(&'a TxnQueue);

impl Drop for ShutdownDone<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!("sdmmc: worker panicked");
        }
        self.0.raise(WakeSignals::SHUTDOWN_DONE);
    }
}

pub(crate) fn worker_main<H: SdmmcHost, P: DevicePlatform>(shared: Arc<Shared<H, P>>) {
    let _done = ShutdownDone(&shared.queue);
    let mut state = WorkerState::BringUp;
    debug!("sdmmc: worker started");

    let Some(card) = bring_up(&shared) else {
        debug!("sdmmc: worker {state:?} -> {:?}", WorkerState::Terminated);
        return;
    };
    let mut executor = TxnExecutor::new(&*shared.host, card);

    state = next(state, WorkerState::Executing);
    while state != WorkerState::Terminated {
        state = match state {
            WorkerState::Executing => {
                if let Some(txn) = shared.queue.take_next() {
                    executor.execute(txn);
                }
                next(state, WorkerState::Idle)
            }
            WorkerState::Idle => {
                let signals = shared
                    .queue
                    .wait_any(WakeSignals::TXN_RECEIVED | WakeSignals::SHUTDOWN);
                if signals.contains(WakeSignals::SHUTDOWN) {
                    next(state, WorkerState::ShuttingDown)
                } else {
                    next(state, WorkerState::Executing)
                }
            }
            WorkerState::ShuttingDown => next(state, WorkerState::Terminated),
            WorkerState::BringUp | WorkerState::Terminated => WorkerState::Terminated,
        };
    }
    debug!("sdmmc: worker exiting");
}

/// Returns the published card facts once the card is ready for block I/O.
///
/// In every other case nothing will ever be executed, so the queue is closed
/// and anything that slipped in is failed.
fn bring_up<H: SdmmcHost, P: DevicePlatform>(shared: &Shared<H, P>) -> Option<&CardInfo> {
    let bringup = CardBringup::new(
        &*shared.host,
        &*shared.platform,
        &shared.config,
        &shared.card,
        &shared.queue,
    );
    let outcome = bringup.run(|info| {
        shared.card.publish(info);
        shared.worker_running.store(true, Ordering::Release);
    });

    match outcome {
        Ok(BringupOutcome::Ready) => shared.card.info(),
        Ok(BringupOutcome::Reclassified | BringupOutcome::Cancelled) => {
            shared.queue.drain_with_failure(DriverError::BadState);
            None
        }
        Err(err) => {
            let failed = shared.queue.drain_with_failure(DriverError::BadState);
            error!("sdmmc: card bring-up failed: {err}, {failed} pending requests failed");
            None
        }
    }
}

#[inline]
fn next(from: WorkerState, to: WorkerState) -> WorkerState {
    trace!("sdmmc: worker {from:?} -> {to:?}");
    to
}
