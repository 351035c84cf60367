//! The transaction queue shared by clients and the worker thread.

use core::sync::atomic::{AtomicU32, Ordering};
use std::collections::VecDeque;

use bitflags::bitflags;
use driver_base::DriverError;
use event_listener::{Event, Listener, listener};
use spin::Mutex;

use crate::txn::SdmmcTxn;

bitflags! {
    /// Signals exchanged between clients, the lifecycle controller and the
    /// worker thread. Each bit is independent.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct WakeSignals: u32 {
        /// At least one transaction may be pending.
        const TXN_RECEIVED  = 1 << 0;
        /// The device is being released.
        const SHUTDOWN      = 1 << 1;
        /// The worker has observed `SHUTDOWN` and stopped taking work.
        const SHUTDOWN_DONE = 1 << 2;
        /// The first release has drained the queue and joined the worker.
        const RELEASED      = 1 << 3;
    }
}

struct Pending {
    txns: VecDeque<SdmmcTxn>,
    closed: bool,
}

/// FIFO of accepted transactions plus the signal word the worker sleeps on.
///
/// `TXN_RECEIVED` is only set and cleared while `pending` is locked, and is
/// only cleared when the list is observed empty, so a wakeup can't be lost
/// between a push and the worker going back to sleep.
pub(crate) struct TxnQueue {
    pending: Mutex<Pending>,
    signals: AtomicU32,
    event: Event,
}

impl TxnQueue {
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(Pending {
                txns: VecDeque::new(),
                closed: false,
            }),
            signals: AtomicU32::new(0),
            event: Event::new(),
        }
    }

    /// Appends `txn` and wakes the worker. Hands the transaction back if the
    /// queue has been closed.
    pub(crate) fn push(&self, txn: SdmmcTxn) -> Result<(), SdmmcTxn> {
        let mut pending = self.pending.lock();
        if pending.closed {
            return Err(txn);
        }
        pending.txns.push_back(txn);
        // Signal while locked so the worker can't clear it in between.
        self.raise(WakeSignals::TXN_RECEIVED);
        Ok(())
    }

    /// Pops the oldest transaction.
    pub(crate) fn take_next(&self) -> Option<SdmmcTxn> {
        let mut pending = self.pending.lock();
        let txn = pending.txns.pop_front();
        if pending.txns.is_empty() {
            self.clear(WakeSignals::TXN_RECEIVED);
        }
        txn
    }

    /// Closes the queue and completes every remaining transaction with
    /// `status`, oldest first. Returns how many were failed.
    ///
    /// Callbacks run without the lock held.
    pub(crate) fn drain_with_failure(&self, status: DriverError) -> usize {
        let mut failed = 0;
        loop {
            let txn = {
                let mut pending = self.pending.lock();
                pending.closed = true;
                let txn = pending.txns.pop_front();
                if pending.txns.is_empty() {
                    self.clear(WakeSignals::TXN_RECEIVED);
                }
                txn
            };
            let Some(txn) = txn else {
                break;
            };
            txn.complete(Err(status));
            failed += 1;
        }
        failed
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.lock().txns.len()
    }

    /// Current signal word.
    #[inline]
    pub(crate) fn signals(&self) -> WakeSignals {
        WakeSignals::from_bits_truncate(self.signals.load(Ordering::Acquire))
    }

    /// Sets `bits` and wakes every waiter.
    pub(crate) fn raise(&self, bits: WakeSignals) {
        self.signals.fetch_or(bits.bits(), Ordering::AcqRel);
        self.event.notify(usize::MAX);
    }

    fn clear(&self, bits: WakeSignals) {
        self.signals.fetch_and(!bits.bits(), Ordering::AcqRel);
    }

    /// Blocks until any bit of `mask` is set and returns the set bits of
    /// `mask`. Bits are not consumed.
    pub(crate) fn wait_any(&self, mask: WakeSignals) -> WakeSignals {
        loop {
            let pending = self.signals() & mask;
            if !pending.is_empty() {
                return pending;
            }

            listener!(self.event => listener);

            // Re-check after registering, a raise may have slipped in.
            let pending = self.signals() & mask;
            if !pending.is_empty() {
                return pending;
            }
            listener.wait();
        }
    }
}
