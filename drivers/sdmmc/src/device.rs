//! The driver instance: lifecycle and the block protocol surface.

use core::sync::atomic::{AtomicBool, Ordering};
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use block::{BlockImplOps, BlockInfo, BlockIoctl, BlockIoctlReply, BlockOp, CompletionFn};
use driver_base::{
    DeviceAddArgs, DeviceKind, DevicePlatform, DriverError, DriverOps, DriverResult,
};
use spin::Mutex;

use crate::{
    card::{CardCell, CardFamily, CardInfo, CardPhase},
    config::{DEVICE_NAME, SdmmcConfig},
    host::SdmmcHost,
    queue::{TxnQueue, WakeSignals},
    txn::SdmmcTxn,
    worker::worker_main,
};

/// State shared between the device handle and its worker thread.
pub(crate) struct Shared<H, P> {
    pub(crate) host: Arc<H>,
    pub(crate) platform: Arc<P>,
    pub(crate) config: SdmmcConfig,
    pub(crate) queue: TxnQueue,
    pub(crate) card: CardCell,
    /// Set once bring-up handed the card over to queue processing.
    pub(crate) worker_running: AtomicBool,
}

enum Admission {
    Enqueue,
    Complete(DriverResult),
}

/// An SD/MMC card exposed as a block device.
///
/// Created by [`SdmmcDevice::bind`], which returns before the card is brought
/// up. Requests submitted before the card is ready fail with
/// [`DriverError::BadState`].
pub struct SdmmcDevice<H: SdmmcHost + 'static, P: DevicePlatform + 'static> {
    shared: Arc<Shared<H, P>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<H: SdmmcHost + 'static, P: DevicePlatform + 'static> SdmmcDevice<H, P> {
    /// Publishes an invisible block device and starts the worker thread,
    /// which brings the card up in the background.
    pub fn bind(host: Arc<H>, platform: Arc<P>, config: SdmmcConfig) -> DriverResult<Self> {
        platform
            .add_device(&DeviceAddArgs {
                name: DEVICE_NAME,
                kind: DeviceKind::Block,
                props: &[],
                invisible: true,
            })
            .inspect_err(|err| error!("sdmmc: failed to add device: {err}"))?;

        let shared = Arc::new(Shared {
            host,
            platform,
            config,
            queue: TxnQueue::new(),
            card: CardCell::new(),
            worker_running: AtomicBool::new(false),
        });

        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(config.worker_name.into())
            .spawn(move || worker_main(worker_shared))
            .map_err(|err| {
                error!("sdmmc: failed to create worker thread: {err}");
                shared.platform.remove_device();
                DriverError::NoMemory
            })?;
        info!("sdmmc: bound, worker {} started", config.worker_name);

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Stops the worker and fails every request it did not get to with
    /// [`DriverError::BadState`].
    ///
    /// A transaction already executing finishes first. Calling this more
    /// than once is harmless; every caller returns only after the queue has
    /// been drained and the worker joined.
    pub fn release(&self) {
        let shared = &self.shared;
        shared.card.transition(CardPhase::Ready, CardPhase::ShuttingDown);
        // Sticky: a worker still bringing the card up stops at its first
        // idle point.
        shared.queue.raise(WakeSignals::SHUTDOWN);

        let Some(handle) = self.worker.lock().take() else {
            shared.queue.wait_any(WakeSignals::RELEASED);
            return;
        };
        if shared.worker_running.load(Ordering::Acquire) {
            shared.queue.wait_any(WakeSignals::SHUTDOWN_DONE);
        }

        let failed = shared.queue.drain_with_failure(DriverError::BadState);
        if failed > 0 {
            debug!("sdmmc: release failed {failed} pending requests");
        }
        if handle.join().is_err() {
            error!("sdmmc: worker thread panicked");
        }
        shared.card.transition(CardPhase::Ready, CardPhase::ShuttingDown);
        shared.queue.raise(WakeSignals::RELEASED);
        info!("sdmmc: released");
    }

    /// Asks the platform to tear the device down.
    pub fn unbind(&self) {
        debug!("sdmmc: unbind");
        self.shared.platform.remove_device();
    }

    /// Device size in bytes, 0 until the card is ready.
    pub fn get_size(&self) -> u64 {
        self.block_info().size()
    }

    pub fn ioctl(&self, req: BlockIoctl) -> DriverResult<BlockIoctlReply> {
        match req {
            BlockIoctl::GetInfo => Ok(BlockIoctlReply::Info(self.block_info())),
            // Requests are executed in order, so there is nothing to wait for.
            BlockIoctl::DeviceSync => Ok(BlockIoctlReply::Done),
            BlockIoctl::Other(op) => {
                debug!("sdmmc: unsupported ioctl {op:#x}");
                Err(DriverError::Unsupported)
            }
        }
    }

    pub fn phase(&self) -> CardPhase {
        self.shared.card.phase()
    }

    pub fn card_family(&self) -> CardFamily {
        self.shared.card.family()
    }

    pub fn card_info(&self) -> Option<CardInfo> {
        self.shared.card.info().copied()
    }

    /// Geometry of the card; all zero until it is ready.
    pub fn block_info(&self) -> BlockInfo {
        self.shared
            .card
            .info()
            .map(|info| info.block_info)
            .unwrap_or_default()
    }

    /// Number of accepted requests not yet taken by the worker.
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    /// Decides whether `op` is queued or completed right away.
    fn admit(&self, op: &BlockOp) -> Admission {
        let rw = match op {
            BlockOp::Read(rw) | BlockOp::Write(rw) => Some(rw),
            BlockOp::Flush => None,
            _ => return Admission::Complete(Err(DriverError::Unsupported)),
        };

        let info = match self.shared.card.info() {
            Some(info) if self.phase() == CardPhase::Ready => info,
            _ => return Admission::Complete(Err(DriverError::BadState)),
        };

        if let Some(rw) = rw {
            let max = info.block_info.block_count;
            if rw.offset_dev >= max || max - rw.offset_dev < rw.length as u64 {
                return Admission::Complete(Err(DriverError::OutOfRange));
            }
            if rw.length == 0 {
                return Admission::Complete(Ok(()));
            }
        }
        Admission::Enqueue
    }
}

impl<H: SdmmcHost + 'static, P: DevicePlatform + 'static> DriverOps for SdmmcDevice<H, P> {
    fn name(&self) -> &str {
        DEVICE_NAME
    }

    fn device_kind(&self) -> DeviceKind {
        DeviceKind::Block
    }
}

impl<H: SdmmcHost + 'static, P: DevicePlatform + 'static> BlockImplOps for SdmmcDevice<H, P> {
    fn query(&self) -> (BlockInfo, usize) {
        (self.block_info(), size_of::<SdmmcTxn>())
    }

    fn queue(&self, op: BlockOp, callback: CompletionFn, cookie: usize) {
        let txn = SdmmcTxn::new(op, callback, cookie);
        match self.admit(txn.op()) {
            Admission::Enqueue => {
                if let Err(txn) = self.shared.queue.push(txn) {
                    txn.complete(Err(DriverError::BadState));
                }
            }
            Admission::Complete(status) => txn.complete(status),
        }
    }
}

impl<H: SdmmcHost + 'static, P: DevicePlatform + 'static> Drop for SdmmcDevice<H, P> {
    fn drop(&mut self) {
        self.release();
    }
}
