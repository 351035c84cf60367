//! One-time card bring-up: reset, protocol probing and waiting for the
//! transfer state.

use std::thread;

use block::BlockInfo;
use driver_base::{
    DeviceAddArgs, DeviceKind, DevicePlatform, DeviceProp, DevicePropKey, DriverError,
    DriverResult,
};

use crate::{
    card::{CardCell, CardFamily, CardInfo, CardPhase},
    cmd::CardState,
    config::{SDIO_DEVICE_NAME, SdmmcConfig},
    host::{HostCaps, HostInfo, ProbedCard, SdioHwInfo, SdmmcHost},
    queue::{TxnQueue, WakeSignals},
};

/// How bring-up ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BringupOutcome {
    /// An SD or MMC card is in the transfer state and the block device is
    /// visible.
    Ready,
    /// An SDIO card was found and the device now lives on as an SDIO
    /// function device. There is no block queue to serve.
    Reclassified,
    /// The device was released before the card became ready. Nothing was
    /// published.
    Cancelled,
}

enum Probed {
    Sdio(SdioHwInfo),
    Block(CardFamily, ProbedCard),
}

/// Drives the card from an unknown state to [`CardPhase::Ready`].
pub(crate) struct CardBringup<'a, H, P> {
    host: &'a H,
    platform: &'a P,
    config: &'a SdmmcConfig,
    card: &'a CardCell,
    queue: &'a TxnQueue,
}

impl<'a, H: SdmmcHost, P: DevicePlatform> CardBringup<'a, H, P> {
    pub(crate) fn new(
        host: &'a H,
        platform: &'a P,
        config: &'a SdmmcConfig,
        card: &'a CardCell,
        queue: &'a TxnQueue,
    ) -> Self {
        Self {
            host,
            platform,
            config,
            card,
            queue,
        }
    }

    /// Runs bring-up to completion.
    ///
    /// For a block card `publish` receives the card facts right before the
    /// device is made visible. Any error is fatal: the card is left in
    /// [`CardPhase::Failed`] and the device has been removed.
    ///
    /// A shutdown request is honoured between steps and between status
    /// polls; the card then ends in [`CardPhase::ShuttingDown`] and the
    /// device is left invisible.
    pub(crate) fn run(&self, publish: impl FnOnce(CardInfo)) -> DriverResult<BringupOutcome> {
        let host_info = self.host.host_info().map_err(|err| {
            error!("sdmmc: failed to get host info: {err}");
            self.fail(err)
        })?;
        log_host_info(&host_info);

        self.card.set_phase(CardPhase::ProtocolProbe);
        self.host.hw_reset();

        // Whatever state the card is in, GO_IDLE_STATE puts it into idle.
        self.host.go_idle().map_err(|err| {
            error!("sdmmc: SDMMC_GO_IDLE_STATE failed: {err}");
            self.fail(err)
        })?;

        if self.cancelled() {
            return Ok(self.cancel());
        }
        let probed = self.probe().map_err(|err| {
            error!("sdmmc: failed to probe: {err}");
            self.fail(err)
        })?;

        if self.cancelled() {
            return Ok(self.cancel());
        }
        match probed {
            Probed::Sdio(hw_info) => {
                self.reclassify(&hw_info)?;
                Ok(BringupOutcome::Reclassified)
            }
            Probed::Block(family, probed) => {
                self.card.set_phase(CardPhase::AwaitingTransferReady);
                if let Err(err) = self.wait_for_tran(probed.rca) {
                    if self.cancelled() {
                        return Ok(self.cancel());
                    }
                    error!("sdmmc: waiting for TRAN state failed: {err}");
                    return Err(self.fail(err));
                }
                if self.cancelled() {
                    return Ok(self.cancel());
                }

                let info = CardInfo {
                    family,
                    rca: probed.rca,
                    host_info,
                    block_info: BlockInfo {
                        block_count: probed.block_count,
                        block_size: probed.block_size,
                        max_transfer_size: host_info.max_transfer_size,
                    },
                };
                publish(info);
                self.card.set_phase(CardPhase::Ready);
                self.platform.make_visible();
                info!(
                    "sdmmc: {} card ready, {} blocks of {} bytes",
                    family.as_str(),
                    probed.block_count,
                    probed.block_size
                );
                Ok(BringupOutcome::Ready)
            }
        }
    }

    /// Tries SDIO, then SD, then MMC. The error of the last probe is
    /// returned if none matches.
    fn probe(&self) -> DriverResult<Probed> {
        match self.host.probe_sdio() {
            Ok(hw_info) => {
                self.card.set_family(CardFamily::Sdio);
                return Ok(Probed::Sdio(hw_info));
            }
            Err(err) => debug!("sdmmc: SDIO probe failed: {err}"),
        }
        match self.host.probe_sd() {
            Ok(probed) => {
                self.card.set_family(CardFamily::Sd);
                return Ok(Probed::Block(CardFamily::Sd, probed));
            }
            Err(err) => debug!("sdmmc: SD probe failed: {err}"),
        }
        let probed = self.host.probe_mmc()?;
        self.card.set_family(CardFamily::Mmc);
        Ok(Probed::Block(CardFamily::Mmc, probed))
    }

    /// Replaces the block device with an SDIO function device.
    fn reclassify(&self, hw_info: &SdioHwInfo) -> DriverResult {
        self.platform.remove_device();

        let props = [
            DeviceProp::new(DevicePropKey::VendorId, hw_info.manufacturer_id),
            DeviceProp::new(DevicePropKey::ProductId, hw_info.product_id),
        ];
        let args = DeviceAddArgs {
            name: SDIO_DEVICE_NAME,
            kind: DeviceKind::Sdio,
            props: &props,
            invisible: false,
        };
        if let Err(err) = self.platform.re_register_as(&args) {
            error!("sdmmc: failed to add sdio device: {err}");
            self.card.set_phase(CardPhase::Failed);
            return Err(err);
        }

        self.card.set_phase(CardPhase::Ready);
        info!(
            "sdmmc: SDIO card {:#06x}:{:#06x} with {} functions, re-registered as sdio",
            hw_info.manufacturer_id, hw_info.product_id, hw_info.num_funcs
        );
        Ok(())
    }

    /// Polls the card status until the card reports the transfer state.
    ///
    /// A failed or non-TRAN poll uses up one of `tran_poll_attempts`. A card
    /// still receiving data gets a stop-transmission and is polled again
    /// without using up an attempt; those retries are limited by
    /// `max_stop_retries` instead.
    pub(crate) fn wait_for_tran(&self, rca: u16) -> DriverResult {
        let max_attempts = self.config.tran_poll_attempts;
        let mut attempts = 0;
        let mut stop_retries = 0;

        while attempts < max_attempts {
            if self.cancelled() {
                return Err(DriverError::BadState);
            }
            match self.host.send_status(rca) {
                Ok(status) => match status.current_state() {
                    Some(CardState::Tran) => return Ok(()),
                    Some(CardState::Rcv) => {
                        if stop_retries >= self.config.max_stop_retries {
                            warn!("sdmmc: card stuck in RCV after {stop_retries} stop retries");
                            return Err(DriverError::TimedOut);
                        }
                        stop_retries += 1;
                        if let Err(err) = self.host.stop_transmission() {
                            warn!("sdmmc: stop transmission in RCV state failed: {err}");
                        }
                        continue;
                    }
                    state => trace!("sdmmc: card in state {state:?}, waiting for TRAN"),
                },
                Err(err) => debug!("sdmmc: SDMMC_SEND_STATUS error: {err}"),
            }

            attempts += 1;
            if attempts < max_attempts {
                thread::sleep(self.config.tran_poll_interval);
            }
        }

        Err(DriverError::TimedOut)
    }

    fn cancelled(&self) -> bool {
        self.queue.signals().contains(WakeSignals::SHUTDOWN)
    }

    fn cancel(&self) -> BringupOutcome {
        info!("sdmmc: bring-up cancelled by shutdown");
        self.card.set_phase(CardPhase::ShuttingDown);
        BringupOutcome::Cancelled
    }

    fn fail(&self, err: DriverError) -> DriverError {
        self.card.set_phase(CardPhase::Failed);
        self.platform.remove_device();
        err
    }
}

fn log_host_info(host_info: &HostInfo) {
    info!(
        "sdmmc: host caps dma {} 8-bit bus {} auto-cmd12 {} max_transfer_size {}",
        host_info.use_dma(),
        host_info.caps.contains(HostCaps::BUS_WIDTH_8),
        host_info.auto_cmd12(),
        host_info.max_transfer_size
    );
}
