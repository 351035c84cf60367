//! The SD host controller interface the driver issues commands through.

use bitflags::bitflags;
use block::BlockBuffer;
use driver_base::DriverResult;

use crate::cmd::{
    CardStatus, CmdFlags, SDMMC_GO_IDLE_STATE, SDMMC_SEND_STATUS, SDMMC_STOP_TRANSMISSION,
};

bitflags! {
    /// Capabilities reported by the host controller.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct HostCaps: u32 {
        const BUS_WIDTH_8 = 1 << 0;
        /// The controller can transfer straight from a client buffer.
        const DMA         = 1 << 1;
        const ADDR_64BIT  = 1 << 2;
        const VOLTAGE_330 = 1 << 3;
        /// The controller stops multi-block transfers on its own.
        const AUTO_CMD12  = 1 << 4;
    }
}

/// Host controller properties, queried once during bring-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostInfo {
    pub caps: HostCaps,
    /// Largest single transfer in bytes.
    pub max_transfer_size: u64,
}

impl HostInfo {
    #[inline]
    pub fn use_dma(&self) -> bool {
        self.caps.contains(HostCaps::DMA)
    }

    #[inline]
    pub fn auto_cmd12(&self) -> bool {
        self.caps.contains(HostCaps::AUTO_CMD12)
    }
}

/// What an SD or MMC probe learned about the card.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbedCard {
    /// Relative card address assigned during identification.
    pub rca: u16,
    pub block_count: u64,
    pub block_size: u32,
}

/// Identification of an SDIO card, read from function 0's CIS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SdioHwInfo {
    pub manufacturer_id: u32,
    pub product_id: u32,
    pub num_funcs: u8,
}

/// Data phase of a request.
pub enum RequestData<'a> {
    /// Command without data.
    None,
    /// The controller transfers directly from/to `buffer` at byte `offset`.
    Dma {
        buffer: &'a dyn BlockBuffer,
        offset: u64,
    },
    /// The driver mapped the client region; the controller copies through it.
    Mapped(&'a mut [u8]),
}

/// One command for the host controller.
pub struct SdmmcRequest<'a> {
    pub cmd_idx: u32,
    pub cmd_flags: CmdFlags,
    pub arg: u32,
    pub blockcount: u32,
    pub blocksize: u32,
    pub data: RequestData<'a>,
    /// Filled in by the controller.
    pub response: [u32; 4],
}

impl<'a> SdmmcRequest<'a> {
    /// A command without data phase.
    pub fn command(cmd_idx: u32, cmd_flags: CmdFlags, arg: u32) -> Self {
        Self {
            cmd_idx,
            cmd_flags,
            arg,
            blockcount: 0,
            blocksize: 0,
            data: RequestData::None,
            response: [0; 4],
        }
    }
}

/// Operations provided by the SD host controller driver.
///
/// All calls are synchronous and are only ever made from the driver's worker
/// thread. The card-family probes are implemented by the controller side, as
/// their command sequences are specific to each family.
pub trait SdmmcHost: Send + Sync {
    /// Returns the controller's capabilities.
    fn host_info(&self) -> DriverResult<HostInfo>;

    /// Issues a single command and waits for its completion.
    fn request(&self, req: &mut SdmmcRequest<'_>) -> DriverResult;

    /// Power-cycles or otherwise hardware-resets the card, if supported.
    fn hw_reset(&self) {}

    /// Tries to initialize the card as an SDIO card.
    fn probe_sdio(&self) -> DriverResult<SdioHwInfo>;

    /// Tries to initialize the card as an SD memory card.
    fn probe_sd(&self) -> DriverResult<ProbedCard>;

    /// Tries to initialize the card as an MMC/eMMC device.
    fn probe_mmc(&self) -> DriverResult<ProbedCard>;

    /// Sends CMD0, which moves the card into the idle state from any state.
    fn go_idle(&self) -> DriverResult {
        let mut req = SdmmcRequest::command(SDMMC_GO_IDLE_STATE, CmdFlags::GO_IDLE_STATE, 0);
        self.request(&mut req)
    }

    /// Sends CMD13 to the card at `rca` and returns its status word.
    fn send_status(&self, rca: u16) -> DriverResult<CardStatus> {
        let mut req =
            SdmmcRequest::command(SDMMC_SEND_STATUS, CmdFlags::SEND_STATUS, (rca as u32) << 16);
        self.request(&mut req)?;
        Ok(CardStatus(req.response[0]))
    }

    /// Sends CMD12, ending an open-ended data transfer.
    fn stop_transmission(&self) -> DriverResult {
        let mut req =
            SdmmcRequest::command(SDMMC_STOP_TRANSMISSION, CmdFlags::STOP_TRANSMISSION, 0);
        self.request(&mut req)
    }
}
