//! SD/MMC command indices, request flags and the R1 card status word.

use bitflags::bitflags;
use strum::{FromRepr, IntoStaticStr};

pub const SDMMC_GO_IDLE_STATE: u32 = 0;
pub const SDMMC_STOP_TRANSMISSION: u32 = 12;
pub const SDMMC_SEND_STATUS: u32 = 13;
pub const SDMMC_READ_BLOCK: u32 = 17;
pub const SDMMC_READ_MULTIPLE_BLOCK: u32 = 18;
pub const SDMMC_WRITE_BLOCK: u32 = 24;
pub const SDMMC_WRITE_MULTIPLE_BLOCK: u32 = 25;

bitflags! {
    /// How the host controller should issue a command and its data phase.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct CmdFlags: u32 {
        const RESP_CRC_CHECK    = 1 << 0;
        const RESP_CMD_IDX_CHECK = 1 << 1;
        const RESP_LEN_136      = 1 << 2;
        const RESP_LEN_48       = 1 << 3;
        /// 48-bit response followed by a busy signal on DAT0.
        const RESP_LEN_48B      = 1 << 4;
        const RESP_DATA_PRESENT = 1 << 5;
        const BLKCNT_EN         = 1 << 6;
        /// The host sends CMD12 itself when the data phase ends.
        const AUTO_CMD12        = 1 << 7;
        /// Data flows from the card to the host.
        const READ              = 1 << 8;
        const MULTI_BLK         = 1 << 9;

        const RESP_R1  = Self::RESP_LEN_48.bits()
            | Self::RESP_CRC_CHECK.bits()
            | Self::RESP_CMD_IDX_CHECK.bits();
        const RESP_R1B = Self::RESP_LEN_48B.bits()
            | Self::RESP_CRC_CHECK.bits()
            | Self::RESP_CMD_IDX_CHECK.bits();
    }
}

impl CmdFlags {
    pub const GO_IDLE_STATE: Self = Self::empty();
    pub const SEND_STATUS: Self = Self::RESP_R1;
    pub const STOP_TRANSMISSION: Self = Self::RESP_R1B;
    pub const READ_BLOCK: Self = Self::RESP_R1
        .union(Self::RESP_DATA_PRESENT)
        .union(Self::READ);
    pub const READ_MULTIPLE_BLOCK: Self = Self::READ_BLOCK
        .union(Self::BLKCNT_EN)
        .union(Self::MULTI_BLK);
    pub const WRITE_BLOCK: Self = Self::RESP_R1.union(Self::RESP_DATA_PRESENT);
    pub const WRITE_MULTIPLE_BLOCK: Self = Self::WRITE_BLOCK
        .union(Self::BLKCNT_EN)
        .union(Self::MULTI_BLK);
}

/// `CURRENT_STATE` field of the card status register.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IntoStaticStr)]
pub enum CardState {
    Idle = 0,
    Ready = 1,
    Ident = 2,
    Stby = 3,
    /// Transfer state: the card accepts a new data command.
    Tran = 4,
    Data = 5,
    /// Receive-data state: the card still expects write data.
    Rcv = 6,
    Prg = 7,
    Dis = 8,
}

/// The 32-bit card status returned in an R1 response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardStatus(pub u32);

impl CardStatus {
    const CURRENT_STATE_SHIFT: u32 = 9;
    const CURRENT_STATE_MASK: u32 = 0xf;

    /// Decodes the `CURRENT_STATE` field; `None` for reserved encodings.
    pub fn current_state(self) -> Option<CardState> {
        let raw = (self.0 >> Self::CURRENT_STATE_SHIFT) & Self::CURRENT_STATE_MASK;
        CardState::from_repr(raw as u8)
    }

    /// Builds a status word that reports `state` and nothing else.
    pub const fn from_state(state: CardState) -> Self {
        Self((state as u32) << Self::CURRENT_STATE_SHIFT)
    }
}
