// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! SD/MMC card driver built on top of an SD host controller.
//!
//! [`SdmmcDevice::bind`] publishes an invisible block device and starts a
//! worker thread. The worker resets the card, probes it as SDIO, SD or MMC,
//! waits for the transfer state and only then makes the device visible. From
//! that point on, requests submitted through [`block::BlockImplOps::queue`]
//! are validated, queued and executed one at a time in submission order.
//!
//! An SDIO card is not a block device: the driver removes itself and
//! re-registers the device as [`driver_base::DeviceKind::Sdio`].
//!
//! The host controller is reached through [`SdmmcHost`] and the device tree
//! through [`driver_base::DevicePlatform`].

#[macro_use]
extern crate log;

mod bringup;
mod card;
mod cmd;
mod config;
mod device;
mod executor;
mod host;
mod queue;
mod txn;
mod worker;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use self::{
    card::{CardFamily, CardInfo, CardPhase},
    cmd::{CardState, CardStatus, CmdFlags},
    config::{
        DEVICE_NAME, MAX_STOP_RETRIES, SDIO_DEVICE_NAME, SdmmcConfig, TRAN_POLL_ATTEMPTS,
        TRAN_POLL_INTERVAL, WORKER_NAME,
    },
    device::SdmmcDevice,
    host::{
        HostCaps, HostInfo, ProbedCard, RequestData, SdioHwInfo, SdmmcHost, SdmmcRequest,
    },
    txn::SdmmcTxn,
};
pub use self::cmd::{
    SDMMC_GO_IDLE_STATE, SDMMC_READ_BLOCK, SDMMC_READ_MULTIPLE_BLOCK, SDMMC_SEND_STATUS,
    SDMMC_STOP_TRANSMISSION, SDMMC_WRITE_BLOCK, SDMMC_WRITE_MULTIPLE_BLOCK,
};
