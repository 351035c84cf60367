// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Device driver interfaces shared by the x-kernel driver crates. It provides
//! common traits and types for implementing a device driver, and the contract
//! a driver uses to publish itself to the host platform.
//!
//! You have to use this crate with the following crates for corresponding
//! device types:
//!
//! - [`block`][1]: Common traits and types for block storage drivers.
//! - [`sdmmc`][2]: SD/MMC card driver built on top of an SD host controller.
//!
//! [1]: ../block/index.html
//! [2]: ../sdmmc/index.html

#![no_std]

mod platform;

pub use self::platform::{DeviceAddArgs, DevicePlatform, DeviceProp, DevicePropKey};

/// All supported device kinds.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeviceKind {
    /// Block storage device (e.g., disk).
    Block,
    /// SDIO peripheral function device (e.g., an SDIO WLAN chip).
    Sdio,
}

/// The error type for driver operation failures.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DriverError {
    /// Bad internal state.
    BadState,
    /// Invalid parameter/argument.
    InvalidInput,
    /// Input/output error.
    Io,
    /// Not enough space/cannot allocate memory (DMA).
    NoMemory,
    /// The requested entity (e.g., a card on the bus) was not found.
    NotFound,
    /// The request addresses a range outside of the device.
    OutOfRange,
    /// The device did not reach the expected state in time.
    TimedOut,
    /// This operation is unsupported or unimplemented.
    Unsupported,
}

impl DriverError {
    /// Stable error message for display/logging.
    pub const fn message(&self) -> &'static str {
        match self {
            DriverError::BadState => "Bad state",
            DriverError::InvalidInput => "Invalid parameter",
            DriverError::Io => "Input/output error",
            DriverError::NoMemory => "Not enough memory",
            DriverError::NotFound => "Entity not found",
            DriverError::OutOfRange => "Out of range",
            DriverError::TimedOut => "Timed out",
            DriverError::Unsupported => "Unsupported operation",
        }
    }
}

impl core::fmt::Display for DriverError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.message())
    }
}

/// A specialized `Result` type for device operations.
pub type DriverResult<T = ()> = Result<T, DriverError>;

/// Common operations that require all device drivers to implement.
pub trait DriverOps: Send + Sync {
    /// The name of the device.
    fn name(&self) -> &str;

    /// The kind of the device.
    fn device_kind(&self) -> DeviceKind;

    /// The IRQ number of the device, if applicable.
    fn irq(&self) -> Option<usize> {
        None
    }
}
