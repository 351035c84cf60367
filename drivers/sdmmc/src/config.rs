//! Driver tunables.

use core::time::Duration;

/// Status polls allowed while waiting for the card to enter the transfer state.
pub const TRAN_POLL_ATTEMPTS: u32 = 10;
/// Delay between two status polls.
pub const TRAN_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Stop-transmission retries allowed for a card reporting the receive state.
pub const MAX_STOP_RETRIES: u32 = 10;
/// Name of the worker thread.
pub const WORKER_NAME: &str = "sdmmc-worker";
/// Name of the published block device.
pub const DEVICE_NAME: &str = "sdmmc";
/// Name of the device published after SDIO reclassification.
pub const SDIO_DEVICE_NAME: &str = "sdio";

/// Per-instance configuration of the driver.
///
/// # Valid Ranges
///
/// - `tran_poll_attempts`: at least 1, otherwise bring-up always times out
/// - `max_stop_retries`: bounds the receive-state recovery separately from
///   `tran_poll_attempts`; 0 turns a card stuck in that state into a timeout
#[derive(Debug, Clone, Copy)]
pub struct SdmmcConfig {
    /// Status polls before bring-up gives up with `TimedOut`.
    pub tran_poll_attempts: u32,
    /// Delay between status polls.
    pub tran_poll_interval: Duration,
    /// Stop-transmission retries for a card stuck receiving data.
    pub max_stop_retries: u32,
    /// Name given to the worker thread.
    pub worker_name: &'static str,
}

impl Default for SdmmcConfig {
    fn default() -> Self {
        Self {
            tran_poll_attempts: TRAN_POLL_ATTEMPTS,
            tran_poll_interval: TRAN_POLL_INTERVAL,
            max_stop_retries: MAX_STOP_RETRIES,
            worker_name: WORKER_NAME,
        }
    }
}
