//! Card identity and bring-up progress, shared between the worker and clients.

use core::sync::atomic::{AtomicU8, Ordering};

use block::BlockInfo;
use spin::Once;
use strum::{FromRepr, IntoStaticStr};

use crate::host::HostInfo;

/// Protocol family a card was identified as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum CardFamily {
    Unknown,
    Sdio,
    Sd,
    Mmc,
}

impl CardFamily {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Bring-up phase of the card.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IntoStaticStr)]
pub enum CardPhase {
    Idle = 0,
    ProtocolProbe,
    AwaitingTransferReady,
    Ready,
    Failed,
    ShuttingDown,
}

impl CardPhase {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Facts about a block card that stay fixed once bring-up succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardInfo {
    pub family: CardFamily,
    pub rca: u16,
    pub host_info: HostInfo,
    pub block_info: BlockInfo,
}

/// Card state written by the worker during bring-up and read lock-free by
/// everyone afterwards.
pub(crate) struct CardCell {
    phase: AtomicU8,
    family: Once<CardFamily>,
    info: Once<CardInfo>,
}

impl CardCell {
    pub(crate) const fn new() -> Self {
        Self {
            phase: AtomicU8::new(CardPhase::Idle as u8),
            family: Once::new(),
            info: Once::new(),
        }
    }

    pub(crate) fn phase(&self) -> CardPhase {
        CardPhase::from_repr(self.phase.load(Ordering::Acquire)).unwrap_or(CardPhase::Failed)
    }

    pub(crate) fn set_phase(&self, phase: CardPhase) {
        let prev = self.phase.swap(phase as u8, Ordering::AcqRel);
        if prev != phase as u8 {
            debug!(
                "sdmmc: card phase {} -> {}",
                CardPhase::from_repr(prev).map_or("?", CardPhase::as_str),
                phase.as_str()
            );
        }
    }

    /// Moves to `to` only if the card is currently in `from`.
    pub(crate) fn transition(&self, from: CardPhase, to: CardPhase) -> bool {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn family(&self) -> CardFamily {
        self.family.get().copied().unwrap_or(CardFamily::Unknown)
    }

    /// Records the identified family. Later calls are ignored.
    pub(crate) fn set_family(&self, family: CardFamily) {
        self.family.call_once(|| family);
    }

    pub(crate) fn info(&self) -> Option<&CardInfo> {
        self.info.get()
    }

    pub(crate) fn publish(&self, info: CardInfo) {
        self.info.call_once(|| info);
    }
}
