//! Turns one dequeued transaction into one card command.

use core::{ptr::NonNull, slice};

use block::{BlockBuffer, BlockOp, BlockRw};
use driver_base::{DriverError, DriverResult};

use crate::{
    card::CardInfo,
    cmd::{
        CmdFlags, SDMMC_READ_BLOCK, SDMMC_READ_MULTIPLE_BLOCK, SDMMC_WRITE_BLOCK,
        SDMMC_WRITE_MULTIPLE_BLOCK,
    },
    host::{RequestData, SdmmcHost, SdmmcRequest},
    txn::SdmmcTxn,
};

/// A client buffer region mapped into the driver for the duration of one
/// command. Unmapped on drop.
pub(crate) struct MappedBuffer<'a> {
    buffer: &'a dyn BlockBuffer,
    addr: NonNull<u8>,
    len: usize,
}

impl<'a> MappedBuffer<'a> {
    pub(crate) fn map(buffer: &'a dyn BlockBuffer, offset: usize, len: usize) -> DriverResult<Self> {
        let addr = buffer.map(offset, len)?;
        Ok(Self { buffer, addr, len })
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: `BlockBuffer::map` guarantees the region is valid and ours
        // until it is unmapped in `drop`.
        unsafe { slice::from_raw_parts_mut(self.addr.as_ptr(), self.len) }
    }
}

impl Drop for MappedBuffer<'_> {
    fn drop(&mut self) {
        // SAFETY: the mapping came from `map` on the same buffer and no
        // borrow of it outlives `self`.
        unsafe { self.buffer.unmap(self.addr, self.len) }
    }
}

/// Executes transactions on the worker thread against a ready card.
pub(crate) struct TxnExecutor<'a, H> {
    host: &'a H,
    card: &'a CardInfo,
    next_trace_id: u64,
}

impl<'a, H: SdmmcHost> TxnExecutor<'a, H> {
    pub(crate) fn new(host: &'a H, card: &'a CardInfo) -> Self {
        Self {
            host,
            card,
            next_trace_id: 0,
        }
    }

    /// Runs `txn` and completes it exactly once.
    pub(crate) fn execute(&mut self, txn: SdmmcTxn) {
        let trace_id = self.next_trace_id;
        self.next_trace_id = self.next_trace_id.wrapping_add(1);

        trace!("sdmmc: do_txn #{trace_id} {:?}", txn.op());
        let status = self.do_txn(txn.op());
        if let Err(err) = status {
            debug!("sdmmc: do_txn #{trace_id} {} failed: {err}", txn.op().name());
        }
        txn.complete(status);
        trace!("sdmmc: do_txn #{trace_id} complete");
    }

    fn do_txn(&self, op: &BlockOp) -> DriverResult {
        match op {
            BlockOp::Read(rw) => self.do_rw(rw, true),
            BlockOp::Write(rw) => self.do_rw(rw, false),
            // Transactions run strictly in order, so everything queued before
            // the flush has already been issued.
            BlockOp::Flush => Ok(()),
            BlockOp::Trim { .. } => {
                error!("sdmmc: do_txn invalid block op {}", op.name());
                Err(DriverError::InvalidInput)
            }
        }
    }

    fn do_rw(&self, rw: &BlockRw, read: bool) -> DriverResult {
        let multi = rw.length > 1;
        let (cmd_idx, mut cmd_flags) = match (read, multi) {
            (true, false) => (SDMMC_READ_BLOCK, CmdFlags::READ_BLOCK),
            (true, true) => (SDMMC_READ_MULTIPLE_BLOCK, CmdFlags::READ_MULTIPLE_BLOCK),
            (false, false) => (SDMMC_WRITE_BLOCK, CmdFlags::WRITE_BLOCK),
            (false, true) => (SDMMC_WRITE_MULTIPLE_BLOCK, CmdFlags::WRITE_MULTIPLE_BLOCK),
        };
        let host_info = &self.card.host_info;
        if multi && host_info.auto_cmd12() {
            cmd_flags |= CmdFlags::AUTO_CMD12;
        }

        let block_size = self.card.block_info.block_size;
        let arg = u32::try_from(rw.offset_dev).map_err(|_| DriverError::OutOfRange)?;

        // Block units to bytes.
        let offset = rw
            .offset_buf
            .checked_mul(block_size as u64)
            .ok_or(DriverError::OutOfRange)?;
        let len = (rw.length as u64)
            .checked_mul(block_size as u64)
            .ok_or(DriverError::OutOfRange)?;
        let end = offset.checked_add(len).ok_or(DriverError::OutOfRange)?;
        if end > rw.buffer.size() as u64 {
            return Err(DriverError::OutOfRange);
        }

        trace!(
            "sdmmc: cmd {cmd_idx} arg {arg:#x} offset_buf {offset:#x} length {len:#x} \
             blocksize {block_size:#x} max_transfer_size {:#x}",
            self.card.block_info.max_transfer_size
        );

        let mut mapped = None;
        let data = if host_info.use_dma() {
            RequestData::Dma {
                buffer: rw.buffer.as_ref(),
                offset,
            }
        } else {
            let mapping = MappedBuffer::map(rw.buffer.as_ref(), offset as usize, len as usize)
                .inspect_err(|err| debug!("sdmmc: do_txn buffer map error: {err}"))?;
            RequestData::Mapped(mapped.insert(mapping).as_mut_slice())
        };

        let mut req = SdmmcRequest {
            cmd_idx,
            cmd_flags,
            arg,
            blockcount: rw.length,
            blocksize: block_size,
            data,
            response: [0; 4],
        };
        self.host.request(&mut req)?;

        if multi && !host_info.auto_cmd12() {
            // Data already moved, but the card is left in a data state.
            self.host
                .stop_transmission()
                .inspect_err(|err| debug!("sdmmc: do_txn stop transmission error: {err}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use block::BlockInfo;

    use super::*;
    use crate::{
        card::CardFamily,
        host::{HostCaps, HostInfo},
        mock::{HostCall, MemBuffer, MockHost},
    };

    const BLOCK_SIZE: u32 = 512;

    fn card(caps: HostCaps) -> CardInfo {
        CardInfo {
            family: CardFamily::Sd,
            rca: 1,
            host_info: HostInfo {
                caps,
                max_transfer_size: 64 * 1024,
            },
            block_info: BlockInfo {
                block_count: 100,
                block_size: BLOCK_SIZE,
                max_transfer_size: 64 * 1024,
            },
        }
    }

    fn run(host: &MockHost, card: &CardInfo, op: BlockOp) -> DriverResult {
        let result = Arc::new(Mutex::new(Vec::new()));
        let sink = result.clone();
        let txn = SdmmcTxn::new(
            op,
            Box::new(move |_, status: DriverResult, _| sink.lock().unwrap().push(status)),
            0,
        );
        TxnExecutor::new(host, card).execute(txn);

        let result = result.lock().unwrap();
        assert_eq!(result.len(), 1, "completed exactly once");
        result[0]
    }

    #[test]
    fn single_block_read_through_mapping() {
        let host = MockHost::sd_card(100);
        host.fill_disk(|block| block as u8);
        let buffer = MemBuffer::new(4 * BLOCK_SIZE as usize);
        let op = BlockOp::Read(BlockRw::new(buffer.clone(), 7, 2, 1));

        assert_eq!(run(&host, &card(HostCaps::empty()), op), Ok(()));

        let calls = host.data_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].cmd_idx, SDMMC_READ_BLOCK);
        assert_eq!(calls[0].arg, 7);
        assert_eq!(calls[0].blockcount, 1);
        assert_eq!(calls[0].mapped_len, Some(BLOCK_SIZE as usize));
        assert_eq!(host.count(&HostCall::StopTransmission), 0);

        let contents = buffer.contents();
        assert!(contents[1024..1536].iter().all(|b| *b == 7));
        assert!(contents[..1024].iter().all(|b| *b == 0));
        assert_eq!(buffer.live_maps(), 0);
    }

    #[test]
    fn multi_block_write_stops_transmission_without_auto_cmd12() {
        let host = MockHost::sd_card(100);
        let buffer = MemBuffer::filled(2 * BLOCK_SIZE as usize, 0xa5);
        let op = BlockOp::Write(BlockRw::new(buffer.clone(), 0, 0, 2));

        assert_eq!(run(&host, &card(HostCaps::empty()), op), Ok(()));

        let calls = host.data_calls();
        assert_eq!(calls[0].cmd_idx, SDMMC_WRITE_MULTIPLE_BLOCK);
        assert!(calls[0].flags.contains(CmdFlags::MULTI_BLK));
        assert!(!calls[0].flags.contains(CmdFlags::AUTO_CMD12));
        assert_eq!(host.count(&HostCall::StopTransmission), 1);
        assert!(host.disk_block(1).iter().all(|b| *b == 0xa5));
        assert_eq!(buffer.live_maps(), 0);
    }

    #[test]
    fn auto_cmd12_host_needs_no_explicit_stop() {
        let host = MockHost::sd_card(100);
        let buffer = MemBuffer::new(8 * BLOCK_SIZE as usize);
        let op = BlockOp::Read(BlockRw::new(buffer, 10, 0, 8));

        assert_eq!(run(&host, &card(HostCaps::AUTO_CMD12), op), Ok(()));

        let calls = host.data_calls();
        assert!(calls[0].flags.contains(CmdFlags::AUTO_CMD12));
        assert_eq!(host.count(&HostCall::StopTransmission), 0);
    }

    #[test]
    fn dma_host_never_maps() {
        let host = MockHost::sd_card(100);
        let buffer = MemBuffer::new(4 * BLOCK_SIZE as usize);
        let op = BlockOp::Write(BlockRw::new(buffer.clone(), 3, 1, 2));

        assert_eq!(run(&host, &card(HostCaps::DMA | HostCaps::AUTO_CMD12), op), Ok(()));

        let calls = host.data_calls();
        assert_eq!(calls[0].dma_offset, Some(BLOCK_SIZE as u64));
        assert_eq!(calls[0].mapped_len, None);
        assert_eq!(buffer.total_maps(), 0);
    }

    #[test]
    fn map_failure_issues_no_command() {
        let host = MockHost::sd_card(100);
        let buffer = MemBuffer::new(BLOCK_SIZE as usize);
        buffer.fail_map(DriverError::NoMemory);
        let op = BlockOp::Read(BlockRw::new(buffer, 0, 0, 1));

        assert_eq!(run(&host, &card(HostCaps::empty()), op), Err(DriverError::NoMemory));
        assert!(host.data_calls().is_empty());
    }

    #[test]
    fn command_failure_still_unmaps() {
        let host = MockHost::sd_card(100);
        host.fail_next_request(DriverError::Io);
        let buffer = MemBuffer::new(2 * BLOCK_SIZE as usize);
        let op = BlockOp::Read(BlockRw::new(buffer.clone(), 0, 0, 2));

        assert_eq!(run(&host, &card(HostCaps::empty()), op), Err(DriverError::Io));
        // No stop after a failed command, and no retry either.
        assert_eq!(host.count(&HostCall::StopTransmission), 0);
        assert_eq!(host.data_calls().len(), 1);
        assert_eq!(buffer.total_maps(), 1);
        assert_eq!(buffer.live_maps(), 0);
    }

    #[test]
    fn stop_failure_fails_the_whole_transfer() {
        let host = MockHost::sd_card(100);
        host.fail_next_stop(DriverError::TimedOut);
        let buffer = MemBuffer::filled(3 * BLOCK_SIZE as usize, 0x5a);
        let op = BlockOp::Write(BlockRw::new(buffer.clone(), 20, 0, 3));

        assert_eq!(run(&host, &card(HostCaps::empty()), op), Err(DriverError::TimedOut));
        // The data did reach the card.
        assert!(host.disk_block(22).iter().all(|b| *b == 0x5a));
        assert_eq!(buffer.live_maps(), 0);
    }

    #[test]
    fn region_beyond_buffer_is_rejected() {
        let host = MockHost::sd_card(100);
        let buffer = MemBuffer::new(BLOCK_SIZE as usize);
        let op = BlockOp::Read(BlockRw::new(buffer, 0, 1, 1));

        assert_eq!(run(&host, &card(HostCaps::empty()), op), Err(DriverError::OutOfRange));
        assert!(host.data_calls().is_empty());
    }

    #[test]
    fn flush_issues_nothing() {
        let host = MockHost::sd_card(100);
        assert_eq!(run(&host, &card(HostCaps::empty()), BlockOp::Flush), Ok(()));
        assert!(host.calls().is_empty());
    }
}
