//! In-memory host controller, platform and client buffer for unit and
//! integration testing.

use core::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
};

use block::BlockBuffer;
use driver_base::{
    DeviceAddArgs, DeviceKind, DevicePlatform, DeviceProp, DriverError, DriverResult,
};

use crate::{
    cmd::{CardState, CardStatus, CmdFlags},
    host::{HostCaps, HostInfo, ProbedCard, RequestData, SdioHwInfo, SdmmcHost, SdmmcRequest},
};

pub const MOCK_BLOCK_SIZE: u32 = 512;
pub const MOCK_RCA: u16 = 0x1234;

/// A data command as the mock controller saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataCall {
    pub cmd_idx: u32,
    pub flags: CmdFlags,
    pub arg: u32,
    pub blockcount: u32,
    pub blocksize: u32,
    /// Byte offset into the client buffer for a DMA transfer.
    pub dma_offset: Option<u64>,
    /// Length of the mapped region for a non-DMA transfer.
    pub mapped_len: Option<usize>,
}

/// Every call made into [`MockHost`], in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    HostInfo,
    HwReset,
    GoIdle,
    ProbeSdio,
    ProbeSd,
    ProbeMmc,
    SendStatus(u16),
    StopTransmission,
    Data(DataCall),
}

#[derive(Debug, Clone, Copy)]
enum MockCard {
    Absent,
    Sdio(SdioHwInfo),
    Sd(ProbedCard),
    Mmc(ProbedCard),
}

#[derive(Default)]
struct Gate {
    paused: bool,
    entered: usize,
}

#[derive(Default)]
struct Faults {
    host_info: Option<DriverError>,
    go_idle: Option<DriverError>,
    requests: VecDeque<DriverError>,
    stops: VecDeque<DriverError>,
    panic_on: Option<u32>,
}

/// A scripted SD host controller with a RAM-backed card.
///
/// Status polls follow the script given to [`MockHost::script_status`] and
/// report `TRAN` once it runs out.
pub struct MockHost {
    info: HostInfo,
    card: MockCard,
    disk: Mutex<Vec<u8>>,
    statuses: Mutex<VecDeque<DriverResult<CardStatus>>>,
    faults: Mutex<Faults>,
    calls: Mutex<Vec<HostCall>>,
    gate: Mutex<Gate>,
    gate_cv: Condvar,
}

impl MockHost {
    fn with_card(card: MockCard, block_count: u64) -> Self {
        let disk_len = block_count as usize * MOCK_BLOCK_SIZE as usize;
        Self {
            info: HostInfo {
                caps: HostCaps::AUTO_CMD12,
                max_transfer_size: 128 * 1024,
            },
            card,
            disk: Mutex::new(vec![0; disk_len]),
            statuses: Mutex::new(VecDeque::new()),
            faults: Mutex::new(Faults::default()),
            calls: Mutex::new(Vec::new()),
            gate: Mutex::new(Gate::default()),
            gate_cv: Condvar::new(),
        }
    }

    fn block_card(block_count: u64) -> ProbedCard {
        ProbedCard {
            rca: MOCK_RCA,
            block_count,
            block_size: MOCK_BLOCK_SIZE,
        }
    }

    pub fn sd_card(block_count: u64) -> Self {
        Self::with_card(MockCard::Sd(Self::block_card(block_count)), block_count)
    }

    pub fn mmc_card(block_count: u64) -> Self {
        Self::with_card(MockCard::Mmc(Self::block_card(block_count)), block_count)
    }

    pub fn sdio_card(hw_info: SdioHwInfo) -> Self {
        Self::with_card(MockCard::Sdio(hw_info), 0)
    }

    /// Every probe fails.
    pub fn no_card() -> Self {
        Self::with_card(MockCard::Absent, 0)
    }

    /// Replaces the reported host capabilities.
    pub fn with_caps(mut self, caps: HostCaps) -> Self {
        self.info.caps = caps;
        self
    }

    pub fn host_info_value(&self) -> HostInfo {
        self.info
    }

    pub fn script_status(&self, script: impl IntoIterator<Item = DriverResult<CardStatus>>) {
        self.statuses.lock().unwrap().extend(script);
    }

    pub fn fail_host_info(&self, err: DriverError) {
        self.faults.lock().unwrap().host_info = Some(err);
    }

    pub fn fail_go_idle(&self, err: DriverError) {
        self.faults.lock().unwrap().go_idle = Some(err);
    }

    /// The next data command fails with `err` without moving data.
    pub fn fail_next_request(&self, err: DriverError) {
        self.faults.lock().unwrap().requests.push_back(err);
    }

    /// Every data command with index `cmd_idx` panics inside the host.
    pub fn panic_on_cmd(&self, cmd_idx: u32) {
        self.faults.lock().unwrap().panic_on = Some(cmd_idx);
    }

    /// The next stop-transmission fails with `err`.
    pub fn fail_next_stop(&self, err: DriverError) {
        self.faults.lock().unwrap().stops.push_back(err);
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &HostCall) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    /// Data commands only.
    pub fn data_calls(&self) -> Vec<DataCall> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|call| match call {
                HostCall::Data(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Fills each card block with the byte returned for its index.
    pub fn fill_disk(&self, pattern: impl Fn(u64) -> u8) {
        let mut disk = self.disk.lock().unwrap();
        for (block, chunk) in disk.chunks_mut(MOCK_BLOCK_SIZE as usize).enumerate() {
            chunk.fill(pattern(block as u64));
        }
    }

    pub fn disk_block(&self, block: u64) -> Vec<u8> {
        let start = block as usize * MOCK_BLOCK_SIZE as usize;
        self.disk.lock().unwrap()[start..start + MOCK_BLOCK_SIZE as usize].to_vec()
    }

    /// Holds every following data command inside [`SdmmcHost::request`]
    /// until [`MockHost::resume`].
    pub fn pause(&self) {
        self.gate.lock().unwrap().paused = true;
    }

    pub fn resume(&self) {
        self.gate.lock().unwrap().paused = false;
        self.gate_cv.notify_all();
    }

    /// Waits until `n` data commands have entered the controller.
    pub fn wait_entered(&self, n: usize, timeout: Duration) -> bool {
        let gate = self.gate.lock().unwrap();
        let (_gate, res) = self
            .gate_cv
            .wait_timeout_while(gate, timeout, |gate| gate.entered < n)
            .unwrap();
        !res.timed_out()
    }

    fn record(&self, call: HostCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn pass_gate(&self) {
        let mut gate = self.gate.lock().unwrap();
        gate.entered += 1;
        self.gate_cv.notify_all();
        while gate.paused {
            gate = self.gate_cv.wait(gate).unwrap();
        }
    }

    fn transfer(&self, req: &mut SdmmcRequest<'_>) -> DriverResult {
        let RequestData::Mapped(buf) = &mut req.data else {
            return Ok(());
        };
        let start = req.arg as usize * req.blocksize as usize;
        let mut disk = self.disk.lock().unwrap();
        let end = start + buf.len();
        if end > disk.len() {
            return Err(DriverError::Io);
        }
        if req.cmd_flags.contains(CmdFlags::READ) {
            buf.copy_from_slice(&disk[start..end]);
        } else {
            disk[start..end].copy_from_slice(buf);
        }
        Ok(())
    }
}

impl SdmmcHost for MockHost {
    fn host_info(&self) -> DriverResult<HostInfo> {
        self.record(HostCall::HostInfo);
        match self.faults.lock().unwrap().host_info {
            Some(err) => Err(err),
            None => Ok(self.info),
        }
    }

    fn request(&self, req: &mut SdmmcRequest<'_>) -> DriverResult {
        let (dma_offset, mapped_len) = match &req.data {
            RequestData::None => (None, None),
            RequestData::Dma { offset, .. } => (Some(*offset), None),
            RequestData::Mapped(buf) => (None, Some(buf.len())),
        };
        self.record(HostCall::Data(DataCall {
            cmd_idx: req.cmd_idx,
            flags: req.cmd_flags,
            arg: req.arg,
            blockcount: req.blockcount,
            blocksize: req.blocksize,
            dma_offset,
            mapped_len,
        }));
        let (fault, panic_on) = {
            let mut faults = self.faults.lock().unwrap();
            (faults.requests.pop_front(), faults.panic_on)
        };
        // The faults lock is released so a panic does not poison it.
        if panic_on == Some(req.cmd_idx) {
            panic!("mock host: controller fault on CMD{}", req.cmd_idx);
        }
        self.pass_gate();

        match fault {
            Some(err) => Err(err),
            None => self.transfer(req),
        }
    }

    fn hw_reset(&self) {
        self.record(HostCall::HwReset);
    }

    fn probe_sdio(&self) -> DriverResult<SdioHwInfo> {
        self.record(HostCall::ProbeSdio);
        match self.card {
            MockCard::Sdio(hw_info) => Ok(hw_info),
            _ => Err(DriverError::NotFound),
        }
    }

    fn probe_sd(&self) -> DriverResult<ProbedCard> {
        self.record(HostCall::ProbeSd);
        match self.card {
            MockCard::Sd(card) => Ok(card),
            _ => Err(DriverError::NotFound),
        }
    }

    fn probe_mmc(&self) -> DriverResult<ProbedCard> {
        self.record(HostCall::ProbeMmc);
        match self.card {
            MockCard::Mmc(card) => Ok(card),
            _ => Err(DriverError::NotFound),
        }
    }

    fn go_idle(&self) -> DriverResult {
        self.record(HostCall::GoIdle);
        match self.faults.lock().unwrap().go_idle {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn send_status(&self, rca: u16) -> DriverResult<CardStatus> {
        self.record(HostCall::SendStatus(rca));
        self.statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(CardStatus::from_state(CardState::Tran)))
    }

    fn stop_transmission(&self) -> DriverResult {
        self.record(HostCall::StopTransmission);
        match self.faults.lock().unwrap().stops.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// What the driver asked of the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    Added {
        name: String,
        kind: DeviceKind,
        invisible: bool,
    },
    Visible,
    Removed,
    ReRegistered {
        name: String,
        kind: DeviceKind,
        props: Vec<DeviceProp>,
    },
}

/// Records device lifecycle calls.
#[derive(Default)]
pub struct MockPlatform {
    events: Mutex<Vec<PlatformEvent>>,
    events_cv: Condvar,
    add_error: Mutex<Option<DriverError>>,
    re_register_error: Mutex<Option<DriverError>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_add(&self, err: DriverError) {
        *self.add_error.lock().unwrap() = Some(err);
    }

    pub fn fail_re_register(&self, err: DriverError) {
        *self.re_register_error.lock().unwrap() = Some(err);
    }

    pub fn events(&self) -> Vec<PlatformEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Waits until some recorded event matches `pred`.
    pub fn wait_for(&self, pred: impl Fn(&PlatformEvent) -> bool, timeout: Duration) -> bool {
        let events = self.events.lock().unwrap();
        let (_events, res) = self
            .events_cv
            .wait_timeout_while(events, timeout, |events| !events.iter().any(&pred))
            .unwrap();
        !res.timed_out()
    }

    fn push(&self, event: PlatformEvent) {
        self.events.lock().unwrap().push(event);
        self.events_cv.notify_all();
    }
}

impl DevicePlatform for MockPlatform {
    fn add_device(&self, args: &DeviceAddArgs<'_>) -> DriverResult {
        if let Some(err) = *self.add_error.lock().unwrap() {
            return Err(err);
        }
        self.push(PlatformEvent::Added {
            name: args.name.into(),
            kind: args.kind,
            invisible: args.invisible,
        });
        Ok(())
    }

    fn make_visible(&self) {
        self.push(PlatformEvent::Visible);
    }

    fn remove_device(&self) {
        self.push(PlatformEvent::Removed);
    }

    fn re_register_as(&self, args: &DeviceAddArgs<'_>) -> DriverResult {
        if let Some(err) = *self.re_register_error.lock().unwrap() {
            return Err(err);
        }
        self.push(PlatformEvent::ReRegistered {
            name: args.name.into(),
            kind: args.kind,
            props: args.props.to_vec(),
        });
        Ok(())
    }
}

/// A heap buffer standing in for a client VMO.
pub struct MemBuffer {
    data: NonNull<[u8]>,
    live_maps: AtomicUsize,
    total_maps: AtomicUsize,
    map_error: Mutex<Option<DriverError>>,
}

// SAFETY: the storage is only reached through raw pointers handed out by
// `map`, and the driver never maps overlapping regions concurrently.
unsafe impl Send for MemBuffer {}
unsafe impl Sync for MemBuffer {}

impl MemBuffer {
    pub fn new(size: usize) -> Arc<Self> {
        Self::filled(size, 0)
    }

    pub fn filled(size: usize, byte: u8) -> Arc<Self> {
        let data = Box::into_raw(vec![byte; size].into_boxed_slice());
        Arc::new(Self {
            // SAFETY: `Box::into_raw` never returns null.
            data: unsafe { NonNull::new_unchecked(data) },
            live_maps: AtomicUsize::new(0),
            total_maps: AtomicUsize::new(0),
            map_error: Mutex::new(None),
        })
    }

    /// Every following `map` fails with `err`.
    pub fn fail_map(&self, err: DriverError) {
        *self.map_error.lock().unwrap() = Some(err);
    }

    pub fn contents(&self) -> Vec<u8> {
        // SAFETY: the storage lives as long as `self`.
        unsafe { self.data.as_ref() }.to_vec()
    }

    /// Mappings currently outstanding.
    pub fn live_maps(&self) -> usize {
        self.live_maps.load(Ordering::SeqCst)
    }

    pub fn total_maps(&self) -> usize {
        self.total_maps.load(Ordering::SeqCst)
    }
}

unsafe impl BlockBuffer for MemBuffer {
    fn size(&self) -> usize {
        self.data.len()
    }

    fn map(&self, offset: usize, len: usize) -> DriverResult<NonNull<u8>> {
        if let Some(err) = *self.map_error.lock().unwrap() {
            return Err(err);
        }
        match offset.checked_add(len) {
            Some(end) if end <= self.size() => {}
            _ => return Err(DriverError::OutOfRange),
        }
        self.live_maps.fetch_add(1, Ordering::SeqCst);
        self.total_maps.fetch_add(1, Ordering::SeqCst);
        // SAFETY: `offset` is within the allocation, checked above.
        let addr = unsafe { self.data.cast::<u8>().add(offset) };
        Ok(addr)
    }

    unsafe fn unmap(&self, _addr: NonNull<u8>, _len: usize) {
        self.live_maps.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for MemBuffer {
    fn drop(&mut self) {
        // SAFETY: `data` came from `Box::into_raw` in `filled`.
        drop(unsafe { Box::from_raw(self.data.as_ptr()) });
    }
}
