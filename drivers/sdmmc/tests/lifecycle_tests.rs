mod common;

use std::{
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};

use block::{BlockImplOps, BlockOp, BlockRw, DeviceKind, DriverError};
use common::{Completions, TIMEOUT, bind, bind_ready, fast_config, wait_phase};
use driver_base::{DeviceProp, DevicePropKey};
use sdmmc::{
    CardFamily, CardPhase, CardState, CardStatus, SDMMC_READ_BLOCK, SdioHwInfo, SdmmcConfig,
    SdmmcDevice,
    mock::{HostCall, MOCK_BLOCK_SIZE, MOCK_RCA, MemBuffer, MockHost, MockPlatform, PlatformEvent},
};

fn read(buffer: &Arc<MemBuffer>, offset_dev: u64) -> BlockOp {
    BlockOp::Read(BlockRw::new(buffer.clone(), offset_dev, 0, 1))
}

fn added_block_device() -> PlatformEvent {
    PlatformEvent::Added {
        name: "sdmmc".into(),
        kind: DeviceKind::Block,
        invisible: true,
    }
}

#[test]
fn bring_up_makes_the_device_visible() {
    let (dev, host, platform) = bind_ready(MockHost::sd_card(100));

    assert!(platform.wait_for(|e| *e == PlatformEvent::Visible, TIMEOUT));
    assert_eq!(platform.events(), [added_block_device(), PlatformEvent::Visible]);
    assert_eq!(dev.card_family(), CardFamily::Sd);
    assert_eq!(dev.get_size(), 100 * MOCK_BLOCK_SIZE as u64);

    let info = dev.card_info().unwrap();
    assert_eq!(info.rca, MOCK_RCA);
    assert_eq!(info.block_info.max_transfer_size, host.host_info_value().max_transfer_size);
    assert_eq!(host.count(&HostCall::SendStatus(MOCK_RCA)), 1);
}

#[test]
fn release_fails_everything_not_yet_executed() {
    let (dev, host, _platform) = bind_ready(MockHost::sd_card(100));
    let dev = Arc::new(dev);
    let buffer = MemBuffer::new(MOCK_BLOCK_SIZE as usize);
    let done = Completions::new();

    host.pause();
    dev.queue(read(&buffer, 0), done.callback(), 1);
    assert!(host.wait_entered(1, TIMEOUT));
    for cookie in 2..5 {
        dev.queue(read(&buffer, cookie as u64), done.callback(), cookie);
    }
    assert_eq!(dev.pending(), 3);

    let releaser = {
        let dev = dev.clone();
        thread::spawn(move || dev.release())
    };
    wait_phase(&dev, |phase| phase == CardPhase::ShuttingDown);
    thread::sleep(Duration::from_millis(20));
    // The in-flight request finishes; the rest never reach the card.
    host.resume();
    releaser.join().unwrap();

    let statuses: Vec<_> = done.all().iter().map(|c| (c.cookie, c.status)).collect();
    assert_eq!(
        statuses,
        [
            (1, Ok(())),
            (2, Err(DriverError::BadState)),
            (3, Err(DriverError::BadState)),
            (4, Err(DriverError::BadState))
        ]
    );
    assert_eq!(host.data_calls().len(), 1);
    assert_eq!(dev.pending(), 0);

    // Nothing is accepted any more.
    dev.queue(BlockOp::Flush, done.callback(), 5);
    assert_eq!(done.all()[4].status, Err(DriverError::BadState));
    dev.release();
    assert_eq!(done.len(), 5);
}

#[test]
fn dropping_the_device_releases_it() {
    let (dev, host, _platform) = bind_ready(MockHost::mmc_card(16));
    let buffer = MemBuffer::new(MOCK_BLOCK_SIZE as usize);
    let done = Completions::new();

    host.pause();
    dev.queue(read(&buffer, 0), done.callback(), 1);
    assert!(host.wait_entered(1, TIMEOUT));
    dev.queue(read(&buffer, 1), done.callback(), 2);

    let dropper = thread::spawn(move || drop(dev));
    thread::sleep(Duration::from_millis(50));
    host.resume();
    dropper.join().unwrap();

    let statuses: Vec<_> = done.all().iter().map(|c| c.status).collect();
    assert_eq!(statuses, [Ok(()), Err(DriverError::BadState)]);
}

#[test]
fn no_card_removes_the_device_and_accepts_nothing() {
    let (dev, host, platform) = bind(MockHost::no_card());
    let settled = wait_phase(&dev, |phase| {
        !matches!(phase, CardPhase::Idle | CardPhase::ProtocolProbe)
    });
    assert_eq!(settled, CardPhase::Failed);
    assert!(platform.wait_for(|e| *e == PlatformEvent::Removed, TIMEOUT));

    let done = Completions::new();
    let buffer = MemBuffer::new(MOCK_BLOCK_SIZE as usize);
    dev.queue(read(&buffer, 0), done.callback(), 1);
    dev.queue(BlockOp::Flush, done.callback(), 2);

    assert!(done.all().iter().all(|c| c.status == Err(DriverError::BadState)));
    assert_eq!(done.len(), 2);
    assert!(host.data_calls().is_empty());
    assert_eq!(platform.events(), [added_block_device(), PlatformEvent::Removed]);
    assert_eq!(dev.card_family(), CardFamily::Unknown);
    assert_eq!(dev.get_size(), 0);
}

#[test]
fn card_never_reaching_tran_is_fatal() {
    let host = MockHost::sd_card(100);
    host.script_status((0..50).map(|_| Ok(CardStatus::from_state(CardState::Prg))));
    let (dev, host, platform) = bind(host);

    assert!(platform.wait_for(|e| *e == PlatformEvent::Removed, TIMEOUT));
    assert_eq!(wait_phase(&dev, |phase| phase == CardPhase::Failed), CardPhase::Failed);
    assert_eq!(host.count(&HostCall::SendStatus(MOCK_RCA)), 10);
    assert!(!platform.events().contains(&PlatformEvent::Visible));
}

#[test]
fn host_info_failure_is_fatal() {
    let host = MockHost::sd_card(100);
    host.fail_host_info(DriverError::Io);
    let (dev, host, platform) = bind(host);

    assert!(platform.wait_for(|e| *e == PlatformEvent::Removed, TIMEOUT));
    wait_phase(&dev, |phase| phase == CardPhase::Failed);
    assert_eq!(host.calls(), [HostCall::HostInfo]);
}

#[test]
fn sdio_card_is_reclassified() {
    let hw_info = SdioHwInfo {
        manufacturer_id: 0x02d0,
        product_id: 0xa9a6,
        num_funcs: 2,
    };
    let (dev, host, platform) = bind(MockHost::sdio_card(hw_info));

    assert!(platform.wait_for(|e| matches!(e, PlatformEvent::ReRegistered { .. }), TIMEOUT));
    assert_eq!(
        platform.events(),
        [
            added_block_device(),
            PlatformEvent::Removed,
            PlatformEvent::ReRegistered {
                name: "sdio".into(),
                kind: DeviceKind::Sdio,
                props: vec![
                    DeviceProp::new(DevicePropKey::VendorId, 0x02d0),
                    DeviceProp::new(DevicePropKey::ProductId, 0xa9a6),
                ],
            },
        ]
    );
    assert_eq!(dev.card_family(), CardFamily::Sdio);
    assert!(dev.card_info().is_none());
    assert!(!host.calls().iter().any(|c| matches!(c, HostCall::SendStatus(_))));

    // There is no block queue behind an SDIO card.
    let done = Completions::new();
    dev.queue(BlockOp::Flush, done.callback(), 1);
    assert_eq!(done.all()[0].status, Err(DriverError::BadState));
    assert!(host.data_calls().is_empty());
}

#[test]
fn sdio_re_register_failure_is_fatal() {
    let host = Arc::new(MockHost::sdio_card(SdioHwInfo::default()));
    let platform = Arc::new(MockPlatform::new());
    platform.fail_re_register(DriverError::NoMemory);
    let dev = SdmmcDevice::bind(host, platform.clone(), fast_config()).unwrap();

    assert_eq!(wait_phase(&dev, |phase| phase == CardPhase::Failed), CardPhase::Failed);
    assert_eq!(platform.events(), [added_block_device(), PlatformEvent::Removed]);
}

#[test]
fn release_during_bring_up_publishes_nothing() {
    let host = Arc::new(MockHost::sd_card(100));
    host.script_status((0..50).map(|_| Ok(CardStatus::from_state(CardState::Stby))));
    let platform = Arc::new(MockPlatform::new());
    let config = SdmmcConfig {
        tran_poll_interval: Duration::from_millis(20),
        ..fast_config()
    };
    let dev = SdmmcDevice::bind(host.clone(), platform.clone(), config).unwrap();

    // Returns once the worker noticed the sticky shutdown request.
    dev.release();
    assert_eq!(dev.phase(), CardPhase::ShuttingDown);
    assert!(dev.card_info().is_none());
    assert_eq!(dev.get_size(), 0);
    assert_eq!(platform.events(), [added_block_device()]);
    assert!(host.count(&HostCall::SendStatus(MOCK_RCA)) < 50);

    let done = Completions::new();
    dev.queue(BlockOp::Flush, done.callback(), 1);
    assert_eq!(done.all()[0].status, Err(DriverError::BadState));
    assert!(host.data_calls().is_empty());
}

#[test]
fn worker_panic_does_not_hang_release() {
    let (dev, host, _platform) = bind_ready(MockHost::sd_card(16));
    let buffer = MemBuffer::new(MOCK_BLOCK_SIZE as usize);
    let done = Completions::new();

    host.panic_on_cmd(SDMMC_READ_BLOCK);
    dev.queue(read(&buffer, 0), done.callback(), 1);
    dev.queue(BlockOp::Flush, done.callback(), 2);

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        drop(dev);
        tx.send(()).unwrap();
    });
    assert!(rx.recv_timeout(TIMEOUT).is_ok(), "drop never returned");

    // The read went down with the worker; the flush behind it is failed.
    let statuses: Vec<_> = done.all().iter().map(|c| (c.cookie, c.status)).collect();
    assert_eq!(statuses, [(2, Err(DriverError::BadState))]);
    assert_eq!(host.data_calls().len(), 1);
}

#[test]
fn concurrent_releases_both_wait_for_the_drain() {
    let (dev, host, _platform) = bind_ready(MockHost::sd_card(100));
    let dev = Arc::new(dev);
    let buffer = MemBuffer::new(MOCK_BLOCK_SIZE as usize);
    let done = Completions::new();

    host.pause();
    dev.queue(read(&buffer, 0), done.callback(), 1);
    assert!(host.wait_entered(1, TIMEOUT));
    for cookie in 2..5 {
        dev.queue(read(&buffer, cookie as u64), done.callback(), cookie);
    }

    let releasers: Vec<_> = (0..2)
        .map(|_| {
            let (dev, done) = (dev.clone(), done.clone());
            thread::spawn(move || {
                dev.release();
                done.len()
            })
        })
        .collect();
    wait_phase(&dev, |phase| phase == CardPhase::ShuttingDown);
    thread::sleep(Duration::from_millis(20));
    assert!(releasers.iter().all(|r| !r.is_finished()));
    host.resume();

    // Neither caller came back before every request was completed.
    for releaser in releasers {
        assert_eq!(releaser.join().unwrap(), 4);
    }
    assert_eq!(done.cookies(), [1, 2, 3, 4]);
}
