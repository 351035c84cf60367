#![allow(dead_code)]

use std::{
    sync::{Arc, Condvar, Mutex},
    thread,
    time::Duration,
};

use block::{BlockOp, CompletionFn, DriverResult};
use sdmmc::{
    CardPhase, SdmmcConfig, SdmmcDevice,
    mock::{MockHost, MockPlatform},
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub type Device = SdmmcDevice<MockHost, MockPlatform>;

/// Completion as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub cookie: usize,
    pub status: DriverResult,
    pub op: &'static str,
}

/// Collects completions in the order they arrive.
#[derive(Default, Clone)]
pub struct Completions {
    inner: Arc<(Mutex<Vec<Completion>>, Condvar)>,
}

impl Completions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> CompletionFn {
        let inner = self.inner.clone();
        Box::new(move |cookie: usize, status: DriverResult, op: BlockOp| {
            let (list, cv) = &*inner;
            list.lock().unwrap().push(Completion {
                cookie,
                status,
                op: op.name(),
            });
            cv.notify_all();
        })
    }

    pub fn all(&self) -> Vec<Completion> {
        self.inner.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.0.lock().unwrap().len()
    }

    pub fn cookies(&self) -> Vec<usize> {
        self.all().iter().map(|c| c.cookie).collect()
    }

    /// Waits for at least `n` completions and returns them.
    pub fn wait_for(&self, n: usize) -> Vec<Completion> {
        let (list, cv) = &*self.inner;
        let (list, res) = cv
            .wait_timeout_while(list.lock().unwrap(), TIMEOUT, |list| list.len() < n)
            .unwrap();
        assert!(!res.timed_out(), "only {} of {n} completions", list.len());
        list.clone()
    }
}

pub fn fast_config() -> SdmmcConfig {
    SdmmcConfig {
        tran_poll_interval: Duration::from_millis(1),
        ..SdmmcConfig::default()
    }
}

pub fn bind(host: MockHost) -> (Device, Arc<MockHost>, Arc<MockPlatform>) {
    let host = Arc::new(host);
    let platform = Arc::new(MockPlatform::new());
    let dev = SdmmcDevice::bind(host.clone(), platform.clone(), fast_config()).unwrap();
    (dev, host, platform)
}

/// Polls until the card phase satisfies `pred`.
pub fn wait_phase(dev: &Device, pred: impl Fn(CardPhase) -> bool) -> CardPhase {
    let step = Duration::from_millis(1);
    let mut waited = Duration::ZERO;
    loop {
        let phase = dev.phase();
        if pred(phase) {
            return phase;
        }
        assert!(waited < TIMEOUT, "stuck in phase {phase:?}");
        thread::sleep(step);
        waited += step;
    }
}

pub fn bind_ready(host: MockHost) -> (Device, Arc<MockHost>, Arc<MockPlatform>) {
    let (dev, host, platform) = bind(host);
    wait_phase(&dev, |phase| phase == CardPhase::Ready);
    (dev, host, platform)
}
