use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

pub static METER: Meter = Meter::new();

/// Throughput counters of the detection endpoint.
#[derive(Default)]
pub struct Meter {
    requests: AtomicU64,
    detected: AtomicU64,
    failed: AtomicU64,
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            requests: AtomicU64::new(0),
            detected: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn tick_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_detected(&self) {
        self.detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_reset_requests(&self) -> u64 {
        self.requests.swap(0, Ordering::Relaxed)
    }

    pub fn get_reset_detected(&self) -> u64 {
        self.detected.swap(0, Ordering::Relaxed)
    }

    pub fn get_reset_failed(&self) -> u64 {
        self.failed.swap(0, Ordering::Relaxed)
    }
}

pub fn spawn_meter_logger() -> JoinHandle<()> {
    tokio::spawn(async {
        let mut log_interval = interval(Duration::from_secs(2));
        log_interval.tick().await;

        loop {
            let start = Instant::now();
            log_interval.tick().await;

            let requests = METER.get_reset_requests();
            let detected = METER.get_reset_detected();
            let failed = METER.get_reset_failed();
            let elapsed = start.elapsed().as_secs_f32();

            if requests > 0 {
                log::info!(
                    "Detect requests per second: {:.2} ({:.2} served, {:.2} failed)",
                    requests as f32 / elapsed,
                    detected as f32 / elapsed,
                    failed as f32 / elapsed,
                )
            }
        }
    })
}
