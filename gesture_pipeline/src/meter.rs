use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};
use tokio_util::sync::CancellationToken;

/// Pipeline stage a frame reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Captured,
    Skipped,
    Inferred,
    Rendered,
}

/// Frame counts per stage since the last reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeterReading {
    pub captured: u64,
    pub skipped: u64,
    pub inferred: u64,
    pub rendered: u64,
}

/// Per-stage frame throughput counters.
#[derive(Debug, Default)]
pub struct Meter {
    counters: [AtomicU64; 4],
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            counters: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
        }
    }

    pub fn record(&self, stage: Stage) {
        self.counters[stage as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters and start over from zero.
    pub fn take_reading(&self) -> MeterReading {
        let take = |stage: Stage| self.counters[stage as usize].swap(0, Ordering::Relaxed);
        MeterReading {
            captured: take(Stage::Captured),
            skipped: take(Stage::Skipped),
            inferred: take(Stage::Inferred),
            rendered: take(Stage::Rendered),
        }
    }
}

/// Log frame rates every two seconds until `cancel` fires.
pub fn spawn_meter_logger(meter: Arc<Meter>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut log_interval = interval(Duration::from_secs(2));
        log_interval.tick().await;

        loop {
            let start = Instant::now();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = log_interval.tick() => (),
            }

            let reading = meter.take_reading();
            if reading.captured == 0 {
                continue;
            }
            let elapsed = start.elapsed().as_secs_f32();
            log::info!(
                "Frames per second: {:.2} captured, {:.2} inferred, {:.2} rendered",
                reading.captured as f32 / elapsed,
                reading.inferred as f32 / elapsed,
                reading.rendered as f32 / elapsed
            );
            if reading.skipped > 0 {
                log::warn!("{} undecodable frames skipped", reading.skipped);
            }
        }
    })
}
