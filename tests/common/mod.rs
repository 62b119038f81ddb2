//! Shared helpers for the scheduler integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use capacity_scheduler::SchedulerOptions;
use tokio::time::{Duration, Instant};

pub fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

pub fn with_max_capacity(max: f64) -> SchedulerOptions {
    SchedulerOptions {
        max_capacity: Some(max),
        ..SchedulerOptions::default()
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Records the label and time offset of each dispatch, so tests can assert
/// on dispatch order and timing under paused time.
#[derive(Clone)]
pub struct DispatchLog {
    base: Instant,
    entries: Arc<Mutex<Vec<(&'static str, u64)>>>,
}

impl DispatchLog {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn record(&self, label: &'static str) {
        let offset = self.base.elapsed().as_millis() as u64;
        self.entries.lock().unwrap().push((label, offset));
    }

    pub fn labels(&self) -> Vec<&'static str> {
        self.entries.lock().unwrap().iter().map(|(l, _)| *l).collect()
    }

    pub fn entries(&self) -> Vec<(&'static str, u64)> {
        self.entries.lock().unwrap().clone()
    }
}
