use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sysinfo::System;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

/// Smoothing factor for the response-time moving average.
const EMA_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub request_count: u64,
    /// Seconds, exponentially smoothed.
    pub average_response_time: f64,
    pub cpu_usage: f32,
    pub memory_usage: f32,
}

/// Per-node request counters plus the latest host resource sample.
#[derive(Default)]
pub struct NodeMetrics {
    inner: Mutex<MetricsSnapshot>,
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, elapsed: Duration) {
        let mut inner = self.inner.lock();
        let sample = elapsed.as_secs_f64();
        inner.average_response_time = if inner.request_count == 0 {
            sample
        } else {
            EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * inner.average_response_time
        };
        inner.request_count += 1;
    }

    pub fn record_resources(&self, cpu_usage: f32, memory_usage: f32) {
        let mut inner = self.inner.lock();
        inner.cpu_usage = cpu_usage;
        inner.memory_usage = memory_usage;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        *self.inner.lock()
    }
}

/// Samples CPU and memory usage until `shutdown` flips to `true`.
pub(crate) async fn run_sampler(
    metrics: Arc<NodeMetrics>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut system = System::new();
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                system.refresh_cpu();
                system.refresh_memory();
                let cpu = system.global_cpu_info().cpu_usage();
                let memory = match system.total_memory() {
                    0 => 0.0,
                    total => (system.used_memory() as f64 / total as f64 * 100.0) as f32,
                };
                metrics.record_resources(cpu, memory);
            }
        }
    }
    debug!("metrics sampler stopped");
}
