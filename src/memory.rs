//! Process memory monitor
//!
//! Samples resident-set size on an interval, keeps a bounded history, and
//! flags sustained growth above a configurable rate as a suspected leak.
//! Long-running deployments watch this instead of eyeballing RSS by hand.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::Result;
use crate::metrics;

/// Snapshot of the process memory counters, in kilobytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemorySample {
    pub rss_kb: u64,
    pub vm_kb: u64,
}

/// Reads VmRSS/VmSize from `/proc/self/status`. Returns zeros on platforms
/// without procfs.
pub fn sample_process_memory() -> Result<MemorySample> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status")?;
        let mut sample = MemorySample::default();
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                sample.rss_kb = parse_kb(rest);
            } else if let Some(rest) = line.strip_prefix("VmSize:") {
                sample.vm_kb = parse_kb(rest);
            }
        }
        Ok(sample)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Ok(MemorySample::default())
    }
}

#[cfg(target_os = "linux")]
fn parse_kb(rest: &str) -> u64 {
    rest.trim()
        .trim_end_matches("kB")
        .trim()
        .parse()
        .unwrap_or(0)
}

struct History {
    samples: VecDeque<(Instant, MemorySample)>,
    leak_detected: bool,
}

pub struct MemoryMonitor {
    interval: Duration,
    /// Sustained growth above this rate flags a leak.
    leak_threshold_mb_per_min: Mutex<f64>,
    history: Mutex<History>,
    max_history: usize,
    running: AtomicBool,
    stop_notify: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryMonitor {
    pub fn new(interval: Duration, leak_threshold_mb_per_min: f64) -> Self {
        Self {
            interval,
            leak_threshold_mb_per_min: Mutex::new(leak_threshold_mb_per_min),
            history: Mutex::new(History {
                samples: VecDeque::new(),
                leak_detected: false,
            }),
            max_history: 3600,
            running: AtomicBool::new(false),
            stop_notify: Notify::new(),
            task: Mutex::new(None),
        }
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                let stop = monitor.stop_notify.notified();
                tokio::pin!(stop);
                stop.as_mut().enable();
                if !monitor.running.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => monitor.observe(),
                    _ = &mut stop => break,
                }
            }
        });
        *self.task.lock() = Some(handle);
        info!(interval_ms = self.interval.as_millis() as u64, "Memory monitor started");
    }

    fn observe(&self) {
        let sample = match sample_process_memory() {
            Ok(sample) => sample,
            Err(e) => {
                warn!(error = %e, "Failed to sample process memory");
                return;
            }
        };
        metrics::set_memory_usage(sample.rss_kb as i64 * 1024);

        let threshold = *self.leak_threshold_mb_per_min.lock();
        let mut history = self.history.lock();
        history.samples.push_back((Instant::now(), sample));
        if history.samples.len() > self.max_history {
            history.samples.pop_front();
        }

        if let Some(rate) = growth_rate_mb_per_min(&history.samples) {
            if rate > threshold && !history.leak_detected {
                history.leak_detected = true;
                warn!(
                    rate_mb_per_min = rate,
                    threshold_mb_per_min = threshold,
                    "Sustained memory growth detected"
                );
            }
        }
    }

    /// Growth rate over the retained window, MB per minute.
    pub fn growth_rate(&self) -> Option<f64> {
        growth_rate_mb_per_min(&self.history.lock().samples)
    }

    pub fn leak_detected(&self) -> bool {
        self.history.lock().leak_detected
    }

    pub fn set_leak_threshold(&self, mb_per_min: f64) {
        *self.leak_threshold_mb_per_min.lock() = mb_per_min;
        let mut history = self.history.lock();
        history.leak_detected = false;
    }

    pub fn current(&self) -> MemorySample {
        self.history
            .lock()
            .samples
            .back()
            .map(|(_, sample)| *sample)
            .unwrap_or_default()
    }

    pub fn report_string(&self) -> String {
        let current = self.current();
        format!(
            "memory: rss={}MB vm={}MB growth={:.2}MB/min leak={}",
            current.rss_kb / 1024,
            current.vm_kb / 1024,
            self.growth_rate().unwrap_or(0.0),
            self.leak_detected(),
        )
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop_notify.notify_waiters();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

fn growth_rate_mb_per_min(samples: &VecDeque<(Instant, MemorySample)>) -> Option<f64> {
    let (first_at, first) = samples.front()?;
    let (last_at, last) = samples.back()?;
    let elapsed = last_at.duration_since(*first_at).as_secs_f64();
    if elapsed < 1.0 {
        return None;
    }
    let delta_mb = (last.rss_kb as f64 - first.rss_kb as f64) / 1024.0;
    Some(delta_mb * 60.0 / elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_reports_rss_on_linux() {
        let sample = sample_process_memory().unwrap();
        if cfg!(target_os = "linux") {
            assert!(sample.rss_kb > 0, "a running process has a resident set");
            assert!(sample.vm_kb >= sample.rss_kb);
        }
    }

    #[test]
    fn test_growth_rate_needs_elapsed_time() {
        let mut samples = VecDeque::new();
        assert!(growth_rate_mb_per_min(&samples).is_none());
        let now = Instant::now();
        samples.push_back((
            now,
            MemorySample {
                rss_kb: 1024,
                vm_kb: 2048,
            },
        ));
        assert!(growth_rate_mb_per_min(&samples).is_none());
    }

    #[test]
    fn test_growth_rate_computation() {
        let mut samples = VecDeque::new();
        let start = Instant::now() - Duration::from_secs(60);
        samples.push_back((
            start,
            MemorySample {
                rss_kb: 10 * 1024,
                vm_kb: 0,
            },
        ));
        samples.push_back((
            start + Duration::from_secs(60),
            MemorySample {
                rss_kb: 15 * 1024,
                vm_kb: 0,
            },
        ));
        let rate = growth_rate_mb_per_min(&samples).unwrap();
        assert!((rate - 5.0).abs() < 0.01, "5MB over a minute, got {rate}");
    }

    #[tokio::test]
    async fn test_monitor_lifecycle_and_leak_flag() {
        let monitor = Arc::new(MemoryMonitor::new(Duration::from_millis(10), 1e9));
        monitor.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!monitor.leak_detected(), "huge threshold never trips");
        let report = monitor.report_string();
        assert!(report.starts_with("memory: rss="));
        monitor.stop().await;

        // Impossible-to-miss threshold: any growth at all trips it, but a
        // flat line must not.
        monitor.set_leak_threshold(-1.0);
        assert!(!monitor.leak_detected(), "reset clears the flag");
    }
}
