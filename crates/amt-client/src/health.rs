//! Host resource watchdog
//!
//! The forwarding loop samples CPU and memory utilisation on a fixed cadence.
//! A run of consecutive samples above the high-water mark means the host is
//! struggling to keep up with the stream, and the session is rebuilt.

use crate::config::HealthConfig;
use sysinfo::System;
use tokio::time::Instant;

/// One utilisation reading, in percent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub mem_percent: f32,
}

/// Source of host utilisation readings
pub trait ResourceSampler: Send {
    fn sample(&mut self) -> ResourceSample;
}

/// Reads host-wide utilisation through `sysinfo`
pub struct SystemSampler {
    system: System,
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta between two refreshes; prime the first one
        system.refresh_cpu_all();
        system.refresh_memory();
        Self { system }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&mut self) -> ResourceSample {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();

        let total = self.system.total_memory();
        let mem_percent = if total == 0 {
            0.0
        } else {
            (self.system.used_memory() as f64 / total as f64 * 100.0) as f32
        };

        ResourceSample {
            cpu_percent: self.system.global_cpu_usage(),
            mem_percent,
        }
    }
}

/// Outcome of recording a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Normal,
    High { consecutive: u32 },
    /// The consecutive-high ceiling was reached
    RestartRequired,
}

/// Consecutive-high-usage counter
#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,
    consecutive_high: u32,
    last_check: Instant,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            consecutive_high: 0,
            last_check: Instant::now(),
        }
    }

    /// Whether a full sampling interval has passed since the last sample
    pub fn is_due(&self, now: Instant) -> bool {
        now.duration_since(self.last_check) >= self.config.interval
    }

    /// Take and record a sample from `sampler`
    pub fn check(&mut self, sampler: &mut dyn ResourceSampler, now: Instant) -> HealthVerdict {
        self.last_check = now;
        let sample = sampler.sample();
        let verdict = self.record(sample);

        match verdict {
            HealthVerdict::Normal => tracing::debug!(
                cpu_percent = sample.cpu_percent,
                mem_percent = sample.mem_percent,
                "Resource usage normal"
            ),
            HealthVerdict::High { consecutive } => tracing::warn!(
                cpu_percent = sample.cpu_percent,
                mem_percent = sample.mem_percent,
                consecutive,
                "High resource usage"
            ),
            HealthVerdict::RestartRequired => tracing::warn!(
                cpu_percent = sample.cpu_percent,
                mem_percent = sample.mem_percent,
                consecutive = self.consecutive_high,
                "Sustained high resource usage, restart required"
            ),
        }

        verdict
    }

    pub fn record(&mut self, sample: ResourceSample) -> HealthVerdict {
        let high = sample.cpu_percent > self.config.high_water_percent
            || sample.mem_percent > self.config.high_water_percent;

        if !high {
            self.consecutive_high = 0;
            return HealthVerdict::Normal;
        }

        self.consecutive_high += 1;
        if self.consecutive_high >= self.config.max_consecutive_high {
            HealthVerdict::RestartRequired
        } else {
            HealthVerdict::High {
                consecutive: self.consecutive_high,
            }
        }
    }

    /// Clear the counter after a successful restart
    pub fn reset(&mut self) {
        self.consecutive_high = 0;
    }

    pub fn consecutive_high(&self) -> u32 {
        self.consecutive_high
    }
}
