//! Process memory sampling and the spill policy for working dictionaries.

use std::sync::Mutex;

use sysinfo::System;
use tracing::{debug, info};

use crate::error::Result;
use crate::indexing::builder::SpaceIndexer;

/// Resident memory of this process against the memory of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemorySample {
    pub resident_bytes: u64,
    pub total_bytes: u64,
}

impl MemorySample {
    /// Fraction of total memory in use, `0.0` when the total is unknown.
    #[allow(clippy::cast_precision_loss)]
    pub fn usage_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.resident_bytes as f64 / self.total_bytes as f64
        }
    }
}

/// Source of memory samples. Swapped for a fixed probe in tests.
pub trait MemoryProbe: Send {
    fn sample(&self) -> MemorySample;
}

/// Reads resident memory from the operating system.
pub struct SystemProbe {
    system: Mutex<System>,
    total_bytes: u64,
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let total_bytes = system.total_memory();
        Self { system: Mutex::new(system), total_bytes }
    }

    fn resident_bytes(&self) -> u64 {
        #[cfg(target_os = "linux")]
        {
            match resident_linux() {
                bytes if bytes > 0 => bytes,
                _ => self.resident_sysinfo(),
            }
        }
        #[cfg(target_os = "macos")]
        {
            match resident_macos() {
                Some(bytes) if bytes > 0 => bytes,
                _ => self.resident_sysinfo(),
            }
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            self.resident_sysinfo()
        }
    }

    fn resident_sysinfo(&self) -> u64 {
        let Ok(pid) = sysinfo::get_current_pid() else {
            return 0;
        };
        let Ok(mut system) = self.system.lock() else {
            return 0;
        };
        system.refresh_process(pid);
        system.process(pid).map_or(0, |process| process.memory())
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemProbe {
    fn sample(&self) -> MemorySample {
        MemorySample { resident_bytes: self.resident_bytes(), total_bytes: self.total_bytes }
    }
}

#[cfg(target_os = "linux")]
fn resident_linux() -> u64 {
    if let Ok(contents) = std::fs::read_to_string("/proc/self/status") {
        for line in contents.lines() {
            if line.starts_with("VmRSS:") {
                let parts: Vec<&str> = line.split_whitespace().collect();
                if parts.len() >= 2 {
                    if let Ok(kb) = parts[1].parse::<u64>() {
                        return kb * 1024;
                    }
                }
            }
        }
    }
    0
}

#[cfg(target_os = "macos")]
fn resident_macos() -> Option<u64> {
    use std::process::Command;

    let output =
        Command::new("ps").args(["-o", "rss=", "-p", &std::process::id().to_string()]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let rss_kb: u64 = std::str::from_utf8(&output.stdout).ok()?.trim().parse().ok()?;
    Some(rss_kb * 1024)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryStats {
    pub current_bytes: u64,
    pub peak_bytes: u64,
    pub total_measurements: usize,
    pub avg_bytes: f64,
    pub spills: u64,
}

/// Polled once per chunk: spills a working dictionary into its persistent
/// index when the process gets close to the memory ceiling or the
/// dictionary grows past its entry cap.
pub struct MemoryGuard {
    probe: Box<dyn MemoryProbe>,
    threshold: f64,
    max_working_entries: usize,
    current_bytes: u64,
    peak_bytes: u64,
    resident_sum: u128,
    total_measurements: usize,
    spills: u64,
}

impl MemoryGuard {
    pub fn new(probe: Box<dyn MemoryProbe>, threshold: f64, max_working_entries: usize) -> Self {
        Self {
            probe,
            threshold,
            max_working_entries,
            current_bytes: 0,
            peak_bytes: 0,
            resident_sum: 0,
            total_measurements: 0,
            spills: 0,
        }
    }

    /// Take a sample and fold it into the running statistics.
    pub fn record(&mut self) -> MemorySample {
        let sample = self.probe.sample();
        self.current_bytes = sample.resident_bytes;
        self.peak_bytes = self.peak_bytes.max(sample.resident_bytes);
        self.resident_sum += u128::from(sample.resident_bytes);
        self.total_measurements += 1;
        sample
    }

    /// Persist and clear the working dictionary of `indexer` when memory use
    /// exceeds the threshold or the dictionary holds too many entries.
    /// Returns whether a spill happened.
    pub fn check_and_maybe_flush(&mut self, indexer: &mut SpaceIndexer) -> Result<bool> {
        let pending = indexer.working_len();
        if pending == 0 {
            return Ok(false);
        }

        let sample = self.record();
        let over_memory = sample.usage_ratio() > self.threshold;
        let over_entries = pending > self.max_working_entries;
        debug!(
            space = %indexer.space(),
            usage = sample.usage_ratio(),
            pending,
            "memory check"
        );
        if !over_memory && !over_entries {
            return Ok(false);
        }

        info!(
            space = %indexer.space(),
            pending,
            resident = %format_bytes(sample.resident_bytes),
            usage = sample.usage_ratio(),
            over_entries,
            "spilling working dictionary to the index"
        );
        indexer.checkpoint()?;
        self.spills += 1;
        Ok(true)
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> MemoryStats {
        let avg_bytes = if self.total_measurements == 0 {
            0.0
        } else {
            self.resident_sum as f64 / self.total_measurements as f64
        };

        MemoryStats {
            current_bytes: self.current_bytes,
            peak_bytes: self.peak_bytes,
            total_measurements: self.total_measurements,
            avg_bytes,
            spills: self.spills,
        }
    }

    pub fn spills(&self) -> u64 {
        self.spills
    }
}

/// Format bytes in human-readable format
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_ratio() {
        let sample = MemorySample { resident_bytes: 95, total_bytes: 100 };
        assert!((sample.usage_ratio() - 0.95).abs() < f64::EPSILON);
        assert_eq!(MemorySample::default().usage_ratio(), 0.0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    struct SteppingProbe(Mutex<u64>);

    impl MemoryProbe for SteppingProbe {
        fn sample(&self) -> MemorySample {
            let mut next = self.0.lock().unwrap();
            *next += 10;
            MemorySample { resident_bytes: *next, total_bytes: 1000 }
        }
    }

    #[test]
    fn test_stats_keep_running_totals() {
        let mut guard = MemoryGuard::new(Box::new(SteppingProbe(Mutex::new(0))), 0.9, 10);
        for _ in 0..3 {
            guard.record();
        }
        let stats = guard.stats();
        assert_eq!(stats.current_bytes, 30);
        assert_eq!(stats.peak_bytes, 30);
        assert_eq!(stats.total_measurements, 3);
        assert!((stats.avg_bytes - 20.0).abs() < f64::EPSILON);
        assert_eq!(stats.spills, 0);
    }

    #[test]
    fn test_system_probe_reports_memory() {
        let sample = SystemProbe::new().sample();
        assert!(sample.total_bytes > 0);
        assert!(sample.usage_ratio() <= 1.0);
    }
}
