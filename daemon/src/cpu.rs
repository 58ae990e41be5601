// Copyright 2023 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! The reference-counted custodian of CPU frequency state: scaling
//! governors and, where the Intel energy-bias file exists, the energy
//! policy level. Originals are captured on the first acquire and restored
//! exactly once when the last holder releases.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use crate::session::SessionId;

/// Governor written while at least one session holds the manager.
pub const GOVERNOR_PERFORMANCE: &str = "performance";

/// Energy policy level written while held. 0 is full performance.
pub const ENERGY_BIAS_PERFORMANCE: &str = "0";

const DEFAULT_SYSFS_ROOT: &str = "/sys/devices/system/cpu";

#[derive(Default)]
struct CpuFreqState {
    holders: BTreeSet<SessionId>,
    governors: HashMap<usize, String>,
    energy_bias: HashMap<usize, String>,
}

/// Serializes governor and energy-bias transitions behind one mutex so
/// that the first acquire and the last release are atomic.
pub struct CpuFreqManager {
    cpu_count: usize,
    sysfs_root: PathBuf,
    state: Mutex<CpuFreqState>,
}

impl CpuFreqManager {
    pub fn new(cpu_count: usize) -> Self {
        Self::with_root(cpu_count, DEFAULT_SYSFS_ROOT)
    }

    pub fn with_root(cpu_count: usize, root: impl Into<PathBuf>) -> Self {
        Self {
            cpu_count,
            sysfs_root: root.into(),
            state: Mutex::new(CpuFreqState::default()),
        }
    }

    /// Whether governors can be managed at all.
    #[must_use]
    pub fn available(&self) -> bool {
        self.cpu_count > 0 && self.governor_path(0).exists()
    }

    fn governor_path(&self, cpu: usize) -> PathBuf {
        let mut itoa = itoa::Buffer::new();
        self.sysfs_root
            .join(["cpu", itoa.format(cpu)].concat())
            .join("cpufreq/scaling_governor")
    }

    fn energy_bias_path(&self, cpu: usize) -> PathBuf {
        let mut itoa = itoa::Buffer::new();
        self.sysfs_root
            .join(["cpu", itoa.format(cpu)].concat())
            .join("power/energy_perf_bias")
    }

    /// Switches every CPU to the performance governor (and energy bias),
    /// capturing the previous values when this is the first holder.
    pub async fn acquire(&self, session: SessionId) {
        let mut state = self.state.lock().await;

        if state.holders.is_empty() {
            state.governors = self.capture_and_write_governors().await;
            state.energy_bias = self.capture_and_write_energy_bias().await;
        }

        state.holders.insert(session);
    }

    /// Restores the captured state once the last holder releases.
    pub async fn release(&self, session: SessionId) {
        let mut state = self.state.lock().await;

        if !state.holders.remove(&session) || !state.holders.is_empty() {
            return;
        }

        // Restoration happens under the lock so that a concurrent first
        // acquire cannot capture a half-restored state.
        let governors = std::mem::take(&mut state.governors);
        let energy_bias = std::mem::take(&mut state.energy_bias);

        let mut restored = Vec::new();
        for (cpu, governor) in &governors {
            if write_value(&self.governor_path(*cpu), governor).await {
                restored.push(*cpu);
            }
        }

        if !restored.is_empty() {
            restored.sort_unstable();
            tracing::info!("CPUs {:?} frequency governors restored", restored);
        }

        for (cpu, bias) in &energy_bias {
            write_value(&self.energy_bias_path(*cpu), bias).await;
        }
    }

    async fn capture_and_write_governors(&self) -> HashMap<usize, String> {
        let mut captured = HashMap::new();
        let mut changed = Vec::new();

        for cpu in 0..self.cpu_count {
            let path = self.governor_path(cpu);

            let governor = match tokio::fs::read_to_string(&path).await {
                Ok(governor) => governor.trim().to_owned(),
                Err(_) => {
                    tracing::warn!("could not read governor of CPU {}: {} not found", cpu, path.display());
                    continue;
                }
            };

            if governor == GOVERNOR_PERFORMANCE {
                continue;
            }

            if write_value(&path, GOVERNOR_PERFORMANCE).await {
                captured.insert(cpu, governor);
                changed.push(cpu);
            }
        }

        if !changed.is_empty() {
            tracing::info!(
                "CPUs {:?} frequency governor changed to '{}'",
                changed,
                GOVERNOR_PERFORMANCE
            );
        }

        captured
    }

    async fn capture_and_write_energy_bias(&self) -> HashMap<usize, String> {
        let mut captured = HashMap::new();

        for cpu in 0..self.cpu_count {
            let path = self.energy_bias_path(cpu);

            // The energy bias file only exists on Intel CPUs.
            let Ok(bias) = tokio::fs::read_to_string(&path).await else {
                continue;
            };

            let bias = bias.trim().to_owned();
            if bias == ENERGY_BIAS_PERFORMANCE {
                continue;
            }

            if write_value(&path, ENERGY_BIAS_PERFORMANCE).await {
                tracing::info!("CPU {} energy policy level changed to full performance", cpu);
                captured.insert(cpu, bias);
            }
        }

        captured
    }
}

async fn write_value(path: &Path, value: &str) -> bool {
    match tokio::fs::write(path, value).await {
        Ok(()) => true,
        Err(why) => {
            tracing::error!("failed to write '{}' to {}: {}", value, path.display(), why);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_sysfs(cpus: usize, governor: &str, bias: Option<&str>) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();

        for cpu in 0..cpus {
            let cpufreq = dir.path().join(format!("cpu{cpu}/cpufreq"));
            std::fs::create_dir_all(&cpufreq).unwrap();
            std::fs::write(cpufreq.join("scaling_governor"), governor).unwrap();

            if let Some(bias) = bias {
                let power = dir.path().join(format!("cpu{cpu}/power"));
                std::fs::create_dir_all(&power).unwrap();
                std::fs::write(power.join("energy_perf_bias"), bias).unwrap();
            }
        }

        dir
    }

    fn governor_of(dir: &tempfile::TempDir, cpu: usize) -> String {
        std::fs::read_to_string(dir.path().join(format!("cpu{cpu}/cpufreq/scaling_governor"))).unwrap()
    }

    fn bias_of(dir: &tempfile::TempDir, cpu: usize) -> String {
        std::fs::read_to_string(dir.path().join(format!("cpu{cpu}/power/energy_perf_bias"))).unwrap()
    }

    #[tokio::test]
    async fn acquire_release_round_trip() {
        let sysfs = fake_sysfs(2, "schedutil", Some("6"));
        let manager = CpuFreqManager::with_root(2, sysfs.path());

        manager.acquire(1).await;
        assert_eq!(governor_of(&sysfs, 0), GOVERNOR_PERFORMANCE);
        assert_eq!(governor_of(&sysfs, 1), GOVERNOR_PERFORMANCE);
        assert_eq!(bias_of(&sysfs, 0), ENERGY_BIAS_PERFORMANCE);

        manager.release(1).await;
        assert_eq!(governor_of(&sysfs, 0), "schedutil");
        assert_eq!(governor_of(&sysfs, 1), "schedutil");
        assert_eq!(bias_of(&sysfs, 0), "6");
    }

    #[tokio::test]
    async fn overlapping_sessions_restore_once() {
        let sysfs = fake_sysfs(1, "powersave", None);
        let manager = CpuFreqManager::with_root(1, sysfs.path());

        manager.acquire(1).await;
        manager.acquire(2).await;
        assert_eq!(governor_of(&sysfs, 0), GOVERNOR_PERFORMANCE);

        // First release keeps the altered state while a holder remains.
        manager.release(1).await;
        assert_eq!(governor_of(&sysfs, 0), GOVERNOR_PERFORMANCE);

        manager.release(2).await;
        assert_eq!(governor_of(&sysfs, 0), "powersave");

        // A second release of the same session does not restore again.
        std::fs::write(sysfs.path().join("cpu0/cpufreq/scaling_governor"), "ondemand").unwrap();
        manager.release(2).await;
        assert_eq!(governor_of(&sysfs, 0), "ondemand");
    }

    #[tokio::test]
    async fn recaptures_after_drain() {
        let sysfs = fake_sysfs(1, "powersave", None);
        let manager = CpuFreqManager::with_root(1, sysfs.path());

        manager.acquire(1).await;
        manager.release(1).await;

        // A new empty-to-non-empty transition captures the current value,
        // even if it changed in between.
        std::fs::write(sysfs.path().join("cpu0/cpufreq/scaling_governor"), "ondemand").unwrap();
        manager.acquire(2).await;
        assert_eq!(governor_of(&sysfs, 0), GOVERNOR_PERFORMANCE);
        manager.release(2).await;
        assert_eq!(governor_of(&sysfs, 0), "ondemand");
    }

    #[tokio::test]
    async fn governors_already_in_performance_not_captured() {
        let sysfs = fake_sysfs(1, GOVERNOR_PERFORMANCE, None);
        let manager = CpuFreqManager::with_root(1, sysfs.path());

        manager.acquire(1).await;
        manager.release(1).await;
        assert_eq!(governor_of(&sysfs, 0), GOVERNOR_PERFORMANCE);
    }
}
