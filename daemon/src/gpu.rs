// Copyright 2023 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! Vendor GPU power-mode custodians. NVIDIA cards are driven through
//! `nvidia-settings`/`nvidia-smi`; AMD cards through the amdgpu sysfs
//! performance-level file. Like the CPU manager, state is captured on the
//! first acquire and restored when the last holder releases.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;

use crate::exec;
use crate::session::SessionId;

const DEFAULT_AMD_ROOT: &str = "/sys/bus/pci/drivers/amdgpu";
const AMD_PERFORMANCE_FILE: &str = "power_dpm_force_performance_level";
const AMD_PERFORMANCE_LEVEL: &str = "high";

/// PowerMizer mode for maximum performance.
const NVIDIA_PERFORMANCE_MODE: &str = "1";

static RE_MIZER_QUERY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Attribute\s+.+\[gpu:(\d+)\].+:\s+(\d)").unwrap());
static RE_MIZER_ASSIGN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[gpu:(\d+)\].+?(\d)\.?").unwrap());

/// A manageable GPU resolved from the live system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuDevice {
    /// An NVIDIA card addressed by its `nvidia-smi` index.
    Nvidia {
        /// Index as `nvidia-smi` reports it.
        index: String,
    },
    /// An AMD card addressed by its sysfs device directory.
    Amd {
        /// The device directory under the amdgpu driver root.
        card: PathBuf,
    },
}

struct SavedGpu {
    device: GpuDevice,
    previous: String,
}

#[derive(Default)]
struct GpuState {
    holders: BTreeSet<SessionId>,
    saved: Vec<SavedGpu>,
    persistence: Option<String>,
    devices: Option<Vec<GpuDevice>>,
}

/// Reference-counted GPU performance-mode manager.
pub struct GpuManager {
    vendor: Option<String>,
    ids: BTreeSet<usize>,
    only_connected: bool,
    cache: bool,
    amd_root: PathBuf,
    state: Mutex<GpuState>,
}

impl GpuManager {
    pub fn new(settings: &guapow_config::settings::OptConfig) -> Self {
        Self {
            vendor: settings.gpu_vendor.clone(),
            ids: settings.gpu_ids.clone(),
            only_connected: settings.gpu_only_connected,
            cache: settings.gpu_cache,
            amd_root: PathBuf::from(DEFAULT_AMD_ROOT),
            state: Mutex::new(GpuState::default()),
        }
    }

    #[cfg(test)]
    fn with_amd_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.amd_root = root.into();
        self
    }

    /// Probes and stores the GPU map ahead of the first request. Only
    /// meaningful when caching is enabled.
    pub async fn prime_cache(&self) {
        if !self.cache {
            return;
        }

        let devices = self.probe().await;
        tracing::info!("{} manageable GPU(s) mapped", devices.len());
        self.state.lock().await.devices = Some(devices);
    }

    async fn devices(&self, state: &mut GpuState) -> Vec<GpuDevice> {
        if self.cache {
            if let Some(devices) = &state.devices {
                return devices.clone();
            }
        }

        let devices = self.probe().await;

        if self.cache {
            state.devices = Some(devices.clone());
        }

        devices
    }

    async fn probe(&self) -> Vec<GpuDevice> {
        let mut devices = Vec::new();

        if self.vendor_enabled("nvidia") && exec::which("nvidia-smi") {
            devices.extend(self.probe_nvidia().await);
        }

        if self.vendor_enabled("amd") {
            devices.extend(self.probe_amd());
        }

        devices
    }

    fn vendor_enabled(&self, vendor: &str) -> bool {
        self.vendor.as_deref().map_or(true, |selected| selected == vendor)
    }

    async fn probe_nvidia(&self) -> Vec<GpuDevice> {
        let (code, output) =
            exec::run("nvidia-smi --query-gpu=index --format=csv,noheader", None, None).await;

        if code != 0 {
            tracing::debug!("nvidia-smi did not list any GPU (exit={})", code);
            return Vec::new();
        }

        output
            .lines()
            .map(str::trim)
            .filter(|index| !index.is_empty())
            .filter(|index| self.id_selected(index.parse::<usize>().ok()))
            .map(|index| GpuDevice::Nvidia {
                index: index.to_owned(),
            })
            .collect()
    }

    fn probe_amd(&self) -> Vec<GpuDevice> {
        let Ok(entries) = std::fs::read_dir(&self.amd_root) else {
            return Vec::new();
        };

        let mut cards: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|card| card.join(AMD_PERFORMANCE_FILE).is_file())
            .collect();

        cards.sort();

        cards
            .into_iter()
            .enumerate()
            .filter(|(position, _)| self.id_selected(Some(*position)))
            .map(|(_, card)| card)
            .filter(|card| {
                if !self.only_connected || amd_has_connected_display(card) {
                    true
                } else {
                    tracing::debug!("skipping AMD GPU without a connected display: {}", card.display());
                    false
                }
            })
            .map(|card| GpuDevice::Amd { card })
            .collect()
    }

    fn id_selected(&self, id: Option<usize>) -> bool {
        if self.ids.is_empty() {
            return true;
        }

        id.map_or(false, |id| self.ids.contains(&id))
    }

    /// Drives every selected GPU to its performance mode, capturing the
    /// previous modes when this is the first holder.
    pub async fn acquire(&self, session: SessionId, user_env: Option<&HashMap<String, String>>) {
        let mut state = self.state.lock().await;

        if state.holders.is_empty() {
            let devices = self.devices(&mut state).await;

            if devices.is_empty() {
                tracing::warn!("no manageable GPU found");
            } else {
                let (saved, persistence) = activate_performance(&devices, user_env).await;
                state.saved = saved;
                state.persistence = persistence;
            }
        }

        state.holders.insert(session);
    }

    /// Restores the captured modes once the last holder releases.
    pub async fn release(&self, session: SessionId, user_env: Option<&HashMap<String, String>>) {
        let mut state = self.state.lock().await;

        if !state.holders.remove(&session) || !state.holders.is_empty() {
            return;
        }

        // Restoration happens under the lock so that a concurrent first
        // acquire cannot capture a half-restored state.
        let saved = std::mem::take(&mut state.saved);
        let persistence = state.persistence.take();

        let mut nvidia_modes: HashMap<String, String> = HashMap::new();

        for entry in saved {
            match entry.device {
                GpuDevice::Nvidia { index } => {
                    nvidia_modes.insert(index, entry.previous);
                }
                GpuDevice::Amd { card } => {
                    let path = card.join(AMD_PERFORMANCE_FILE);
                    if let Err(why) = tokio::fs::write(&path, &entry.previous).await {
                        tracing::error!(
                            "could not restore AMD GPU power mode at {}: {}",
                            path.display(),
                            why
                        );
                    } else {
                        tracing::info!("AMD GPU restored to '{}': {}", entry.previous, card.display());
                    }
                }
            }
        }

        if !nvidia_modes.is_empty() {
            set_nvidia_modes(&nvidia_modes, user_env).await;
        }

        if persistence.as_deref() == Some("Disabled") {
            let (code, _) = exec::run("nvidia-smi -pm 0", None, None).await;
            if code != 0 {
                tracing::warn!("could not restore the NVIDIA persistence mode");
            }
        }
    }
}

async fn activate_performance(
    devices: &[GpuDevice],
    user_env: Option<&HashMap<String, String>>,
) -> (Vec<SavedGpu>, Option<String>) {
    let mut saved = Vec::new();
    let mut nvidia_indices = Vec::new();

    for device in devices {
        match device {
            GpuDevice::Nvidia { index } => nvidia_indices.push(index.clone()),
            GpuDevice::Amd { card } => {
                let path = card.join(AMD_PERFORMANCE_FILE);

                let previous = match tokio::fs::read_to_string(&path).await {
                    Ok(level) => level.trim().to_owned(),
                    Err(why) => {
                        tracing::error!("could not read {}: {}", path.display(), why);
                        continue;
                    }
                };

                if previous == AMD_PERFORMANCE_LEVEL {
                    continue;
                }

                match tokio::fs::write(&path, AMD_PERFORMANCE_LEVEL).await {
                    Ok(()) => {
                        tracing::info!("AMD GPU switched to performance: {}", card.display());
                        saved.push(SavedGpu {
                            device: device.clone(),
                            previous,
                        });
                    }
                    Err(why) => {
                        tracing::error!("could not write {}: {}", path.display(), why);
                    }
                }
            }
        }
    }

    let mut persistence = None;

    if !nvidia_indices.is_empty() {
        let modes = query_nvidia_modes(&nvidia_indices, user_env).await;

        let targets: HashMap<String, String> = nvidia_indices
            .iter()
            .map(|index| (index.clone(), NVIDIA_PERFORMANCE_MODE.to_owned()))
            .collect();

        let changed = set_nvidia_modes(&targets, user_env).await;

        for index in &nvidia_indices {
            if !changed.get(index).copied().unwrap_or(false) {
                continue;
            }

            let previous = modes.get(index).cloned().unwrap_or_else(|| "0".to_owned());
            if previous != NVIDIA_PERFORMANCE_MODE {
                saved.push(SavedGpu {
                    device: GpuDevice::Nvidia {
                        index: index.clone(),
                    },
                    previous,
                });
            }
        }

        persistence = query_nvidia_persistence().await;
        if persistence.as_deref() == Some("Disabled") {
            let (code, _) = exec::run("nvidia-smi -pm 1", None, None).await;
            if code != 0 {
                tracing::warn!("could not enable the NVIDIA persistence mode");
                persistence = None;
            }
        } else {
            persistence = None;
        }
    }

    (saved, persistence)
}

async fn query_nvidia_modes(
    indices: &[String],
    user_env: Option<&HashMap<String, String>>,
) -> HashMap<String, String> {
    let query = indices
        .iter()
        .map(|index| ["-q [gpu:", index, "]/GpuPowerMizerMode"].concat())
        .collect::<Vec<_>>()
        .join(" ");

    let (code, output) = exec::run(&["nvidia-settings ", &query].concat(), user_env, None).await;

    if code != 0 {
        tracing::error!("could not query the NVIDIA power mode: {}", output.replace('\n', " "));
        return HashMap::new();
    }

    parse_mizer_query(&output)
}

async fn set_nvidia_modes(
    modes: &HashMap<String, String>,
    user_env: Option<&HashMap<String, String>>,
) -> HashMap<String, bool> {
    let assigns = modes
        .iter()
        .map(|(index, mode)| ["-a [gpu:", index, "]/GpuPowerMizerMode=", mode].concat())
        .collect::<Vec<_>>()
        .join(" ");

    let cmd = ["nvidia-settings ", &assigns].concat();
    tracing::info!("changing NVIDIA GPU power modes: {}", cmd);

    let (_, output) = exec::run(&cmd, user_env, None).await;
    let assigned = parse_mizer_assign(&output);

    modes
        .keys()
        .map(|index| {
            let changed = assigned.get(index) == modes.get(index);
            if !changed {
                tracing::error!("could not change the power mode of NVIDIA GPU {}", index);
            }

            (index.clone(), changed)
        })
        .collect()
}

async fn query_nvidia_persistence() -> Option<String> {
    let (code, output) = exec::run(
        "nvidia-smi --query-gpu=persistence_mode --format=csv,noheader",
        None,
        None,
    )
    .await;

    if code != 0 {
        return None;
    }

    output.lines().next().map(|line| line.trim().to_owned())
}

fn parse_mizer_query(output: &str) -> HashMap<String, String> {
    RE_MIZER_QUERY
        .captures_iter(output)
        .map(|capture| (capture[1].to_owned(), capture[2].to_owned()))
        .collect()
}

fn parse_mizer_assign(output: &str) -> HashMap<String, String> {
    RE_MIZER_ASSIGN
        .captures_iter(output)
        .map(|capture| (capture[1].to_owned(), capture[2].to_owned()))
        .collect()
}

/// A card counts as connected when any of its DRM connectors reports so.
/// Unreadable state counts as connected, erring toward optimizing.
fn amd_has_connected_display(card: &Path) -> bool {
    let Ok(drm) = std::fs::read_dir(card.join("drm")) else {
        return true;
    };

    let mut any_connector = false;

    for entry in drm.filter_map(Result::ok) {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };

        if !name.starts_with("card") {
            continue;
        }

        let Ok(connectors) = std::fs::read_dir(entry.path()) else {
            continue;
        };

        for connector in connectors.filter_map(Result::ok) {
            let status = connector.path().join("status");
            if !status.is_file() {
                continue;
            }

            any_connector = true;

            if let Ok(state) = std::fs::read_to_string(&status) {
                if state.trim() == "connected" {
                    return true;
                }
            }
        }
    }

    !any_connector
}

#[cfg(test)]
mod tests {
    use super::*;
    use guapow_config::settings::OptConfig;

    fn fake_amd_root(cards: &[(&str, &str, Option<bool>)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();

        for (name, level, connected) in cards {
            let card = dir.path().join(name);
            std::fs::create_dir_all(&card).unwrap();
            std::fs::write(card.join(AMD_PERFORMANCE_FILE), level).unwrap();

            if let Some(connected) = connected {
                let connector = card.join("drm/card0/card0-HDMI-A-1");
                std::fs::create_dir_all(&connector).unwrap();
                let status = if *connected { "connected" } else { "disconnected" };
                std::fs::write(connector.join("status"), status).unwrap();
            }
        }

        dir
    }

    fn manager_for(root: &tempfile::TempDir, only_connected: bool) -> GpuManager {
        let settings = OptConfig {
            gpu_vendor: Some("amd".into()),
            gpu_only_connected: only_connected,
            ..OptConfig::default()
        };

        GpuManager::new(&settings).with_amd_root(root.path())
    }

    #[tokio::test]
    async fn amd_round_trip() {
        let root = fake_amd_root(&[("0000:07:00.0", "auto", Some(true))]);
        let manager = manager_for(&root, true);

        manager.acquire(1, None).await;
        let level =
            std::fs::read_to_string(root.path().join("0000:07:00.0").join(AMD_PERFORMANCE_FILE)).unwrap();
        assert_eq!(level, AMD_PERFORMANCE_LEVEL);

        manager.release(1, None).await;
        let level =
            std::fs::read_to_string(root.path().join("0000:07:00.0").join(AMD_PERFORMANCE_FILE)).unwrap();
        assert_eq!(level, "auto");
    }

    #[tokio::test]
    async fn amd_shared_until_last_release() {
        let root = fake_amd_root(&[("0000:07:00.0", "auto", None)]);
        let manager = manager_for(&root, true);
        let file = root.path().join("0000:07:00.0").join(AMD_PERFORMANCE_FILE);

        manager.acquire(1, None).await;
        manager.acquire(2, None).await;
        manager.release(1, None).await;
        assert_eq!(std::fs::read_to_string(&file).unwrap(), AMD_PERFORMANCE_LEVEL);

        manager.release(2, None).await;
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "auto");
    }

    #[tokio::test]
    async fn disconnected_cards_skipped() {
        let root = fake_amd_root(&[
            ("0000:07:00.0", "auto", Some(false)),
            ("0000:08:00.0", "auto", Some(true)),
        ]);

        let manager = manager_for(&root, true);
        manager.acquire(1, None).await;

        let skipped =
            std::fs::read_to_string(root.path().join("0000:07:00.0").join(AMD_PERFORMANCE_FILE)).unwrap();
        assert_eq!(skipped, "auto");

        let driven =
            std::fs::read_to_string(root.path().join("0000:08:00.0").join(AMD_PERFORMANCE_FILE)).unwrap();
        assert_eq!(driven, AMD_PERFORMANCE_LEVEL);

        manager.release(1, None).await;
    }

    #[test]
    fn mizer_output_parsing() {
        let query = "  Attribute 'GPUPowerMizerMode' (host:0[gpu:0]): 2\n\
                     Attribute 'GPUPowerMizerMode' (host:0[gpu:1]): 0\n";
        let modes = parse_mizer_query(query);
        assert_eq!(modes.get("0").map(String::as_str), Some("2"));
        assert_eq!(modes.get("1").map(String::as_str), Some("0"));

        let assign = "  Attribute 'GPUPowerMizerMode' (host:0[gpu:0]) assigned value 1.\n";
        let assigned = parse_mizer_assign(assign);
        assert_eq!(assigned.get("0").map(String::as_str), Some("1"));
    }

    #[test]
    fn connector_state_rules() {
        let root = fake_amd_root(&[("a", "auto", Some(true)), ("b", "auto", Some(false)), ("c", "auto", None)]);

        assert!(amd_has_connected_display(&root.path().join("a")));
        assert!(!amd_has_connected_display(&root.path().join("b")));
        // No DRM information at all: treat as connected.
        assert!(amd_has_connected_display(&root.path().join("c")));
    }
}
