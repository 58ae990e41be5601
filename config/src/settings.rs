// Copyright 2023 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! The optimizer daemon's settings, read once from `opt.conf` at startup
//! and immutable afterwards. Invalid values fall back to their defaults
//! with a warning instead of failing the daemon.

use std::collections::BTreeSet;
use std::path::Path;

/// Environment variable overriding the default port.
pub const PORT_ENV_VAR: &str = "GUAPOW_OPT_PORT";

const DEFAULT_PORT: u16 = 5087;
const MIN_CHECK_FINISHED_INTERVAL: f32 = 0.5;

/// Daemon settings mapped from `opt.conf`.
#[derive(Debug, Clone, PartialEq)]
pub struct OptConfig {
    /// TCP port the request listener binds on loopback.
    pub port: u16,
    /// Pre-defined window compositor, skipping detection.
    pub compositor: Option<String>,
    /// Whether profile scripts may run at the root level.
    pub allow_root_scripts: bool,
    /// Seconds between checks for finished optimized processes.
    pub check_finished_interval: f32,
    /// Maximum seconds to look for a launcher-mapped process.
    pub launcher_mapping_timeout: f32,
    /// Maximum seconds to keep looking after a launcher match.
    pub launcher_mapping_found_timeout: f32,
    /// Whether the mapped GPUs are cached instead of probed per request.
    pub gpu_cache: bool,
    /// Restricts optimization to these GPU indices when non-empty.
    pub gpu_ids: BTreeSet<usize>,
    /// Skip AMD cards without a connected display.
    pub gpu_only_connected: bool,
    /// Pre-defined GPU vendor (`nvidia` or `amd`), skipping probing.
    pub gpu_vendor: Option<String>,
    /// Switch the CPUs to performance for the daemon's own lifetime.
    pub cpu_performance: bool,
    /// Users allowed to request optimizations. Empty allows everyone.
    pub allowed_users: BTreeSet<String>,
    /// Whether request bodies must be encrypted with the published key.
    pub encrypted_requests: bool,
    /// Cache profile files after the first read.
    pub profile_cache: bool,
    /// Read and cache every profile on disk during startup.
    pub pre_cache_profiles: bool,
    /// Seconds between nice level re-assertions.
    pub renice_interval: f32,
    /// Maximum seconds to look for children of optimized processes.
    pub children_timeout: f32,
    /// Maximum seconds to keep looking after a child was found.
    pub children_found_timeout: f32,
}

impl Default for OptConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            compositor: None,
            allow_root_scripts: false,
            check_finished_interval: 3.0,
            launcher_mapping_timeout: 60.0,
            launcher_mapping_found_timeout: 10.0,
            gpu_cache: false,
            gpu_ids: BTreeSet::new(),
            gpu_only_connected: true,
            gpu_vendor: None,
            cpu_performance: false,
            allowed_users: BTreeSet::new(),
            encrypted_requests: true,
            profile_cache: false,
            pre_cache_profiles: false,
            renice_interval: 5.0,
            children_timeout: 30.0,
            children_found_timeout: 10.0,
        }
    }
}

fn default_port() -> u16 {
    std::env::var(PORT_ENV_VAR)
        .ok()
        .and_then(|var| var.trim().parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT)
}

impl OptConfig {
    /// Parses settings from the contents of an `opt.conf` file.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut config = Self::default();

        for line in text.lines() {
            let Some((key, value)) = crate::split_entry(line) else {
                continue;
            };

            config.set(key, value);
        }

        config
    }

    /// Reads settings from the first existing candidate path, or the
    /// defaults when none exists.
    #[must_use]
    pub fn read(user_id: u32, user_name: &str) -> Self {
        let mut buffer = String::with_capacity(1024);

        for path in crate::paths_by_priority("opt.conf", user_id, user_name) {
            if !Path::new(&path).exists() {
                continue;
            }

            match crate::read_into_string(&mut buffer, &path) {
                Ok(text) => {
                    tracing::info!("settings read from {}", path.display());
                    return Self::parse(text);
                }
                Err(why) => {
                    tracing::error!("failed to read {}: {}", path.display(), why);
                }
            }
        }

        tracing::warn!("no opt.conf found: using default settings");
        Self::default()
    }

    fn set(&mut self, key: &str, value: Option<&str>) {
        match key {
            "port" => {
                match value.and_then(|v| v.parse::<u16>().ok()) {
                    Some(port) => self.port = port,
                    None => tracing::warn!("invalid port: {:?}", value),
                }
            }
            "compositor" => {
                self.compositor = value.map(str::to_ascii_lowercase);
            }
            "scripts.allow_root" => set_bool(&mut self.allow_root_scripts, key, value),
            "check.finished.interval" => {
                set_seconds(&mut self.check_finished_interval, key, value);
                if self.check_finished_interval < MIN_CHECK_FINISHED_INTERVAL {
                    tracing::warn!(
                        "check.finished.interval below the {} minimum",
                        MIN_CHECK_FINISHED_INTERVAL
                    );
                    self.check_finished_interval = MIN_CHECK_FINISHED_INTERVAL;
                }
            }
            "launcher.mapping.timeout" => {
                set_seconds(&mut self.launcher_mapping_timeout, key, value);
            }
            "launcher.mapping.found_timeout" => {
                set_seconds(&mut self.launcher_mapping_found_timeout, key, value);
            }
            "gpu.cache" => set_bool(&mut self.gpu_cache, key, value),
            "gpu.id" => {
                if let Some(value) = value {
                    self.gpu_ids = value
                        .split(',')
                        .filter_map(|id| id.trim().parse::<usize>().ok())
                        .collect();
                }
            }
            "gpu.only_connected" => set_bool(&mut self.gpu_only_connected, key, value),
            "gpu.vendor" => {
                self.gpu_vendor = value.map(str::to_ascii_lowercase);
            }
            "cpu.performance" => set_bool(&mut self.cpu_performance, key, value),
            "request.allowed_users" => {
                if let Some(value) = value {
                    self.allowed_users = value
                        .split(',')
                        .map(str::trim)
                        .filter(|user| !user.is_empty())
                        .map(String::from)
                        .collect();
                }
            }
            "request.encrypted" => set_bool(&mut self.encrypted_requests, key, value),
            "profile.cache" => set_bool(&mut self.profile_cache, key, value),
            "profile.pre_caching" => set_bool(&mut self.pre_cache_profiles, key, value),
            "nice.check.interval" => {
                set_seconds(&mut self.renice_interval, key, value);
                if self.renice_interval <= 0.0 {
                    tracing::warn!("nice.check.interval must be positive");
                    self.renice_interval = Self::default().renice_interval;
                }
            }
            "optimize_children.timeout" => {
                set_seconds(&mut self.children_timeout, key, value);
            }
            "optimize_children.found_timeout" => {
                set_seconds(&mut self.children_found_timeout, key, value);
            }
            other => tracing::warn!("unknown setting: {}", other),
        }
    }
}

fn set_bool(field: &mut bool, key: &str, value: Option<&str>) {
    match crate::parse_bool(value) {
        Some(parsed) => *field = parsed,
        None => tracing::warn!("invalid boolean for {}: {:?}", key, value),
    }
}

fn set_seconds(field: &mut f32, key: &str, value: Option<&str>) {
    match value.and_then(|v| v.parse::<f32>().ok()) {
        Some(seconds) if seconds >= 0.0 => *field = seconds,
        _ => tracing::warn!("invalid value for {}: {:?}", key, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = OptConfig::parse("");
        assert_eq!(config, OptConfig::default());
        assert_eq!(config.port, 5087);
        assert!(config.encrypted_requests);
        assert!(config.gpu_only_connected);
        assert!(!config.allow_root_scripts);
    }

    #[test]
    fn full_file() {
        let config = OptConfig::parse(
            "port=9000\n\
             compositor=KWin\n\
             scripts.allow_root=1\n\
             check.finished.interval=1.5\n\
             gpu.cache\n\
             gpu.id=0,2\n\
             gpu.vendor=Nvidia\n\
             cpu.performance=true\n\
             request.allowed_users=alice, bob\n\
             request.encrypted=false\n\
             profile.cache=1\n\
             nice.check.interval=2\n\
             optimize_children.timeout=0\n",
        );

        assert_eq!(config.port, 9000);
        assert_eq!(config.compositor.as_deref(), Some("kwin"));
        assert!(config.allow_root_scripts);
        assert_eq!(config.check_finished_interval, 1.5);
        assert!(config.gpu_cache);
        assert_eq!(config.gpu_ids, BTreeSet::from([0, 2]));
        assert_eq!(config.gpu_vendor.as_deref(), Some("nvidia"));
        assert!(config.cpu_performance);
        assert_eq!(
            config.allowed_users,
            BTreeSet::from(["alice".to_string(), "bob".to_string()])
        );
        assert!(!config.encrypted_requests);
        assert!(config.profile_cache);
        assert_eq!(config.renice_interval, 2.0);
        assert_eq!(config.children_timeout, 0.0);
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = OptConfig::parse(
            "port=notaport\n\
             check.finished.interval=0.1\n\
             nice.check.interval=-3\n\
             launcher.mapping.timeout=abc\n",
        );

        assert_eq!(config.port, OptConfig::default().port);
        assert_eq!(config.check_finished_interval, 0.5);
        assert_eq!(config.renice_interval, 5.0);
        assert_eq!(config.launcher_mapping_timeout, 60.0);
    }

    #[test]
    fn comments_and_unknown_keys_ignored() {
        let config = OptConfig::parse("# a comment\nwhat.is.this=1\nport=6000 # inline\n");
        assert_eq!(config.port, 6000);
    }
}
