// Copyright 2023 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! The optimization profile model: the typed set of options a request may
//! ask for, parsed from `*.profile` files or inline request options.

use std::fmt;

/// Name of the profile used when none is requested or the requested one
/// does not resolve.
pub const DEFAULT_PROFILE: &str = "default";

/// File extension of profile files.
pub const PROFILE_EXTENSION: &str = ".profile";

/// I/O scheduling class for `proc.io.class`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoClass {
    /// CFQ best-effort class; supports priorities 0..=7.
    BestEffort,
    /// Realtime class; root only, supports priorities 0..=7.
    Realtime,
    /// Idle class; no priority.
    Idle,
}

impl IoClass {
    /// Whether the class accepts an I/O priority level.
    #[must_use]
    pub fn supports_priority(self) -> bool {
        !matches!(self, IoClass::Idle)
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "best_effort" => Some(IoClass::BestEffort),
            "realtime" => Some(IoClass::Realtime),
            "idle" => Some(IoClass::Idle),
            _ => None,
        }
    }
}

/// CPU scheduling policy for `proc.policy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuPolicy {
    /// The default time-sharing policy.
    Other,
    /// For very low priority background jobs.
    Idle,
    /// For CPU-intensive batch work.
    Batch,
    /// First-in first-out realtime policy.
    Fifo,
    /// Round-robin realtime policy.
    Rr,
}

impl CpuPolicy {
    /// Realtime policies require a priority within 1..=99 and root.
    #[must_use]
    pub fn requires_priority(self) -> bool {
        matches!(self, CpuPolicy::Fifo | CpuPolicy::Rr)
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "other" => Some(CpuPolicy::Other),
            "idle" => Some(CpuPolicy::Idle),
            "batch" => Some(CpuPolicy::Batch),
            "fifo" => Some(CpuPolicy::Fifo),
            "rr" => Some(CpuPolicy::Rr),
            _ => None,
        }
    }
}

impl fmt::Display for CpuPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CpuPolicy::Other => "other",
            CpuPolicy::Idle => "idle",
            CpuPolicy::Batch => "batch",
            CpuPolicy::Fifo => "fifo",
            CpuPolicy::Rr => "rr",
        };

        f.write_str(name)
    }
}

/// An environment variable override from `proc.env`, consumed by the
/// Runner before exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvVar {
    /// `K:V` sets `K` to `V`.
    Set(String, String),
    /// A bare `K` unsets it.
    Unset(String),
}

/// Nice settings for the optimized process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NiceSettings {
    /// The requested nice level, −20..=19.
    pub level: Option<i32>,
    /// Seconds to wait before the first apply.
    pub delay: Option<f32>,
    /// Re-assert the level periodically.
    pub watch: bool,
}

/// I/O scheduling settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IoSettings {
    /// The requested class.
    pub class: Option<IoClass>,
    /// Priority within the class, 0..=7.
    pub nice: Option<i32>,
}

/// CPU scheduling policy settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedSettings {
    /// The requested policy.
    pub policy: Option<CpuPolicy>,
    /// Realtime priority, 1..=99, for fifo/rr only.
    pub priority: Option<i32>,
}

/// The per-process portion of a profile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessSettings {
    /// Nice level handling.
    pub nice: NiceSettings,
    /// I/O class and priority.
    pub io: IoSettings,
    /// Scheduling policy and priority.
    pub scheduling: SchedSettings,
    /// CPU indices to pin the process to.
    pub affinity: Vec<usize>,
    /// Environment overrides (Runner-side).
    pub env: Vec<EnvVar>,
}

impl ProcessSettings {
    /// Whether any per-process attribute was requested.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nice.level.is_none()
            && self.io.class.is_none()
            && self.scheduling.policy.is_none()
            && self.affinity.is_empty()
            && self.env.is_empty()
    }
}

/// One phase of profile scripts with its serialization rules.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptSettings {
    /// Commands to run, in order.
    pub scripts: Vec<String>,
    /// Run each script to completion before the next.
    pub wait: bool,
    /// Bound on the wait, in seconds.
    pub timeout: Option<f32>,
    /// Run at the root level (requires the daemon opt-in).
    pub run_as_root: bool,
}

/// Processes to stop around the target's launch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StopSettings {
    /// Process names to stop.
    pub processes: Vec<String>,
    /// Relaunch them when the optimization finishes.
    pub relaunch: bool,
}

/// Launcher mapping options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LauncherOptions {
    /// Per-request `name:target` rules, masking the global file.
    pub mapping: Vec<(String, String)>,
    /// Skip launcher resolution entirely.
    pub skip_mapping: bool,
}

/// A resolved optimization profile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Profile {
    /// Profile name when read from a file.
    pub name: Option<String>,
    /// Per-process attribute requests.
    pub process: ProcessSettings,
    /// Governor and energy policy switched to performance.
    pub cpu_performance: bool,
    /// GPUs switched to their vendor performance mode.
    pub gpu_performance: bool,
    /// Window compositor disabled for the session.
    pub compositor_off: bool,
    /// Mouse pointer hidden for the session.
    pub hide_mouse: bool,
    /// Steam child process discovery enabled.
    pub steam: bool,
    /// Launcher mapping behavior.
    pub launcher: LauncherOptions,
    /// Processes stopped by the Runner before launch (relaunch bookkeeping
    /// only on the optimizer side).
    pub stop_before: StopSettings,
    /// Processes stopped after the target starts.
    pub stop_after: StopSettings,
    /// Runner-phase scripts; recognized but not run by the optimizer.
    pub scripts_before: ScriptSettings,
    /// Scripts run by the optimizer after the target starts.
    pub scripts_after: ScriptSettings,
    /// Scripts run when the optimization finishes.
    pub scripts_finish: ScriptSettings,
}

/// Every option a profile may carry. Unknown keys are not represented:
/// they are warned about and dropped at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OptionKey {
    ProcNice,
    ProcNiceWatch,
    ProcNiceDelay,
    ProcIoClass,
    ProcIoNice,
    ProcPolicy,
    ProcPolicyPriority,
    ProcAffinity,
    ProcEnv,
    CpuPerformance,
    GpuPerformance,
    CompositorOff,
    MouseHidden,
    StopBefore,
    StopBeforeRelaunch,
    StopAfter,
    StopAfterRelaunch,
    Scripts(ScriptPhase),
    ScriptsWait(ScriptPhase),
    ScriptsTimeout(ScriptPhase),
    ScriptsRoot(ScriptPhase),
    Launcher,
    LauncherSkipMapping,
    Steam,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScriptPhase {
    Before,
    After,
    Finish,
}

impl OptionKey {
    fn parse(key: &str) -> Option<Self> {
        let key = match key {
            "proc.nice" => Self::ProcNice,
            "proc.nice.watch" => Self::ProcNiceWatch,
            "proc.nice.delay" => Self::ProcNiceDelay,
            "proc.io.class" => Self::ProcIoClass,
            "proc.io.nice" => Self::ProcIoNice,
            "proc.policy" => Self::ProcPolicy,
            "proc.policy.priority" => Self::ProcPolicyPriority,
            "proc.affinity" => Self::ProcAffinity,
            "proc.env" => Self::ProcEnv,
            "cpu.performance" => Self::CpuPerformance,
            "gpu.performance" => Self::GpuPerformance,
            "compositor.off" => Self::CompositorOff,
            "mouse.hidden" => Self::MouseHidden,
            "stop.before" => Self::StopBefore,
            "stop.before.relaunch" => Self::StopBeforeRelaunch,
            "stop.after" => Self::StopAfter,
            "stop.after.relaunch" => Self::StopAfterRelaunch,
            "launcher" => Self::Launcher,
            "launcher.skip_mapping" => Self::LauncherSkipMapping,
            "steam" => Self::Steam,
            other => {
                let (phase, rest) = if let Some(rest) = other.strip_prefix("scripts.before") {
                    (ScriptPhase::Before, rest)
                } else if let Some(rest) = other.strip_prefix("scripts.after") {
                    (ScriptPhase::After, rest)
                } else if let Some(rest) = other.strip_prefix("scripts.finish") {
                    (ScriptPhase::Finish, rest)
                } else {
                    return None;
                };

                match rest {
                    "" => Self::Scripts(phase),
                    ".wait" => Self::ScriptsWait(phase),
                    ".timeout" => Self::ScriptsTimeout(phase),
                    ".root" => Self::ScriptsRoot(phase),
                    _ => return None,
                }
            }
        };

        Some(key)
    }
}

impl Profile {
    /// Parses a profile from file or inline-option text.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut profile = Self::default();
        profile.apply_str(text);
        profile
    }

    /// Applies option lines on top of this profile, one option per line,
    /// so that values such as script commands may contain spaces. Used
    /// both for parsing and for overlays, which replace whichever options
    /// they name.
    pub fn apply_str(&mut self, text: &str) {
        for line in text.lines() {
            let Some((key, value)) = crate::split_entry(line) else {
                continue;
            };

            match OptionKey::parse(key) {
                Some(option) => self.set(option, key, value),
                None => tracing::warn!("unknown profile option: {}", key),
            }
        }
    }

    /// Applies a single-line, whitespace-separated token string, the form
    /// request bodies and `profile-add` overlays arrive in. Values cannot
    /// contain spaces here; profiles on disk are not limited this way.
    pub fn apply_tokens(&mut self, text: &str) {
        for token in text.split_whitespace() {
            let Some((key, value)) = crate::split_entry(token) else {
                continue;
            };

            match OptionKey::parse(key) {
                Some(option) => self.set(option, key, value),
                None => tracing::warn!("unknown profile option: {}", key),
            }
        }
    }

    /// Whether any optimization was requested at all. Profiles that parse
    /// to nothing are treated the same as missing files.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.process.is_empty()
            || self.cpu_performance
            || self.gpu_performance
            || self.compositor_off
            || self.hide_mouse
            || self.steam
            || !self.launcher.mapping.is_empty()
            || self.launcher.skip_mapping
            || !self.stop_before.processes.is_empty()
            || !self.stop_after.processes.is_empty()
            || !self.scripts_before.scripts.is_empty()
            || !self.scripts_after.scripts.is_empty()
            || !self.scripts_finish.scripts.is_empty()
    }

    fn scripts_mut(&mut self, phase: ScriptPhase) -> &mut ScriptSettings {
        match phase {
            ScriptPhase::Before => &mut self.scripts_before,
            ScriptPhase::After => &mut self.scripts_after,
            ScriptPhase::Finish => &mut self.scripts_finish,
        }
    }

    fn set(&mut self, option: OptionKey, key: &str, value: Option<&str>) {
        match option {
            OptionKey::ProcNice => set_int(&mut self.process.nice.level, key, value),
            OptionKey::ProcNiceWatch => set_bool(&mut self.process.nice.watch, key, value),
            OptionKey::ProcNiceDelay => {
                match value.and_then(|v| v.parse::<f32>().ok()) {
                    Some(delay) if delay >= 0.0 => self.process.nice.delay = Some(delay),
                    _ => tracing::warn!("invalid value for {}: {:?}", key, value),
                }
            }
            OptionKey::ProcIoClass => match value.and_then(IoClass::parse) {
                Some(class) => self.process.io.class = Some(class),
                None => tracing::warn!("invalid value for {}: {:?}", key, value),
            },
            OptionKey::ProcIoNice => set_int(&mut self.process.io.nice, key, value),
            OptionKey::ProcPolicy => match value.and_then(CpuPolicy::parse) {
                Some(policy) => self.process.scheduling.policy = Some(policy),
                None => tracing::warn!("invalid value for {}: {:?}", key, value),
            },
            OptionKey::ProcPolicyPriority => {
                set_int(&mut self.process.scheduling.priority, key, value);
            }
            OptionKey::ProcAffinity => {
                if let Some(value) = value {
                    self.process.affinity = value
                        .split(',')
                        .filter_map(|idx| idx.trim().parse::<usize>().ok())
                        .collect();
                }
            }
            OptionKey::ProcEnv => {
                if let Some(value) = value {
                    let var = match value.split_once(':') {
                        Some((name, val)) => EnvVar::Set(name.to_string(), val.to_string()),
                        None => EnvVar::Unset(value.to_string()),
                    };

                    self.process.env.push(var);
                }
            }
            OptionKey::CpuPerformance => set_bool(&mut self.cpu_performance, key, value),
            OptionKey::GpuPerformance => set_bool(&mut self.gpu_performance, key, value),
            OptionKey::CompositorOff => set_bool(&mut self.compositor_off, key, value),
            OptionKey::MouseHidden => set_bool(&mut self.hide_mouse, key, value),
            OptionKey::StopBefore => set_list(&mut self.stop_before.processes, value),
            OptionKey::StopBeforeRelaunch => {
                set_bool(&mut self.stop_before.relaunch, key, value);
            }
            OptionKey::StopAfter => set_list(&mut self.stop_after.processes, value),
            OptionKey::StopAfterRelaunch => set_bool(&mut self.stop_after.relaunch, key, value),
            OptionKey::Scripts(phase) => set_list(&mut self.scripts_mut(phase).scripts, value),
            OptionKey::ScriptsWait(phase) => {
                set_bool(&mut self.scripts_mut(phase).wait, key, value);
            }
            OptionKey::ScriptsTimeout(phase) => {
                match value.and_then(|v| v.parse::<f32>().ok()) {
                    Some(timeout) if timeout >= 0.0 => {
                        self.scripts_mut(phase).timeout = Some(timeout);
                    }
                    _ => tracing::warn!("invalid value for {}: {:?}", key, value),
                }
            }
            OptionKey::ScriptsRoot(phase) => {
                set_bool(&mut self.scripts_mut(phase).run_as_root, key, value);
            }
            OptionKey::Launcher => {
                if let Some(value) = value {
                    for entry in value.split(',') {
                        match entry.split_once(':') {
                            Some((exe, target)) if !exe.trim().is_empty() && !target.trim().is_empty() => {
                                self.launcher
                                    .mapping
                                    .push((exe.trim().to_string(), target.trim().to_string()));
                            }
                            _ => tracing::warn!("invalid launcher mapping: {}", entry),
                        }
                    }
                }
            }
            OptionKey::LauncherSkipMapping => {
                set_bool(&mut self.launcher.skip_mapping, key, value);
            }
            OptionKey::Steam => set_bool(&mut self.steam, key, value),
        }
    }
}

fn set_bool(field: &mut bool, key: &str, value: Option<&str>) {
    match crate::parse_bool(value) {
        Some(parsed) => *field = parsed,
        None => tracing::warn!("invalid boolean for {}: {:?}", key, value),
    }
}

fn set_int(field: &mut Option<i32>, key: &str, value: Option<&str>) {
    match value.and_then(|v| v.parse::<i32>().ok()) {
        Some(parsed) => *field = Some(parsed),
        None => tracing::warn!("invalid value for {}: {:?}", key, value),
    }
}

fn set_list(field: &mut Vec<String>, value: Option<&str>) {
    if let Some(value) = value {
        *field = value
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(String::from)
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_profile() {
        let profile = Profile::parse(
            "proc.nice=-5\n\
             proc.nice.watch\n\
             proc.nice.delay=1.5\n\
             proc.io.class=best_effort\n\
             proc.io.nice=2\n\
             proc.policy=fifo\n\
             proc.policy.priority=50\n\
             proc.affinity=0,1,3\n\
             proc.env=WINEDEBUG:-all\n\
             proc.env=DXVK_HUD\n\
             cpu.performance\n\
             gpu.performance=1\n\
             compositor.off=true\n\
             mouse.hidden\n\
             stop.after=dropbox,slack\n\
             stop.after.relaunch\n\
             scripts.after=/usr/bin/a,/usr/bin/b\n\
             scripts.after.wait=true\n\
             scripts.after.timeout=2\n\
             scripts.finish=/usr/bin/c\n\
             launcher=gamelauncher:c%/opt/game/*\n\
             steam=0\n",
        );

        assert_eq!(profile.process.nice.level, Some(-5));
        assert!(profile.process.nice.watch);
        assert_eq!(profile.process.nice.delay, Some(1.5));
        assert_eq!(profile.process.io.class, Some(IoClass::BestEffort));
        assert_eq!(profile.process.io.nice, Some(2));
        assert_eq!(profile.process.scheduling.policy, Some(CpuPolicy::Fifo));
        assert_eq!(profile.process.scheduling.priority, Some(50));
        assert_eq!(profile.process.affinity, vec![0, 1, 3]);
        assert_eq!(
            profile.process.env,
            vec![
                EnvVar::Set("WINEDEBUG".into(), "-all".into()),
                EnvVar::Unset("DXVK_HUD".into()),
            ]
        );
        assert!(profile.cpu_performance);
        assert!(profile.gpu_performance);
        assert!(profile.compositor_off);
        assert!(profile.hide_mouse);
        assert_eq!(profile.stop_after.processes, vec!["dropbox", "slack"]);
        assert!(profile.stop_after.relaunch);
        assert_eq!(profile.scripts_after.scripts, vec!["/usr/bin/a", "/usr/bin/b"]);
        assert!(profile.scripts_after.wait);
        assert_eq!(profile.scripts_after.timeout, Some(2.0));
        assert_eq!(profile.scripts_finish.scripts, vec!["/usr/bin/c"]);
        assert_eq!(
            profile.launcher.mapping,
            vec![("gamelauncher".to_string(), "c%/opt/game/*".to_string())]
        );
        assert!(!profile.steam);
        assert!(profile.is_valid());
    }

    #[test]
    fn space_separated_tokens() {
        let mut profile = Profile::default();
        profile.apply_tokens("proc.nice=-4 gpu.performance steam");
        assert_eq!(profile.process.nice.level, Some(-4));
        assert!(profile.gpu_performance);
        assert!(profile.steam);
    }

    #[test]
    fn script_commands_keep_their_arguments() {
        let profile = Profile::parse("scripts.after=/usr/bin/notify-send starting,/usr/bin/sync\n");
        assert_eq!(
            profile.scripts_after.scripts,
            vec!["/usr/bin/notify-send starting", "/usr/bin/sync"]
        );
    }

    #[test]
    fn overlay_replaces_named_options() {
        let mut profile = Profile::parse("proc.nice=-5\ncpu.performance");
        profile.apply_tokens("proc.nice=10 mouse.hidden");

        assert_eq!(profile.process.nice.level, Some(10));
        assert!(profile.cpu_performance);
        assert!(profile.hide_mouse);
    }

    #[test]
    fn unknown_and_invalid_options_dropped() {
        let profile = Profile::parse(
            "nope.nope=1\n\
             proc.nice=abc\n\
             proc.io.class=turbo\n\
             proc.policy=realtime\n",
        );

        assert!(!profile.is_valid());
    }

    #[test]
    fn empty_profile_invalid() {
        assert!(!Profile::parse("# nothing\n\n").is_valid());
    }

    #[test]
    fn policy_display() {
        assert_eq!(CpuPolicy::Fifo.to_string(), "fifo");
        assert_eq!(CpuPolicy::Other.to_string(), "other");
    }
}
