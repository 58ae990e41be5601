// Copyright 2023 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! Per-process appliers: nice level, I/O class, scheduling policy, and
//! CPU affinity. Each is idempotent per `(pid, attribute)` and safe to
//! reapply to newly discovered children. Failures are logged and never
//! abort the rest of a plan.

use std::rc::Rc;

use guapow_config::profile::{CpuPolicy, IoClass, ProcessSettings};
use ioprio::{BePriorityLevel, Class, Pid, Priority, RtPriorityLevel, Target};

use crate::renice::NiceWatcher;

/// Whether the daemon runs with root privileges.
#[must_use]
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// The current nice level of a process, or `None` when it is gone.
#[must_use]
pub fn get_nice(pid: u32) -> Option<i32> {
    // getpriority legitimately returns -1, so errno disambiguates.
    unsafe {
        *libc::__errno_location() = 0;
        let nice = libc::getpriority(libc::PRIO_PROCESS, pid);

        if nice == -1 && *libc::__errno_location() != 0 {
            return None;
        }

        Some(nice)
    }
}

/// Sets the nice level of a process.
pub fn set_nice(pid: u32, level: i32, request: &str) -> bool {
    let result = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid, level) };

    if result == 0 {
        tracing::info!("process {} nice level changed to {} (request={})", pid, level, request);
        true
    } else {
        tracing::error!(
            "could not change process {} nice level to {} (request={})",
            pid,
            level,
            request
        );
        false
    }
}

/// Runs every requested per-process applier against `pid`.
pub struct Applier {
    cpu_count: usize,
    nice_watcher: Rc<NiceWatcher>,
}

impl Applier {
    pub fn new(cpu_count: usize, nice_watcher: Rc<NiceWatcher>) -> Self {
        Self {
            cpu_count,
            nice_watcher,
        }
    }

    /// Applies the profile's process settings to one pid. Awaits the nice
    /// delay when configured, so callers decide whether to run this
    /// concurrently per pid.
    pub async fn apply(&self, pid: u32, settings: &ProcessSettings, request: &str) {
        self.apply_nice(pid, settings, request).await;
        self.apply_affinity(pid, settings, request);
        self.apply_policy(pid, settings, request);
        self.apply_io(pid, settings, request);
    }

    async fn apply_nice(&self, pid: u32, settings: &ProcessSettings, request: &str) {
        let nice = &settings.nice;

        let Some(level) = nice.level else {
            return;
        };

        if !(-20..=19).contains(&level) {
            tracing::warn!(
                "invalid nice level {} requested for process {} (request={})",
                level,
                pid,
                request
            );
            return;
        }

        if let Some(delay) = nice.delay.filter(|delay| *delay > 0.0) {
            tracing::info!(
                "delaying process {} renicing for {} seconds (request={})",
                pid,
                delay,
                request
            );
            tokio::time::sleep(std::time::Duration::from_secs_f32(delay)).await;
        }

        set_nice(pid, level, request);

        if nice.watch {
            self.nice_watcher.watch(pid, level, request);
        }
    }

    fn apply_affinity(&self, pid: u32, settings: &ProcessSettings, request: &str) {
        if settings.affinity.is_empty() {
            return;
        }

        let valid: Vec<usize> = settings
            .affinity
            .iter()
            .copied()
            .filter(|idx| *idx < self.cpu_count)
            .collect();

        if valid.len() != settings.affinity.len() {
            tracing::warn!(
                "CPU affinity indices out of the online range 0..{} were dropped (request={})",
                self.cpu_count,
                request
            );
        }

        if valid.is_empty() {
            tracing::warn!(
                "no valid CPU affinity index for process {}: nothing applied (request={})",
                pid,
                request
            );
            return;
        }

        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        for idx in &valid {
            unsafe { libc::CPU_SET(*idx, &mut set) };
        }

        let result = unsafe {
            libc::sched_setaffinity(pid as libc::pid_t, std::mem::size_of::<libc::cpu_set_t>(), &set)
        };

        if result == 0 {
            tracing::info!(
                "process {} CPU affinity changed to {:?} (request={})",
                pid,
                valid,
                request
            );
        } else {
            tracing::error!(
                "could not change process {} CPU affinity to {:?} (request={})",
                pid,
                valid,
                request
            );
        }
    }

    fn apply_policy(&self, pid: u32, settings: &ProcessSettings, request: &str) {
        let sched = &settings.scheduling;

        let Some(policy) = sched.policy else {
            return;
        };

        let priority = if policy.requires_priority() {
            if !is_root() {
                tracing::warn!(
                    "scheduling policy '{}' for process {} requires root privileges (request={})",
                    policy,
                    pid,
                    request
                );
                return;
            }

            match sched.priority {
                Some(priority) if (1..=99).contains(&priority) => priority,
                Some(priority) => {
                    tracing::warn!(
                        "invalid priority {} for scheduling policy '{}' (request={})",
                        priority,
                        policy,
                        request
                    );
                    return;
                }
                None => {
                    tracing::warn!(
                        "no priority set for policy '{}': 1 will be used (request={})",
                        policy,
                        request
                    );
                    1
                }
            }
        } else {
            if sched.priority.is_some() {
                tracing::warn!(
                    "scheduling policy '{}' does not take a priority: ignored (request={})",
                    policy,
                    request
                );
            }

            0
        };

        let policy_id = match policy {
            CpuPolicy::Other => libc::SCHED_OTHER,
            CpuPolicy::Idle => libc::SCHED_IDLE,
            CpuPolicy::Batch => libc::SCHED_BATCH,
            CpuPolicy::Fifo => libc::SCHED_FIFO,
            CpuPolicy::Rr => libc::SCHED_RR,
        };

        let param = libc::sched_param {
            sched_priority: priority,
        };

        let result = unsafe { libc::sched_setscheduler(pid as libc::pid_t, policy_id, &param) };

        if result == 0 {
            tracing::info!(
                "process {} scheduling policy changed to '{}' (priority={}) (request={})",
                pid,
                policy,
                priority,
                request
            );
        } else {
            tracing::error!(
                "could not change process {} scheduling policy to '{}' (request={})",
                pid,
                policy,
                request
            );
        }
    }

    fn apply_io(&self, pid: u32, settings: &ProcessSettings, request: &str) {
        let io = &settings.io;

        let Some(class) = io.class else {
            return;
        };

        let level = if class.supports_priority() {
            match io.nice {
                Some(level) if (0..=7).contains(&level) => level as u8,
                Some(level) => {
                    tracing::warn!(
                        "invalid I/O nice level {}: must be within 0..=7 (request={})",
                        level,
                        request
                    );
                    return;
                }
                None => {
                    tracing::warn!(
                        "no I/O nice level defined: 0 will be used (request={})",
                        request
                    );
                    0
                }
            }
        } else {
            if io.nice.is_some() {
                tracing::warn!("the idle I/O class does not take a priority (request={})", request);
            }

            0
        };

        let priority = match class {
            IoClass::Idle => Priority::new(Class::Idle),
            IoClass::BestEffort => match BePriorityLevel::from_level(level) {
                Some(level) => Priority::new(Class::BestEffort(level)),
                None => return,
            },
            IoClass::Realtime => {
                if !is_root() {
                    tracing::warn!(
                        "the realtime I/O class for process {} requires root privileges (request={})",
                        pid,
                        request
                    );
                    return;
                }

                match RtPriorityLevel::from_level(level) {
                    Some(level) => Priority::new(Class::Realtime(level)),
                    None => return,
                }
            }
        };

        #[allow(clippy::cast_possible_wrap)]
        match ioprio::set_priority(Target::Process(Pid::from_raw(pid as i32)), priority) {
            Ok(()) => {
                tracing::info!(
                    "process {} I/O class changed (level={}) (request={})",
                    pid,
                    level,
                    request
                );
            }
            Err(why) => {
                tracing::error!("failed to set process {} ioprio: {:?} (request={})", pid, why, request);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_nice_is_readable() {
        let pid = std::process::id();
        let nice = get_nice(pid);
        assert!(nice.is_some());
    }

    #[test]
    fn missing_process_has_no_nice() {
        // Pid values beyond the default kernel maximum never exist.
        assert_eq!(get_nice(u32::MAX - 1), None);
    }

    #[tokio::test]
    async fn reapply_is_idempotent() {
        let pid = std::process::id();
        let current = get_nice(pid).unwrap();

        // Raising our own nice requires no privileges; applying the same
        // level twice must observe the same state as a single apply.
        let level = current.max(5);
        assert!(set_nice(pid, level, "test"));
        assert_eq!(get_nice(pid), Some(level));
        assert!(set_nice(pid, level, "test"));
        assert_eq!(get_nice(pid), Some(level));
    }
}
