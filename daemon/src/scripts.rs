// Copyright 2023 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! Profile script execution for the optimizer-run phases. Scripts run as
//! the requesting user unless the root opt-ins line up; serialization and
//! wait bounds follow the phase's `wait`/`timeout` options. A script that
//! outlives its timeout is left running, never killed.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use guapow_config::profile::ScriptSettings;
use tokio::process::Command;

use crate::apply;
use crate::exec;

/// Who the scripts of a phase should run as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunLevel {
    Daemon,
    User(u32),
    Root,
}

fn resolve_run_level(
    phase: &str,
    settings: &ScriptSettings,
    user_id: Option<u32>,
    root_allowed: bool,
) -> Option<RunLevel> {
    if apply::is_root() {
        if !settings.run_as_root && user_id.map_or(false, |uid| uid != 0) {
            return user_id.map(RunLevel::User);
        }

        if root_allowed {
            return Some(RunLevel::Root);
        }

        tracing::warn!("{} scripts are not allowed to run at the root level", phase);
        return None;
    }

    if settings.run_as_root {
        tracing::warn!("cannot execute {} scripts as the root user", phase);
        return None;
    }

    match user_id {
        None => Some(RunLevel::Daemon),
        Some(uid) if uid == unsafe { libc::geteuid() } => Some(RunLevel::Daemon),
        Some(uid) => {
            tracing::warn!("cannot execute {} scripts as user {}", phase, uid);
            None
        }
    }
}

/// Runs one phase of scripts, returning the pids that were started so the
/// session can track them.
pub async fn run_phase(
    phase: &str,
    settings: &ScriptSettings,
    user_id: Option<u32>,
    user_env: Option<&HashMap<String, String>>,
    root_allowed: bool,
    request: &str,
) -> Vec<u32> {
    if settings.scripts.is_empty() {
        return Vec::new();
    }

    let Some(level) = resolve_run_level(phase, settings, user_id, root_allowed) else {
        return Vec::new();
    };

    let env = exec::build_env(user_env);
    let mut pids = Vec::with_capacity(settings.scripts.len());

    for script in &settings.scripts {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(script)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        if let RunLevel::User(uid) = level {
            command.uid(uid);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(why) => {
                tracing::error!("failed to start {} script '{}': {}", phase, script, why);
                continue;
            }
        };

        let pid = child.id().unwrap_or(0);
        tracing::info!("started {} script '{}' (pid={}) (request={})", phase, script, pid, request);

        if pid != 0 {
            pids.push(pid);
        }

        if !settings.wait {
            continue;
        }

        match settings.timeout {
            // A zero timeout means the next script starts immediately.
            Some(timeout) if timeout <= 0.0 => continue,
            Some(timeout) => {
                tracing::info!("waiting {} script '{}' to finish (pid={})", phase, script, pid);

                match tokio::time::timeout(Duration::from_secs_f32(timeout), child.wait()).await {
                    Ok(Ok(status)) => log_exit(phase, script, pid, status.code()),
                    Ok(Err(why)) => {
                        tracing::error!("failed awaiting {} script '{}': {}", phase, script, why);
                    }
                    // Timed out: unblock the phase but leave the child
                    // running.
                    Err(_) => {
                        tracing::warn!("{} script '{}' timed out (pid={})", phase, script, pid);
                    }
                }
            }
            None => {
                tracing::info!("waiting {} script '{}' to finish (pid={})", phase, script, pid);

                match child.wait().await {
                    Ok(status) => log_exit(phase, script, pid, status.code()),
                    Err(why) => {
                        tracing::error!("failed awaiting {} script '{}': {}", phase, script, why);
                    }
                }
            }
        }
    }

    pids
}

fn log_exit(phase: &str, script: &str, pid: u32, code: Option<i32>) {
    match code {
        Some(0) => tracing::info!("{} script '{}' finished (pid={})", phase, script, pid),
        code => tracing::warn!(
            "{} script '{}' finished with exit code {:?} (pid={})",
            phase,
            script,
            code,
            pid
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn settings(scripts: &[&str], wait: bool, timeout: Option<f32>) -> ScriptSettings {
        ScriptSettings {
            scripts: scripts.iter().map(|s| (*s).to_string()).collect(),
            wait,
            timeout,
            run_as_root: false,
        }
    }

    #[tokio::test]
    async fn detached_scripts_do_not_block() {
        let start = Instant::now();
        let pids = run_phase("test", &settings(&["sleep 5"], false, None), None, None, false, "t").await;

        assert_eq!(pids.len(), 1);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn serialized_scripts_await_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let script = format!("touch {}", marker.display());

        run_phase("test", &settings(&[&script, "true"], true, None), None, None, false, "t").await;
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn timeout_unblocks_without_killing() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("late");
        let slow = format!("sleep 1 && touch {}", marker.display());

        let start = Instant::now();
        run_phase("test", &settings(&[&slow, "true"], true, Some(0.2)), None, None, false, "t").await;

        // The phase moved on before the slow script finished.
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!marker.exists());

        // The timed-out child kept running and completed later.
        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn zero_timeout_skips_waiting() {
        let start = Instant::now();
        run_phase("test", &settings(&["sleep 5"], true, Some(0.0)), None, None, false, "t").await;
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn run_levels() {
        // These tests run unprivileged: root-only branches are the
        // warning paths.
        let plain = settings(&["true"], false, None);
        let as_root = ScriptSettings {
            run_as_root: true,
            ..plain.clone()
        };

        if apply::is_root() {
            assert_eq!(
                resolve_run_level("t", &plain, Some(1000), false),
                Some(RunLevel::User(1000))
            );
            assert_eq!(resolve_run_level("t", &as_root, Some(1000), true), Some(RunLevel::Root));
            assert_eq!(resolve_run_level("t", &as_root, Some(1000), false), None);
        } else {
            let own = unsafe { libc::geteuid() };
            assert_eq!(resolve_run_level("t", &plain, Some(own), false), Some(RunLevel::Daemon));
            assert_eq!(resolve_run_level("t", &plain, None, false), Some(RunLevel::Daemon));
            assert_eq!(resolve_run_level("t", &as_root, Some(own), true), None);
            assert_eq!(resolve_run_level("t", &plain, Some(own.wrapping_add(1)), false), None);
        }
    }
}
