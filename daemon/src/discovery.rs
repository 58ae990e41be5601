// Copyright 2023 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! Descendant discovery for a session: launcher-mapped successors, Steam
//! game processes, and plain children. Producers poll procfs under two
//! wall-clock deadlines (the absolute search timeout and the shorter
//! found-timeout armed by each match) and stream pids back to the session
//! exactly once each.

use std::collections::HashSet;
use std::path::Path;
use std::time::{Duration, Instant};

use guapow_config::launchers::{LauncherRule, SearchMode};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use crate::process;

static RE_STEAM_LAUNCH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^.+/(\w+)\s+SteamLaunch\s+.+").unwrap());
static RE_PROTON_COMMAND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^.+/proton\s+waitforexitandrun\s+.+$").unwrap());

/// Comms of Steam plumbing and store helpers that must never be
/// optimized in place of the game.
const STEAM_IGNORED: &[&str] = &[
    "wineserver", "services.exe", "winedevice.exe", "plugplay.exe", "svchost.exe",
    "explorer.exe", "rpcss.exe", "tabtip.exe", "wine", "wine64", "wineboot.exe",
    "cmd.exe", "conhost.exe", "start.exe", "steam-runtime-l", "proton", "gzip",
    "steam.exe", "python", "python3", "OriginWebHelper", "Origin.exe",
    "OriginClientSer", "QtWebEngineProc", "EASteamProxy.ex", "ActivationUI.ex",
    "EALink.exe", "OriginLegacyCLI", "IGOProxy.exe", "IGOProxy64.exe", "igoproxy64.exe",
    "ldconfig", "UPlayBrowser.exe", "UbisoftGameLaun", "upc.exe", "UplayService.ex",
    "UplayWebCore.ex", "CrRendererMain", "regsvr32", "CrGpuMain", "CrUtilityMain",
    "whql:off", "PnkBstrA.exe",
];

/// Deadline bookkeeping shared by every search: the absolute timeout from
/// the search start and a rolling found-timeout armed by each match.
struct Deadlines {
    absolute: Instant,
    found_timeout: Duration,
    found: Option<Instant>,
}

impl Deadlines {
    fn new(timeout_secs: f32, found_timeout_secs: f32) -> Self {
        Self {
            absolute: Instant::now() + Duration::from_secs_f32(timeout_secs),
            found_timeout: Duration::from_secs_f32(found_timeout_secs),
            found: None,
        }
    }

    fn expired(&self) -> bool {
        let now = Instant::now();
        now >= self.absolute || self.found.map_or(false, |deadline| now >= deadline)
    }

    fn mark_found(&mut self) {
        self.found = Some(Instant::now() + self.found_timeout);
    }
}

/// Poll cadence derived from the search window, bounded so that short
/// windows still get several scans and long ones do not hammer procfs.
fn poll_interval(timeout_secs: f32) -> Duration {
    Duration::from_secs_f32((timeout_secs / 100.0).clamp(0.1, 1.0))
}

/// Picks the launcher rule applying to the target's comm: per-request
/// rules first, the global launchers file otherwise.
pub fn select_rule(
    request_rules: &[LauncherRule],
    user_id: u32,
    user_name: &str,
    comm: &str,
) -> Option<LauncherRule> {
    if let Some(rule) = request_rules.iter().find(|rule| rule.matches_exe(comm)) {
        return Some(rule.clone());
    }

    if !request_rules.is_empty() {
        // Per-request rules mask the global file for this launcher.
        return None;
    }

    for path in guapow_config::paths_by_priority("launchers", user_id, user_name) {
        if !Path::new(&path).exists() {
            continue;
        }

        match std::fs::read_to_string(&path) {
            Ok(text) => {
                tracing::debug!("checking mapped launchers on {}", path.display());
                return guapow_config::launchers::parse_file(&text)
                    .into_iter()
                    .find(|rule| rule.matches_exe(comm));
            }
            Err(why) => {
                tracing::warn!("failed to read {}: {}", path.display(), why);
            }
        }
    }

    None
}

/// Streams descendants of `source_pid` matching the launcher rule.
pub fn launcher_search(
    rule: LauncherRule,
    source_pid: u32,
    timeout_secs: f32,
    found_timeout_secs: f32,
    request: String,
) -> UnboundedReceiver<u32> {
    let (tx, rx) = unbounded_channel();

    tokio::task::spawn_local(async move {
        let mut deadlines = Deadlines::new(timeout_secs, found_timeout_secs);
        let interval = poll_interval(timeout_secs);
        let mut found: HashSet<u32> = HashSet::new();

        tracing::debug!(
            "looking for a process with {:?} '{}' (launcher={}, request={})",
            rule.mode,
            rule.target,
            rule.exe,
            request
        );

        while !deadlines.expired() {
            let snapshot = process::snapshot_by_parent();
            let candidates =
                process::find_children(&snapshot, source_pid, true, &found, &HashSet::new());

            for (pid, comm, _ppid) in candidates {
                let matched = match rule.mode {
                    SearchMode::Name => rule.matches_target(&comm),
                    SearchMode::Command => process::cmdline(pid)
                        .map_or(false, |cmdline| rule.matches_target(&cmdline)),
                };

                if matched {
                    tracing::info!("mapped process '{}' ({}) found (request={})", comm, pid, request);
                    deadlines.mark_found();
                    found.insert(pid);

                    if tx.send(pid).is_err() {
                        return;
                    }
                }
            }

            tokio::time::sleep(interval).await;
        }

        if found.is_empty() {
            tracing::warn!(
                "could not find a process matching '{}' (launcher={}, request={})",
                rule.target,
                rule.exe,
                request
            );
        }
    });

    rx
}

/// The comm wrapped by a `SteamLaunch` command line, when there is one.
#[must_use]
pub fn steam_root_comm(cmdline: &str) -> Option<String> {
    RE_STEAM_LAUNCH
        .captures(cmdline)
        .map(|capture| capture[1].to_owned())
}

/// The chain of comms expected between the request pid and the parent of
/// the game processes, top-down.
#[must_use]
pub fn steam_hierarchy(cmdline: &str) -> Vec<&'static str> {
    if cmdline.contains("/steamapps/common/SteamLinux") {
        vec!["pv-bwrap", "pressure-vessel"]
    } else if RE_PROTON_COMMAND.is_match(cmdline) {
        vec!["python3"]
    } else {
        Vec::new()
    }
}

/// Walks the expected hierarchy below `root`, preferring the youngest pid
/// on comm collisions. Returns the parent whose children are the game.
fn resolve_hierarchy(
    snapshot: &std::collections::HashMap<u32, Vec<(u32, String)>>,
    root: u32,
    chain: &[&str],
) -> Option<u32> {
    let mut current = root;

    for comm in chain {
        let children = snapshot.get(&current)?;

        current = children
            .iter()
            .filter(|(_, child_comm)| child_comm == comm)
            .map(|(pid, _)| *pid)
            .max()?;
    }

    Some(current)
}

/// Streams the Steam game processes spawned below `source_pid`.
pub fn steam_search(
    source_pid: u32,
    cmdline: String,
    timeout_secs: f32,
    found_timeout_secs: f32,
    request: String,
) -> Option<UnboundedReceiver<u32>> {
    let Some(root_comm) = steam_root_comm(&cmdline) else {
        tracing::warn!("command not from Steam: {} (request={})", cmdline, request);
        return None;
    };

    tracing::debug!("Steam command detected (request={})", request);

    let chain = steam_hierarchy(&cmdline);
    let (tx, rx) = unbounded_channel();

    tokio::task::spawn_local(async move {
        let mut deadlines = Deadlines::new(timeout_secs, found_timeout_secs);
        let interval = poll_interval(timeout_secs);

        let mut ignored: HashSet<&str> = STEAM_IGNORED.iter().copied().collect();
        ignored.insert(&root_comm);
        for comm in &chain {
            ignored.insert(*comm);
        }

        let mut target_parent: Option<u32> = None;
        let mut found: HashSet<u32> = HashSet::new();

        while !deadlines.expired() {
            let snapshot = process::snapshot_by_parent();

            if target_parent.is_none() {
                target_parent = resolve_hierarchy(&snapshot, source_pid, &chain);

                if let Some(parent) = target_parent {
                    tracing::debug!(
                        "target Steam process parent found (pid={}, request={})",
                        parent,
                        request
                    );
                }
            }

            if let Some(parent) = target_parent {
                for (pid, comm, ppid) in
                    process::find_children(&snapshot, parent, false, &found, &ignored)
                {
                    tracing::info!(
                        "Steam child process found: {} (pid={}, ppid={}) (request={})",
                        comm,
                        pid,
                        ppid,
                        request
                    );
                    deadlines.mark_found();
                    found.insert(pid);

                    if tx.send(pid).is_err() {
                        return;
                    }
                }
            }

            tokio::time::sleep(interval).await;
        }

        tracing::debug!("Steam subprocess search timed out (request={})", request);
    });

    Some(rx)
}

/// Streams every new descendant of the given parents until the deadlines
/// expire.
pub fn children_search(
    parents: Vec<u32>,
    timeout_secs: f32,
    found_timeout_secs: f32,
    request: String,
) -> UnboundedReceiver<u32> {
    let (tx, rx) = unbounded_channel();

    tokio::task::spawn_local(async move {
        let mut deadlines = Deadlines::new(timeout_secs, found_timeout_secs);
        let interval = poll_interval(timeout_secs);
        let mut found: HashSet<u32> = HashSet::new();

        while !deadlines.expired() {
            let snapshot = process::snapshot_by_parent();

            for parent in &parents {
                for (pid, comm, ppid) in
                    process::find_children(&snapshot, *parent, true, &found, &HashSet::new())
                {
                    tracing::info!(
                        "child process found: {} (pid={}, ppid={}) (request={})",
                        comm,
                        pid,
                        ppid,
                        request
                    );
                    deadlines.mark_found();
                    found.insert(pid);

                    if tx.send(pid).is_err() {
                        return;
                    }
                }
            }

            tokio::time::sleep(interval).await;
        }

        tracing::debug!("children search finished (request={})", request);
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn steam_command_recognition() {
        let cmd = "/home/u/.local/share/Steam/ubuntu12_32/reaper SteamLaunch AppId=123 -- /path/game";
        assert_eq!(steam_root_comm(cmd).as_deref(), Some("reaper"));
        assert_eq!(steam_root_comm("/usr/bin/game"), None);
    }

    #[test]
    fn steam_hierarchy_shapes() {
        let container = "/x/steamapps/common/SteamLinux/run reaper SteamLaunch -- game";
        assert_eq!(steam_hierarchy(container), vec!["pv-bwrap", "pressure-vessel"]);

        let proton = "/steam/compatibilitytools.d/proton waitforexitandrun /x/game.exe";
        assert_eq!(steam_hierarchy(proton), vec!["python3"]);

        assert!(steam_hierarchy("/usr/bin/reaper SteamLaunch -- game").is_empty());
    }

    #[test]
    fn hierarchy_resolution_prefers_youngest() {
        let mut snapshot: HashMap<u32, Vec<(u32, String)>> = HashMap::new();
        snapshot.insert(100, vec![(110, "python3".into()), (120, "python3".into())]);
        snapshot.insert(120, vec![(130, "game.exe".into())]);

        assert_eq!(resolve_hierarchy(&snapshot, 100, &["python3"]), Some(120));
        assert_eq!(resolve_hierarchy(&snapshot, 100, &[]), Some(100));
        assert_eq!(resolve_hierarchy(&snapshot, 100, &["missing"]), None);
    }

    #[test]
    fn request_rules_mask_global_file() {
        let request_rules = guapow_config::launchers::from_pairs(&[(
            "launcher".to_string(),
            "n%game-*".to_string(),
        )]);

        let selected = select_rule(&request_rules, 1000, "alice", "launcher").unwrap();
        assert_eq!(selected.target, "game-*");

        // A non-matching per-request set still masks the global file.
        assert!(select_rule(&request_rules, 1000, "alice", "other").is_none());
    }

    #[tokio::test]
    async fn children_search_observes_deadlines() {
        let local = tokio::task::LocalSet::new();

        local
            .run_until(async {
                let start = Instant::now();
                let mut rx = children_search(vec![1], 0.3, 0.2, "test".into());

                // Drain whatever init's children look like until closed.
                while rx.recv().await.is_some() {}

                // max(timeout, last_match + found_timeout) with a poll of
                // slack on top.
                assert!(start.elapsed() < Duration::from_secs(3));
            })
            .await;
    }
}
