// Copyright 2023 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! Procfs adapters: everything the optimizer learns about processes goes
//! through here. Reads are lock-free and best-effort; a vanished process
//! is reported as `None` rather than an error.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use concat_in_place::strcat;
use std::os::unix::prelude::OsStrExt;

/// Whether a process currently exists.
#[must_use]
pub fn exists(pid: u32) -> bool {
    let mut itoa = itoa::Buffer::new();
    Path::new(strcat!("/proc/" itoa.format(pid)).as_str()).exists()
}

/// The process comm (`/proc/<pid>/comm`), truncated by the kernel to 15
/// characters.
#[must_use]
pub fn comm(pid: u32) -> Option<String> {
    let mut itoa = itoa::Buffer::new();
    let path = strcat!("/proc/" itoa.format(pid) "/comm");

    std::fs::read_to_string(path)
        .ok()
        .map(|comm| comm.trim().to_owned())
        .filter(|comm| !comm.is_empty())
}

/// The full command line with NUL separators flattened to spaces.
#[must_use]
pub fn cmdline(pid: u32) -> Option<String> {
    let mut itoa = itoa::Buffer::new();
    let path = strcat!("/proc/" itoa.format(pid) "/cmdline");

    let raw = std::fs::read(path).ok()?;

    let cmdline = raw
        .split(|byte| *byte == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part))
        .collect::<Vec<_>>()
        .join(" ");

    (!cmdline.is_empty()).then_some(cmdline)
}

fn status_field(pid: u32, key: &str) -> Option<String> {
    let mut itoa = itoa::Buffer::new();
    let path = strcat!("/proc/" itoa.format(pid) "/status");

    let buffer = std::fs::read_to_string(path).ok()?;

    buffer
        .lines()
        .find_map(|line| line.strip_prefix(key))
        .and_then(|value| value.split_whitespace().next())
        .map(String::from)
}

/// The parent pid from `/proc/<pid>/status`.
#[must_use]
pub fn parent_id(pid: u32) -> Option<u32> {
    status_field(pid, "PPid:").and_then(|value| atoi::atoi::<u32>(value.as_bytes()))
}

/// The real uid owning the process.
#[must_use]
pub fn uid_of_pid(pid: u32) -> Option<u32> {
    status_field(pid, "Uid:").and_then(|value| atoi::atoi::<u32>(value.as_bytes()))
}

/// Every pid currently alive.
#[must_use]
pub fn alive_pids() -> HashSet<u32> {
    let mut pids = HashSet::new();

    if let Ok(procfs) = std::fs::read_dir("/proc/") {
        for entry in procfs.filter_map(Result::ok) {
            if let Some(pid) = atoi::atoi::<u32>(entry.file_name().as_bytes()) {
                pids.insert(pid);
            }
        }
    }

    pids
}

/// One scan of procfs mapping each parent pid to its `(pid, comm)`
/// children, from the `pid (comm) state ppid` prefix of `/proc/<pid>/stat`.
#[must_use]
pub fn snapshot_by_parent() -> HashMap<u32, Vec<(u32, String)>> {
    let mut map: HashMap<u32, Vec<(u32, String)>> = HashMap::new();

    let Ok(procfs) = std::fs::read_dir("/proc/") else {
        tracing::error!("failed to read /proc");
        return map;
    };

    let mut itoa = itoa::Buffer::new();

    for entry in procfs.filter_map(Result::ok) {
        let Some(pid) = atoi::atoi::<u32>(entry.file_name().as_bytes()) else {
            continue;
        };

        let path = strcat!("/proc/" itoa.format(pid) "/stat");

        let Ok(stat) = std::fs::read_to_string(path) else {
            continue;
        };

        if let Some((comm, ppid)) = parse_stat(&stat) {
            map.entry(ppid).or_default().push((pid, comm.to_owned()));
        }
    }

    map
}

/// Extracts `(comm, ppid)` from a stat line. The comm is parenthesized
/// and may itself contain parentheses and spaces, so the split anchors on
/// the last `)`.
fn parse_stat(stat: &str) -> Option<(&str, u32)> {
    let open = memchr::memchr(b'(', stat.as_bytes())?;
    let close = memchr::memrchr(b')', stat.as_bytes())?;

    let comm = &stat[open + 1..close];
    let ppid = stat[close + 1..].split_whitespace().nth(1)?;

    Some((comm, atoi::atoi::<u32>(ppid.as_bytes())?))
}

/// Children of `root` in a parent snapshot, the whole descendant tree
/// when `recursive`, skipping pids in `already_found` and comms in
/// `ignored`.
#[must_use]
pub fn find_children(
    snapshot: &HashMap<u32, Vec<(u32, String)>>,
    root: u32,
    recursive: bool,
    already_found: &HashSet<u32>,
    ignored: &HashSet<&str>,
) -> Vec<(u32, String, u32)> {
    let mut found = Vec::new();
    let mut frontier = vec![root];

    while let Some(parent) = frontier.pop() {
        let Some(children) = snapshot.get(&parent) else {
            continue;
        };

        for (pid, comm) in children {
            if recursive {
                frontier.push(*pid);
            }

            if already_found.contains(pid) || ignored.contains(comm.as_str()) {
                continue;
            }

            found.push((*pid, comm.clone(), parent));
        }
    }

    found
}

/// Maps each requested comm to the first matching live pid.
#[must_use]
pub fn pids_by_comm(names: &[String]) -> HashMap<String, u32> {
    let mut found = HashMap::new();

    let Ok(procfs) = std::fs::read_dir("/proc/") else {
        return found;
    };

    for entry in procfs.filter_map(Result::ok) {
        let Some(pid) = atoi::atoi::<u32>(entry.file_name().as_bytes()) else {
            continue;
        };

        let Some(comm) = comm(pid) else {
            continue;
        };

        if names.contains(&comm) {
            found.entry(comm).or_insert(pid);
        }
    }

    found
}

/// Live pids whose comm equals `name`.
#[must_use]
pub fn pids_with_comm(name: &str) -> Vec<u32> {
    let mut pids = Vec::new();

    if let Ok(procfs) = std::fs::read_dir("/proc/") {
        for entry in procfs.filter_map(Result::ok) {
            if let Some(pid) = atoi::atoi::<u32>(entry.file_name().as_bytes()) {
                if comm(pid).as_deref() == Some(name) {
                    pids.push(pid);
                }
            }
        }
    }

    pids
}

/// The number of online CPUs.
#[must_use]
pub fn online_cpus() -> usize {
    let cpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    cpus.max(0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_parsing() {
        assert_eq!(parse_stat("42 (bash) S 1 42 42"), Some(("bash", 1)));
        // Comms may contain spaces and parentheses.
        assert_eq!(
            parse_stat("99 (tmux: server (1)) S 7 99 99"),
            Some(("tmux: server (1)", 7))
        );
        assert_eq!(parse_stat("broken"), None);
    }

    #[test]
    fn child_search() {
        let mut snapshot: HashMap<u32, Vec<(u32, String)>> = HashMap::new();
        snapshot.insert(1, vec![(10, "launcher".into())]);
        snapshot.insert(10, vec![(20, "game".into()), (21, "wineserver".into())]);
        snapshot.insert(20, vec![(30, "worker".into())]);

        let ignored = HashSet::from(["wineserver"]);

        let direct = find_children(&snapshot, 10, false, &HashSet::new(), &ignored);
        assert_eq!(direct, vec![(20, "game".to_string(), 10)]);

        let mut all = find_children(&snapshot, 1, true, &HashSet::new(), &HashSet::new());
        all.sort();
        assert_eq!(all.len(), 4);
        assert!(all.contains(&(30, "worker".to_string(), 20)));

        let already = HashSet::from([20]);
        let rest = find_children(&snapshot, 10, false, &already, &ignored);
        assert!(rest.is_empty());
    }

    #[test]
    fn self_process_visible() {
        let pid = std::process::id();
        assert!(exists(pid));
        assert!(comm(pid).is_some());
        assert!(cmdline(pid).is_some());
        assert!(parent_id(pid).is_some());
        assert!(uid_of_pid(pid).is_some());
        assert!(alive_pids().contains(&pid));
        assert!(online_cpus() > 0);
    }
}
