// Copyright 2023 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! The nice monitor: re-asserts requested nice levels that the target (or
//! anything else) may overwrite, at a fixed interval, until every watched
//! process is gone.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use crate::{apply, process};

struct WatchedNice {
    level: i32,
    request: String,
}

/// Watches nice levels for the whole daemon. One lazily-started task
/// serves every session; it stops when its table drains.
pub struct NiceWatcher {
    interval: Duration,
    entries: RefCell<HashMap<u32, WatchedNice>>,
    running: Cell<bool>,
}

impl NiceWatcher {
    pub fn new(interval_secs: f32) -> Rc<Self> {
        Rc::new(Self {
            interval: Duration::from_secs_f32(interval_secs),
            entries: RefCell::new(HashMap::new()),
            running: Cell::new(false),
        })
    }

    /// Registers a pid for monitoring and starts the watch task if it is
    /// not already running. Repeated registrations are ignored.
    pub fn watch(self: &Rc<Self>, pid: u32, level: i32, request: &str) {
        {
            let mut entries = self.entries.borrow_mut();

            if entries.contains_key(&pid) {
                tracing::debug!("process {} nice level is already monitored (request={})", pid, request);
                return;
            }

            tracing::info!("process {} nice level will be monitored (request={})", pid, request);
            entries.insert(
                pid,
                WatchedNice {
                    level,
                    request: request.to_owned(),
                },
            );
        }

        if !self.running.get() {
            self.running.set(true);
            let watcher = Rc::clone(self);
            tokio::task::spawn_local(async move { watcher.run().await });
        }
    }

    /// Drops a session's pids from the watch table.
    pub fn forget(&self, pids: &[u32]) {
        let mut entries = self.entries.borrow_mut();
        for pid in pids {
            entries.remove(pid);
        }
    }

    async fn run(self: Rc<Self>) {
        loop {
            let watched: Vec<(u32, i32, String)> = self
                .entries
                .borrow()
                .iter()
                .map(|(pid, entry)| (*pid, entry.level, entry.request.clone()))
                .collect();

            if watched.is_empty() {
                break;
            }

            let alive = process::alive_pids();
            let mut dead = Vec::new();

            for (pid, level, request) in watched {
                if !alive.contains(&pid) {
                    dead.push(pid);
                    continue;
                }

                let current = apply::get_nice(pid);
                if current != Some(level) {
                    tracing::debug!(
                        "process {} nice level {:?} differs from the expected {} (request={})",
                        pid,
                        current,
                        level,
                        request
                    );
                    apply::set_nice(pid, level, &request);
                }
            }

            if !dead.is_empty() {
                let mut entries = self.entries.borrow_mut();
                for pid in &dead {
                    entries.remove(pid);
                }

                tracing::debug!("stopped monitoring the nice level of dead processes: {:?}", dead);
            }

            if self.entries.borrow().is_empty() {
                break;
            }

            tokio::time::sleep(self.interval).await;
        }

        self.running.set(false);
        tracing::debug!("stopped monitoring nice levels");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reasserts_drifted_nice() {
        let local = tokio::task::LocalSet::new();

        local
            .run_until(async {
                let watcher = NiceWatcher::new(0.05);
                let pid = std::process::id();

                // Unprivileged processes may only raise their nice, so the
                // drift is set up below the watched level.
                let current = apply::get_nice(pid).unwrap();
                if current > 17 {
                    return;
                }

                let level = current + 2;
                assert!(apply::set_nice(pid, current + 1, "test"));

                watcher.watch(pid, level, "test");

                tokio::time::sleep(Duration::from_millis(200)).await;
                assert_eq!(apply::get_nice(pid), Some(level));

                watcher.forget(&[pid]);
            })
            .await;
    }

    #[tokio::test]
    async fn watch_table_drains_on_dead_pids() {
        let local = tokio::task::LocalSet::new();

        local
            .run_until(async {
                let watcher = NiceWatcher::new(0.05);
                watcher.watch(u32::MAX - 2, 5, "test");

                tokio::time::sleep(Duration::from_millis(200)).await;
                assert!(watcher.entries.borrow().is_empty());
                assert!(!watcher.running.get());
            })
            .await;
    }
}
