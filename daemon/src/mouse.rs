// Copyright 2023 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! Mouse pointer hiding through `unclutter`, reference-counted across
//! sessions. An `unclutter` started by someone else is left alone.

use std::collections::{BTreeSet, HashMap};

use tokio::sync::Mutex;

use crate::session::SessionId;
use crate::{apply, exec, process};

const UNCLUTTER: &str = "unclutter";
const HIDE_CMD: &str = "unclutter --timeout 1 -b";

#[derive(Default)]
struct MouseState {
    holders: BTreeSet<SessionId>,
    spawned: bool,
}

/// Reference-counted mouse pointer custodian.
pub struct MouseManager {
    state: Mutex<MouseState>,
}

impl MouseManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MouseState::default()),
        }
    }

    /// Whether pointer hiding can work at all.
    #[must_use]
    pub fn available(&self) -> bool {
        exec::which(UNCLUTTER)
    }

    /// Hides the pointer while any session holds the manager.
    pub async fn acquire(
        &self,
        session: SessionId,
        uid: Option<u32>,
        user_env: Option<&HashMap<String, String>>,
    ) {
        let mut state = self.state.lock().await;

        if state.holders.is_empty() && !state.spawned {
            if process::pids_with_comm(UNCLUTTER).is_empty() {
                match exec::spawn_detached(HIDE_CMD, user_env, uid) {
                    Ok(pid) => {
                        tracing::info!("mouse cursor hidden ({} pid={})", UNCLUTTER, pid);
                        state.spawned = true;

                        // Keep the pointer helper from competing with the
                        // optimized process.
                        apply::set_nice(pid, 1, "mouse");
                    }
                    Err(why) => {
                        tracing::error!("could not hide the mouse cursor: {}", why);
                    }
                }
            } else {
                tracing::warn!("mouse cursor is already hidden by another '{}'", UNCLUTTER);
            }
        }

        state.holders.insert(session);
    }

    /// Shows the pointer again once the last holder releases, if this
    /// daemon was the one hiding it.
    pub async fn release(&self, session: SessionId) {
        let mut state = self.state.lock().await;

        if !state.holders.remove(&session) || !state.holders.is_empty() {
            return;
        }

        if !state.spawned {
            return;
        }

        // The lock is held through the kill so a concurrent first acquire
        // cannot respawn unclutter underneath it.
        state.spawned = false;

        let pids = process::pids_with_comm(UNCLUTTER);

        if pids.is_empty() {
            tracing::info!("mouse cursor is already being displayed");
            return;
        }

        let mut failed = false;
        for pid in pids {
            if unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) } != 0 {
                failed = true;
            }
        }

        if failed {
            tracing::error!("not all '{}' instances could be stopped", UNCLUTTER);
        } else {
            tracing::info!("displaying mouse cursor");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn holder_bookkeeping() {
        let manager = MouseManager::new();

        // Without unclutter installed nothing is spawned, but holder
        // accounting still drives the acquire/release transitions.
        manager.acquire(7, None, None).await;
        manager.acquire(9, None, None).await;
        manager.release(7).await;
        assert_eq!(manager.state.lock().await.holders.len(), 1);

        manager.release(9).await;
        assert!(manager.state.lock().await.holders.is_empty());
    }
}
