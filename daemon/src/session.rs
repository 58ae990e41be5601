// Copyright 2023 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! One session per accepted request: resolve the profile, redirect to
//! launcher-mapped targets, run the appliers and hooks in phase order,
//! track discovered children, wait for every tracked process to exit,
//! then roll everything back. Errors in individual phases are logged and
//! never abort the rest of the plan.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::rc::Rc;
use std::time::{Duration, Instant};

use guapow_config::launchers;
use guapow_config::profile::Profile;
use guapow_config::settings::OptConfig;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use crate::apply::{self, Applier};
use crate::compositor::CompositorManager;
use crate::cpu::CpuFreqManager;
use crate::gpu::GpuManager;
use crate::mouse::MouseManager;
use crate::profiles::ProfileResolver;
use crate::renice::NiceWatcher;
use crate::request::OptimizationRequest;
use crate::{discovery, exec, process, scripts};

/// Identifies one in-flight optimization for the shared-state managers.
pub type SessionId = u64;

struct StopDemand {
    cmd: Option<String>,
    relaunch: bool,
    holders: BTreeSet<SessionId>,
}

/// Daemon-wide state shared by every session.
pub struct Context {
    pub settings: OptConfig,
    pub cpufreq: CpuFreqManager,
    pub gpu: GpuManager,
    pub compositor: CompositorManager,
    pub mouse: MouseManager,
    pub nice_watcher: Rc<NiceWatcher>,
    pub applier: Applier,
    pub profiles: ProfileResolver,
    queue: RefCell<HashSet<u32>>,
    stop_registry: RefCell<HashMap<String, StopDemand>>,
    next_session: Cell<SessionId>,
}

impl Context {
    pub fn new(settings: OptConfig) -> Rc<Self> {
        let cpu_count = process::online_cpus();
        let nice_watcher = NiceWatcher::new(settings.renice_interval);

        Rc::new(Self {
            cpufreq: CpuFreqManager::new(cpu_count),
            gpu: GpuManager::new(&settings),
            compositor: CompositorManager::new(settings.compositor.as_deref()),
            mouse: MouseManager::new(),
            applier: Applier::new(cpu_count, Rc::clone(&nice_watcher)),
            profiles: ProfileResolver::new(settings.profile_cache),
            nice_watcher,
            queue: RefCell::new(HashSet::new()),
            stop_registry: RefCell::new(HashMap::new()),
            next_session: Cell::new(1),
            settings,
        })
    }

    fn next_id(&self) -> SessionId {
        let id = self.next_session.get();
        self.next_session.set(id + 1);
        id
    }

    /// Claims a pid for optimization. A pid already in flight is refused
    /// so repeated requests are ignored.
    pub fn queue_add(&self, pid: u32) -> bool {
        self.queue.borrow_mut().insert(pid)
    }

    pub fn queue_remove(&self, pid: u32) {
        self.queue.borrow_mut().remove(&pid);
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.queue.borrow().len()
    }

    fn register_stop(&self, session: SessionId, comm: &str, cmd: Option<String>, relaunch: bool) {
        let mut registry = self.stop_registry.borrow_mut();

        let demand = registry.entry(comm.to_owned()).or_insert_with(|| StopDemand {
            cmd: None,
            relaunch: false,
            holders: BTreeSet::new(),
        });

        demand.holders.insert(session);
        demand.relaunch |= relaunch;

        // Absolute commands are the ones that can actually be respawned.
        let keep_existing = demand.cmd.as_deref().map_or(false, |cmd| cmd.starts_with('/'));
        if !keep_existing {
            if let Some(cmd) = cmd {
                demand.cmd = Some(cmd);
            }
        }
    }

    /// Drops this session's stop demands and relaunches whatever no other
    /// live session still wants stopped.
    async fn release_stops(
        &self,
        session: SessionId,
        uid: Option<u32>,
        user_env: Option<&HashMap<String, String>>,
    ) {
        let mut to_relaunch = Vec::new();

        self.stop_registry.borrow_mut().retain(|comm, demand| {
            if !demand.holders.remove(&session) {
                return true;
            }

            if !demand.holders.is_empty() {
                // Another live session still demands this one stopped.
                return true;
            }

            if demand.relaunch {
                if let Some(cmd) = demand.cmd.take() {
                    to_relaunch.push((comm.clone(), cmd));
                }
            }

            false
        });

        for (comm, cmd) in to_relaunch {
            if !process::pids_by_comm(std::slice::from_ref(&comm)).is_empty() {
                tracing::warn!("process '{}' is alive: skipping its relaunch", comm);
                continue;
            }

            match exec::spawn_detached(&cmd, user_env, uid) {
                Ok(_) => tracing::info!("process '{}' ({}) relaunched", comm, cmd),
                Err(why) => tracing::warn!("could not relaunch '{}' ({}): {}", comm, cmd, why),
            }
        }
    }
}

#[derive(Default)]
struct HeldTokens {
    cpufreq: bool,
    gpu: bool,
    compositor: bool,
    mouse: bool,
}

/// Runs one optimization session to completion. The caller must have
/// claimed the request pid in the queue.
pub async fn handle(ctx: Rc<Context>, request: OptimizationRequest, cancel: CancellationToken) {
    let started = Instant::now();
    let correlation = request.correlation.clone();

    if !process::exists(request.pid) {
        tracing::warn!(
            "process {} does not exist: no optimization will be applied (request={})",
            request.pid,
            correlation
        );
        ctx.queue_remove(request.pid);
        return;
    }

    let Some(profile) = ctx.profiles.resolve(&request).await else {
        tracing::warn!("no optimizations available for process {} (request={})", request.pid, correlation);
        ctx.queue_remove(request.pid);
        return;
    };

    let id = ctx.next_id();
    let uid = request.user_id;
    let user_env = (!request.user_env.is_empty()).then(|| request.user_env.clone());

    tracing::info!("session {} started for process {} (request={})", id, request.pid, correlation);

    // Relaunch bookkeeping for what the Runner stopped client-side.
    for (comm, cmd) in &request.stopped_processes {
        ctx.register_stop(id, comm, cmd.clone(), request.relaunch_stopped);
    }

    let tracked: Rc<RefCell<HashSet<u32>>> = Rc::new(RefCell::new(HashSet::new()));
    let mut held = HeldTokens::default();
    let mut shared_done = false;

    // Launcher and Steam redirection: when a mapping stream yields pids,
    // those are the processes to optimize instead of the request target.
    let mut targets: Vec<u32> = Vec::new();

    if let Some(mut mapped) = mapping_stream(&ctx, &request, &profile) {
        loop {
            let pid = tokio::select! {
                _ = cancel.cancelled() => break,
                pid = mapped.recv() => match pid {
                    Some(pid) if pid != request.pid => pid,
                    Some(_) => continue,
                    None => break,
                },
            };

            if !shared_done {
                shared_phase(&ctx, id, &profile, uid, user_env.as_ref(), &mut held, &tracked, &correlation)
                    .await;
                shared_done = true;
            }

            tracked.borrow_mut().insert(pid);
            targets.push(pid);
            spawn_apply(&ctx, pid, &profile, &correlation);
        }
    }

    if targets.is_empty() && !cancel.is_cancelled() {
        if !shared_done {
            shared_phase(&ctx, id, &profile, uid, user_env.as_ref(), &mut held, &tracked, &correlation)
                .await;
        }

        tracked.borrow_mut().insert(request.pid);
        targets.push(request.pid);
        spawn_apply(&ctx, request.pid, &profile, &correlation);
    }

    // Track: newly appearing descendants receive the per-process
    // appliers, never the shared state.
    if ctx.settings.children_timeout > 0.0 && !targets.is_empty() && !cancel.is_cancelled() {
        let children = discovery::children_search(
            targets.clone(),
            ctx.settings.children_timeout,
            ctx.settings.children_found_timeout,
            correlation.clone(),
        );

        spawn_child_consumer(&ctx, children, &profile, &tracked, &correlation);
    } else if ctx.settings.children_timeout <= 0.0 {
        tracing::debug!("not looking for process children (request={})", correlation);
    }

    await_termination(&ctx, &tracked, &cancel).await;

    // Rollback: monitors, shared state, relaunches, finish hooks.
    let remaining: Vec<u32> = tracked.borrow().iter().copied().collect();
    ctx.nice_watcher.forget(&remaining);

    if held.compositor {
        ctx.compositor.release(id, uid, user_env.as_ref()).await;
    }

    if held.mouse {
        ctx.mouse.release(id).await;
    }

    if held.cpufreq {
        ctx.cpufreq.release(id).await;
    }

    if held.gpu {
        ctx.gpu.release(id, user_env.as_ref()).await;
    }

    ctx.release_stops(id, uid, user_env.as_ref()).await;

    if !profile.scripts_finish.scripts.is_empty() {
        scripts::run_phase(
            "finish",
            &profile.scripts_finish,
            uid,
            user_env.as_ref(),
            ctx.settings.allow_root_scripts,
            &correlation,
        )
        .await;
    }

    ctx.queue_remove(request.pid);

    tracing::info!(
        "session {} finished in {:.2} seconds (request={})",
        id,
        started.elapsed().as_secs_f64(),
        correlation
    );
}

fn mapping_stream(
    ctx: &Rc<Context>,
    request: &OptimizationRequest,
    profile: &Profile,
) -> Option<UnboundedReceiver<u32>> {
    if profile.launcher.skip_mapping {
        tracing::info!("skipping launcher mapping (request={})", request.correlation);
        return None;
    }

    if profile.steam {
        let cmdline = process::cmdline(request.pid)?;

        return discovery::steam_search(
            request.pid,
            cmdline,
            ctx.settings.launcher_mapping_timeout,
            ctx.settings.launcher_mapping_found_timeout,
            request.correlation.clone(),
        );
    }

    let comm = process::comm(request.pid)?;
    let rules = launchers::from_pairs(&profile.launcher.mapping);
    let rule = discovery::select_rule(&rules, request.user_id.unwrap_or(0), &request.user_name, &comm)?;

    Some(discovery::launcher_search(
        rule,
        request.pid,
        ctx.settings.launcher_mapping_timeout,
        ctx.settings.launcher_mapping_found_timeout,
        request.correlation.clone(),
    ))
}

/// The machine-wide phase, run once per session when its first target is
/// known: stop-after hooks, post-launch scripts, then the shared-state
/// acquires.
#[allow(clippy::too_many_arguments)]
async fn shared_phase(
    ctx: &Rc<Context>,
    id: SessionId,
    profile: &Profile,
    uid: Option<u32>,
    user_env: Option<&HashMap<String, String>>,
    held: &mut HeldTokens,
    tracked: &Rc<RefCell<HashSet<u32>>>,
    correlation: &str,
) {
    if !profile.stop_after.processes.is_empty() {
        stop_processes(ctx, id, profile, correlation);
    }

    if !profile.scripts_after.scripts.is_empty() {
        let pids = scripts::run_phase(
            "post launch",
            &profile.scripts_after,
            uid,
            user_env,
            ctx.settings.allow_root_scripts,
            correlation,
        )
        .await;

        tracked.borrow_mut().extend(pids);
    }

    if profile.compositor_off {
        ctx.compositor.acquire(id, uid, user_env).await;
        held.compositor = true;
    }

    if profile.hide_mouse {
        if ctx.mouse.available() {
            ctx.mouse.acquire(id, uid, user_env).await;
            held.mouse = true;
        } else {
            tracing::warn!("'unclutter' is not installed: the mouse cursor cannot be hidden");
        }
    }

    if profile.cpu_performance {
        if !ctx.cpufreq.available() {
            tracing::warn!("CPU frequency governors cannot be managed on this system");
        } else if !apply::is_root() {
            tracing::warn!("changing CPU scaling governors requires root privileges");
        } else {
            ctx.cpufreq.acquire(id).await;
            held.cpufreq = true;
        }
    }

    if profile.gpu_performance {
        ctx.gpu.acquire(id, user_env).await;
        held.gpu = true;
    }
}

fn stop_processes(ctx: &Rc<Context>, id: SessionId, profile: &Profile, correlation: &str) {
    let stop = &profile.stop_after;
    let found = process::pids_by_comm(&stop.processes);

    for name in &stop.processes {
        let Some(pid) = found.get(name) else {
            tracing::debug!("process '{}' to stop is not running (request={})", name, correlation);
            continue;
        };

        let cmd = process::cmdline(*pid);

        if unsafe { libc::kill(*pid as libc::pid_t, libc::SIGKILL) } == 0 {
            tracing::info!("process '{}' stopped (pid={}) (request={})", name, pid, correlation);
            ctx.register_stop(id, name, cmd, stop.relaunch);
        } else {
            tracing::error!("failed to stop process '{}' (pid={}) (request={})", name, pid, correlation);
        }
    }
}

fn spawn_apply(ctx: &Rc<Context>, pid: u32, profile: &Rc<Profile>, correlation: &str) {
    if profile.process.is_empty() {
        return;
    }

    let ctx = Rc::clone(ctx);
    let profile = Rc::clone(profile);
    let correlation = correlation.to_owned();

    tokio::task::spawn_local(async move {
        ctx.applier.apply(pid, &profile.process, &correlation).await;
    });
}

fn spawn_child_consumer(
    ctx: &Rc<Context>,
    mut children: UnboundedReceiver<u32>,
    profile: &Rc<Profile>,
    tracked: &Rc<RefCell<HashSet<u32>>>,
    correlation: &str,
) {
    let ctx = Rc::clone(ctx);
    let profile = Rc::clone(profile);
    let tracked = Rc::clone(tracked);
    let correlation = correlation.to_owned();

    tokio::task::spawn_local(async move {
        while let Some(pid) = children.recv().await {
            if tracked.borrow_mut().insert(pid) {
                spawn_apply(&ctx, pid, &profile, &correlation);
            }
        }
    });
}

/// Polls for the exit of every tracked pid at the configured interval.
async fn await_termination(
    ctx: &Rc<Context>,
    tracked: &Rc<RefCell<HashSet<u32>>>,
    cancel: &CancellationToken,
) {
    let interval = Duration::from_secs_f32(ctx.settings.check_finished_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("session teardown requested");
                break;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let alive = process::alive_pids();

        {
            let mut tracked = tracked.borrow_mut();
            tracked.retain(|pid| alive.contains(pid));

            if tracked.is_empty() {
                break;
            }
        }
    }
}
