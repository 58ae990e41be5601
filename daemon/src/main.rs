// Copyright 2023 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! guapow optimizer service

mod apply;
mod compositor;
mod cpu;
mod crypto;
mod discovery;
mod exec;
mod gpu;
mod mouse;
mod process;
mod profiles;
mod renice;
mod request;
mod scripts;
mod server;
mod session;
mod users;

use std::rc::Rc;

use anyhow::Context as _;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::crypto::RequestKey;
use crate::session::{Context, SessionId};

/// Session id reserved for the daemon's own startup optimization, which
/// is held for the daemon's whole lifetime.
const SELF_SESSION: SessionId = 0;

const LOG_ENV_VAR: &str = "GUAPOW_OPT_LOG";
const LOG_LEVEL_ENV_VAR: &str = "GUAPOW_OPT_LOG_LEVEL";
const SERVICE_ENV_VAR: &str = "GUAPOW_OPT_SERVICE";

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build the async runtime")?;

    let local = tokio::task::LocalSet::new();

    runtime.block_on(local.run_until(async {
        init_logging();

        let matches = clap::command!()
            .propagate_version(true)
            .subcommand_required(true)
            .arg_required_else_help(true)
            .subcommand(clap::Command::new("daemon").about("launch the optimizer service"))
            .get_matches();

        match matches.subcommand() {
            Some(("daemon", _matches)) => daemon().await,
            _ => Ok(()),
        }
    }))
}

fn init_logging() {
    let enabled = std::env::var(LOG_ENV_VAR).map_or(true, |var| var.trim() != "0");

    let filter = if enabled {
        std::env::var(LOG_LEVEL_ENV_VAR).unwrap_or_else(|_| String::from("info"))
    } else {
        String::from("off")
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .init();
}

fn is_service() -> bool {
    std::env::var(SERVICE_ENV_VAR).map_or(false, |var| var.trim() == "1")
}

async fn daemon() -> anyhow::Result<()> {
    let uid = unsafe { libc::geteuid() };
    let user_name = ::users::get_current_username()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from("root"));

    tracing::debug!("initializing as user '{}' (pid={})", user_name, std::process::id());

    let settings = guapow_config::settings::OptConfig::read(uid, &user_name);

    tracing::info!("nice levels monitoring interval: {} seconds", settings.renice_interval);
    tracing::info!(
        "finished process checking interval: {} seconds",
        settings.check_finished_interval
    );
    tracing::info!(
        "launcher mapping timeout: {} seconds (found: {})",
        settings.launcher_mapping_timeout,
        settings.launcher_mapping_found_timeout
    );
    tracing::info!(
        "children optimization timeout: {} seconds (found: {})",
        settings.children_timeout,
        settings.children_found_timeout
    );

    if settings.children_timeout <= 0.0 {
        tracing::warn!("target process children will not be optimized");
    }

    if settings.allow_root_scripts {
        tracing::warn!("scripts are allowed to run at the root level");
    }

    if settings.profile_cache {
        tracing::warn!("profile caching is enabled: file changes require a restart");
    }

    let port = settings.port;
    let encrypted = settings.encrypted_requests;
    let cpu_performance = settings.cpu_performance;
    let gpu_cache = settings.gpu_cache;
    let pre_cache = settings.profile_cache && settings.pre_cache_profiles;

    let ctx = Context::new(settings);

    // The daemon's own optimization: switched once, held until exit.
    if cpu_performance {
        if ctx.cpufreq.available() && apply::is_root() {
            ctx.cpufreq.acquire(SELF_SESSION).await;
            tracing::info!("CPUs set to performance for the daemon's lifetime");
        } else {
            tracing::warn!("cpu.performance at startup requires root and governor support");
        }
    }

    if gpu_cache {
        if is_service() {
            tracing::info!("GPU mapping will be cached on the first request");
        } else {
            ctx.gpu.prime_cache().await;
        }
    } else {
        tracing::warn!("GPU cache is disabled: available GPUs will be mapped for every request");
    }

    if pre_cache {
        ctx.profiles.pre_cache().await;
    }

    let (key, key_path) = if encrypted {
        let key = RequestKey::generate();
        let path = RequestKey::default_path(uid);
        key.publish(&path).context("failed to publish the request key")?;
        (Some(key), Some(path))
    } else {
        tracing::warn!("encrypted requests are disabled: accepting cleartext bodies");
        (None, None)
    };

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("failed to bind port {port}"))?;

    tracing::info!("ready and attached to port {}", port);

    let cancel = CancellationToken::new();

    tokio::task::spawn_local({
        let cancel = cancel.clone();
        async move {
            use tokio::signal::unix::{signal, SignalKind};

            let Ok(mut terminate) = signal(SignalKind::terminate()) else {
                return;
            };
            let Ok(mut interrupt) = signal(SignalKind::interrupt()) else {
                return;
            };

            tokio::select! {
                _ = terminate.recv() => {}
                _ = interrupt.recv() => {}
            }

            cancel.cancel();
        }
    });

    let server = server::Server::new(Rc::clone(&ctx), key, cancel);
    server.run(listener).await;

    if let Some(path) = key_path {
        let _res = std::fs::remove_file(path);
    }

    tracing::info!("optimizer stopped");
    Ok(())
}
