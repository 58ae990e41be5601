// Copyright 2023 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! Window compositor detection and the reference-counted manager that
//! disables compositing while any session demands it.
//!
//! Detection runs once per daemon unless a compositor family was pre-set
//! in the settings. Families with a CLI toggle (KWin, Xfwm4, Marco) are
//! driven through their tools as the requesting user; process-managed
//! compositors (picom, compton, compiz) are killed and respawned; the
//! NVIDIA composition pipeline is toggled through `nvidia-settings` and
//! skipped entirely without an X display.

use std::collections::{BTreeSet, HashMap};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;

use crate::session::SessionId;
use crate::{exec, process};

static RE_INXI_COMPOSITOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"compositor\s*:\s*(\S+)").unwrap());
static RE_NVIDIA_PIPELINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(Force(?:Full)?CompositionPipeline)\s*=\s*(\w+)").unwrap());

/// A compositor family the optimizer knows how to toggle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compositor {
    /// KDE's compositor, toggled over D-Bus via `qdbus`.
    KWin,
    /// Xfce's compositor, toggled via `xfconf-query`.
    Xfwm4,
    /// MATE's compositor, toggled via `gsettings`.
    Marco,
    /// A standalone compositing process, killed and respawned.
    Process(String),
    /// The NVIDIA driver's composition pipeline.
    Nvidia,
}

impl Compositor {
    /// Maps a detected or configured name to a family.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();

        if name.contains("kwin") {
            Some(Compositor::KWin)
        } else if name.contains("xfwm4") {
            Some(Compositor::Xfwm4)
        } else if name.contains("marco") || name.contains("metacity") {
            Some(Compositor::Marco)
        } else if name.contains("compton") {
            Some(Compositor::Process("compton".into()))
        } else if name.contains("picom") {
            Some(Compositor::Process("picom".into()))
        } else if name.contains("compiz") {
            Some(Compositor::Process("compiz".into()))
        } else if name == "nvidia" {
            Some(Compositor::Nvidia)
        } else {
            tracing::warn!("compositor '{}' is not supported", name);
            None
        }
    }

    fn name(&self) -> &str {
        match self {
            Compositor::KWin => "KWin",
            Compositor::Xfwm4 => "Xfwm4",
            Compositor::Marco => "Marco",
            Compositor::Process(name) => name,
            Compositor::Nvidia => "Nvidia",
        }
    }

    fn toggle_commands(&self) -> Option<(&'static str, &'static str, &'static str)> {
        match self {
            Compositor::KWin => Some((
                "qdbus org.kde.KWin /Compositor resume",
                "qdbus org.kde.KWin /Compositor suspend",
                "qdbus org.kde.KWin /Compositor org.kde.kwin.Compositing.active",
            )),
            Compositor::Xfwm4 => Some((
                "xfconf-query --channel=xfwm4 --property=/general/use_compositing --set=true",
                "xfconf-query --channel=xfwm4 --property=/general/use_compositing --set=false",
                "xfconf-query --channel=xfwm4 --property=/general/use_compositing",
            )),
            Compositor::Marco => Some((
                "gsettings set org.mate.Marco.general compositing-manager true",
                "gsettings set org.mate.Marco.general compositing-manager false",
                "gsettings get org.mate.Marco.general compositing-manager",
            )),
            _ => None,
        }
    }
}

/// What must be undone on release.
enum DisabledState {
    Toggled,
    /// The command line of the killed compositing process.
    Killed(String),
    /// The NVIDIA pipeline attribute that was set to Off.
    Pipeline(String),
}

#[derive(Default)]
struct CompositorState {
    holders: BTreeSet<SessionId>,
    detected: bool,
    compositor: Option<Compositor>,
    disabled: Option<DisabledState>,
}

/// Reference-counted compositor custodian.
pub struct CompositorManager {
    preset: Option<Compositor>,
    state: Mutex<CompositorState>,
}

impl CompositorManager {
    pub fn new(preset_name: Option<&str>) -> Self {
        let preset = preset_name.and_then(Compositor::from_name);

        if let Some(compositor) = &preset {
            tracing::info!("pre-defined window compositor: {}", compositor.name());
        }

        Self {
            preset,
            state: Mutex::new(CompositorState::default()),
        }
    }

    /// Disables the detected compositor while any session holds the
    /// manager. Detection happens on the first acquire of the daemon's
    /// lifetime.
    pub async fn acquire(
        &self,
        session: SessionId,
        uid: Option<u32>,
        user_env: Option<&HashMap<String, String>>,
    ) {
        let mut state = self.state.lock().await;

        if state.holders.is_empty() && state.disabled.is_none() {
            if !state.detected {
                state.compositor = match &self.preset {
                    Some(compositor) => Some(compositor.clone()),
                    None => detect(user_env).await,
                };

                if let Some(compositor) = &state.compositor {
                    tracing::info!("window compositor detected: {}", compositor.name());
                }

                state.detected = true;
            }

            if let Some(compositor) = state.compositor.clone() {
                state.disabled = disable(&compositor, uid, user_env).await;
            }
        }

        state.holders.insert(session);
    }

    /// Re-enables the compositor once the last holder releases.
    pub async fn release(
        &self,
        session: SessionId,
        uid: Option<u32>,
        user_env: Option<&HashMap<String, String>>,
    ) {
        let mut state = self.state.lock().await;

        if !state.holders.remove(&session) || !state.holders.is_empty() {
            return;
        }

        let Some(disabled) = state.disabled.take() else {
            return;
        };

        let Some(compositor) = state.compositor.clone() else {
            return;
        };

        // Re-enabling happens under the lock so that a concurrent first
        // acquire cannot observe a half-restored state.
        if enable(&compositor, &disabled, uid, user_env).await {
            tracing::info!("window compositor re-enabled");
        } else {
            tracing::error!("could not re-enable the window compositor");
        }
    }
}

/// Detects the running compositor: `inxi` first, the desktop environment
/// variables as a fallback.
async fn detect(user_env: Option<&HashMap<String, String>>) -> Option<Compositor> {
    if exec::which("inxi") {
        let (code, output) = exec::run("inxi -Gxx -c 0", user_env, None).await;

        if code == 0 {
            if let Some(capture) = RE_INXI_COMPOSITOR.captures(&output) {
                if let Some(compositor) = Compositor::from_name(&capture[1]) {
                    return Some(compositor);
                }
            }
        }
    }

    let desktop = user_env
        .and_then(|env| {
            env.get("XDG_CURRENT_DESKTOP")
                .or_else(|| env.get("DESKTOP_SESSION"))
                .cloned()
        })
        .or_else(|| std::env::var("XDG_CURRENT_DESKTOP").ok())?;

    guess_for_desktop(&desktop)
}

fn guess_for_desktop(desktop: &str) -> Option<Compositor> {
    let desktop = desktop.to_ascii_lowercase();

    if desktop.contains("kde") || desktop.contains("plasma") {
        Some(Compositor::KWin)
    } else if desktop.contains("xfce") {
        Some(Compositor::Xfwm4)
    } else if desktop.contains("mate") {
        Some(Compositor::Marco)
    } else {
        None
    }
}

async fn disable(
    compositor: &Compositor,
    uid: Option<u32>,
    user_env: Option<&HashMap<String, String>>,
) -> Option<DisabledState> {
    match compositor {
        Compositor::KWin | Compositor::Xfwm4 | Compositor::Marco => {
            let (_, disable_cmd, query_cmd) = compositor.toggle_commands()?;

            match query_enabled(query_cmd, uid, user_env).await {
                Some(false) => {
                    tracing::info!("window compositor is already disabled");
                    return None;
                }
                None => {
                    tracing::error!("it will not be possible to disable the window compositor");
                    return None;
                }
                Some(true) => {}
            }

            let (code, output) = exec::run(disable_cmd, user_env, uid).await;
            if code == 0 {
                tracing::info!("window compositor disabled");
                Some(DisabledState::Toggled)
            } else {
                tracing::error!(
                    "could not disable {}: {}",
                    compositor.name(),
                    output.replace('\n', " ")
                );
                None
            }
        }

        Compositor::Process(name) => {
            let pids = process::pids_with_comm(name);

            let Some(pid) = pids.first() else {
                tracing::info!("window compositor '{}' is not running", name);
                return None;
            };

            let respawn = process::cmdline(*pid).unwrap_or_else(|| name.clone());

            if unsafe { libc::kill(*pid as libc::pid_t, libc::SIGKILL) } == 0 {
                tracing::info!("window compositor '{}' stopped (pid={})", name, pid);
                Some(DisabledState::Killed(respawn))
            } else {
                tracing::error!("could not stop the window compositor '{}' (pid={})", name, pid);
                None
            }
        }

        Compositor::Nvidia => {
            // X11 probing only: without a display the state is undefined.
            let has_display = user_env
                .and_then(|env| env.get("DISPLAY"))
                .map_or(false, |display| !display.trim().is_empty());

            if !has_display {
                tracing::warn!("no DISPLAY available: the NVIDIA composition pipeline will not be touched");
                return None;
            }

            let (code, output) = exec::run("nvidia-settings -q /CurrentMetaMode", user_env, None).await;
            if code != 0 {
                tracing::error!("could not query the NVIDIA composition pipeline");
                return None;
            }

            let Some(attribute) = nvidia_pipeline_attribute(&output) else {
                tracing::info!("the NVIDIA composition pipeline is not active");
                return None;
            };

            if assign_nvidia_pipeline(&attribute, false, user_env).await {
                tracing::info!("NVIDIA composition pipeline disabled");
                Some(DisabledState::Pipeline(attribute))
            } else {
                None
            }
        }
    }
}

async fn enable(
    compositor: &Compositor,
    disabled: &DisabledState,
    uid: Option<u32>,
    user_env: Option<&HashMap<String, String>>,
) -> bool {
    match (compositor, disabled) {
        (Compositor::KWin | Compositor::Xfwm4 | Compositor::Marco, DisabledState::Toggled) => {
            let Some((enable_cmd, _, query_cmd)) = compositor.toggle_commands() else {
                return false;
            };

            if query_enabled(query_cmd, uid, user_env).await == Some(true) {
                tracing::info!("the window compositor is already enabled");
                return true;
            }

            let (code, output) = exec::run(enable_cmd, user_env, uid).await;
            if code != 0 {
                tracing::error!(
                    "could not enable {}: {}",
                    compositor.name(),
                    output.replace('\n', " ")
                );
            }

            code == 0
        }

        (Compositor::Process(name), DisabledState::Killed(cmdline)) => {
            if !process::pids_with_comm(name).is_empty() {
                tracing::info!("window compositor '{}' is already running", name);
                return true;
            }

            match exec::spawn_detached(cmdline, user_env, uid) {
                Ok(pid) => {
                    tracing::info!("window compositor '{}' respawned (pid={})", name, pid);
                    true
                }
                Err(why) => {
                    tracing::error!("could not respawn '{}': {}", cmdline, why);
                    false
                }
            }
        }

        (Compositor::Nvidia, DisabledState::Pipeline(attribute)) => {
            assign_nvidia_pipeline(attribute, true, user_env).await
        }

        _ => false,
    }
}

async fn query_enabled(
    query_cmd: &str,
    uid: Option<u32>,
    user_env: Option<&HashMap<String, String>>,
) -> Option<bool> {
    let (code, output) = exec::run(query_cmd, user_env, uid).await;

    if code != 0 {
        tracing::error!(
            "compositor state query failed (exit={}): {}",
            code,
            output.replace('\n', " ")
        );
        return None;
    }

    match output.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        other => {
            tracing::warn!("unknown compositor state: {}", other);
            None
        }
    }
}

fn nvidia_pipeline_attribute(meta_mode: &str) -> Option<String> {
    RE_NVIDIA_PIPELINE
        .captures_iter(meta_mode)
        .find(|capture| capture[2].eq_ignore_ascii_case("on"))
        .map(|capture| capture[1].to_owned())
}

async fn assign_nvidia_pipeline(
    attribute: &str,
    enable: bool,
    user_env: Option<&HashMap<String, String>>,
) -> bool {
    let value = if enable { "On" } else { "Off" };
    let cmd = [
        "nvidia-settings --assign CurrentMetaMode=\"nvidia-auto-select +0+0 {",
        attribute,
        "=",
        value,
        "}\"",
    ]
    .concat();

    let (code, output) = exec::run(&cmd, user_env, None).await;

    if code == 0 && !output.to_ascii_lowercase().contains("error assigning value") {
        true
    } else {
        tracing::error!(
            "could not toggle the NVIDIA composition pipeline: {}",
            output.replace('\n', " ")
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_mapping() {
        assert_eq!(Compositor::from_name("KWin"), Some(Compositor::KWin));
        assert_eq!(Compositor::from_name(" xfwm4 "), Some(Compositor::Xfwm4));
        assert_eq!(Compositor::from_name("Metacity (Marco)"), Some(Compositor::Marco));
        assert_eq!(
            Compositor::from_name("picom-git"),
            Some(Compositor::Process("picom".into()))
        );
        assert_eq!(Compositor::from_name("nvidia"), Some(Compositor::Nvidia));
        assert_eq!(Compositor::from_name("mutter"), None);
    }

    #[test]
    fn desktop_guessing() {
        assert_eq!(guess_for_desktop("KDE"), Some(Compositor::KWin));
        assert_eq!(guess_for_desktop("ubuntu:XFCE"), Some(Compositor::Xfwm4));
        assert_eq!(guess_for_desktop("MATE"), Some(Compositor::Marco));
        assert_eq!(guess_for_desktop("GNOME"), None);
    }

    #[test]
    fn inxi_output_parsing() {
        let output = "Graphics:\n  Device-1: NVIDIA GA104 driver: nvidia\n  \
                      Display: x11 server: X.Org compositor: kwin_x11 v: 5.27\n";
        let capture = RE_INXI_COMPOSITOR.captures(output).unwrap();
        assert_eq!(&capture[1], "kwin_x11");
        assert_eq!(Compositor::from_name(&capture[1]), Some(Compositor::KWin));
    }

    #[test]
    fn pipeline_attribute_extraction() {
        let meta = "CurrentMetaMode=\"id=50, switchable=yes, source=nv-control :: \
                    DPY-2: nvidia-auto-select @1920x1080 {ForceCompositionPipeline=On}\"";
        assert_eq!(
            nvidia_pipeline_attribute(meta).as_deref(),
            Some("ForceCompositionPipeline")
        );

        let full = "{ForceFullCompositionPipeline = on}";
        assert_eq!(
            nvidia_pipeline_attribute(full).as_deref(),
            Some("ForceFullCompositionPipeline")
        );

        assert_eq!(nvidia_pipeline_attribute("{AllowGSYNC=Off}"), None);
    }

    #[tokio::test]
    async fn second_session_keeps_compositor_disabled() {
        // No compositor detectable in the test environment: the manager
        // still tracks holders and only attempts re-enable work once.
        let manager = CompositorManager::new(None);

        manager.acquire(1, None, None).await;
        manager.acquire(2, None, None).await;
        manager.release(1, None, None).await;

        assert_eq!(manager.state.lock().await.holders.len(), 1);

        manager.release(2, None, None).await;
        assert!(manager.state.lock().await.holders.is_empty());
    }
}
