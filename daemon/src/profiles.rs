// Copyright 2023 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! Profile resolution for incoming requests: inline options win, then the
//! named profile, then `default.profile`, user paths before system paths.
//! The cache, when enabled, is read-mostly and never evicted while the
//! daemon runs.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use guapow_config::profile::{Profile, DEFAULT_PROFILE, PROFILE_EXTENSION};

use crate::request::OptimizationRequest;

/// Resolves requests to profiles, optionally through a cache keyed by
/// `path#overlay`.
pub struct ProfileResolver {
    cache: Option<RefCell<HashMap<String, Rc<Profile>>>>,
}

impl ProfileResolver {
    pub fn new(cache_enabled: bool) -> Self {
        Self {
            cache: cache_enabled.then(|| RefCell::new(HashMap::new())),
        }
    }

    /// Resolves the request's options. `None` means no optimization is
    /// available, which the session treats as a no-op success.
    pub async fn resolve(&self, request: &OptimizationRequest) -> Option<Rc<Profile>> {
        if let Some(inline) = &request.inline_options {
            let mut profile = Profile::parse(inline);

            if let Some(overlay) = &request.profile_add {
                profile.apply_tokens(overlay);
            }

            if profile.is_valid() {
                return Some(Rc::new(profile));
            }

            tracing::warn!(
                "no optimization defined in the inline options (request={})",
                request.correlation
            );
            return None;
        }

        let user_id = request.user_id.unwrap_or(0);

        if let Some(name) = &request.profile {
            if let Some(profile) = self.read_named(name, request, user_id).await {
                return Some(profile);
            }
        }

        let fallback = self.read_named(DEFAULT_PROFILE, request, user_id).await;

        if fallback.is_some() {
            match &request.profile {
                Some(name) => tracing::warn!(
                    "no existing valid profile '{}': the default profile will be used (request={})",
                    name,
                    request.correlation
                ),
                None => tracing::warn!(
                    "request has no profile defined: the default profile will be used (request={})",
                    request.correlation
                ),
            }
        }

        fallback
    }

    async fn read_named(
        &self,
        name: &str,
        request: &OptimizationRequest,
        user_id: u32,
    ) -> Option<Rc<Profile>> {
        let file_name = [name, PROFILE_EXTENSION].concat();

        for path in guapow_config::paths_by_priority(&file_name, user_id, &request.user_name) {
            if let Some(profile) = self
                .read_valid(&path, request.profile_add.as_deref(), name)
                .await
            {
                tracing::info!(
                    "valid profile '{}' ({}) found (request={})",
                    name,
                    path.display(),
                    request.correlation
                );
                return Some(profile);
            }
        }

        None
    }

    async fn read_valid(
        &self,
        path: &Path,
        overlay: Option<&str>,
        name: &str,
    ) -> Option<Rc<Profile>> {
        let key = match overlay {
            Some(overlay) => [path.to_string_lossy().as_ref(), "#", overlay].concat(),
            None => path.to_string_lossy().into_owned(),
        };

        if let Some(cache) = &self.cache {
            if let Some(profile) = cache.borrow().get(&key) {
                tracing::debug!("cached profile found for {}", key);
                return Some(Rc::clone(profile));
            }
        }

        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(why) if why.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("profile file {} not found", path.display());
                return None;
            }
            Err(why) => {
                tracing::error!("failed to read profile {}: {}", path.display(), why);
                return None;
            }
        };

        let mut profile = Profile::parse(&text);
        profile.name = Some(name.to_owned());

        if let Some(overlay) = overlay {
            profile.apply_tokens(overlay);
        }

        if !profile.is_valid() {
            tracing::warn!("invalid profile file {}", path.display());
            return None;
        }

        let profile = Rc::new(profile);

        if let Some(cache) = &self.cache {
            tracing::debug!("caching profile {}", key);
            cache.borrow_mut().insert(key, Rc::clone(&profile));
        }

        Some(profile)
    }

    /// Reads and caches every profile on disk ahead of the first request.
    pub async fn pre_cache(&self) {
        if self.cache.is_none() {
            return;
        }

        let mut cached = 0_usize;

        for path in profiles_on_disk() {
            let name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();

            if self.read_valid(&path, None, &name).await.is_some() {
                cached += 1;
            }
        }

        tracing::info!("{} valid profile(s) cached", cached);
    }
}

fn profiles_in(dir: &Path, found: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        if path
            .extension()
            .map_or(false, |extension| extension == "profile")
        {
            found.push(path);
        }
    }
}

fn profiles_on_disk() -> Vec<PathBuf> {
    let mut found = Vec::new();

    profiles_in(Path::new(guapow_config::SYSTEM_CONF_PATH), &mut found);

    if let Ok(homes) = std::fs::read_dir("/home") {
        for home in homes.filter_map(Result::ok) {
            profiles_in(&home.path().join(".config/guapow"), &mut found);
        }
    }

    found
}
