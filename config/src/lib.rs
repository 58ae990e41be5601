// Copyright 2023 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

#![deny(missing_docs)]

//! Configuration parsing for the guapow optimizer: daemon settings,
//! optimization profiles, and launcher mapping rules.

/// Launcher mapping rules
pub mod launchers;

/// Optimization profiles
pub mod profile;

/// Daemon settings
pub mod settings;

use std::{
    fs::File,
    io::{self, Read},
    path::PathBuf,
};

/// Name used for configuration directories and key files.
pub const APP_NAME: &str = "guapow";

/// System-wide configuration directory.
pub const SYSTEM_CONF_PATH: &str = "/etc/guapow/";

/// Per-user configuration directory for `user_name`.
#[must_use]
pub fn user_conf_path(user_name: &str) -> PathBuf {
    PathBuf::from(["/home/", user_name, "/.config/", APP_NAME, "/"].concat())
}

/// Candidate paths for a configuration file, user files first, root as
/// fallback. Root callers only see the system path.
#[must_use]
pub fn paths_by_priority(file_name: &str, user_id: u32, user_name: &str) -> Vec<PathBuf> {
    let mut paths = Vec::with_capacity(2);

    if user_id != 0 {
        let mut user = user_conf_path(user_name);
        user.push(file_name);
        paths.push(user);
    }

    let mut system = PathBuf::from(SYSTEM_CONF_PATH);
    system.push(file_name);
    paths.push(system);

    paths
}

pub(crate) fn read_into_string<'a>(
    buf: &'a mut String,
    path: &std::path::Path,
) -> io::Result<&'a str> {
    let mut file = File::open(path)?;
    buf.clear();
    file.read_to_string(buf)?;
    Ok(&*buf)
}

/// Splits a config line into a key and an optional value, dropping `#`
/// comments. Returns `None` for blank and comment-only lines.
pub(crate) fn split_entry(line: &str) -> Option<(&str, Option<&str>)> {
    let line = match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    };

    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    match line.split_once('=') {
        Some((key, value)) => {
            let key = key.trim();
            if key.is_empty() {
                return None;
            }

            let value = value.trim();
            Some((key, (!value.is_empty()).then_some(value)))
        }
        None => Some((line, None)),
    }
}

/// Boolean values as profile and config files spell them: a bare key is
/// `true`; `true`/`1` and `false`/`0` are accepted spellings.
pub(crate) fn parse_bool(value: Option<&str>) -> Option<bool> {
    match value {
        None => Some(true),
        Some("true" | "1") => Some(true),
        Some("false" | "0") => Some(false),
        Some(_) => None,
    }
}
