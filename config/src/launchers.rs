// Copyright 2023 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! Launcher mapping rules: redirect an optimization from a launcher
//! process to the descendant it spawns, matched by name or command.
//!
//! Rules come from per-request `launcher=` options or the global
//! `launchers` file (`exe=target`, one per line). A target may force its
//! match mode with a `n%`/`c%` prefix; otherwise a leading `/` means a
//! command match and anything else a name match. `*` globs are accepted
//! on both sides.

use wildmatch::WildMatch;

const MODE_DELIMITER: char = '%';

/// How a launcher target is matched against candidate processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Match the process comm.
    Name,
    /// Match the full command line.
    Command,
}

impl SearchMode {
    fn infer(target: &str) -> Self {
        if target.starts_with('/') {
            SearchMode::Command
        } else {
            SearchMode::Name
        }
    }
}

/// A parsed launcher rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherRule {
    /// The launcher executable name this rule applies to. May be a glob.
    pub exe: String,
    /// The pattern identifying the process to optimize instead.
    pub target: String,
    /// Whether `target` matches names or command lines.
    pub mode: SearchMode,
}

impl LauncherRule {
    /// Whether this rule applies to the given launcher comm.
    #[must_use]
    pub fn matches_exe(&self, comm: &str) -> bool {
        matches(&self.exe, comm)
    }

    /// Whether a candidate name or command satisfies the target pattern.
    #[must_use]
    pub fn matches_target(&self, candidate: &str) -> bool {
        matches(&self.target, candidate)
    }
}

/// Glob-aware string matching used for rule lookup.
#[must_use]
pub fn matches(pattern: &str, candidate: &str) -> bool {
    if pattern.contains('*') {
        WildMatch::new(pattern).matches(candidate)
    } else {
        pattern == candidate
    }
}

/// Parses a target string, honoring an explicit `n%`/`c%` mode prefix.
/// Unknown prefixes fall back to the inferred mode with a warning.
#[must_use]
pub fn parse_target(target: &str) -> (String, SearchMode) {
    match target.split_once(MODE_DELIMITER) {
        Some((prefix, rest)) => {
            let rest = rest.trim();

            let mode = match prefix.trim().to_ascii_lowercase().as_str() {
                "n" => SearchMode::Name,
                "c" => SearchMode::Command,
                other => {
                    let inferred = SearchMode::infer(rest);
                    tracing::warn!(
                        "invalid launcher target mode '{}': assuming {:?}",
                        other,
                        inferred
                    );
                    inferred
                }
            };

            (rest.to_string(), mode)
        }
        None => (target.to_string(), SearchMode::infer(target)),
    }
}

/// Builds rules from per-request `exe:target` pairs.
#[must_use]
pub fn from_pairs(pairs: &[(String, String)]) -> Vec<LauncherRule> {
    pairs
        .iter()
        .filter(|(exe, target)| !exe.is_empty() && !target.is_empty())
        .map(|(exe, target)| {
            let (target, mode) = parse_target(target);
            LauncherRule {
                exe: exe.clone(),
                target,
                mode,
            }
        })
        .collect()
}

/// Parses a global `launchers` file: `exe=target` lines, `#` comments.
#[must_use]
pub fn parse_file(text: &str) -> Vec<LauncherRule> {
    let mut rules = Vec::new();

    for line in text.lines() {
        let Some((exe, Some(target))) = crate::split_entry(line) else {
            continue;
        };

        let (target, mode) = parse_target(target);
        rules.push(LauncherRule {
            exe: exe.to_string(),
            target,
            mode,
        });
    }

    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_inference() {
        assert_eq!(parse_target("game.x86_64"), ("game.x86_64".into(), SearchMode::Name));
        assert_eq!(
            parse_target("/opt/game/bin/game"),
            ("/opt/game/bin/game".into(), SearchMode::Command)
        );
    }

    #[test]
    fn explicit_mode_prefixes() {
        assert_eq!(parse_target("n%/weird/name"), ("/weird/name".into(), SearchMode::Name));
        assert_eq!(parse_target("c%game"), ("game".into(), SearchMode::Command));
        // Unknown prefix falls back to inference on the remainder.
        assert_eq!(parse_target("x%/bin/game"), ("/bin/game".into(), SearchMode::Command));
    }

    #[test]
    fn file_parsing() {
        let rules = parse_file(
            "# games\n\
             heroic=n%game-*\n\
             lutris=/usr/bin/wine*\n\
             \n\
             broken-line\n",
        );

        assert_eq!(
            rules,
            vec![
                LauncherRule {
                    exe: "heroic".into(),
                    target: "game-*".into(),
                    mode: SearchMode::Name,
                },
                LauncherRule {
                    exe: "lutris".into(),
                    target: "/usr/bin/wine*".into(),
                    mode: SearchMode::Command,
                },
            ]
        );
    }

    #[test]
    fn glob_matching() {
        let rule = LauncherRule {
            exe: "steam*".into(),
            target: "game-*".into(),
            mode: SearchMode::Name,
        };

        assert!(rule.matches_exe("steam-runtime"));
        assert!(!rule.matches_exe("lutris"));
        assert!(rule.matches_target("game-bin"));
        assert!(!rule.matches_target("launcher"));
    }

    #[test]
    fn exact_matching_without_glob() {
        assert!(matches("picom", "picom"));
        assert!(!matches("picom", "picom-git"));
    }
}
