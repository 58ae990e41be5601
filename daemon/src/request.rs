// Copyright 2023 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! The optimization request as it arrives on the wire: a newline- or
//! space-separated list of `key=value` and bare-key tokens. `request.*`
//! keys carry the metadata; every other token is an inline profile
//! option, which wins over a named profile.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// Why a request body was rejected at the edge.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("the request body is empty")]
    Empty,
    #[error("request.pid is missing or invalid")]
    MissingPid,
    #[error("request.user is missing")]
    MissingUser,
    #[error("the request carries neither a profile nor inline options")]
    NoOptions,
}

/// A validated optimization request.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationRequest {
    /// The already-running target process.
    pub pid: u32,
    /// The requesting user's name.
    pub user_name: String,
    /// The requesting user's id, resolved by the server.
    pub user_id: Option<u32>,
    /// Client-generated correlation id used in every related log line.
    pub correlation: String,
    /// Profile name to resolve when no inline options are present.
    pub profile: Option<String>,
    /// Overlay options applied on top of the resolved profile.
    pub profile_add: Option<String>,
    /// Inline options; these win over the named profile.
    pub inline_options: Option<String>,
    /// Client-side request timestamp (Unix seconds).
    pub created_at: Option<f64>,
    /// Processes the Runner stopped before launch, as `comm` or
    /// `comm:command` entries.
    pub stopped_processes: Vec<(String, Option<String>)>,
    /// Whether the Runner-stopped processes should be relaunched.
    pub relaunch_stopped: bool,
    /// Environment of the requesting user's session, as `K:V` tokens.
    pub user_env: HashMap<String, String>,
}

impl fmt::Display for OptimizationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid: {}, user: {}", self.pid, self.user_name)?;

        if let Some(profile) = &self.profile {
            write!(f, ", profile: {profile}")?;
        }

        if self.inline_options.is_some() {
            write!(f, ", inline options")?;
        }

        Ok(())
    }
}

impl OptimizationRequest {
    /// Parses and validates a decrypted request body.
    pub fn parse(body: &str) -> Result<Self, RequestError> {
        let body = body.trim();

        if body.is_empty() {
            return Err(RequestError::Empty);
        }

        let mut pid = None;
        let mut user_name = None;
        let mut correlation = None;
        let mut profile = None;
        let mut profile_add = None;
        let mut created_at = None;
        let mut stopped_processes = Vec::new();
        let mut relaunch_stopped = false;
        let mut user_env = HashMap::new();
        let mut inline = Vec::new();

        for token in body.split_whitespace() {
            let (key, value) = match token.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (token, None),
            };

            match key {
                "request.pid" => pid = value.and_then(|v| v.parse::<u32>().ok()),
                "request.user" => user_name = value.map(String::from),
                "request.id" => correlation = value.map(String::from),
                "request.profile" => profile = value.map(String::from),
                "request.profile_add" => profile_add = value.map(String::from),
                "request.created_at" => created_at = value.and_then(|v| v.parse::<f64>().ok()),
                "request.relaunch" => {
                    relaunch_stopped = matches!(value, None | Some("true" | "1"));
                }
                "request.stopped" => {
                    if let Some(value) = value {
                        for entry in value.split(',').filter(|entry| !entry.is_empty()) {
                            match entry.split_once(':') {
                                Some((comm, cmd)) if !cmd.is_empty() => stopped_processes
                                    .push((comm.to_string(), Some(cmd.to_string()))),
                                _ => stopped_processes.push((entry.to_string(), None)),
                            }
                        }
                    }
                }
                "request.env" => {
                    if let Some(value) = value {
                        if let Some((name, val)) = value.split_once(':') {
                            user_env.insert(name.to_string(), val.to_string());
                        }
                    }
                }
                _ if key.starts_with("request.") => {
                    tracing::warn!("unknown request field: {}", key);
                }
                _ => inline.push(token),
            }
        }

        let pid = pid.ok_or(RequestError::MissingPid)?;
        let user_name = user_name.ok_or(RequestError::MissingUser)?;

        let inline_options = (!inline.is_empty()).then(|| inline.join("\n"));

        if profile.is_none() && inline_options.is_none() {
            return Err(RequestError::NoOptions);
        }

        let mut itoa = itoa::Buffer::new();
        let correlation = correlation.unwrap_or_else(|| itoa.format(pid).to_owned());

        Ok(Self {
            pid,
            user_name,
            user_id: None,
            correlation,
            profile,
            profile_add,
            inline_options,
            created_at,
            stopped_processes,
            relaunch_stopped,
            user_env,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_profile_request() {
        let request = OptimizationRequest::parse(
            "request.pid=4321\nrequest.user=alice\nrequest.id=req-7\nrequest.profile=games\n\
             request.created_at=1700000000.5\nrequest.env=DISPLAY::1\n",
        )
        .unwrap();

        assert_eq!(request.pid, 4321);
        assert_eq!(request.user_name, "alice");
        assert_eq!(request.correlation, "req-7");
        assert_eq!(request.profile.as_deref(), Some("games"));
        assert_eq!(request.created_at, Some(1_700_000_000.5));
        assert_eq!(request.user_env.get("DISPLAY").map(String::as_str), Some(":1"));
        assert!(request.inline_options.is_none());
    }

    #[test]
    fn inline_options_request() {
        let request = OptimizationRequest::parse(
            "request.pid=10 request.user=bob proc.nice=-4 gpu.performance",
        )
        .unwrap();

        assert_eq!(request.inline_options.as_deref(), Some("proc.nice=-4\ngpu.performance"));
        // The pid doubles as the correlation id when none was sent.
        assert_eq!(request.correlation, "10");
    }

    #[test]
    fn stopped_process_bookkeeping() {
        let request = OptimizationRequest::parse(
            "request.pid=10 request.user=bob request.profile=p \
             request.stopped=dropbox:/usr/bin/dropbox,tracker request.relaunch",
        )
        .unwrap();

        assert_eq!(
            request.stopped_processes,
            vec![
                ("dropbox".to_string(), Some("/usr/bin/dropbox".to_string())),
                ("tracker".to_string(), None),
            ]
        );
        assert!(request.relaunch_stopped);
    }

    #[test]
    fn rejects_incomplete_bodies() {
        assert_eq!(OptimizationRequest::parse(""), Err(RequestError::Empty));
        assert_eq!(
            OptimizationRequest::parse("request.user=a request.profile=p"),
            Err(RequestError::MissingPid)
        );
        assert_eq!(
            OptimizationRequest::parse("request.pid=abc request.user=a request.profile=p"),
            Err(RequestError::MissingPid)
        );
        assert_eq!(
            OptimizationRequest::parse("request.pid=1 request.profile=p"),
            Err(RequestError::MissingUser)
        );
        assert_eq!(
            OptimizationRequest::parse("request.pid=1 request.user=a"),
            Err(RequestError::NoOptions)
        );
    }
}
