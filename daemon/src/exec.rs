// Copyright 2023 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! Subprocess plumbing shared by the system adapters: shell commands with
//! captured output, optionally demoted to the requesting user.

use std::collections::HashMap;
use std::process::Stdio;

use tokio::process::Command;

/// Builds the environment for a spawned command: the caller-provided user
/// environment when present, otherwise the daemon's own, with `DISPLAY`
/// defaulted so X11 tooling works from a service context.
#[must_use]
pub fn build_env(user_env: Option<&HashMap<String, String>>) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = match user_env {
        Some(vars) => vars.clone(),
        None => std::env::vars().collect(),
    };

    if env.get("DISPLAY").map_or(true, |display| display.trim().is_empty()) {
        env.insert("DISPLAY".into(), ":0".into());
    }

    env
}

fn command(cmd: &str, env: &HashMap<String, String>, uid: Option<u32>) -> Command {
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(cmd)
        .env_clear()
        .envs(env)
        .stdin(Stdio::null());

    if let Some(uid) = uid {
        command.uid(uid);
    }

    command
}

/// Runs a shell command to completion, returning its exit code and the
/// combined stdout/stderr text. A spawn failure is reported as exit code
/// -1 with the error message as output.
pub async fn run(
    cmd: &str,
    user_env: Option<&HashMap<String, String>>,
    uid: Option<u32>,
) -> (i32, String) {
    let env = build_env(user_env);

    let output = match command(cmd, &env, uid).output().await {
        Ok(output) => output,
        Err(why) => return (-1, why.to_string()),
    };

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    (output.status.code().unwrap_or(-1), text)
}

/// Spawns a detached shell command, returning its pid. Output is
/// discarded; the child is never awaited.
pub fn spawn_detached(
    cmd: &str,
    user_env: Option<&HashMap<String, String>>,
    uid: Option<u32>,
) -> std::io::Result<u32> {
    let env = build_env(user_env);

    let child = command(cmd, &env, uid)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    Ok(child.id().unwrap_or(0))
}

/// Whether a command is present on the daemon's `PATH`.
#[must_use]
pub fn which(binary: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };

    std::env::split_paths(&path).any(|dir| dir.join(binary).is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_exit_code_and_output() {
        let (code, output) = run("echo one && echo two >&2 && exit 3", None, None).await;
        assert_eq!(code, 3);
        assert!(output.contains("one"));
        assert!(output.contains("two"));
    }

    #[test]
    fn display_defaulted() {
        let env = build_env(Some(&HashMap::new()));
        assert_eq!(env.get("DISPLAY").map(String::as_str), Some(":0"));

        let mut vars = HashMap::new();
        vars.insert("DISPLAY".to_string(), ":1".to_string());
        assert_eq!(build_env(Some(&vars)).get("DISPLAY").map(String::as_str), Some(":1"));
    }

    #[test]
    fn which_finds_sh() {
        assert!(which("sh"));
        assert!(!which("definitely-not-a-binary-here"));
    }
}
