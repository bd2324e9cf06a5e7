//! Thin wrappers around the `git` binary.
//!
//! Used for the operations gix does not cover for us: config writes, and all
//! network transport (see [`crate::transport`]).

use std::io::Read;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use crate::error::GitError;

/// Build a `git` command with prompts disabled and a stable locale, so stderr
/// parsing sees English messages and a missing credential fails instead of
/// blocking on a TTY.
pub fn git(dir: Option<&Path>) -> Command {
    let mut cmd = Command::new("git");
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    cmd.env("GIT_TERMINAL_PROMPT", "0")
        .env("LC_ALL", "C")
        .stdin(Stdio::null());
    cmd
}

/// Render a command for error messages: `git <args...>`.
fn describe(args: &[&str]) -> String {
    let mut out = String::from("git");
    for arg in args {
        out.push(' ');
        // Never echo credentials back into error messages or logs.
        if arg.starts_with("http.extraHeader=") {
            out.push_str("http.extraHeader=<redacted>");
        } else {
            out.push_str(arg);
        }
    }
    out
}

/// Run `git <args>` and capture its output, failing on a non-zero exit.
pub fn run(dir: Option<&Path>, args: &[&str]) -> Result<Output, GitError> {
    let output = run_unchecked(dir, args)?;
    if !output.status.success() {
        return Err(GitError::Command {
            command: describe(args),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            exit_code: output.status.code(),
        });
    }
    Ok(output)
}

/// Run `git <args>` and capture its output regardless of exit status.
pub fn run_unchecked(dir: Option<&Path>, args: &[&str]) -> Result<Output, GitError> {
    tracing::debug!(command = %describe(args), "running git");
    let output = git(dir).args(args).output()?;
    Ok(output)
}

/// Run `git <args>` and return trimmed stdout.
pub fn stdout(dir: Option<&Path>, args: &[&str]) -> Result<String, GitError> {
    let output = run(dir, args)?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

/// Run `git <args>`, feeding every stderr line (split on `\r` as well as
/// `\n`, since git redraws progress in place) to `on_line` as it arrives.
///
/// Returns the full stderr text on success.
pub fn run_streaming(
    dir: Option<&Path>,
    args: &[&str],
    on_line: &mut dyn FnMut(&str),
) -> Result<String, GitError> {
    tracing::debug!(command = %describe(args), "running git (streaming)");
    let mut child = git(dir)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut collected = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let mut pending = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stderr.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            for &byte in &chunk[..n] {
                if byte == b'\r' || byte == b'\n' {
                    flush_line(&mut pending, &mut collected, on_line);
                } else {
                    pending.push(byte);
                }
            }
        }
        flush_line(&mut pending, &mut collected, on_line);
    }

    let status = child.wait()?;
    if !status.success() {
        return Err(GitError::Command {
            command: describe(args),
            stderr: collected.trim().to_owned(),
            exit_code: status.code(),
        });
    }
    Ok(collected)
}

fn flush_line(pending: &mut Vec<u8>, collected: &mut String, on_line: &mut dyn FnMut(&str)) {
    if pending.is_empty() {
        return;
    }
    let line = String::from_utf8_lossy(pending).into_owned();
    pending.clear();
    on_line(&line);
    collected.push_str(&line);
    collected.push('\n');
}
