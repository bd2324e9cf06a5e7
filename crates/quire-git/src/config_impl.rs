//! Repository-local config via `git config`.
//!
//! gix exposes config as a snapshot taken when the repository was opened;
//! going through the CLI keeps reads consistent with writes made by other
//! handles on the same repository.

use crate::cli;
use crate::error::GitError;
use crate::gix_repo::GixRepo;

fn git_dir_arg(repo: &GixRepo) -> String {
    repo.git_dir().to_string_lossy().into_owned()
}

pub fn read_config(repo: &GixRepo, key: &str) -> Result<Option<String>, GitError> {
    let git_dir = git_dir_arg(repo);
    let output = cli::run_unchecked(None, &["--git-dir", &git_dir, "config", "--local", "--get", key])?;
    match output.status.code() {
        Some(0) => Ok(Some(
            String::from_utf8_lossy(&output.stdout).trim_end().to_owned(),
        )),
        // Exit code 1: key not set.
        Some(1) => Ok(None),
        code => Err(GitError::Command {
            command: format!("git config --get {key}"),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            exit_code: code,
        }),
    }
}

pub fn write_config(repo: &GixRepo, key: &str, value: &str) -> Result<(), GitError> {
    let git_dir = git_dir_arg(repo);
    cli::run(None, &["--git-dir", &git_dir, "config", "--local", key, value])?;
    Ok(())
}

pub fn unset_config(repo: &GixRepo, key: &str) -> Result<(), GitError> {
    let git_dir = git_dir_arg(repo);
    let output = cli::run_unchecked(None, &["--git-dir", &git_dir, "config", "--local", "--unset", key])?;
    match output.status.code() {
        // Exit code 5: key was not set.
        Some(0 | 5) => Ok(()),
        code => Err(GitError::Command {
            command: format!("git config --unset {key}"),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            exit_code: code,
        }),
    }
}
