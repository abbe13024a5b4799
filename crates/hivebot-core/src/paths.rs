//! Where runtime state lives on disk.
//!
//! Everything (config, sessions, the sub-agent registry) sits under one
//! root so an operator can relocate or wipe the whole runtime state by
//! pointing `HIVEBOT_HOME` somewhere else.

use std::path::PathBuf;

/// Root of Hivebot's on-disk state.
///
/// `HIVEBOT_HOME` overrides the default of `~/.hivebot`.
pub fn data_dir() -> PathBuf {
    match std::env::var("HIVEBOT_HOME") {
        Ok(root) if !root.is_empty() => expand_home(&root),
        _ => expand_home("~/.hivebot"),
    }
}

/// Sessions root, one subdirectory per agent.
pub fn sessions_dir() -> PathBuf {
    data_dir().join("sessions")
}

/// Resolve a leading `~` against the home directory. Paths without a
/// `~` prefix (and `~user` forms) pass through untouched.
pub fn expand_home(path: &str) -> PathBuf {
    let home = || home_dir().unwrap_or_else(|| PathBuf::from("."));
    if path == "~" {
        return home();
    }
    match path.strip_prefix("~/") {
        Some(rest) => home().join(rest),
        None => PathBuf::from(path),
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}
