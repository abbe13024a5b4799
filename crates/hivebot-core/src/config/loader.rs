//! Config loading: one JSON file under the data directory, with
//! `HIVEBOT_*` environment overrides applied on top. A missing or
//! malformed file is never fatal — the runtime starts on defaults and
//! logs what happened.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::schema::Config;
use crate::paths;

/// Where the runtime looks for its config file.
pub fn default_config_path() -> PathBuf {
    paths::data_dir().join("config.json")
}

/// Read configuration from `path` (or the default location) and apply
/// env overrides.
pub fn load_config(path: Option<&Path>) -> Config {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);
    let from_file = read_config_file(&path).unwrap_or_default();
    apply_env_overrides(from_file)
}

/// Parse the file if it exists and is valid JSON; `None` otherwise.
fn read_config_file(path: &Path) -> Option<Config> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no config file, starting on defaults");
            return None;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "config unreadable, starting on defaults");
            return None;
        }
    };

    match serde_json::from_str(&raw) {
        Ok(config) => Some(config),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "config malformed, starting on defaults");
            None
        }
    }
}

/// Write the config out as pretty camelCase JSON, creating the data
/// directory on first use.
pub fn save_config(config: &Config, path: Option<&Path>) -> std::io::Result<()> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let body = serde_json::to_vec_pretty(config).map_err(std::io::Error::other)?;
    std::fs::write(&path, body)
}

/// Apply environment variable overrides on top of a loaded config.
///
/// Env var format: `HIVEBOT_<SECTION>__<FIELD>` (double underscore as delimiter).
///
/// Supported overrides:
/// - `HIVEBOT_AGENTS__DEFAULTS__MODEL` → `agents.defaults.model`
/// - `HIVEBOT_AGENTS__DEFAULTS__MAX_TOKENS` → `agents.defaults.max_tokens`
/// - `HIVEBOT_AGENTS__DEFAULTS__TEMPERATURE` → `agents.defaults.temperature`
/// - `HIVEBOT_PROVIDERS__<NAME>__API_KEY` → matching profile's api_key
/// - `HIVEBOT_PROVIDERS__<NAME>__API_BASE` → matching profile's api_base
/// - `HIVEBOT_LANES__SUBAGENT_CONCURRENCY` → `lanes.subagent_concurrency`
fn apply_env_overrides(mut config: Config) -> Config {
    if let Ok(val) = std::env::var("HIVEBOT_AGENTS__DEFAULTS__MODEL") {
        config.agents.defaults.model = val;
    }
    if let Ok(val) = std::env::var("HIVEBOT_AGENTS__DEFAULTS__MAX_TOKENS") {
        if let Ok(n) = val.parse::<u32>() {
            config.agents.defaults.max_tokens = n;
        }
    }
    if let Ok(val) = std::env::var("HIVEBOT_AGENTS__DEFAULTS__TEMPERATURE") {
        if let Ok(t) = val.parse::<f64>() {
            config.agents.defaults.temperature = t;
        }
    }
    if let Ok(val) = std::env::var("HIVEBOT_AGENTS__DEFAULTS__MAX_TOOL_ITERATIONS") {
        if let Ok(n) = val.parse::<usize>() {
            config.agents.defaults.max_tool_iterations = n;
        }
    }
    if let Ok(val) = std::env::var("HIVEBOT_LANES__SUBAGENT_CONCURRENCY") {
        if let Ok(n) = val.parse::<usize>() {
            config.lanes.subagent_concurrency = n;
        }
    }

    // Profile credentials by profile name.
    for profile in &mut config.providers.profiles {
        let prefix = format!(
            "HIVEBOT_PROVIDERS__{}__",
            profile.name.to_uppercase().replace('-', "_")
        );
        if let Ok(val) = std::env::var(format!("{prefix}API_KEY")) {
            profile.api_key = val;
        }
        if let Ok(val) = std::env::var(format!("{prefix}API_BASE")) {
            profile.api_base = Some(val);
        }
    }

    config
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn config_file(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("config.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.json")));
        assert_eq!(config.agents.defaults.max_tokens, 8192);
        assert_eq!(config.lanes.subagent_concurrency, 8);
    }

    #[test]
    fn test_partial_file_merges_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = config_file(
            dir.path(),
            r#"{"agents": {"defaults": {"model": "gpt-4o", "maxTokens": 2048}}}"#,
        );

        let config = load_config(Some(&path));
        assert_eq!(config.agents.defaults.model, "gpt-4o");
        assert_eq!(config.agents.defaults.max_tokens, 2048);
        // Unmentioned fields stay at their defaults.
        assert_eq!(config.agents.defaults.temperature, 0.7);
    }

    #[test]
    fn test_malformed_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = config_file(dir.path(), "{ this is not json");
        let config = load_config(Some(&path));
        assert_eq!(config.agents.defaults.max_tokens, 8192);
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        // Save into a nested directory to exercise create_dir_all.
        let path = dir.path().join("state").join("config.json");

        let mut config = Config::default();
        config.agents.defaults.model = "deepseek-chat".to_string();
        config.providers.profiles.push(crate::config::schema::ProfileConfig {
            name: "primary".into(),
            api_key: "sk-test".into(),
            priority: 1,
            ..Default::default()
        });
        save_config(&config, Some(&path)).unwrap();

        let reloaded = load_config(Some(&path));
        assert_eq!(reloaded.agents.defaults.model, "deepseek-chat");
        assert_eq!(reloaded.providers.profiles[0].api_key, "sk-test");
    }

    #[test]
    fn test_saved_file_uses_camel_case_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        save_config(&Config::default(), Some(&path)).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw["agents"]["defaults"].get("maxTokens").is_some());
        assert!(raw["agents"]["defaults"].get("max_tokens").is_none());
    }

    #[test]
    fn test_env_override_model() {
        std::env::set_var("HIVEBOT_AGENTS__DEFAULTS__MODEL", "test-model");
        let config = apply_env_overrides(Config::default());
        assert_eq!(config.agents.defaults.model, "test-model");
        std::env::remove_var("HIVEBOT_AGENTS__DEFAULTS__MODEL");
    }

    #[test]
    fn test_env_override_profile_key() {
        let mut config = Config::default();
        config.providers.profiles.push(crate::config::schema::ProfileConfig {
            name: "primary".into(),
            ..Default::default()
        });

        std::env::set_var("HIVEBOT_PROVIDERS__PRIMARY__API_KEY", "sk-env-key");
        let config = apply_env_overrides(config);
        assert_eq!(config.providers.profiles[0].api_key, "sk-env-key");
        std::env::remove_var("HIVEBOT_PROVIDERS__PRIMARY__API_KEY");
    }
}
