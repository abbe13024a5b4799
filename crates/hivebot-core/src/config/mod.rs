//! Configuration: typed schema + JSON loader with env overrides.

pub mod loader;
pub mod schema;

pub use loader::{default_config_path, load_config, save_config};
pub use schema::Config;

use std::sync::Arc;

/// Returns the live configuration snapshot.
///
/// Injected at construction wherever a component needs to resolve models,
/// limits, or sub-agent overrides — there is no process-wide mutable
/// configuration singleton.
pub type ConfigGetter = Arc<dyn Fn() -> Arc<Config> + Send + Sync>;

/// A `ConfigGetter` over a fixed snapshot (tests, single-load binaries).
pub fn fixed_config(config: Config) -> ConfigGetter {
    let snapshot = Arc::new(config);
    Arc::new(move || snapshot.clone())
}
