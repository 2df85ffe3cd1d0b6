//! ABOUTME: Process-wide scheduler configuration, layered over sensible defaults
//! ABOUTME: Defaults construct a usable config with no file or environment present

use serde::{Deserialize, Serialize};

/// Tunables a worker process may override via TOML/env, falling back to
/// the defaults below (§1.1, §4.3). Mirrors the shape the teacher loads
/// through the `config` crate for its own database/retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub lock_ttl_ms: u64,
    pub lock_extension_interval_ms: u64,
    pub run_retention_count: u32,
    pub metrics_enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: 60_000,
            lock_extension_interval_ms: 30_000,
            run_retention_count: 100,
            metrics_enabled: false,
        }
    }
}

impl SchedulerConfig {
    /// Layer a TOML file, then a `SCHED_` prefixed environment namespace,
    /// over the struct defaults. Missing sources are silently skipped; a
    /// present-but-malformed source is a hard error.
    pub fn load(toml_path: Option<&str>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = toml_path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("SCHED")
                .try_parsing(true)
                .separator("_"),
        );

        // `#[serde(default)]` on the struct falls back to `Default::default()`
        // for any field absent from every source, so an empty config
        // (no file, no env) still deserializes to the struct's defaults.
        let built = builder.build()?;
        built.try_deserialize().map_err(crate::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable_without_any_source() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.lock_ttl_ms, 60_000);
        assert!(!cfg.metrics_enabled);
    }

    #[test]
    fn load_with_no_file_falls_back_to_defaults() {
        let cfg = SchedulerConfig::load(None).unwrap();
        assert_eq!(cfg.lock_ttl_ms, 60_000);
        assert_eq!(cfg.run_retention_count, 100);
    }

    #[test]
    fn load_honors_env_override() {
        std::env::set_var("SCHED_METRICS_ENABLED", "true");
        let cfg = SchedulerConfig::load(None).unwrap();
        std::env::remove_var("SCHED_METRICS_ENABLED");
        assert!(cfg.metrics_enabled);
    }
}
