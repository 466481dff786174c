//! Engine tunables
//!
//! ## Example
//!
//! ```ignore
//! use shunt_core::config::EngineConfig;
//!
//! let config = EngineConfig::builder()
//!     .walk_iteration_limit(32)
//!     .create_alt_entry(false)
//!     .build();
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::error::{Error, Result};
use crate::runtime::RuntimeKind;

pub const ENV_RUNTIME: &str = "SHUNT_RUNTIME";
pub const ENV_WALK_LIMIT: &str = "SHUNT_WALK_LIMIT";
pub const ENV_ALT_ENTRY: &str = "SHUNT_ALT_ENTRY";
pub const ENV_CONFIG: &str = "SHUNT_CONFIG";

const DEFAULT_WALK_ITERATION_LIMIT: usize = 20;

/// Configuration for a platform triple
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Runtime to create when the triple is built by detection
    pub runtime: RuntimeKind,
    /// Thunk walk iterations before giving up on a method
    pub walk_iteration_limit: usize,
    /// Create alternate entry points for native detours when supported
    pub create_alt_entry: bool,
    /// Upper bound on the bytes read at each walk step
    pub thunk_read_limit: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeKind::Native,
            walk_iteration_limit: DEFAULT_WALK_ITERATION_LIMIT,
            create_alt_entry: true,
            thunk_read_limit: None,
        }
    }
}

impl EngineConfig {
    /// Create a new configuration builder
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Load a configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        debug!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    /// Build a configuration from `SHUNT_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match var(ENV_CONFIG) {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };

        if let Some(value) = var(ENV_RUNTIME) {
            config.runtime = value
                .parse()
                .map_err(|_| Error::Config(format!("{}: unknown runtime '{}'", ENV_RUNTIME, value)))?;
        }
        if let Some(value) = var(ENV_WALK_LIMIT) {
            config.walk_iteration_limit = value.trim().parse().map_err(|_| {
                Error::Config(format!("{}: '{}' is not a number", ENV_WALK_LIMIT, value))
            })?;
        }
        if let Some(value) = var(ENV_ALT_ENTRY) {
            config.create_alt_entry = parse_bool(&value).ok_or_else(|| {
                Error::Config(format!("{}: '{}' is not a boolean", ENV_ALT_ENTRY, value))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.walk_iteration_limit == 0 {
            return Err(Error::Config(
                "walk_iteration_limit must be at least 1".to_string(),
            ));
        }
        if self.thunk_read_limit == Some(0) {
            return Err(Error::Config(
                "thunk_read_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Builder for EngineConfig
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    runtime: Option<RuntimeKind>,
    walk_iteration_limit: Option<usize>,
    create_alt_entry: Option<bool>,
    thunk_read_limit: Option<usize>,
}

impl EngineConfigBuilder {
    pub fn runtime(mut self, runtime: RuntimeKind) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn walk_iteration_limit(mut self, limit: usize) -> Self {
        self.walk_iteration_limit = Some(limit);
        self
    }

    pub fn create_alt_entry(mut self, enabled: bool) -> Self {
        self.create_alt_entry = Some(enabled);
        self
    }

    pub fn thunk_read_limit(mut self, limit: usize) -> Self {
        self.thunk_read_limit = Some(limit);
        self
    }

    /// Build the configuration
    pub fn build(self) -> EngineConfig {
        let default = EngineConfig::default();
        EngineConfig {
            runtime: self.runtime.unwrap_or(default.runtime),
            walk_iteration_limit: self
                .walk_iteration_limit
                .unwrap_or(default.walk_iteration_limit),
            create_alt_entry: self.create_alt_entry.unwrap_or(default.create_alt_entry),
            thunk_read_limit: self.thunk_read_limit.or(default.thunk_read_limit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_builder_defaults() {
        let config = EngineConfig::builder().walk_iteration_limit(5).build();
        assert_eq!(config.walk_iteration_limit, 5);
        assert!(config.create_alt_entry);
        assert_eq!(config.runtime, RuntimeKind::Native);
        assert_eq!(EngineConfig::default().walk_iteration_limit, 20);
    }

    #[test]
    fn test_load_partial_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "runtime = \"coreclr\"").unwrap();
        writeln!(file, "thunk_read_limit = 64").unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.runtime, RuntimeKind::CoreClr);
        assert_eq!(config.thunk_read_limit, Some(64));
        assert_eq!(config.walk_iteration_limit, 20);
    }

    #[test]
    fn test_load_rejects_zero_limit() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "walk_iteration_limit = 0").unwrap();
        assert!(matches!(
            EngineConfig::load(file.path()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = EngineConfig::load("/nonexistent/shunt.toml").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_env_overrides() {
        let config = EngineConfig::from_vars(vars(&[
            (ENV_RUNTIME, "Mono"),
            (ENV_WALK_LIMIT, "7"),
            (ENV_ALT_ENTRY, "off"),
        ]))
        .unwrap();
        assert_eq!(config.runtime, RuntimeKind::Mono);
        assert_eq!(config.walk_iteration_limit, 7);
        assert!(!config.create_alt_entry);

        assert_eq!(EngineConfig::from_vars(vars(&[])).unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_env_layers_over_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "walk_iteration_limit = 9").unwrap();
        writeln!(file, "create_alt_entry = false").unwrap();
        let path = file.path().to_string_lossy().to_string();

        let config =
            EngineConfig::from_vars(vars(&[(ENV_CONFIG, &path), (ENV_ALT_ENTRY, "1")])).unwrap();
        assert_eq!(config.walk_iteration_limit, 9);
        assert!(config.create_alt_entry);
    }

    #[test]
    fn test_env_invalid_values() {
        for pair in [
            (ENV_RUNTIME, "jvm"),
            (ENV_WALK_LIMIT, "many"),
            (ENV_ALT_ENTRY, "maybe"),
            (ENV_WALK_LIMIT, "0"),
        ] {
            let err = EngineConfig::from_vars(vars(&[pair])).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{:?}", pair);
        }
    }
}
