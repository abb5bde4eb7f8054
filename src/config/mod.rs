pub mod types;

pub use types::*;

use anyhow::Result;
use std::collections::HashSet;
use std::path::Path;

/// Environment variables that override a loaded knob when set, applied
/// after the file/default load and before validation.
const ENV_UPSTREAM_TIMEOUT_SECS: &str = "HERMES_FAILOVER_UPSTREAM_TIMEOUT_SECS";
const ENV_HEALTH_INTERVAL_SECS: &str = "HERMES_FAILOVER_HEALTH_INTERVAL_SECS";
const ENV_HEALTH_TIMEOUT_SECS: &str = "HERMES_FAILOVER_HEALTH_TIMEOUT_SECS";
const ENV_HEALTH_FAILURE_THRESHOLD: &str = "HERMES_FAILOVER_HEALTH_FAILURE_THRESHOLD";
const ENV_HEALTH_SUCCESS_THRESHOLD: &str = "HERMES_FAILOVER_HEALTH_SUCCESS_THRESHOLD";

impl GatewayConfig {
    /// Load configuration from a file (if it exists), apply environment
    /// overrides, then validate. When the file does not exist, built-in
    /// defaults are used before overrides are applied — allowing the
    /// gateway to start with zero file-based configuration for local
    /// development (though at least one target, from file or env, is still
    /// required by `validate`).
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using defaults",
                path.display()
            );
            GatewayConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(targets = config.targets.len(), "loaded gateway configuration");
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        apply_env_override(ENV_UPSTREAM_TIMEOUT_SECS, &mut self.proxy.upstream_timeout_secs);
        apply_env_override(ENV_HEALTH_INTERVAL_SECS, &mut self.health_checks.interval_secs);
        apply_env_override(ENV_HEALTH_TIMEOUT_SECS, &mut self.health_checks.timeout_secs);
        apply_env_override(
            ENV_HEALTH_FAILURE_THRESHOLD,
            &mut self.health_checks.failure_threshold,
        );
        apply_env_override(
            ENV_HEALTH_SUCCESS_THRESHOLD,
            &mut self.health_checks.success_threshold,
        );
    }

    pub fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            anyhow::bail!("at least one target must be configured");
        }

        let mut seen = HashSet::new();
        for target in &self.targets {
            if target.name.is_empty() {
                anyhow::bail!("target name cannot be empty");
            }
            if !seen.insert(target.name.as_str()) {
                anyhow::bail!("duplicate target name: {}", target.name);
            }
            let url = &target.connection.http.url;
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                anyhow::bail!(
                    "target {} has a non-absolute url (must start with http:// or https://): {}",
                    target.name,
                    url
                );
            }
        }
        Ok(())
    }
}

/// Parse an environment variable into `field`, leaving it untouched (and
/// logging a warning) if the variable is unset or fails to parse.
fn apply_env_override<T: std::str::FromStr>(key: &str, field: &mut T) {
    let Ok(raw) = std::env::var(key) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *field = value,
        Err(_) => tracing::warn!(env = key, value = raw, "ignoring unparseable env override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{ConnectionConfig, HttpConnectionConfig, TargetConfig};

    fn target(name: &str, url: &str) -> TargetConfig {
        TargetConfig {
            name: name.to_string(),
            connection: ConnectionConfig {
                http: HttpConnectionConfig {
                    url: url.to_string(),
                    compression: false,
                },
            },
        }
    }

    #[test]
    fn rejects_empty_target_list() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_non_absolute_url() {
        let mut config = GatewayConfig::default();
        config.targets.push(target("a", "10.0.0.1:8080"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepts_valid_config() {
        let mut config = GatewayConfig::default();
        config.targets.push(target("a", "http://10.0.0.1:8080"));
        config.targets.push(target("b", "https://10.0.0.2:8080"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_duplicate_target_names() {
        let mut config = GatewayConfig::default();
        config.targets.push(target("a", "http://10.0.0.1:8080"));
        config.targets.push(target("a", "http://10.0.0.2:8080"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply_on_top_of_defaults() {
        std::env::set_var(ENV_UPSTREAM_TIMEOUT_SECS, "7");
        std::env::set_var(ENV_HEALTH_INTERVAL_SECS, "30");
        std::env::set_var(ENV_HEALTH_FAILURE_THRESHOLD, "9");

        let mut config = GatewayConfig::default();
        config.apply_env_overrides();

        assert_eq!(config.proxy.upstream_timeout_secs, 7);
        assert_eq!(config.health_checks.interval_secs, 30);
        assert_eq!(config.health_checks.failure_threshold, 9);
        // untouched knob keeps its default
        assert_eq!(config.health_checks.success_threshold, 1);

        std::env::remove_var(ENV_UPSTREAM_TIMEOUT_SECS);
        std::env::remove_var(ENV_HEALTH_INTERVAL_SECS);
        std::env::remove_var(ENV_HEALTH_FAILURE_THRESHOLD);
    }

    #[test]
    fn unparseable_env_override_is_ignored() {
        const KEY: &str = "HERMES_FAILOVER_UPSTREAM_TIMEOUT_SECS_TEST_GARBAGE";
        let mut value = 5u64;
        std::env::set_var(KEY, "not-a-number");
        apply_env_override(KEY, &mut value);
        assert_eq!(value, 5);
        std::env::remove_var(KEY);
    }
}
