use serde::{Deserialize, Serialize};

/// Top-level gateway configuration, loaded once at startup and held behind
/// an `ArcSwap` for the lifetime of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub proxy: ProxyConfig,
    pub health_checks: HealthCheckConfig,
    pub targets: Vec<TargetConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            health_checks: HealthCheckConfig::default(),
            targets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Per-attempt upstream timeout, in seconds. `0` means no timeout.
    pub upstream_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_timeout_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub failure_threshold: u32,
    pub success_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            timeout_secs: default_timeout_secs(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
        }
    }
}

fn default_interval_secs() -> u64 {
    10
}
fn default_timeout_secs() -> u64 {
    3
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_success_threshold() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    pub connection: ConnectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub http: HttpConnectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConnectionConfig {
    pub url: String,
    #[serde(default)]
    pub compression: bool,
}
