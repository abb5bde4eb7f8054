use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::upstream::{HealthcheckManager, Target};
use arc_swap::ArcSwap;
use std::sync::Arc;

/// Shared gateway state, cheaply cloneable — handed to every connection task.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub metrics: Metrics,
    pub health: HealthcheckManager,
    /// Pooled, process-wide HTTP client used for every upstream attempt.
    pub client: reqwest::Client,
}

impl GatewayState {
    pub fn new(config: GatewayConfig) -> Self {
        let targets: Vec<Target> = config.targets.iter().map(Target::from_config).collect();
        let health = HealthcheckManager::new(targets, config.health_checks.clone());
        let metrics = Metrics::install();

        // No default timeout here: `proxy.upstream_timeout_secs` (0 = no
        // timeout) is applied per request in `proxy::handler::handle_request`.
        let client = reqwest::Client::builder()
            .build()
            .expect("failed to build upstream http client");

        Self {
            config: Arc::new(ArcSwap::new(Arc::new(config))),
            metrics,
            health,
            client,
        }
    }
}
