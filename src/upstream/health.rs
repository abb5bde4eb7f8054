use crate::config::HealthCheckConfig;
use crate::upstream::target::Target;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Per-target health state. `reachable` is driven exclusively by the target's
/// own [`Prober`]; `tainted` can additionally be set by the proxy itself when
/// it observes a failed attempt, independent of the probe schedule.
struct HealthEntry {
    reachable: AtomicBool,
    tainted: AtomicBool,
    consecutive_successes: AtomicU32,
    consecutive_failures: AtomicU32,
}

impl HealthEntry {
    fn new() -> Self {
        Self {
            reachable: AtomicBool::new(false),
            tainted: AtomicBool::new(false),
            consecutive_successes: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }
}

/// Snapshot of a target's health, returned by [`HealthStore::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthState {
    pub reachable: bool,
    pub tainted: bool,
}

impl HealthState {
    /// A target is usable iff it is reachable and not tainted.
    pub fn usable(&self) -> bool {
        self.reachable && !self.tainted
    }
}

/// Concurrency-safe mapping from target name to [`HealthState`]. Shared
/// between the proxy (reads on every request, writes on taint) and the
/// health-check manager (writes on every probe tick).
#[derive(Clone, Default)]
pub struct HealthStore {
    entries: Arc<DashMap<String, Arc<HealthEntry>>>,
}

impl HealthStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    fn entry(&self, name: &str) -> Arc<HealthEntry> {
        if let Some(e) = self.entries.get(name) {
            return e.value().clone();
        }
        self.entries
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(HealthEntry::new()))
            .clone()
    }

    pub fn get(&self, name: &str) -> HealthState {
        let e = self.entry(name);
        HealthState {
            reachable: e.reachable.load(Ordering::Acquire),
            tainted: e.tainted.load(Ordering::Acquire),
        }
    }

    pub fn taint(&self, name: &str) {
        let e = self.entry(name);
        if !e.tainted.swap(true, Ordering::AcqRel) {
            metrics::counter!("gateway_taint_total", "target" => name.to_string()).increment(1);
            warn!(target = name, "upstream: tainted by proxy");
        }
    }

    pub fn untaint(&self, name: &str) {
        let e = self.entry(name);
        e.tainted.store(false, Ordering::Release);
    }

    fn record_success(&self, name: &str, success_threshold: u32) {
        let e = self.entry(name);
        e.consecutive_failures.store(0, Ordering::Relaxed);
        let count = e.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
        if !e.reachable.load(Ordering::Acquire) && count >= success_threshold {
            e.reachable.store(true, Ordering::Release);
            metrics::gauge!("gateway_upstream_health_status", "target" => name.to_string()).set(1.0);
            tracing::info!(target = name, "upstream: marked reachable");
        }
    }

    fn record_failure(&self, name: &str, failure_threshold: u32) {
        let e = self.entry(name);
        e.consecutive_successes.store(0, Ordering::Relaxed);
        let count = e.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if e.reachable.load(Ordering::Acquire) && count >= failure_threshold {
            e.reachable.store(false, Ordering::Release);
            metrics::gauge!("gateway_upstream_health_status", "target" => name.to_string()).set(0.0);
            warn!(
                target = name,
                consecutive_failures = count,
                "upstream: marked unreachable"
            );
        }
    }
}

/// Sleep for `duration`, returning early (with `true`) if shutdown fires.
async fn sleep_or_shutdown(duration: Duration, shutdown: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.notified() => true,
    }
}

/// Owns the liveness-probing loop for one target.
pub struct Prober {
    target: Target,
    config: HealthCheckConfig,
    store: HealthStore,
}

impl Prober {
    pub fn new(target: Target, config: HealthCheckConfig, store: HealthStore) -> Self {
        Self {
            target,
            config,
            store,
        }
    }

    async fn run(self, client: reqwest::Client, shutdown: Arc<Notify>) {
        loop {
            if sleep_or_shutdown(Duration::from_secs(self.config.interval_secs), &shutdown).await {
                return;
            }
            self.probe_once(&client).await;
        }
    }

    async fn probe_once(&self, client: &reqwest::Client) {
        let name = &self.target.name;
        let result = client
            .get(&self.target.url)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .send()
            .await;

        let healthy = match &result {
            Ok(resp) => resp.status().as_u16() < 500,
            Err(_) => false,
        };

        if healthy {
            self.store
                .record_success(name, self.config.success_threshold);
            metrics::counter!(
                "gateway_health_check_total",
                "target" => name.clone(),
                "result" => "success",
            )
            .increment(1);
            debug!(target = name.as_str(), "health: probe passed");
        } else {
            self.store
                .record_failure(name, self.config.failure_threshold);
            metrics::counter!(
                "gateway_health_check_total",
                "target" => name.clone(),
                "result" => "failure",
            )
            .increment(1);
            debug!(target = name.as_str(), "health: probe failed");
        }
    }
}

/// Build a shared HTTP client for health-check probes.
pub fn build_health_check_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .no_proxy()
        .build()
        .expect("failed to build health check client")
}

/// Owns the set of [`Prober`]s for a configured target list and exposes the
/// usability view the proxy consults on every request.
#[derive(Clone)]
pub struct HealthcheckManager {
    store: HealthStore,
    targets: Arc<Vec<Target>>,
    config: HealthCheckConfig,
}

impl HealthcheckManager {
    pub fn new(targets: Vec<Target>, config: HealthCheckConfig) -> Self {
        Self {
            store: HealthStore::new(),
            targets: Arc::new(targets),
            config,
        }
    }

    pub fn store(&self) -> &HealthStore {
        &self.store
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Spawn one background probing task per target. Call once; cancellation
    /// is via `shutdown.notify_waiters()`.
    pub fn start(&self, shutdown: Arc<Notify>) {
        let client = build_health_check_client();
        for target in self.targets.iter() {
            let prober = Prober::new(target.clone(), self.config.clone(), self.store.clone());
            let client = client.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(prober.run(client, shutdown));
        }
    }

    pub fn is_healthy(&self, name: &str) -> bool {
        self.store.get(name).usable()
    }

    pub fn tainted_targets(&self) -> Vec<String> {
        self.targets
            .iter()
            .filter(|t| self.store.get(&t.name).tainted)
            .map(|t| t.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(failure_threshold: u32, success_threshold: u32) -> HealthCheckConfig {
        HealthCheckConfig {
            interval_secs: 10,
            timeout_secs: 3,
            failure_threshold,
            success_threshold,
        }
    }

    #[test]
    fn starts_unreachable() {
        let store = HealthStore::new();
        let state = store.get("a");
        assert!(!state.reachable);
        assert!(!state.tainted);
        assert!(!state.usable());
    }

    #[test]
    fn reachable_after_success_threshold() {
        let store = HealthStore::new();
        let c = cfg(2, 2);
        store.record_success("a", c.success_threshold);
        assert!(!store.get("a").reachable);
        store.record_success("a", c.success_threshold);
        assert!(store.get("a").reachable);
    }

    #[test]
    fn unreachable_after_failure_threshold() {
        let store = HealthStore::new();
        let c = cfg(2, 1);
        store.record_success("a", c.success_threshold);
        assert!(store.get("a").reachable);

        store.record_failure("a", c.failure_threshold);
        assert!(store.get("a").reachable);
        store.record_failure("a", c.failure_threshold);
        assert!(!store.get("a").reachable);
    }

    #[test]
    fn success_resets_failure_streak() {
        let store = HealthStore::new();
        let c = cfg(3, 1);
        store.record_success("a", c.success_threshold);
        store.record_failure("a", c.failure_threshold);
        store.record_failure("a", c.failure_threshold);
        store.record_success("a", c.success_threshold);
        store.record_failure("a", c.failure_threshold);
        store.record_failure("a", c.failure_threshold);
        // only 2 consecutive failures since the reset — still reachable
        assert!(store.get("a").reachable);
    }

    #[test]
    fn taint_and_untaint() {
        let store = HealthStore::new();
        store.record_success("a", 1);
        assert!(store.get("a").usable());
        store.taint("a");
        assert!(!store.get("a").usable());
        store.untaint("a");
        assert!(store.get("a").usable());
    }

    #[test]
    fn manager_reports_tainted_targets() {
        let targets = vec![
            Target {
                name: "a".into(),
                url: "http://a".into(),
                accepts_compressed_requests: false,
            },
            Target {
                name: "b".into(),
                url: "http://b".into(),
                accepts_compressed_requests: false,
            },
        ];
        let manager = HealthcheckManager::new(targets, cfg(3, 1));
        manager.store().taint("a");
        assert_eq!(manager.tainted_targets(), vec!["a".to_string()]);
    }
}
