use crate::config::TargetConfig;

/// An immutable upstream descriptor. Constructed once from configuration and
/// shared read-only for the lifetime of the process. Equality is by `name`
/// alone — `name` is the unique, stable identity used as the health-store key
/// and metric label, independent of a target's other, potentially-reloaded
/// fields.
#[derive(Debug, Clone)]
pub struct Target {
    pub name: String,
    pub url: String,
    pub accepts_compressed_requests: bool,
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Target {}

impl Target {
    pub fn from_config(cfg: &TargetConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            url: cfg.connection.http.url.clone(),
            accepts_compressed_requests: cfg.connection.http.compression,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_url_and_compression() {
        let a = Target {
            name: "a".into(),
            url: "http://one".into(),
            accepts_compressed_requests: false,
        };
        let b = Target {
            name: "a".into(),
            url: "http://two".into(),
            accepts_compressed_requests: true,
        };
        assert_eq!(a, b);
    }

    #[test]
    fn inequality_by_name() {
        let a = Target {
            name: "a".into(),
            url: "http://one".into(),
            accepts_compressed_requests: false,
        };
        let b = Target {
            name: "b".into(),
            url: "http://one".into(),
            accepts_compressed_requests: false,
        };
        assert_ne!(a, b);
    }
}
