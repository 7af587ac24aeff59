//! Operator process configuration, read from the environment at startup.
//! There is no dynamic reconfiguration; restart to change.

const DEFAULT_BUS_URL: &str = "nats://nats.fleet.svc:4222";
const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_NAMESPACE: &str = "fleet-system";

#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// NATS server URL.
    pub bus_url: String,

    /// Bind address for the health/metrics HTTP surface.
    pub metrics_addr: String,

    /// Take a Lease before starting controllers.
    pub enable_leader_election: bool,

    /// Namespace holding the leader-election lease.
    pub namespace: String,
}

impl OperatorConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            bus_url: env_or("BUS_URL", DEFAULT_BUS_URL),
            metrics_addr: env_or("METRICS_ADDR", DEFAULT_METRICS_ADDR),
            enable_leader_election: std::env::var("ENABLE_LEADER_ELECTION")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            namespace: env_or("OPERATOR_NAMESPACE", DEFAULT_NAMESPACE),
        }
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            bus_url: DEFAULT_BUS_URL.to_string(),
            metrics_addr: DEFAULT_METRICS_ADDR.to_string(),
            enable_leader_election: false,
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

fn env_or(key: &str, fallback: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_conventions() {
        let config = OperatorConfig::default();
        assert_eq!(config.bus_url, "nats://nats.fleet.svc:4222");
        assert_eq!(config.metrics_addr, "0.0.0.0:8080");
        assert!(!config.enable_leader_election);
    }
}
