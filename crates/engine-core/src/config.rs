//! One configuration struct with defaults, replacing what would otherwise
//! be deeply-nested per-component configuration (spec.md S9).

use std::time::Duration;

/// Engine-wide tuning knobs. Defaults match spec.md S9 verbatim.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub worker_count: usize,
    pub lease_duration: Duration,
    pub lease_owner_tag: String,
    pub claim_batch_size: i64,
    pub poll_interval: Duration,
    pub idle_backoff: Duration,
    pub drain_grace: Duration,
    pub provider_max_retries: u32,
    pub provider_initial_backoff: Duration,
    pub provider_max_backoff: Duration,
    pub tx_batch_size: usize,
    pub tx_flush_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 10,
            lease_duration: Duration::from_secs(30),
            lease_owner_tag: default_lease_owner_tag(),
            claim_batch_size: 1,
            poll_interval: Duration::from_millis(50),
            idle_backoff: Duration::from_millis(200),
            drain_grace: Duration::from_secs(2),
            provider_max_retries: 5,
            provider_initial_backoff: Duration::from_millis(500),
            provider_max_backoff: Duration::from_secs(30),
            tx_batch_size: 50,
            tx_flush_interval: Duration::from_millis(75),
        }
    }
}

/// `host:pid:nanos`, unique enough to distinguish concurrent processes on
/// one machine without a coordination service (spec.md S9).
fn default_lease_owner_tag() -> String {
    let host = hostname_or_unknown();
    let pid = std::process::id();
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{host}:{pid}:{nanos}")
}

fn hostname_or_unknown() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = EngineConfig::default();
        assert_eq!(config.worker_count, 10);
        assert_eq!(config.lease_duration, Duration::from_secs(30));
        assert_eq!(config.claim_batch_size, 1);
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.idle_backoff, Duration::from_millis(200));
        assert_eq!(config.drain_grace, Duration::from_secs(2));
        assert_eq!(config.provider_max_retries, 5);
    }

    #[test]
    fn lease_owner_tags_are_unique_per_process_instant() {
        let a = default_lease_owner_tag();
        std::thread::sleep(Duration::from_millis(1));
        let b = default_lease_owner_tag();
        assert_ne!(a, b);
    }
}
