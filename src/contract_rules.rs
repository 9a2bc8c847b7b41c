//! Contract rules - read-through cache for the tax-lot method
//!
//! Looks up the allocation method per contract from the external Contract
//! Service, caches it with a TTL, and NEVER blocks the hotpath beyond a
//! hard timeout (40 ms by default). On timeout or lookup failure the
//! configured default method (FIFO unless overridden) is used and a metric
//! is incremented.

use async_trait::async_trait;
use cached::{Cached, TimedCache};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::models::TaxLotMethod;

// ============================================================
// RULES + CLIENT
// ============================================================

/// Rules returned by the Contract Service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractRules {
    pub tax_lot_method: TaxLotMethod,
}

/// External lookup. The HTTP implementation talks to the configured
/// Contract Service; the static implementation backs tests and the
/// in-memory run mode.
#[async_trait]
pub trait ContractRulesClient: Send + Sync {
    async fn get_rules(&self, contract_id: &str) -> anyhow::Result<ContractRules>;
}

/// HTTP client: `GET {base_url}/contracts/{contract_id}/rules`.
pub struct HttpContractRulesClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpContractRulesClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ContractRulesClient for HttpContractRulesClient {
    async fn get_rules(&self, contract_id: &str) -> anyhow::Result<ContractRules> {
        let url = format!("{}/contracts/{}/rules", self.base_url, contract_id);
        let rules = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<ContractRules>()
            .await?;
        Ok(rules)
    }
}

/// Fixed-answer client for tests and the in-memory run mode.
pub struct StaticContractRulesClient {
    rules: ContractRules,
}

impl StaticContractRulesClient {
    pub fn new(tax_lot_method: TaxLotMethod) -> Self {
        Self {
            rules: ContractRules { tax_lot_method },
        }
    }
}

#[async_trait]
impl ContractRulesClient for StaticContractRulesClient {
    async fn get_rules(&self, _contract_id: &str) -> anyhow::Result<ContractRules> {
        Ok(self.rules)
    }
}

// ============================================================
// CACHE
// ============================================================

/// Lookup counters, exposed on the health surface.
#[derive(Debug, Default)]
pub struct ContractRulesStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub timeouts: AtomicU64,
    pub failures: AtomicU64,
}

/// Read-through TTL cache in front of a `ContractRulesClient`.
pub struct ContractRulesCache {
    client: Arc<dyn ContractRulesClient>,
    cache: Mutex<TimedCache<String, ContractRules>>,
    timeout: Duration,
    default_method: TaxLotMethod,
    stats: ContractRulesStats,
}

impl ContractRulesCache {
    pub fn new(
        client: Arc<dyn ContractRulesClient>,
        ttl: Duration,
        timeout: Duration,
        default_method: TaxLotMethod,
    ) -> Self {
        Self {
            client,
            cache: Mutex::new(TimedCache::with_lifespan(ttl.as_secs())),
            timeout,
            default_method,
            stats: ContractRulesStats::default(),
        }
    }

    #[inline]
    pub fn stats(&self) -> &ContractRulesStats {
        &self.stats
    }

    #[inline]
    pub fn default_method(&self) -> TaxLotMethod {
        self.default_method
    }

    /// Resolve the allocation method for a contract. Infallible by
    /// contract: every failure mode degrades to the default method.
    pub async fn tax_lot_method(&self, contract_id: &str) -> TaxLotMethod {
        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(rules) = cache.cache_get(contract_id) {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return rules.tax_lot_method;
            }
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        match tokio::time::timeout(self.timeout, self.client.get_rules(contract_id)).await {
            Ok(Ok(rules)) => {
                self.cache
                    .lock()
                    .unwrap()
                    .cache_set(contract_id.to_string(), rules);
                rules.tax_lot_method
            }
            Ok(Err(e)) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    contract_id,
                    error = %e,
                    fallback = %self.default_method,
                    "Contract rules lookup failed, using fallback method"
                );
                self.default_method
            }
            Err(_) => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    contract_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    fallback = %self.default_method,
                    "Contract rules lookup timed out, using fallback method"
                );
                self.default_method
            }
        }
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Client that sleeps longer than any reasonable hotpath timeout.
    struct SlowClient;

    #[async_trait]
    impl ContractRulesClient for SlowClient {
        async fn get_rules(&self, _contract_id: &str) -> anyhow::Result<ContractRules> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ContractRules {
                tax_lot_method: TaxLotMethod::Lifo,
            })
        }
    }

    struct FailingClient;

    #[async_trait]
    impl ContractRulesClient for FailingClient {
        async fn get_rules(&self, _contract_id: &str) -> anyhow::Result<ContractRules> {
            anyhow::bail!("contract service unavailable")
        }
    }

    fn cache(client: Arc<dyn ContractRulesClient>) -> ContractRulesCache {
        ContractRulesCache::new(
            client,
            Duration::from_secs(300),
            Duration::from_millis(40),
            TaxLotMethod::Fifo,
        )
    }

    #[tokio::test]
    async fn test_lookup_and_cache_hit() {
        let cache = cache(Arc::new(StaticContractRulesClient::new(TaxLotMethod::Hifo)));

        assert_eq!(cache.tax_lot_method("C-1").await, TaxLotMethod::Hifo);
        assert_eq!(cache.tax_lot_method("C-1").await, TaxLotMethod::Hifo);

        assert_eq!(cache.stats().misses.load(Ordering::Relaxed), 1);
        assert_eq!(cache.stats().hits.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_timeout_falls_back_to_default() {
        let cache = cache(Arc::new(SlowClient));

        assert_eq!(cache.tax_lot_method("C-1").await, TaxLotMethod::Fifo);
        assert_eq!(cache.stats().timeouts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_failure_falls_back_to_default() {
        let cache = cache(Arc::new(FailingClient));

        assert_eq!(cache.tax_lot_method("C-1").await, TaxLotMethod::Fifo);
        assert_eq!(cache.stats().failures.load(Ordering::Relaxed), 1);

        // failures are not cached: the next call tries again
        assert_eq!(cache.tax_lot_method("C-1").await, TaxLotMethod::Fifo);
        assert_eq!(cache.stats().misses.load(Ordering::Relaxed), 2);
    }
}
