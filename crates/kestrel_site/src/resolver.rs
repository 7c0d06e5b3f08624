//! Site connection resolution and caching.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use kestrel_common::config::{KestrelConfig, ResolverConfig, SiteConfig};
use kestrel_common::error::ConnectionError;
use kestrel_common::types::SiteId;

use crate::store::{SiteConnection, SiteConnector};

/// Resolves site ids to live, cached connections.
///
/// One connection is kept per site, established lazily on first use and
/// verified with a liveness probe under the configured retry policy. The
/// cache is the only state shared across concurrent distributed operations:
/// lookups take the read side of the lock; the first resolver of an
/// uncached site holds the write side across dial and probe, so concurrent
/// resolvers of that site wait for its connection instead of dialing twice.
///
/// An unknown site id fails immediately without dialing anything.
pub struct ConnectionResolver<C: SiteConnector> {
    connector: C,
    directory: HashMap<SiteId, SiteConfig>,
    order: Vec<SiteId>,
    policy: ResolverConfig,
    cache: RwLock<HashMap<SiteId, Arc<C::Conn>>>,
}

impl<C: SiteConnector> ConnectionResolver<C> {
    pub fn new(connector: C, config: &KestrelConfig) -> Self {
        let order = config.site_ids();
        let directory = config
            .sites
            .iter()
            .map(|s| (s.site_id(), s.clone()))
            .collect();
        Self {
            connector,
            directory,
            order,
            policy: config.resolver.clone(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Configured sites in declaration order; the participant order for
    /// replicated writes.
    pub fn site_ids(&self) -> &[SiteId] {
        &self.order
    }

    pub fn is_known(&self, site: &SiteId) -> bool {
        self.directory.contains_key(site)
    }

    /// Resolve a site to a live connection, dialing and caching on first
    /// use.
    pub async fn resolve(&self, site: &SiteId) -> Result<Arc<C::Conn>, ConnectionError> {
        if let Some(conn) = self.cache.read().await.get(site) {
            return Ok(conn.clone());
        }
        let cfg = self
            .directory
            .get(site)
            .ok_or_else(|| ConnectionError::UnknownSite(site.clone()))?;

        let mut cache = self.cache.write().await;
        // A concurrent resolver may have dialed while we waited for the
        // write side.
        if let Some(conn) = cache.get(site) {
            return Ok(conn.clone());
        }
        let conn = Arc::new(self.dial_with_probe(site, cfg).await?);
        cache.insert(site.clone(), conn.clone());
        debug!(site = %site, "connection cached");
        Ok(conn)
    }

    /// Drop a cached connection so the next resolve re-dials. Called when a
    /// caller finds its connection broken.
    pub async fn invalidate(&self, site: &SiteId) {
        if self.cache.write().await.remove(site).is_some() {
            debug!(site = %site, "connection invalidated");
        }
    }

    async fn dial_with_probe(
        &self,
        site: &SiteId,
        cfg: &SiteConfig,
    ) -> Result<C::Conn, ConnectionError> {
        let connect_budget = Duration::from_millis(self.policy.connect_timeout_ms);
        let mut backoff = Duration::from_millis(self.policy.initial_backoff_ms);
        let mut last_error: Option<ConnectionError> = None;

        for attempt in 1..=self.policy.probe_attempts {
            let dialed = match tokio::time::timeout(connect_budget, self.connector.connect(cfg))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::ConnectTimeout {
                    site: site.clone(),
                    ms: self.policy.connect_timeout_ms,
                }),
            };
            match dialed {
                Ok(conn) => match conn.ping().await {
                    Ok(()) => {
                        if attempt > 1 {
                            debug!(site = %site, attempt, "probe succeeded after retry");
                        }
                        return Ok(conn);
                    }
                    Err(e) => {
                        warn!(site = %site, attempt, error = %e, "liveness probe failed");
                        last_error = Some(e);
                    }
                },
                Err(e) => {
                    warn!(site = %site, attempt, error = %e, "connect failed");
                    last_error = Some(e);
                }
            }
            if attempt < self.policy.probe_attempts {
                tokio::time::sleep(self.jittered(backoff)).await;
                backoff = Duration::from_millis(
                    ((backoff.as_millis() as f64) * self.policy.backoff_multiplier)
                        .min(self.policy.max_backoff_ms as f64) as u64,
                );
            }
        }

        Err(ConnectionError::Unreachable {
            site: site.clone(),
            attempts: self.policy.probe_attempts,
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no probe attempted".to_string()),
        })
    }

    fn jittered(&self, backoff: Duration) -> Duration {
        if self.policy.jitter_ratio <= 0.0 {
            return backoff;
        }
        let spread = backoff.mul_f64(self.policy.jitter_ratio);
        backoff + spread.mul_f64(rand::thread_rng().gen_range(0.0..=1.0))
    }
}

#[cfg(test)]
mod resolver_cache {
    use super::*;
    use crate::mem::MemConnector;
    use kestrel_common::config::{CoordinatorConfig, KestrelConfig};

    fn config(ids: &[&str]) -> KestrelConfig {
        KestrelConfig {
            sites: ids
                .iter()
                .map(|id| SiteConfig {
                    site_id: id.to_string(),
                    database: format!("library_{}", id.to_lowercase()),
                    ..SiteConfig::default()
                })
                .collect(),
            resolver: ResolverConfig {
                probe_attempts: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 4,
                backoff_multiplier: 2.0,
                jitter_ratio: 0.0,
                connect_timeout_ms: 1_000,
            },
            coordinator: CoordinatorConfig::default(),
        }
    }

    fn resolver(ids: &[&str]) -> (MemConnector, ConnectionResolver<MemConnector>) {
        let connector = MemConnector::new();
        let resolver = ConnectionResolver::new(connector.clone(), &config(ids));
        (connector, resolver)
    }

    #[tokio::test]
    async fn test_resolve_dials_once_and_caches() {
        let (connector, resolver) = resolver(&["Q1", "Q3"]);
        let q1 = SiteId::new("Q1");

        resolver.resolve(&q1).await.unwrap();
        resolver.resolve(&q1).await.unwrap();

        assert_eq!(connector.site(&q1).connects(), 1);
    }

    #[tokio::test]
    async fn test_unknown_site_fails_without_dialing() {
        let (connector, resolver) = resolver(&["Q1"]);
        let q9 = SiteId::new("Q9");

        let err = resolver.resolve(&q9).await.unwrap_err();
        assert!(matches!(err, ConnectionError::UnknownSite(_)), "got {err:?}");
        assert_eq!(connector.site(&q9).connects(), 0);
        assert!(!resolver.is_known(&q9));
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_dial() {
        let (connector, resolver) = resolver(&["Q1"]);
        let q1 = SiteId::new("Q1");

        let (a, b) = tokio::join!(resolver.resolve(&q1), resolver.resolve(&q1));
        a.unwrap();
        b.unwrap();

        assert_eq!(connector.site(&q1).connects(), 1);
    }

    #[tokio::test]
    async fn test_probe_retries_through_refused_connects() {
        let (connector, resolver) = resolver(&["Q1"]);
        let q1 = SiteId::new("Q1");
        connector.site(&q1).faults.refuse_connects(2);

        resolver.resolve(&q1).await.unwrap();
        assert_eq!(connector.site(&q1).connects(), 3);
    }

    #[tokio::test]
    async fn test_probe_exhaustion_reports_attempts() {
        let (connector, resolver) = resolver(&["Q1"]);
        let q1 = SiteId::new("Q1");
        connector.site(&q1).faults.refuse_connects(10);

        let err = resolver.resolve(&q1).await.unwrap_err();
        match err {
            ConnectionError::Unreachable { attempts, reason, .. } => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("refused"), "reason was: {reason}");
            }
            other => panic!("expected Unreachable, got {other:?}"),
        }
        assert_eq!(connector.site(&q1).connects(), 3);
    }

    #[tokio::test]
    async fn test_invalidate_forces_redial() {
        let (connector, resolver) = resolver(&["Q1"]);
        let q1 = SiteId::new("Q1");

        resolver.resolve(&q1).await.unwrap();
        resolver.invalidate(&q1).await;
        resolver.resolve(&q1).await.unwrap();

        assert_eq!(connector.site(&q1).connects(), 2);
    }

    #[tokio::test]
    async fn test_declaration_order_preserved() {
        let (_connector, resolver) = resolver(&["Q3", "Q1", "Q2"]);
        let ids: Vec<&str> = resolver.site_ids().iter().map(|s| s.as_str()).collect();
        assert_eq!(ids, vec!["Q3", "Q1", "Q2"]);
    }
}
