//! Runtime configuration.
//!
//! Embedding applications construct a [`KestrelConfig`] (deserialized from
//! whatever format they use) and hand it to the resolver and coordinator.
//! Validation is explicit: call [`KestrelConfig::validate`] once at startup
//! and reject the process on error rather than limping along.

use serde::{Deserialize, Serialize};

use crate::types::SiteId;

/// Top-level configuration: the site directory plus resolver and
/// coordinator tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KestrelConfig {
    /// Configured sites. Declaration order is the participant order for
    /// replicated writes.
    pub sites: Vec<SiteConfig>,
    pub resolver: ResolverConfig,
    pub coordinator: CoordinatorConfig,
}

impl KestrelConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.sites.is_empty() {
            return Err("at least one site must be configured".to_string());
        }
        for (i, site) in self.sites.iter().enumerate() {
            site.validate()
                .map_err(|e| format!("sites[{i}] ({}): {e}", site.site_id))?;
            if self.sites[..i].iter().any(|s| s.site_id == site.site_id) {
                return Err(format!("duplicate site id {}", site.site_id));
            }
        }
        self.resolver.validate()?;
        self.coordinator.validate()?;
        Ok(())
    }

    /// Site ids in declaration order.
    pub fn site_ids(&self) -> Vec<SiteId> {
        self.sites.iter().map(|s| SiteId::new(&s.site_id)).collect()
    }

    pub fn site(&self, id: &SiteId) -> Option<&SiteConfig> {
        self.sites.iter().find(|s| s.site_id == id.as_str())
    }
}

/// One database site (one library branch) in the directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub site_id: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            site_id: String::new(),
            host: "localhost".to_string(),
            port: 5432,
            database: String::new(),
            user: "postgres".to_string(),
            password: String::new(),
        }
    }
}

impl SiteConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.site_id.trim().is_empty() {
            return Err("site_id must not be empty".to_string());
        }
        if self.database.trim().is_empty() {
            return Err("database must not be empty".to_string());
        }
        if self.port == 0 {
            return Err("port must not be 0".to_string());
        }
        Ok(())
    }

    pub fn site_id(&self) -> SiteId {
        SiteId::new(&self.site_id)
    }

    /// Connection string in the key/value format tokio-postgres accepts.
    pub fn conn_string(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={}",
            self.host, self.port, self.user, self.password, self.database
        )
    }
}

/// Connection-probe retry policy: exponential backoff with jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Probe attempts per resolve before giving up.
    pub probe_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Fraction of the current backoff added as random jitter (0.0 to 1.0).
    pub jitter_ratio: f64,
    pub connect_timeout_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            probe_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
            backoff_multiplier: 2.0,
            jitter_ratio: 0.1,
            connect_timeout_ms: 5_000,
        }
    }
}

impl ResolverConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.probe_attempts == 0 {
            return Err("resolver.probe_attempts must be at least 1".to_string());
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err("resolver.initial_backoff_ms exceeds max_backoff_ms".to_string());
        }
        if self.backoff_multiplier < 1.0 {
            return Err("resolver.backoff_multiplier must be at least 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err("resolver.jitter_ratio must be within 0.0..=1.0".to_string());
        }
        if self.connect_timeout_ms == 0 {
            return Err("resolver.connect_timeout_ms must not be 0".to_string());
        }
        Ok(())
    }
}

/// Coordinator phase budgets and recovery-sweep tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Budget for one participant's prepare, resolve included.
    pub prepare_timeout_ms: u64,
    /// Budget for one commit-side write or local commit.
    pub commit_timeout_ms: u64,
    /// Repairs one recovery sweep may perform before yielding.
    pub sweep_max_repairs: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            prepare_timeout_ms: 5_000,
            commit_timeout_ms: 5_000,
            sweep_max_repairs: 32,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.prepare_timeout_ms == 0 || self.commit_timeout_ms == 0 {
            return Err("coordinator phase timeouts must not be 0".to_string());
        }
        if self.sweep_max_repairs == 0 {
            return Err("coordinator.sweep_max_repairs must be at least 1".to_string());
        }
        Ok(())
    }
}
