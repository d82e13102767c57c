use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::info;

use crate::audit::{AuditSink, TracingAuditSink};
use crate::config::{EngineConfig, ServerConfig};
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::sweeper;

/// Settings every tenant engine is created with.
#[derive(Debug, Clone)]
pub struct TenantOptions {
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    pub engine: EngineConfig,
}

impl Default for TenantOptions {
    fn default() -> Self {
        Self {
            compact_threshold: 1000,
            sweep_interval: Duration::from_secs(60),
            engine: EngineConfig::default(),
        }
    }
}

impl From<&ServerConfig> for TenantOptions {
    fn from(c: &ServerConfig) -> Self {
        Self {
            compact_threshold: c.compact_threshold,
            sweep_interval: c.sweep_interval,
            engine: c.engine.clone(),
        }
    }
}

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL + sweeper
/// + compactor. Tenant = the name given in the connection's hello.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    options: TenantOptions,
    audit: Arc<dyn AuditSink>,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, options: TenantOptions) -> Self {
        Self::with_audit(data_dir, options, Arc::new(TracingAuditSink))
    }

    pub fn with_audit(data_dir: PathBuf, options: TenantOptions, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            options,
            audit,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        // Two connections racing on a new tenant must end up with one engine.
        let entry = self.engines.entry(tenant.to_string());
        if let dashmap::mapref::entry::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::with_audit(
            wal_path,
            notify,
            self.options.engine.clone(),
            self.audit.clone(),
        )?);

        tokio::spawn(sweeper::run_sweeper(engine.clone(), self.options.sweep_interval));
        tokio::spawn(sweeper::run_compactor(
            engine.clone(),
            self.options.compact_threshold,
        ));

        entry.or_insert(engine.clone());
        let active = self.engines.len();
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(active as f64);
        info!("tenant {safe_name} loaded ({active} active)");
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("stockhold_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = TenantManager::new(dir, TenantOptions::default());

        let shop_a = tm.get_or_create("shop_a").unwrap();
        let shop_b = tm.get_or_create("shop_b").unwrap();

        let pid = Ulid::new();
        let user = Ulid::new();
        shop_a.create_product(pid, None, 500, 5).await.unwrap();
        shop_b.create_product(pid, None, 500, 5).await.unwrap();

        shop_a.add_to_cart(user, pid, 5).await.unwrap();
        shop_a.checkout(user).await.unwrap();

        assert_eq!(shop_a.get_product(pid).await.unwrap().available, 0);
        assert_eq!(shop_b.get_product(pid).await.unwrap().available, 5);
        assert!(shop_b.get_cart(user).await.unwrap().lines.is_empty());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = TenantManager::new(dir.clone(), TenantOptions::default());

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_shop").unwrap();
        assert!(dir.join("my_shop.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = TenantManager::new(dir, TenantOptions::default());

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = TenantManager::new(dir.clone(), TenantOptions::default());

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = TenantManager::new(dir, TenantOptions::default());

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_survives_restart() {
        let dir = test_data_dir("restart");
        let pid = Ulid::new();
        {
            let tm = TenantManager::new(dir.clone(), TenantOptions::default());
            let eng = tm.get_or_create("durable").unwrap();
            eng.create_product(pid, Some("Lamp".into()), 4200, 9).await.unwrap();
        }
        let tm = TenantManager::new(dir, TenantOptions::default());
        let eng = tm.get_or_create("durable").unwrap();
        let info = eng.get_product(pid).await.unwrap();
        assert_eq!(info.name.as_deref(), Some("Lamp"));
        assert_eq!(info.stock_total, 9);
    }
}
