use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::compactor;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::limits::*;

/// Per-organization engines. Each organization gets its own Engine, WAL and
/// compactor. Organization = database name from the pgwire connection.
pub struct OrganizationRegistry {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    config: EngineConfig,
    compact_threshold: u64,
    max_organizations: usize,
}

impl OrganizationRegistry {
    pub fn new(data_dir: PathBuf, config: EngineConfig, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            config,
            compact_threshold,
            max_organizations: MAX_ORGANIZATIONS,
        }
    }

    pub fn with_max_organizations(mut self, max: usize) -> Self {
        self.max_organizations = max;
        self
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Get or lazily create the engine for an organization.
    pub fn get_or_create(&self, name: &str) -> std::io::Result<Arc<Engine>> {
        if name.len() > MAX_ORG_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "organization name too long",
            ));
        }
        if name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty organization name",
            ));
        }
        if !is_valid_name(name) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid organization name {name:?}: use only A-Z, a-z, 0-9, '_' and '-'"),
            ));
        }
        if let Some(engine) = self.engines.get(name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= self.max_organizations {
            return Err(std::io::Error::other("too many organizations"));
        }

        // The entry guard makes creation exclusive per name: one WAL, one engine.
        let engine = match self.engines.entry(name.to_string()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{name}.wal"));
                let engine = Arc::new(Engine::new(wal_path, self.config.clone())?);
                slot.insert(engine.clone());
                engine
            }
        };

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        info!("opened organization {name}");
        metrics::gauge!(crate::observability::ORGANIZATIONS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

/// Names map one-to-one onto WAL file names, so only `[A-Za-z0-9_-]` is allowed.
fn is_valid_name(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("formacal_test_org").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn registry(dir: PathBuf) -> OrganizationRegistry {
        OrganizationRegistry::new(dir, EngineConfig::default(), 1000)
    }

    const NINE: i64 = 1_773_133_200_000; // 2026-03-10T09:00:00Z
    const HOUR: i64 = 3_600_000;

    #[tokio::test]
    async fn organization_isolation() {
        let reg = registry(test_data_dir("isolation"));
        let eng_a = reg.get_or_create("org_a").unwrap();
        let eng_b = reg.get_or_create("org_b").unwrap();

        // Same instructor id in both organizations.
        let instructor = Ulid::new();
        let location = Ulid::new();
        eng_a.upsert_instructor(instructor, true).await.unwrap();
        eng_b.upsert_instructor(instructor, true).await.unwrap();

        eng_a
            .propose_and_commit(None, &[instructor], NINE, NINE + 2 * HOUR, location)
            .await
            .unwrap();

        let in_a = eng_a
            .check(&[instructor], NINE, NINE + HOUR, location, None)
            .await
            .unwrap();
        assert!(!in_a.available);

        let in_b = eng_b
            .check(&[instructor], NINE, NINE + HOUR, location, None)
            .await
            .unwrap();
        assert!(in_b.available);
        assert!(in_b.conflicts.is_empty());
    }

    #[tokio::test]
    async fn organization_lazy_creation() {
        let dir = test_data_dir("lazy");
        let reg = registry(dir.clone());

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());
        assert!(reg.is_empty());

        let _eng = reg.get_or_create("acme").unwrap();
        assert!(dir.join("acme.wal").exists());
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn same_engine_returned() {
        let reg = registry(test_data_dir("same_eng"));
        let eng1 = reg.get_or_create("foo").unwrap();
        let eng2 = reg.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn unsafe_names_rejected() {
        let dir = test_data_dir("unsafe_names");
        let reg = registry(dir.clone());

        for name in ["../evil", "acme.pt", "a b", "", "../..", "ação"] {
            let err = reg.get_or_create(name).err().unwrap();
            assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput, "{name:?}");
        }
        assert!(reg.is_empty());
        assert!(fs::read_dir(&dir).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn distinct_names_never_share_an_engine() {
        let reg = registry(test_data_dir("distinct"));
        let names = ["acmept", "acme-pt", "acme_pt", "ACMEPT"];
        let engines: Vec<_> = names.iter().map(|n| reg.get_or_create(n).unwrap()).collect();
        for (i, a) in engines.iter().enumerate() {
            for b in &engines[i + 1..] {
                assert!(!Arc::ptr_eq(a, b));
            }
        }
        assert!(reg.get_or_create("acme.pt").is_err());
        assert_eq!(reg.len(), names.len());
    }

    #[tokio::test]
    async fn name_too_long() {
        let reg = registry(test_data_dir("name_too_long"));
        let long_name = "x".repeat(MAX_ORG_NAME_LEN + 1);
        let err = reg.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("organization name too long"));
    }

    #[tokio::test]
    async fn organization_count_limit() {
        let reg = registry(test_data_dir("count_limit")).with_max_organizations(3);
        for i in 0..3 {
            reg.get_or_create(&format!("o{i}")).unwrap();
        }
        let err = reg.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many organizations"));
        // Existing organizations stay reachable at the limit.
        assert!(reg.get_or_create("o0").is_ok());
    }

    #[tokio::test]
    async fn engines_inherit_configuration() {
        let config = EngineConfig::default()
            .with_timezone(chrono_tz::Europe::Lisbon)
            .with_blocking_travel_buffer(true);
        let reg = OrganizationRegistry::new(test_data_dir("config"), config, 1000);
        let engine = reg.get_or_create("lisbon").unwrap();
        assert_eq!(engine.config.timezone, chrono_tz::Europe::Lisbon);
        assert_eq!(engine.config.travel_buffer_severity, crate::model::Severity::Blocking);
    }
}
