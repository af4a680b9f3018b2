use std::collections::BTreeMap;
use std::sync::Arc;

use instancer_providers::inventory::Zone;
use anyhow::Context;
use instancer_providers::{CloudProvider, ProviderError, ZoneCatalogs};

/// Configured providers, keyed by the code stored on instance records.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn CloudProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: Arc<dyn CloudProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn register(&mut self, provider: Arc<dyn CloudProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Builds the registry from provider codes (e.g. `PROVIDERS=mock`).
    /// Codes for providers not compiled in are rejected.
    pub fn from_codes(codes: &[String], mock_catalog_file: Option<&str>) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        for code in codes {
            let provider = Self::build_provider(&code.to_lowercase(), mock_catalog_file)?;
            registry.register(provider);
        }
        if registry.providers.is_empty() {
            anyhow::bail!("no provider configured");
        }
        Ok(registry)
    }

    #[cfg_attr(not(feature = "provider-mock"), allow(unused_variables))]
    fn build_provider(
        code: &str,
        mock_catalog_file: Option<&str>,
    ) -> anyhow::Result<Arc<dyn CloudProvider>> {
        match code {
            #[cfg(feature = "provider-mock")]
            "mock" => {
                use instancer_providers::mock::MockProvider;

                // Prefer a catalog file (dev setups), fallback to the built-in demo zones.
                match mock_catalog_file {
                    Some(path) => Ok(Arc::new(MockProvider::new("mock", load_catalogs(path)?))),
                    None => Ok(Arc::new(MockProvider::demo("mock"))),
                }
            }
            // Add other providers here:
            // "aws" => ...
            other => anyhow::bail!("unknown or disabled provider '{other}'"),
        }
    }

    pub fn get(&self, code: &str) -> Option<Arc<dyn CloudProvider>> {
        self.providers.get(code).cloned()
    }

    pub fn providers(&self) -> impl Iterator<Item = &Arc<dyn CloudProvider>> {
        self.providers.values()
    }

    /// The provider serving `zone`. `NotFound` when no provider knows it.
    pub async fn for_zone(&self, zone: &str) -> Result<Arc<dyn CloudProvider>, ProviderError> {
        for provider in self.providers.values() {
            let zones = provider.zones().list().await?;
            if zones.iter().any(|z| z.name == zone) {
                return Ok(provider.clone());
            }
        }
        Err(ProviderError::NotFound(format!("unknown zone '{zone}'")))
    }

    /// Zones of every provider, in provider then zone order.
    pub async fn list_zones(&self) -> Result<Vec<Zone>, ProviderError> {
        let mut out = Vec::new();
        for provider in self.providers.values() {
            out.extend(provider.zones().list().await?);
        }
        Ok(out)
    }
}

/// Reads a JSON `{ "zone": [InstanceType, ...] }` catalog file.
pub fn load_catalogs(path: &str) -> anyhow::Result<ZoneCatalogs> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    ZoneCatalogs::from_json(&raw).with_context(|| format!("parsing {path}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use instancer_providers::mock::MockProvider;

    #[tokio::test]
    async fn resolves_provider_by_zone() {
        let registry = ProviderRegistry::new()
            .with(Arc::new(MockProvider::demo("alpha")))
            .with(Arc::new(MockProvider::new("beta", Default::default())));

        let p = registry.for_zone("mock-z2").await.unwrap();
        assert_eq!(p.name(), "alpha");
        assert!(registry
            .for_zone("nowhere")
            .await
            .err()
            .is_some_and(|e| e.is_not_found()));

        let zones = registry.list_zones().await.unwrap();
        assert_eq!(
            zones.iter().map(|z| z.name.as_str()).collect::<Vec<_>>(),
            vec!["mock-z1", "mock-z2"]
        );
        assert!(zones[0].available_gpu_kinds.contains("nvidia-t4"));
    }

    #[test]
    fn unknown_codes_are_rejected() {
        assert!(ProviderRegistry::from_codes(&["nope".to_string()], None).is_err());
        assert!(ProviderRegistry::from_codes(&[], None).is_err());
    }

    #[test]
    fn catalog_file_is_loaded() {
        let path = std::env::temp_dir().join(format!("catalog-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"{"dev-z1": [{"name": "small", "cpu_count": 1, "memory_mib": 2048,
                "architecture": "x86_64", "provider_id": "dev/small"}]}"#,
        )
        .unwrap();
        let catalogs = load_catalogs(path.to_str().unwrap()).unwrap();
        assert_eq!(catalogs.zone_names().collect::<Vec<_>>(), vec!["dev-z1"]);
        std::fs::remove_file(&path).unwrap();

        assert!(load_catalogs("/nonexistent/catalog.json").is_err());
    }
}
