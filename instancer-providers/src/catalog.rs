//! Per-zone machine class catalogs and best-fit selection.

use std::collections::{BTreeMap, BTreeSet};

use instancer_common::{Architecture, Gpu, Resources};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ProviderError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceType {
    pub name: String,
    pub cpu_count: i32,
    pub memory_mib: i64,
    #[serde(default)]
    pub gpu: Option<Gpu>,
    pub architecture: Architecture,
    /// Backend identifier for this class (AMI family, machine type URL, ...).
    pub provider_id: String,
}

impl InstanceType {
    pub fn resources(&self) -> Resources {
        Resources {
            cpu_count: self.cpu_count,
            memory_mib: self.memory_mib,
            gpu: self.gpu.clone(),
        }
    }

    /// Ranking heuristic, not a real price: 7.5/cpu + 1/GiB + 375/gpu.
    pub fn artificial_price(&self) -> f64 {
        let gpus = self.gpu.as_ref().map_or(0, |g| g.count);
        7.5 * f64::from(self.cpu_count) + self.memory_mib as f64 / 1024.0 + 375.0 * f64::from(gpus)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("duplicate instance type '{name}'")]
    DuplicateType { name: String },
    #[error("unknown instance type '{name}'")]
    UnknownType { name: String },
    #[error("no instance type covers the requested resources")]
    NoMatch,
    #[error("unknown zone '{zone}'")]
    UnknownZone { zone: String },
    #[error("invalid catalog: {0}")]
    Invalid(String),
}

impl From<CatalogError> for ProviderError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::DuplicateType { .. } | CatalogError::Invalid(_) => {
                ProviderError::Fatal(err.to_string())
            }
            _ => ProviderError::NotFound(err.to_string()),
        }
    }
}

/// Immutable set of machine classes offered in one zone.
#[derive(Clone, Debug, Default)]
pub struct InstanceTypeManager {
    // Keyed by name so iteration (and therefore tie-breaking) is stable.
    types: BTreeMap<String, InstanceType>,
}

impl InstanceTypeManager {
    pub fn new(types: impl IntoIterator<Item = InstanceType>) -> Result<Self, CatalogError> {
        let mut by_name = BTreeMap::new();
        for it in types {
            if by_name.contains_key(&it.name) {
                return Err(CatalogError::DuplicateType { name: it.name });
            }
            by_name.insert(it.name.clone(), it);
        }
        Ok(Self { types: by_name })
    }

    pub fn get(&self, name: &str) -> Result<&InstanceType, CatalogError> {
        self.types.get(name).ok_or_else(|| CatalogError::UnknownType {
            name: name.to_string(),
        })
    }

    pub fn gpu_kinds(&self) -> BTreeSet<String> {
        self.types
            .values()
            .filter_map(|it| it.gpu.as_ref().map(|g| g.kind.clone()))
            .collect()
    }

    pub fn types(&self) -> impl Iterator<Item = &InstanceType> {
        self.types.values()
    }

    /// Cheapest covering type. Equal prices resolve to the smallest name.
    pub fn find_best_fit(
        &self,
        required: &Resources,
        architecture: Architecture,
    ) -> Result<&InstanceType, CatalogError> {
        let mut best: Option<(&InstanceType, f64)> = None;
        for it in self.types.values() {
            if it.architecture != architecture || !it.resources().covers(required) {
                continue;
            }
            let price = it.artificial_price();
            match best {
                Some((_, best_price)) if price >= best_price => {}
                _ => best = Some((it, price)),
            }
        }
        best.map(|(it, _)| it).ok_or(CatalogError::NoMatch)
    }
}

/// Catalogs for every zone a provider serves, built once at provider setup.
#[derive(Clone, Debug, Default)]
pub struct ZoneCatalogs {
    zones: BTreeMap<String, InstanceTypeManager>,
}

impl ZoneCatalogs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_zone(mut self, zone: impl Into<String>, manager: InstanceTypeManager) -> Self {
        self.zones.insert(zone.into(), manager);
        self
    }

    /// Parses `{ "zone": [ InstanceType, ... ], ... }`.
    pub fn from_json(raw: &str) -> Result<Self, CatalogError> {
        let parsed: BTreeMap<String, Vec<InstanceType>> =
            serde_json::from_str(raw).map_err(|e| CatalogError::Invalid(e.to_string()))?;
        let mut out = Self::new();
        for (zone, types) in parsed {
            out = out.with_zone(zone, InstanceTypeManager::new(types)?);
        }
        Ok(out)
    }

    pub fn zone(&self, zone: &str) -> Result<&InstanceTypeManager, CatalogError> {
        self.zones.get(zone).ok_or_else(|| CatalogError::UnknownZone {
            zone: zone.to_string(),
        })
    }

    pub fn zone_names(&self) -> impl Iterator<Item = &str> {
        self.zones.keys().map(String::as_str)
    }

    pub fn find(
        &self,
        zone: &str,
        required: &Resources,
        architecture: Architecture,
    ) -> Result<InstanceType, CatalogError> {
        self.zone(zone)?
            .find_best_fit(required, architecture)
            .cloned()
    }
}
