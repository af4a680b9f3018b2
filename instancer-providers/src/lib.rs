use async_trait::async_trait;
use instancer_common::{Architecture, Resources};
use thiserror::Error;

pub mod catalog;

pub use catalog::{CatalogError, InstanceType, InstanceTypeManager, ZoneCatalogs};

/// Errors surfaced by provider implementations.
///
/// - `Client`: the request itself is invalid; retrying it unchanged will not help.
/// - `Api`: the backend failed, possibly transiently.
/// - `Fatal`: an internal invariant broke (e.g. an unparseable backend response).
/// - `NotFound`: the addressed zone, type or instance does not exist.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("invalid request: {0}")]
    Client(String),
    #[error("provider api error: {0}")]
    Api(String),
    #[error("fatal provider error: {0}")]
    Fatal(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// A cloud backend: one implementation per provider, exposing the zone and
/// instance capabilities the orchestrator relies on.
pub trait CloudProvider: Send + Sync {
    /// Provider code stored on every instance record (e.g. "aws", "gcp", "mock").
    fn name(&self) -> &str;
    fn zones(&self) -> &dyn Zones;
    fn instances(&self) -> &dyn Instances;
}

#[async_trait]
pub trait Zones: Send + Sync {
    async fn list(&self) -> ProviderResult<Vec<inventory::Zone>>;
}

#[async_trait]
pub trait Instances: Send + Sync {
    /// Cheapest machine class in `zone` covering `resources` for `architecture`.
    fn find(
        &self,
        zone: &str,
        resources: &Resources,
        architecture: Architecture,
    ) -> ProviderResult<InstanceType>;

    /// Starts creating an instance; the returned promise resolves once it boots.
    async fn create(
        &self,
        reference: &inventory::InstanceRef,
        spec: &inventory::CreateSpec,
    ) -> ProviderResult<Box<dyn InstancePromise>>;

    async fn get(&self, reference: &inventory::InstanceRef)
        -> ProviderResult<inventory::ProviderInstance>;

    /// Full enumeration of provider-side instances managed by this system.
    async fn list(&self) -> ProviderResult<Vec<inventory::ProviderInstance>>;

    /// Deletes an instance. `ProviderError::NotFound` when it is already gone.
    async fn delete(&self, reference: &inventory::InstanceRef) -> ProviderResult<()>;
}

/// Handle on a creation in flight.
#[async_trait]
pub trait InstancePromise: Send {
    /// Waits (with the backend's own polling) until the instance is booting.
    /// Callers bound this with their own deadline.
    async fn wait(self: Box<Self>) -> ProviderResult<inventory::ProviderInstance>;
}

pub mod inventory {
    use std::collections::{BTreeMap, BTreeSet};

    use instancer_common::DiskSpec;
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    use crate::InstanceType;

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Zone {
        pub name: String,
        pub provider: String,
        pub available_gpu_kinds: BTreeSet<String>,
    }

    /// Addresses an instance on a backend. The caller-assigned id doubles as
    /// the provider-side instance name.
    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    pub struct InstanceRef {
        pub id: Uuid,
        pub zone: String,
    }

    impl InstanceRef {
        pub fn new(id: Uuid, zone: impl Into<String>) -> Self {
            Self {
                id,
                zone: zone.into(),
            }
        }
    }

    #[derive(Clone, Debug, PartialEq)]
    pub struct CreateSpec {
        pub instance_type: InstanceType,
        pub boot_image: String,
        pub boot_disk_gib: i64,
        pub disks: Vec<DiskSpec>,
        pub metadata: BTreeMap<String, String>,
        pub labels: BTreeMap<String, String>,
        pub is_spot: bool,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct ProviderInstance {
        pub id: Uuid,
        pub zone: String,
        pub instance_type: String,
        pub hostname: String,
        pub internal_ip: Option<String>,
        pub external_ip: Option<String>,
        pub cpu_platform: Option<String>,
    }
}

#[cfg(feature = "mock")]
pub mod mock;
