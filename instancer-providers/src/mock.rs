use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use instancer_common::{Architecture, Gpu, Resources};
use uuid::Uuid;

use crate::inventory::{CreateSpec, InstanceRef, ProviderInstance, Zone};
use crate::{
    CloudProvider, InstancePromise, InstanceType, InstanceTypeManager, Instances, ProviderError,
    ProviderResult, ZoneCatalogs, Zones,
};

/// In-memory backend used for local runs and tests. Instances live in a map;
/// failure knobs let callers script provider misbehaviour.
pub struct MockProvider {
    name: String,
    catalogs: ZoneCatalogs,
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    instances: BTreeMap<Uuid, ProviderInstance>,
    boot_delay: Duration,
    fail_create: Option<ProviderError>,
    fail_wait: Option<ProviderError>,
    fail_delete: Option<ProviderError>,
    fail_list: Option<ProviderError>,
    create_calls: usize,
    delete_calls: usize,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn hostname_for(reference: &InstanceRef) -> String {
    format!("{}.{}.mock.internal", reference.id, reference.zone)
}

impl MockProvider {
    pub fn new(name: impl Into<String>, catalogs: ZoneCatalogs) -> Self {
        Self {
            name: name.into(),
            catalogs,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Two zones with a small general purpose range and one GPU family.
    pub fn demo(name: impl Into<String>) -> Self {
        let types = |zone: &str| {
            let mk = |n: &str, cpu: i32, mem: i64, gpu: Option<Gpu>| InstanceType {
                name: n.to_string(),
                cpu_count: cpu,
                memory_mib: mem,
                gpu,
                architecture: Architecture::X86_64,
                provider_id: format!("{zone}/{n}"),
            };
            vec![
                mk("standard-1", 1, 4096, None),
                mk("standard-2", 2, 8192, None),
                mk("standard-4", 4, 16384, None),
                mk("highmem-4", 4, 32768, None),
                mk(
                    "gpu-t4-1",
                    4,
                    16384,
                    Some(Gpu {
                        kind: "nvidia-t4".to_string(),
                        count: 1,
                    }),
                ),
            ]
        };
        let mut catalogs = ZoneCatalogs::new();
        for zone in ["mock-z1", "mock-z2"] {
            // Names are unique by construction
            if let Ok(manager) = InstanceTypeManager::new(types(zone)) {
                catalogs = catalogs.with_zone(zone, manager);
            }
        }
        Self::new(name, catalogs)
    }

    pub fn set_boot_delay(&self, delay: Duration) {
        lock(&self.state).boot_delay = delay;
    }

    pub fn fail_creates(&self, err: Option<ProviderError>) {
        lock(&self.state).fail_create = err;
    }

    pub fn fail_waits(&self, err: Option<ProviderError>) {
        lock(&self.state).fail_wait = err;
    }

    pub fn fail_deletes(&self, err: Option<ProviderError>) {
        lock(&self.state).fail_delete = err;
    }

    pub fn fail_lists(&self, err: Option<ProviderError>) {
        lock(&self.state).fail_list = err;
    }

    /// Makes an instance exist provider-side without going through `create`.
    pub fn insert_instance(&self, reference: &InstanceRef, instance_type: &str) {
        let instance = ProviderInstance {
            id: reference.id,
            zone: reference.zone.clone(),
            instance_type: instance_type.to_string(),
            hostname: hostname_for(reference),
            internal_ip: Some("10.0.0.2".to_string()),
            external_ip: None,
            cpu_platform: Some("mock-cpu".to_string()),
        };
        lock(&self.state).instances.insert(reference.id, instance);
    }

    /// Simulates the backend dropping an instance behind our back (spot reclaim, manual delete).
    pub fn remove_instance(&self, id: Uuid) -> bool {
        lock(&self.state).instances.remove(&id).is_some()
    }

    pub fn has_instance(&self, id: Uuid) -> bool {
        lock(&self.state).instances.contains_key(&id)
    }

    pub fn instance_ids(&self) -> Vec<Uuid> {
        lock(&self.state).instances.keys().copied().collect()
    }

    pub fn create_calls(&self) -> usize {
        lock(&self.state).create_calls
    }

    pub fn delete_calls(&self) -> usize {
        lock(&self.state).delete_calls
    }
}

impl CloudProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn zones(&self) -> &dyn Zones {
        self
    }

    fn instances(&self) -> &dyn Instances {
        self
    }
}

#[async_trait]
impl Zones for MockProvider {
    async fn list(&self) -> ProviderResult<Vec<Zone>> {
        let mut out = Vec::new();
        for name in self.catalogs.zone_names() {
            let manager = self.catalogs.zone(name)?;
            out.push(Zone {
                name: name.to_string(),
                provider: self.name.clone(),
                available_gpu_kinds: manager.gpu_kinds(),
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl Instances for MockProvider {
    fn find(
        &self,
        zone: &str,
        resources: &Resources,
        architecture: Architecture,
    ) -> ProviderResult<InstanceType> {
        Ok(self.catalogs.find(zone, resources, architecture)?)
    }

    async fn create(
        &self,
        reference: &InstanceRef,
        spec: &CreateSpec,
    ) -> ProviderResult<Box<dyn InstancePromise>> {
        // Validates the type against the zone catalog, like a real backend would.
        self.catalogs
            .zone(&reference.zone)
            .map_err(|e| ProviderError::Client(e.to_string()))?
            .get(&spec.instance_type.name)
            .map_err(|e| ProviderError::Client(e.to_string()))?;

        let delay = {
            let mut state = lock(&self.state);
            state.create_calls += 1;
            if let Some(err) = state.fail_create.clone() {
                return Err(err);
            }
            if state.instances.contains_key(&reference.id) {
                return Err(ProviderError::Client(format!(
                    "instance {} already exists",
                    reference.id
                )));
            }
            state.boot_delay
        };
        self.insert_instance(reference, &spec.instance_type.name);

        Ok(Box::new(MockPromise {
            state: self.state.clone(),
            id: reference.id,
            delay,
        }))
    }

    async fn get(&self, reference: &InstanceRef) -> ProviderResult<ProviderInstance> {
        lock(&self.state)
            .instances
            .get(&reference.id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("instance {}", reference.id)))
    }

    async fn list(&self) -> ProviderResult<Vec<ProviderInstance>> {
        let state = lock(&self.state);
        if let Some(err) = state.fail_list.clone() {
            return Err(err);
        }
        Ok(state.instances.values().cloned().collect())
    }

    async fn delete(&self, reference: &InstanceRef) -> ProviderResult<()> {
        let mut state = lock(&self.state);
        state.delete_calls += 1;
        if let Some(err) = state.fail_delete.clone() {
            return Err(err);
        }
        match state.instances.remove(&reference.id) {
            Some(_) => Ok(()),
            None => Err(ProviderError::NotFound(format!("instance {}", reference.id))),
        }
    }
}

struct MockPromise {
    state: Arc<Mutex<MockState>>,
    id: Uuid,
    delay: Duration,
}

#[async_trait]
impl InstancePromise for MockPromise {
    async fn wait(self: Box<Self>) -> ProviderResult<ProviderInstance> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let state = lock(&self.state);
        if let Some(err) = state.fail_wait.clone() {
            return Err(err);
        }
        state
            .instances
            .get(&self.id)
            .cloned()
            .ok_or_else(|| ProviderError::Api(format!("instance {} vanished while booting", self.id)))
    }
}
