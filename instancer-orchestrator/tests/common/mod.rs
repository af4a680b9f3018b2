// Common test utilities and fixtures
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, Pool, Postgres};
use tokio::sync::OnceCell;
use uuid::Uuid;

use instancer_common::{Architecture, DiskClass, DiskSpec, Instance};
use instancer_orchestrator::garbage_collector::GarbageCollector;
use instancer_orchestrator::health_check::ScriptedProbe;
use instancer_orchestrator::lifecycle_events::RecordingPublisher;
use instancer_orchestrator::locks::InstanceLocks;
use instancer_orchestrator::provider_manager::ProviderRegistry;
use instancer_orchestrator::store::MemoryInstanceStore;
use instancer_orchestrator::supervisor::TaskSupervisor;
use instancer_orchestrator::templates::{DeploymentTemplate, MemoryReservation, StaticTemplates};
use instancer_orchestrator::{
    CreateInstanceRequest, Orchestrator, ServiceContext, WorkflowTimeouts,
};
use instancer_providers::inventory::InstanceRef;
use instancer_providers::mock::MockProvider;
use instancer_providers::{InstanceType, InstanceTypeManager, ZoneCatalogs};

pub const ZONE: &str = "z1";
pub const PROVIDER: &str = "mock";

static TEST_DB_POOL: OnceCell<Option<Pool<Postgres>>> = OnceCell::const_new();

/// Shared Postgres pool when TEST_DATABASE_URL is set; `None` skips DB-backed tests.
pub async fn get_test_db_pool() -> Option<Pool<Postgres>> {
    TEST_DB_POOL
        .get_or_init(|| async {
            let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
            let pool = PgPoolOptions::new()
                .max_connections(20)
                .connect(&database_url)
                .await
                .expect("Failed to create test database pool");
            sqlx::migrate!("../sqlx-migrations")
                .run(&pool)
                .await
                .expect("Failed to run migrations on test database");
            Some(pool)
        })
        .await
        .clone()
}

fn instance_type(name: &str, cpu: i32, mem: i64) -> InstanceType {
    InstanceType {
        name: name.to_string(),
        cpu_count: cpu,
        memory_mib: mem,
        gpu: None,
        architecture: Architecture::X86_64,
        provider_id: format!("{ZONE}/{name}"),
    }
}

/// Zone `z1` with A:(1 cpu, 4096 MiB) and B:(2 cpu, 8192 MiB).
pub fn catalogs() -> ZoneCatalogs {
    let manager = InstanceTypeManager::new(vec![
        instance_type("A", 1, 4096),
        instance_type("B", 2, 8192),
    ])
    .expect("valid catalog");
    ZoneCatalogs::new().with_zone(ZONE, manager)
}

pub fn web_template() -> DeploymentTemplate {
    DeploymentTemplate {
        boot_image: "images/web-v1".to_string(),
        architecture: Architecture::X86_64,
        boot_disk_gib: 20,
        disks: vec![DiskSpec {
            class: DiskClass::PersistentSsd,
            size_gib: 50,
        }],
        metadata: Default::default(),
        memory_reservation: MemoryReservation::default(),
    }
}

pub fn fast_timeouts() -> WorkflowTimeouts {
    WorkflowTimeouts {
        creation: Duration::from_secs(2),
        shutdown: Duration::from_secs(2),
        health_initial_interval: Duration::from_millis(5),
        health_max_interval: Duration::from_millis(20),
    }
}

pub struct Harness {
    pub store: Arc<MemoryInstanceStore>,
    pub provider: Arc<MockProvider>,
    pub publisher: Arc<RecordingPublisher>,
    pub probe: Arc<ScriptedProbe>,
    pub locks: InstanceLocks,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_timeouts(fast_timeouts())
    }

    pub fn with_timeouts(timeouts: WorkflowTimeouts) -> Self {
        let store = Arc::new(MemoryInstanceStore::new());
        let provider = Arc::new(MockProvider::new(PROVIDER, catalogs()));
        let publisher = Arc::new(RecordingPublisher::new());
        let probe = Arc::new(ScriptedProbe::always_serving());
        let locks = InstanceLocks::new();

        let templates = StaticTemplates::new()
            .with("web", web_template())
            .with(
                "heavy",
                DeploymentTemplate {
                    memory_reservation: MemoryReservation {
                        fixed_mib: 2048,
                        percent: 0,
                    },
                    ..web_template()
                },
            );

        let ctx = ServiceContext {
            store: store.clone(),
            providers: Arc::new(ProviderRegistry::new().with(provider.clone())),
            publisher: publisher.clone(),
            probe: probe.clone(),
            locks: locks.clone(),
            timeouts,
        };
        let orchestrator = Orchestrator::new(ctx, Arc::new(templates), TaskSupervisor::new());

        Self {
            store,
            provider,
            publisher,
            probe,
            locks,
            orchestrator,
        }
    }

    pub fn collector(&self) -> GarbageCollector {
        GarbageCollector::new(
            self.store.clone(),
            self.provider.clone(),
            self.locks.clone(),
            Duration::from_secs(15 * 60),
        )
    }

    /// Waits for every detached workflow to finish.
    pub async fn settle(&self) {
        tokio::time::timeout(
            Duration::from_secs(5),
            self.orchestrator.supervisor().wait_idle(),
        )
        .await
        .expect("supervision tasks did not finish");
    }

    pub async fn record(&self, id: Uuid) -> Instance {
        use instancer_orchestrator::store::InstanceStore;
        self.store
            .get(id)
            .await
            .expect("store get")
            .expect("record exists")
    }
}

pub fn create_request(cpu: i32, memory_mib: i64) -> CreateInstanceRequest {
    CreateInstanceRequest {
        id: Uuid::new_v4(),
        owner: "alice".to_string(),
        component: "web".to_string(),
        cpu_count: cpu,
        memory_mib,
        gpu: None,
        zone: ZONE.to_string(),
        is_spot: false,
    }
}

/// A record as the creation workflow would persist it, `created_at` set by the caller.
pub fn staged_record(created_at: DateTime<Utc>) -> Instance {
    Instance {
        id: Uuid::new_v4(),
        provider: PROVIDER.to_string(),
        zone: ZONE.to_string(),
        owner: "alice".to_string(),
        instance_type: "A".to_string(),
        is_spot: false,
        cpu_count_requested: 1,
        memory_requested_mib: 2048,
        memory_reserved_mib: 0,
        gpu_kind: None,
        gpu_count: None,
        boot_image: "images/web-v1".to_string(),
        boot_disk_gib: 20,
        local_ssd_gib: 0,
        persistent_ssd_gib: 50,
        persistent_hdd_gib: 0,
        hostname: None,
        cpu_platform: None,
        created_at,
        booted_at: None,
        started_at: None,
        deleted_at: None,
        is_deletion_triaged: false,
    }
}

pub fn reference(instance: &Instance) -> InstanceRef {
    InstanceRef::new(instance.id, instance.zone.clone())
}
