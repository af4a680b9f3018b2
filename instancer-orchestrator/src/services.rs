use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use instancer_common::{DiskClass, Gpu, Instance, InstanceConfig, InstanceStatus, Resources};
use instancer_providers::inventory::{CreateSpec, InstanceRef, Zone};
use instancer_providers::ProviderError;

use crate::health_check::HealthProbe;
use crate::lifecycle_events::EventPublisher;
use crate::locks::InstanceLocks;
use crate::provider_manager::ProviderRegistry;
use crate::provisioning_job;
use crate::state_machine;
use crate::store::{InstanceFilter, InstanceStore, StoreError};
use crate::supervisor::TaskSupervisor;
use crate::templates::{TemplateError, TemplateSource};
use crate::terminator_job::{self, ShutdownTrigger};

/// `source` field of every lifecycle event this service publishes.
pub const EVENT_SOURCE: &str = "instancer-orchestrator";

/// Caller-facing outcomes of the synchronous operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no suitable machine type: {0}")]
    NoSuitableMachineType(String),
    #[error("instance {0} not found")]
    NotFound(Uuid),
    #[error("unknown failure: {0}")]
    Unknown(String),
}

impl OrchestratorError {
    /// True for errors caused by the request itself.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, OrchestratorError::Unknown(_))
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(e) => OrchestratorError::InvalidArgument(e.to_string()),
            StoreError::AlreadyExists { id } => {
                OrchestratorError::InvalidArgument(format!("instance {id} already exists"))
            }
            other => OrchestratorError::Unknown(other.to_string()),
        }
    }
}

/// Deadlines and health-check pacing of the background workflows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowTimeouts {
    pub creation: Duration,
    pub shutdown: Duration,
    pub health_initial_interval: Duration,
    pub health_max_interval: Duration,
}

impl Default for WorkflowTimeouts {
    fn default() -> Self {
        Self {
            creation: Duration::from_secs(15 * 60),
            shutdown: Duration::from_secs(10 * 60),
            health_initial_interval: Duration::from_secs(1),
            health_max_interval: Duration::from_secs(30),
        }
    }
}

/// Everything a workflow needs. Cheap to clone into background tasks.
#[derive(Clone)]
pub struct ServiceContext {
    pub store: Arc<dyn InstanceStore>,
    pub providers: Arc<ProviderRegistry>,
    pub publisher: Arc<dyn EventPublisher>,
    pub probe: Arc<dyn HealthProbe>,
    pub locks: InstanceLocks,
    pub timeouts: WorkflowTimeouts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateInstanceRequest {
    /// Caller-assigned; doubles as the provider-side instance name.
    pub id: Uuid,
    pub owner: String,
    pub component: String,
    pub cpu_count: i32,
    pub memory_mib: i64,
    pub gpu: Option<Gpu>,
    pub zone: String,
    pub is_spot: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateInstanceResponse {
    pub id: Uuid,
    pub config: InstanceConfig,
    pub resources: Resources,
}

/// What `list_instances` exposes of a running record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningInstanceSummary {
    pub id: Uuid,
    pub owner: String,
    pub provider: String,
    pub zone: String,
    pub instance_type: String,
    pub is_spot: bool,
    pub boot_image: String,
    pub resources: Resources,
    pub hostname: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

impl From<&Instance> for RunningInstanceSummary {
    fn from(i: &Instance) -> Self {
        Self {
            id: i.id,
            owner: i.owner.clone(),
            provider: i.provider.clone(),
            zone: i.zone.clone(),
            instance_type: i.instance_type.clone(),
            is_spot: i.is_spot,
            boot_image: i.boot_image.clone(),
            resources: Resources {
                cpu_count: i.cpu_count_requested,
                memory_mib: i.memory_requested_mib,
                gpu: i.gpu(),
            },
            hostname: i.hostname.clone(),
            started_at: i.started_at,
        }
    }
}

pub struct Orchestrator {
    ctx: ServiceContext,
    templates: Arc<dyn TemplateSource>,
    supervisor: TaskSupervisor,
}

impl Orchestrator {
    pub fn new(
        ctx: ServiceContext,
        templates: Arc<dyn TemplateSource>,
        supervisor: TaskSupervisor,
    ) -> Self {
        Self {
            ctx,
            templates,
            supervisor,
        }
    }

    pub fn context(&self) -> &ServiceContext {
        &self.ctx
    }

    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.supervisor
    }

    /// Resolves a machine class, starts the provider creation, persists the
    /// record and detaches the creation supervision. Returns without waiting
    /// for boot; later failures surface as lifecycle events.
    pub async fn create_instance(
        &self,
        req: CreateInstanceRequest,
    ) -> Result<CreateInstanceResponse, OrchestratorError> {
        if self.supervisor.is_shutting_down() {
            return Err(OrchestratorError::Unknown("service is shutting down".into()));
        }
        if self.ctx.store.get(req.id).await?.is_some() {
            return Err(OrchestratorError::InvalidArgument(format!(
                "instance {} already exists",
                req.id
            )));
        }

        // 1) Template + memory reservation
        let template = self.templates.resolve(&req.component).map_err(|e| match e {
            TemplateError::UnknownComponent(_) => OrchestratorError::InvalidArgument(e.to_string()),
            other => OrchestratorError::Unknown(other.to_string()),
        })?;
        let too_large = || {
            OrchestratorError::NoSuitableMachineType(format!(
                "memory request of {} MiB is too large",
                req.memory_mib
            ))
        };
        let memory_reserved_mib = template
            .memory_reservation
            .reserved_for(req.memory_mib)
            .ok_or_else(too_large)?;
        let required_memory_mib = req
            .memory_mib
            .checked_add(memory_reserved_mib)
            .ok_or_else(too_large)?;

        // 2) Machine class
        let provider = self.ctx.providers.for_zone(&req.zone).await.map_err(|e| match e {
            ProviderError::NotFound(_) => {
                OrchestratorError::InvalidArgument(format!("unknown zone '{}'", req.zone))
            }
            other => OrchestratorError::Unknown(other.to_string()),
        })?;
        let required = Resources {
            cpu_count: req.cpu_count,
            memory_mib: required_memory_mib,
            gpu: req.gpu.clone(),
        };
        let instance_type = provider
            .instances()
            .find(&req.zone, &required, template.architecture)
            .map_err(|e| OrchestratorError::NoSuitableMachineType(e.to_string()))?;

        let record = Instance {
            id: req.id,
            provider: provider.name().to_string(),
            zone: req.zone.clone(),
            owner: req.owner.clone(),
            instance_type: instance_type.name.clone(),
            is_spot: req.is_spot,
            cpu_count_requested: req.cpu_count,
            memory_requested_mib: req.memory_mib,
            memory_reserved_mib,
            gpu_kind: req.gpu.as_ref().map(|g| g.kind.clone()),
            gpu_count: req.gpu.as_ref().map(|g| g.count),
            boot_image: template.boot_image.clone(),
            boot_disk_gib: template.boot_disk_gib,
            local_ssd_gib: template.disk_gib(DiskClass::LocalSsd),
            persistent_ssd_gib: template.disk_gib(DiskClass::PersistentSsd),
            persistent_hdd_gib: template.disk_gib(DiskClass::PersistentHdd),
            hostname: None,
            cpu_platform: None,
            created_at: Utc::now(),
            booted_at: None,
            started_at: None,
            deleted_at: None,
            is_deletion_triaged: false,
        };
        // Invalid requests never reach the provider.
        record
            .validate_new()
            .map_err(|e| OrchestratorError::InvalidArgument(e.to_string()))?;

        // 3) Provider creation
        let mut metadata = template.metadata.clone();
        metadata.insert("instance-id".to_string(), req.id.to_string());
        let labels = BTreeMap::from([
            ("owner".to_string(), req.owner.clone()),
            ("component".to_string(), req.component.clone()),
        ]);
        let spec = CreateSpec {
            instance_type: instance_type.clone(),
            boot_image: template.boot_image.clone(),
            boot_disk_gib: template.boot_disk_gib,
            disks: template.disks.clone(),
            metadata,
            labels,
            is_spot: req.is_spot,
        };
        let reference = InstanceRef::new(req.id, req.zone.clone());
        let promise = match provider.instances().create(&reference, &spec).await {
            Ok(p) => p,
            Err(ProviderError::Client(msg)) => {
                return Err(OrchestratorError::InvalidArgument(msg));
            }
            Err(ProviderError::Fatal(msg)) => {
                tracing::error!(instance_id = %req.id, error = %msg, "fatal provider error on create");
                return Err(OrchestratorError::Unknown(msg));
            }
            Err(e) => return Err(OrchestratorError::Unknown(e.to_string())),
        };

        // 4) Persist. Without a record the collector cannot see the instance, so undo the create.
        if let Err(e) = self.ctx.store.insert(&record).await {
            tracing::error!(
                instance_id = %req.id,
                error = %e,
                "failed to persist instance record after provider create"
            );
            drop(promise);
            if let Err(delete_err) = provider.instances().delete(&reference).await {
                tracing::error!(
                    instance_id = %req.id,
                    error = %delete_err,
                    "failed to delete unrecorded instance on provider"
                );
            }
            return Err(e.into());
        }
        tracing::info!(
            instance_id = %req.id,
            owner = %req.owner,
            zone = %req.zone,
            instance_type = %instance_type.name,
            "instance requested"
        );

        let config = InstanceConfig {
            provider: record.provider.clone(),
            zone: record.zone.clone(),
            instance_type: instance_type.name.clone(),
            architecture: template.architecture,
            boot_image: template.boot_image,
            is_spot: req.is_spot,
        };
        let resources = Resources {
            cpu_count: req.cpu_count,
            memory_mib: req.memory_mib,
            gpu: req.gpu,
        };

        // 5) Detach supervision
        self.supervisor.spawn(
            "await_creation",
            provisioning_job::await_creation(
                self.ctx.clone(),
                record,
                promise,
                config.clone(),
                resources.clone(),
            ),
        );

        Ok(CreateInstanceResponse {
            id: req.id,
            config,
            resources,
        })
    }

    /// Running instances of `owner`, oldest first.
    pub async fn list_instances(
        &self,
        owner: &str,
    ) -> Result<Vec<RunningInstanceSummary>, OrchestratorError> {
        let filter = InstanceFilter::status(InstanceStatus::Running).owner(owner);
        let records = self.ctx.store.list(&filter).await?;
        Ok(records.iter().map(RunningInstanceSummary::from).collect())
    }

    /// Marks the record deleted, then detaches the provider-side deletion.
    pub async fn shutdown_instance(&self, id: Uuid) -> Result<(), OrchestratorError> {
        let instance = {
            let _guard = self.ctx.locks.lock(id).await;
            let Some(instance) = self.ctx.store.get(id).await? else {
                return Err(OrchestratorError::NotFound(id));
            };
            if instance.is_deletion_triaged {
                tracing::info!(instance_id = %id, "shutdown: already deleted and triaged");
                return Ok(());
            }
            state_machine::mark_deleted(self.ctx.store.as_ref(), id, "shutdown_requested").await?;
            instance
        };

        self.supervisor.spawn(
            "await_shutdown",
            terminator_job::await_shutdown(self.ctx.clone(), instance, ShutdownTrigger::Requested),
        );
        Ok(())
    }

    pub async fn list_zones(&self) -> Result<Vec<Zone>, OrchestratorError> {
        self.ctx
            .providers
            .list_zones()
            .await
            .map_err(|e| OrchestratorError::Unknown(e.to_string()))
    }
}
