use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub mod bus;

/// Smallest memory request accepted at creation time.
pub const MIN_MEMORY_MIB: i64 = 1024;
/// Smallest boot disk accepted at creation time.
pub const MIN_BOOT_DISK_GIB: i64 = 10;

// --- Enums ---

/// Lifecycle status, derived from the record's timestamps (never stored).
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Requested, // Creation sent to provider, not booted yet
    Booting,   // Provider confirmed boot, waiting for health
    Running,   // Health check passed
    Deleted,   // Deletion recorded (provider side may still be pending)
}

impl InstanceStatus {
    pub const ALL: [InstanceStatus; 4] = [
        InstanceStatus::Requested,
        InstanceStatus::Booting,
        InstanceStatus::Running,
        InstanceStatus::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Requested => "requested",
            InstanceStatus::Booting => "booting",
            InstanceStatus::Running => "running",
            InstanceStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    #[serde(rename = "x86_64", alias = "amd64")]
    X86_64,
    #[serde(rename = "arm64", alias = "aarch64")]
    Arm64,
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::X86_64 => "x86_64",
            Architecture::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "x86_64" | "amd64" => Ok(Architecture::X86_64),
            "arm64" | "aarch64" => Ok(Architecture::Arm64),
            other => Err(format!("unknown architecture '{other}'")),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DiskClass {
    LocalSsd,
    PersistentSsd,
    PersistentHdd,
}

impl DiskClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskClass::LocalSsd => "local_ssd",
            DiskClass::PersistentSsd => "persistent_ssd",
            DiskClass::PersistentHdd => "persistent_hdd",
        }
    }
}

// --- Value types ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct Gpu {
    pub kind: String,
    pub count: i32,
}

/// CPU / memory / GPU amounts, used both for requests and for what a machine class offers.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Resources {
    pub cpu_count: i32,
    pub memory_mib: i64,
    pub gpu: Option<Gpu>,
}

impl Resources {
    /// True when `self` offers at least what `required` asks for.
    pub fn covers(&self, required: &Resources) -> bool {
        if self.cpu_count < required.cpu_count || self.memory_mib < required.memory_mib {
            return false;
        }
        match (&required.gpu, &self.gpu) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(req), Some(have)) => have.kind == req.kind && have.count >= req.count,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DiskSpec {
    pub class: DiskClass,
    pub size_gib: i64,
}

/// Configuration resolved for an instance, echoed to the caller and in `Created` events.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct InstanceConfig {
    pub provider: String,
    pub zone: String,
    pub instance_type: String,
    pub architecture: Architecture,
    pub boot_image: String,
    pub is_spot: bool,
}

// --- Entities (SQLx Mapped) ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, sqlx::FromRow)]
pub struct Instance {
    pub id: Uuid,
    pub provider: String,
    pub zone: String,
    pub owner: String,

    pub instance_type: String,
    pub is_spot: bool,
    pub cpu_count_requested: i32,
    pub memory_requested_mib: i64,
    pub memory_reserved_mib: i64,
    pub gpu_kind: Option<String>,
    pub gpu_count: Option<i32>,

    pub boot_image: String,
    pub boot_disk_gib: i64,
    pub local_ssd_gib: i64,
    pub persistent_ssd_gib: i64,
    pub persistent_hdd_gib: i64,

    // Output-only: filled in as the instance progresses
    pub hostname: Option<String>,
    pub cpu_platform: Option<String>,
    pub created_at: DateTime<Utc>,
    pub booted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub is_deletion_triaged: bool,
}

impl Instance {
    pub fn status(&self) -> InstanceStatus {
        if self.deleted_at.is_some() {
            InstanceStatus::Deleted
        } else if self.started_at.is_some() {
            InstanceStatus::Running
        } else if self.booted_at.is_some() {
            InstanceStatus::Booting
        } else {
            InstanceStatus::Requested
        }
    }

    /// Timestamp at which the record entered its current status.
    pub fn status_since(&self) -> DateTime<Utc> {
        match self.status() {
            InstanceStatus::Requested => self.created_at,
            InstanceStatus::Booting => self.booted_at.unwrap_or(self.created_at),
            InstanceStatus::Running => self.started_at.unwrap_or(self.created_at),
            InstanceStatus::Deleted => self.deleted_at.unwrap_or(self.created_at),
        }
    }

    pub fn gpu(&self) -> Option<Gpu> {
        match (&self.gpu_kind, self.gpu_count) {
            (Some(kind), Some(count)) => Some(Gpu {
                kind: kind.clone(),
                count,
            }),
            _ => None,
        }
    }

    pub fn disk_gib(&self, class: DiskClass) -> i64 {
        match class {
            DiskClass::LocalSsd => self.local_ssd_gib,
            DiskClass::PersistentSsd => self.persistent_ssd_gib,
            DiskClass::PersistentHdd => self.persistent_hdd_gib,
        }
    }

    /// Checks a freshly built record before it is persisted.
    pub fn validate_new(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("provider", &self.provider),
            ("zone", &self.zone),
            ("owner", &self.owner),
            ("instance_type", &self.instance_type),
            ("boot_image", &self.boot_image),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError::EmptyField(field));
            }
        }
        if self.cpu_count_requested < 1 {
            return Err(ValidationError::CpuCountTooLow(self.cpu_count_requested));
        }
        if self.memory_requested_mib < MIN_MEMORY_MIB {
            return Err(ValidationError::MemoryTooLow(self.memory_requested_mib));
        }
        if self.memory_reserved_mib < 0 {
            return Err(ValidationError::NegativeReservation(self.memory_reserved_mib));
        }
        match (&self.gpu_kind, self.gpu_count) {
            (None, None) => {}
            (Some(kind), Some(count)) => {
                if kind.trim().is_empty() {
                    return Err(ValidationError::EmptyField("gpu_kind"));
                }
                if count < 1 {
                    return Err(ValidationError::GpuCountTooLow(count));
                }
            }
            _ => return Err(ValidationError::InconsistentGpu),
        }
        if self.boot_disk_gib < MIN_BOOT_DISK_GIB {
            return Err(ValidationError::BootDiskTooSmall(self.boot_disk_gib));
        }
        for class in [
            DiskClass::LocalSsd,
            DiskClass::PersistentSsd,
            DiskClass::PersistentHdd,
        ] {
            let size = self.disk_gib(class);
            if size < 0 {
                return Err(ValidationError::NegativeDiskSize { class, size });
            }
        }
        if self.hostname.is_some() {
            return Err(ValidationError::OutputOnlyField("hostname"));
        }
        if self.cpu_platform.is_some() {
            return Err(ValidationError::OutputOnlyField("cpu_platform"));
        }
        if self.booted_at.is_some() {
            return Err(ValidationError::OutputOnlyField("booted_at"));
        }
        if self.started_at.is_some() {
            return Err(ValidationError::OutputOnlyField("started_at"));
        }
        if self.deleted_at.is_some() {
            return Err(ValidationError::OutputOnlyField("deleted_at"));
        }
        if self.is_deletion_triaged {
            return Err(ValidationError::OutputOnlyField("is_deletion_triaged"));
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing or empty field: {0}")]
    EmptyField(&'static str),
    #[error("cpu count must be at least 1, got {0}")]
    CpuCountTooLow(i32),
    #[error("memory must be at least {MIN_MEMORY_MIB} MiB, got {0}")]
    MemoryTooLow(i64),
    #[error("memory reservation must not be negative, got {0}")]
    NegativeReservation(i64),
    #[error("gpu kind and gpu count must be set together")]
    InconsistentGpu,
    #[error("gpu count must be at least 1, got {0}")]
    GpuCountTooLow(i32),
    #[error("boot disk must be at least {MIN_BOOT_DISK_GIB} GiB, got {0}")]
    BootDiskTooSmall(i64),
    #[error("{} disk size must not be negative, got {size}", .class.as_str())]
    NegativeDiskSize { class: DiskClass, size: i64 },
    #[error("output-only field {0} must not be set on creation")]
    OutputOnlyField(&'static str),
}
