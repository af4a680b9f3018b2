//! Instance lifecycle orchestration: creation and shutdown workflows over a
//! pluggable cloud provider, persisted instance records, lifecycle events on
//! the bus, and a garbage collector reconciling records with provider state.

pub mod admin;
pub mod garbage_collector;
pub mod health_check;
pub mod lifecycle_events;
pub mod locks;
pub mod provider_manager;
pub mod provisioning_job;
pub mod services;
pub mod settings;
pub mod state_machine;
pub mod store;
pub mod supervisor;
pub mod templates;
pub mod terminator_job;

pub use services::{
    CreateInstanceRequest, CreateInstanceResponse, Orchestrator, OrchestratorError,
    RunningInstanceSummary, ServiceContext, WorkflowTimeouts,
};
