use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use instancer_orchestrator::admin::{self, AdminState};
use instancer_orchestrator::garbage_collector::{self, GarbageCollector};
use instancer_orchestrator::health_check::HttpHealthProbe;
use instancer_orchestrator::lifecycle_events::RedisEventPublisher;
use instancer_orchestrator::locks::InstanceLocks;
use instancer_orchestrator::provider_manager::ProviderRegistry;
use instancer_orchestrator::settings::OrchestratorSettings;
use instancer_orchestrator::store::{InstanceStore, PgInstanceStore};
use instancer_orchestrator::supervisor::TaskSupervisor;
use instancer_orchestrator::templates::{StaticTemplates, TemplateSource};
use instancer_orchestrator::{Orchestrator, ServiceContext, WorkflowTimeouts};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let settings = OrchestratorSettings::from_env()?;

    // Connect to Postgres
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&settings.database_url)
        .await
        .context("Failed to connect to Postgres")?;

    // Check connection
    sqlx::query("SELECT 1").execute(&pool).await?;
    tracing::info!("connected to database");

    // Run migrations (source of truth is sqlx-migrations at workspace root)
    sqlx::migrate!("../sqlx-migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let redis_client =
        redis::Client::open(settings.redis_url.clone()).context("Invalid REDIS_URL")?;

    let store: Arc<dyn InstanceStore> = Arc::new(PgInstanceStore::new(pool));
    let providers = Arc::new(ProviderRegistry::from_codes(
        &settings.providers,
        settings.mock_catalog_file.as_deref(),
    )?);
    let templates: Arc<dyn TemplateSource> = match &settings.templates_file {
        Some(path) => Arc::new(
            StaticTemplates::from_file(path).with_context(|| format!("loading {path}"))?,
        ),
        None => {
            tracing::warn!("TEMPLATES_FILE not set; every create will be rejected");
            Arc::new(StaticTemplates::new())
        }
    };

    let locks = InstanceLocks::new();
    let supervisor = TaskSupervisor::new();
    let ctx = ServiceContext {
        store: store.clone(),
        providers: providers.clone(),
        publisher: Arc::new(RedisEventPublisher::new(redis_client)),
        probe: Arc::new(HttpHealthProbe::new(settings.health_check_port)?),
        locks: locks.clone(),
        timeouts: WorkflowTimeouts {
            creation: settings.creation_timeout,
            shutdown: settings.shutdown_timeout,
            health_initial_interval: settings.health_check_initial_interval,
            health_max_interval: settings.health_check_max_interval,
        },
    };
    let orchestrator = Arc::new(Orchestrator::new(ctx, templates, supervisor.clone()));

    // job-garbage-collector (one collector per provider)
    let collectors: Arc<Vec<GarbageCollector>> = Arc::new(
        providers
            .providers()
            .map(|p| {
                GarbageCollector::new(store.clone(), p.clone(), locks.clone(), settings.gc_stale_after)
            })
            .collect(),
    );
    tokio::spawn(garbage_collector::run(
        collectors.clone(),
        settings.gc_interval,
        supervisor.shutdown_signal(),
    ));

    // Admin API (internal health/debug only)
    let app = admin::router(AdminState {
        orchestrator,
        collectors,
    });
    let addr: SocketAddr = settings
        .admin_addr
        .parse()
        .with_context(|| format!("Invalid ADMIN_ADDR '{}'", settings.admin_addr))?;
    tracing::info!(%addr, providers = ?settings.providers, "orchestrator listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    supervisor.shutdown(settings.drain_timeout).await;
    tracing::info!("orchestrator stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
