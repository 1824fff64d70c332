mod providers;

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use careflow_core::config::CoreConfig;
use careflow_core::registry::EventTypeRegistry;
use careflow_engine::{
    ActivityRegistry, Engine, EventEmitter, PostgresEngineStore, WorkerPool, WorkerPoolConfig,
    WorkflowExecutor, WorkflowStarter,
};
use careflow_store::{
    EventStore, NotifyBus, PgNotifyBus, PostgresEventStore, MIGRATOR,
};
use careflow_trigger::{BacklogReprocessor, TriggerListener, TriggerProcessor};

use providers::{LogOnlyDns, LogOnlyMailer};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "careflow_worker=info,careflow_engine=info,careflow_trigger=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("careflow-worker starting");

    let config = CoreConfig::from_env();
    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL environment variable required")?;

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&database_url)
        .await
        .context("failed to connect to PostgreSQL")?;
    MIGRATOR.run(&pool).await.context("migrations failed")?;
    tracing::info!("database ready");

    let registry = Arc::new(EventTypeRegistry::standard());
    let bus: Arc<dyn NotifyBus> = Arc::new(PgNotifyBus::new(pool.clone()));

    let event_store = Arc::new(
        PostgresEventStore::new(pool.clone(), Arc::clone(&registry))
            .with_bus(Arc::clone(&bus))
            .with_workflow_channel(config.listener.channel_name.clone()),
    );
    let engine_store = Arc::new(PostgresEngineStore::new(pool.clone()));

    // Engine: workflows, activities, providers.
    let mut executor = WorkflowExecutor::new(Arc::clone(&engine_store));
    let mut activities = ActivityRegistry::new();
    careflow_onboarding::register(
        &mut executor,
        &mut activities,
        Arc::new(LogOnlyDns),
        Arc::new(LogOnlyMailer),
    );
    let executor = Arc::new(executor);

    let emitter = Arc::new(EventEmitter::new(
        Arc::clone(&event_store) as Arc<dyn EventStore>
    ));
    let engine = Arc::new(Engine::new(
        Arc::clone(&executor),
        config.workflow_defaults.clone(),
    ));

    // Activity worker pool.
    let worker_pool = Arc::new(
        WorkerPool::new(
            Arc::clone(&engine_store),
            Arc::clone(&executor),
            Arc::new(activities),
            WorkerPoolConfig::new(vec![
                careflow_onboarding::TASK_QUEUE.to_string(),
                config.workflow_defaults.task_queue.clone(),
            ])
            .with_max_concurrency(config.worker.max_concurrency)
            .with_poll_interval(config.worker.poll_interval)
            .with_shutdown_timeout(config.worker.shutdown_timeout),
        )
        .with_emitter(emitter),
    );
    worker_pool.start()?;

    // Trigger bridge: listener plus periodic backlog sweeps.
    let processor = Arc::new(TriggerProcessor::new(
        Arc::clone(&event_store) as Arc<dyn EventStore>,
        Arc::clone(&engine) as Arc<dyn WorkflowStarter>,
        Arc::clone(&registry),
    ));
    let backlog = Arc::new(BacklogReprocessor::new(
        Arc::clone(&processor),
        config.backlog.clone(),
    ));
    let listener = Arc::new(TriggerListener::new(
        processor,
        Arc::clone(&backlog),
        bus,
        config.listener.clone(),
    ));

    let listener_handle = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move { listener.run().await })
    };

    let (backlog_shutdown_tx, backlog_shutdown_rx) = tokio::sync::watch::channel(false);
    let backlog_handle = {
        let backlog = Arc::clone(&backlog);
        tokio::spawn(async move { backlog.run_loop(backlog_shutdown_rx).await })
    };

    tracing::info!("careflow-worker ready");
    shutdown_signal().await;
    tracing::info!("shutdown signal received");

    // Stop intake first, let in-flight work drain, then stop the pool.
    listener.shutdown();
    let _ = backlog_shutdown_tx.send(true);
    let _ = listener_handle.await;
    let _ = backlog_handle.await;

    if let Err(e) = worker_pool.shutdown().await {
        tracing::warn!("worker pool shutdown: {e}");
    }

    tracing::info!("careflow-worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
