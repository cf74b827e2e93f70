//! Core application

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;

use crate::api::ApiServer;
use crate::cluster::ClusterBridge;
use crate::core::cli;
use crate::core::config::AppConfig;
use crate::core::constants::{APP_NAME_LOWER, ENV_LOG};
use crate::core::shutdown::ShutdownService;
use crate::gateway::{
    BroadcastEngine, ConnectRateLimiter, ConnectionSupervisor, ConnectionTable, ConnectionView,
    SessionRegistry, StreamConsumerManager, SubscriptionRegistry,
};
use crate::store::StoreService;

pub struct CoreApp {
    pub config: AppConfig,
    pub store: Arc<StoreService>,
    pub sessions: Arc<SessionRegistry>,
    pub engine: Arc<BroadcastEngine>,
    pub supervisor: Arc<ConnectionSupervisor>,
    pub cluster: Option<Arc<ClusterBridge>>,
    pub shutdown: ShutdownService,
    pub started_at: Instant,
}

impl CoreApp {
    /// Run the application with CLI argument parsing
    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        Self::init_logging();

        tracing::debug!("Application starting");

        let cli = cli::parse();
        let app = Self::init(AppConfig::load(&cli)).await?;
        Self::start_server(app).await
    }

    /// Wire the gateway: store → registries → consumer manager → engine →
    /// supervisor
    pub async fn init(config: AppConfig) -> Result<Self> {
        let store = Arc::new(
            StoreService::new(&config.store)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to initialize store: {}", e))?,
        );
        tracing::debug!(backend = store.backend_name(), "Store initialized");

        let worker_id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(%worker_id, workers = config.gateway.workers, "Worker identity");

        let table = Arc::new(ConnectionTable::new());
        let sessions = Arc::new(SessionRegistry::new(store.clone()));
        let subscriptions = Arc::new(SubscriptionRegistry::new(store.clone()));
        let consumers = Arc::new(StreamConsumerManager::new(store.clone(), &worker_id));

        let engine = Arc::new(BroadcastEngine::new(
            store.clone(),
            consumers,
            subscriptions,
            table.clone() as Arc<dyn ConnectionView>,
        ));

        let cluster = Some(Arc::new(ClusterBridge::new(
            store.clone(),
            table.clone(),
            &worker_id,
        )));

        let supervisor = Arc::new(ConnectionSupervisor::new(
            config.gateway.clone(),
            table,
            sessions.clone(),
            engine.clone(),
            ConnectRateLimiter::new(store.clone()),
            cluster.clone(),
        ));

        let shutdown = ShutdownService::new(supervisor.clone(), store.clone());

        Ok(Self {
            config,
            store,
            sessions,
            engine,
            supervisor,
            cluster,
            shutdown,
            started_at: Instant::now(),
        })
    }

    fn init_logging() {
        let default_filter = format!("info,{}=info", APP_NAME_LOWER);

        let filter = std::env::var(ENV_LOG)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or(default_filter);

        tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(false)
            .with_level(true)
            .with_ansi(true)
            .compact()
            .with_env_filter(filter)
            .init();
    }

    async fn start_server(app: Self) -> Result<()> {
        // Wire signal handlers before anything can block
        app.shutdown.hook_signals();

        app.start_background_tasks().await;

        let server = ApiServer::new(app);
        let app = server.start().await?;
        app.shutdown.shutdown().await;

        Ok(())
    }

    /// Start the poll tick, heartbeat, sweeps, and cluster bridge
    pub async fn start_background_tasks(&self) {
        self.shutdown
            .track(self.engine.start_poll_task(self.shutdown.signal_rx()))
            .await;

        self.shutdown
            .track(
                self.supervisor
                    .start_heartbeat_task(self.shutdown.signal_rx()),
            )
            .await;

        self.shutdown
            .track(
                self.engine
                    .consumers()
                    .start_sweep_task(self.shutdown.signal_rx()),
            )
            .await;

        self.shutdown
            .track(self.sessions.start_sweep_task(self.shutdown.signal_rx()))
            .await;

        if let Some(cluster) = &self.cluster {
            for handle in cluster.start(self.shutdown.signal_rx()).await {
                self.shutdown.track(handle).await;
            }
        }

        tracing::debug!("Background tasks started");
    }
}
