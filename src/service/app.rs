//! Main application state and service coordination
//!
//! This module contains the production AppState that wires storage, the
//! managers, the scheduler and the event publisher together, seeds queues
//! from configuration and drives the periodic background loops.

use crate::amqp::connection::AmqpConnection;
use crate::amqp::publisher::{
    AmqpEventPublisher, EventPublisher, LogEventPublisher, PublisherConfig,
};
use crate::cache::{InMemoryMatchStateCache, MatchStateCache};
use crate::config::AppConfig;
use crate::matching::{GreedyGroupFormer, HttpCustomMatchmaker, MatchScheduler};
use crate::metrics::health::HealthServerConfig;
use crate::metrics::{HealthServer, MetricsCollector};
use crate::queue::{QueueDefinition, QueueRegistry};
use crate::session::SessionManager;
use crate::storage::InMemoryStore;
use crate::tenant::{StaticTenantResolver, TenantResolver};
use crate::ticket::TicketManager;
use crate::types::{GameId, TenantContext};
use crate::utils::{Clock, SystemClock};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// Service-level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("AMQP connection error: {message}")]
    AmqpConnection { message: String },

    #[error("Service initialization error: {message}")]
    Initialization { message: String },

    #[error("Background task error: {message}")]
    BackgroundTask { message: String },
}

/// Main application state containing all service components
pub struct AppState {
    /// Application configuration
    config: AppConfig,

    clock: Arc<dyn Clock>,
    tenants: Arc<dyn TenantResolver>,

    /// Core matchmaking components
    queues: Arc<QueueRegistry>,
    tickets: Arc<TicketManager>,
    sessions: Arc<SessionManager>,
    scheduler: Arc<MatchScheduler>,

    /// Broker connection, absent when AMQP is disabled
    amqp_connection: Option<Arc<AmqpConnection>>,

    metrics_collector: Arc<MetricsCollector>,
    health_server: Mutex<Option<Arc<HealthServer>>>,

    /// Background task handles
    background_tasks: Mutex<Vec<JoinHandle<()>>>,

    /// Service status
    is_running: Arc<RwLock<bool>>,
}

impl AppState {
    /// Initialize the application with all dependencies
    pub async fn new(config: AppConfig) -> Result<Self, ServiceError> {
        Self::with_clock(config, Arc::new(SystemClock)).await
    }

    /// Initialize with an explicit clock
    pub async fn with_clock(config: AppConfig, clock: Arc<dyn Clock>) -> Result<Self, ServiceError> {
        info!("Initializing matchforge service");
        info!(
            "Configuration: service={}, amqp_enabled={}, queues={}",
            config.service.name,
            config.amqp.enabled,
            config.queues.len()
        );

        crate::config::validate_config(&config).map_err(|e| ServiceError::Configuration {
            message: e.to_string(),
        })?;

        let metrics_collector =
            Arc::new(
                MetricsCollector::new().map_err(|e| ServiceError::Initialization {
                    message: format!("Failed to create metrics collector: {}", e),
                })?,
            );

        let (amqp_connection, event_publisher) = Self::initialize_publisher(&config).await?;

        let tenants = Arc::new(
            StaticTenantResolver::from_definitions(&config.tenants).map_err(|e| {
                ServiceError::Configuration {
                    message: format!("Invalid tenant table: {}", e),
                }
            })?,
        );

        let store = Arc::new(InMemoryStore::new());
        let cache: Arc<dyn MatchStateCache> = Arc::new(InMemoryMatchStateCache::new(clock.clone()));

        let queues = Arc::new(QueueRegistry::new(
            store.clone(),
            store.clone(),
            store.clone(),
            clock.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            store.clone(),
            store.clone(),
            cache,
            event_publisher,
            metrics_collector.clone(),
            clock.clone(),
            config.session_settings(),
        ));
        let tickets = Arc::new(TicketManager::new(
            store.clone(),
            queues.clone(),
            sessions.clone(),
            clock.clone(),
            metrics_collector.clone(),
        ));

        let custom_matchmaker = Arc::new(
            HttpCustomMatchmaker::new(config.custom_matchmaker_timeout()).map_err(|e| {
                ServiceError::Initialization {
                    message: format!("Failed to create custom matchmaker client: {}", e),
                }
            })?,
        );
        let scheduler = Arc::new(MatchScheduler::new(
            queues.clone(),
            store,
            sessions.clone(),
            Arc::new(GreedyGroupFormer::new()),
            custom_matchmaker,
            metrics_collector.clone(),
        ));

        let state = Self {
            config,
            clock,
            tenants,
            queues,
            tickets,
            sessions,
            scheduler,
            amqp_connection,
            metrics_collector,
            health_server: Mutex::new(None),
            background_tasks: Mutex::new(Vec::new()),
            is_running: Arc::new(RwLock::new(false)),
        };

        state.seed_queues().await?;
        Ok(state)
    }

    /// Connect to the broker when enabled, otherwise publish to the log
    async fn initialize_publisher(
        config: &AppConfig,
    ) -> Result<(Option<Arc<AmqpConnection>>, Arc<dyn EventPublisher>), ServiceError> {
        if !config.amqp.enabled {
            info!("AMQP disabled - events will only be logged");
            return Ok((None, Arc::new(LogEventPublisher)));
        }

        info!("Connecting to AMQP broker: {}", config.amqp.url);
        let amqp_config = config
            .amqp_config()
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to parse AMQP URL: {}", e),
            })?;

        let connection =
            AmqpConnection::new(amqp_config)
                .await
                .map_err(|e| ServiceError::AmqpConnection {
                    message: format!("Failed to connect to AMQP: {}", e),
                })?;

        let channel = connection
            .connection()
            .open_channel(None)
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to open AMQP channel: {}", e),
            })?;

        let publisher_config = PublisherConfig {
            exchange_name: config.amqp.exchange_name.clone(),
            max_retries: config.amqp.max_retry_attempts,
            retry_delay_ms: config.amqp.retry_delay_ms,
        };
        let publisher = AmqpEventPublisher::new(channel, publisher_config)
            .await
            .map_err(|e| ServiceError::Initialization {
                message: format!("Failed to initialize event publisher: {}", e),
            })?;

        Ok((Some(Arc::new(connection)), Arc::new(publisher)))
    }

    /// Register the queues declared in configuration, grouped by tenant
    async fn seed_queues(&self) -> Result<(), ServiceError> {
        let mut by_game: BTreeMap<&GameId, Vec<QueueDefinition>> = BTreeMap::new();
        for queue in &self.config.queues {
            by_game
                .entry(&queue.game_id)
                .or_default()
                .push(queue.definition.clone());
        }

        for (game_id, definitions) in by_game {
            let tenant = TenantContext::new(game_id.clone());
            let count = self
                .queues
                .apply_definitions(&tenant, &definitions)
                .await
                .map_err(|e| ServiceError::Initialization {
                    message: format!("Failed to seed queues for {}: {}", game_id, e),
                })?;
            info!(game_id = %game_id, queues = count, "Seeded queues from configuration");
        }
        Ok(())
    }

    /// Start the health server and background loops
    pub async fn start(self: &Arc<Self>) -> Result<(), ServiceError> {
        info!("Starting matchforge service");

        // Mark as running
        *self.is_running.write().await = true;

        self.start_health_server().await?;
        self.start_background_tasks().await;

        self.metrics_collector.update_health_status(2);
        info!("✅ Matchforge service started successfully");
        Ok(())
    }

    /// Perform graceful shutdown
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        info!("Starting graceful shutdown of matchforge service");

        // Mark as not running
        *self.is_running.write().await = false;

        self.stop_background_tasks().await;

        if let Some(server) = self.health_server.lock().await.take() {
            if let Err(e) = server.stop().await {
                warn!("Failed to stop health server: {}", e);
            } else {
                info!("✅ Health server stopped");
            }
        }

        let scheduler_stats =
            self.scheduler
                .get_stats()
                .map_err(|e| ServiceError::BackgroundTask {
                    message: format!("Failed to get final stats: {}", e),
                })?;
        let session_stats =
            self.sessions
                .get_stats()
                .await
                .map_err(|e| ServiceError::BackgroundTask {
                    message: format!("Failed to get final stats: {}", e),
                })?;

        info!("Final scheduler statistics: {:?}", scheduler_stats);
        info!("Final session statistics: {:?}", session_stats);
        info!("✅ Matchforge service shutdown completed");

        Ok(())
    }

    /// Get service configuration
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Check if service is running
    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn tenants(&self) -> Arc<dyn TenantResolver> {
        self.tenants.clone()
    }

    pub fn queues(&self) -> Arc<QueueRegistry> {
        self.queues.clone()
    }

    pub fn tickets(&self) -> Arc<TicketManager> {
        self.tickets.clone()
    }

    pub fn sessions(&self) -> Arc<SessionManager> {
        self.sessions.clone()
    }

    pub fn scheduler(&self) -> Arc<MatchScheduler> {
        self.scheduler.clone()
    }

    pub fn metrics_collector(&self) -> Arc<MetricsCollector> {
        self.metrics_collector.clone()
    }

    /// Get AMQP connection for health checks
    pub fn amqp_connection(&self) -> Option<Arc<AmqpConnection>> {
        self.amqp_connection.clone()
    }

    async fn start_health_server(self: &Arc<Self>) -> Result<(), ServiceError> {
        let port = self.config.service.health_port;
        info!("Starting health and metrics endpoints on port {}", port);

        let health_config = HealthServerConfig {
            port,
            host: "0.0.0.0".to_string(),
        };
        let server = Arc::new(
            HealthServer::new(health_config, self.metrics_collector.clone())
                .with_app_state(self.clone()),
        );

        let handle = {
            let server = server.clone();
            tokio::spawn(async move {
                if let Err(e) = server.start().await {
                    error!("Health server failed: {}", e);
                } else {
                    info!("Health server task completed");
                }
            })
        };

        *self.health_server.lock().await = Some(server);
        self.background_tasks.lock().await.push(handle);

        // Give the server a moment to start up
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(())
    }

    /// Start the scheduling, sweeping and metrics loops
    async fn start_background_tasks(&self) {
        info!("Starting background maintenance tasks...");

        let scheduler_task = {
            let scheduler = self.scheduler.clone();
            let clock = self.clock.clone();
            let is_running = self.is_running.clone();
            let period = self.config.scheduler_interval();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                info!("Scheduler task started ({:?} interval)", period);

                while *is_running.read().await {
                    interval.tick().await;

                    let outcomes = scheduler.run_all_passes(clock.now()).await;
                    let committed: usize = outcomes.iter().map(|o| o.groups_committed()).sum();
                    if committed > 0 {
                        info!(
                            "Scheduling passes committed {} groups across {} queues",
                            committed,
                            outcomes.len()
                        );
                    } else {
                        debug!("Scheduling passes completed - no groups formed");
                    }
                }

                info!("Scheduler task stopped");
            })
        };

        let ticket_sweep_task = {
            let tickets = self.tickets.clone();
            let clock = self.clock.clone();
            let is_running = self.is_running.clone();
            let period = self.config.ticket_sweep_interval();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                info!("Ticket expiry task started ({:?} interval)", period);

                while *is_running.read().await {
                    interval.tick().await;

                    match tickets.sweep_expired(clock.now()).await {
                        Ok(expired) if expired > 0 => info!("Expired {} tickets", expired),
                        Ok(_) => debug!("Expiry sweep completed - no stale tickets found"),
                        Err(e) => warn!("Ticket expiry sweep failed: {}", e),
                    }
                }

                info!("Ticket expiry task stopped");
            })
        };

        let timeout_sweep_task = {
            let sessions = self.sessions.clone();
            let clock = self.clock.clone();
            let is_running = self.is_running.clone();
            let period = self.config.timeout_sweep_interval();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                info!("Match timeout task started ({:?} interval)", period);

                while *is_running.read().await {
                    interval.tick().await;

                    let now = clock.now();
                    match sessions.process_turn_timeouts(now).await {
                        Ok(handled) if handled > 0 => info!("Handled {} turn timeouts", handled),
                        Ok(_) => {}
                        Err(e) => warn!("Turn timeout sweep failed: {}", e),
                    }
                    match sessions.process_presence_timeouts(now).await {
                        Ok(handled) if handled > 0 => {
                            info!("Handled {} presence timeouts", handled)
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Presence timeout sweep failed: {}", e),
                    }
                }

                info!("Match timeout task stopped");
            })
        };

        let metrics_task = {
            let scheduler = self.scheduler.clone();
            let sessions = self.sessions.clone();
            let metrics_collector = self.metrics_collector.clone();
            let amqp_connection = self.amqp_connection.clone();
            let is_running = self.is_running.clone();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(30));
                let start_time = tokio::time::Instant::now();
                info!("Metrics update task started");

                while *is_running.read().await {
                    interval.tick().await;

                    metrics_collector.set_uptime(start_time.elapsed());

                    match (scheduler.get_stats(), sessions.get_stats().await) {
                        (Ok(scheduler_stats), Ok(session_stats)) => {
                            debug!(
                                "Updating metrics - waiting: {}, active matches: {}",
                                scheduler_stats.tickets_waiting, session_stats.active_matches
                            );
                            metrics_collector.update_from_stats(&scheduler_stats, &session_stats);
                            metrics_collector.update_component_health("store", true);
                        }
                        (Err(e), _) | (_, Err(e)) => {
                            warn!("Failed to get stats for metrics update: {}", e);
                            metrics_collector.update_component_health("store", false);
                        }
                    }

                    if let Some(connection) = &amqp_connection {
                        metrics_collector.update_component_health("amqp", connection.is_open());
                    }
                }

                info!("Metrics update task stopped");
            })
        };

        let mut tasks = self.background_tasks.lock().await;
        tasks.push(scheduler_task);
        tasks.push(ticket_sweep_task);
        tasks.push(timeout_sweep_task);
        tasks.push(metrics_task);

        info!("{} background tasks running", tasks.len());
    }

    /// Stop all background tasks
    async fn stop_background_tasks(&self) {
        let mut tasks = self.background_tasks.lock().await;
        let task_count = tasks.len();
        if task_count == 0 {
            info!("No background tasks to stop");
            return;
        }

        info!("Stopping {} background tasks...", task_count);

        for (i, task) in tasks.drain(..).enumerate() {
            debug!("Aborting background task {}/{}", i + 1, task_count);
            task.abort();
        }

        info!("✅ All {} background tasks stopped", task_count);
    }
}
