//! Main application state and service coordination
//!
//! This module contains the AppState that builds every component, runs the
//! HTTP server, the match worker, the bus listener and the stats task, and
//! tears them down again.

use crate::bus::{AmqpRoomBus, BusListener, LocalRoomBus, PublisherConfig, RoomEventBus};
use crate::config::AppConfig;
use crate::matchmaking::MatchWorker;
use crate::metrics::health::HttpServerConfig;
use crate::metrics::{HttpServer, MetricsCollector};
use crate::room::{RoomDirectory, RoomManager};
use crate::service::health::HealthCheck;
use crate::transport::{self, ConnectionHub, ForwardingSink, TransportState};
use crate::utils::generate_instance_id;
use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Service-level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Bus connection error: {message}")]
    BusConnection { message: String },

    #[error("Service initialization error: {message}")]
    Initialization { message: String },

    #[error("Background task error: {message}")]
    BackgroundTask { message: String },
}

/// Main application state containing all service components
pub struct AppState {
    /// Application configuration
    config: AppConfig,

    /// Session lifecycle and room operations
    room_manager: Arc<RoomManager>,

    /// Connections held by this instance
    hub: Arc<ConnectionHub>,

    /// Peer instances
    bus: Arc<dyn RoomEventBus>,

    metrics_collector: Arc<MetricsCollector>,

    /// Taken when the service starts
    match_worker: Mutex<Option<MatchWorker>>,

    http_server: Mutex<Option<Arc<HttpServer>>>,

    /// Background task handles
    background_tasks: Mutex<Vec<JoinHandle<()>>>,

    /// Service status
    is_running: Arc<RwLock<bool>>,

    started_at: Instant,
}

impl AppState {
    /// Initialize the application with all dependencies
    pub async fn new(config: AppConfig) -> Result<Self, ServiceError> {
        info!("Initializing rendezvous service");

        let metrics_collector =
            Arc::new(
                MetricsCollector::new().map_err(|e| ServiceError::Initialization {
                    message: format!("Failed to create metrics collector: {}", e),
                })?,
            );

        let activity_provider =
            Arc::new(
                config
                    .activity_provider()
                    .map_err(|e| ServiceError::Configuration {
                        message: format!("Invalid activity catalog: {}", e),
                    })?,
            );

        let bus = Self::initialize_bus(&config, metrics_collector.clone()).await?;
        let hub = Arc::new(ConnectionHub::new());
        let sink = if config.bus.enabled {
            ForwardingSink::new(hub.clone(), Some(bus.clone()))
        } else {
            ForwardingSink::local(hub.clone())
        };

        let directory = Arc::new(RoomDirectory::with_search_attempts(
            config.matchmaking.public_search_attempts,
        ));
        let (room_manager, match_worker) = RoomManager::with_metrics(
            activity_provider,
            directory,
            Arc::new(sink),
            bus.clone(),
            metrics_collector.clone(),
        );

        info!(
            "Service components ready - instance: {}, bus: {}",
            bus.instance_id(),
            if config.bus.enabled { "amqp" } else { "local" }
        );

        Ok(Self {
            config,
            room_manager: Arc::new(room_manager),
            hub,
            bus,
            metrics_collector,
            match_worker: Mutex::new(Some(match_worker)),
            http_server: Mutex::new(None),
            background_tasks: Mutex::new(Vec::new()),
            is_running: Arc::new(RwLock::new(false)),
            started_at: Instant::now(),
        })
    }

    /// Connect to the broker, or fall back to an in-process bus
    async fn initialize_bus(
        config: &AppConfig,
        metrics_collector: Arc<MetricsCollector>,
    ) -> Result<Arc<dyn RoomEventBus>, ServiceError> {
        if !config.bus.enabled {
            info!("Bus disabled, running as a standalone instance");
            return Ok(Arc::new(LocalRoomBus::new()));
        }

        info!("Connecting to AMQP broker: {}", config.bus.url);
        let amqp_config = config
            .amqp_config()
            .map_err(|e| ServiceError::Configuration {
                message: format!("Failed to parse AMQP URL: {}", e),
            })?;
        let publisher_config = PublisherConfig {
            max_retries: config.bus.max_retry_attempts,
            retry_delay_ms: config.bus.retry_delay_ms,
        };

        let bus = AmqpRoomBus::connect(
            amqp_config,
            &config.bus.exchange_name,
            &generate_instance_id(),
            publisher_config,
            metrics_collector,
        )
        .await
        .map_err(|e| ServiceError::BusConnection {
            message: format!("Failed to connect to AMQP: {}", e),
        })?;

        Ok(Arc::new(bus))
    }

    /// Start the HTTP server and all background tasks
    pub async fn start(self: &Arc<Self>) -> Result<(), ServiceError> {
        info!("Starting rendezvous service");

        *self.is_running.write().await = true;

        self.start_http_server().await?;
        self.start_match_worker()?;
        self.start_bus_listener()?;
        self.start_stats_task()?;

        info!("Rendezvous service started successfully");
        Ok(())
    }

    /// Perform graceful shutdown
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        info!("Starting graceful shutdown of rendezvous service");

        *self.is_running.write().await = false;

        let http_server = self
            .http_server
            .lock()
            .map_err(|_| ServiceError::BackgroundTask {
                message: "HTTP server handle lock poisoned".to_string(),
            })?
            .take();
        if let Some(server) = http_server {
            if let Err(e) = server.stop().await {
                warn!("Failed to stop HTTP server: {}", e);
            }
        }

        self.stop_background_tasks().await;

        if let Err(e) = self.bus.shutdown().await {
            warn!("Failed to shut down bus: {}", e);
        }

        let final_stats =
            self.room_manager
                .get_stats()
                .map_err(|e| ServiceError::BackgroundTask {
                    message: format!("Failed to get final stats: {}", e),
                })?;

        info!("Final service statistics: {:?}", final_stats);
        info!("Rendezvous service shutdown completed");
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

    pub fn room_manager(&self) -> Arc<RoomManager> {
        self.room_manager.clone()
    }

    pub fn hub(&self) -> Arc<ConnectionHub> {
        self.hub.clone()
    }

    pub fn bus(&self) -> Arc<dyn RoomEventBus> {
        self.bus.clone()
    }

    pub fn metrics_collector(&self) -> Arc<MetricsCollector> {
        self.metrics_collector.clone()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// State shared by WebSocket connection handlers
    pub fn transport_state(&self) -> TransportState {
        TransportState {
            manager: self.room_manager.clone(),
            hub: self.hub.clone(),
            metrics_collector: self.metrics_collector.clone(),
        }
    }

    fn spawn_background(&self, task: JoinHandle<()>) -> Result<(), ServiceError> {
        self.background_tasks
            .lock()
            .map_err(|_| ServiceError::BackgroundTask {
                message: "Background task list lock poisoned".to_string(),
            })?
            .push(task);
        Ok(())
    }

    /// Serve the client WebSocket, health checks and metrics on one port
    async fn start_http_server(self: &Arc<Self>) -> Result<(), ServiceError> {
        let port = self.config.service.http_port;
        info!("Starting HTTP server on port {}", port);

        let http_config = HttpServerConfig {
            port,
            host: "0.0.0.0".to_string(),
        };
        let server = Arc::new(
            HttpServer::new(http_config, self.metrics_collector.clone())
                .with_app_state(self.clone())
                .with_routes(transport::router(self.transport_state())),
        );

        *self
            .http_server
            .lock()
            .map_err(|_| ServiceError::BackgroundTask {
                message: "HTTP server handle lock poisoned".to_string(),
            })? = Some(server.clone());

        let handle = tokio::spawn(async move {
            if let Err(e) = server.start().await {
                error!("HTTP server failed: {}", e);
            } else {
                info!("HTTP server task completed");
            }
        });
        self.spawn_background(handle)?;

        // Give the server a moment to bind
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(())
    }

    fn start_match_worker(&self) -> Result<(), ServiceError> {
        let worker = self
            .match_worker
            .lock()
            .map_err(|_| ServiceError::BackgroundTask {
                message: "Match worker lock poisoned".to_string(),
            })?
            .take()
            .ok_or_else(|| ServiceError::BackgroundTask {
                message: "Match worker already started".to_string(),
            })?;

        self.spawn_background(tokio::spawn(worker.run()))
    }

    fn start_bus_listener(&self) -> Result<(), ServiceError> {
        let listener = BusListener::new(
            self.room_manager.directory().clone(),
            self.hub.clone(),
            self.metrics_collector.clone(),
        );
        let subscription = self.bus.subscribe();
        self.spawn_background(tokio::spawn(listener.run(subscription)))
    }

    /// Periodically push gauges, uptime and health into the metrics registry
    fn start_stats_task(self: &Arc<Self>) -> Result<(), ServiceError> {
        let app_state = Arc::downgrade(self);
        let period = self.config.stats_interval();
        info!("Starting stats task ({}s interval)", period.as_secs());

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(app_state) = app_state.upgrade() else {
                    break;
                };
                if !app_state.is_running().await {
                    break;
                }

                app_state.room_manager.refresh_metrics();
                let metrics = &app_state.metrics_collector;
                metrics.update_uptime(app_state.uptime());

                match HealthCheck::check(app_state.clone()).await {
                    Ok(health) => {
                        metrics.update_health_status(health.status.as_gauge());
                        for check in &health.checks {
                            metrics.update_component_health(
                                &check.name,
                                check.status.as_gauge() == 2,
                            );
                        }
                        debug!(
                            "Stats - rooms: {}, connected: {}, waiting: {}",
                            health.stats.active_rooms,
                            health.stats.sessions_connected,
                            health.stats.sessions_waiting
                        );
                    }
                    Err(e) => warn!("Health check failed: {}", e),
                }
            }
            info!("Stats task stopped");
        });
        self.spawn_background(task)
    }

    /// Stop all background tasks
    async fn stop_background_tasks(&self) {
        let tasks: Vec<JoinHandle<()>> = match self.background_tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => {
                error!("Background task list lock poisoned");
                return;
            }
        };

        let task_count = tasks.len();
        if task_count == 0 {
            info!("No background tasks to stop");
            return;
        }

        info!("Stopping {} background tasks...", task_count);
        for (i, task) in tasks.into_iter().enumerate() {
            debug!("Aborting background task {}/{}", i + 1, task_count);
            task.abort();
        }

        // Give tasks time to clean up
        tokio::time::sleep(Duration::from_millis(100)).await;
        info!("All {} background tasks stopped", task_count);
    }
}
