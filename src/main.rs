mod broadcast_hub;
mod collectors;
mod config;
mod connection_manager;
mod db;
mod error;
mod ids_adapter;
mod llm_analyzer;
mod models;
mod poll_tracker;
mod rest_server;
mod scheduler;
mod service_utils;
mod simulated_router;
mod traffic_features;
mod ws_handler;

use crate::broadcast_hub::BroadcastHub;
use crate::collectors::Collectors;
use crate::config::{Config, PredictorKind};
use crate::connection_manager::ConnectionManager;
use crate::db::DatabaseService;
use crate::ids_adapter::{IdsAdapter, Predictor, ProcessPredictor};
use crate::llm_analyzer::LlmPredictor;
use crate::rest_server::{run_rest_server, AppState};
use crate::scheduler::{Scheduler, SchedulerSettings};
use crate::service_utils::{handle_shutdown, start_event_pump, start_scheduler};
use crate::simulated_router::SimulatedRouter;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };

    let db_service = match DatabaseService::new(&config.database_path, config.database_pool_size) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!("Failed to create database service: {:?}", e);
            return;
        }
    };

    if let Err(e) = db_service.initialize_db() {
        error!("Database initialization failed: {:?}", e);
        return;
    }
    info!("Database initialized at {}.", config.database_path);

    let hub = BroadcastHub::new();
    let (connections, connection_events) = ConnectionManager::new(
        Arc::new(SimulatedRouter::new(
            config.simulator_max_latency_ms,
            config.simulator_failure_rate,
        )),
        Duration::from_millis(config.emission_interval_ms),
    );

    let predictor_timeout = Duration::from_millis(config.predictor_timeout_ms);
    let predictor: Arc<dyn Predictor> = match config.ids_predictor {
        PredictorKind::Process => Arc::new(ProcessPredictor::new(
            config.predictor_command.clone(),
            config.predictor_script.clone(),
            predictor_timeout,
        )),
        PredictorKind::OpenAi => match LlmPredictor::new(
            &config.openai_base_url,
            config.openai_api_key.clone().unwrap_or_default(),
            config.openai_model.clone(),
            predictor_timeout,
        ) {
            Ok(predictor) => Arc::new(predictor),
            Err(e) => {
                error!("Failed to create language model predictor: {}", e);
                return;
            }
        },
    };
    info!(model = predictor.model_name(), "Traffic predictor ready");
    let ids = Arc::new(IdsAdapter::new(
        db_service.clone(),
        hub.clone(),
        predictor,
        config.anomaly_threshold,
    ));
    let collectors = Arc::new(Collectors::new(
        db_service.clone(),
        hub.clone(),
        Some(ids.clone()),
        config.ids_analyze_collected,
    ));
    let scheduler = Scheduler::new(
        db_service.clone(),
        connections.clone(),
        collectors.clone(),
        SchedulerSettings::from(config.as_ref()),
    );

    let event_pump = start_event_pump(db_service.clone(), hub.clone(), collectors.clone(), connection_events);
    start_scheduler(scheduler.clone()).await;

    let state = AppState {
        db: db_service,
        hub,
        connections,
        collectors,
        scheduler: scheduler.clone(),
        ids,
    };

    // Serve until Ctrl-C; the shutdown hook stops polling before the server drains.
    if let Err(e) = run_rest_server(
        state,
        &config.bind_address(),
        config.max_body_bytes,
        handle_shutdown(scheduler),
    )
    .await
    {
        error!("HTTP server failed: {}", e);
    }

    event_pump.abort();
    info!("All services shut down successfully.");
}
