use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use thiserror::Error;

/// Which model scores traffic samples.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PredictorKind {
    /// The local model script, run once per sample.
    Process,
    /// An OpenAI-compatible chat completion API.
    OpenAi,
}

impl FromStr for PredictorKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "process" => Ok(PredictorKind::Process),
            "openai" => Ok(PredictorKind::OpenAi),
            other => Err(format!("unknown predictor '{}'", other)),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub http_host: String,
    pub http_port: u16,
    pub max_body_bytes: usize,

    pub database_path: String,
    pub database_pool_size: u32,

    pub polling_interval_ms: u64,
    pub min_polling_interval_ms: u64,
    pub max_concurrent_devices: usize,
    pub scheduler_tick_ms: u64,
    pub poll_timeout_ms: u64,
    pub max_backoff_ms: u64,
    pub emission_interval_ms: u64,

    pub simulator_max_latency_ms: u64,
    pub simulator_failure_rate: f64,

    pub ids_predictor: PredictorKind,
    pub predictor_command: String,
    pub predictor_script: String,
    pub predictor_timeout_ms: u64,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub openai_model: String,
    pub anomaly_threshold: f64,
    pub ids_analyze_collected: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_host: "0.0.0.0".to_string(),
            http_port: 5000,
            max_body_bytes: 1024 * 1024,
            database_path: "routerflux.db".to_string(),
            database_pool_size: 8,
            polling_interval_ms: 30_000,
            min_polling_interval_ms: 5_000,
            max_concurrent_devices: 5,
            scheduler_tick_ms: 1_000,
            poll_timeout_ms: 15_000,
            max_backoff_ms: 300_000,
            emission_interval_ms: 5_000,
            simulator_max_latency_ms: 80,
            simulator_failure_rate: 0.0,
            ids_predictor: PredictorKind::Process,
            predictor_command: "python3".to_string(),
            predictor_script: "server/services/ids/predict.py".to_string(),
            predictor_timeout_ms: 10_000,
            openai_api_key: None,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_model: "gpt-4o".to_string(),
            anomaly_threshold: 0.5,
            ids_analyze_collected: false,
        }
    }
}

/// Reads `name` from the environment, falling back to `default` when unset.
fn env_or<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::ParsingError(format!("{} has an invalid value '{}'", name, raw))),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::MissingOrInvalid(name.to_string())),
    }
}

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;

        for (name, value) in [
            ("SCHEDULER_TICK_MS", self.scheduler_tick_ms),
            ("POLL_TIMEOUT_MS", self.poll_timeout_ms),
            ("EMISSION_INTERVAL_MS", self.emission_interval_ms),
            ("PREDICTOR_TIMEOUT_MS", self.predictor_timeout_ms),
        ] {
            if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&value) {
                return Err(ConfigError::ParsingError(format!(
                    "{} must be between {} and {} ms",
                    name, MIN_TIMEOUT, MAX_TIMEOUT
                )));
            }
        }

        if self.polling_interval_ms < self.min_polling_interval_ms {
            return Err(ConfigError::ParsingError(format!(
                "POLLING_INTERVAL_MS must be at least {} ms",
                self.min_polling_interval_ms
            )));
        }
        if self.max_backoff_ms < self.polling_interval_ms {
            return Err(ConfigError::ParsingError(
                "MAX_BACKOFF_MS must not be shorter than POLLING_INTERVAL_MS".to_string(),
            ));
        }
        if self.max_concurrent_devices == 0 {
            return Err(ConfigError::ParsingError(
                "MAX_CONCURRENT_DEVICES must be at least 1".to_string(),
            ));
        }
        if self.database_pool_size == 0 {
            return Err(ConfigError::ParsingError(
                "DATABASE_POOL_SIZE must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.simulator_failure_rate) {
            return Err(ConfigError::ParsingError(
                "SIMULATOR_FAILURE_RATE must be between 0 and 1".to_string(),
            ));
        }
        if self.ids_predictor == PredictorKind::OpenAi
            && self.openai_api_key.as_deref().map_or(true, |key| key.trim().is_empty())
        {
            return Err(ConfigError::MissingOrInvalid("OPENAI_API_KEY".to_string()));
        }
        if !(0.0..=1.0).contains(&self.anomaly_threshold) {
            return Err(ConfigError::ParsingError(
                "ANOMALY_THRESHOLD must be between 0 and 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file

        let defaults = Self::default();
        let config = Self {
            // HTTP
            http_host: env::var("HTTP_HOST").unwrap_or(defaults.http_host),
            http_port: env_or("HTTP_PORT", defaults.http_port)?,
            max_body_bytes: env_or("MAX_BODY_BYTES", defaults.max_body_bytes)?,

            // Storage
            database_path: env::var("DATABASE_PATH").unwrap_or(defaults.database_path),
            database_pool_size: env_or("DATABASE_POOL_SIZE", defaults.database_pool_size)?,

            // Scheduler
            polling_interval_ms: env_or("POLLING_INTERVAL_MS", defaults.polling_interval_ms)?,
            min_polling_interval_ms: env_or("MIN_POLLING_INTERVAL_MS", defaults.min_polling_interval_ms)?,
            max_concurrent_devices: env_or("MAX_CONCURRENT_DEVICES", defaults.max_concurrent_devices)?,
            scheduler_tick_ms: env_or("SCHEDULER_TICK_MS", defaults.scheduler_tick_ms)?,
            poll_timeout_ms: env_or("POLL_TIMEOUT_MS", defaults.poll_timeout_ms)?,
            max_backoff_ms: env_or("MAX_BACKOFF_MS", defaults.max_backoff_ms)?,
            emission_interval_ms: env_or("EMISSION_INTERVAL_MS", defaults.emission_interval_ms)?,

            // Simulated routers
            simulator_max_latency_ms: env_or("SIMULATOR_MAX_LATENCY_MS", defaults.simulator_max_latency_ms)?,
            simulator_failure_rate: env_or("SIMULATOR_FAILURE_RATE", defaults.simulator_failure_rate)?,

            // IDS
            ids_predictor: env_or("IDS_PREDICTOR", defaults.ids_predictor)?,
            predictor_command: env::var("PREDICTOR_COMMAND").unwrap_or(defaults.predictor_command),
            predictor_script: env::var("PREDICTOR_SCRIPT").unwrap_or(defaults.predictor_script),
            predictor_timeout_ms: env_or("PREDICTOR_TIMEOUT_MS", defaults.predictor_timeout_ms)?,
            openai_api_key: env::var("OPENAI_API_KEY").ok(),
            openai_base_url: env::var("OPENAI_BASE_URL").unwrap_or(defaults.openai_base_url),
            openai_model: env::var("OPENAI_MODEL").unwrap_or(defaults.openai_model),
            anomaly_threshold: env_or("ANOMALY_THRESHOLD", defaults.anomaly_threshold)?,
            ids_analyze_collected: env_or("IDS_ANALYZE_COLLECTED", defaults.ids_analyze_collected)?,
        };

        config.validate()?;

        Ok(config)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }
}
