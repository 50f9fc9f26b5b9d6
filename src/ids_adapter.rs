use crate::broadcast_hub::{topics, BroadcastHub, ServerMessage};
use crate::db::DatabaseService;
use crate::error::{AnalysisError, PredictorError};
use crate::models::{now_timestamp, Alert, AlertSeverity, Direction, NewAlert, PacketObservation, TcpFlags, TrafficSample, Verdict};
use crate::traffic_features::{classify_attack, extract_features, sample_key};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// Raw answer of the anomaly model for one feature vector.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Prediction {
    pub is_anomaly: bool,
    pub probability: f64,
    #[serde(default)]
    pub error: Option<String>,
}

#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(&self, features: &Value) -> Result<Prediction, PredictorError>;

    fn model_name(&self) -> &str {
        "random_forest"
    }
}

/// Parses the last non-empty line the predictor printed. Earlier lines are
/// treated as diagnostics.
pub fn parse_prediction(stdout: &str) -> Result<Prediction, PredictorError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .rev()
        .find(|line| !line.is_empty())
        .ok_or_else(|| PredictorError::Malformed("empty output".to_string()))?;

    let prediction: Prediction =
        serde_json::from_str(line).map_err(|e| PredictorError::Malformed(format!("{}: {}", e, line)))?;

    if let Some(error) = prediction.error.clone() {
        return Err(PredictorError::Reported(error));
    }
    if !prediction.probability.is_finite() || !(0.0..=1.0).contains(&prediction.probability) {
        return Err(PredictorError::Malformed(format!(
            "probability {} outside [0, 1]",
            prediction.probability
        )));
    }
    Ok(prediction)
}

/// Runs `<command> <script> '<features json>'` once per prediction.
pub struct ProcessPredictor {
    command: String,
    script: String,
    timeout: Duration,
}

impl ProcessPredictor {
    pub fn new(command: impl Into<String>, script: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            script: script.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Predictor for ProcessPredictor {
    async fn predict(&self, features: &Value) -> Result<Prediction, PredictorError> {
        let argument = serde_json::to_string(features).map_err(|e| PredictorError::Malformed(e.to_string()))?;
        let child = Command::new(&self.command)
            .arg(&self.script)
            .arg(argument)
            .kill_on_drop(true)
            .output();

        let output = timeout(self.timeout, child)
            .await
            .map_err(|_| PredictorError::Timeout(self.timeout.as_millis() as u64))??;

        if !output.status.success() {
            return Err(PredictorError::Exited {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_prediction(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Scores traffic samples and turns confident anomalies into alerts.
pub struct IdsAdapter {
    db: Arc<DatabaseService>,
    hub: Arc<BroadcastHub>,
    predictor: Arc<dyn Predictor>,
    threshold: f64,
}

impl IdsAdapter {
    pub fn new(
        db: Arc<DatabaseService>,
        hub: Arc<BroadcastHub>,
        predictor: Arc<dyn Predictor>,
        threshold: f64,
    ) -> Self {
        Self {
            db,
            hub,
            predictor,
            threshold,
        }
    }

    /// Runs the sample through the predictor and records the outcome. An alert
    /// is stored, and broadcast, at most once per distinct sample.
    pub async fn analyze_traffic(&self, device_id: i64, sample: &TrafficSample) -> Result<Verdict, AnalysisError> {
        let features = extract_features(sample).to_json();
        let key = sample_key(device_id, sample);

        let prediction = self.predictor.predict(&features).await.map_err(|e| {
            warn!(device_id, "Traffic analysis unavailable: {}", e);
            e
        })?;

        let verdict = Verdict {
            is_anomaly: prediction.is_anomaly,
            probability: prediction.probability,
            timestamp: now_timestamp(),
        };
        let feature_id = self.db.insert_traffic_feature(device_id, &key, &features, &verdict)?;
        debug!(device_id, probability = verdict.probability, anomaly = verdict.is_anomaly, "Traffic sample scored");

        if verdict.is_anomaly && verdict.probability >= self.threshold {
            let alert = new_alert(device_id, sample, &key, verdict.probability);
            if let Some(stored) = self.db.record_alert(&alert, feature_id, self.predictor.model_name())? {
                self.announce(&stored).await;
            }
        }
        Ok(verdict)
    }

    /// Feeds a synthetic SYN sweep through the normal analysis path.
    pub async fn test_scan_detection(&self, device_id: i64) -> Result<Verdict, AnalysisError> {
        let start_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or_default();
        let sample = synthetic_port_scan(start_us);
        info!(device_id, "Running synthetic port-scan detection");
        self.analyze_traffic(device_id, &sample).await
    }

    pub fn list_anomalies(&self, device_id: Option<i64>, limit: usize) -> Result<Vec<Alert>, AnalysisError> {
        Ok(self.db.list_alerts(device_id, limit)?)
    }

    async fn announce(&self, alert: &Alert) {
        info!(
            device_id = alert.device_id,
            severity = alert.severity.as_str(),
            "Security alert: {}",
            alert.message
        );
        let message = ServerMessage::SecurityAlert(alert.clone());
        self.hub
            .broadcast_to_topic(&topics::device_alerts(alert.device_id), &message)
            .await;
        self.hub.broadcast_to_topic(topics::ALL_ALERTS, &message).await;
    }
}

fn new_alert(device_id: i64, sample: &TrafficSample, key: &str, probability: f64) -> NewAlert {
    let alert_type = classify_attack(sample);
    let severity = AlertSeverity::from_probability(probability);
    let message = format!(
        "Possible {} from {} to {}:{} ({:.0}% confidence)",
        alert_type.replace('_', " "),
        sample.source_ip,
        sample.destination_ip,
        sample.destination_port,
        probability * 100.0
    );
    NewAlert {
        device_id,
        alert_type: alert_type.to_string(),
        severity,
        message,
        source_ip: sample.source_ip.clone(),
        destination_ip: sample.destination_ip.clone(),
        destination_port: sample.destination_port,
        probability,
        sample_key: key.to_string(),
    }
}

/// Many tiny SYN-only packets, 200 µs apart, from one source.
pub fn synthetic_port_scan(start_us: u64) -> TrafficSample {
    let packets = (0..64u64)
        .map(|i| PacketObservation {
            direction: Direction::Forward,
            timestamp_us: start_us + i * 200,
            length: 40,
            header_length: 20,
            flags: TcpFlags {
                syn: true,
                ..TcpFlags::default()
            },
        })
        .collect();
    TrafficSample {
        source_ip: "203.0.113.66".to_string(),
        destination_ip: "192.168.88.1".to_string(),
        destination_port: 22,
        protocol: "tcp".to_string(),
        packets,
    }
}
