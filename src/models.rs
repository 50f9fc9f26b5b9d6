use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Current UTC time as an RFC 3339 string, the format every stored timestamp uses.
pub fn now_timestamp() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub port: u16,
    pub is_connected: bool,
    pub last_connected: Option<String>,
    pub has_wireless: bool,
    pub has_capsman: bool,
    pub created_at: String,
}

fn default_api_port() -> u16 {
    8728
}

/// Payload for registering a device.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDevice {
    pub name: String,
    pub address: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default)]
    pub has_wireless: bool,
    #[serde(default)]
    pub has_capsman: bool,
}

/// Partial update; absent fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceUpdate {
    pub name: Option<String>,
    pub address: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub port: Option<u16>,
    pub has_wireless: Option<bool>,
    pub has_capsman: Option<bool>,
}

/// A collected fact attributed to a device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Recorded<T> {
    pub id: i64,
    pub device_id: i64,
    pub recorded_at: String,
    #[serde(flatten)]
    pub data: T,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemResources {
    pub cpu_load: f64,
    pub free_memory: u64,
    pub total_memory: u64,
    pub uptime_secs: u64,
    pub temperature: Option<f64>,
    pub board_name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceStats {
    pub name: String,
    pub interface_type: String,
    pub running: bool,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WirelessInterface {
    pub name: String,
    pub ssid: String,
    pub band: String,
    pub frequency: u32,
    pub noise_floor: i32,
    pub client_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WirelessClient {
    pub mac_address: String,
    pub interface: String,
    pub signal_strength: i32,
    pub tx_rate_mbps: f64,
    pub rx_rate_mbps: f64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CapsmanAccessPoint {
    pub identity: String,
    pub mac_address: String,
    pub address: String,
    pub state: String,
    pub radio_count: u32,
    pub client_count: u32,
}

/// A firewall filter rule as reported by the router. `rule_id` is the
/// router-assigned id (`*1`, `*2`, ...) and is the upsert key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FirewallRule {
    pub rule_id: String,
    pub chain: String,
    pub action: String,
    pub protocol: Option<String>,
    pub src_address: Option<String>,
    pub dst_address: Option<String>,
    pub dst_port: Option<String>,
    pub comment: Option<String>,
    pub disabled: bool,
    pub bytes: u64,
    pub packets: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub cwe: bool,
    pub ece: bool,
}

/// One packet observed within a flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PacketObservation {
    pub direction: Direction,
    /// Microseconds since the start of the capture.
    pub timestamp_us: u64,
    pub length: u32,
    #[serde(default)]
    pub header_length: u32,
    #[serde(default)]
    pub flags: TcpFlags,
}

/// A single flow between two endpoints, as sampled from a router.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSample {
    pub source_ip: String,
    pub destination_ip: String,
    pub destination_port: u16,
    pub protocol: String,
    #[serde(default)]
    pub packets: Vec<PacketObservation>,
}

impl TrafficSample {
    pub fn total_bytes(&self) -> u64 {
        self.packets.iter().map(|p| p.length as u64).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolSummary {
    pub protocol: String,
    pub samples: u64,
    pub packets: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSource {
    pub source_ip: String,
    pub samples: u64,
    pub packets: u64,
    pub bytes: u64,
}

/// The predictor's answer for one traffic sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub is_anomaly: bool,
    pub probability: f64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn from_probability(probability: f64) -> Self {
        if probability >= 0.9 {
            AlertSeverity::Critical
        } else if probability >= 0.75 {
            AlertSeverity::High
        } else if probability >= 0.5 {
            AlertSeverity::Medium
        } else {
            AlertSeverity::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "critical" => AlertSeverity::Critical,
            "high" => AlertSeverity::High,
            "medium" => AlertSeverity::Medium,
            _ => AlertSeverity::Low,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: i64,
    pub device_id: i64,
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub source_ip: String,
    pub destination_ip: String,
    pub destination_port: u16,
    pub probability: f64,
    pub sample_key: String,
    pub acknowledged: bool,
    pub created_at: String,
}

/// Alert fields before the database assigns an id.
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub device_id: i64,
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub source_ip: String,
    pub destination_ip: String,
    pub destination_port: u16,
    pub probability: f64,
    pub sample_key: String,
}

/// Links an alert to the analysis that raised it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DetectionRecord {
    pub id: i64,
    pub alert_id: i64,
    pub device_id: i64,
    pub traffic_feature_id: i64,
    pub model: String,
    pub probability: f64,
    pub detected_at: String,
}
