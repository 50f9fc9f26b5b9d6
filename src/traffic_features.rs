//! Flow feature extraction for the anomaly predictor.
//!
//! Turns one [`TrafficSample`] into the 55 CIC-IDS flow features the trained
//! model expects, keyed by the column names it was trained on. Durations and
//! inter-arrival times are in microseconds, rates are per second, and standard
//! deviations are population deviations. Anything that cannot be computed
//! (a direction with no packets, a zero-length flow) is 0.

use crate::models::{Direction, PacketObservation, TrafficSample};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const FEATURE_NAMES: [&str; 55] = [
    "Destination Port",
    "Flow Duration",
    "Total Fwd Packets",
    "Total Backward Packets",
    "Total Length of Fwd Packets",
    "Total Length of Bwd Packets",
    "Fwd Packet Length Max",
    "Fwd Packet Length Min",
    "Fwd Packet Length Mean",
    "Fwd Packet Length Std",
    "Bwd Packet Length Max",
    "Bwd Packet Length Min",
    "Bwd Packet Length Mean",
    "Bwd Packet Length Std",
    "Flow Bytes/s",
    "Flow Packets/s",
    "Flow IAT Mean",
    "Flow IAT Std",
    "Flow IAT Max",
    "Flow IAT Min",
    "Fwd IAT Total",
    "Fwd IAT Mean",
    "Fwd IAT Std",
    "Fwd IAT Max",
    "Fwd IAT Min",
    "Bwd IAT Total",
    "Bwd IAT Mean",
    "Bwd IAT Std",
    "Bwd IAT Max",
    "Bwd IAT Min",
    "Fwd PSH Flags",
    "Bwd PSH Flags",
    "Fwd URG Flags",
    "Bwd URG Flags",
    "Fwd Header Length",
    "Bwd Header Length",
    "Fwd Packets/s",
    "Bwd Packets/s",
    "Min Packet Length",
    "Max Packet Length",
    "Packet Length Mean",
    "Packet Length Std",
    "Packet Length Variance",
    "FIN Flag Count",
    "SYN Flag Count",
    "RST Flag Count",
    "PSH Flag Count",
    "ACK Flag Count",
    "URG Flag Count",
    "CWE Flag Count",
    "ECE Flag Count",
    "Down/Up Ratio",
    "Average Packet Size",
    "Avg Fwd Segment Size",
    "Avg Bwd Segment Size",
];

/// Namespace for sample keys, so the same flow always maps to the same key.
const SAMPLE_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_9b7d_4c1a_8e3f_5d2b_0a9c_7e41);

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    values: Vec<(&'static str, f64)>,
}

impl FeatureVector {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
    }

    /// JSON object keyed by feature name, as the predictor script reads it.
    pub fn to_json(&self) -> Value {
        let mut map = Map::with_capacity(self.values.len());
        for (name, value) in &self.values {
            let value = serde_json::Number::from_f64(*value).map(Value::Number).unwrap_or(Value::from(0));
            map.insert((*name).to_string(), value);
        }
        Value::Object(map)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct Summary {
    total: f64,
    max: f64,
    min: f64,
    mean: f64,
    variance: f64,
}

impl Summary {
    fn of(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let n = values.len() as f64;
        let total: f64 = values.iter().sum();
        let mean = total / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Self {
            total,
            max: values.iter().cloned().fold(f64::MIN, f64::max),
            min: values.iter().cloned().fold(f64::MAX, f64::min),
            mean,
            variance,
        }
    }

    fn std(&self) -> f64 {
        self.variance.sqrt()
    }
}

fn inter_arrival_times(packets: &[&PacketObservation]) -> Vec<f64> {
    packets
        .windows(2)
        .map(|pair| pair[1].timestamp_us.saturating_sub(pair[0].timestamp_us) as f64)
        .collect()
}

fn per_second(count: f64, duration_us: f64) -> f64 {
    if duration_us > 0.0 {
        count / (duration_us / 1_000_000.0)
    } else {
        0.0
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

/// Computes the feature vector for one flow. Packet order in the sample does
/// not matter; packets are ordered by timestamp first.
pub fn extract_features(sample: &TrafficSample) -> FeatureVector {
    let mut all: Vec<&PacketObservation> = sample.packets.iter().collect();
    all.sort_by_key(|p| p.timestamp_us);
    let fwd: Vec<&PacketObservation> = all.iter().copied().filter(|p| p.direction == Direction::Forward).collect();
    let bwd: Vec<&PacketObservation> = all.iter().copied().filter(|p| p.direction == Direction::Backward).collect();

    let lengths = |packets: &[&PacketObservation]| packets.iter().map(|p| p.length as f64).collect::<Vec<_>>();
    let all_len = Summary::of(&lengths(&all));
    let fwd_len = Summary::of(&lengths(&fwd));
    let bwd_len = Summary::of(&lengths(&bwd));

    let flow_iat = Summary::of(&inter_arrival_times(&all));
    let fwd_iat = Summary::of(&inter_arrival_times(&fwd));
    let bwd_iat = Summary::of(&inter_arrival_times(&bwd));

    let duration_us = match (all.first(), all.last()) {
        (Some(first), Some(last)) => last.timestamp_us.saturating_sub(first.timestamp_us) as f64,
        _ => 0.0,
    };

    let count_flag = |packets: &[&PacketObservation], flag: fn(&PacketObservation) -> bool| {
        packets.iter().filter(|p| flag(p)).count() as f64
    };
    let header_total = |packets: &[&PacketObservation]| packets.iter().map(|p| p.header_length as f64).sum::<f64>();

    let total_packets = all.len() as f64;
    let fwd_count = fwd.len() as f64;
    let bwd_count = bwd.len() as f64;

    let values = vec![
        ("Destination Port", sample.destination_port as f64),
        ("Flow Duration", duration_us),
        ("Total Fwd Packets", fwd_count),
        ("Total Backward Packets", bwd_count),
        ("Total Length of Fwd Packets", fwd_len.total),
        ("Total Length of Bwd Packets", bwd_len.total),
        ("Fwd Packet Length Max", fwd_len.max),
        ("Fwd Packet Length Min", fwd_len.min),
        ("Fwd Packet Length Mean", fwd_len.mean),
        ("Fwd Packet Length Std", fwd_len.std()),
        ("Bwd Packet Length Max", bwd_len.max),
        ("Bwd Packet Length Min", bwd_len.min),
        ("Bwd Packet Length Mean", bwd_len.mean),
        ("Bwd Packet Length Std", bwd_len.std()),
        ("Flow Bytes/s", per_second(all_len.total, duration_us)),
        ("Flow Packets/s", per_second(total_packets, duration_us)),
        ("Flow IAT Mean", flow_iat.mean),
        ("Flow IAT Std", flow_iat.std()),
        ("Flow IAT Max", flow_iat.max),
        ("Flow IAT Min", flow_iat.min),
        ("Fwd IAT Total", fwd_iat.total),
        ("Fwd IAT Mean", fwd_iat.mean),
        ("Fwd IAT Std", fwd_iat.std()),
        ("Fwd IAT Max", fwd_iat.max),
        ("Fwd IAT Min", fwd_iat.min),
        ("Bwd IAT Total", bwd_iat.total),
        ("Bwd IAT Mean", bwd_iat.mean),
        ("Bwd IAT Std", bwd_iat.std()),
        ("Bwd IAT Max", bwd_iat.max),
        ("Bwd IAT Min", bwd_iat.min),
        ("Fwd PSH Flags", count_flag(&fwd, |p| p.flags.psh)),
        ("Bwd PSH Flags", count_flag(&bwd, |p| p.flags.psh)),
        ("Fwd URG Flags", count_flag(&fwd, |p| p.flags.urg)),
        ("Bwd URG Flags", count_flag(&bwd, |p| p.flags.urg)),
        ("Fwd Header Length", header_total(&fwd)),
        ("Bwd Header Length", header_total(&bwd)),
        ("Fwd Packets/s", per_second(fwd_count, duration_us)),
        ("Bwd Packets/s", per_second(bwd_count, duration_us)),
        ("Min Packet Length", all_len.min),
        ("Max Packet Length", all_len.max),
        ("Packet Length Mean", all_len.mean),
        ("Packet Length Std", all_len.std()),
        ("Packet Length Variance", all_len.variance),
        ("FIN Flag Count", count_flag(&all, |p| p.flags.fin)),
        ("SYN Flag Count", count_flag(&all, |p| p.flags.syn)),
        ("RST Flag Count", count_flag(&all, |p| p.flags.rst)),
        ("PSH Flag Count", count_flag(&all, |p| p.flags.psh)),
        ("ACK Flag Count", count_flag(&all, |p| p.flags.ack)),
        ("URG Flag Count", count_flag(&all, |p| p.flags.urg)),
        ("CWE Flag Count", count_flag(&all, |p| p.flags.cwe)),
        ("ECE Flag Count", count_flag(&all, |p| p.flags.ece)),
        ("Down/Up Ratio", ratio(bwd_count, fwd_count)),
        ("Average Packet Size", ratio(all_len.total, total_packets)),
        ("Avg Fwd Segment Size", fwd_len.mean),
        ("Avg Bwd Segment Size", bwd_len.mean),
    ];
    debug_assert!(values.iter().map(|(name, _)| *name).eq(FEATURE_NAMES.iter().copied()));

    FeatureVector { values }
}

/// Deterministic identity of a sample as seen on a device.
pub fn sample_key(device_id: i64, sample: &TrafficSample) -> String {
    let canonical = serde_json::to_string(sample).unwrap_or_default();
    Uuid::new_v5(&SAMPLE_NAMESPACE, format!("{}:{}", device_id, canonical).as_bytes()).to_string()
}

/// Rough attack label used when wording alerts.
pub fn classify_attack(sample: &TrafficSample) -> &'static str {
    let total = sample.packets.len();
    if total == 0 {
        return "anomaly";
    }
    let bare_syn = sample
        .packets
        .iter()
        .filter(|p| p.flags.syn && !p.flags.ack)
        .count();
    if bare_syn * 5 >= total * 4 {
        return "port_scan";
    }
    let features = extract_features(sample);
    if features.get("Flow Packets/s").unwrap_or(0.0) > 1_000.0 {
        return "flood";
    }
    "anomaly"
}
