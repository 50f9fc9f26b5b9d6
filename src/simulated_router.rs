use crate::connection_manager::RouterApi;
use crate::error::ConnectionError;
use crate::models::{
    CapsmanAccessPoint, Device, Direction, FirewallRule, InterfaceStats, PacketObservation, SystemResources,
    TcpFlags, TrafficSample, WirelessClient, WirelessInterface,
};
use async_trait::async_trait;
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::IpAddr;
use tokio::time::{sleep, Duration};

/// Stands in for a MikroTik API session. Answers are random but plausible,
/// and stable where the dashboard relies on identity (interface names, rule ids).
pub struct SimulatedRouter {
    max_latency_ms: u64,
    failure_rate: f64,
}

impl Default for SimulatedRouter {
    fn default() -> Self {
        Self {
            max_latency_ms: 80,
            failure_rate: 0.0,
        }
    }
}

impl SimulatedRouter {
    pub fn new(max_latency_ms: u64, failure_rate: f64) -> Self {
        Self {
            max_latency_ms,
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }

    async fn round_trip(&self, device: &Device) -> Result<(), ConnectionError> {
        let (delay, dropped) = {
            let mut rng = rand::thread_rng();
            let delay = if self.max_latency_ms > 0 {
                rng.gen_range(0..=self.max_latency_ms)
            } else {
                0
            };
            (delay, rng.gen_bool(self.failure_rate))
        };
        sleep(Duration::from_millis(delay)).await;
        if dropped {
            return Err(ConnectionError::Timeout(device.id));
        }
        Ok(())
    }
}

fn reachable(address: &str) -> bool {
    if address.parse::<IpAddr>().is_ok() {
        return true;
    }
    !address.is_empty()
        && address.len() <= 253
        && address
            .split('.')
            .all(|label| !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
}

fn mac_for(device_id: i64, index: u32) -> String {
    format!(
        "4C:5E:0C:{:02X}:{:02X}:{:02X}",
        (device_id & 0xff) as u8,
        (index >> 8) as u8,
        (index & 0xff) as u8
    )
}

/// Baseline rule set every simulated router ships with. Ids are stable per device.
fn baseline_rules(device_id: i64) -> Vec<FirewallRule> {
    let mut rng = StdRng::seed_from_u64(device_id as u64);
    let rule = |id: u32, chain: &str, action: &str, protocol: Option<&str>, port: Option<&str>, comment: &str| {
        FirewallRule {
            rule_id: format!("*{:X}", id),
            chain: chain.to_string(),
            action: action.to_string(),
            protocol: protocol.map(str::to_string),
            src_address: None,
            dst_address: None,
            dst_port: port.map(str::to_string),
            comment: Some(comment.to_string()),
            disabled: false,
            bytes: 0,
            packets: 0,
        }
    };

    let mut rules = vec![
        rule(1, "input", "accept", None, None, "accept established,related"),
        rule(2, "input", "drop", None, None, "drop invalid"),
        rule(3, "input", "accept", Some("icmp"), None, "accept ICMP"),
        rule(4, "input", "accept", Some("tcp"), Some("22,8291"), "management"),
        rule(5, "forward", "fasttrack-connection", None, None, "fasttrack"),
        rule(6, "input", "drop", None, None, "drop all not coming from LAN"),
    ];
    if rng.gen_bool(0.5) {
        rules.push(rule(7, "forward", "drop", Some("tcp"), Some("23"), "block telnet"));
    }
    rules
}

#[async_trait]
impl RouterApi for SimulatedRouter {
    async fn login(&self, device: &Device) -> Result<(), ConnectionError> {
        if !reachable(&device.address) || device.port == 0 {
            return Err(ConnectionError::Unreachable {
                device_id: device.id,
                reason: format!("cannot resolve {}:{}", device.address, device.port),
            });
        }
        if device.username.is_empty() {
            return Err(ConnectionError::AuthFailed(device.id));
        }
        self.round_trip(device).await?;
        debug!("Simulated session opened for device {}", device.id);
        Ok(())
    }

    async fn logout(&self, device: &Device) {
        debug!("Simulated session closed for device {}", device.id);
    }

    async fn system_resources(&self, device: &Device) -> Result<SystemResources, ConnectionError> {
        self.round_trip(device).await?;
        let mut rng = rand::thread_rng();
        let total_memory: u64 = 256 * 1024 * 1024;
        Ok(SystemResources {
            cpu_load: rng.gen_range(1.0..85.0),
            free_memory: rng.gen_range(total_memory / 8..total_memory / 2),
            total_memory,
            uptime_secs: rng.gen_range(3_600..3_600 * 24 * 90),
            temperature: Some(rng.gen_range(35.0..62.0)),
            board_name: if device.has_capsman { "RB4011" } else { "hAP ac2" }.to_string(),
            version: "7.14.3 (stable)".to_string(),
        })
    }

    async fn interfaces(&self, device: &Device) -> Result<Vec<InterfaceStats>, ConnectionError> {
        self.round_trip(device).await?;
        let mut rng = rand::thread_rng();
        let mut names: Vec<(String, &str)> = (1..=5).map(|i| (format!("ether{}", i), "ether")).collect();
        names.push(("bridge".to_string(), "bridge"));
        if device.has_wireless {
            names.push(("wlan1".to_string(), "wlan"));
            names.push(("wlan2".to_string(), "wlan"));
        }

        Ok(names
            .into_iter()
            .map(|(name, kind)| {
                let running = name == "ether1" || name == "bridge" || rng.gen_bool(0.7);
                let rx_packets = if running { rng.gen_range(1_000..5_000_000) } else { 0 };
                let tx_packets = if running { rng.gen_range(1_000..5_000_000) } else { 0 };
                InterfaceStats {
                    name,
                    interface_type: kind.to_string(),
                    running,
                    rx_bytes: rx_packets * rng.gen_range(64..1_400),
                    tx_bytes: tx_packets * rng.gen_range(64..1_400),
                    rx_packets,
                    tx_packets,
                    rx_errors: rng.gen_range(0..5),
                    tx_errors: rng.gen_range(0..3),
                }
            })
            .collect())
    }

    async fn firewall_rules(&self, device: &Device) -> Result<Vec<FirewallRule>, ConnectionError> {
        self.round_trip(device).await?;
        let mut rng = rand::thread_rng();
        Ok(baseline_rules(device.id)
            .into_iter()
            .map(|mut rule| {
                rule.packets = rng.gen_range(0..200_000);
                rule.bytes = rule.packets * rng.gen_range(60..1_200);
                rule
            })
            .collect())
    }

    async fn wireless_interfaces(&self, device: &Device) -> Result<Vec<WirelessInterface>, ConnectionError> {
        self.round_trip(device).await?;
        if !device.has_wireless {
            return Ok(Vec::new());
        }
        let mut rng = rand::thread_rng();
        Ok(vec![
            WirelessInterface {
                name: "wlan1".to_string(),
                ssid: format!("{}-2G", device.name),
                band: "2ghz-b/g/n".to_string(),
                frequency: [2412, 2437, 2462][rng.gen_range(0..3)],
                noise_floor: rng.gen_range(-110..-95),
                client_count: rng.gen_range(0..25),
            },
            WirelessInterface {
                name: "wlan2".to_string(),
                ssid: format!("{}-5G", device.name),
                band: "5ghz-a/n/ac".to_string(),
                frequency: [5180, 5220, 5745][rng.gen_range(0..3)],
                noise_floor: rng.gen_range(-115..-100),
                client_count: rng.gen_range(0..40),
            },
        ])
    }

    async fn wireless_clients(&self, device: &Device) -> Result<Vec<WirelessClient>, ConnectionError> {
        self.round_trip(device).await?;
        if !device.has_wireless {
            return Ok(Vec::new());
        }
        let mut rng = rand::thread_rng();
        let count = rng.gen_range(0..12u32);
        Ok((0..count)
            .map(|i| WirelessClient {
                mac_address: mac_for(device.id, i),
                interface: if i % 2 == 0 { "wlan1" } else { "wlan2" }.to_string(),
                signal_strength: rng.gen_range(-85..-35),
                tx_rate_mbps: rng.gen_range(6.0..866.0),
                rx_rate_mbps: rng.gen_range(6.0..866.0),
                uptime_secs: rng.gen_range(10..86_400),
            })
            .collect())
    }

    async fn capsman_access_points(&self, device: &Device) -> Result<Vec<CapsmanAccessPoint>, ConnectionError> {
        self.round_trip(device).await?;
        if !device.has_capsman {
            return Ok(Vec::new());
        }
        let mut rng = rand::thread_rng();
        Ok((1..=3u32)
            .map(|i| CapsmanAccessPoint {
                identity: format!("cap-{}", i),
                mac_address: mac_for(device.id, 0x100 + i),
                address: format!("192.168.88.{}", 10 + i),
                state: if rng.gen_bool(0.9) { "Run" } else { "Selecting" }.to_string(),
                radio_count: 2,
                client_count: rng.gen_range(0..30),
            })
            .collect())
    }

    async fn traffic_samples(&self, device: &Device) -> Result<Vec<TrafficSample>, ConnectionError> {
        self.round_trip(device).await?;
        let mut rng = rand::thread_rng();
        let flows = rng.gen_range(3..8);
        Ok((0..flows).map(|_| random_flow(&mut rng)).collect())
    }
}

fn random_flow(rng: &mut impl Rng) -> TrafficSample {
    let (protocol, port) = match rng.gen_range(0..5) {
        0 => ("udp", 53),
        1 => ("tcp", 80),
        2 => ("tcp", 22),
        3 => ("udp", 123),
        _ => ("tcp", 443),
    };
    let tcp = protocol == "tcp";
    let count = rng.gen_range(2..40);
    let mut timestamp_us = 0;

    let packets = (0..count)
        .map(|i| {
            timestamp_us += rng.gen_range(50..200_000);
            let direction = if i % 3 == 1 { Direction::Backward } else { Direction::Forward };
            let flags = if tcp {
                TcpFlags {
                    syn: i == 0,
                    ack: i > 0,
                    psh: i > 0 && rng.gen_bool(0.3),
                    fin: i + 1 == count,
                    ..TcpFlags::default()
                }
            } else {
                TcpFlags::default()
            };
            PacketObservation {
                direction,
                timestamp_us,
                length: rng.gen_range(40..1_500),
                header_length: if tcp { 32 } else { 8 },
                flags,
            }
        })
        .collect();

    TrafficSample {
        source_ip: format!("192.168.88.{}", rng.gen_range(2..254)),
        destination_ip: format!("203.0.113.{}", rng.gen_range(1..254)),
        destination_port: port,
        protocol: protocol.to_string(),
        packets,
    }
}
