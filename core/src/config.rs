// Engine configuration
//
// Stored as pretty-printed JSON. Missing fields fall back to defaults so
// older config files keep loading.

use crate::crypto::SchemeId;
use crate::packet::UnencryptedEmailPacket;
use crate::relay::pow::MAX_POW_BITS;
use crate::relay::MAX_RELAY_HOPS;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// sled database location; `None` keeps everything in memory
    pub storage_path: Option<PathBuf>,
    pub packets: PacketConfig,
    pub send_queue: SendQueueConfig,
    pub relay: RelayConfig,
    pub peers: PeerConfig,
    pub mail_check: MailCheckConfig,
    pub outbox: OutboxConfig,
    pub delivery: DeliveryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketConfig {
    /// Maximum payload bytes per email fragment
    pub max_fragment_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendQueueConfig {
    /// Outbound bandwidth cap in kbit/s, 0 = unlimited
    pub max_bandwidth_kbits: u32,
    /// Pause after a transport error
    pub failure_pause_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay peers between us and the storing node; 0 stores directly
    pub hops: u8,
    pub min_delay_secs: u64,
    pub max_delay_secs: u64,
    /// Proof-of-work bits stamped on each relay layer we create
    pub pow_bits_per_hop: u8,
    /// Proof-of-work bits we require before relaying for others
    pub min_pow_bits: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub max_peers: usize,
    /// Reachability samples kept per peer
    pub sample_window: usize,
    pub reachability_threshold_percent: u8,
    pub update_interval_secs: u64,
    /// Update interval while no peer meets the threshold
    pub fast_update_interval_secs: u64,
    pub response_timeout_secs: u64,
    pub peer_file: Option<PathBuf>,
    /// Base64 destinations used when the peer file is empty
    pub bootstrap_peers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailCheckConfig {
    pub auto_check: bool,
    pub interval_mins: u64,
    /// Concurrent fragment fetches per check cycle
    pub fetch_workers: usize,
    pub fetch_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub interval_mins: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_path: None,
            packets: PacketConfig::default(),
            send_queue: SendQueueConfig::default(),
            relay: RelayConfig::default(),
            peers: PeerConfig::default(),
            mail_check: MailCheckConfig::default(),
            outbox: OutboxConfig::default(),
            delivery: DeliveryConfig::default(),
        }
    }
}

impl Default for PacketConfig {
    fn default() -> Self {
        Self {
            max_fragment_size: 10_000,
        }
    }
}

impl Default for SendQueueConfig {
    fn default() -> Self {
        Self {
            max_bandwidth_kbits: 0,
            failure_pause_ms: 1_000,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            hops: 0,
            min_delay_secs: 0,
            max_delay_secs: 120,
            pow_bits_per_hop: 12,
            min_pow_bits: 8,
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_peers: 50,
            sample_window: 20,
            reachability_threshold_percent: 80,
            update_interval_secs: 1_200,
            fast_update_interval_secs: 120,
            response_timeout_secs: 120,
            peer_file: None,
            bootstrap_peers: Vec::new(),
        }
    }
}

impl Default for MailCheckConfig {
    fn default() -> Self {
        Self {
            auto_check: true,
            interval_mins: 30,
            fetch_workers: 8,
            fetch_timeout_secs: 60,
        }
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self { interval_secs: 600 }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self { interval_mins: 30 }
    }
}

impl RelayConfig {
    pub fn delay_range(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.min_delay_secs),
            Duration::from_secs(self.max_delay_secs),
        )
    }
}

impl PeerConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn fast_update_interval(&self) -> Duration {
        Duration::from_secs(self.fast_update_interval_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

impl MailCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_mins * 60)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

impl OutboxConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl DeliveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_mins * 60)
    }
}

impl EngineConfig {
    /// Load from `path`, writing defaults there if the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: EngineConfig =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config.validate()?;
            Ok(config)
        } else {
            let config = EngineConfig::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let max_fragment = max_fragment_size();
        if self.packets.max_fragment_size == 0 || self.packets.max_fragment_size > max_fragment {
            anyhow::bail!(
                "packets.max_fragment_size must be between 1 and {}",
                max_fragment
            );
        }
        if self.mail_check.fetch_workers == 0 {
            anyhow::bail!("mail_check.fetch_workers must be at least 1");
        }
        if self.peers.reachability_threshold_percent > 100 {
            anyhow::bail!("peers.reachability_threshold_percent must be at most 100");
        }
        if self.peers.sample_window == 0 {
            anyhow::bail!("peers.sample_window must be at least 1");
        }
        if self.relay.min_delay_secs > self.relay.max_delay_secs {
            anyhow::bail!("relay.min_delay_secs must not exceed relay.max_delay_secs");
        }
        if self.relay.pow_bits_per_hop > MAX_POW_BITS || self.relay.min_pow_bits > MAX_POW_BITS {
            anyhow::bail!("proof-of-work bits must be at most {}", MAX_POW_BITS);
        }
        if usize::from(self.relay.hops) > MAX_RELAY_HOPS {
            anyhow::bail!("relay.hops must be at most {}", MAX_RELAY_HOPS);
        }
        Ok(())
    }

    /// Set a value by dotted key, e.g. `relay.hops`
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
        where
            T::Err: std::error::Error + Send + Sync + 'static,
        {
            value
                .parse()
                .with_context(|| format!("Invalid value for {}: {}", key, value))
        }

        let mut updated = self.clone();
        match key {
            "storage_path" => {
                updated.storage_path = (!value.is_empty()).then(|| PathBuf::from(value));
            }
            "packets.max_fragment_size" => updated.packets.max_fragment_size = parse(key, value)?,
            "send_queue.max_bandwidth_kbits" => {
                updated.send_queue.max_bandwidth_kbits = parse(key, value)?
            }
            "relay.hops" => updated.relay.hops = parse(key, value)?,
            "relay.min_delay_secs" => updated.relay.min_delay_secs = parse(key, value)?,
            "relay.max_delay_secs" => updated.relay.max_delay_secs = parse(key, value)?,
            "relay.pow_bits_per_hop" => updated.relay.pow_bits_per_hop = parse(key, value)?,
            "relay.min_pow_bits" => updated.relay.min_pow_bits = parse(key, value)?,
            "peers.max_peers" => updated.peers.max_peers = parse(key, value)?,
            "peers.reachability_threshold_percent" => {
                updated.peers.reachability_threshold_percent = parse(key, value)?
            }
            "mail_check.auto_check" => updated.mail_check.auto_check = parse(key, value)?,
            "mail_check.interval_mins" => updated.mail_check.interval_mins = parse(key, value)?,
            "mail_check.fetch_workers" => updated.mail_check.fetch_workers = parse(key, value)?,
            "outbox.interval_secs" => updated.outbox.interval_secs = parse(key, value)?,
            "delivery.interval_mins" => updated.delivery.interval_mins = parse(key, value)?,
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

/// Largest fragment payload every scheme can encrypt into one packet
pub fn max_fragment_size() -> usize {
    SchemeId::ALL
        .into_iter()
        .map(UnencryptedEmailPacket::max_payload_len)
        .min()
        .unwrap_or(0)
}
