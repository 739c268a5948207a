use crate::call::router::RoutingRule;
use anyhow::Error;
use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    #[clap(long, default_value = "callswitch.toml")]
    pub conf: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    pub call: CallConfig,
    pub signaling: SignalingConfig,
    pub routing: RoutingConfig,
    /// Per-queue overrides, keyed by queue name. Queues not listed here
    /// are created on first reference with `QueueConfig::default()`.
    pub queues: HashMap<String, QueueConfig>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CallConfig {
    pub max_concurrent_calls: usize,
    /// Default concurrent-call limit per caller number, 0 means unlimited.
    pub max_calls_per_number: usize,
    /// Per-number overrides of `max_calls_per_number`.
    pub number_limits: HashMap<String, usize>,
    pub ring_timeout_secs: u64,
    /// Grace period before a terminal session is dropped from the active table.
    pub cleanup_delay_secs: u64,
    pub queue_sweep_secs: u64,
    /// Number prefixes that force emergency priority, matched with any
    /// leading `+` stripped first.
    pub emergency_prefixes: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SignalingConfig {
    /// JSON-RPC endpoint of the external signaling proxy.
    pub endpoint: String,
    pub flush_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RoutingConfig {
    pub blacklist: Vec<String>,
    pub whitelist: Vec<String>,
    pub rules: Vec<RoutingRule>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub max_size: usize,
    pub timeout_secs: u64,
    /// Per-call handling estimate used for the estimated-wait hint
    /// returned with a queue decision.
    pub estimated_handle_secs: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 1000,
            max_calls_per_number: 3,
            number_limits: HashMap::new(),
            ring_timeout_secs: 60,
            cleanup_delay_secs: 60,
            queue_sweep_secs: 5,
            emergency_prefixes: vec![
                "911".to_string(),
                "112".to_string(),
                "999".to_string(),
                "1911".to_string(),
            ],
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:5060/RPC".to_string(),
            flush_interval_secs: 5,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            timeout_secs: 300,
            estimated_handle_secs: 30,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }
}
