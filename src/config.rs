use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    pub devices: DevicesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    /// Port every mesh member listens on and dials.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    pub peers: Vec<IpAddr>,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    /// Longest an inbound connection may take to deliver its frame.
    #[serde(default = "default_recv_timeout_secs")]
    pub recv_timeout_secs: u64,
    // Inbound frames declaring a larger payload are dropped before buffering
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: u64,
    /// Address used to discover which local interface faces the network.
    #[serde(default = "default_probe_target")]
    pub probe_target: SocketAddr,
    #[serde(default = "default_api_listen")]
    pub api_listen: SocketAddr,
}

impl NodeConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_secs(self.recv_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    #[serde(default = "default_tick_delay_secs")]
    pub tick_delay_secs: u64,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_train_steps")]
    pub train_steps: u32,
    #[serde(default = "default_inference_prompt")]
    pub inference_prompt: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            tick_delay_secs: default_tick_delay_secs(),
            flush_interval_secs: default_flush_interval_secs(),
            train_steps: default_train_steps(),
            inference_prompt: default_inference_prompt(),
        }
    }
}

impl ScheduleConfig {
    pub fn tick_delay(&self) -> Duration {
        Duration::from_secs(self.tick_delay_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DevicesConfig {
    pub camera: CameraConfig,
    pub engine: EngineConfig,
    pub render_command: String,
    #[serde(default)]
    pub display: DisplayConfig,
    pub led: Option<LedConfig>,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CameraConfig {
    /// A still image on disk, re-read every tick.
    File { path: PathBuf },
    /// A program whose stdout is one encoded frame.
    Command { command: String },
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    pub infer_command: String,
    pub train_command: String,
    pub persist_command: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DisplayConfig {
    Serial {
        path: PathBuf,
    },
    #[default]
    Log,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedConfig {
    pub path: PathBuf,
}

fn default_listen_port() -> u16 {
    5000
}

fn default_send_timeout_secs() -> u64 {
    5
}

fn default_recv_timeout_secs() -> u64 {
    30
}

fn default_max_frame_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_probe_target() -> SocketAddr {
    SocketAddr::from(([8, 8, 8, 8], 1))
}

fn default_api_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

fn default_tick_delay_secs() -> u64 {
    10
}

fn default_flush_interval_secs() -> u64 {
    15 * 60
}

fn default_train_steps() -> u32 {
    1
}

fn default_inference_prompt() -> String {
    "Produce an adversarial caption for this image.".to_string()
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&content)?;
        Ok(cfg)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
}
