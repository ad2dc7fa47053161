use serde::{Deserialize, Serialize};

#[derive(Clone, Serialize, Deserialize, Debug, Default)]
pub struct NodeState {
    pub uptime_secs: u64,
    pub peers: Vec<String>,
    pub mesh: MeshStatsSnapshot,
    pub schedule: ScheduleStatsSnapshot,
    pub pending: Vec<PendingRecord>,
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct MeshStatsSnapshot {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub frames_accepted: u64,
    pub frames_rejected: u64,
    pub sends_failed: u64,
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct ScheduleStatsSnapshot {
    pub ticks: u64,
    pub flushes: u64,
    pub records_trained: u64,
    pub last_loss: Option<f32>,
    pub last_caption: Option<String>,
}

/// A peer record waiting for the next flush.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct PendingRecord {
    pub peer: String,
    pub description: String,
    pub image_bytes: usize,
}

// Shared State Container
pub type SharedState = std::sync::Arc<tokio::sync::Mutex<NodeState>>;
