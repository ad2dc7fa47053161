use crate::config::ScheduleConfig;
use crate::devices::{DeviceError, Devices};
use crate::mesh::Mesh;
use crate::records::PeerRecords;
use crate::state::ScheduleStatsSnapshot;
use parking_lot::Mutex;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pace,
    Capture,
    Infer,
    Present,
    Train,
    Persist,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Pace => "pace",
            Phase::Capture => "capture",
            Phase::Infer => "infer",
            Phase::Present => "present",
            Phase::Train => "train",
            Phase::Persist => "persist",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("capture phase produced no frame")]
    NoFrame,
    #[error("{phase} phase failed: {source}")]
    Phase {
        phase: Phase,
        #[source]
        source: DeviceError,
    },
}

fn in_phase(phase: Phase) -> impl FnOnce(DeviceError) -> SchedulerError {
    move |source| SchedulerError::Phase { phase, source }
}

/// When the last flush happened. Starts at scheduler creation.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleState {
    pub last_flush: Instant,
}

#[derive(Debug, Default)]
pub struct FlushReport {
    pub losses: Vec<(IpAddr, f32)>,
    pub persisted: bool,
}

#[derive(Debug, Default)]
pub struct ScheduleStats {
    ticks: AtomicU64,
    flushes: AtomicU64,
    records_trained: AtomicU64,
    last_loss: Mutex<Option<f32>>,
    last_caption: Mutex<Option<String>>,
}

impl ScheduleStats {
    pub fn snapshot(&self) -> ScheduleStatsSnapshot {
        ScheduleStatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            records_trained: self.records_trained.load(Ordering::Relaxed),
            last_loss: *self.last_loss.lock(),
            last_caption: self.last_caption.lock().clone(),
        }
    }
}

/// Main control loop: pace, capture, infer, broadcast, present, and every
/// `flush_interval` train on whatever peers sent since the last flush.
pub struct Scheduler {
    config: ScheduleConfig,
    mesh: Arc<Mesh>,
    records: Arc<PeerRecords>,
    devices: Devices,
    state: ScheduleState,
    stats: Arc<ScheduleStats>,
}

impl Scheduler {
    pub fn new(
        config: ScheduleConfig,
        mesh: Arc<Mesh>,
        records: Arc<PeerRecords>,
        devices: Devices,
    ) -> Self {
        Self {
            config,
            mesh,
            records,
            devices,
            state: ScheduleState {
                last_flush: Instant::now(),
            },
            stats: Arc::new(ScheduleStats::default()),
        }
    }

    #[allow(dead_code)]
    pub fn state(&self) -> ScheduleState {
        self.state
    }

    pub fn stats(&self) -> Arc<ScheduleStats> {
        self.stats.clone()
    }

    /// Ticks until capture comes back empty or a collaborator fails.
    pub async fn run(&mut self) -> Result<(), SchedulerError> {
        loop {
            self.tick().await?;
        }
    }

    pub async fn tick(&mut self) -> Result<(), SchedulerError> {
        self.devices
            .indicator
            .pulse(self.config.tick_delay())
            .await
            .map_err(in_phase(Phase::Pace))?;

        let image = self
            .devices
            .camera
            .capture()
            .await
            .map_err(in_phase(Phase::Capture))?
            .ok_or(SchedulerError::NoFrame)?;

        let caption = self
            .devices
            .engine
            .infer(&image, &self.config.inference_prompt)
            .await
            .map_err(in_phase(Phase::Infer))?;
        info!("Caption: {}", caption);

        // Sends continue in the background; the tick does not wait for them.
        let dispatch = self.mesh.broadcast(&caption, image);
        if dispatch.is_empty() {
            debug!("No peers to gossip to");
        } else {
            debug!("Broadcast dispatched to {} peers", dispatch.len());
        }

        let bitmap = self
            .devices
            .renderer
            .render(&caption)
            .await
            .map_err(in_phase(Phase::Present))?;
        self.devices
            .display
            .transmit(&bitmap)
            .await
            .map_err(in_phase(Phase::Present))?;

        self.stats.ticks.fetch_add(1, Ordering::Relaxed);
        *self.stats.last_caption.lock() = Some(caption);

        if let Some(report) = self.maybe_flush(Instant::now()).await? {
            debug!(
                "Flush done: {} records trained, persisted: {}",
                report.losses.len(),
                report.persisted
            );
        }
        Ok(())
    }

    /// Trains on every pending peer record once `flush_interval` has passed
    /// since the last flush. The flush time moves to `now` even when nothing
    /// was pending.
    pub async fn maybe_flush(
        &mut self,
        now: Instant,
    ) -> Result<Option<FlushReport>, SchedulerError> {
        let elapsed = now.saturating_duration_since(self.state.last_flush);
        if elapsed <= self.config.flush_interval() {
            return Ok(None);
        }

        let batch = self.records.drain_all();
        info!("Flushing {} peer records", batch.len());

        let mut report = FlushReport::default();
        let had_records = !batch.is_empty();
        for (peer, record) in batch {
            let loss = self
                .devices
                .engine
                .train(&record.image, &record.description, self.config.train_steps)
                .await
                .map_err(in_phase(Phase::Train))?;
            info!("Trained on record from {}: loss {:.4}", peer, loss);

            self.stats.records_trained.fetch_add(1, Ordering::Relaxed);
            *self.stats.last_loss.lock() = Some(loss);
            report.losses.push((peer, loss));
        }

        if had_records {
            self.devices
                .engine
                .persist()
                .await
                .map_err(in_phase(Phase::Persist))?;
            report.persisted = true;
            info!("Persisted model after {} records", report.losses.len());
        }

        self.state.last_flush = now;
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(Some(report))
    }
}
