use crate::config::NodeConfig;
use crate::protocol::{self, Envelope};
use crate::state::MeshStatsSnapshot;
use crate::transport::{self, TransportError};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Callback invoked with each fully received envelope and the address it came from.
pub type DataHandler = Arc<dyn Fn(Envelope, SocketAddr) + Send + Sync>;

#[derive(Debug, Default)]
pub struct MeshStats {
    pub rx_bytes: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub frames_accepted: AtomicU64,
    pub frames_rejected: AtomicU64,
    pub sends_failed: AtomicU64,
}

impl MeshStats {
    pub fn snapshot(&self) -> MeshStatsSnapshot {
        MeshStatsSnapshot {
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            frames_accepted: self.frames_accepted.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            sends_failed: self.sends_failed.load(Ordering::Relaxed),
        }
    }
}

/// Send attempts started by one [`Mesh::broadcast`].
///
/// Dropping it leaves the sends running in the background.
pub struct Dispatch {
    sends: Vec<(IpAddr, JoinHandle<Result<(), TransportError>>)>,
}

impl Dispatch {
    pub fn len(&self) -> usize {
        self.sends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sends.is_empty()
    }

    /// Waits for every send to finish or time out.
    pub async fn settled(self) -> Vec<(IpAddr, Result<(), String>)> {
        let mut outcomes = Vec::with_capacity(self.sends.len());
        for (peer, handle) in self.sends {
            let outcome = match handle.await {
                Ok(res) => res.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            outcomes.push((peer, outcome));
        }
        outcomes
    }
}

/// Gossip mesh: one TCP connection per envelope, every member on the same port.
pub struct Mesh {
    peers: Vec<IpAddr>,
    port: u16,
    send_timeout: Duration,
    recv_timeout: Duration,
    max_frame_bytes: u64,
    handler: Arc<RwLock<Option<DataHandler>>>,
    listening: Mutex<Option<SocketAddr>>,
    stats: Arc<MeshStats>,
}

impl Mesh {
    /// Builds the mesh, dropping this host's own address from the peer list.
    /// If the local address cannot be determined, the list is kept whole.
    pub fn new(config: &NodeConfig) -> Self {
        let local_ip = transport::probe_local_ip(config.probe_target);
        match local_ip {
            Some(ip) => info!("Local address is {}", ip),
            None => warn!("Could not determine local address, peer list left unfiltered"),
        }
        Self::with_local_ip(config, local_ip)
    }

    pub fn with_local_ip(config: &NodeConfig, local_ip: Option<IpAddr>) -> Self {
        let peers = config
            .peers
            .iter()
            .copied()
            .filter(|p| Some(*p) != local_ip)
            .collect();

        Self {
            peers,
            port: config.listen_port,
            send_timeout: config.send_timeout(),
            recv_timeout: config.recv_timeout(),
            max_frame_bytes: config.max_frame_bytes,
            handler: Arc::new(RwLock::new(None)),
            listening: Mutex::new(None),
            stats: Arc::new(MeshStats::default()),
        }
    }

    pub fn peers(&self) -> &[IpAddr] {
        &self.peers
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stats(&self) -> Arc<MeshStats> {
        self.stats.clone()
    }

    /// Registers the callback for inbound envelopes, replacing any previous one.
    /// It runs on connection handler tasks, possibly several at once.
    pub fn set_on_data<F>(&self, handler: F)
    where
        F: Fn(Envelope, SocketAddr) + Send + Sync + 'static,
    {
        let handler: DataHandler = Arc::new(handler);
        *self.handler.write() = Some(handler);
    }

    /// Sends the envelope to every peer, each on its own task. Failures stay
    /// inside the task: they are logged and counted, never returned.
    pub fn broadcast(&self, description: &str, image: Bytes) -> Dispatch {
        let frame = match protocol::encode(description, &image) {
            Ok(f) => f,
            Err(e) => {
                warn!("Dropping broadcast, envelope does not encode: {}", e);
                return Dispatch { sends: Vec::new() };
            }
        };

        let sends = self
            .peers
            .iter()
            .map(|&peer| {
                let frame = frame.clone();
                let stats = self.stats.clone();
                let addr = SocketAddr::new(peer, self.port);
                let timeout = self.send_timeout;

                let handle = tokio::spawn(async move {
                    let len = frame.len() as u64;
                    let res = transport::send_frame(addr, frame, timeout).await;
                    match &res {
                        Ok(()) => {
                            stats.tx_bytes.fetch_add(len, Ordering::Relaxed);
                        }
                        Err(e) => {
                            stats.sends_failed.fetch_add(1, Ordering::Relaxed);
                            debug!("Send to {} failed: {}", addr, e);
                        }
                    }
                    res
                });
                (peer, handle)
            })
            .collect();

        Dispatch { sends }
    }

    /// Binds `0.0.0.0:<port>` and accepts connections on a background task.
    /// Calling it again returns the address already bound.
    pub fn start_receiver(&self) -> std::io::Result<SocketAddr> {
        let mut listening = self.listening.lock();
        if let Some(addr) = *listening {
            return Ok(addr);
        }

        let listener = transport::bind_listener(self.port)?;
        let local_addr = listener.local_addr()?;
        *listening = Some(local_addr);

        let handler = self.handler.clone();
        let stats = self.stats.clone();
        let max_frame_bytes = self.max_frame_bytes;
        let recv_timeout = self.recv_timeout;

        tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };

                let handler = handler.clone();
                let stats = stats.clone();
                tokio::spawn(async move {
                    handle_connection(stream, remote, max_frame_bytes, recv_timeout, handler, stats)
                        .await;
                });
            }
        });

        info!("Receiver started on {}", local_addr);
        Ok(local_addr)
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    remote: SocketAddr,
    max_frame_bytes: u64,
    recv_timeout: Duration,
    handler: Arc<RwLock<Option<DataHandler>>>,
    stats: Arc<MeshStats>,
) {
    // Stalled or half-open senders are cut off at the timeout.
    let frame = match transport::read_frame(&mut stream, max_frame_bytes, recv_timeout).await {
        Ok(Some(f)) => f,
        Ok(None) => {
            debug!("{} closed before sending a frame header", remote);
            return;
        }
        Err(e) => {
            stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
            warn!("Failed to read frame from {}: {}", remote, e);
            return;
        }
    };
    stats.rx_bytes.fetch_add(frame.len() as u64, Ordering::Relaxed);

    let envelope = match protocol::decode(frame) {
        Ok(env) => env,
        Err(e) => {
            stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
            warn!("Malformed frame from {}: {}", remote, e);
            return;
        }
    };
    stats.frames_accepted.fetch_add(1, Ordering::Relaxed);
    info!(
        "Received from {}: {} ({} image bytes)",
        remote,
        envelope.description(),
        envelope.image().len()
    );

    let callback = handler.read().clone();
    match callback {
        Some(cb) => cb(envelope, remote),
        None => debug!("No data handler registered, dropping envelope from {}", remote),
    }
}
