use crate::protocol::Envelope;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info};

/// Latest envelope received from one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub image: Bytes,
    pub description: String,
}

/// Records drained in a single flush.
#[derive(Debug, Default)]
pub struct TrainingBatch {
    pub records: Vec<(IpAddr, PeerRecord)>,
}

impl TrainingBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl IntoIterator for TrainingBatch {
    type Item = (IpAddr, PeerRecord);
    type IntoIter = std::vec::IntoIter<(IpAddr, PeerRecord)>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

/// Last-writer-wins store of what each peer gossiped since the previous flush.
///
/// Written from mesh handler tasks, drained by the scheduler. The lock is
/// only held for the map operation itself.
#[derive(Debug, Default)]
pub struct PeerRecords {
    inner: Mutex<HashMap<IpAddr, PeerRecord>>,
}

impl PeerRecords {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `record` for `peer`, returning the record it replaced.
    pub fn put(&self, peer: IpAddr, record: PeerRecord) -> Option<PeerRecord> {
        self.inner.lock().insert(peer, record)
    }

    /// Stores an inbound envelope as the pending record of the host that sent it.
    /// The source port is ephemeral and plays no part in the key.
    pub fn on_envelope(&self, envelope: Envelope, from: SocketAddr) {
        let (description, image) = envelope.into_parts();
        if self.put(from.ip(), PeerRecord { image, description }).is_some() {
            info!("Replaced pending record from {}", from.ip());
        }
        debug!("{} peer records pending", self.len());
    }

    /// Takes every pending record and leaves the store empty.
    pub fn drain_all(&self) -> TrainingBatch {
        let taken = std::mem::take(&mut *self.inner.lock());
        let mut records: Vec<_> = taken.into_iter().collect();
        records.sort_by_key(|(peer, _)| *peer);
        TrainingBatch { records }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Peer, description and image size of each pending record.
    pub fn pending(&self) -> Vec<(IpAddr, String, usize)> {
        let inner = self.inner.lock();
        let mut pending: Vec<_> = inner
            .iter()
            .map(|(peer, r)| (*peer, r.description.clone(), r.image.len()))
            .collect();
        pending.sort_by_key(|(peer, _, _)| *peer);
        pending
    }
}

/// Mesh data handler that files every inbound envelope into `records`.
pub fn sink(records: Arc<PeerRecords>) -> impl Fn(Envelope, SocketAddr) + Send + Sync + 'static {
    move |envelope, from| records.on_envelope(envelope, from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn record(description: &str) -> PeerRecord {
        PeerRecord {
            image: Bytes::from(description.as_bytes().to_vec()),
            description: description.to_string(),
        }
    }

    #[test]
    fn test_last_write_wins() {
        let store = PeerRecords::new();
        let peer: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(store.put(peer, record("first")).is_none());
        assert_eq!(store.put(peer, record("second")), Some(record("first")));

        let batch = store.drain_all();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.records[0], (peer, record("second")));
        assert!(store.is_empty());
    }

    #[test]
    fn test_drain_empty() {
        let store = PeerRecords::new();
        let batch = store.drain_all();
        assert!(batch.is_empty());
        assert!(store.drain_all().is_empty());
    }

    #[test]
    fn test_drain_keeps_later_puts() {
        let store = PeerRecords::new();
        let a: IpAddr = "10.0.0.2".parse().unwrap();
        let b: IpAddr = "10.0.0.3".parse().unwrap();

        store.put(a, record("a1"));
        store.put(b, record("b1"));
        assert_eq!(store.drain_all().len(), 2);

        store.put(a, record("a2"));
        let batch = store.drain_all();
        assert_eq!(batch.records, vec![(a, record("a2"))]);
    }

    #[test]
    fn test_concurrent_put_and_drain() {
        let store = Arc::new(PeerRecords::new());
        let writers = 4;
        let per_writer = 250u32;

        let handles: Vec<_> = (0..writers)
            .map(|w| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..per_writer {
                        let ip = IpAddr::from([10, w as u8, (i >> 8) as u8, i as u8]);
                        store.put(ip, record(&format!("{w}-{i}")));
                    }
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        while handles.iter().any(|h| !h.is_finished()) {
            for (peer, _) in store.drain_all() {
                seen.insert(peer);
                total += 1;
            }
        }
        for h in handles {
            h.join().unwrap();
        }
        for (peer, _) in store.drain_all() {
            seen.insert(peer);
            total += 1;
        }

        // Every key is unique, so each put shows up in exactly one drain.
        assert_eq!(total, writers * per_writer as usize);
        assert_eq!(seen.len(), total);
    }

    #[test]
    fn test_sink_keys_by_sender_ip() {
        let store = Arc::new(PeerRecords::new());
        let handler = sink(store.clone());

        handler(
            Envelope::new("old", Bytes::from_static(b"a")),
            "10.0.0.2:40001".parse().unwrap(),
        );
        handler(
            Envelope::new("new", Bytes::from_static(b"b")),
            "10.0.0.2:40002".parse().unwrap(),
        );
        handler(
            Envelope::new("other", Bytes::new()),
            "10.0.0.3:40001".parse().unwrap(),
        );

        let batch = store.drain_all();
        assert_eq!(batch.len(), 2);
        let a: IpAddr = "10.0.0.2".parse().unwrap();
        assert_eq!(
            batch.records[0],
            (
                a,
                PeerRecord {
                    image: Bytes::from_static(b"b"),
                    description: "new".to_string(),
                }
            )
        );
        assert_eq!(batch.records[1].1.description, "other");
    }

    #[test]
    fn test_pending_summary() {
        let store = PeerRecords::new();
        store.put("10.0.0.3".parse().unwrap(), record("later"));
        store.put("10.0.0.2".parse().unwrap(), record("hey"));

        let pending = store.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].1, "hey");
        assert_eq!(pending[0].2, 3);
        assert_eq!(store.len(), 2);
    }
}
