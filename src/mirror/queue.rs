/// Bounded background fetch queue
///
/// A fixed pool of worker threads pulls fetch jobs from a bounded channel.
/// Every job has a status that callers can poll, wait on or cancel while
/// it is still queued. A full queue rejects new work instead of blocking.
use crate::config::loader::MirrorConfig;
use crate::config::types::MirrorError;
use crate::mirror::{AssetMirror, MirrorResult, RemoteAsset};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FetchTicket(u64);

impl fmt::Display for FetchTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fetch-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStatus {
    Queued,
    Running,
    Fetched(PathBuf),
    Failed(String),
    Cancelled,
}

impl FetchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FetchStatus::Fetched(_) | FetchStatus::Failed(_) | FetchStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone)]
pub struct FetchRecord {
    pub ticket: FetchTicket,
    pub asset: RemoteAsset,
    pub status: FetchStatus,
}

struct FetchJob {
    ticket: FetchTicket,
    asset_id: String,
}

#[derive(Default)]
struct Shared {
    records: Mutex<HashMap<FetchTicket, FetchRecord>>,
    changed: Condvar,
}

impl Shared {
    fn records(&self) -> MutexGuard<'_, HashMap<FetchTicket, FetchRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_status(&self, ticket: FetchTicket, status: FetchStatus) {
        if let Some(record) = self.records().get_mut(&ticket) {
            record.status = status;
        }
        self.changed.notify_all();
    }

    /// Queued -> Running; false if the job was cancelled or forgotten
    fn start(&self, ticket: FetchTicket) -> bool {
        let mut records = self.records();
        match records.get_mut(&ticket) {
            Some(record) if record.status == FetchStatus::Queued => {
                record.status = FetchStatus::Running;
                true
            }
            _ => false,
        }
    }
}

pub struct MirrorQueue {
    sender: Option<Sender<FetchJob>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
    next_ticket: AtomicU64,
    capacity: usize,
}

impl MirrorQueue {
    pub fn new(mirror: Arc<dyn AssetMirror>, dest_dir: PathBuf, config: &MirrorConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (sender, receiver) = bounded::<FetchJob>(capacity);
        let shared = Arc::new(Shared::default());

        let workers = (0..config.workers.max(1))
            .map(|n| {
                let receiver = receiver.clone();
                let shared = Arc::clone(&shared);
                let mirror = Arc::clone(&mirror);
                let dest_dir = dest_dir.clone();
                thread::Builder::new()
                    .name(format!("renderbox-mirror-{}", n))
                    .spawn(move || worker_loop(receiver, shared, mirror, dest_dir))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    log::error!("Failed to start mirror worker: {}", e);
                    None
                }
            })
            .collect();

        Self {
            sender: Some(sender),
            workers,
            shared,
            next_ticket: AtomicU64::new(1),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queue a fetch. Never blocks: a full queue yields `QueueFull`.
    pub fn enqueue(&self, asset: RemoteAsset) -> MirrorResult<FetchTicket> {
        let sender = self.sender.as_ref().ok_or(MirrorError::ShutDown)?;
        let ticket = FetchTicket(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        let asset_id = asset.id.clone();

        self.shared.records().insert(
            ticket,
            FetchRecord {
                ticket,
                asset,
                status: FetchStatus::Queued,
            },
        );

        match sender.try_send(FetchJob { ticket, asset_id }) {
            Ok(()) => {
                log::debug!("Queued {}", ticket);
                Ok(ticket)
            }
            Err(err) => {
                self.shared.records().remove(&ticket);
                match err {
                    TrySendError::Full(_) => Err(MirrorError::QueueFull {
                        capacity: self.capacity,
                    }),
                    TrySendError::Disconnected(_) => Err(MirrorError::ShutDown),
                }
            }
        }
    }

    pub fn status(&self, ticket: FetchTicket) -> Option<FetchStatus> {
        self.shared
            .records()
            .get(&ticket)
            .map(|record| record.status.clone())
    }

    /// Cancel a fetch that has not started yet
    pub fn cancel(&self, ticket: FetchTicket) -> bool {
        let cancelled = {
            let mut records = self.shared.records();
            match records.get_mut(&ticket) {
                Some(record) if record.status == FetchStatus::Queued => {
                    record.status = FetchStatus::Cancelled;
                    true
                }
                _ => false,
            }
        };
        if cancelled {
            self.shared.changed.notify_all();
        }
        cancelled
    }

    /// Fetches queued or running
    pub fn pending(&self) -> usize {
        self.shared
            .records()
            .values()
            .filter(|record| !record.status.is_terminal())
            .count()
    }

    /// Block until nothing is queued or running. False on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut records = self.shared.records();
        loop {
            if records.values().all(|record| record.status.is_terminal()) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            records = match self.shared.changed.wait_timeout(records, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Remove and return every finished fetch, oldest first
    pub fn drain_finished(&self) -> Vec<FetchRecord> {
        let mut records = self.shared.records();
        let done: Vec<FetchTicket> = records
            .iter()
            .filter(|(_, record)| record.status.is_terminal())
            .map(|(ticket, _)| *ticket)
            .collect();
        let mut finished: Vec<FetchRecord> = done
            .into_iter()
            .filter_map(|ticket| records.remove(&ticket))
            .collect();
        finished.sort_by_key(|record| record.ticket);
        finished
    }

    /// Stop accepting work, let queued fetches finish and join the workers
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("Mirror worker panicked");
            }
        }
    }
}

impl Drop for MirrorQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    receiver: Receiver<FetchJob>,
    shared: Arc<Shared>,
    mirror: Arc<dyn AssetMirror>,
    dest_dir: PathBuf,
) {
    for job in receiver.iter() {
        if !shared.start(job.ticket) {
            log::debug!("Skipping cancelled {}", job.ticket);
            continue;
        }
        let status = match mirror.fetch(&job.asset_id, &dest_dir) {
            Ok(path) => {
                log::info!("{} fetched {} to {}", job.ticket, job.asset_id, path.display());
                FetchStatus::Fetched(path)
            }
            Err(e) => {
                log::warn!("{} failed to fetch {}: {}", job.ticket, job.asset_id, e);
                FetchStatus::Failed(e.to_string())
            }
        };
        shared.set_status(job.ticket, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Barrier;

    fn asset(id: &str) -> RemoteAsset {
        RemoteAsset {
            id: id.to_string(),
            name: id.to_string(),
            size: 0,
            modified: None,
        }
    }

    /// Mirror that blocks every fetch on a barrier until released
    struct GatedMirror {
        gate: Barrier,
    }

    impl AssetMirror for GatedMirror {
        fn list(&self) -> MirrorResult<Vec<RemoteAsset>> {
            Ok(Vec::new())
        }

        fn fetch(&self, id: &str, dest_dir: &Path) -> MirrorResult<PathBuf> {
            self.gate.wait();
            if id == "broken" {
                return Err(MirrorError::Remote("connection reset".to_string()));
            }
            Ok(dest_dir.join(id))
        }
    }

    fn config(workers: usize, queue_capacity: usize) -> MirrorConfig {
        MirrorConfig {
            workers,
            queue_capacity,
        }
    }

    #[test]
    fn fetches_complete_and_drain() {
        let mirror = Arc::new(GatedMirror {
            gate: Barrier::new(1),
        });
        let queue = MirrorQueue::new(mirror, PathBuf::from("/incoming"), &config(2, 8));

        let ok = queue.enqueue(asset("scene.blend")).unwrap();
        let bad = queue.enqueue(asset("broken")).unwrap();
        assert!(queue.wait_idle(Duration::from_secs(5)));

        assert_eq!(
            queue.status(ok),
            Some(FetchStatus::Fetched(PathBuf::from("/incoming/scene.blend")))
        );
        assert!(matches!(queue.status(bad), Some(FetchStatus::Failed(_))));

        let drained = queue.drain_finished();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].ticket, ok);
        assert_eq!(queue.pending(), 0);
        assert!(queue.status(ok).is_none());
    }

    #[test]
    fn full_queue_rejects_and_queued_fetch_can_be_cancelled() {
        // One worker parked inside fetch, one slot in the channel
        let mirror = Arc::new(GatedMirror {
            gate: Barrier::new(2),
        });
        let queue = MirrorQueue::new(
            Arc::clone(&mirror) as Arc<dyn AssetMirror>,
            PathBuf::from("/in"),
            &config(1, 1),
        );

        let running = queue.enqueue(asset("a")).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.status(running) != Some(FetchStatus::Running) {
            assert!(Instant::now() < deadline, "worker never picked up the job");
            thread::sleep(Duration::from_millis(5));
        }

        let queued = queue.enqueue(asset("b")).unwrap();
        assert!(matches!(
            queue.enqueue(asset("c")),
            Err(MirrorError::QueueFull { capacity: 1 })
        ));

        assert!(queue.cancel(queued));
        assert!(!queue.cancel(running));

        mirror.gate.wait();
        assert!(queue.wait_idle(Duration::from_secs(5)));
        assert_eq!(queue.status(queued), Some(FetchStatus::Cancelled));
        assert!(matches!(queue.status(running), Some(FetchStatus::Fetched(_))));
        queue.shutdown();
    }
}
