//! Single-writer commit loop.
//!
//! ```text
//! handler ──┐
//! handler ──┼──► intake (bounded mpsc) ──► serializer task ──► Data (write)
//! handler ──┘                                    │
//!                                                └──► wake interested users
//! ```
//!
//! The serializer task is the only code that takes the write half of the
//! shared [`Data`] lock. Producers block when the intake queue is full.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use crate::data::{Data, Sequencing, ValidationError};
use crate::protocol::Event;
use crate::registry::ConnectionRegistry;

/// The serializer task is gone (server shutting down).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Serializer has shut down")]
pub struct SubmitError;

/// Commit counters, updated lock-free by the serializer task.
#[derive(Debug, Default)]
pub struct CommitStats {
    committed: AtomicU64,
    rejected: AtomicU64,
}

impl CommitStats {
    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Handle to the intake queue of the serializer task.
#[derive(Clone)]
pub struct Serializer {
    intake: mpsc::Sender<Event>,
    stats: Arc<CommitStats>,
}

impl Serializer {
    /// Spawn the serializer task. It runs until every handle is dropped.
    pub fn spawn(
        data: Arc<RwLock<Data>>,
        registry: Arc<ConnectionRegistry>,
        capacity: usize,
    ) -> Self {
        let (intake, rx) = mpsc::channel(capacity.max(1));
        let stats = Arc::new(CommitStats::default());
        tokio::spawn(run(rx, data, registry, stats.clone()));
        Self { intake, stats }
    }

    /// Queue a tap for validation and commit. Waits while the queue is full.
    pub async fn submit(&self, event: Event) -> Result<(), SubmitError> {
        self.intake.send(event).await.map_err(|_| SubmitError)
    }

    pub fn stats(&self) -> &CommitStats {
        &self.stats
    }
}

async fn run(
    mut intake: mpsc::Receiver<Event>,
    data: Arc<RwLock<Data>>,
    registry: Arc<ConnectionRegistry>,
    stats: Arc<CommitStats>,
) {
    while let Some(event) = intake.recv().await {
        match commit(&data, &registry, event).await {
            Ok(_) => {
                stats.committed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("Rejected tap: {e}");
            }
        }
    }
    log::debug!("Serializer stopped: intake closed");
}

/// Validate and append one tap, then wake everyone who may see it.
pub(crate) async fn commit(
    data: &RwLock<Data>,
    registry: &ConnectionRegistry,
    event: Event,
) -> Result<Arc<Event>, ValidationError> {
    let mut data = data.write().await;
    let committed = data.apply(event, Sequencing::Assign)?;
    log::debug!("Committed {committed}");

    // Writers are excluded until the wake-ups are out; readers may proceed.
    let data = data.downgrade();
    let woken = registry
        .wake_where(|user| data.visible(user, &committed))
        .await;
    log::trace!("#{} woke {woken} connection(s)", committed.sequence_id);

    Ok(committed)
}
