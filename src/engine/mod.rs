mod conflict;
mod error;
mod ledger;
mod optimizer;
mod queries;
mod registry;
mod utilization;
mod validation;

pub use conflict::detect_conflicts;
pub use error::EngineError;
pub use optimizer::{plan, Decision};
pub use utilization::compute_utilization;

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::ids::{IdGenerator, UlidGenerator};
use crate::model::*;
use crate::wal::{Journal, Wal};

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

// ── Group-commit journal channel ─────────────────────────

pub(super) enum JournalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the journal and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn journal_writer_loop<J: Journal>(mut journal: J, mut rx: mpsc::Receiver<JournalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            JournalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(JournalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty: flush the batch
                    }
                }

                metrics::histogram!(crate::observability::JOURNAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut journal, &batch);
                metrics::histogram!(crate::observability::JOURNAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut journal, other);
                }
            }
            other => handle_non_append(&mut journal, other),
        }
    }
}

fn flush_batch<J: Journal>(journal: &mut J, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = journal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so buffered bytes don't leak into the next batch.
    let flush_err = journal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append<J: Journal>(journal: &mut J, cmd: JournalCommand) {
    match cmd {
        JournalCommand::Compact { events, response } => {
            let _ = response.send(journal.compact(&events));
        }
        JournalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(journal.appends_since_compact());
        }
        JournalCommand::Append { response, .. } => {
            let _ = response.send(Err(io::Error::other("append routed outside a batch")));
        }
    }
}

/// In-memory registry and ledger, one lockable `ResourceState` per resource.
pub struct Engine {
    pub(super) state: DashMap<Ulid, SharedResourceState>,
    pub(super) journal_tx: mpsc::Sender<JournalCommand>,
    /// Reverse lookup: capacity/allocation id → resource id
    pub(super) entity_to_resource: DashMap<Ulid, Ulid>,
    pub(super) ids: Arc<dyn IdGenerator>,
    pub(super) clock: Arc<dyn Clock>,
    next_seq: AtomicU64,
    /// Mutations hold this shared; compaction holds it exclusively to see a quiet state.
    pub(super) gate: RwLock<()>,
}

/// Apply an event to a ResourceState (no locking, the caller holds the lock).
fn apply_to_resource(rs: &mut ResourceState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        // Created at the map level
        Event::ResourceCreated { .. } => {}
        Event::ResourceUpdated { resource } => rs.resource = resource.clone(),
        Event::ResourceRemoved { .. } => {
            for c in rs.capacities.drain(..) {
                entity_map.remove(&c.id);
            }
            for a in rs.allocations.drain(..) {
                entity_map.remove(&a.id);
            }
            rs.removed = true;
        }
        Event::CapacityAdded { capacity } => {
            rs.insert_capacity(capacity.clone());
            entity_map.insert(capacity.id, capacity.resource_id);
        }
        Event::CapacityUpdated { capacity } => rs.replace_capacity(capacity.clone()),
        Event::CapacityRemoved { id, .. } => {
            rs.remove_capacity(*id);
            entity_map.remove(id);
        }
        Event::AllocationCreated { allocation } => {
            rs.insert_allocation(allocation.clone());
            entity_map.insert(allocation.id, allocation.resource_id);
        }
        Event::AllocationUpdated { allocation } => rs.replace_allocation(allocation.clone()),
        Event::AllocationRemoved { id, .. } => {
            rs.remove_allocation(*id);
            entity_map.remove(id);
        }
        Event::AllocationsCommitted { allocations, .. } => {
            let rid = rs.resource.id;
            for allocation in allocations.iter().filter(|a| a.resource_id == rid) {
                rs.insert_allocation(allocation.clone());
                entity_map.insert(allocation.id, rid);
            }
        }
    }
    rs.version += 1;
}

impl Engine {
    /// Build an engine over `journal`, replaying whatever it already holds.
    /// Must be called inside a tokio runtime: the journal writer is spawned here.
    pub fn new<J: Journal>(
        mut journal: J,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let events = journal.load()?;
        let entity_to_resource = DashMap::new();
        let mut resources: HashMap<Ulid, ResourceState> = HashMap::new();
        let mut max_seq = 0u64;

        for event in &events {
            if let Some(seq) = event.max_seq() {
                max_seq = max_seq.max(seq);
            }
            match event {
                Event::ResourceCreated { resource } => {
                    resources.insert(resource.id, ResourceState::new(resource.clone()));
                }
                Event::ResourceRemoved { id } => {
                    if let Some(mut rs) = resources.remove(id) {
                        apply_to_resource(&mut rs, event, &entity_to_resource);
                    }
                }
                other => {
                    for rid in other.resource_ids() {
                        if let Some(rs) = resources.get_mut(&rid) {
                            apply_to_resource(rs, other, &entity_to_resource);
                        }
                    }
                }
            }
        }

        if !events.is_empty() {
            info!(events = events.len(), resources = resources.len(), "journal replayed");
        }

        let (journal_tx, journal_rx) = mpsc::channel(4096);
        tokio::spawn(journal_writer_loop(journal, journal_rx));

        Ok(Self {
            state: resources
                .into_iter()
                .map(|(id, rs)| (id, Arc::new(RwLock::new(rs))))
                .collect(),
            journal_tx,
            entity_to_resource,
            ids,
            clock,
            next_seq: AtomicU64::new(max_seq + 1),
            gate: RwLock::new(()),
        })
    }

    /// Production engine: write-ahead log at `wal_path`, ULID ids, system clock.
    pub fn open(wal_path: &Path) -> io::Result<Self> {
        let wal = Wal::open(wal_path)?;
        Self::new(wal, Arc::new(UlidGenerator), Arc::new(SystemClock))
    }

    pub fn resource_count(&self) -> usize {
        self.state.len()
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    pub(super) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(super) fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Write event to the journal via the background group-commit writer.
    pub(super) async fn journal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Journal("journal writer dropped response".into()))?
            .map_err(|e| EngineError::Journal(e.to_string()))
    }

    /// Journal-append, then apply. The caller holds the resource's write lock.
    pub(super) async fn persist_and_apply(&self, rs: &mut ResourceState, event: &Event) -> Result<(), EngineError> {
        self.journal_append(event).await?;
        apply_to_resource(rs, event, &self.entity_to_resource);
        Ok(())
    }

    pub(super) fn handle(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    /// Every live handle. DashMap refs are released before any lock is awaited.
    pub(super) fn handles(&self) -> Vec<SharedResourceState> {
        self.state.iter().map(|e| e.value().clone()).collect()
    }

    pub(super) async fn write_resource(&self, id: &Ulid) -> Result<OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let rs = self.handle(id).ok_or(EngineError::NotFound(*id))?;
        let guard = rs.write_owned().await;
        if guard.removed {
            return Err(EngineError::NotFound(*id));
        }
        Ok(guard)
    }

    pub(super) async fn read_resource(&self, id: &Ulid) -> Result<OwnedRwLockReadGuard<ResourceState>, EngineError> {
        let rs = self.handle(id).ok_or(EngineError::NotFound(*id))?;
        let guard = rs.read_owned().await;
        if guard.removed {
            return Err(EngineError::NotFound(*id));
        }
        Ok(guard)
    }

    fn resource_for_entity(&self, entity_id: &Ulid) -> Result<Ulid, EngineError> {
        self.entity_to_resource
            .get(entity_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*entity_id))
    }

    /// Lookup entity → resource and acquire the resource's write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let resource_id = self.resource_for_entity(entity_id)?;
        self.write_resource(&resource_id)
            .await
            .map_err(|_| EngineError::NotFound(*entity_id))
    }

    pub(super) async fn resolve_entity_read(
        &self,
        entity_id: &Ulid,
    ) -> Result<OwnedRwLockReadGuard<ResourceState>, EngineError> {
        let resource_id = self.resource_for_entity(entity_id)?;
        self.read_resource(&resource_id)
            .await
            .map_err(|_| EngineError::NotFound(*entity_id))
    }

    /// Run `f` over every live resource, one read lock at a time.
    pub(super) async fn scan<T>(&self, mut f: impl FnMut(&ResourceState) -> Option<T>) -> Vec<(u64, T)> {
        let mut out = Vec::new();
        for handle in self.handles() {
            let guard = handle.read().await;
            if guard.removed {
                continue;
            }
            if let Some(v) = f(&guard) {
                out.push((guard.resource.seq, v));
            }
        }
        out.sort_by_key(|(seq, _)| *seq);
        out
    }

    /// Rewrite the journal with only the events needed to recreate the current state.
    pub async fn compact_journal(&self) -> Result<(), EngineError> {
        let _quiet = self.gate.write().await;

        let mut snapshot = Vec::new();
        for handle in self.handles() {
            let guard = handle.read().await;
            if guard.removed {
                continue;
            }
            let mut events = Vec::with_capacity(1 + guard.entry_count());
            events.push(Event::ResourceCreated {
                resource: guard.resource.clone(),
            });
            events.extend(guard.capacities.iter().map(|c| Event::CapacityAdded { capacity: c.clone() }));
            events.extend(
                guard
                    .allocations
                    .iter()
                    .map(|a| Event::AllocationCreated { allocation: a.clone() }),
            );
            snapshot.push((guard.resource.seq, events));
        }
        snapshot.sort_by_key(|(seq, _)| *seq);
        let events: Vec<Event> = snapshot.into_iter().flat_map(|(_, e)| e).collect();
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Journal("journal writer dropped response".into()))?
            .map_err(|e| EngineError::Journal(e.to_string()))?;
        info!(events = count, "journal compacted");
        Ok(())
    }

    pub async fn journal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .journal_tx
            .send(JournalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
