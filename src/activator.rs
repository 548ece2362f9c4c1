use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::engine::Engine;

/// Background task that periodically activates planned allocations whose
/// start date has arrived.
pub async fn run_activator(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        activate_due(&engine).await;
    }
}

/// One activation pass against the engine's clock. Returns how many allocations moved.
pub async fn activate_due(engine: &Engine) -> usize {
    let today = engine.today();
    let due = engine.collect_due_activations(today).await;
    let mut activated = 0;
    for id in due {
        match engine.activate_allocation(id).await {
            Ok(_) => activated += 1,
            // Cancelled or removed since collection.
            Err(e) => debug!("activator skip {id}: {e}"),
        }
    }
    if activated > 0 {
        metrics::counter!(crate::observability::ACTIVATIONS_TOTAL).increment(activated as u64);
        info!(%today, activated, "activated due allocations");
    }
    activated
}

/// Background task that compacts the journal once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.journal_appends_since_compact().await;
        if appends >= threshold {
            match engine.compact_journal().await {
                Ok(()) => info!("compacted journal ({appends} appends since last compact)"),
                Err(e) => tracing::error!("journal compaction failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ids::SequentialIds;
    use crate::model::*;
    use crate::wal::MemoryJournal;
    use chrono::NaiveDate;

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, day).unwrap()
    }

    fn engine(clock: Arc<ManualClock>) -> Engine {
        Engine::new(
            MemoryJournal::new(),
            Arc::new(SequentialIds::new()),
            clock,
        )
        .unwrap()
    }

    async fn status(engine: &Engine, id: ulid::Ulid) -> AllocationStatus {
        engine.get_allocation(id).await.unwrap().status
    }

    #[tokio::test]
    async fn activates_only_started_planned_allocations() {
        let clock = Arc::new(ManualClock::at_date(d(1, 5)));
        let engine = engine(clock.clone());
        let r = engine
            .create_resource(NewResource::new(ResourceKind::Equipment, "Crane", "CR-1"))
            .await
            .unwrap();
        let started = engine
            .allocate(AllocationRequest::new(r.id, "p", d(1, 3), d(1, 9), 1))
            .await
            .unwrap();
        let today = engine
            .allocate(AllocationRequest::new(r.id, "p", d(1, 5), d(1, 6), 1))
            .await
            .unwrap();
        let future = engine
            .allocate(AllocationRequest::new(r.id, "p", d(1, 6), d(1, 9), 1))
            .await
            .unwrap();
        let cancelled = engine
            .allocate(AllocationRequest::new(r.id, "p", d(1, 1), d(1, 2), 1))
            .await
            .unwrap();
        engine.cancel_allocation(cancelled.id).await.unwrap();

        assert_eq!(activate_due(&engine).await, 2);
        assert_eq!(status(&engine, started.id).await, AllocationStatus::Active);
        assert_eq!(status(&engine, today.id).await, AllocationStatus::Active);
        assert_eq!(status(&engine, future.id).await, AllocationStatus::Planned);
        assert_eq!(status(&engine, cancelled.id).await, AllocationStatus::Cancelled);

        // Nothing left to do until the clock moves.
        assert_eq!(activate_due(&engine).await, 0);
        clock.advance_days(1);
        assert_eq!(activate_due(&engine).await, 1);
        assert_eq!(status(&engine, future.id).await, AllocationStatus::Active);
    }
}
