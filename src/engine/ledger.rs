use chrono::NaiveDate;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{first_shortfall, open_demand_of, supply_of};
use super::validation::{validate_allocation, validate_project};
use super::{Engine, EngineError};

impl Engine {
    /// Record an allocation in `planned` status.
    ///
    /// Overcommitting the resource is allowed; it is logged and shows up in
    /// `conflicts` for the affected days.
    pub async fn allocate(&self, request: AllocationRequest) -> Result<ResourceAllocation, EngineError> {
        let _gate = self.gate.read().await;
        let mut guard = self.write_resource(&request.resource_id).await?;
        if guard.entry_count() >= MAX_ENTRIES_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many entries on resource"));
        }

        let now = self.now();
        let allocation = ResourceAllocation {
            id: self.ids.next_id(),
            seq: self.next_seq(),
            resource_id: request.resource_id,
            project_id: request.project_id,
            task_id: request.task_id,
            start: request.start,
            end: request.end,
            quantity: request.quantity,
            status: AllocationStatus::Planned,
            priority: request.priority,
            notes: request.notes,
            created_at: now,
            updated_at: now,
        };
        let span = validate_allocation(&allocation)?;

        let event = Event::AllocationCreated {
            allocation: allocation.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::ALLOCATIONS_CREATED_TOTAL).increment(1);
        debug!(
            allocation_id = %allocation.id,
            resource_id = %allocation.resource_id,
            project_id = %allocation.project_id,
            "allocation created"
        );

        if let Some(short) = first_shortfall(span, &supply_of(&guard, &span), &open_demand_of(&guard, &span)) {
            metrics::counter!(crate::observability::OVERALLOCATING_ALLOCATIONS_TOTAL).increment(1);
            warn!(
                allocation_id = %allocation.id,
                resource_id = %allocation.resource_id,
                start = %short.span.first_date(),
                end = %short.span.last_date(),
                required = short.required,
                available = short.available,
                "allocation overcommits resource"
            );
        }
        Ok(allocation)
    }

    /// Merge `patch` into an allocation. A status in the patch that differs from the
    /// current one must be a legal transition.
    pub async fn update_allocation(&self, id: Ulid, patch: AllocationPatch) -> Result<ResourceAllocation, EngineError> {
        let _gate = self.gate.read().await;
        let mut guard = self.resolve_entity_write(&id).await?;
        let current = guard.allocation(&id).cloned().ok_or(EngineError::NotFound(id))?;

        let mut next = current.clone();
        if let Some(task_id) = patch.task_id {
            next.task_id = task_id;
        }
        if let Some(start) = patch.start {
            next.start = start;
        }
        if let Some(end) = patch.end {
            next.end = end;
        }
        if let Some(quantity) = patch.quantity {
            next.quantity = quantity;
        }
        if let Some(priority) = patch.priority {
            next.priority = priority;
        }
        if let Some(notes) = patch.notes {
            next.notes = notes;
        }
        if let Some(status) = patch.status
            && status != current.status
        {
            if !current.status.can_transition_to(status) {
                return Err(EngineError::InvalidTransition {
                    id,
                    from: current.status,
                    to: status,
                });
            }
            next.status = status;
        }
        validate_allocation(&next)?;
        if next == current {
            return Ok(next);
        }
        next.updated_at = self.now();

        let event = Event::AllocationUpdated {
            allocation: next.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(next)
    }

    pub async fn remove_allocation(&self, id: Ulid) -> Result<ResourceAllocation, EngineError> {
        let _gate = self.gate.read().await;
        let mut guard = self.resolve_entity_write(&id).await?;
        let current = guard.allocation(&id).cloned().ok_or(EngineError::NotFound(id))?;

        let event = Event::AllocationRemoved {
            id,
            resource_id: current.resource_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!(allocation_id = %id, "allocation removed");
        Ok(current)
    }

    pub async fn activate_allocation(&self, id: Ulid) -> Result<ResourceAllocation, EngineError> {
        self.transition_allocation(id, AllocationStatus::Active).await
    }

    pub async fn complete_allocation(&self, id: Ulid) -> Result<ResourceAllocation, EngineError> {
        self.transition_allocation(id, AllocationStatus::Completed).await
    }

    pub async fn cancel_allocation(&self, id: Ulid) -> Result<ResourceAllocation, EngineError> {
        self.transition_allocation(id, AllocationStatus::Cancelled).await
    }

    /// Move an allocation along the status state machine. Illegal moves,
    /// including X → X, fail with `InvalidTransition` and change nothing.
    pub async fn transition_allocation(&self, id: Ulid, to: AllocationStatus) -> Result<ResourceAllocation, EngineError> {
        let _gate = self.gate.read().await;
        let mut guard = self.resolve_entity_write(&id).await?;
        let current = guard.allocation(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if !current.status.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                id,
                from: current.status,
                to,
            });
        }

        let mut next = current;
        next.status = to;
        next.updated_at = self.now();
        let event = Event::AllocationUpdated {
            allocation: next.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!(allocation_id = %id, status = %to, "allocation transitioned");
        Ok(next)
    }

    pub async fn get_allocation(&self, id: Ulid) -> Result<ResourceAllocation, EngineError> {
        let guard = self.resolve_entity_read(&id).await?;
        guard.allocation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Allocations on one resource in creation order.
    pub async fn allocations_by_resource(&self, resource_id: Ulid) -> Result<Vec<ResourceAllocation>, EngineError> {
        let guard = self.read_resource(&resource_id).await?;
        let mut out = guard.allocations.clone();
        out.sort_by_key(|a| a.seq);
        Ok(out)
    }

    /// A project's allocations across all resources, in creation order.
    pub async fn allocations_by_project(&self, project_id: &str) -> Result<Vec<ResourceAllocation>, EngineError> {
        validate_project(project_id)?;
        Ok(self.collect_allocations(|a| a.project_id == project_id).await)
    }

    pub async fn allocations_by_status(&self, status: AllocationStatus) -> Vec<ResourceAllocation> {
        self.collect_allocations(|a| a.status == status).await
    }

    pub async fn all_allocations(&self) -> Vec<ResourceAllocation> {
        self.collect_allocations(|_| true).await
    }

    async fn collect_allocations(&self, keep: impl Fn(&ResourceAllocation) -> bool) -> Vec<ResourceAllocation> {
        let mut out: Vec<ResourceAllocation> = self
            .scan(|rs| Some(rs.allocations.iter().filter(|a| keep(a)).cloned().collect::<Vec<_>>()))
            .await
            .into_iter()
            .flat_map(|(_, v)| v)
            .collect();
        out.sort_by_key(|a| a.seq);
        out
    }

    /// Planned allocations whose window has opened by `today`, in creation order.
    pub async fn collect_due_activations(&self, today: NaiveDate) -> Vec<Ulid> {
        self.collect_allocations(|a| a.status == AllocationStatus::Planned && a.start <= today)
            .await
            .into_iter()
            .map(|a| a.id)
            .collect()
    }
}
