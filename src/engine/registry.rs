use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::validation::{validate_capacity, validate_resource, validate_search};
use super::{Engine, EngineError};

impl Engine {
    pub async fn create_resource(&self, new: NewResource) -> Result<Resource, EngineError> {
        let _gate = self.gate.read().await;
        if self.state.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }

        let now = self.now();
        let resource = Resource {
            id: self.ids.next_id(),
            seq: self.next_seq(),
            kind: new.kind,
            name: new.name,
            code: new.code,
            status: new.status,
            cost: new.cost,
            skills: new.skills,
            certifications: new.certifications,
            schedule: new.schedule,
            created_at: now,
            updated_at: now,
        };
        validate_resource(&resource)?;
        if self.state.contains_key(&resource.id) {
            return Err(EngineError::Validation(format!("id {} already in use", resource.id)));
        }

        let event = Event::ResourceCreated {
            resource: resource.clone(),
        };
        self.journal_append(&event).await?;
        self.state
            .insert(resource.id, Arc::new(RwLock::new(ResourceState::new(resource.clone()))));
        debug!(resource_id = %resource.id, kind = %resource.kind, code = %resource.code, "resource created");
        Ok(resource)
    }

    pub async fn update_resource(&self, id: Ulid, patch: ResourcePatch) -> Result<Resource, EngineError> {
        let _gate = self.gate.read().await;
        let mut guard = self.write_resource(&id).await?;

        let current = &guard.resource;
        let mut next = current.clone();
        if let Some(kind) = patch.kind {
            next.kind = kind;
        }
        if let Some(name) = patch.name {
            next.name = name;
        }
        if let Some(code) = patch.code {
            next.code = code;
        }
        if let Some(status) = patch.status {
            next.status = status;
        }
        if let Some(cost) = patch.cost {
            next.cost = cost;
        }
        if let Some(skills) = patch.skills {
            next.skills = skills;
        }
        if let Some(certifications) = patch.certifications {
            next.certifications = certifications;
        }
        if let Some(schedule) = patch.schedule {
            next.schedule = schedule;
        }
        validate_resource(&next)?;
        if next == *current {
            return Ok(next);
        }
        next.updated_at = self.now();

        let event = Event::ResourceUpdated { resource: next.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!(resource_id = %id, status = %next.status, "resource updated");
        Ok(next)
    }

    /// Remove a resource with its capacity windows and closed allocations.
    /// Refused with `Conflict` while any planned or active allocation references it.
    pub async fn remove_resource(&self, id: Ulid) -> Result<Resource, EngineError> {
        let _gate = self.gate.read().await;
        let mut guard = self.write_resource(&id).await?;

        let blocking: Vec<Ulid> = guard.open_allocations().iter().map(|a| a.id).collect();
        if !blocking.is_empty() {
            return Err(EngineError::Conflict {
                resource_id: id,
                blocking,
            });
        }

        let resource = guard.resource.clone();
        let event = Event::ResourceRemoved { id };
        self.persist_and_apply(&mut guard, &event).await?;
        self.state.remove(&id);
        info!(resource_id = %id, code = %resource.code, "resource removed");
        Ok(resource)
    }

    pub async fn get_resource(&self, id: Ulid) -> Result<Resource, EngineError> {
        Ok(self.read_resource(&id).await?.resource.clone())
    }

    /// All resources in creation order.
    pub async fn list_resources(&self) -> Vec<Resource> {
        self.scan(|rs| Some(rs.resource.clone()))
            .await
            .into_iter()
            .map(|(_, r)| r)
            .collect()
    }

    /// Case-insensitive substring match on name or code, optionally narrowed to one kind.
    /// An empty query matches every resource. Creation order.
    pub async fn search_resources(&self, query: &str, kind: Option<ResourceKind>) -> Result<Vec<Resource>, EngineError> {
        validate_search(query)?;
        let needle = query.trim().to_lowercase();
        let hits = self
            .scan(|rs| {
                let r = &rs.resource;
                let kind_ok = kind.is_none_or(|k| k == r.kind);
                let text_ok = needle.is_empty()
                    || r.name.to_lowercase().contains(&needle)
                    || r.code.to_lowercase().contains(&needle);
                (kind_ok && text_ok).then(|| r.clone())
            })
            .await;
        Ok(hits.into_iter().map(|(_, r)| r).collect())
    }

    // ── Capacity windows ─────────────────────────────────────

    pub async fn add_capacity(&self, resource_id: Ulid, new: NewCapacity) -> Result<ResourceCapacity, EngineError> {
        let _gate = self.gate.read().await;
        let mut guard = self.write_resource(&resource_id).await?;
        if guard.entry_count() >= MAX_ENTRIES_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many entries on resource"));
        }

        let capacity = ResourceCapacity {
            id: self.ids.next_id(),
            seq: self.next_seq(),
            resource_id,
            start: new.start,
            end: new.end,
            quantity: new.quantity,
            unit: new.unit,
        };
        validate_capacity(&capacity)?;

        let event = Event::CapacityAdded {
            capacity: capacity.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!(capacity_id = %capacity.id, %resource_id, quantity = capacity.quantity, "capacity added");
        Ok(capacity)
    }

    pub async fn update_capacity(&self, id: Ulid, patch: CapacityPatch) -> Result<ResourceCapacity, EngineError> {
        let _gate = self.gate.read().await;
        let mut guard = self.resolve_entity_write(&id).await?;
        let current = guard.capacity(&id).cloned().ok_or(EngineError::NotFound(id))?;

        let mut next = current.clone();
        if let Some(start) = patch.start {
            next.start = start;
        }
        if let Some(end) = patch.end {
            next.end = end;
        }
        if let Some(quantity) = patch.quantity {
            next.quantity = quantity;
        }
        if let Some(unit) = patch.unit {
            next.unit = unit;
        }
        validate_capacity(&next)?;
        if next == current {
            return Ok(next);
        }

        let event = Event::CapacityUpdated { capacity: next.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(next)
    }

    pub async fn remove_capacity(&self, id: Ulid) -> Result<ResourceCapacity, EngineError> {
        let _gate = self.gate.read().await;
        let mut guard = self.resolve_entity_write(&id).await?;
        let current = guard.capacity(&id).cloned().ok_or(EngineError::NotFound(id))?;

        let event = Event::CapacityRemoved {
            id,
            resource_id: current.resource_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(current)
    }

    /// Capacity windows of one resource in creation order.
    pub async fn capacities(&self, resource_id: Ulid) -> Result<Vec<ResourceCapacity>, EngineError> {
        let guard = self.read_resource(&resource_id).await?;
        let mut out = guard.capacities.clone();
        out.sort_by_key(|c| c.seq);
        Ok(out)
    }
}
