use std::cmp::Reverse;
use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{first_shortfall, open_demand_of, supply_of, Demand};
use super::validation::{validate_pending, validate_project};
use super::{apply_to_resource, Engine, EngineError};

/// The optimizer's verdict on one pending request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept { index: usize },
    Reject { index: usize, reason: RejectionReason },
}

impl Decision {
    pub fn index(&self) -> usize {
        match self {
            Decision::Accept { index } | Decision::Reject { index, .. } => *index,
        }
    }
}

/// Greedy priority-ordered assignment of `requests` against `states`.
///
/// Requests are grouped by resource, groups in order of first appearance. Within a
/// group they are tried by priority (high first), then start date, then position. A
/// request is accepted when every day of its range stays within capacity, counting
/// planned and active allocations plus the requests already accepted. Pure and
/// deterministic; the result lists decisions in the order they were made.
pub fn plan(states: &HashMap<Ulid, ResourceState>, requests: &[PendingRequest]) -> Vec<Decision> {
    let mut groups: Vec<(Ulid, Vec<usize>)> = Vec::new();
    let mut group_of: HashMap<Ulid, usize> = HashMap::new();
    for (index, r) in requests.iter().enumerate() {
        let g = *group_of.entry(r.resource_id).or_insert_with(|| {
            groups.push((r.resource_id, Vec::new()));
            groups.len() - 1
        });
        groups[g].1.push(index);
    }

    let mut decisions = Vec::with_capacity(requests.len());
    for (resource_id, mut members) in groups {
        members.sort_by_key(|&i| (Reverse(requests[i].priority), requests[i].start, i));

        let Some(rs) = states.get(&resource_id) else {
            decisions.extend(members.into_iter().map(|index| Decision::Reject {
                index,
                reason: RejectionReason::ResourceUnavailable {
                    status: ResourceStatus::Unavailable,
                },
            }));
            continue;
        };
        let status = rs.resource.status;
        if status.conflict_kind().is_some() {
            decisions.extend(members.into_iter().map(|index| Decision::Reject {
                index,
                reason: RejectionReason::ResourceUnavailable { status },
            }));
            continue;
        }

        let reach = members
            .iter()
            .map(|&i| requests[i].span())
            .reduce(|a, b| Span::new(a.start.min(b.start), a.end.max(b.end)));
        let Some(reach) = reach else { continue };
        let supply = supply_of(rs, &reach);
        let mut demand = open_demand_of(rs, &reach);

        for index in members {
            let request = &requests[index];
            let span = request.span();
            demand.push(Demand {
                span,
                quantity: request.quantity,
                allocation: None,
            });
            match first_shortfall(span, &supply, &demand) {
                None => decisions.push(Decision::Accept { index }),
                Some(short) => {
                    demand.pop();
                    decisions.push(Decision::Reject {
                        index,
                        reason: RejectionReason::CapacityExceeded {
                            start: short.span.first_date(),
                            end: short.span.last_date(),
                            required: short.required,
                            available: short.available,
                        },
                    });
                }
            }
        }
    }
    decisions
}

impl Engine {
    /// Plan `requests` for `project_id` and commit the accepted ones atomically.
    ///
    /// Planning runs on cloned snapshots. The commit re-locks every involved resource
    /// in id order and checks nothing moved since the snapshot; if something did, the
    /// run starts over, up to `MAX_OPTIMIZE_ATTEMPTS` times, then fails with `Busy`.
    pub async fn optimize(
        &self,
        project_id: &str,
        requests: Vec<PendingRequest>,
    ) -> Result<OptimizationOutcome, EngineError> {
        validate_project(project_id)?;
        if requests.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        for (index, r) in requests.iter().enumerate() {
            validate_pending(index, r)?;
        }
        if requests.is_empty() {
            return Ok(OptimizationOutcome::default());
        }

        let mut resource_ids: Vec<Ulid> = requests.iter().map(|r| r.resource_id).collect();
        resource_ids.sort();
        resource_ids.dedup();

        let started = Instant::now();
        for attempt in 1..=MAX_OPTIMIZE_ATTEMPTS {
            let mut snapshot: HashMap<Ulid, ResourceState> = HashMap::with_capacity(resource_ids.len());
            for rid in &resource_ids {
                let guard = self.read_resource(rid).await?;
                snapshot.insert(*rid, guard.clone());
            }
            let decisions = plan(&snapshot, &requests);

            let _gate = self.gate.read().await;
            // Sorted acquisition order keeps concurrent multi-resource commits deadlock-free.
            let mut guards = Vec::with_capacity(resource_ids.len());
            for rid in &resource_ids {
                guards.push(self.write_resource(rid).await?);
            }
            let stale = guards
                .iter()
                .any(|g| snapshot.get(&g.resource.id).is_none_or(|s| s.version != g.version));
            if stale {
                metrics::counter!(crate::observability::OPTIMIZER_RETRIES_TOTAL).increment(1);
                warn!(%project_id, attempt, "optimizer snapshot went stale, retrying");
                continue;
            }

            let now = self.now();
            let mut outcome = OptimizationOutcome::default();
            for decision in decisions {
                match decision {
                    Decision::Accept { index } => {
                        let r = &requests[index];
                        outcome.accepted.push(ResourceAllocation {
                            id: self.ids.next_id(),
                            seq: self.next_seq(),
                            resource_id: r.resource_id,
                            project_id: project_id.to_string(),
                            task_id: r.task_id.clone(),
                            start: r.start,
                            end: r.end,
                            quantity: r.quantity,
                            status: AllocationStatus::Planned,
                            priority: r.priority,
                            notes: r.notes.clone(),
                            created_at: now,
                            updated_at: now,
                        });
                    }
                    Decision::Reject { index, reason } => outcome.rejected.push(RejectedRequest {
                        index,
                        request: requests[index].clone(),
                        reason,
                    }),
                }
            }

            for guard in &guards {
                let added = outcome
                    .accepted
                    .iter()
                    .filter(|a| a.resource_id == guard.resource.id)
                    .count();
                if guard.entry_count() + added > MAX_ENTRIES_PER_RESOURCE {
                    return Err(EngineError::LimitExceeded("too many entries on resource"));
                }
            }

            if !outcome.accepted.is_empty() {
                let event = Event::AllocationsCommitted {
                    project_id: project_id.to_string(),
                    allocations: outcome.accepted.clone(),
                };
                self.journal_append(&event).await?;
                for guard in guards.iter_mut() {
                    apply_to_resource(guard, &event, &self.entity_to_resource);
                }
            }

            metrics::counter!(crate::observability::OPTIMIZER_RUNS_TOTAL).increment(1);
            metrics::histogram!(crate::observability::OPTIMIZER_DURATION_SECONDS)
                .record(started.elapsed().as_secs_f64());
            metrics::counter!(crate::observability::ALLOCATIONS_CREATED_TOTAL)
                .increment(outcome.accepted.len() as u64);
            debug!(
                %project_id,
                attempt,
                accepted = outcome.accepted.len(),
                rejected = outcome.rejected.len(),
                "optimizer run committed"
            );
            return Ok(outcome);
        }

        Err(EngineError::Busy {
            attempts: MAX_OPTIMIZE_ATTEMPTS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, day).unwrap()
    }

    fn state(n: u64, status: ResourceStatus, capacity: Qty) -> ResourceState {
        let now = Utc::now();
        let id = Ulid::from_parts(n, 0);
        let mut rs = ResourceState::new(Resource {
            id,
            seq: n,
            kind: ResourceKind::Equipment,
            name: format!("Crane-{n}"),
            code: format!("CR{n}"),
            status,
            cost: None,
            skills: vec![],
            certifications: vec![],
            schedule: None,
            created_at: now,
            updated_at: now,
        });
        rs.insert_capacity(ResourceCapacity {
            id: Ulid::from_parts(n, 1),
            seq: 100 + n,
            resource_id: id,
            start: d(1, 1),
            end: d(12, 31),
            quantity: capacity,
            unit: "units".into(),
        });
        rs
    }

    fn states(list: Vec<ResourceState>) -> HashMap<Ulid, ResourceState> {
        list.into_iter().map(|rs| (rs.resource.id, rs)).collect()
    }

    fn req(n: u64, start: NaiveDate, end: NaiveDate, q: Qty, p: Priority) -> PendingRequest {
        PendingRequest::new(Ulid::from_parts(n, 0), start, end, q, p)
    }

    #[test]
    fn higher_priority_wins_regardless_of_position() {
        let s = states(vec![state(1, ResourceStatus::Available, 2)]);
        let requests = vec![
            req(1, d(1, 3), d(1, 7), 1, Priority::Low),
            req(1, d(1, 1), d(1, 5), 2, Priority::High),
        ];
        let decisions = plan(&s, &requests);
        assert_eq!(decisions[0], Decision::Accept { index: 1 });
        assert_eq!(
            decisions[1],
            Decision::Reject {
                index: 0,
                reason: RejectionReason::CapacityExceeded {
                    start: d(1, 3),
                    end: d(1, 5),
                    required: 3,
                    available: 2,
                },
            }
        );
    }

    #[test]
    fn equal_priority_prefers_earlier_start_then_position() {
        let s = states(vec![state(1, ResourceStatus::Available, 1)]);
        let requests = vec![
            req(1, d(2, 1), d(2, 3), 1, Priority::Medium),
            req(1, d(1, 30), d(2, 1), 1, Priority::Medium),
            req(1, d(1, 30), d(1, 30), 1, Priority::Medium),
        ];
        let order: Vec<usize> = plan(&s, &requests).iter().map(Decision::index).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn groups_follow_first_appearance() {
        let s = states(vec![state(1, ResourceStatus::Available, 5), state(2, ResourceStatus::Available, 5)]);
        let requests = vec![
            req(2, d(3, 1), d(3, 2), 1, Priority::Low),
            req(1, d(3, 1), d(3, 2), 1, Priority::High),
            req(2, d(3, 1), d(3, 2), 1, Priority::High),
        ];
        let order: Vec<usize> = plan(&s, &requests).iter().map(Decision::index).collect();
        assert_eq!(order, vec![2, 0, 1]);
    }

    #[test]
    fn resource_in_maintenance_rejects_everything() {
        let s = states(vec![state(1, ResourceStatus::Maintenance, 10)]);
        let decisions = plan(&s, &[req(1, d(5, 1), d(5, 2), 1, Priority::High)]);
        assert_eq!(
            decisions,
            vec![Decision::Reject {
                index: 0,
                reason: RejectionReason::ResourceUnavailable {
                    status: ResourceStatus::Maintenance
                },
            }]
        );
    }

    #[test]
    fn existing_allocations_consume_capacity() {
        let mut rs = state(1, ResourceStatus::Available, 2);
        let now = Utc::now();
        let existing = |seq: u64, status: AllocationStatus| ResourceAllocation {
            id: Ulid::from_parts(seq, 2),
            seq,
            resource_id: rs.resource.id,
            project_id: "other".into(),
            task_id: None,
            start: d(4, 1),
            end: d(4, 10),
            quantity: 1,
            status,
            priority: Priority::High,
            notes: None,
            created_at: now,
            updated_at: now,
        };
        let active = existing(200, AllocationStatus::Active);
        let cancelled = existing(201, AllocationStatus::Cancelled);
        rs.insert_allocation(active);
        rs.insert_allocation(cancelled);
        let s = states(vec![rs]);

        let decisions = plan(
            &s,
            &[
                req(1, d(4, 5), d(4, 6), 1, Priority::Medium),
                req(1, d(4, 6), d(4, 6), 1, Priority::Medium),
            ],
        );
        assert_eq!(decisions[0], Decision::Accept { index: 0 });
        assert!(matches!(
            decisions[1],
            Decision::Reject {
                index: 1,
                reason: RejectionReason::CapacityExceeded { required: 3, available: 2, .. }
            }
        ));
    }

    #[test]
    fn days_without_capacity_reject() {
        let s = states(vec![state(1, ResourceStatus::Available, 1)]);
        let decisions = plan(&s, &[req(1, d(12, 30), d(12, 31), 1, Priority::High)]);
        assert_eq!(decisions, vec![Decision::Accept { index: 0 }]);

        let next_year = NaiveDate::from_ymd_opt(2025, 1, 2).unwrap();
        let decisions = plan(&s, &[req(1, d(12, 31), next_year, 1, Priority::High)]);
        assert_eq!(
            decisions,
            vec![Decision::Reject {
                index: 0,
                reason: RejectionReason::CapacityExceeded {
                    start: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                    end: next_year,
                    required: 1,
                    available: 0,
                },
            }]
        );
    }

    #[test]
    fn plan_is_deterministic() {
        let s = states(vec![state(1, ResourceStatus::Available, 3), state(2, ResourceStatus::Busy, 1)]);
        let requests: Vec<PendingRequest> = (0..40u32)
            .map(|i| {
                let day = 1 + (i * 7) % 25;
                let p = [Priority::Low, Priority::Medium, Priority::High][(i % 3) as usize];
                req(1 + u64::from(i % 2), d(6, day), d(6, day + 3), 1 + u64::from(i % 2), p)
            })
            .collect();
        assert_eq!(plan(&s, &requests), plan(&s, &requests));
    }
}
