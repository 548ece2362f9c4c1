use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::conflict::detect_conflicts;
use super::utilization::compute_utilization;
use super::validation::{validate_project, validate_window};
use super::{Engine, EngineError};

impl Engine {
    /// Conflicts on one resource within `start..=end`, ordered by start.
    pub async fn conflicts(
        &self,
        resource_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ResourceConflict>, EngineError> {
        let window = validate_window(start, end)?;
        let guard = self.read_resource(&resource_id).await?;
        let found = detect_conflicts(&guard, &window);
        metrics::counter!(crate::observability::CONFLICTS_REPORTED_TOTAL).increment(found.len() as u64);
        Ok(found)
    }

    /// Conflicts involving at least one of the project's allocations, across every
    /// resource the project uses. Resource creation order, then start.
    pub async fn conflicts_for_project(
        &self,
        project_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ResourceConflict>, EngineError> {
        validate_project(project_id)?;
        let window = validate_window(start, end)?;
        let found: Vec<ResourceConflict> = self
            .scan(|rs| {
                let ours: Vec<Ulid> = rs
                    .allocations
                    .iter()
                    .filter(|a| a.project_id == project_id)
                    .map(|a| a.id)
                    .collect();
                if ours.is_empty() {
                    return None;
                }
                let mut conflicts = detect_conflicts(rs, &window);
                conflicts.retain(|c| c.allocation_ids.iter().any(|id| ours.contains(id)));
                Some(conflicts)
            })
            .await
            .into_iter()
            .flat_map(|(_, c)| c)
            .collect();
        metrics::counter!(crate::observability::CONFLICTS_REPORTED_TOTAL).increment(found.len() as u64);
        Ok(found)
    }

    pub async fn utilization(
        &self,
        resource_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<ResourceUtilization, EngineError> {
        let window = validate_window(start, end)?;
        let guard = self.read_resource(&resource_id).await?;
        Ok(compute_utilization(&guard, &window))
    }

    /// One entry per resource, creation order.
    pub async fn utilization_all(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<ResourceUtilization>, EngineError> {
        let window = validate_window(start, end)?;
        Ok(self
            .scan(|rs| Some(compute_utilization(rs, &window)))
            .await
            .into_iter()
            .map(|(_, u)| u)
            .collect())
    }
}
