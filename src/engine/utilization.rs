use crate::model::*;

/// Capacity against allocated unit-days for one resource over `window`.
///
/// Every allocation that was not cancelled counts, completed ones included.
pub fn compute_utilization(rs: &ResourceState, window: &Span) -> ResourceUtilization {
    let capacity_days: u64 = rs
        .overlapping_capacities(window)
        .filter_map(|c| c.span().intersect(window).map(|s| c.quantity * s.days() as u64))
        .sum();
    let allocated_days: u64 = rs
        .overlapping_allocations(window)
        .filter(|a| a.status != AllocationStatus::Cancelled)
        .filter_map(|a| a.span().intersect(window).map(|s| a.quantity * s.days() as u64))
        .sum();
    let rate = if capacity_days == 0 {
        0.0
    } else {
        allocated_days as f64 / capacity_days as f64
    };

    ResourceUtilization {
        resource_id: rs.resource.id,
        start: window.first_date(),
        end: window.last_date(),
        capacity_days,
        allocated_days,
        rate,
    }
}
