use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Day ordinal (days since 0001-01-01). All interval arithmetic happens on these.
pub type Day = i64;

/// Integral units of a resource.
pub type Qty = u64;

pub fn day_of(date: NaiveDate) -> Day {
    Day::from(date.num_days_from_ce())
}

pub fn date_of(day: Day) -> NaiveDate {
    i32::try_from(day)
        .ok()
        .and_then(NaiveDate::from_num_days_from_ce_opt)
        .unwrap_or(NaiveDate::MAX)
}

/// Half-open interval of days `[start, end)`.
///
/// Records store inclusive date ranges; `Span::inclusive` converts them so the
/// last date is covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Day,
    pub end: Day,
}

impl Span {
    pub fn new(start: Day, end: Day) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Span covering `first..=last`.
    pub fn inclusive(first: NaiveDate, last: NaiveDate) -> Self {
        Self::new(day_of(first), day_of(last) + 1)
    }

    pub fn days(&self) -> i64 {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_day(&self, day: Day) -> bool {
        self.start <= day && day < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn intersect(&self, other: &Span) -> Option<Span> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then(|| Span::new(start, end))
    }

    pub fn first_date(&self) -> NaiveDate {
        date_of(self.start)
    }

    /// Last covered date (inclusive).
    pub fn last_date(&self) -> NaiveDate {
        date_of(self.end - 1)
    }
}

// ── Enumerations ─────────────────────────────────────────────────

/// A string that names no variant of the enum it was parsed into.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {field}: {value:?}")]
pub struct UnknownVariant {
    pub field: &'static str,
    pub value: String,
}

/// Lower-case labels shared by `Display`, `FromStr` and the SQL front end.
macro_rules! labelled {
    ($name:ident, $field:literal { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($label => Ok($name::$variant),)+
                    _ => Err(UnknownVariant { field: $field, value: s.to_string() }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Human,
    Equipment,
    Material,
    Vehicle,
}

labelled!(ResourceKind, "resource kind" {
    Human => "human",
    Equipment => "equipment",
    Material => "material",
    Vehicle => "vehicle",
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    #[default]
    Available,
    Busy,
    Maintenance,
    Unavailable,
}

labelled!(ResourceStatus, "resource status" {
    Available => "available",
    Busy => "busy",
    Maintenance => "maintenance",
    Unavailable => "unavailable",
});

impl ResourceStatus {
    /// Conflict kind every demanded day is reported as, regardless of capacity.
    pub fn conflict_kind(self) -> Option<ConflictKind> {
        match self {
            ResourceStatus::Maintenance => Some(ConflictKind::Maintenance),
            ResourceStatus::Unavailable => Some(ConflictKind::Unavailable),
            ResourceStatus::Available | ResourceStatus::Busy => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    #[default]
    Planned,
    Active,
    Completed,
    Cancelled,
}

labelled!(AllocationStatus, "allocation status" {
    Planned => "planned",
    Active => "active",
    Completed => "completed",
    Cancelled => "cancelled",
});

impl AllocationStatus {
    /// planned→active, planned→cancelled, active→completed, active→cancelled.
    pub fn can_transition_to(self, next: AllocationStatus) -> bool {
        use AllocationStatus::*;
        matches!(
            (self, next),
            (Planned, Active) | (Planned, Cancelled) | (Active, Completed) | (Active, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AllocationStatus::Completed | AllocationStatus::Cancelled)
    }

    /// Planned and active allocations hold capacity.
    pub fn is_open(self) -> bool {
        !self.is_terminal()
    }
}

/// Declaration order is the ranking: `Low < Medium < High`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

labelled!(Priority, "priority" {
    Low => "low",
    Medium => "medium",
    High => "high",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Overallocation,
    Unavailable,
    Maintenance,
}

labelled!(ConflictKind, "conflict kind" {
    Overallocation => "overallocation",
    Unavailable => "unavailable",
    Maintenance => "maintenance",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostBasis {
    Hour,
    Day,
    Unit,
    Fixed,
}

labelled!(CostBasis, "cost basis" {
    Hour => "hour",
    Day => "day",
    Unit => "unit",
    Fixed => "fixed",
});

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    pub rate: f64,
    pub basis: CostBasis,
    pub currency: String,
}

/// Weekly working pattern. Bit 0 of `weekdays` is Monday; hours are `[start_hour, end_hour)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkSchedule {
    pub weekdays: u8,
    pub start_hour: u8,
    pub end_hour: u8,
}

impl WorkSchedule {
    pub const MONDAY_TO_FRIDAY: u8 = 0b001_1111;

    pub fn works_on(&self, date: NaiveDate) -> bool {
        self.weekdays & (1 << date.weekday().num_days_from_monday()) != 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    /// Creation sequence; listing order.
    pub seq: u64,
    pub kind: ResourceKind,
    pub name: String,
    pub code: String,
    pub status: ResourceStatus,
    pub cost: Option<CostModel>,
    pub skills: Vec<String>,
    pub certifications: Vec<String>,
    pub schedule: Option<WorkSchedule>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Quantity of a resource on offer over `start..=end`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCapacity {
    pub id: Ulid,
    pub seq: u64,
    pub resource_id: Ulid,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub quantity: Qty,
    pub unit: String,
}

impl ResourceCapacity {
    pub fn span(&self) -> Span {
        Span::inclusive(self.start, self.end)
    }
}

/// A reservation of `quantity` units of a resource over `start..=end`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub id: Ulid,
    pub seq: u64,
    pub resource_id: Ulid,
    pub project_id: String,
    pub task_id: Option<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub quantity: Qty,
    pub status: AllocationStatus,
    pub priority: Priority,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceAllocation {
    pub fn span(&self) -> Span {
        Span::inclusive(self.start, self.end)
    }
}

// ── Derived views ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceConflict {
    pub resource_id: Ulid,
    pub kind: ConflictKind,
    /// First day of the sub-interval (inclusive).
    pub start: NaiveDate,
    /// Last day of the sub-interval (inclusive).
    pub end: NaiveDate,
    pub required: Qty,
    pub available: Qty,
    /// Open allocations covering the sub-interval, in creation order.
    pub allocation_ids: Vec<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceUtilization {
    pub resource_id: Ulid,
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Capacity quantity integrated over the period (unit-days).
    pub capacity_days: u64,
    /// Non-cancelled allocation quantity integrated over the period (unit-days).
    pub allocated_days: u64,
    /// `allocated_days / capacity_days`, or 0 without capacity. Above 1.0 means overallocated.
    pub rate: f64,
}

// ── Inputs ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct NewResource {
    pub kind: ResourceKind,
    pub name: String,
    pub code: String,
    pub status: ResourceStatus,
    pub cost: Option<CostModel>,
    pub skills: Vec<String>,
    pub certifications: Vec<String>,
    pub schedule: Option<WorkSchedule>,
}

impl NewResource {
    pub fn new(kind: ResourceKind, name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            code: code.into(),
            status: ResourceStatus::Available,
            cost: None,
            skills: Vec::new(),
            certifications: Vec::new(),
            schedule: None,
        }
    }

    pub fn with_status(mut self, status: ResourceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_skills(mut self, skills: Vec<String>) -> Self {
        self.skills = skills;
        self
    }

    pub fn with_certifications(mut self, certifications: Vec<String>) -> Self {
        self.certifications = certifications;
        self
    }

    pub fn with_cost(mut self, cost: CostModel) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn with_schedule(mut self, schedule: WorkSchedule) -> Self {
        self.schedule = Some(schedule);
        self
    }
}

/// Partial update; `None` leaves a field untouched. Doubly optional fields can be cleared.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourcePatch {
    pub kind: Option<ResourceKind>,
    pub name: Option<String>,
    pub code: Option<String>,
    pub status: Option<ResourceStatus>,
    pub cost: Option<Option<CostModel>>,
    pub skills: Option<Vec<String>>,
    pub certifications: Option<Vec<String>>,
    pub schedule: Option<Option<WorkSchedule>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCapacity {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub quantity: Qty,
    pub unit: String,
}

impl NewCapacity {
    pub fn new(start: NaiveDate, end: NaiveDate, quantity: Qty) -> Self {
        Self {
            start,
            end,
            quantity,
            unit: "units".into(),
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapacityPatch {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub quantity: Option<Qty>,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    pub resource_id: Ulid,
    pub project_id: String,
    pub task_id: Option<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub quantity: Qty,
    pub priority: Priority,
    pub notes: Option<String>,
}

impl AllocationRequest {
    pub fn new(
        resource_id: Ulid,
        project_id: impl Into<String>,
        start: NaiveDate,
        end: NaiveDate,
        quantity: Qty,
    ) -> Self {
        Self {
            resource_id,
            project_id: project_id.into(),
            task_id: None,
            start,
            end,
            quantity,
            priority: Priority::Medium,
            notes: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationPatch {
    pub task_id: Option<Option<String>>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub quantity: Option<Qty>,
    pub priority: Option<Priority>,
    pub notes: Option<Option<String>>,
    /// Checked against the status state machine when it differs from the current status.
    pub status: Option<AllocationStatus>,
}

/// A request handed to the optimizer; the project is given per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub resource_id: Ulid,
    pub task_id: Option<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub quantity: Qty,
    pub priority: Priority,
    pub notes: Option<String>,
}

impl PendingRequest {
    pub fn new(resource_id: Ulid, start: NaiveDate, end: NaiveDate, quantity: Qty, priority: Priority) -> Self {
        Self {
            resource_id,
            task_id: None,
            start,
            end,
            quantity,
            priority,
            notes: None,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn span(&self) -> Span {
        Span::inclusive(self.start, self.end)
    }
}

// ── Optimizer output ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    /// Some day of the request would exceed capacity; `start..=end` is the first blocking run.
    CapacityExceeded {
        start: NaiveDate,
        end: NaiveDate,
        /// Peak demand in the run, including the request.
        required: Qty,
        /// Lowest capacity in the run.
        available: Qty,
    },
    ResourceUnavailable {
        status: ResourceStatus,
    },
}

impl RejectionReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectionReason::CapacityExceeded { .. } => "capacity-exceeded",
            RejectionReason::ResourceUnavailable { .. } => "resource-unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRequest {
    /// Position in the submitted request list.
    pub index: usize,
    pub request: PendingRequest,
    pub reason: RejectionReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizationOutcome {
    /// Created allocations, in decision order.
    pub accepted: Vec<ResourceAllocation>,
    /// Rejected requests, in decision order.
    pub rejected: Vec<RejectedRequest>,
}

// ── Engine state ─────────────────────────────────────────────────

/// Records kept in start order inside a `ResourceState`.
pub trait Dated {
    fn id(&self) -> Ulid;
    fn seq(&self) -> u64;
    fn span(&self) -> Span;
}

impl Dated for ResourceCapacity {
    fn id(&self) -> Ulid {
        self.id
    }
    fn seq(&self) -> u64 {
        self.seq
    }
    fn span(&self) -> Span {
        ResourceCapacity::span(self)
    }
}

impl Dated for ResourceAllocation {
    fn id(&self) -> Ulid {
        self.id
    }
    fn seq(&self) -> u64 {
        self.seq
    }
    fn span(&self) -> Span {
        ResourceAllocation::span(self)
    }
}

/// Insert maintaining `(span.start, seq)` order.
fn insert_sorted<T: Dated>(items: &mut Vec<T>, item: T) {
    let key = (item.span().start, item.seq());
    let pos = items
        .binary_search_by_key(&key, |i| (i.span().start, i.seq()))
        .unwrap_or_else(|e| e);
    items.insert(pos, item);
}

fn remove_by_id<T: Dated>(items: &mut Vec<T>, id: Ulid) -> Option<T> {
    let pos = items.iter().position(|i| i.id() == id)?;
    Some(items.remove(pos))
}

/// Items whose span overlaps `query`. Binary search skips items starting at or after `query.end`.
fn overlapping<'a, T: Dated>(items: &'a [T], query: &Span) -> impl Iterator<Item = &'a T> + 'a {
    let right_bound = items.partition_point(|i| i.span().start < query.end);
    let query_start = query.start;
    items[..right_bound]
        .iter()
        .filter(move |i| i.span().end > query_start)
}

/// One resource with its capacity windows and allocations.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub resource: Resource,
    /// Sorted by `(start, seq)`.
    pub capacities: Vec<ResourceCapacity>,
    /// Sorted by `(start, seq)`.
    pub allocations: Vec<ResourceAllocation>,
    /// Bumped on every applied event.
    pub version: u64,
    /// Set under the write lock when the resource is removed.
    pub removed: bool,
}

impl ResourceState {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            capacities: Vec::new(),
            allocations: Vec::new(),
            version: 0,
            removed: false,
        }
    }

    pub fn entry_count(&self) -> usize {
        self.capacities.len() + self.allocations.len()
    }

    pub fn insert_capacity(&mut self, capacity: ResourceCapacity) {
        insert_sorted(&mut self.capacities, capacity);
    }

    pub fn remove_capacity(&mut self, id: Ulid) -> Option<ResourceCapacity> {
        remove_by_id(&mut self.capacities, id)
    }

    /// Replace by id; dates may have moved so the record is re-sorted.
    pub fn replace_capacity(&mut self, capacity: ResourceCapacity) {
        self.remove_capacity(capacity.id);
        self.insert_capacity(capacity);
    }

    pub fn capacity(&self, id: &Ulid) -> Option<&ResourceCapacity> {
        self.capacities.iter().find(|c| c.id == *id)
    }

    pub fn insert_allocation(&mut self, allocation: ResourceAllocation) {
        insert_sorted(&mut self.allocations, allocation);
    }

    pub fn remove_allocation(&mut self, id: Ulid) -> Option<ResourceAllocation> {
        remove_by_id(&mut self.allocations, id)
    }

    pub fn replace_allocation(&mut self, allocation: ResourceAllocation) {
        self.remove_allocation(allocation.id);
        self.insert_allocation(allocation);
    }

    pub fn allocation(&self, id: &Ulid) -> Option<&ResourceAllocation> {
        self.allocations.iter().find(|a| a.id == *id)
    }

    pub fn overlapping_capacities(&self, query: &Span) -> impl Iterator<Item = &ResourceCapacity> {
        overlapping(&self.capacities, query)
    }

    pub fn overlapping_allocations(&self, query: &Span) -> impl Iterator<Item = &ResourceAllocation> {
        overlapping(&self.allocations, query)
    }

    /// Planned and active allocations, in creation order.
    pub fn open_allocations(&self) -> Vec<&ResourceAllocation> {
        let mut open: Vec<&ResourceAllocation> =
            self.allocations.iter().filter(|a| a.status.is_open()).collect();
        open.sort_by_key(|a| a.seq);
        open
    }
}

/// The journal record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated { resource: Resource },
    ResourceUpdated { resource: Resource },
    ResourceRemoved { id: Ulid },
    CapacityAdded { capacity: ResourceCapacity },
    CapacityUpdated { capacity: ResourceCapacity },
    CapacityRemoved { id: Ulid, resource_id: Ulid },
    AllocationCreated { allocation: ResourceAllocation },
    AllocationUpdated { allocation: ResourceAllocation },
    AllocationRemoved { id: Ulid, resource_id: Ulid },
    /// One optimizer run's accepted allocations, written as a single record.
    AllocationsCommitted {
        project_id: String,
        allocations: Vec<ResourceAllocation>,
    },
}

impl Event {
    /// Resources whose state the event touches.
    pub fn resource_ids(&self) -> Vec<Ulid> {
        match self {
            Event::ResourceCreated { resource } | Event::ResourceUpdated { resource } => vec![resource.id],
            Event::ResourceRemoved { id } => vec![*id],
            Event::CapacityAdded { capacity } | Event::CapacityUpdated { capacity } => {
                vec![capacity.resource_id]
            }
            Event::AllocationCreated { allocation } | Event::AllocationUpdated { allocation } => {
                vec![allocation.resource_id]
            }
            Event::CapacityRemoved { resource_id, .. } | Event::AllocationRemoved { resource_id, .. } => {
                vec![*resource_id]
            }
            Event::AllocationsCommitted { allocations, .. } => {
                let mut ids: Vec<Ulid> = allocations.iter().map(|a| a.resource_id).collect();
                ids.sort();
                ids.dedup();
                ids
            }
        }
    }

    /// Highest creation sequence number the event carries.
    pub fn max_seq(&self) -> Option<u64> {
        match self {
            Event::ResourceCreated { resource } | Event::ResourceUpdated { resource } => Some(resource.seq),
            Event::CapacityAdded { capacity } | Event::CapacityUpdated { capacity } => Some(capacity.seq),
            Event::AllocationCreated { allocation } | Event::AllocationUpdated { allocation } => {
                Some(allocation.seq)
            }
            Event::AllocationsCommitted { allocations, .. } => allocations.iter().map(|a| a.seq).max(),
            Event::ResourceRemoved { .. }
            | Event::CapacityRemoved { .. }
            | Event::AllocationRemoved { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn capacity(seq: u64, start: NaiveDate, end: NaiveDate) -> ResourceCapacity {
        ResourceCapacity {
            id: Ulid::from_parts(seq, 0),
            seq,
            resource_id: Ulid::nil(),
            start,
            end,
            quantity: 1,
            unit: "units".into(),
        }
    }

    fn resource() -> Resource {
        let now = d(2024, 1, 1).and_hms_opt(0, 0, 0).unwrap().and_utc();
        Resource {
            id: Ulid::from_parts(1, 0),
            seq: 0,
            kind: ResourceKind::Human,
            name: "Crew-1".into(),
            code: "CR1".into(),
            status: ResourceStatus::Available,
            cost: None,
            skills: vec![],
            certifications: vec![],
            schedule: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn inclusive_span_covers_last_day() {
        let s = Span::inclusive(d(2024, 1, 9), d(2024, 1, 9));
        assert_eq!(s.days(), 1);
        assert!(s.contains_day(day_of(d(2024, 1, 9))));
        assert!(!s.contains_day(day_of(d(2024, 1, 10))));
        assert_eq!(s.first_date(), d(2024, 1, 9));
        assert_eq!(s.last_date(), d(2024, 1, 9));
    }

    #[test]
    fn span_overlap_and_intersection() {
        let a = Span::inclusive(d(2024, 1, 5), d(2024, 1, 10));
        let b = Span::inclusive(d(2024, 1, 8), d(2024, 1, 15));
        let c = Span::inclusive(d(2024, 1, 11), d(2024, 1, 12));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent days, no shared day
        assert_eq!(a.intersect(&b), Some(Span::inclusive(d(2024, 1, 8), d(2024, 1, 10))));
        assert_eq!(a.intersect(&c), None);
        assert!(Span::inclusive(d(2024, 1, 1), d(2024, 1, 31)).contains_span(&a));
    }

    #[test]
    fn day_ordinals_roundtrip_dates() {
        let date = d(2024, 2, 29);
        assert_eq!(date_of(day_of(date)), date);
        assert_eq!(day_of(d(2024, 3, 1)) - day_of(date), 1);
    }

    #[test]
    fn enum_labels_parse_case_insensitively() {
        assert_eq!("Vehicle".parse::<ResourceKind>().unwrap(), ResourceKind::Vehicle);
        assert_eq!(" maintenance ".parse::<ResourceStatus>().unwrap(), ResourceStatus::Maintenance);
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        let err = "robot".parse::<ResourceKind>().unwrap_err();
        assert_eq!(err.field, "resource kind");
        assert_eq!(err.to_string(), "unknown resource kind: \"robot\"");
        for status in AllocationStatus::ALL {
            assert_eq!(status.as_str().parse::<AllocationStatus>().unwrap(), *status);
        }
    }

    #[test]
    fn status_state_machine() {
        use AllocationStatus::*;
        assert!(Planned.can_transition_to(Active));
        assert!(Planned.can_transition_to(Cancelled));
        assert!(Active.can_transition_to(Completed));
        assert!(Active.can_transition_to(Cancelled));
        assert!(!Planned.can_transition_to(Completed));
        assert!(!Active.can_transition_to(Planned));
        for from in [Completed, Cancelled] {
            for to in AllocationStatus::ALL {
                assert!(!from.can_transition_to(*to), "{from} -> {to} must be rejected");
            }
        }
        for s in AllocationStatus::ALL {
            assert!(!s.can_transition_to(*s));
        }
    }

    #[test]
    fn priority_ranks_high_above_low() {
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn status_conflict_kinds() {
        assert_eq!(ResourceStatus::Maintenance.conflict_kind(), Some(ConflictKind::Maintenance));
        assert_eq!(ResourceStatus::Unavailable.conflict_kind(), Some(ConflictKind::Unavailable));
        assert_eq!(ResourceStatus::Busy.conflict_kind(), None);
    }

    #[test]
    fn work_schedule_weekdays() {
        let schedule = WorkSchedule {
            weekdays: WorkSchedule::MONDAY_TO_FRIDAY,
            start_hour: 8,
            end_hour: 17,
        };
        assert!(schedule.works_on(d(2024, 1, 5))); // Friday
        assert!(!schedule.works_on(d(2024, 1, 6))); // Saturday
    }

    #[test]
    fn capacities_stay_sorted_by_start_then_seq() {
        let mut rs = ResourceState::new(resource());
        rs.insert_capacity(capacity(3, d(2024, 3, 1), d(2024, 3, 31)));
        rs.insert_capacity(capacity(2, d(2024, 1, 1), d(2024, 1, 31)));
        rs.insert_capacity(capacity(1, d(2024, 1, 1), d(2024, 2, 15)));
        let seqs: Vec<u64> = rs.capacities.iter().map(|c| c.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn replace_resorts_moved_capacity() {
        let mut rs = ResourceState::new(resource());
        rs.insert_capacity(capacity(1, d(2024, 1, 1), d(2024, 1, 31)));
        rs.insert_capacity(capacity(2, d(2024, 2, 1), d(2024, 2, 28)));
        let mut moved = rs.capacities[0].clone();
        moved.start = d(2024, 3, 1);
        moved.end = d(2024, 3, 5);
        rs.replace_capacity(moved);
        assert_eq!(rs.capacities.len(), 2);
        assert_eq!(rs.capacities[0].seq, 2);
        assert_eq!(rs.capacities[1].start, d(2024, 3, 1));
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut rs = ResourceState::new(resource());
        rs.insert_capacity(capacity(1, d(2024, 1, 1), d(2024, 1, 4)));
        rs.insert_capacity(capacity(2, d(2024, 1, 3), d(2024, 1, 20)));
        rs.insert_capacity(capacity(3, d(2024, 2, 1), d(2024, 2, 2)));
        let query = Span::inclusive(d(2024, 1, 5), d(2024, 1, 10));
        let hits: Vec<u64> = rs.overlapping_capacities(&query).map(|c| c.seq).collect();
        assert_eq!(hits, vec![2]);
    }

    #[test]
    fn overlapping_includes_single_shared_day() {
        let mut rs = ResourceState::new(resource());
        rs.insert_capacity(capacity(1, d(2024, 1, 1), d(2024, 1, 5)));
        let query = Span::inclusive(d(2024, 1, 5), d(2024, 1, 9));
        assert_eq!(rs.overlapping_capacities(&query).count(), 1);
        let after = Span::inclusive(d(2024, 1, 6), d(2024, 1, 9));
        assert_eq!(rs.overlapping_capacities(&after).count(), 0);
    }

    #[test]
    fn remove_nonexistent_returns_none() {
        let mut rs = ResourceState::new(resource());
        rs.insert_capacity(capacity(1, d(2024, 1, 1), d(2024, 1, 5)));
        assert!(rs.remove_capacity(Ulid::from_parts(99, 0)).is_none());
        assert_eq!(rs.capacities.len(), 1);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ResourceCreated { resource: resource() };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn committed_event_lists_each_resource_once() {
        let now = d(2024, 1, 1).and_hms_opt(0, 0, 0).unwrap().and_utc();
        let alloc = |seq: u64, rid: u64| ResourceAllocation {
            id: Ulid::from_parts(seq, 0),
            seq,
            resource_id: Ulid::from_parts(rid, 0),
            project_id: "p".into(),
            task_id: None,
            start: d(2024, 1, 1),
            end: d(2024, 1, 2),
            quantity: 1,
            status: AllocationStatus::Planned,
            priority: Priority::Medium,
            notes: None,
            created_at: now,
            updated_at: now,
        };
        let event = Event::AllocationsCommitted {
            project_id: "p".into(),
            allocations: vec![alloc(5, 2), alloc(6, 1), alloc(7, 2)],
        };
        assert_eq!(event.resource_ids(), vec![Ulid::from_parts(1, 0), Ulid::from_parts(2, 0)]);
        assert_eq!(event.max_seq(), Some(7));
    }
}
