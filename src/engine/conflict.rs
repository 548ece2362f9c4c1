use std::collections::BTreeSet;

use ulid::Ulid;

use crate::model::*;

// ── Sweep line ───────────────────────────────────────────────────

/// Capacity on offer over a span.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Supply {
    pub span: Span,
    pub quantity: Qty,
}

/// Quantity demanded over a span. `allocation` is `(seq, id)` for stored allocations
/// and `None` for tentative demand that has no record yet.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Demand {
    pub span: Span,
    pub quantity: Qty,
    pub allocation: Option<(u64, Ulid)>,
}

/// A maximal run of days over which supply and demand are both constant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Segment {
    pub span: Span,
    pub available: Qty,
    pub required: Qty,
    /// Covering allocations as `(seq, id)`, i.e. creation order.
    pub contributors: BTreeSet<(u64, Ulid)>,
}

impl Segment {
    pub fn is_short(&self) -> bool {
        self.required > self.available
    }
}

enum Edge {
    SupplyStart(Qty),
    SupplyEnd(Qty),
    DemandStart(Qty, Option<(u64, Ulid)>),
    DemandEnd(Qty, Option<(u64, Ulid)>),
}

/// Split `window` at every boundary of `supply` and `demand` and total each piece.
///
/// Inputs are clipped to `window`. The returned segments tile the window exactly,
/// in day order. O(n log n) in the number of inputs.
pub(crate) fn sweep(window: Span, supply: &[Supply], demand: &[Demand]) -> Vec<Segment> {
    let mut edges: Vec<(Day, Edge)> = Vec::with_capacity(2 * (supply.len() + demand.len()));
    for s in supply {
        if let Some(span) = s.span.intersect(&window) {
            edges.push((span.start, Edge::SupplyStart(s.quantity)));
            edges.push((span.end, Edge::SupplyEnd(s.quantity)));
        }
    }
    for d in demand {
        if let Some(span) = d.span.intersect(&window) {
            edges.push((span.start, Edge::DemandStart(d.quantity, d.allocation)));
            edges.push((span.end, Edge::DemandEnd(d.quantity, d.allocation)));
        }
    }
    edges.sort_by_key(|(day, _)| *day);

    let mut segments = Vec::new();
    let mut available: Qty = 0;
    let mut required: Qty = 0;
    let mut contributors: BTreeSet<(u64, Ulid)> = BTreeSet::new();
    let mut cursor = window.start;
    let mut i = 0;

    while cursor < window.end {
        while i < edges.len() && edges[i].0 <= cursor {
            match edges[i].1 {
                Edge::SupplyStart(q) => available += q,
                Edge::SupplyEnd(q) => available -= q,
                Edge::DemandStart(q, key) => {
                    required += q;
                    if let Some(key) = key {
                        contributors.insert(key);
                    }
                }
                Edge::DemandEnd(q, key) => {
                    required -= q;
                    if let Some(key) = key {
                        contributors.remove(&key);
                    }
                }
            }
            i += 1;
        }
        let next = edges.get(i).map_or(window.end, |(day, _)| (*day).min(window.end));
        segments.push(Segment {
            span: Span::new(cursor, next),
            available,
            required,
            contributors: contributors.clone(),
        });
        cursor = next;
    }

    segments
}

pub(crate) fn supply_of(rs: &ResourceState, window: &Span) -> Vec<Supply> {
    rs.overlapping_capacities(window)
        .map(|c| Supply {
            span: c.span(),
            quantity: c.quantity,
        })
        .collect()
}

/// Planned and active allocations overlapping `window`.
pub(crate) fn open_demand_of(rs: &ResourceState, window: &Span) -> Vec<Demand> {
    rs.overlapping_allocations(window)
        .filter(|a| a.status.is_open())
        .map(|a| Demand {
            span: a.span(),
            quantity: a.quantity,
            allocation: Some((a.seq, a.id)),
        })
        .collect()
}

/// First run of consecutive short days in `window`, with the peak demand and the
/// lowest capacity seen across the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Shortfall {
    pub span: Span,
    pub required: Qty,
    pub available: Qty,
}

pub(crate) fn first_shortfall(window: Span, supply: &[Supply], demand: &[Demand]) -> Option<Shortfall> {
    let mut run: Option<Shortfall> = None;
    for seg in sweep(window, supply, demand) {
        if !seg.is_short() {
            if run.is_some() {
                break;
            }
            continue;
        }
        if let Some(r) = run.as_mut() {
            r.span.end = seg.span.end;
            r.required = r.required.max(seg.required);
            r.available = r.available.min(seg.available);
        } else {
            run = Some(Shortfall {
                span: seg.span,
                required: seg.required,
                available: seg.available,
            });
        }
    }
    run
}

// ── Conflict detection ───────────────────────────────────────────

/// Conflicts on one resource within `window`, ordered by start.
///
/// With the resource in maintenance or unavailable status, every day with demand is
/// reported under that status; otherwise days with demand above capacity are reported
/// as overallocation. Adjacent days with identical kind, required and available values
/// form one conflict.
pub fn detect_conflicts(rs: &ResourceState, window: &Span) -> Vec<ResourceConflict> {
    let supply = supply_of(rs, window);
    let demand = open_demand_of(rs, window);
    if demand.is_empty() {
        return Vec::new();
    }
    let status_kind = rs.resource.status.conflict_kind();

    let mut merged: Vec<(ConflictKind, Segment)> = Vec::new();
    for seg in sweep(*window, &supply, &demand) {
        let kind = match status_kind {
            Some(kind) if seg.required > 0 => kind,
            Some(_) => continue,
            None if seg.is_short() => ConflictKind::Overallocation,
            None => continue,
        };
        if let Some((last_kind, last)) = merged.last_mut()
            && *last_kind == kind
            && last.span.end == seg.span.start
            && last.required == seg.required
            && last.available == seg.available
        {
            last.span.end = seg.span.end;
            last.contributors.extend(seg.contributors);
            continue;
        }
        merged.push((kind, seg));
    }

    merged
        .into_iter()
        .map(|(kind, seg)| ResourceConflict {
            resource_id: rs.resource.id,
            kind,
            start: seg.span.first_date(),
            end: seg.span.last_date(),
            required: seg.required,
            available: seg.available,
            allocation_ids: seg.contributors.into_iter().map(|(_, id)| id).collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(a: Day, b: Day) -> Span {
        Span::new(a, b)
    }

    fn supply(a: Day, b: Day, q: Qty) -> Supply {
        Supply { span: span(a, b), quantity: q }
    }

    fn demand(a: Day, b: Day, q: Qty, seq: u64) -> Demand {
        Demand {
            span: span(a, b),
            quantity: q,
            allocation: Some((seq, Ulid::from_parts(seq, 0))),
        }
    }

    #[test]
    fn sweep_tiles_window() {
        let segs = sweep(span(0, 10), &[supply(2, 6, 1)], &[demand(4, 12, 1, 1)]);
        let spans: Vec<(Day, Day)> = segs.iter().map(|s| (s.span.start, s.span.end)).collect();
        assert_eq!(spans, vec![(0, 2), (2, 4), (4, 6), (6, 10)]);
        assert_eq!(segs[2].available, 1);
        assert_eq!(segs[2].required, 1);
        assert_eq!(segs[3].available, 0);
        assert_eq!(segs[3].required, 1);
    }

    #[test]
    fn sweep_empty_inputs_yield_single_segment() {
        let segs = sweep(span(5, 9), &[], &[]);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].span, span(5, 9));
        assert_eq!(segs[0].required, 0);
    }

    #[test]
    fn overlapping_windows_are_additive() {
        let segs = sweep(span(0, 4), &[supply(0, 4, 2), supply(1, 3, 3)], &[]);
        let avail: Vec<Qty> = segs.iter().map(|s| s.available).collect();
        assert_eq!(avail, vec![2, 5, 2]);
    }

    #[test]
    fn contributors_follow_creation_order() {
        let segs = sweep(span(0, 2), &[], &[demand(0, 2, 1, 9), demand(0, 2, 1, 3)]);
        let seqs: Vec<u64> = segs[0].contributors.iter().map(|(s, _)| *s).collect();
        assert_eq!(seqs, vec![3, 9]);
    }

    #[test]
    fn first_shortfall_merges_adjacent_short_days() {
        let sup = [supply(0, 10, 2)];
        let dem = [demand(0, 6, 2, 1), demand(3, 5, 1, 2), demand(5, 7, 2, 3)];
        let s = first_shortfall(span(0, 10), &sup, &dem).unwrap();
        assert_eq!(s.span, span(3, 6));
        assert_eq!(s.required, 4);
        assert_eq!(s.available, 2);
    }

    #[test]
    fn first_shortfall_none_when_fits() {
        assert!(first_shortfall(span(0, 5), &[supply(0, 5, 3)], &[demand(0, 5, 3, 1)]).is_none());
    }

    #[test]
    fn tentative_demand_counts_without_contributor() {
        let tentative = Demand {
            span: span(0, 3),
            quantity: 2,
            allocation: None,
        };
        let segs = sweep(span(0, 3), &[supply(0, 3, 1)], &[tentative]);
        assert!(segs[0].is_short());
        assert!(segs[0].contributors.is_empty());
    }
}
