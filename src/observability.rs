use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "allotment_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "allotment_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "allotment_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "allotment_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "allotment_connections_rejected_total";

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "allotment_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (events per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "allotment_journal_flush_batch_size";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: allocations written, by `allocate` or by an optimizer commit.
pub const ALLOCATIONS_CREATED_TOTAL: &str = "allotment_allocations_created_total";

/// Counter: allocations accepted by `allocate` that overcommit their resource.
pub const OVERALLOCATING_ALLOCATIONS_TOTAL: &str = "allotment_overallocating_allocations_total";

/// Counter: conflict rows returned by conflict queries.
pub const CONFLICTS_REPORTED_TOTAL: &str = "allotment_conflicts_reported_total";

/// Counter: committed optimizer runs.
pub const OPTIMIZER_RUNS_TOTAL: &str = "allotment_optimizer_runs_total";

/// Counter: optimizer attempts discarded because a snapshot went stale.
pub const OPTIMIZER_RETRIES_TOTAL: &str = "allotment_optimizer_retries_total";

/// Histogram: optimizer wall time from first snapshot to commit, in seconds.
pub const OPTIMIZER_DURATION_SECONDS: &str = "allotment_optimizer_duration_seconds";

/// Counter: planned allocations moved to active by the activator.
pub const ACTIVATIONS_TOTAL: &str = "allotment_activations_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertResource(_) => "insert_resource",
        Command::SetResourceStatus { .. } => "set_resource_status",
        Command::DeleteResource { .. } => "delete_resource",
        Command::InsertCapacity { .. } => "insert_capacity",
        Command::DeleteCapacity { .. } => "delete_capacity",
        Command::InsertAllocation(_) => "insert_allocation",
        Command::DeleteAllocation { .. } => "delete_allocation",
        Command::Transition { .. } => "transition",
        Command::Optimize { .. } => "optimize",
        Command::SelectResources { .. } => "select_resources",
        Command::SelectCapacities { .. } => "select_capacities",
        Command::SelectAllocations(_) => "select_allocations",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectUtilization { .. } => "select_utilization",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn labels_are_snake_case() {
        let cmd = Command::DeleteCapacity { id: Ulid::nil() };
        assert_eq!(command_label(&cmd), "delete_capacity");
        let label = command_label(&Command::SelectResources {
            search: None,
            kind: None,
        });
        assert!(label.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
    }
}
