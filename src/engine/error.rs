use ulid::Ulid;

use crate::model::{AllocationStatus, UnknownVariant};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("invalid transition for allocation {id}: {from} -> {to}")]
    InvalidTransition {
        id: Ulid,
        from: AllocationStatus,
        to: AllocationStatus,
    },
    #[error("resource {resource_id} still has open allocations: {}", join_ids(.blocking))]
    Conflict { resource_id: Ulid, blocking: Vec<Ulid> },
    #[error("optimizer gave up after {attempts} attempts: resources kept changing")]
    Busy { attempts: u32 },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("journal error: {0}")]
    Journal(String),
}

impl From<UnknownVariant> for EngineError {
    fn from(e: UnknownVariant) -> Self {
        EngineError::Validation(e.to_string())
    }
}

fn join_ids(ids: &[Ulid]) -> String {
    ids.iter().map(Ulid::to_string).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_message_lists_blockers() {
        let err = EngineError::Conflict {
            resource_id: Ulid::from_parts(1, 0),
            blocking: vec![Ulid::from_parts(2, 0), Ulid::from_parts(3, 0)],
        };
        let msg = err.to_string();
        assert!(msg.contains(&Ulid::from_parts(2, 0).to_string()));
        assert!(msg.contains(", "));
    }

    #[test]
    fn unknown_variant_is_validation() {
        let err: EngineError = "teleporter".parse::<crate::model::ResourceKind>().unwrap_err().into();
        assert!(matches!(err, EngineError::Validation(ref m) if m.contains("teleporter")));
    }
}
