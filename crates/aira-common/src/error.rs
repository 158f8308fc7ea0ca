use thiserror::Error;

/// Errors surfaced by the persistence and publish contracts.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("{entity} already exists: {key}")]
    Conflict { entity: &'static str, key: String },

    #[error("Publish to {channel} failed: {reason}")]
    PublishFailed { channel: String, reason: String },

    #[error("Database error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = StoreError::not_found("task", 42);
        assert_eq!(err.to_string(), "task 42 not found");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_backend_wraps_anyhow() {
        let err: StoreError = anyhow::anyhow!("disk full").into();
        assert!(matches!(err, StoreError::Backend(_)));
        assert!(!err.is_not_found());
    }
}
