/// Storage failure with a retry classification.
///
/// Retryable: busy/locked database, connection loss, timeouts.
/// Permanent: invalid lock tokens, constraint violations, undecodable rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Provider operation that failed, e.g. `"ack_orchestration_item"`.
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// The failure as an orchestration sees it.
    pub fn to_infrastructure_error(&self) -> crate::ErrorDetails {
        crate::ErrorDetails::Infrastructure {
            operation: self.operation.clone(),
            message: self.message.clone(),
            retryable: self.retryable,
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test: retryable and permanent constructors classify errors
    #[test]
    fn test_provider_error_classification() {
        let busy = ProviderError::retryable("fetch_work_item", "Database locked");
        assert!(busy.is_retryable());
        assert_eq!(busy.to_string(), "fetch_work_item: Database locked");

        let bad_token = ProviderError::permanent("ack_entity_item", "Invalid lock token");
        assert!(!bad_token.is_retryable());
        assert_ne!(busy, bad_token);

        let _err: Box<dyn std::error::Error> = Box::new(bad_token);
    }

    /// Test: provider errors surface to orchestrations as infrastructure details
    #[test]
    fn test_provider_error_to_infrastructure() {
        let err = ProviderError::permanent("read", "Failed to deserialize event");
        let details = err.to_infrastructure_error();
        assert_eq!(details.category(), "infrastructure");
        assert_eq!(details.display_message(), "infrastructure:read: Failed to deserialize event");
        assert!(!details.is_retryable());
    }
}
