//! Error types for the realtalk core.

use thiserror::Error;

/// Classification of a language-model provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    ResourceNotFound,
    InvalidRequest,
    Throttled,
    AccessDenied,
    ProviderInternalError,
    Unclassified,
}

impl FaultKind {
    /// Throttling, transient provider errors and generic I/O faults are worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FaultKind::Throttled | FaultKind::ProviderInternalError | FaultKind::Unclassified
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FaultKind::ResourceNotFound => "resource_not_found",
            FaultKind::InvalidRequest => "invalid_request",
            FaultKind::Throttled => "throttled",
            FaultKind::AccessDenied => "access_denied",
            FaultKind::ProviderInternalError => "provider_internal_error",
            FaultKind::Unclassified => "unclassified",
        }
    }
}

/// Raw failure reported by an [`LlmBackend`](crate::llm::LlmBackend) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{} fault: {message}", kind.as_str())]
pub struct ProviderFault {
    pub kind: FaultKind,
    pub message: String,
}

impl ProviderFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Typed error surfaced to consumers of the generation stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("Model or resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Provider throttled the request: {0}")]
    Throttled(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Provider internal error: {0}")]
    ProviderInternalError(String),

    #[error("Unclassified provider error: {0}")]
    Unclassified(String),
}

impl LlmError {
    pub fn kind(&self) -> FaultKind {
        match self {
            LlmError::ResourceNotFound(_) => FaultKind::ResourceNotFound,
            LlmError::InvalidRequest(_) => FaultKind::InvalidRequest,
            LlmError::Throttled(_) => FaultKind::Throttled,
            LlmError::AccessDenied(_) => FaultKind::AccessDenied,
            LlmError::ProviderInternalError(_) => FaultKind::ProviderInternalError,
            LlmError::Unclassified(_) => FaultKind::Unclassified,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<ProviderFault> for LlmError {
    fn from(fault: ProviderFault) -> Self {
        let ProviderFault { kind, message } = fault;
        match kind {
            FaultKind::ResourceNotFound => LlmError::ResourceNotFound(message),
            FaultKind::InvalidRequest => LlmError::InvalidRequest(message),
            FaultKind::Throttled => LlmError::Throttled(message),
            FaultKind::AccessDenied => LlmError::AccessDenied(message),
            FaultKind::ProviderInternalError => LlmError::ProviderInternalError(message),
            FaultKind::Unclassified => LlmError::Unclassified(message),
        }
    }
}

/// Configuration loading and validation failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_faults_are_retryable() {
        assert!(FaultKind::Throttled.is_retryable());
        assert!(FaultKind::ProviderInternalError.is_retryable());
        assert!(FaultKind::Unclassified.is_retryable());
        assert!(!FaultKind::AccessDenied.is_retryable());
        assert!(!FaultKind::InvalidRequest.is_retryable());
        assert!(!FaultKind::ResourceNotFound.is_retryable());
    }

    #[test]
    fn provider_fault_maps_to_matching_error() {
        let err: LlmError = ProviderFault::new(FaultKind::AccessDenied, "bad key").into();
        assert_eq!(err, LlmError::AccessDenied("bad key".to_string()));
        assert_eq!(err.kind(), FaultKind::AccessDenied);
        assert!(!err.is_retryable());
    }
}
