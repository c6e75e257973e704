use std::any::Any;
use std::collections::HashMap;
use thiserror::Error;

/// Engine-level error type.
///
/// Step failures never surface here; they are carried as
/// [`StepError`](crate::execution::StepError) values inside each step result.
#[derive(Debug, Error)]
pub enum ConvoyError {
    /// Plan failed structural validation (duplicate ids, dangling dependencies)
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        step_id: Option<String>,
    },

    /// Scheduler found steps whose dependencies can never be satisfied
    #[error("Circular dependency detected among steps: {}", stranded.join(", "))]
    CircularDependency { stranded: Vec<String> },

    /// Admission control rejected the execution
    #[error("Execution capacity exhausted (in flight: {current}, limit: {limit})")]
    Capacity { current: usize, limit: usize },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        context: HashMap<String, String>,
    },
}

impl ConvoyError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            step_id: None,
        }
    }

    /// Create a validation error pinned to a step
    pub fn validation_step<S: Into<String>, I: Into<String>>(message: S, step_id: I) -> Self {
        Self::Validation {
            message: message.into(),
            step_id: Some(step_id.into()),
        }
    }

    pub fn circular_dependency(stranded: Vec<String>) -> Self {
        Self::CircularDependency { stranded }
    }

    pub fn capacity(current: usize, limit: usize) -> Self {
        Self::Capacity { current, limit }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the offending field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
            context: HashMap::new(),
        }
    }

    /// Add context to an internal error
    pub fn with_context<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        if let Self::Internal { ref mut context, .. } = self {
            context.insert(key.into(), value.into());
        }
        self
    }

    /// Whether the caller may reasonably resubmit the same request later
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Capacity { .. } | Self::Io { .. } => true,
            Self::Validation { .. }
            | Self::CircularDependency { .. }
            | Self::Configuration { .. }
            | Self::Serialization { .. } => false,
            Self::Internal { .. } => false,
        }
    }

    /// Stable code used in [`ExecutionError`](crate::execution::ExecutionError) records
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::CircularDependency { .. } => "CIRCULAR_DEPENDENCY",
            Self::Capacity { .. } => "CAPACITY_EXCEEDED",
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
            Self::Io { .. } => "IO_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::CircularDependency { .. } => "cycle",
            Self::Capacity { .. } => "capacity",
            Self::Configuration { .. } => "configuration",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ConvoyError>;

impl From<std::io::Error> for ConvoyError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for ConvoyError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for ConvoyError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<anyhow::Error> for ConvoyError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string()).with_context("source", "anyhow")
    }
}

/// Render a caught panic payload as `"<prefix>: <message>"`
pub(crate) fn panic_message(prefix: &str, panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("{}: {}", prefix, s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("{}: {}", prefix, s)
    } else {
        prefix.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_payloads() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("boom"));
        assert_eq!(panic_message("action panicked", owned.as_ref()), "action panicked: boom");

        let borrowed: Box<dyn Any + Send> = Box::new("bang");
        assert_eq!(panic_message("action panicked", borrowed.as_ref()), "action panicked: bang");

        let opaque: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message("action panicked", opaque.as_ref()), "action panicked");
    }

    #[test]
    fn test_error_codes_and_categories() {
        let err = ConvoyError::validation("duplicate step id 'a'");
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(err.category(), "validation");

        let err = ConvoyError::circular_dependency(vec!["a".into(), "b".into()]);
        assert_eq!(err.code(), "CIRCULAR_DEPENDENCY");
        assert_eq!(
            err.to_string(),
            "Circular dependency detected among steps: a, b"
        );
    }

    #[test]
    fn test_error_context() {
        let err = ConvoyError::internal("scheduler panicked")
            .with_context("execution_id", "exec-1")
            .with_context("phase", "execution");

        if let ConvoyError::Internal { context, .. } = err {
            assert_eq!(context.get("execution_id"), Some(&"exec-1".to_string()));
            assert_eq!(context.get("phase"), Some(&"execution".to_string()));
        } else {
            panic!("Expected internal error");
        }
    }

    #[test]
    fn test_error_recoverability() {
        assert!(ConvoyError::capacity(4, 4).is_recoverable());
        assert!(!ConvoyError::validation("bad").is_recoverable());
        assert!(!ConvoyError::configuration("bad").is_recoverable());
        assert!(!ConvoyError::circular_dependency(vec![]).is_recoverable());
    }

    #[test]
    fn test_from_yaml_error() {
        let yaml_err = serde_yaml::from_str::<serde_json::Value>("a: [").unwrap_err();
        let err: ConvoyError = yaml_err.into();
        assert_eq!(err.category(), "serialization");
    }
}
