//! Error types for the Loom operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each error variant includes contextual information like the object
//! being reconciled and the underlying cause.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Loom operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for CRD specs
    #[error("validation error for {object}: {message}")]
    Validation {
        /// Name of the object with invalid configuration
        object: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.resources[0].id")
        field: Option<String>,
    },

    /// Template rendering or parsing error
    #[error("template error: {message}")]
    Template {
        /// Description of what failed
        message: String,
        /// The offending template string, when known
        template: Option<String>,
    },

    /// Dependency graph error (duplicate id, dangling dependency, cycle)
    #[error("dependency graph error: {message}")]
    Graph {
        /// Description of what's wrong with the graph
        message: String,
    },

    /// External data-source error
    #[error("datasource error for hub {hub}: {message}")]
    Datasource {
        /// Name of the hub whose source failed
        hub: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "status-manager")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    ///
    /// For simple validation errors without object context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            object: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with object context
    pub fn validation_for(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with object context and field path
    pub fn validation_for_field(
        object: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a template error quoting the offending template
    pub fn template(template: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Template {
            message: msg.into(),
            template: Some(template.into()),
        }
    }

    /// Create a graph error with the given message
    pub fn graph(msg: impl Into<String>) -> Self {
        Self::Graph {
            message: msg.into(),
        }
    }

    /// Create a datasource error for a hub
    pub fn datasource(hub: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Datasource {
            hub: hub.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, template, graph, and serialization errors are not
    /// retryable (they require a spec fix). Datasource and internal errors
    /// may recover on retry. Kubernetes errors depend on the status code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Retry on transient K8s errors (connection, 5xx, conflicts).
                // Don't retry on other 4xx errors (validation, not found, etc.)
                match source {
                    kube::Error::Api(ae) if ae.code == 409 => true,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) => false,
                    _ => true,
                }
            }
            Error::Validation { .. } => false,
            Error::Template { .. } => false,
            Error::Graph { .. } => false,
            Error::Datasource { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error Propagation in Reconciliation
    // ==========================================================================
    //
    // These tests demonstrate how errors flow through the system during
    // tenant materialization. Each error type represents a different failure
    // category with specific handling requirements.

    /// Story: CRD validation catches misconfigurations before any apply
    ///
    /// When a user creates a LoomForm with a duplicate resource id, the
    /// validation layer catches it immediately with a clear error message.
    #[test]
    fn story_validation_prevents_invalid_form() {
        let err = Error::validation("duplicate resource id: app-deployment");
        assert!(err.to_string().contains("validation error"));
        assert!(err.to_string().contains("app-deployment"));

        let err = Error::validation_for("web-form", "dependIds target does not exist: db");
        assert!(err.to_string().contains("web-form"));

        let err = Error::validation_for_field("web-form", "spec.deployments[0].id", "must not be empty");
        match &err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.deployments[0].id"));
            }
            _ => panic!("Expected Validation variant"),
        }

        // Validation errors must never be retried - the user has to fix the spec
        assert!(!err.is_retryable());
    }

    /// Story: template errors quote the offending template
    #[test]
    fn story_template_errors_quote_the_template() {
        let err = Error::template("{{ uid | nosuchfilter }}", "unknown filter");
        assert!(err.to_string().contains("unknown filter"));
        match &err {
            Error::Template { template, .. } => {
                assert_eq!(template.as_deref(), Some("{{ uid | nosuchfilter }}"));
            }
            _ => panic!("Expected Template variant"),
        }
        assert!(!err.is_retryable());
    }

    /// Story: datasource errors are transient and retried on the hub loop
    #[test]
    fn story_datasource_errors_are_retryable() {
        let err = Error::datasource("tenants-hub", "connection refused");
        assert!(err.to_string().contains("tenants-hub"));
        assert!(err.is_retryable());
    }

    /// Story: graph errors (cycles, dangling ids) are terminal for the spec
    #[test]
    fn story_graph_errors_are_not_retryable() {
        let err = Error::graph("circular dependency detected: a -> b");
        assert!(err.to_string().contains("circular dependency"));
        assert!(!err.is_retryable());
    }

    /// Story: errors carry context for controller error policies
    #[test]
    fn story_internal_errors_carry_context() {
        let err = Error::internal_with_context("status-manager", "worker channel closed");
        assert_eq!(err.context(), Some("status-manager"));
        assert!(err.to_string().contains("[status-manager]"));
        assert!(err.is_retryable());

        let err = Error::internal("unexpected state");
        assert_eq!(err.context(), Some(super::UNKNOWN_CONTEXT));
    }

    /// Story: serialization errors surface manifest issues
    #[test]
    fn story_serialization_errors() {
        let err = Error::serialization_for_kind("Deployment", "missing field 'spec'");
        match &err {
            Error::Serialization { kind, .. } => {
                assert_eq!(kind.as_deref(), Some("Deployment"));
            }
            _ => panic!("Expected Serialization variant"),
        }
        assert!(!err.is_retryable());
    }
}
