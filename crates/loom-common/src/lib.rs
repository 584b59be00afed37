//! Common types for Loom: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod leader_election;
pub mod metrics;
pub mod retry;
pub mod telemetry;

pub use error::Error;
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for all Loom CRDs
pub const API_GROUP: &str = "loom.dev";

/// Field manager identity used for server-side apply
pub const FIELD_MANAGER: &str = "loom-operator";

/// Label identifying the owning tenant node on managed resources
pub const LABEL_TENANT_NAME: &str = "loom.dev/tenant-name";

/// Label identifying the owning tenant node's namespace on managed resources
pub const LABEL_TENANT_NAMESPACE: &str = "loom.dev/tenant-namespace";

/// Label identifying the hub that produced a node
pub const LABEL_HUB: &str = "loom.dev/hub";

/// Label identifying the form a node was rendered from
pub const LABEL_FORM: &str = "loom.dev/form";

/// Label stamped on resources retained after their owner went away
pub const LABEL_ORPHANED: &str = "loom.dev/orphaned";

/// Value of the orphaned label
pub const ORPHANED_LABEL_VALUE: &str = "true";

/// Annotation carrying the RFC 3339 timestamp a resource was orphaned at
pub const ANNOTATION_ORPHANED_AT: &str = "loom.dev/orphaned-at";

/// Annotation carrying the free-text reason a resource was orphaned
pub const ANNOTATION_ORPHANED_REASON: &str = "loom.dev/orphaned-reason";

/// Annotation persisting a resource's deletion policy for orphan pruning
pub const ANNOTATION_DELETION_POLICY: &str = "loom.dev/deletion-policy";

/// Annotation persisting the ignore-fields path list on managed resources
pub const ANNOTATION_IGNORED_FIELDS: &str = "loom.dev/ignored-fields";

/// Annotation marking a resource created under `CreationPolicy=Once`
pub const ANNOTATION_CREATED_ONCE: &str = "loom.dev/created-once";

/// Annotation on a node carrying the row's hostOrUrl value
pub const ANNOTATION_HOST_OR_URL: &str = "loom.dev/host-or-url";

/// Annotation on a node carrying the row's activate value
pub const ANNOTATION_ACTIVATE: &str = "loom.dev/activate";

/// Annotation on a node carrying the row's extra values as a JSON object
pub const ANNOTATION_EXTRA_VALUES: &str = "loom.dev/extra-values";

/// Generic "true" annotation/label value
pub const VALUE_TRUE: &str = "true";
