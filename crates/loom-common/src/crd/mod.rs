//! Custom Resource Definitions for Loom
//!
//! Three kinds drive the materializer:
//! - [`LoomHub`] - a data-source descriptor enumerating tenants
//! - [`LoomForm`] - a reusable bundle of resource templates
//! - [`LoomNode`] - one per-tenant materialization object

mod form;
mod hub;
mod node;
mod types;

pub use form::{LoomForm, LoomFormSpec, LoomFormStatus};
pub use hub::{
    DataSourceSpec, LoomHub, LoomHubSpec, LoomHubStatus, MySqlPoolSpec, MySqlSourceSpec,
    SecretKeyRef, SourceType, ValueMappings,
};
pub use node::{LoomNode, LoomNodeSpec, LoomNodeStatus};
pub use types::{
    Condition, ConditionStatus, ConflictPolicy, CreationPolicy, DeletionPolicy, PatchStrategy,
    ResourceGroups, TResource, CONDITION_CONFLICTED, CONDITION_DEGRADED, CONDITION_PROGRESSING,
    CONDITION_READY,
};
