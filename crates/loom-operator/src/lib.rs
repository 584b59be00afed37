//! Loom operator library
//!
//! The reconciliation core behind the `loom-operator` binary:
//!
//! - [`fieldpath`] - path language + in-place subtree removal
//! - [`template`] - per-tenant manifest rendering
//! - [`graph`] - dependency ordering and cycle detection
//! - [`datasource`] - tenant row source adapters
//! - [`readiness`] - kind-dispatched readiness rules
//! - [`apply`] - three-way merge apply with ownership tracking
//! - [`status`] - event-driven batched status updates
//! - [`controller`] - the hub, form, and node reconcile loops

pub mod apply;
pub mod controller;
pub mod datasource;
pub mod fieldpath;
pub mod graph;
pub mod readiness;
pub mod status;
pub mod template;

pub use loom_common::Error;
