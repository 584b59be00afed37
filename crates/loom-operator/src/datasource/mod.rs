//! Tenant row source adapters
//!
//! A datasource enumerates tenant rows: a required triple (uid, hostOrUrl,
//! activate) plus mapped extra columns. Adapters push activation filtering
//! to the server only opportunistically - correctness relies on the
//! client-side filter in [`filter_rows`].

mod mysql;

use std::collections::BTreeMap;

use async_trait::async_trait;
use loom_common::crd::ValueMappings;
use loom_common::Error;

pub use mysql::{MySqlAdapter, MySqlConnectConfig};

/// One tenant row from the source
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeRow {
    /// The tenant's primary key
    pub uid: String,
    /// The tenant's host or URL
    pub host_or_url: String,
    /// The raw activation flag value
    pub activate: String,
    /// Extra values keyed by variable name
    pub extra: BTreeMap<String, String>,
}

/// Configuration for querying tenant rows
#[derive(Clone, Debug, Default)]
pub struct QueryConfig {
    /// Table (or collection) name
    pub table: String,
    /// Required column mappings
    pub value_mappings: ValueMappings,
    /// Extra column mappings: variable name -> column name
    pub extra_mappings: BTreeMap<String, String>,
}

/// Interface every datasource adapter implements
#[async_trait]
pub trait Datasource: Send + Sync {
    /// Retrieve active tenant rows from the source.
    ///
    /// Implementations return rows already passed through [`filter_rows`].
    async fn query_nodes(&self, config: &QueryConfig) -> Result<Vec<NodeRow>, Error>;

    /// Close the underlying connections; idempotent
    async fn close(&self);
}

/// The fixed truthy set for the activation flag
pub fn is_active(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True" | "yes" | "YES" | "Yes")
}

/// Client-side row filter: drop rows that are not activated or have an
/// empty hostOrUrl.
pub fn filter_rows(rows: Vec<NodeRow>) -> Vec<NodeRow> {
    rows.into_iter()
        .filter(|row| !row.host_or_url.is_empty() && is_active(&row.activate))
        .collect()
}

/// Quote a column or table identifier defensively
pub(crate) fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Build the SELECT statement for a query config.
///
/// Returns the SQL plus the ordered list of extra variable names, matching
/// the column order of the statement: uid, hostOrUrl, activate, then the
/// extras sorted by variable name for stable queries. Every value is
/// selected as CHAR so heterogeneous column types arrive as strings.
pub(crate) fn build_query(config: &QueryConfig) -> (String, Vec<String>) {
    let mut select_exprs = vec![
        cast_expr(&config.value_mappings.uid),
        cast_expr(&config.value_mappings.host_or_url),
        cast_expr(&config.value_mappings.activate),
    ];

    let mut extra_vars: Vec<String> = config.extra_mappings.keys().cloned().collect();
    extra_vars.sort();
    for var in &extra_vars {
        select_exprs.push(cast_expr(&config.extra_mappings[var]));
    }

    let sql = format!(
        "SELECT {} FROM {}",
        select_exprs.join(", "),
        quote_ident(&config.table)
    );
    (sql, extra_vars)
}

fn cast_expr(column: &str) -> String {
    format!("CAST({} AS CHAR)", quote_ident(column))
}
