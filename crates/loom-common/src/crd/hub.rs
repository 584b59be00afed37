//! LoomHub Custom Resource Definition
//!
//! A LoomHub names an external row source that enumerates tenants. The hub
//! controller polls the source on `syncInterval` and materializes one
//! LoomNode per active row for every form referencing the hub.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// Supported data-source kinds
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// A MySQL table
    #[default]
    MySql,
}

/// Reference to a key within a Kubernetes Secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    /// Name of the Secret
    pub name: String,
    /// Key within the Secret
    pub key: String,
}

/// Connection-pool tuning for the MySQL adapter
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MySqlPoolSpec {
    /// Maximum open connections (default: 25)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_open_conns: Option<u32>,

    /// Minimum idle connections kept warm (default: 5)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_conns: Option<u32>,

    /// Maximum connection lifetime as a duration string (default: "5m")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn_max_lifetime: Option<String>,
}

/// MySQL connection parameters
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MySqlSourceSpec {
    /// Server hostname or IP
    pub host: String,

    /// Server port (default: 3306)
    #[serde(default = "default_mysql_port")]
    pub port: u16,

    /// Username
    pub username: String,

    /// Secret reference holding the password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_ref: Option<SecretKeyRef>,

    /// Database name
    pub database: String,

    /// Table containing tenant rows
    pub table: String,

    /// Optional pool tuning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<MySqlPoolSpec>,
}

fn default_mysql_port() -> u16 {
    3306
}

/// Data-source configuration for a hub
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceSpec {
    /// Source kind
    #[serde(rename = "type")]
    pub type_: SourceType,

    /// How often to poll the source (duration string, default: "30s")
    #[serde(default = "default_sync_interval")]
    pub sync_interval: String,

    /// MySQL-specific configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mysql: Option<MySqlSourceSpec>,
}

fn default_sync_interval() -> String {
    "30s".to_string()
}

/// Required column mappings for the row source
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValueMappings {
    /// Column holding the tenant's unique identifier
    pub uid: String,

    /// Column holding the tenant's host or URL
    pub host_or_url: String,

    /// Column holding the activation flag
    pub activate: String,
}

/// Specification for a LoomHub
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "loom.dev",
    version = "v1alpha1",
    kind = "LoomHub",
    plural = "loomhubs",
    shortname = "lh",
    status = "LoomHubStatus",
    namespaced,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.source.type"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".status.desired"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoomHubSpec {
    /// External data source configuration
    pub source: DataSourceSpec,

    /// Required column to variable mappings
    pub value_mappings: ValueMappings,

    /// Additional column mappings; keys become template variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_value_mappings: BTreeMap<String, String>,
}

/// Status for a LoomHub
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoomHubStatus {
    /// The generation of the spec that was last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Number of desired nodes (active rows x referencing forms)
    #[serde(default)]
    pub desired: i32,

    /// Number of ready nodes
    #[serde(default)]
    pub ready: i32,

    /// Number of failed nodes
    #[serde(default)]
    pub failed: i32,

    /// Conditions representing the hub's sync state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_spec_defaults() {
        let json = r#"{
            "source": {
                "type": "mysql",
                "mysql": {
                    "host": "db.internal",
                    "username": "loom",
                    "database": "tenants",
                    "table": "accounts"
                }
            },
            "valueMappings": {
                "uid": "account_id",
                "hostOrUrl": "domain",
                "activate": "is_active"
            }
        }"#;

        let spec: LoomHubSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.source.type_, SourceType::MySql);
        assert_eq!(spec.source.sync_interval, "30s");
        let mysql = spec.source.mysql.unwrap();
        assert_eq!(mysql.port, 3306);
        assert!(mysql.password_ref.is_none());
        assert_eq!(spec.value_mappings.uid, "account_id");
        assert!(spec.extra_value_mappings.is_empty());
    }

    #[test]
    fn test_extra_mappings_round_trip() {
        let mut extra = BTreeMap::new();
        extra.insert("plan".to_string(), "plan_column".to_string());
        let spec = LoomHubSpec {
            source: DataSourceSpec {
                type_: SourceType::MySql,
                sync_interval: "1m".to_string(),
                mysql: None,
            },
            value_mappings: ValueMappings {
                uid: "id".to_string(),
                host_or_url: "url".to_string(),
                activate: "active".to_string(),
            },
            extra_value_mappings: extra,
        };

        let round: LoomHubSpec =
            serde_json::from_str(&serde_json::to_string(&spec).unwrap()).unwrap();
        assert_eq!(round, spec);
    }
}
