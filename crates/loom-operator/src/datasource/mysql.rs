//! MySQL datasource adapter
//!
//! Wraps a bounded sqlx connection pool. Construction pings the server
//! with a 5-second timeout and fails fast; `close` is idempotent.

use std::time::Duration;

use async_trait::async_trait;
use loom_common::Error;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::Row as _;
use tracing::debug;

use super::{build_query, filter_rows, Datasource, NodeRow, QueryConfig};

const DEFAULT_MAX_OPEN_CONNS: u32 = 25;
const DEFAULT_MAX_IDLE_CONNS: u32 = 5;
const DEFAULT_CONN_MAX_LIFETIME: Duration = Duration::from_secs(300);
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection parameters for the MySQL adapter
#[derive(Clone, Debug, Default)]
pub struct MySqlConnectConfig {
    /// Server hostname or IP
    pub host: String,
    /// Server port
    pub port: u16,
    /// Username
    pub username: String,
    /// Password (may be empty)
    pub password: String,
    /// Database name
    pub database: String,
    /// Maximum open connections (default 25)
    pub max_open_conns: Option<u32>,
    /// Minimum idle connections kept warm (default 5)
    pub max_idle_conns: Option<u32>,
    /// Maximum connection lifetime (default 5 minutes)
    pub conn_max_lifetime: Option<Duration>,
}

/// MySQL implementation of [`Datasource`]
pub struct MySqlAdapter {
    pool: MySqlPool,
}

impl MySqlAdapter {
    /// Open a bounded pool and verify connectivity.
    ///
    /// Fails when the server cannot be reached within the ping timeout.
    pub async fn connect(config: &MySqlConnectConfig) -> Result<Self, Error> {
        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.username)
            .password(&config.password)
            .database(&config.database);

        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_open_conns.unwrap_or(DEFAULT_MAX_OPEN_CONNS))
            .min_connections(config.max_idle_conns.unwrap_or(DEFAULT_MAX_IDLE_CONNS))
            .max_lifetime(config.conn_max_lifetime.unwrap_or(DEFAULT_CONN_MAX_LIFETIME))
            .acquire_timeout(PING_TIMEOUT)
            .connect_lazy_with(options);

        // Construction must fail fast when the server is unreachable
        tokio::time::timeout(PING_TIMEOUT, sqlx::query("SELECT 1").execute(&pool))
            .await
            .map_err(|_| {
                Error::internal_with_context(
                    "mysql",
                    format!("ping timed out after {}s", PING_TIMEOUT.as_secs()),
                )
            })?
            .map_err(|e| Error::internal_with_context("mysql", format!("ping failed: {e}")))?;

        debug!(
            host = %config.host,
            database = %config.database,
            "MySQL datasource connected"
        );

        Ok(Self { pool })
    }
}

#[async_trait]
impl Datasource for MySqlAdapter {
    async fn query_nodes(&self, config: &QueryConfig) -> Result<Vec<NodeRow>, Error> {
        let (sql, extra_vars) = build_query(config);
        debug!(sql = %sql, "querying tenant rows");

        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::internal_with_context("mysql", format!("query failed: {e}")))?;

        let mut nodes = Vec::with_capacity(rows.len());
        for row in rows {
            // Column order matches build_query: uid, hostOrUrl, activate, extras.
            // NULL values become empty strings.
            let get = |idx: usize| -> Result<String, Error> {
                row.try_get::<Option<String>, _>(idx)
                    .map(Option::unwrap_or_default)
                    .map_err(|e| {
                        Error::internal_with_context("mysql", format!("scan failed: {e}"))
                    })
            };

            let mut node = NodeRow {
                uid: get(0)?,
                host_or_url: get(1)?,
                activate: get(2)?,
                ..Default::default()
            };
            for (offset, var) in extra_vars.iter().enumerate() {
                node.extra.insert(var.clone(), get(3 + offset)?);
            }
            nodes.push(node);
        }

        Ok(filter_rows(nodes))
    }

    async fn close(&self) {
        // Pool close is idempotent
        self.pool.close().await;
    }
}
