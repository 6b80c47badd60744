//! Postgres-backed property graph
//!
//! Nodes and edges live in two generic tables. Labels, keys and relationship
//! types are ordinary column values, so every value in a statement, including
//! identifiers, is a bound parameter. Each chunk runs in its own transaction.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::time::Duration;

use super::{cell_param, row_properties, Binding, GraphStore};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::stager::RowChunk;
use crate::template::QueryTemplate;

const CREATE_NODES: &str = r#"
    CREATE TABLE IF NOT EXISTS graph_nodes (
        label       TEXT        NOT NULL,
        key_name    TEXT        NOT NULL,
        key_value   TEXT        NOT NULL,
        properties  JSONB       NOT NULL DEFAULT '{}'::jsonb,
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (label, key_name, key_value)
    )
"#;

const CREATE_EDGES: &str = r#"
    CREATE TABLE IF NOT EXISTS graph_edges (
        rel_type    TEXT        NOT NULL,
        from_label  TEXT        NOT NULL,
        from_key    TEXT        NOT NULL,
        from_value  TEXT        NOT NULL,
        to_label    TEXT        NOT NULL,
        to_key      TEXT        NOT NULL,
        to_value    TEXT        NOT NULL,
        properties  JSONB       NOT NULL DEFAULT '{}'::jsonb,
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (rel_type, from_label, from_key, from_value, to_label, to_key, to_value)
    )
"#;

const UPSERT_NODE: &str = r#"
    INSERT INTO graph_nodes (label, key_name, key_value, properties)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (label, key_name, key_value)
    DO UPDATE SET properties = graph_nodes.properties || EXCLUDED.properties,
                  updated_at = NOW()
"#;

const UPSERT_EDGE: &str = r#"
    INSERT INTO graph_edges
        (rel_type, from_label, from_key, from_value, to_label, to_key, to_value, properties)
    SELECT $1::text, $2::text, $3::text, $4::text, $5::text, $6::text, $7::text, $8::jsonb
    WHERE EXISTS (
        SELECT 1 FROM graph_nodes WHERE label = $2 AND key_name = $3 AND key_value = $4
    ) AND EXISTS (
        SELECT 1 FROM graph_nodes WHERE label = $5 AND key_name = $6 AND key_value = $7
    )
    ON CONFLICT (rel_type, from_label, from_key, from_value, to_label, to_key, to_value)
    DO UPDATE SET properties = graph_edges.properties || EXCLUDED.properties,
                  updated_at = NOW()
"#;

/// Connect timeout for the store pool
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Graph store over a Postgres pool
#[derive(Debug, Clone)]
pub struct PgGraphStore {
    pool: PgPool,
}

impl PgGraphStore {
    /// Open a pool of at most `pool_size` connections and create the graph tables
    pub async fn connect(config: &StoreConfig, pool_size: u32) -> Result<Self, StoreError> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.database);

        let pool = PgPoolOptions::new()
            .max_connections(pool_size.max(1))
            .acquire_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connect {
                uri: config.uri(),
                message: e.to_string(),
            })?;

        tracing::info!(uri = %config.uri(), max_connections = pool_size, "Graph store pool created");

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_NODES).execute(&self.pool).await?;
        sqlx::query(CREATE_EDGES).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn node_count(&self) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM graph_nodes")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn edge_count(&self) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM graph_edges")
            .fetch_one(&self.pool)
            .await?)
    }
}

#[async_trait]
impl GraphStore for PgGraphStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn execute(&self, template: &QueryTemplate, chunk: &RowChunk) -> Result<u64, StoreError> {
        let binding = Binding::resolve(template.mutation(), chunk)?;
        let mut tx = self.pool.begin().await?;
        let mut affected = 0u64;

        for row in chunk.rows() {
            let result = match &binding {
                Binding::Node {
                    label,
                    key,
                    key_col,
                    props,
                } => {
                    let value = cell_param(row, *key_col).ok_or_else(|| {
                        StoreError::Rejected(format!("empty '{}' key in template {}", key, template.id()))
                    })?;
                    sqlx::query(UPSERT_NODE)
                        .bind(label)
                        .bind(key)
                        .bind(value)
                        .bind(Json(row_properties(row, props)))
                        .execute(&mut *tx)
                        .await?
                }
                Binding::Edge {
                    rel_type,
                    from,
                    to,
                    props,
                } => {
                    sqlx::query(UPSERT_EDGE)
                        .bind(rel_type)
                        .bind(&from.0)
                        .bind(&from.1)
                        .bind(cell_param(row, from.2))
                        .bind(&to.0)
                        .bind(&to.1)
                        .bind(cell_param(row, to.2))
                        .bind(Json(row_properties(row, props)))
                        .execute(&mut *tx)
                        .await?
                }
                Binding::Statement { text, params } => {
                    let mut query = sqlx::query(text);
                    for i in params {
                        query = query.bind(cell_param(row, *i));
                    }
                    query.execute(&mut *tx).await?
                }
            };
            affected += result.rows_affected();
        }

        tx.commit().await?;
        Ok(affected)
    }
}
