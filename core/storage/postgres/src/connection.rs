use crate::error::StoreError;
use crate::PgPool;
use diesel::connection::SimpleConnection;
use diesel::sql_types::Jsonb;
use diesel::{Connection, PgConnection, RunQueryDsl};
use indexer_common::prelude::anyhow;
use indexer_common::IndexerConfig;
use serde_json::Value;
use std::sync::{Arc, Mutex};

#[derive(Debug, QueryableByName)]
struct JsonRow {
    #[sql_type = "Jsonb"]
    data: Value,
}

/// Executes SQL on behalf of one tenant. Statements producing rows must
/// return them as a single `jsonb` column named `data`; the only bind
/// parameter, if any, is `$1` of type `jsonb`.
pub trait PgExecutor: Send + Sync {
    fn query(&self, sql: &str, param: &Value) -> Result<Vec<Value>, StoreError>;
    fn execute(&self, sql: &str, param: Option<&Value>) -> Result<usize, StoreError>;
}

/// Hands out connections to the database of an indexer.
#[async_trait::async_trait]
pub trait TenantConnector: Send + Sync {
    async fn connect(&self, config: &IndexerConfig) -> anyhow::Result<Arc<dyn PgExecutor>>;
}

fn query_on(conn: &PgConnection, sql: &str, param: &Value) -> Result<Vec<Value>, StoreError> {
    let rows = diesel::sql_query(sql)
        .bind::<Jsonb, _>(param)
        .load::<JsonRow>(conn)?;
    Ok(rows.into_iter().map(|row| row.data).collect())
}

fn execute_on(conn: &PgConnection, sql: &str, param: Option<&Value>) -> Result<usize, StoreError> {
    match param {
        Some(param) => Ok(diesel::sql_query(sql).bind::<Jsonb, _>(param).execute(conn)?),
        None => {
            conn.batch_execute(sql)?;
            Ok(0)
        }
    }
}

/// Connection to a tenant database. It is established on first use and
/// closed when the value is dropped, so one value should live no longer
/// than the operation it serves.
pub struct TenantConnection {
    url: String,
    conn: Mutex<Option<PgConnection>>,
}

impl TenantConnection {
    pub fn new(url: impl Into<String>) -> Self {
        TenantConnection {
            url: url.into(),
            conn: Mutex::new(None),
        }
    }

    fn with_connection<T>(
        &self,
        f: impl FnOnce(&PgConnection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StoreError::Task("tenant connection lock poisoned".to_string()))?;
        if guard.is_none() {
            *guard = Some(PgConnection::establish(&self.url)?);
        }
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(StoreError::Task("tenant connection unavailable".to_string())),
        }
    }
}

impl PgExecutor for TenantConnection {
    fn query(&self, sql: &str, param: &Value) -> Result<Vec<Value>, StoreError> {
        self.with_connection(|conn| query_on(conn, sql, param))
    }

    fn execute(&self, sql: &str, param: Option<&Value>) -> Result<usize, StoreError> {
        self.with_connection(|conn| execute_on(conn, sql, param))
    }
}

impl PgExecutor for PgPool {
    fn query(&self, sql: &str, param: &Value) -> Result<Vec<Value>, StoreError> {
        let conn = self.get()?;
        query_on(&conn, sql, param)
    }

    fn execute(&self, sql: &str, param: Option<&Value>) -> Result<usize, StoreError> {
        let conn = self.get()?;
        execute_on(&conn, sql, param)
    }
}
