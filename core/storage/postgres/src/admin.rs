//! Operations that need administrative rights on the shared Postgres
//! cluster: per-account databases and roles, and pg_cron access.
use crate::connection::{PgExecutor, TenantConnection};
use crate::error::StoreError;
use crate::system_tables::{schedule_partition_jobs_sql, unschedule_job_sql};
use crate::PgPool;
use async_trait::async_trait;
use diesel::connection::SimpleConnection;
use diesel::dsl::sql;
use diesel::sql_types::Bool;
use diesel::RunQueryDsl;
use indexer_common::util::sql::{quote_ident, quote_literal};

#[async_trait]
pub trait AdminDatabase: Send + Sync {
    async fn create_user_db(
        &self,
        user_name: &str,
        password: &str,
        database_name: &str,
    ) -> Result<(), StoreError>;
    async fn drop_database(&self, database_name: &str) -> Result<(), StoreError>;
    async fn drop_role(&self, user_name: &str) -> Result<(), StoreError>;
    async fn grant_cron_access(&self, user_name: &str) -> Result<(), StoreError>;
    async fn revoke_cron_access(&self, user_name: &str) -> Result<(), StoreError>;
    /// Registers the daily partition jobs of `schema_name`. The jobs are
    /// owned by the tenant role, so they run with its rights.
    async fn schedule_log_partition_jobs(
        &self,
        user_name: &str,
        password: &str,
        database_name: &str,
        schema_name: &str,
        job_names: (String, String),
    ) -> Result<(), StoreError>;
    async fn unschedule_jobs(&self, job_names: Vec<String>) -> Result<(), StoreError>;
}

/// Safe to run again after a partial failure: an existing role gets the
/// new password, and the database is only created when `database_exists`
/// is false.
pub fn create_user_db_statements(
    user_name: &str,
    password: &str,
    database_name: &str,
    database_exists: bool,
) -> Vec<String> {
    let database = quote_ident(database_name);
    let user = quote_ident(user_name);
    let password = quote_literal(password);
    let mut statements = vec![format!(
        "DO $provision$ BEGIN\n\
         IF EXISTS (SELECT FROM pg_roles WHERE rolname = {name}) THEN\n\
         ALTER ROLE {user} WITH LOGIN PASSWORD {password};\n\
         ELSE\n\
         CREATE ROLE {user} WITH LOGIN PASSWORD {password};\n\
         END IF;\n\
         END $provision$;",
        name = quote_literal(user_name),
        user = user,
        password = password,
    )];
    if !database_exists {
        statements.push(format!("CREATE DATABASE {}", database));
    }
    statements.push(format!("GRANT ALL PRIVILEGES ON DATABASE {} TO {}", database, user));
    statements.push(format!("REVOKE CONNECT ON DATABASE {} FROM PUBLIC", database));
    statements
}

pub fn database_exists_sql(database_name: &str) -> String {
    format!(
        "EXISTS (SELECT FROM pg_database WHERE datname = {})",
        quote_literal(database_name)
    )
}

pub fn grant_cron_access_sql(user_name: &str) -> String {
    let user = quote_ident(user_name);
    format!(
        "GRANT USAGE ON SCHEMA cron TO {u};\nGRANT EXECUTE ON FUNCTION cron.schedule_in_database TO {u};",
        u = user
    )
}

pub fn revoke_cron_access_sql(user_name: &str) -> String {
    let user = quote_ident(user_name);
    format!(
        "REVOKE USAGE ON SCHEMA cron FROM {u} CASCADE;\nREVOKE EXECUTE ON FUNCTION cron.schedule_in_database FROM {u} CASCADE;",
        u = user
    )
}

#[derive(Clone)]
pub struct PgAdmin {
    /// Default database of the cluster.
    admin_pool: PgPool,
    /// Database pg_cron is installed in.
    cron_pool: PgPool,
    host: String,
    port: u16,
    cron_database: String,
}

impl PgAdmin {
    pub fn new(admin_pool: PgPool, cron_pool: PgPool, host: &str, port: u16, cron_database: &str) -> Self {
        PgAdmin {
            admin_pool,
            cron_pool,
            host: host.to_string(),
            port,
            cron_database: cron_database.to_string(),
        }
    }

    /// Runs each statement on its own: `CREATE DATABASE` and
    /// `DROP DATABASE` refuse to run inside a transaction block.
    async fn run_statements(pool: &PgPool, statements: Vec<String>) -> Result<(), StoreError> {
        let pool = pool.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = pool.get()?;
            for statement in &statements {
                conn.batch_execute(statement)?;
            }
            Ok(())
        })
        .await
        .map_err(|err| StoreError::Task(err.to_string()))?
    }

    async fn database_exists(&self, database_name: &str) -> Result<bool, StoreError> {
        let pool = self.admin_pool.clone();
        let condition = database_exists_sql(database_name);
        tokio::task::spawn_blocking(move || -> Result<bool, StoreError> {
            let conn = pool.get()?;
            Ok(diesel::select(sql::<Bool>(&condition)).get_result::<bool>(&*conn)?)
        })
        .await
        .map_err(|err| StoreError::Task(err.to_string()))?
    }
}

#[async_trait]
impl AdminDatabase for PgAdmin {
    async fn create_user_db(
        &self,
        user_name: &str,
        password: &str,
        database_name: &str,
    ) -> Result<(), StoreError> {
        let database_exists = self.database_exists(database_name).await?;
        if database_exists {
            log::info!("Reusing database {} for {}", database_name, user_name);
        } else {
            log::info!("Creating database {} owned by {}", database_name, user_name);
        }
        Self::run_statements(
            &self.admin_pool,
            create_user_db_statements(user_name, password, database_name, database_exists),
        )
        .await
    }

    async fn drop_database(&self, database_name: &str) -> Result<(), StoreError> {
        Self::run_statements(
            &self.admin_pool,
            vec![format!("DROP DATABASE IF EXISTS {} (FORCE)", quote_ident(database_name))],
        )
        .await
    }

    async fn drop_role(&self, user_name: &str) -> Result<(), StoreError> {
        Self::run_statements(
            &self.admin_pool,
            vec![format!("DROP ROLE IF EXISTS {}", quote_ident(user_name))],
        )
        .await
    }

    async fn grant_cron_access(&self, user_name: &str) -> Result<(), StoreError> {
        Self::run_statements(&self.cron_pool, vec![grant_cron_access_sql(user_name)]).await
    }

    async fn revoke_cron_access(&self, user_name: &str) -> Result<(), StoreError> {
        Self::run_statements(&self.cron_pool, vec![revoke_cron_access_sql(user_name)]).await
    }

    async fn schedule_log_partition_jobs(
        &self,
        user_name: &str,
        password: &str,
        database_name: &str,
        schema_name: &str,
        job_names: (String, String),
    ) -> Result<(), StoreError> {
        let url = format!(
            "postgres://{}:{}@{}:{}/{}",
            user_name, password, self.host, self.port, self.cron_database
        );
        let sql = schedule_partition_jobs_sql(&job_names.0, &job_names.1, schema_name, database_name);
        tokio::task::spawn_blocking(move || TenantConnection::new(url).execute(&sql, None))
            .await
            .map_err(|err| StoreError::Task(err.to_string()))?
            .map(|_| ())
    }

    async fn unschedule_jobs(&self, job_names: Vec<String>) -> Result<(), StoreError> {
        let statements = job_names.iter().map(|job| unschedule_job_sql(job)).collect();
        Self::run_statements(&self.cron_pool, statements).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_works_on_user_db_statements() {
        let statements = create_user_db_statements("morgs_near", "pa'ss", "morgs_near", false);
        assert_eq!(4, statements.len());
        assert!(statements[0].contains("WHERE rolname = 'morgs_near'"));
        assert!(statements[0].contains("ALTER ROLE \"morgs_near\" WITH LOGIN PASSWORD 'pa''ss';"));
        assert!(statements[0].contains("CREATE ROLE \"morgs_near\" WITH LOGIN PASSWORD 'pa''ss';"));
        assert_eq!(
            vec![
                "CREATE DATABASE \"morgs_near\"".to_string(),
                "GRANT ALL PRIVILEGES ON DATABASE \"morgs_near\" TO \"morgs_near\"".to_string(),
                "REVOKE CONNECT ON DATABASE \"morgs_near\" FROM PUBLIC".to_string(),
            ],
            statements[1..].to_vec()
        );
    }

    #[test]
    fn it_works_on_existing_user_db() {
        let statements = create_user_db_statements("morgs_near", "secret", "morgs_near", true);
        assert_eq!(3, statements.len());
        assert!(!statements.iter().any(|statement| statement.starts_with("CREATE DATABASE")));
        assert_eq!(
            "EXISTS (SELECT FROM pg_database WHERE datname = 'morgs_near')",
            database_exists_sql("morgs_near")
        );
    }

    #[test]
    fn it_works_on_cron_grants() {
        assert!(grant_cron_access_sql("morgs_near").contains("GRANT USAGE ON SCHEMA cron TO \"morgs_near\";"));
        assert!(revoke_cron_access_sql("morgs_near")
            .contains("REVOKE EXECUTE ON FUNCTION cron.schedule_in_database FROM \"morgs_near\" CASCADE;"));
    }
}
