use crate::password::generate_password;
use crate::state::ProvisioningState;
use anyhow::Context;
use async_trait::async_trait;
use hasura_client::{ConnectionParameters, MetadataClient, ALL_PERMISSIONS};
use indexer_common::consts::{LOGS_TABLE_NAME, METADATA_TABLE_NAME};
use indexer_common::prelude::{retry_with_backoff, RetryConfig};
use indexer_common::{IndexerConfig, IndexerStatus, LogEntry};
use indexer_storage_postgres::system_tables::{logs_table_ddl, metadata_table_ddl};
use indexer_storage_postgres::{
    AdminDatabase, IndexerMeta, IndexerMetaFactory, IndexerMetaStore, PgExecutor,
    TenantConnection, TenantConnector,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Host and port tenants connect through instead of the ones recorded in
/// the datasource.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PgBouncerOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Opens executors on tenant databases.
pub trait ExecutorFactory: Send + Sync {
    fn open(&self, url: &str) -> Arc<dyn PgExecutor>;
}

/// One lazily established connection per opened executor.
pub struct TenantConnectionFactory;

impl ExecutorFactory for TenantConnectionFactory {
    fn open(&self, url: &str) -> Arc<dyn PgExecutor> {
        Arc::new(TenantConnection::new(url))
    }
}

/// Creates, reconciles and removes the resources backing an indexer: the
/// account database and role, the indexer schema with its system tables,
/// the user tables, and their GraphQL tracking and permissions.
pub struct Provisioner {
    metadata: Arc<dyn MetadataClient>,
    admin: Arc<dyn AdminDatabase>,
    executors: Arc<dyn ExecutorFactory>,
    pg_bouncer: PgBouncerOverrides,
    retry: RetryConfig,
    connection_parameters: Mutex<HashMap<String, ConnectionParameters>>,
}

impl Provisioner {
    pub fn new(metadata: Arc<dyn MetadataClient>, admin: Arc<dyn AdminDatabase>) -> Self {
        Provisioner {
            metadata,
            admin,
            executors: Arc::new(TenantConnectionFactory),
            pg_bouncer: PgBouncerOverrides::default(),
            retry: RetryConfig::default(),
            connection_parameters: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_pg_bouncer(mut self, pg_bouncer: PgBouncerOverrides) -> Self {
        self.pg_bouncer = pg_bouncer;
        self
    }

    pub fn with_executor_factory(mut self, executors: Arc<dyn ExecutorFactory>) -> Self {
        self.executors = executors;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub async fn is_provisioned(&self, config: &IndexerConfig) -> anyhow::Result<bool> {
        let state = ProvisioningState::load(self.metadata.as_ref(), config)
            .await
            .context("Failed to check provisioning state")?;
        Ok(state.does_source_exist() && state.does_schema_exist())
    }

    pub async fn provision_user_api(&self, config: &IndexerConfig) -> anyhow::Result<()> {
        log::info!("Provisioning resources for {}", config);
        let mut state = ProvisioningState::load(self.metadata.as_ref(), config)
            .await
            .context("Failed to load provisioning state")?;
        self.provision_system_resources(config, &mut state).await?;
        if let Err(err) = self.provision_user_resources(config, &mut state).await {
            self.mirror_failure(config, &err).await;
            return Err(err);
        }
        log::info!("Provisioned resources for {}", config);
        Ok(())
    }

    async fn provision_system_resources(
        &self,
        config: &IndexerConfig,
        state: &mut ProvisioningState,
    ) -> anyhow::Result<()> {
        let database = config.database_name();
        let schema = config.schema_name();
        let user = config.user_name();
        let mut password = None;

        if !state.does_source_exist() {
            let generated = generate_password();
            self.admin
                .create_user_db(&user, &generated, &database)
                .await
                .context("Failed to create user db")?;
            self.metadata
                .add_datasource(&user, &generated, &database)
                .await
                .context("Failed to add datasource")?;
            password = Some(generated);
        }

        if !state.does_schema_exist() {
            self.metadata
                .create_schema(&database, &schema)
                .await
                .context("Failed to create schema")?;
        }

        let created = state.created_tables();
        let metadata_table_missing = !created.iter().any(|t| t == METADATA_TABLE_NAME);
        let logs_table_missing = !created.iter().any(|t| t == LOGS_TABLE_NAME);

        if metadata_table_missing {
            self.metadata
                .execute_sql_on_schema(&database, &schema, &metadata_table_ddl())
                .await
                .context("Failed to create metadata table")?;
        }
        self.meta_store(config)
            .await?
            .set_status(IndexerStatus::Provisioning)
            .await
            .context("Failed to set provisioning status")?;

        if logs_table_missing {
            self.metadata
                .execute_sql_on_schema(&database, &schema, &logs_table_ddl(&schema))
                .await
                .context("Failed to create logs table")?;
            self.admin
                .grant_cron_access(&user)
                .await
                .context("Failed to grant cron access")?;
            let password = match password {
                Some(password) => password,
                None => self.raw_connection_parameters(config).await?.password,
            };
            self.admin
                .schedule_log_partition_jobs(
                    &user,
                    &password,
                    &database,
                    &schema,
                    config.log_partition_job_names(),
                )
                .await
                .context("Failed to schedule log partition jobs")?;
        }

        if metadata_table_missing || logs_table_missing {
            state
                .reload(self.metadata.as_ref())
                .await
                .context("Failed to reload provisioning state")?;
        }

        let untracked = state.untracked_system_tables();
        if !untracked.is_empty() {
            self.metadata
                .track_tables(&database, &schema, &untracked)
                .await
                .context("Failed to track system tables")?;
        }

        let without_permissions = state.system_tables_without_permissions();
        if !without_permissions.is_empty() {
            self.add_permissions(config, &without_permissions)
                .await
                .context("Failed to add permissions to system tables")?;
        }
        Ok(())
    }

    async fn provision_user_resources(
        &self,
        config: &IndexerConfig,
        state: &mut ProvisioningState,
    ) -> anyhow::Result<()> {
        let database = config.database_name();
        let schema = config.schema_name();

        if state.user_tables().is_empty() {
            self.metadata
                .execute_sql_on_schema(&database, &schema, &config.schema)
                .await
                .context("Failed to run user script")?;
            state
                .reload(self.metadata.as_ref())
                .await
                .context("Failed to reload provisioning state")?;
        }

        let untracked = state.untracked_user_tables();
        if !untracked.is_empty() {
            self.metadata
                .track_tables(&database, &schema, &untracked)
                .await
                .context("Failed to track user tables")?;
            retry_with_backoff(self.retry, "track foreign key relationships", || {
                self.metadata.track_foreign_key_relationships(&database, &schema)
            })
            .await
            .context("Failed to track foreign key relationships")?;
        }

        let without_permissions = state.user_tables_without_permissions();
        if !without_permissions.is_empty() {
            self.add_permissions(config, &without_permissions)
                .await
                .context("Failed to add permissions to user tables")?;
        }
        Ok(())
    }

    async fn add_permissions(&self, config: &IndexerConfig, tables: &[String]) -> anyhow::Result<()> {
        let database = config.database_name();
        let schema = config.schema_name();
        let role = config.hasura_role_name();
        retry_with_backoff(self.retry, "add permissions", || {
            self.metadata
                .add_permissions_to_tables(&database, &schema, tables, &role, &ALL_PERMISSIONS)
        })
        .await?;
        Ok(())
    }

    /// Best effort: the indexer's own log table may not exist yet.
    async fn mirror_failure(&self, config: &IndexerConfig, err: &anyhow::Error) {
        let entry = LogEntry::system_error(format!("Provisioning failed: {:#}", err), None);
        let result = match self.meta_store(config).await {
            Ok(meta) => meta.write_logs(vec![entry]).await.map_err(anyhow::Error::from),
            Err(err) => Err(err),
        };
        if let Err(log_err) = result {
            log::error!(
                "Failed to record provisioning failure of {} in its logs: {:#}",
                config,
                log_err
            );
        }
    }

    pub async fn deprovision(&self, config: &IndexerConfig) -> anyhow::Result<()> {
        let database = config.database_name();
        let schema = config.schema_name();
        let user = config.user_name();
        log::info!("Deprovisioning resources for {}", config);

        self.metadata
            .drop_schema(&database, &schema)
            .await
            .context("Failed to drop schema")?;
        let (create_job, delete_job) = config.log_partition_job_names();
        self.admin
            .unschedule_jobs(vec![create_job, delete_job])
            .await
            .context("Failed to unschedule log partition jobs")?;

        let remaining = self
            .metadata
            .get_schemas_owned_by(&database, &user)
            .await
            .context("Failed to list remaining schemas")?;
        if remaining.is_empty() {
            log::info!("No indexer schema left in {}, dropping it", database);
            self.metadata
                .drop_datasource(&database)
                .await
                .context("Failed to drop datasource")?;
            self.admin
                .drop_database(&database)
                .await
                .context("Failed to drop database")?;
            self.admin
                .revoke_cron_access(&user)
                .await
                .context("Failed to revoke cron access")?;
            self.admin.drop_role(&user).await.context("Failed to drop role")?;
            self.forget_connection_parameters(&database);
        }
        Ok(())
    }

    async fn raw_connection_parameters(&self, config: &IndexerConfig) -> anyhow::Result<ConnectionParameters> {
        let database = config.database_name();
        if let Some(cached) = self.cached_connection_parameters(&database) {
            return Ok(cached);
        }
        let parameters = self
            .metadata
            .get_db_connection_parameters(&database)
            .await
            .context("Failed to get connection parameters")?;
        if let Ok(mut cache) = self.connection_parameters.lock() {
            cache.insert(database, parameters.clone());
        }
        Ok(parameters)
    }

    fn cached_connection_parameters(&self, database: &str) -> Option<ConnectionParameters> {
        self.connection_parameters
            .lock()
            .ok()
            .and_then(|cache| cache.get(database).cloned())
    }

    fn forget_connection_parameters(&self, database: &str) {
        if let Ok(mut cache) = self.connection_parameters.lock() {
            cache.remove(database);
        }
    }

    /// Credentials of the tenant database, pointed at pgBouncer when it is
    /// configured.
    pub async fn get_postgres_connection_parameters(
        &self,
        config: &IndexerConfig,
    ) -> anyhow::Result<ConnectionParameters> {
        let mut parameters = self.raw_connection_parameters(config).await?;
        if let Some(host) = &self.pg_bouncer.host {
            parameters.host = host.clone();
        }
        if let Some(port) = self.pg_bouncer.port {
            parameters.port = port;
        }
        Ok(parameters)
    }

    async fn meta_store(&self, config: &IndexerConfig) -> anyhow::Result<Arc<dyn IndexerMetaStore>> {
        let executor = self.connect(config).await?;
        Ok(Arc::new(IndexerMeta::new(config.schema_name(), executor)))
    }
}

#[async_trait]
impl TenantConnector for Provisioner {
    async fn connect(&self, config: &IndexerConfig) -> anyhow::Result<Arc<dyn PgExecutor>> {
        let parameters = self.get_postgres_connection_parameters(config).await?;
        Ok(self.executors.open(&parameters.to_url()))
    }
}

#[async_trait]
impl IndexerMetaFactory for Provisioner {
    async fn create(&self, config: &IndexerConfig) -> anyhow::Result<Arc<dyn IndexerMetaStore>> {
        self.meta_store(config).await
    }
}
