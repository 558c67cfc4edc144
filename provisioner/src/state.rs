use hasura_client::{HasuraError, Metadata, MetadataClient, ALL_PERMISSIONS};
use indexer_common::consts::is_system_table;
use indexer_common::IndexerConfig;

/// Snapshot of the resources one indexer owns, as seen by the metadata
/// layer. Reading it never changes anything.
#[derive(Clone, Debug)]
pub struct ProvisioningState {
    database_name: String,
    schema_name: String,
    role_name: String,
    metadata: Metadata,
    source_exists: bool,
    schema_exists: bool,
    created_tables: Vec<String>,
}

impl ProvisioningState {
    pub async fn load(
        client: &dyn MetadataClient,
        config: &IndexerConfig,
    ) -> Result<Self, HasuraError> {
        let mut state = ProvisioningState {
            database_name: config.database_name(),
            schema_name: config.schema_name(),
            role_name: config.hasura_role_name(),
            metadata: Metadata::default(),
            source_exists: false,
            schema_exists: false,
            created_tables: Vec::new(),
        };
        state.reload(client).await?;
        Ok(state)
    }

    pub async fn reload(&mut self, client: &dyn MetadataClient) -> Result<(), HasuraError> {
        self.metadata = client.export_metadata().await?;
        self.source_exists = self.metadata.source(&self.database_name).is_some();
        self.schema_exists = self.source_exists
            && client
                .does_schema_exist(&self.database_name, &self.schema_name)
                .await?;
        self.created_tables = if self.schema_exists {
            client
                .get_table_names(&self.database_name, &self.schema_name)
                .await?
        } else {
            Vec::new()
        };
        Ok(())
    }

    pub fn does_source_exist(&self) -> bool {
        self.source_exists
    }

    pub fn does_schema_exist(&self) -> bool {
        self.schema_exists
    }

    pub fn created_tables(&self) -> &[String] {
        &self.created_tables
    }

    pub fn tracked_tables(&self) -> Vec<String> {
        self.metadata
            .source(&self.database_name)
            .map(|source| {
                source
                    .tables_in_schema(&self.schema_name)
                    .map(|table| table.table.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn tables_with_permissions(&self) -> Vec<String> {
        self.metadata
            .source(&self.database_name)
            .map(|source| {
                source
                    .tables_in_schema(&self.schema_name)
                    .filter(|table| table.has_permissions(&self.role_name, &ALL_PERMISSIONS))
                    .map(|table| table.table.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn untracked_tables(&self) -> Vec<String> {
        let tracked = self.tracked_tables();
        self.created_tables
            .iter()
            .filter(|table| !tracked.contains(table))
            .cloned()
            .collect()
    }

    pub fn tables_without_permissions(&self) -> Vec<String> {
        let permitted = self.tables_with_permissions();
        self.created_tables
            .iter()
            .filter(|table| !permitted.contains(table))
            .cloned()
            .collect()
    }

    pub fn system_tables(&self) -> Vec<String> {
        system(self.created_tables.clone())
    }

    pub fn user_tables(&self) -> Vec<String> {
        user(self.created_tables.clone())
    }

    pub fn untracked_system_tables(&self) -> Vec<String> {
        system(self.untracked_tables())
    }

    pub fn untracked_user_tables(&self) -> Vec<String> {
        user(self.untracked_tables())
    }

    pub fn system_tables_without_permissions(&self) -> Vec<String> {
        system(self.tables_without_permissions())
    }

    pub fn user_tables_without_permissions(&self) -> Vec<String> {
        user(self.tables_without_permissions())
    }
}

fn system(tables: Vec<String>) -> Vec<String> {
    tables.into_iter().filter(|t| is_system_table(t)).collect()
}

fn user(tables: Vec<String>) -> Vec<String> {
    tables.into_iter().filter(|t| !is_system_table(t)).collect()
}
