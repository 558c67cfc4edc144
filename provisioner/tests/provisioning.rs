mod common;

use common::mocks::{MockAdminDatabase, MockMetadataClient, RecordingExecutors};
use indexer_common::prelude::RetryConfig;
use indexer_common::IndexerConfig;
use indexer_provisioner::{PgBouncerOverrides, Provisioner, ProvisioningState};
use std::sync::Arc;
use std::time::Duration;

const SCHEMA: &str = r#"
CREATE TABLE posts (id SERIAL PRIMARY KEY, height NUMERIC NOT NULL);
CREATE TABLE comments (id SERIAL PRIMARY KEY, post_id INT NOT NULL REFERENCES posts (id));
"#;

struct Harness {
    metadata: MockMetadataClient,
    admin: MockAdminDatabase,
    executors: RecordingExecutors,
    provisioner: Provisioner,
}

fn harness() -> Harness {
    let metadata = MockMetadataClient::default();
    let admin = MockAdminDatabase::default();
    let executors = RecordingExecutors::default();
    let provisioner = Provisioner::new(Arc::new(metadata.clone()), Arc::new(admin.clone()))
        .with_executor_factory(Arc::new(executors.clone()))
        .with_retry(RetryConfig::new(3, Duration::from_millis(1)));
    Harness {
        metadata,
        admin,
        executors,
        provisioner,
    }
}

fn config(function_name: &str) -> IndexerConfig {
    IndexerConfig::new("morgs.near", function_name, "", SCHEMA)
}

#[tokio::test]
async fn provisions_every_resource_once() {
    let h = harness();
    let config = config("social_feed");
    assert!(!h.provisioner.is_provisioned(&config).await.unwrap());

    h.provisioner.provision_user_api(&config).await.unwrap();
    assert!(h.provisioner.is_provisioned(&config).await.unwrap());

    assert_eq!(
        vec![
            "create_user_db morgs_near morgs_near".to_string(),
            "grant_cron_access morgs_near".to_string(),
            "schedule morgs_near_social_feed_sys_logs_create_partition morgs_near_social_feed_sys_logs_delete_partition"
                .to_string(),
        ],
        h.admin.calls()
    );
    let mutations = h.metadata.mutations();
    assert_eq!("add_datasource morgs_near", mutations[0]);
    assert_eq!("create_schema morgs_near.morgs_near_social_feed", mutations[1]);
    assert!(mutations.contains(&"track_tables sys_logs,sys_metadata".to_string()));
    assert!(mutations.contains(&"track_tables comments,posts".to_string()));
    assert!(mutations.contains(&"create_relationships morgs_near_social_feed".to_string()));
    assert!(mutations.contains(&"add_permissions comments,posts".to_string()));

    let statements = h.executors.statements.lock().unwrap().clone();
    assert_eq!(1, statements.len());
    assert!(statements[0].0.contains("sys_metadata"));
    assert_eq!(
        Some(serde_json::json!({ "attribute": "STATUS", "value": "PROVISIONING" })),
        statements[0].1
    );
}

#[tokio::test]
async fn provisioning_twice_changes_nothing_the_second_time() {
    let h = harness();
    let config = config("social_feed");
    h.provisioner.provision_user_api(&config).await.unwrap();
    let mutations = h.metadata.mutations().len();
    let admin_calls = h.admin.calls().len();

    h.provisioner.provision_user_api(&config).await.unwrap();

    assert_eq!(mutations, h.metadata.mutations().len());
    assert_eq!(admin_calls, h.admin.calls().len());
}

#[tokio::test]
async fn reprovisioning_marks_the_indexer_provisioning_again() {
    let h = harness();
    let config = config("social_feed");
    h.provisioner.provision_user_api(&config).await.unwrap();
    h.provisioner.provision_user_api(&config).await.unwrap();

    let statements = h.executors.statements.lock().unwrap().clone();
    assert_eq!(2, statements.len());
    for (sql, param) in &statements {
        assert!(sql.contains("sys_metadata"));
        assert_eq!(
            &Some(serde_json::json!({ "attribute": "STATUS", "value": "PROVISIONING" })),
            param
        );
    }
}

#[tokio::test]
async fn failed_datasource_registration_is_resumed() {
    let h = harness();
    h.metadata.cluster.lock().unwrap().failing_datasource_calls = 1;
    let config = config("social_feed");

    let err = h.provisioner.provision_user_api(&config).await.unwrap_err();
    assert!(format!("{:#}", err).starts_with("Failed to add datasource"));
    assert!(!h.provisioner.is_provisioned(&config).await.unwrap());

    h.provisioner.provision_user_api(&config).await.unwrap();
    assert!(h.provisioner.is_provisioned(&config).await.unwrap());

    let created = h
        .admin
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("create_user_db"))
        .count();
    assert_eq!(2, created);
    assert_eq!(1, h.admin.databases.lock().unwrap().len());
    let registered = h.metadata.cluster.lock().unwrap().sources.get("morgs_near").cloned();
    assert_eq!(h.admin.password_of("morgs_near"), registered);
}

#[tokio::test]
async fn sibling_indexer_reuses_account_database() {
    let h = harness();
    h.provisioner
        .provision_user_api(&config("first"))
        .await
        .unwrap();
    h.provisioner
        .provision_user_api(&config("second"))
        .await
        .unwrap();

    let created = h
        .admin
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("create_user_db"))
        .count();
    assert_eq!(1, created);
    let schedules = h
        .admin
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("schedule"))
        .count();
    assert_eq!(2, schedules);
}

#[tokio::test]
async fn permission_grants_are_retried() {
    let h = harness();
    h.metadata.cluster.lock().unwrap().failing_permission_calls = 2;
    let config = config("social_feed");

    h.provisioner.provision_user_api(&config).await.unwrap();

    let state = ProvisioningState::load(&h.metadata, &config).await.unwrap();
    assert!(state.tables_without_permissions().is_empty());
    assert!(state.untracked_tables().is_empty());
}

#[tokio::test]
async fn user_script_failure_is_reported_to_tenant_logs() {
    let h = harness();
    h.metadata.cluster.lock().unwrap().failing_user_scripts = true;
    let config = config("social_feed");

    let err = h.provisioner.provision_user_api(&config).await.unwrap_err();
    assert!(format!("{:#}", err).starts_with("Failed to run user script"));

    let statements = h.executors.statements.lock().unwrap().clone();
    let (sql, param) = statements.last().unwrap();
    assert!(sql.contains("sys_logs"));
    let rows = param.as_ref().unwrap().as_array().unwrap().clone();
    assert_eq!(serde_json::json!("ERROR"), rows[0]["level"]);
    assert!(rows[0]["message"]
        .as_str()
        .unwrap()
        .contains("Failed to run user script"));
}

#[tokio::test]
async fn deprovision_keeps_shared_database_until_last_schema_is_gone() {
    let h = harness();
    let first = config("first");
    let second = config("second");
    h.provisioner.provision_user_api(&first).await.unwrap();
    h.provisioner.provision_user_api(&second).await.unwrap();

    h.provisioner.deprovision(&first).await.unwrap();
    assert!(!h.admin.calls().iter().any(|call| call.starts_with("drop_database")));
    assert!(!h
        .metadata
        .mutations()
        .iter()
        .any(|call| call.starts_with("drop_datasource")));
    assert!(h.provisioner.is_provisioned(&second).await.unwrap());

    h.provisioner.deprovision(&second).await.unwrap();
    let calls = h.admin.calls();
    let tail: Vec<&str> = calls.iter().rev().take(4).rev().map(String::as_str).collect();
    assert_eq!(
        vec![
            "unschedule morgs_near_second_sys_logs_create_partition morgs_near_second_sys_logs_delete_partition",
            "drop_database morgs_near",
            "revoke_cron_access morgs_near",
            "drop_role morgs_near",
        ],
        tail
    );
    assert!(h
        .metadata
        .mutations()
        .contains(&"drop_datasource morgs_near".to_string()));
}

#[tokio::test]
async fn connection_parameters_use_pg_bouncer() {
    let metadata = MockMetadataClient::default();
    let provisioner = Provisioner::new(
        Arc::new(metadata.clone()),
        Arc::new(MockAdminDatabase::default()),
    )
    .with_executor_factory(Arc::new(RecordingExecutors::default()))
    .with_pg_bouncer(PgBouncerOverrides {
        host: Some("pgbouncer".to_string()),
        port: Some(6432),
    });
    let config = config("social_feed");
    provisioner.provision_user_api(&config).await.unwrap();

    let parameters = provisioner
        .get_postgres_connection_parameters(&config)
        .await
        .unwrap();
    assert_eq!("pgbouncer", parameters.host);
    assert_eq!(6432, parameters.port);
    assert_eq!("morgs_near", parameters.database);
}
