//! Offload and archive round trips against a real database.
//!
//! Skipped unless `FLOWMILL_TEST_DATABASE_URL` is set. A `mysql://` URL selects
//! the MySQL backend, anything else Postgres.

use anyhow::Context;
use chrono::Utc;
use flowmill_core::config::{PersistenceConfig, SqlDriver};
use flowmill_core::persistence::{self, ArchivedWorkflow, PersistenceStores};
use flowmill_core::workflow::{NodePhase, NodeStatus, Nodes};
use serde_json::json;
use uuid::Uuid;

async fn stores() -> anyhow::Result<Option<PersistenceStores>> {
    let Ok(url) = std::env::var("FLOWMILL_TEST_DATABASE_URL") else {
        return Ok(None);
    };
    let driver = if url.starts_with("mysql://") {
        SqlDriver::Mysql
    } else {
        SqlDriver::Postgres
    };
    let config = PersistenceConfig {
        enabled: true,
        driver,
        url: Some(url),
        ..PersistenceConfig::default()
    };
    let stores = persistence::connect(&config)
        .await
        .context("connecting to FLOWMILL_TEST_DATABASE_URL")?;
    Ok(Some(stores))
}

#[tokio::test]
async fn offload_round_trip() -> anyhow::Result<()> {
    let Some(stores) = stores().await? else {
        eprintln!("FLOWMILL_TEST_DATABASE_URL not set, skipping");
        return Ok(());
    };
    let uid = Uuid::new_v4();
    let mut nodes = Nodes::new();
    nodes.insert(
        "n1".into(),
        NodeStatus::new("n1", "wf[0].build", "build", NodePhase::Succeeded),
    );

    let version = stores.offloads.save(uid, "sql-test", &nodes).await.unwrap();
    assert_eq!(stores.offloads.get(uid, &version).await.unwrap(), nodes);
    // saving the same nodes again yields the same version
    assert_eq!(stores.offloads.save(uid, "sql-test", &nodes).await.unwrap(), version);

    stores.offloads.delete(uid, &version).await?;
    assert!(stores.offloads.get(uid, &version).await.is_err());
    Ok(())
}

#[tokio::test]
async fn archive_round_trip() -> anyhow::Result<()> {
    let Some(stores) = stores().await? else {
        eprintln!("FLOWMILL_TEST_DATABASE_URL not set, skipping");
        return Ok(());
    };
    let archived = ArchivedWorkflow {
        uid: Uuid::new_v4(),
        name: "nightly".into(),
        namespace: "sql-test".into(),
        phase: "Succeeded".into(),
        started_at: Some(Utc::now()),
        finished_at: Some(Utc::now()),
        workflow: json!({ "metadata": { "name": "nightly" } }),
    };

    stores.archive.archive(&archived).await.unwrap();
    let loaded = stores.archive.get(archived.uid).await.unwrap().unwrap();
    assert_eq!(loaded.name, "nightly");
    assert_eq!(loaded.workflow, archived.workflow);

    stores.archive.delete(archived.uid).await?;
    assert!(stores.archive.get(archived.uid).await?.is_none());
    Ok(())
}
