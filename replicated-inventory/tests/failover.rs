//! Primary loss, succession and rejoin.

mod common;

use std::time::Duration;

use anyhow::Result;
use common::TestCluster;
use replicated_inventory::cluster::Health;
use replicated_inventory::error::InventoryError;
use replicated_inventory::message::Request;
use replicated_inventory::store::{InventoryKey, InventoryStore};
use replicated_inventory::transport;

fn apple() -> InventoryKey {
    InventoryKey::new("borivali", "Fresh_Mart", "apple")
}

#[tokio::test]
async fn lowest_surviving_backup_takes_over() -> Result<()> {
    let mut cluster = TestCluster::spawn(3).await?;
    let client = cluster.client();
    client.add_stock("borivali", "Fresh_Mart", "apple", 10).await?;

    cluster.stop(1).await;
    cluster
        .wait_for("a backup to be promoted", |cluster| {
            cluster.running().all(|(_, node)| node.membership().view().primary_count() <= 1)
                && cluster.primaries() == vec![2]
        })
        .await?;
    cluster
        .wait_for("node 3 to follow node 2", |cluster| {
            cluster.node(3).membership().view().primary == Some(2)
        })
        .await?;

    let new_primary = cluster.node(2);
    assert_eq!(new_primary.membership().epoch(), 1);
    assert_eq!(new_primary.store().read(&apple())?, (60, 1));
    assert_eq!(cluster.health_seen_by(2, 1), Some(Health::Dead));

    let bought = client.buy_product("borivali", "Fresh_Mart", "apple", 5).await?;
    assert_eq!(bought.processed_by, Some(2));
    assert_eq!(bought.remaining_quantity, Some(55));
    assert_eq!(bought.version, Some(2));
    assert_eq!(cluster.node(3).store().read(&apple())?, (55, 2));

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn exactly_one_primary_after_failover() -> Result<()> {
    let mut cluster = TestCluster::spawn(4).await?;
    cluster.stop(1).await;

    cluster
        .wait_for("single new primary", |cluster| {
            let primaries = cluster.primaries();
            primaries.len() == 1
                && cluster
                    .running()
                    .all(|(_, node)| node.membership().view().primary == Some(primaries[0]))
        })
        .await?;
    assert_eq!(cluster.primaries(), vec![2]);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn restarted_primary_rejoins_as_backup() -> Result<()> {
    let mut cluster = TestCluster::spawn(3).await?;
    let client = cluster.client();

    cluster.stop(1).await;
    cluster
        .wait_for("node 2 promoted", |cluster| cluster.primaries() == vec![2])
        .await?;
    client.add_stock("borivali", "Fresh_Mart", "apple", 3).await?;

    cluster.restart(1).await?;
    cluster
        .wait_for("node 1 to rejoin with current state", |cluster| {
            cluster.health_seen_by(2, 1) == Some(Health::Healthy)
                && cluster.node(1).store().version() == 1
        })
        .await?;

    assert_eq!(cluster.primaries(), vec![2]);
    assert_eq!(cluster.node(1).membership().view().primary, Some(2));
    assert_eq!(cluster.node(1).store().read(&apple())?, (53, 1));

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn primary_restarted_before_detection_keeps_history() -> Result<()> {
    let mut cluster = TestCluster::spawn(3).await?;
    let client = cluster.client();
    for _ in 0..3 {
        client.add_stock("borivali", "Fresh_Mart", "apple", 10).await?;
    }
    assert_eq!(cluster.node(2).store().read(&apple())?, (80, 3));

    cluster.restart(1).await?;
    let written = client.add_stock("borivali", "Fresh_Mart", "apple", 1).await?;
    assert_eq!(written.new_quantity, Some(81));
    assert_eq!(written.version, Some(4));

    cluster
        .wait_for("every replica at version 4", |cluster| {
            cluster
                .running()
                .all(|(_, node)| node.store().read(&apple()).ok() == Some((81, 4)))
        })
        .await?;
    assert_eq!(cluster.primaries().len(), 1);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn primary_behind_its_backup_rebuilds_instead_of_overwriting() -> Result<()> {
    let cluster = TestCluster::spawn(2).await?;
    let client = cluster.client();
    for _ in 0..3 {
        client.add_stock("borivali", "Fresh_Mart", "apple", 10).await?;
    }

    // Wipe the primary's history while it keeps the role.
    let primary = cluster.node(1).store();
    primary.install_snapshot(InventoryStore::seeded().snapshot(), true)?;
    assert_eq!(primary.version(), 0);

    let rejected = transport::call(
        cluster.address(1),
        &Request::add_stock(&apple(), 1),
        Duration::from_secs(2),
    )
    .await?;
    assert_eq!(
        rejected.into_result().unwrap_err(),
        InventoryError::VersionRegression { replica_version: 3 }
    );
    assert_eq!(cluster.node(2).store().read(&apple())?, (80, 3));
    assert_eq!(primary.read(&apple())?, (80, 3));
    assert_eq!(primary.snapshot(), cluster.node(2).store().snapshot());

    let written = client.add_stock("borivali", "Fresh_Mart", "apple", 1).await?;
    assert_eq!(written.version, Some(4));
    assert_eq!(cluster.node(2).store().read(&apple())?, (81, 4));

    cluster.shutdown().await;
    Ok(())
}
