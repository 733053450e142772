use anyhow::{Context as _, Result};
use duckmodel_core::{CatalogStore, Context, DriverConfig, DriverError, DuckDbHandle, Handle, Resource};
use tempfile::TempDir;

fn open_catalog() -> Result<(TempDir, DuckDbHandle, CatalogStore)> {
    let dir = tempfile::tempdir()?;
    let handle = DuckDbHandle::open(
        "catalog-test",
        DriverConfig {
            path: Some(dir.path().join("catalog.db")),
            pool_size: 2,
            ..Default::default()
        },
    )?;
    handle.migrate(&Context::background())?;
    let catalog = handle.as_catalog_store().context("no catalog store")?;
    Ok((dir, handle, catalog))
}

#[test]
fn create_find_and_conflict_regardless_of_case() -> Result<()> {
    let (_dir, _handle, catalog) = open_catalog()?;
    let ctx = Context::background();

    let version = catalog.next_controller_version(&ctx)?;
    assert_eq!(version, 1);
    catalog.create_resource(&ctx, version, &Resource::new("model", "Orders", b"v1".to_vec()))?;

    let found = catalog.find_resources(&ctx)?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].name, "Orders");
    assert_eq!(found[0].data, b"v1");

    let err = catalog
        .create_resource(&ctx, version, &Resource::new("model", "orders", b"v2".to_vec()))
        .unwrap_err();
    assert!(matches!(err, DriverError::ResourceExists { .. }), "{err}");

    // Same name under another kind is a different resource.
    catalog.create_resource(&ctx, version, &Resource::new("source", "orders", Vec::new()))?;
    let kinds: Vec<String> = catalog.find_resources(&ctx)?.into_iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec!["model".to_string(), "source".to_string()]);
    Ok(())
}

#[test]
fn stale_version_leaves_catalog_unchanged() -> Result<()> {
    let (_dir, _handle, catalog) = open_catalog()?;
    let ctx = Context::background();

    let observed = catalog.next_controller_version(&ctx)?;
    catalog.create_resource(&ctx, observed, &Resource::new("model", "a", b"1".to_vec()))?;
    let advanced = catalog.next_controller_version(&ctx)?;
    assert_eq!(advanced, observed + 1);

    let err = catalog
        .create_resource(&ctx, observed, &Resource::new("model", "b", Vec::new()))
        .unwrap_err();
    assert!(matches!(
        err,
        DriverError::InconsistentControllerVersion { expected, actual } if expected == observed && actual == advanced
    ));

    let mut updated = Resource::new("model", "a", b"2".to_vec());
    updated.updated_on = updated.created_on;
    assert!(catalog.update_resource(&ctx, observed, &updated).is_err());
    assert!(catalog.delete_resource(&ctx, observed, "model", "a").is_err());

    let found = catalog.find_resources(&ctx)?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].data, b"1");
    assert!(catalog.check_controller_version(&ctx, advanced).is_ok());
    Ok(())
}

#[test]
fn update_and_delete_by_case_insensitive_name() -> Result<()> {
    let (_dir, _handle, catalog) = open_catalog()?;
    let ctx = Context::background();
    let version = catalog.next_controller_version(&ctx)?;

    catalog.create_resource(&ctx, version, &Resource::new("model", "Revenue", b"old".to_vec()))?;
    catalog.update_resource(&ctx, version, &Resource::new("model", "REVENUE", b"new".to_vec()))?;
    let found = catalog.find_resources(&ctx)?;
    assert_eq!(found[0].data, b"new");
    assert!(found[0].updated_on >= found[0].created_on);

    let missing = catalog
        .update_resource(&ctx, version, &Resource::new("model", "nope", Vec::new()))
        .unwrap_err();
    assert!(missing.is_not_found());

    catalog.delete_resource(&ctx, version, "model", "revenue")?;
    assert!(catalog.find_resources(&ctx)?.is_empty());
    assert!(catalog
        .delete_resource(&ctx, version, "model", "revenue")
        .unwrap_err()
        .is_not_found());
    Ok(())
}

#[test]
fn delete_all_and_persistence_across_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = DriverConfig {
        path: Some(dir.path().join("catalog.db")),
        pool_size: 2,
        ..Default::default()
    };
    let ctx = Context::background();
    {
        let handle = DuckDbHandle::open("first", config.clone())?;
        handle.migrate(&ctx)?;
        let catalog = handle.as_catalog_store().context("no catalog store")?;
        let version = catalog.next_controller_version(&ctx)?;
        catalog.create_resource(&ctx, version, &Resource::new("model", "kept", Vec::new()))?;
        handle.close()?;
    }

    let handle = DuckDbHandle::open("second", config)?;
    assert_eq!(handle.migration_status(&ctx)?.0, handle.migrate(&ctx)?);
    let catalog = handle.as_catalog_store().context("no catalog store")?;
    assert_eq!(catalog.find_resources(&ctx)?.len(), 1);
    assert_eq!(catalog.next_controller_version(&ctx)?, 2);

    catalog.delete_all_resources(&ctx)?;
    assert!(catalog.find_resources(&ctx)?.is_empty());
    Ok(())
}
