use std::sync::Arc;

use anyhow::{Context as _, Result};
use arrow_array::{Int32Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use duckdb::types::Value;
use duckmodel_core::olap::CreateTableOptions;
use duckmodel_core::{Context, DriverConfig, DriverError, DuckDbHandle, Handle, Olap, Statement, TypeKind};
use tempfile::TempDir;

fn open_olap(storage_limit_bytes: Option<u64>) -> Result<(TempDir, DuckDbHandle, Olap)> {
    let dir = tempfile::tempdir()?;
    let handle = DuckDbHandle::open(
        "crud-test",
        DriverConfig {
            path: Some(dir.path().join("crud.db")),
            pool_size: 2,
            storage_limit_bytes,
            ..Default::default()
        },
    )?;
    let olap = handle.as_olap().context("no olap")?;
    Ok((dir, handle, olap))
}

fn scalar(olap: &Olap, sql: &str) -> Result<i64> {
    let value = olap.with_connection(&Context::background(), 0, |s| s.query_i64(sql, &[]))?;
    Ok(value.unwrap_or_default())
}

fn text(olap: &Olap, sql: &str) -> Result<String> {
    let value = olap.with_connection(&Context::background(), 0, |s| {
        Ok(s.connection().query_row(sql, [], |row| row.get::<_, String>(0))?)
    })?;
    Ok(value)
}

#[test]
fn create_table_as_select_replaces_either_kind() -> Result<()> {
    let (_dir, _handle, olap) = open_olap(None)?;
    let ctx = Context::background();

    olap.create_table_as_select(&ctx, "t", "SELECT 1 AS x UNION ALL SELECT 2;", &Default::default())?;
    assert_eq!(scalar(&olap, "SELECT count(*) FROM t")?, 2);

    let view = CreateTableOptions {
        view: true,
        ..Default::default()
    };
    olap.create_table_as_select(&ctx, "t", "SELECT 'v' AS y", &view)?;
    let table = olap.information_schema().lookup(&ctx, "t")?;
    assert!(table.is_view);
    assert!(table.field("y").is_some());

    olap.create_table_as_select(&ctx, "t", "SELECT 3 AS z", &Default::default())?;
    assert!(!olap.information_schema().lookup(&ctx, "t")?.is_view);
    assert_eq!(scalar(&olap, "SELECT z FROM t")?, 3);
    Ok(())
}

#[test]
fn hooks_run_on_the_same_connection_even_on_failure() -> Result<()> {
    let (_dir, _handle, olap) = open_olap(None)?;
    let ctx = Context::background();

    let opts = CreateTableOptions {
        before_create: Some("CREATE TEMP TABLE hook_log (msg VARCHAR)".to_string()),
        after_create: Some("INSERT INTO hook_log VALUES ('after')".to_string()),
        ..Default::default()
    };
    let logged = olap.with_connection(&ctx, 0, |session| {
        duckmodel_core::olap::crud::create_table_as_select(session, "ok", "SELECT 1 AS a", &opts)?;
        let failing = CreateTableOptions {
            before_create: None,
            ..opts.clone()
        };
        let err = duckmodel_core::olap::crud::create_table_as_select(
            session,
            "broken",
            "SELECT * FROM missing_table",
            &failing,
        )
        .unwrap_err();
        assert!(err.to_string().contains("broken"), "{err}");
        session.query_i64("SELECT count(*) FROM hook_log", &[])
    })?;
    assert_eq!(logged, Some(2));
    assert!(olap.information_schema().lookup(&ctx, "broken").unwrap_err().is_not_found());
    Ok(())
}

#[test]
fn views_reject_bound_arguments() -> Result<()> {
    let (_dir, _handle, olap) = open_olap(None)?;
    let opts = CreateTableOptions {
        view: true,
        args: vec![Value::Int(1)],
        ..Default::default()
    };
    let err = olap
        .create_table_as_select(&Context::background(), "v", "SELECT ? AS a", &opts)
        .unwrap_err();
    assert!(matches!(err, DriverError::Validation(_)));

    let opts = CreateTableOptions {
        args: vec![Value::Int(7)],
        ..Default::default()
    };
    olap.create_table_as_select(&Context::background(), "p", "SELECT ?::INTEGER AS a", &opts)?;
    assert_eq!(scalar(&olap, "SELECT a FROM p")?, 7);
    Ok(())
}

#[test]
fn rename_over_existing_destination() -> Result<()> {
    let (_dir, _handle, olap) = open_olap(None)?;
    let ctx = Context::background();

    olap.create_table_as_select(&ctx, "src", "SELECT 42 AS v", &Default::default())?;
    olap.create_table_as_select(
        &ctx,
        "dst",
        "SELECT 'old' AS w",
        &CreateTableOptions {
            view: true,
            ..Default::default()
        },
    )?;
    olap.rename_table(&ctx, "src", "dst")?;

    let schema = olap.information_schema();
    let dst = schema.lookup(&ctx, "dst")?;
    assert!(!dst.is_view);
    assert!(dst.field("v").is_some() && dst.field("w").is_none());
    assert_eq!(scalar(&olap, "SELECT v FROM dst")?, 42);
    assert!(schema.lookup(&ctx, "src").unwrap_err().is_not_found());
    assert_eq!(schema.all(&ctx)?.len(), 1);

    // Case-only rename.
    olap.rename_table(&ctx, "dst", "Dst")?;
    assert_eq!(text(&olap, "SELECT table_name FROM information_schema.tables")?, "Dst");

    assert!(olap.rename_table(&ctx, "missing", "other").unwrap_err().is_not_found());
    Ok(())
}

#[test]
fn drop_requires_an_existing_object() -> Result<()> {
    let (_dir, _handle, olap) = open_olap(None)?;
    let ctx = Context::background();

    assert!(olap.drop_table(&ctx, "nothing").unwrap_err().is_not_found());
    olap.create_table_as_select(
        &ctx,
        "v",
        "SELECT 1 AS a",
        &CreateTableOptions {
            view: true,
            ..Default::default()
        },
    )?;
    olap.drop_table(&ctx, "v")?;
    assert!(olap.information_schema().all(&ctx)?.is_empty());
    Ok(())
}

#[test]
fn add_and_alter_columns() -> Result<()> {
    let (_dir, _handle, olap) = open_olap(None)?;
    let ctx = Context::background();

    olap.create_table_as_select(&ctx, "t", "SELECT 1::INTEGER AS x", &Default::default())?;
    olap.alter_table_column(&ctx, "t", "x", "BIGINT")?;
    olap.add_table_column(&ctx, "t", "label with space", "VARCHAR")?;

    let table = olap.information_schema().lookup(&ctx, "t")?;
    assert_eq!(table.field("x").context("x")?.data_type.kind, TypeKind::Int64);
    assert_eq!(
        table.field("label with space").context("label")?.data_type.kind,
        TypeKind::String
    );
    Ok(())
}

#[test]
fn information_schema_maps_nested_types() -> Result<()> {
    let (_dir, _handle, olap) = open_olap(None)?;
    let ctx = Context::background();

    olap.exec(
        &ctx,
        &Statement::new(
            "CREATE TABLE nested (
                amount DECIMAL(10, 2),
                tags VARCHAR[],
                point STRUCT(x INTEGER, attrs MAP(VARCHAR, BOOLEAN)),
                ts TIMESTAMP_MS
            )",
        ),
    )?;
    let table = olap.information_schema().lookup(&ctx, "NESTED")?;
    assert_eq!(table.fields.len(), 4);
    assert_eq!(
        table.fields[0].data_type.kind,
        TypeKind::Decimal {
            precision: 10,
            scale: 2
        }
    );
    assert!(matches!(&table.fields[1].data_type.kind, TypeKind::Array(elem) if elem.kind == TypeKind::String));
    match &table.fields[2].data_type.kind {
        TypeKind::Struct(st) => {
            assert_eq!(st.fields.len(), 2);
            assert!(matches!(st.fields[1].data_type.kind, TypeKind::Map(_)));
        }
        other => panic!("expected struct, got {other:?}"),
    }
    assert_eq!(table.fields[3].data_type.kind, TypeKind::Timestamp);
    Ok(())
}

#[test]
fn append_batches_and_query_results() -> Result<()> {
    let (_dir, _handle, olap) = open_olap(None)?;
    let ctx = Context::background();

    olap.exec(&ctx, &Statement::new("CREATE TABLE people (id INTEGER, name VARCHAR)"))?;
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int32, false),
        Field::new("name", DataType::Utf8, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int32Array::from(vec![1, 2])),
            Arc::new(StringArray::from(vec!["ada", "grace"])),
        ],
    )?;
    assert_eq!(olap.append_batches(&ctx, "people", vec![batch])?, 2);

    let result = olap.execute(
        &ctx,
        &Statement::new("SELECT name FROM people WHERE id > ?")
            .with_args(vec![Value::Int(1)])
            .with_priority(5),
    )?;
    assert_eq!(result.total_rows, 1);
    assert_eq!(result.schema.fields().len(), 1);
    Ok(())
}

#[test]
fn storage_limit_is_checked_against_database_size() -> Result<()> {
    let ctx = Context::background();
    let (_dir, _handle, unlimited) = open_olap(None)?;
    assert!(unlimited.within_storage_limit(&ctx, u64::MAX)?);

    let (_dir, _handle, limited) = open_olap(Some(1024))?;
    limited.create_table_as_select(&ctx, "t", "SELECT range AS i FROM range(1000)", &Default::default())?;
    let used = limited.database_size(&ctx)?;
    assert!(!limited.within_storage_limit(&ctx, 2048)?);
    assert_eq!(limited.within_storage_limit(&ctx, 0)?, used <= 1024);
    Ok(())
}
