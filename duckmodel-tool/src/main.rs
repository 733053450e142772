use anyhow::{bail, Context as _, Result};
use duckmodel_core::driver::DUCKDB_DRIVER;
use duckmodel_core::{Context, DriverConfig, DriverRegistry};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

/// Settings of the tool itself; the driver reads its own from the same
/// `DUCKMODEL_*` environment.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
struct ToolConfig {
    log_format: String,
    instance_id: String,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            log_format: "compact".to_string(),
            instance_id: "default".to_string(),
        }
    }
}

impl ToolConfig {
    fn load() -> Result<Self> {
        let defaults_json =
            serde_json::to_string(&Self::default()).context("failed to serialize defaults")?;
        config::Config::builder()
            .add_source(config::File::from_str(&defaults_json, config::FileFormat::Json))
            .add_source(config::Environment::with_prefix("DUCKMODEL").try_parsing(true))
            .build()
            .context("failed to load tool configuration")?
            .try_deserialize()
            .context("failed to deserialize tool configuration")
    }
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let tool = ToolConfig::load()?;
    init_tracing(&tool);
    let driver_config = DriverConfig::load().context("failed to load driver configuration")?;
    info!("driver config:\n{:?}", driver_config);

    let props = match serde_json::to_value(&driver_config)? {
        serde_json::Value::Object(map) => map,
        other => bail!("driver configuration serialized to {other}"),
    };
    let registry = DriverRegistry::with_defaults();
    let handle = registry
        .open(DUCKDB_DRIVER, &tool.instance_id, &props)
        .context("failed to open driver")?;

    let ctx = Context::background();
    let version = handle.migrate(&ctx).context("failed to migrate catalog")?;
    info!(version, "catalog is up to date");

    if let Some(catalog) = handle.as_catalog_store() {
        let resources = catalog.find_resources(&ctx).context("failed to list resources")?;
        println!("resources ({}):", resources.len());
        for resource in resources {
            println!(
                "  {}/{} ({} bytes, updated {})",
                resource.kind,
                resource.name,
                resource.data.len(),
                resource.updated_on
            );
        }
    }

    if let Some(schema) = handle.information_schema() {
        let tables = schema.all(&ctx).context("failed to read information schema")?;
        println!("tables ({}):", tables.len());
        for table in tables {
            let kind = if table.is_view { "view" } else { "table" };
            println!("  {}.{} [{kind}]", table.schema, table.name);
            for field in &table.fields {
                println!("    {} {}", field.name, field.data_type);
            }
        }
    }

    handle.close().context("failed to close driver")?;
    Ok(())
}

fn init_tracing(config: &ToolConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,duckmodel_core=debug"));

    if config.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .with_target(false)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_writer(std::io::stderr)
            .init();
    }
}
