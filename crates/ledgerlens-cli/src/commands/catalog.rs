use ledgerlens_core::{Composer, Granularity, Materialization, MetricCatalog, Warehouse, WarehouseConfig};
use serde_json::{json, Value};

use crate::cli::{CatalogArgs, ExplainArgs};
use crate::error::CliError;

use super::CommandResult;

pub fn list(args: &CatalogArgs) -> Result<CommandResult, CliError> {
    let catalog = MetricCatalog::standard();
    let filter = args.granularity.map(Granularity::from);
    let templates: Vec<Value> = catalog
        .templates()
        .filter(|template| filter.map_or(true, |granularity| template.granularity() == granularity))
        .map(|template| {
            json!({
                "name": template.name(),
                "granularity": template.granularity(),
                "dependency": template.dependency(),
                "date_column": template.date_column(),
                "order_by": template.order_by(),
            })
        })
        .collect();

    Ok(CommandResult::ok(json!({
        "count": templates.len(),
        "templates": templates,
    })))
}

/// Composition needs no data, so an in-memory warehouse backs the composer.
pub fn explain(args: &ExplainArgs) -> Result<CommandResult, CliError> {
    let granularity = Granularity::from(args.granularity);
    let materialization = if args.inline {
        Materialization::Inline
    } else {
        Materialization::ScratchTable
    };
    let warehouse = Warehouse::open(WarehouseConfig::in_memory())?;
    let composer = Composer::standard(warehouse).with_materialization(materialization);
    let composed = composer.compose(&args.name, granularity)?;

    Ok(CommandResult::ok(json!({
        "metric": args.name,
        "granularity": granularity,
        "materialization": materialization,
        "binds_session": composed.binds_session(),
        "stages": composed.stages().iter().map(|stage| stage.name.as_str()).collect::<Vec<_>>(),
        "sql": composed.render(),
    })))
}
