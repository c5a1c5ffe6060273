//! `inspect` command: store statistics and index definitions.

use themis_core::{CoreResult, Database};

/// Prints store statistics and the index registry.
pub fn run(db: &Database, format: &str) -> CoreResult<()> {
    let stats = db.stats();
    let definitions = db.indexes().definitions();

    if format == "json" {
        let payload = serde_json::json!({
            "sequence": db.last_sequence(),
            "indexes": definitions
                .iter()
                .map(|def| serde_json::json!({
                    "table": def.table,
                    "column": def.column_key(),
                    "kind": def.kind.name(),
                    "unique": def.unique,
                }))
                .collect::<Vec<_>>(),
            "stats": {
                "reads": stats.reads,
                "writes": stats.writes,
                "deletes": stats.deletes,
                "queries": stats.queries,
                "cdc_events": stats.cdc_events,
            },
        });
        println!("{payload:#}");
        return Ok(());
    }

    println!("ThemisDB at sequence {}", db.last_sequence());
    println!();
    println!("Indexes ({}):", definitions.len());
    for def in definitions {
        let unique = if def.unique { " (unique)" } else { "" };
        println!("  {} {}.{}{unique}", def.kind.name(), def.table, def.column_key());
    }
    println!();
    println!("Counters:");
    println!("  reads      {}", stats.reads);
    println!("  writes     {}", stats.writes);
    println!("  deletes    {}", stats.deletes);
    println!("  queries    {}", stats.queries);
    println!("  cdc events {}", stats.cdc_events);
    Ok(())
}
