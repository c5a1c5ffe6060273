//! `changefeed` command: dump CDC events.

use themis_core::{CoreError, CoreResult, Database};

/// Prints events after `from` as JSON lines.
pub fn run(
    db: &Database,
    from: u64,
    limit: usize,
    key_prefix: Option<&str>,
) -> CoreResult<()> {
    let log = db
        .changefeed()
        .ok_or_else(|| CoreError::invalid_operation("CDC feature is disabled"))?;
    let events = log.query(from, limit, key_prefix, None)?;
    for event in &events {
        let line = serde_json::to_string(event)
            .map_err(|e| CoreError::invalid_operation(e.to_string()))?;
        println!("{line}");
    }
    if events.is_empty() {
        eprintln!("no events after sequence {from}");
    }
    Ok(())
}
