//! `verify` command: audit chain and signature checks.

use themis_core::{CoreResult, Database};

/// Verifies the audit chain and/or registered file signatures.
pub fn run(db: &Database, check_audit: bool, check_signatures: bool) -> CoreResult<()> {
    if check_audit {
        // Opening the log verifies the chain from genesis.
        let log = db.open_audit_log(None)?;
        match log.verify_chain()? {
            Some((entries, _)) => println!("audit chain OK ({entries} entries)"),
            None => println!("audit chain empty"),
        }
    }

    if check_signatures {
        let records = db.integrity().list()?;
        if records.is_empty() {
            println!("no registered signatures");
        }
        let mut failed = 0usize;
        for record in &records {
            match std::fs::read(&record.resource_id) {
                Ok(content) => match db.integrity().verify(&record.resource_id, &content) {
                    Ok(_) => println!("  ok       {}", record.resource_id),
                    Err(err) => {
                        failed += 1;
                        println!("  FAILED   {} ({err})", record.resource_id);
                    }
                },
                Err(err) => {
                    failed += 1;
                    println!("  missing  {} ({err})", record.resource_id);
                }
            }
        }
        if failed > 0 {
            return Err(themis_core::CoreError::auth_failure(format!(
                "{failed} resource(s) failed verification"
            )));
        }
    }
    Ok(())
}
