//! Content policy and timeseries scenarios through the orchestrator.

use std::collections::BTreeMap;
use themis_core::{CoreError, Database};

fn flags(err: &CoreError) -> (bool, bool, bool) {
    match err {
        CoreError::PolicyDenied {
            blacklisted,
            size_exceeded,
            not_whitelisted,
            ..
        } => (*blacklisted, *size_exceeded, *not_whitelisted),
        other => panic!("expected PolicyDenied, got {other:?}"),
    }
}

#[test]
fn upload_policy_scenario() {
    let db = Database::open_in_memory().unwrap();
    let content = db.content();

    // The default policy ships empty allow/deny lists with default deny,
    // so exercise the documented decision table through a dedicated
    // manager.
    use themis_core::content::{
        AllowedRule, ContentManager, ContentPolicy, DeniedRule, PolicyAction,
    };
    let policy = ContentPolicy {
        default_max_size: 25 * 1024 * 1024,
        default_action: PolicyAction::Deny,
        allowed: vec![AllowedRule {
            mime: "text/plain".to_string(),
            max_size: Some(10 * 1024 * 1024),
        }],
        denied: vec![DeniedRule {
            mime: "application/x-msdownload".to_string(),
            reason: "executables are not accepted".to_string(),
        }],
        category_rules: std::collections::HashMap::new(),
    };
    let manager = ContentManager::new(db.store_handle(), policy, None);

    // validate_upload("doc.txt", 1 MiB) = allowed.
    assert!(manager.validate_upload("doc.txt", 1024 * 1024).is_ok());

    // validate_upload("doc.txt", 20 MiB) = size_exceeded.
    let err = manager
        .validate_upload("doc.txt", 20 * 1024 * 1024)
        .unwrap_err();
    assert_eq!(flags(&err), (false, true, false));

    // validate_upload("a.exe", 1 KiB) = blacklisted.
    let err = manager.validate_upload("a.exe", 1024).unwrap_err();
    assert_eq!(flags(&err), (true, false, false));

    // The orchestrator's manager encrypts per user.
    content
        .import("report", "report.txt", b"quarterly numbers", Some("alice"))
        .unwrap();
    assert_eq!(
        content.get("report", Some("alice")).unwrap(),
        b"quarterly numbers"
    );
    assert_eq!(
        content.get("report", Some("mallory")).unwrap_err().kind(),
        "AuthFailure"
    );
}

#[test]
fn timeseries_through_orchestrator() {
    use themis_core::timeseries::TsPoint;

    let db = Database::open_in_memory().unwrap();
    let ts = db.timeseries();

    for (offset, value) in [(0u64, 10.0), (500, 20.0), (1500, 30.0)] {
        ts.put(&TsPoint {
            metric: "cpu".to_string(),
            entity: "host1".to_string(),
            ts_ms: 1_000_000 + offset,
            value,
            tags: BTreeMap::new(),
        })
        .unwrap();
    }

    let windows = ts
        .aggregate("cpu", 1000, 1_000_000, 1_002_000, Some("host1"))
        .unwrap();
    assert_eq!(windows.len(), 2);
    assert_eq!(windows[0].count, 2);
    assert_eq!(windows[0].avg, 15.0);
    assert_eq!(windows[1].min, 30.0);

    let removed = ts.retention_cleanup(Some("cpu"), 1_000_400).unwrap();
    assert_eq!(removed, 1);
    let remaining = ts
        .query("cpu", 0, u64::MAX, Some("host1"), None, None)
        .unwrap();
    assert_eq!(remaining.len(), 2);
}

#[test]
fn semantic_cache_through_orchestrator() {
    let db = Database::open_in_memory().unwrap();
    let cache = db.semantic_cache().unwrap();
    let params = serde_json::json!({"model": "small"});

    assert!(cache.query("prompt", &params).unwrap().is_none());
    cache
        .put(
            "prompt",
            &params,
            serde_json::json!("answer"),
            serde_json::Value::Null,
            -1,
        )
        .unwrap();
    let hit = cache.query("prompt", &params).unwrap().unwrap();
    assert_eq!(hit.response, serde_json::json!("answer"));

    let stats = cache.stats().unwrap();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
}
