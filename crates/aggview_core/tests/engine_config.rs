use aggview_core::{
    Atom, AtomOperation, BatchFailurePolicy, BehaviorKind, BehaviorResolver, BehaviorSpec,
    ConfigError, EngineConfig, ExceptionRetention, Query, QueryRegistry,
};
use std::io::Write;
use std::sync::Arc;

#[test]
fn loads_config_file_with_absolute_log_dir() {
    let log_dir = tempfile::tempdir().expect("temp dir");
    let mut file = tempfile::NamedTempFile::new().expect("config file");
    let document = serde_json::json!({
        "logging": { "level": "warning", "log_dir": log_dir.path() },
        "store": { "exception_retention": "clear_on_update" }
    });
    write!(file, "{document}").expect("write config");

    let config = EngineConfig::load(file.path()).expect("load");
    assert_eq!(config.logging.log_dir.as_deref(), Some(log_dir.path()));
    assert_eq!(
        config.store.exception_retention,
        ExceptionRetention::ClearOnUpdate
    );
    assert_eq!(config.store.batch_failure, BatchFailurePolicy::Atomic);
}

#[test]
fn missing_file_is_unreadable() {
    let dir = tempfile::tempdir().expect("temp dir");
    let err = EngineConfig::load(&dir.path().join("absent.json")).expect_err("no file");
    assert!(matches!(err, ConfigError::Unreadable { .. }));
}

#[test]
fn store_policy_flows_into_registered_queries() {
    let config = EngineConfig::from_json(
        r#"{"store":{"exception_retention":"clear_on_update","batch_failure":"skip_invalid"}}"#,
    )
    .expect("config");
    let registry = QueryRegistry::from_config(&config, Arc::new(BehaviorResolver::with_builtins()));
    let query = Query::with_id(
        "q-1",
        "load",
        BehaviorSpec::native(BehaviorKind::Predicate, "builtin.predicate.always"),
    )
    .expect("valid id");
    let orchestrator = registry.register(query).expect("register");

    registry
        .record_exception("q-1", "north", "timeout")
        .expect("exception");
    let outcome = registry
        .update_results(
            "q-1",
            "north",
            &[
                AtomOperation::add(Atom::new().with_identifier("siteId", "A")),
                AtomOperation::add(Atom::new().with_value("load", "1")),
            ],
        )
        .expect("partial batch applies");
    assert_eq!(outcome.rejected.len(), 1);
    // A batch with rejections does not clear the source's exception.
    assert!(orchestrator.raw_view().has_exceptions());

    registry
        .update_results(
            "q-1",
            "north",
            &[AtomOperation::add(Atom::new().with_identifier("siteId", "B"))],
        )
        .expect("clean batch");
    assert!(!orchestrator.raw_view().has_exceptions());
}
