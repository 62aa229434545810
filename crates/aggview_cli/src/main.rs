//! CLI smoke entry point.
//!
//! # Responsibility
//! - Verify `aggview_core` linkage and print its version.
//! - Run a fixed two-source aggregation and print the resulting view.
//!
//! Usage: `aggview_cli [config.json]`

use aggview_core::{
    core_version, init_logging, Atom, AtomOperation, BehaviorKind, BehaviorResolver, BehaviorSpec,
    EngineConfig, Query, QueryError, QueryRegistry,
};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

fn main() -> ExitCode {
    println!("aggview_core version={}", core_version());

    let config = match std::env::args().nth(1) {
        Some(path) => match EngineConfig::load(Path::new(&path)) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("config error: {err}");
                return ExitCode::FAILURE;
            }
        },
        None => EngineConfig::default(),
    };
    if let Err(err) = init_logging(&config.logging) {
        eprintln!("logging error: {err}");
        return ExitCode::FAILURE;
    }

    match run_demo(&config) {
        Ok(view) => {
            println!("{view}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("event=demo_failed module=cli status=error");
            eprintln!("demo failed: {err}");
            ExitCode::FAILURE
        }
    }
}

/// Two sources report load for site A; the sum melder folds them.
fn run_demo(config: &EngineConfig) -> Result<String, QueryError> {
    let registry = QueryRegistry::from_config(config, Arc::new(BehaviorResolver::with_builtins()));
    let query = Query::with_id(
        "demo",
        "site load",
        BehaviorSpec::native(BehaviorKind::Predicate, "builtin.predicate.always"),
    )?
    .with_aggregation(
        BehaviorSpec::native_melder("builtin.melder.sum", ["siteId"]).with_param("field", "load"),
    )
    .with_sources(["north", "south"]);
    let orchestrator = registry.register(query)?;

    for (source, load) in [("north", "3"), ("south", "5")] {
        let atom = Atom::new()
            .with_identifier("siteId", "A")
            .with_value("load", load);
        registry.update_results("demo", source, &[AtomOperation::add(atom)])?;
    }
    log::info!(
        "event=demo_done module=cli status=ok notifications={}",
        orchestrator.notifications()
    );
    Ok(orchestrator.active_view().serialize()?)
}
