//! DataHub - Task Runner
//!
//! Runs a task file: builds every configured source, attaches the requested
//! consumers, runs all queries in the background and waits for them.
//!
//! ```text
//! datahub <task.toml | task.json>
//! ```

use anyhow::{anyhow, bail, Context};
use datahub_rs::{
    config::TaskConfig,
    consumers::{StdoutWriter, Table},
    logging,
    source::{Source, SourceRuntime},
    sources::{create_source, known_source_types},
};
use std::sync::Arc;
use std::time::Duration;

fn usage() -> String {
    format!(
        "usage: datahub <task-file>\n\nsource types: {}",
        known_source_types().join(", ")
    )
}

fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1).ok_or_else(|| anyhow!(usage()))?;
    if path == "-h" || path == "--help" {
        println!("{}", usage());
        return Ok(());
    }

    let task = TaskConfig::load(&path).with_context(|| format!("Loading task {}", path))?;
    let _log_guard = logging::init(&task.logging)?;
    tracing::info!("Starting task {} with {} source(s)", path, task.sources.len());

    let runtime = SourceRuntime::new();
    let table = task.table.then(|| Arc::new(Table::new()));
    let printer = task.print.then(|| Arc::new(StdoutWriter::stdout()));

    let mut sources: Vec<Source> = Vec::with_capacity(task.sources.len());
    for entry in &task.sources {
        let adapter = create_source(&entry.adapter)
            .with_context(|| format!("Creating {} source", entry.adapter.type_name()))?;
        let source = Source::new(&runtime, adapter, entry.settings(&task));
        if let Some(id) = &entry.id {
            source.set_id(id.clone());
        }
        if let Some(table) = &table {
            source.add_listener(table.clone());
        }
        if let Some(printer) = &printer {
            source.add_listener(printer.clone());
        }
        sources.push(source);
    }

    if let Some(pattern) = &task.search {
        for source in &sources {
            match source.search(pattern) {
                Ok(found) => {
                    println!("{}:", source.description());
                    for item in found {
                        println!("  {}", item.name);
                    }
                }
                Err(e) => tracing::warn!("Search on {} failed: {}", source.description(), e),
            }
        }
        runtime.cleanup_all();
        return Ok(());
    }

    for (source, entry) in sources.iter().zip(&task.sources) {
        source
            .request(entry.query.clone(), true)
            .with_context(|| format!("Starting query on {}", source.description()))?;
    }

    let timeout = task
        .timeout
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .map(Duration::from_secs_f64);

    let mut failed = 0;
    for source in &sources {
        if !source.join(timeout) {
            tracing::warn!("{} timed out, aborting", source.description());
            source.abort();
            source.join(None);
        }
        if let Some(error) = source.last_error() {
            tracing::error!("{} failed: {}", source.description(), error);
            failed += 1;
        }
    }

    if let Some(table) = &table {
        for channel in table.channels() {
            println!("{}: {} record(s)", channel, table.rows(&channel).len());
        }
    }

    for source in &sources {
        source.close_listeners();
    }
    runtime.cleanup_all();
    tracing::info!("Task finished");

    if failed > 0 {
        bail!("{} of {} source(s) failed", failed, sources.len());
    }
    Ok(())
}
