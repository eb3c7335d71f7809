//! Integration tests for task files
//!
//! A task file is loaded, its sources are created through the source
//! registry and every query runs in the background into a shared table.

mod common;

use common::builders::two_frame_stream;
use common::test_timeout;
use datahub_rs::config::TaskConfig;
use datahub_rs::consumers::{Table, TableIndex};
use datahub_rs::error::DataHubError;
use datahub_rs::source::{Source, SourceRuntime, SourceState};
use datahub_rs::sources::create_source;
use datahub_rs::types::Value;
use std::path::Path;
use std::sync::Arc;

fn write_task(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("task.toml");
    std::fs::write(&path, body).unwrap();
    path
}

fn build_sources(task: &TaskConfig, table: &Arc<Table>) -> (Arc<SourceRuntime>, Vec<Source>) {
    let runtime = SourceRuntime::new();
    let sources = task
        .sources
        .iter()
        .map(|entry| {
            let source = Source::new(
                &runtime,
                create_source(&entry.adapter).unwrap(),
                entry.settings(task),
            );
            if let Some(id) = &entry.id {
                source.set_id(id.clone());
            }
            source.add_listener(table.clone());
            source
        })
        .collect();
    (runtime, sources)
}

#[test]
fn test_task_runs_all_sources() {
    let dir = tempfile::tempdir().unwrap();
    let captures = dir.path().join("captures");
    std::fs::create_dir(&captures).unwrap();
    std::fs::write(captures.join("BPM.frames"), two_frame_stream()).unwrap();

    let replay = dir.path().join("bus.jsonl");
    std::fs::write(
        &replay,
        concat!(
            "{\"channel\": \"X\", \"id\": 1, \"timestamp\": 1000, \"value\": 1.0}\n",
            "{\"channel\": \"Y\", \"id\": 1, \"timestamp\": 1000, \"value\": 2}\n",
            "{\"channel\": \"X\", \"id\": 2, \"timestamp\": 2000, \"value\": 3.0}\n",
        ),
    )
    .unwrap();

    let body = format!(
        r#"
        table = true

        [[sources]]
        id = "archive"
        adapter = {{ type = "daqbuf", directory = {:?}, delay = 0.0 }}
        query = {{ channels = ["BPM"], prefix = true }}

        [[sources]]
        adapter = {{ type = "bus", replay = {:?} }}
        query = {{ channels = ["X", "Y"] }}

        [[sources]]
        adapter = {{ type = "simulated", rate_hz = 200.0, max_samples = 4 }}
        query = {{ channels = ["counter"] }}
        "#,
        captures.display().to_string(),
        replay.display().to_string(),
    );
    let task = TaskConfig::load(write_task(dir.path(), &body)).unwrap();
    assert!(task.table);
    assert_eq!(task.sources.len(), 3);

    let table = Arc::new(Table::new());
    let (runtime, sources) = build_sources(&task, &table);
    for (source, entry) in sources.iter().zip(&task.sources) {
        source.request(entry.query.clone(), true).unwrap();
    }
    for source in &sources {
        assert!(source.join(Some(test_timeout())));
        assert_eq!(source.state(), SourceState::Completed, "{}", source.description());
    }
    runtime.cleanup_all();

    assert_eq!(
        table.channels(),
        vec!["X", "Y", "archive:BPM", "counter"]
    );
    let archive = table.rows("archive:BPM");
    assert_eq!(archive.len(), 4);
    assert_eq!(archive[3].value, Value::Float(4.5));
    assert_eq!(table.rows("X").len(), 2);
    assert_eq!(table.rows("Y").len(), 1);
    assert_eq!(table.rows("counter").len(), 4);

    let merged = table.merged(TableIndex::Id);
    assert_eq!(merged.columns.len(), 4);
    assert!(!merged.rows.is_empty());
}

#[test]
fn test_missing_capture_fails_source() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!(
        r#"
        [[sources]]
        adapter = {{ type = "daqbuf", directory = {:?}, delay = 0.0 }}
        query = {{ channels = ["NOPE"] }}
        "#,
        dir.path().display().to_string(),
    );
    let task = TaskConfig::load(write_task(dir.path(), &body)).unwrap();
    let table = Arc::new(Table::new());
    let (_runtime, sources) = build_sources(&task, &table);

    let err = sources[0]
        .request(task.sources[0].query.clone(), false)
        .unwrap_err();
    assert!(err.to_string().contains("NOPE"));
    assert_eq!(sources[0].state(), SourceState::Failed);
    assert!(table.is_empty());
}

#[test]
fn test_unknown_source_type_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let body = r#"
        [[sources]]
        adapter = { type = "carrier-pigeon" }
    "#;
    let err = TaskConfig::load(write_task(dir.path(), body)).unwrap_err();
    assert!(matches!(err, DataHubError::Config(_)));
}

#[test]
fn test_bus_without_replay_cannot_be_created() {
    let dir = tempfile::tempdir().unwrap();
    let body = r#"
        [[sources]]
        adapter = { type = "bus", url = "tcp://localhost:9999" }
    "#;
    let task = TaskConfig::load(write_task(dir.path(), body)).unwrap();
    assert!(matches!(
        create_source(&task.sources[0].adapter),
        Err(DataHubError::Config(_))
    ));
}
