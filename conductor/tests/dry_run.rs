//! Dry-run schedule preview over an in-memory store.

use std::fs;

use conductor::core::types::TaskStatus;
use conductor::decompose::EmptySelectorError;
use conductor::io::config::Config;
use conductor::status::{SelectorRequiredError, dry_run};
use conductor::test_support::{MemoryStore, task};

fn fixture() -> (tempfile::TempDir, Config, MemoryStore, std::path::PathBuf) {
    let temp = tempfile::tempdir().expect("tempdir");
    let spec = temp.path().join("spec.md");
    fs::write(&spec, "# spec\n").expect("write");
    let config = Config {
        state_root: temp.path().join("state").display().to_string(),
        ..Config::default()
    };
    (temp, config, MemoryStore::new(), spec)
}

fn seed(store: &MemoryStore) {
    // base unblocks two tasks; leaf unblocks none.
    let mut base = task("base", TaskStatus::Open, &["mid", "leaf"]);
    base.labels = vec!["batch".to_string()];
    store.insert(base);
    let mut mid = task("mid", TaskStatus::Open, &[]);
    mid.labels = vec!["batch".to_string()];
    store.insert(mid);
    let mut leaf = task("leaf", TaskStatus::Open, &[]);
    leaf.labels = vec!["batch".to_string()];
    store.insert(leaf);
}

#[test]
fn reports_schedule_in_assignment_order() {
    let (_temp, config, store, spec) = fixture();
    seed(&store);

    let report = dry_run(&config, &store, &spec, "main", true, Some("batch")).expect("dry run");
    assert_eq!(report.task_count, 3);
    assert!(report.cycles.is_empty());
    assert!(report.deadlocks.is_empty());
    assert!(report.target_branch.starts_with("conductor/run-"));

    // Only "base" is ready; "mid" and "leaf" wait behind its edges.
    let scheduled: Vec<&str> = report.schedule.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(scheduled, vec!["base"]);
    assert_eq!(report.schedule[0].impact_depth, 2);
    assert_eq!(report.blocked.len(), 2);
}

#[test]
fn repeated_dry_runs_are_identical() {
    let (_temp, config, store, spec) = fixture();
    seed(&store);

    let first = dry_run(&config, &store, &spec, "main", false, Some("batch")).expect("dry run");
    let second = dry_run(&config, &store, &spec, "main", false, Some("batch")).expect("dry run");
    assert_eq!(first, second);
}

#[test]
fn cycles_are_reported_not_fatal() {
    let (_temp, config, store, spec) = fixture();
    let mut a = task("a", TaskStatus::Open, &["b"]);
    a.labels = vec!["batch".to_string()];
    store.insert(a);
    let mut b = task("b", TaskStatus::Open, &["a"]);
    b.labels = vec!["batch".to_string()];
    store.insert(b);

    let report = dry_run(&config, &store, &spec, "main", false, Some("batch")).expect("dry run");
    assert_eq!(report.cycles.len(), 1);
    assert!(report.schedule.is_empty());
}

#[test]
fn selector_is_required() {
    let (_temp, config, store, spec) = fixture();
    let err = dry_run(&config, &store, &spec, "main", false, None).expect_err("must fail");
    assert!(err.downcast_ref::<SelectorRequiredError>().is_some());
}

#[test]
fn empty_selector_match_is_a_hard_error() {
    let (_temp, config, store, spec) = fixture();
    let err = dry_run(&config, &store, &spec, "main", false, Some("nothing"))
        .expect_err("must fail");
    assert!(err.downcast_ref::<EmptySelectorError>().is_some());
}
