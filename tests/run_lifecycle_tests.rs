// Run exclusivity, strict-reproducibility mode, and manifest persistence.

use semilla::run::{
    active_run_id, RunConfig, RunError, RunManager, RunScope, RunStatus, STRICT_REPRO_ENV,
};
use serial_test::serial;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_run_exclusivity_per_thread() {
    let manager = RunManager::new();
    manager.start_run(RunConfig::with_seed(42)).unwrap();

    assert!(matches!(
        manager.start_run(RunConfig::with_seed(42)),
        Err(RunError::ReentrantRun { .. })
    ));

    manager.end_run(RunStatus::Success).unwrap();

    // After end_run, start_run succeeds again
    manager.start_run(RunConfig::with_seed(42)).unwrap();
    manager.end_run(RunStatus::Success).unwrap();
}

#[test]
fn test_concurrent_runs_have_their_own_context() {
    let manager = RunManager::new();
    let run = manager.start_run(RunConfig::with_seed(1)).unwrap();

    let other = manager.clone();
    let other_id = std::thread::spawn(move || {
        // The other thread is not blocked by this thread's active run
        let run = other.start_run(RunConfig::with_seed(1)).unwrap();
        other.end_run(RunStatus::Success).unwrap();
        run.run_id
    })
    .join()
    .unwrap();

    assert_ne!(run.run_id, other_id);
    manager.end_run(RunStatus::Success).unwrap();
}

#[test]
fn test_manifest_written_at_end() {
    let tmp = TempDir::new().unwrap();
    let manager = RunManager::with_manifest_dir(tmp.path());

    let run = manager
        .start_run(RunConfig::with_seed(42).with_param("analyzer", "rank_test"))
        .unwrap();
    let ended = manager.end_run(RunStatus::Success).unwrap();

    let manifest_path = tmp.path().join(format!("run-{}.json", run.run_id));
    assert!(manifest_path.exists());

    let manifest: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&manifest_path).unwrap()).unwrap();
    assert_eq!(manifest["run_id"], run.run_id.as_str());
    assert_eq!(manifest["status"], "success");
    assert_eq!(manifest["seed"], 42);
    assert_eq!(manifest["unseeded"], false);
    assert_eq!(manifest["config"]["params"]["analyzer"], "rank_test");
    assert_eq!(ended.status, RunStatus::Success);
}

#[test]
#[serial]
fn test_unseeded_run_flagged_in_manifest() {
    std::env::remove_var(STRICT_REPRO_ENV);
    let tmp = TempDir::new().unwrap();
    let manager = RunManager::with_manifest_dir(tmp.path());

    let run = manager.start_run(RunConfig::default()).unwrap();
    manager.end_run(RunStatus::Success).unwrap();

    let manifest: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(tmp.path().join(format!("run-{}.json", run.run_id))).unwrap(),
    )
    .unwrap();
    assert_eq!(manifest["unseeded"], true);
}

#[test]
#[serial]
fn test_strict_mode_makes_unseeded_start_fatal() {
    std::env::set_var(STRICT_REPRO_ENV, "1");
    let manager = RunManager::new();
    let result = manager.start_run(RunConfig::default());
    std::env::remove_var(STRICT_REPRO_ENV);

    assert!(matches!(result, Err(RunError::MissingSeed)));
    assert!(active_run_id().is_none());
}

#[test]
fn test_failed_closure_never_marks_success() {
    let tmp = TempDir::new().unwrap();
    let manager = RunManager::with_manifest_dir(tmp.path());

    let run_id = std::cell::RefCell::new(String::new());
    let err = manager
        .with_run(RunConfig::with_seed(3), |run| -> anyhow::Result<()> {
            *run_id.borrow_mut() = run.run_id.clone();
            anyhow::bail!("permutation scorer failed")
        })
        .unwrap_err();
    assert!(err.to_string().contains("scorer failed"));

    let manifest: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(tmp.path().join(format!("run-{}.json", run_id.borrow()))).unwrap(),
    )
    .unwrap();
    assert_eq!(manifest["status"], "failed");
}

#[test]
fn test_scope_guard_closes_run_on_early_return() {
    let tmp = TempDir::new().unwrap();
    let manager = RunManager::with_manifest_dir(tmp.path());

    let run_id = {
        let scope = RunScope::enter(&manager, RunConfig::with_seed(4)).unwrap();
        scope.run().run_id.clone()
        // scope dropped without complete()
    };

    assert!(active_run_id().is_none());
    let manifest: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(tmp.path().join(format!("run-{run_id}.json"))).unwrap(),
    )
    .unwrap();
    assert_eq!(manifest["status"], "failed");
}

#[test]
fn test_scope_complete_records_success() {
    let tmp = TempDir::new().unwrap();
    let manager = RunManager::with_manifest_dir(tmp.path());

    let scope = RunScope::enter(&manager, RunConfig::with_seed(5)).unwrap();
    let run = scope.complete().unwrap();

    assert_eq!(run.status, RunStatus::Success);
    assert!(tmp
        .path()
        .join(format!("run-{}.json", run.run_id))
        .exists());
}

#[test]
fn test_environment_fingerprint_is_captured() {
    let manager = RunManager::new();
    let run = manager.start_run(RunConfig::with_seed(1)).unwrap();
    manager.end_run(RunStatus::Success).unwrap();

    assert_eq!(
        run.environment.get("semilla_version").map(String::as_str),
        Some(env!("CARGO_PKG_VERSION"))
    );
    assert!(run.environment.contains_key("os"));
    assert!(run.environment.contains_key("arch"));
}
