//! Run lifecycle management
//!
//! One experiment execution is a *run*: a seed, a derived run identifier,
//! a configuration snapshot, and an environment snapshot, scoped to the
//! thread that started it. Exactly one run may be active per thread at a
//! time; starting a second one is a logic error, never a silent
//! replacement.
//!
//! Seeds are explicit. Outside strict mode a missing seed falls back to a
//! timestamp-derived value and the run manifest carries `unseeded: true`
//! so audits can detect the reproducibility gap. With
//! `SEMILLA_STRICT_REPRO=1` in the environment, an unseeded start is a
//! fatal error instead.

use crate::id_service::DeterministicIdGenerator;
use crate::provenance::ProvenanceWriter;
use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::hash::Hasher;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Environment variable selecting strict-reproducibility mode.
pub const STRICT_REPRO_ENV: &str = "SEMILLA_STRICT_REPRO";

/// Errors raised by the run lifecycle
#[derive(Error, Debug)]
pub enum RunError {
    #[error("a run is already active on this thread: {run_id}")]
    ReentrantRun { run_id: String },

    #[error("no seed supplied and {STRICT_REPRO_ENV} is set: unseeded runs are fatal in strict mode")]
    MissingSeed,

    #[error("no active run on this thread")]
    NoActiveRun,

    #[error("failed to persist run manifest: {0}")]
    Manifest(#[from] crate::provenance::ProvenanceError),
}

/// Result type for run lifecycle operations
pub type Result<T> = std::result::Result<T, RunError>;

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

/// Configuration accepted at run start.
///
/// `seed` is the root of all derived determinism for the run; `params`
/// carries arbitrary analyzer-specific settings into the manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl RunConfig {
    /// Configuration with an explicit seed.
    pub fn with_seed(seed: u64) -> Self {
        RunConfig {
            seed: Some(seed),
            params: BTreeMap::new(),
        }
    }

    /// Add an analyzer-specific parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// The state of one in-progress experiment execution, thread-scoped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    /// Run identifier derived from (seed, process nonce, thread identity)
    pub run_id: String,
    /// Root seed for the run
    pub seed: u64,
    /// Process-level nonce mixed into the run identifier
    pub nonce: u64,
    /// True when the seed was a timestamp-derived fallback
    pub unseeded: bool,
    /// Configuration snapshot taken at start
    pub config: RunConfig,
    /// Environment fingerprints for later comparison
    pub environment: BTreeMap<String, String>,
    /// Milliseconds since UNIX epoch at start
    pub started_at_ms: u64,
    /// Milliseconds since UNIX epoch at end (None while running)
    pub ended_at_ms: Option<u64>,
    /// Current lifecycle status
    pub status: RunStatus,
}

thread_local! {
    static ACTIVE_RUN: RefCell<Option<RunContext>> = const { RefCell::new(None) };
}

/// Seed of the calling thread's active run, if any.
pub fn active_seed() -> Option<u64> {
    ACTIVE_RUN.with(|slot| slot.borrow().as_ref().map(|run| run.seed))
}

/// Run identifier of the calling thread's active run, if any.
pub fn active_run_id() -> Option<String> {
    ACTIVE_RUN.with(|slot| slot.borrow().as_ref().map(|run| run.run_id.clone()))
}

/// Snapshot of the calling thread's active run, if any.
pub fn active_run() -> Option<RunContext> {
    ACTIVE_RUN.with(|slot| slot.borrow().clone())
}

/// Owns the start/end discipline for runs and persists their manifests.
#[derive(Debug, Clone, Default)]
pub struct RunManager {
    manifest_dir: Option<PathBuf>,
}

impl RunManager {
    /// Manager that keeps manifests in memory only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager that writes a run manifest into `dir` when each run ends.
    pub fn with_manifest_dir(dir: impl Into<PathBuf>) -> Self {
        RunManager {
            manifest_dir: Some(dir.into()),
        }
    }

    /// Start a run on the calling thread.
    ///
    /// Fails with [`RunError::ReentrantRun`] if a run is already active,
    /// and with [`RunError::MissingSeed`] when no seed is supplied in
    /// strict-reproducibility mode.
    pub fn start_run(&self, config: RunConfig) -> Result<RunContext> {
        if let Some(run_id) = active_run_id() {
            return Err(RunError::ReentrantRun { run_id });
        }

        let (seed, unseeded) = match config.seed {
            Some(seed) => (seed, false),
            None if strict_mode() => return Err(RunError::MissingSeed),
            None => (now_nanos() as u64, true),
        };

        let nonce = process_nonce();
        let run_id = DeterministicIdGenerator::new(seed)
            .fork(&format!("nonce:{nonce:016x}"))
            .fork(&format!("thread:{:?}", std::thread::current().id()))
            .next_uuid("run");

        if unseeded {
            tracing::warn!(%run_id, "run started without an explicit seed; result is not reproducible");
        }

        let run = RunContext {
            run_id,
            seed,
            nonce,
            unseeded,
            config,
            environment: environment_snapshot(),
            started_at_ms: now_ms(),
            ended_at_ms: None,
            status: RunStatus::Running,
        };

        ACTIVE_RUN.with(|slot| *slot.borrow_mut() = Some(run.clone()));
        Ok(run)
    }

    /// Finalize the calling thread's active run and detach it.
    ///
    /// Persists the run manifest if the manager was given a manifest
    /// directory; manifest write failures propagate, never swallowed.
    pub fn end_run(&self, status: RunStatus) -> Result<RunContext> {
        let mut run = ACTIVE_RUN
            .with(|slot| slot.borrow_mut().take())
            .ok_or(RunError::NoActiveRun)?;

        run.status = status;
        run.ended_at_ms = Some(now_ms());

        if let Some(dir) = &self.manifest_dir {
            ProvenanceWriter::new().save_run(&run, dir)?;
        }

        Ok(run)
    }

    /// Run `f` inside a run scope.
    ///
    /// The run ends with `Success` when `f` returns `Ok` and `Failed` when
    /// it returns `Err`; it is always closed.
    pub fn with_run<T>(
        &self,
        config: RunConfig,
        f: impl FnOnce(&RunContext) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let run = self.start_run(config)?;
        match f(&run) {
            Ok(value) => {
                self.end_run(RunStatus::Success)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(end_err) = self.end_run(RunStatus::Failed) {
                    tracing::warn!(error = %end_err, "failed to close run after error");
                }
                Err(err)
            }
        }
    }
}

/// RAII form of the run lifecycle.
///
/// Entering starts the run; dropping the scope ends it as `Failed` unless
/// [`complete`](RunScope::complete) was called, so a run is never left
/// open or wrongly marked successful after an early return or panic.
#[derive(Debug)]
pub struct RunScope<'m> {
    manager: &'m RunManager,
    run: RunContext,
    completed: bool,
    _not_send: PhantomData<*const ()>,
}

impl<'m> RunScope<'m> {
    /// Start a run owned by this scope.
    pub fn enter(manager: &'m RunManager, config: RunConfig) -> Result<RunScope<'m>> {
        let run = manager.start_run(config)?;
        Ok(RunScope {
            manager,
            run,
            completed: false,
            _not_send: PhantomData,
        })
    }

    /// Snapshot of the run as started.
    pub fn run(&self) -> &RunContext {
        &self.run
    }

    /// End the run with `Success` and return the finalized context.
    pub fn complete(mut self) -> Result<RunContext> {
        self.completed = true;
        self.manager.end_run(RunStatus::Success)
    }
}

impl Drop for RunScope<'_> {
    fn drop(&mut self) {
        if !self.completed {
            if let Err(err) = self.manager.end_run(RunStatus::Failed) {
                tracing::warn!(error = %err, "failed to close abandoned run scope");
            }
        }
    }
}

fn strict_mode() -> bool {
    std::env::var(STRICT_REPRO_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Process-level nonce so concurrent runs sharing a seed never collide.
fn process_nonce() -> u64 {
    static NONCE: OnceLock<u64> = OnceLock::new();
    *NONCE.get_or_init(|| {
        let mut hasher = FnvHasher::default();
        hasher.write_u32(std::process::id());
        hasher.write_u128(now_nanos());
        hasher.finish()
    })
}

fn environment_snapshot() -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert(
        "semilla_version".to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    );
    env.insert("os".to_string(), std::env::consts::OS.to_string());
    env.insert("arch".to_string(), std::env::consts::ARCH.to_string());
    env.insert("pid".to_string(), std::process::id().to_string());
    env.insert("strict_repro".to_string(), strict_mode().to_string());
    env
}

/// Lightweight timestamp without chrono dependency
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_start_and_end_run() {
        let manager = RunManager::new();
        let run = manager.start_run(RunConfig::with_seed(42)).unwrap();

        assert_eq!(run.seed, 42);
        assert!(!run.unseeded);
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(active_run_id(), Some(run.run_id.clone()));
        assert_eq!(active_seed(), Some(42));

        let ended = manager.end_run(RunStatus::Success).unwrap();
        assert_eq!(ended.status, RunStatus::Success);
        assert!(ended.ended_at_ms.is_some());
        assert!(active_run_id().is_none());
    }

    #[test]
    fn test_reentrant_start_fails() {
        let manager = RunManager::new();
        let run = manager.start_run(RunConfig::with_seed(1)).unwrap();

        match manager.start_run(RunConfig::with_seed(2)) {
            Err(RunError::ReentrantRun { run_id }) => assert_eq!(run_id, run.run_id),
            other => panic!("expected ReentrantRun, got {other:?}"),
        }

        manager.end_run(RunStatus::Failed).unwrap();
        // After end_run, starting again succeeds
        manager.start_run(RunConfig::with_seed(2)).unwrap();
        manager.end_run(RunStatus::Success).unwrap();
    }

    #[test]
    fn test_end_without_active_run() {
        let manager = RunManager::new();
        assert!(matches!(
            manager.end_run(RunStatus::Success),
            Err(RunError::NoActiveRun)
        ));
    }

    #[test]
    #[serial]
    fn test_unseeded_fallback_is_flagged() {
        std::env::remove_var(STRICT_REPRO_ENV);
        let manager = RunManager::new();
        let run = manager.start_run(RunConfig::default()).unwrap();

        assert!(run.unseeded);
        manager.end_run(RunStatus::Success).unwrap();
    }

    #[test]
    #[serial]
    fn test_strict_mode_rejects_unseeded() {
        std::env::set_var(STRICT_REPRO_ENV, "1");
        let manager = RunManager::new();
        let result = manager.start_run(RunConfig::default());
        std::env::remove_var(STRICT_REPRO_ENV);

        assert!(matches!(result, Err(RunError::MissingSeed)));
        assert!(active_run_id().is_none());
    }

    #[test]
    #[serial]
    fn test_strict_mode_accepts_explicit_seed() {
        std::env::set_var(STRICT_REPRO_ENV, "true");
        let manager = RunManager::new();
        let run = manager.start_run(RunConfig::with_seed(9)).unwrap();
        std::env::remove_var(STRICT_REPRO_ENV);

        assert!(!run.unseeded);
        manager.end_run(RunStatus::Success).unwrap();
    }

    #[test]
    fn test_with_run_success_and_failure() {
        let manager = RunManager::new();

        let value = manager
            .with_run(RunConfig::with_seed(3), |run| {
                assert_eq!(run.status, RunStatus::Running);
                Ok(10)
            })
            .unwrap();
        assert_eq!(value, 10);
        assert!(active_run_id().is_none());

        let err = manager
            .with_run(RunConfig::with_seed(3), |_| -> anyhow::Result<()> {
                anyhow::bail!("analyzer blew up")
            })
            .unwrap_err();
        assert!(err.to_string().contains("analyzer blew up"));
        assert!(active_run_id().is_none());
    }

    #[test]
    fn test_scope_drop_marks_failed() {
        let manager = RunManager::new();
        {
            let scope = RunScope::enter(&manager, RunConfig::with_seed(4)).unwrap();
            assert_eq!(scope.run().seed, 4);
            // Dropped without complete()
        }
        assert!(active_run_id().is_none());
    }

    #[test]
    fn test_scope_complete_marks_success() {
        let manager = RunManager::new();
        let scope = RunScope::enter(&manager, RunConfig::with_seed(5)).unwrap();
        let run = scope.complete().unwrap();

        assert_eq!(run.status, RunStatus::Success);
        assert!(active_run_id().is_none());
    }

    #[test]
    fn test_same_seed_distinct_run_ids_across_threads() {
        let manager = RunManager::new();
        let here = manager.start_run(RunConfig::with_seed(42)).unwrap();

        let other_manager = manager.clone();
        let there = std::thread::spawn(move || {
            let run = other_manager.start_run(RunConfig::with_seed(42)).unwrap();
            other_manager.end_run(RunStatus::Success).unwrap();
            run.run_id
        })
        .join()
        .unwrap();

        assert_ne!(here.run_id, there);
        manager.end_run(RunStatus::Success).unwrap();
    }

    #[test]
    fn test_environment_snapshot_contents() {
        let manager = RunManager::new();
        let run = manager.start_run(RunConfig::with_seed(1)).unwrap();

        assert!(run.environment.contains_key("semilla_version"));
        assert!(run.environment.contains_key("os"));
        assert!(run.environment.contains_key("arch"));
        assert!(run.environment.contains_key("pid"));

        manager.end_run(RunStatus::Success).unwrap();
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = RunConfig::with_seed(42)
            .with_param("corpus", "toy")
            .with_param("n_permutations", 1000);

        let json = serde_json::to_string(&config).unwrap();
        let back: RunConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
