//! Provenance persistence
//!
//! Every saved result is written twice: an immutable timestamped snapshot
//! and a "latest" pointer that is atomically repointed at it. Later saves
//! of the same logical artifact create a new snapshot and repoint
//! "latest"; history is never overwritten. Each file carries a metadata
//! envelope with the run identifier, a generated timestamp, and a SHA-256
//! fingerprint of the canonicalized payload so downstream audit tooling
//! can verify what it reads.
//!
//! Write failures propagate to the caller uncaught: a provenance failure
//! must never be silently swallowed.

use crate::run::RunContext;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors that can occur while persisting provenance artifacts
#[derive(Error, Debug)]
pub enum ProvenanceError {
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("destination has no file stem: {0}")]
    InvalidDestination(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for provenance operations
pub type Result<T> = std::result::Result<T, ProvenanceError>;

/// Metadata envelope wrapped around every persisted payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactEnvelope {
    /// Identifier of the run that produced the payload (None outside a run)
    pub run_id: Option<String>,
    /// Milliseconds since UNIX epoch when the artifact was generated
    pub generated_at_ms: u64,
    /// SHA-256 hex fingerprint of the canonicalized payload
    pub fingerprint: String,
    /// Version of semilla that wrote the artifact
    pub semilla_version: String,
    /// The payload itself
    pub payload: serde_json::Value,
}

impl ArtifactEnvelope {
    /// Recompute the payload fingerprint and compare it to the recorded
    /// one. Audit tooling calls this after reading a "latest" file.
    pub fn verify(&self) -> bool {
        fingerprint_value(&self.payload) == self.fingerprint
    }
}

/// Paths and fingerprint of a completed save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedArtifact {
    /// Immutable timestamped snapshot
    pub snapshot_path: PathBuf,
    /// Mutable "latest" pointer, repointed atomically
    pub latest_path: PathBuf,
    /// SHA-256 hex fingerprint of the canonicalized payload
    pub fingerprint: String,
    /// Run identifier embedded in the envelope, if a run was active
    pub run_id: Option<String>,
    /// Generation timestamp in milliseconds since UNIX epoch
    pub generated_at_ms: u64,
}

/// Writes versioned result snapshots and run manifests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProvenanceWriter;

impl ProvenanceWriter {
    pub fn new() -> Self {
        ProvenanceWriter
    }

    /// Persist `payload` at the logical path `destination`.
    ///
    /// Writes `<stem>.<timestamp>.<hash8>.json` (never overwritten) next
    /// to `destination` and repoints `<stem>.latest.json` at the same
    /// envelope via a temp-file rename. Returns both paths.
    pub fn save<T: Serialize>(
        &self,
        payload: &T,
        destination: impl AsRef<Path>,
    ) -> Result<SavedArtifact> {
        let destination = destination.as_ref();
        let stem = destination
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ProvenanceError::InvalidDestination(destination.display().to_string()))?
            .to_string();
        let dir = destination.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        let value = serde_json::to_value(payload)?;
        let fingerprint = fingerprint_value(&value);
        let generated_at_ms = now_ms();
        let run_id = crate::run::active_run_id();

        let envelope = ArtifactEnvelope {
            run_id: run_id.clone(),
            generated_at_ms,
            fingerprint: fingerprint.clone(),
            semilla_version: env!("CARGO_PKG_VERSION").to_string(),
            payload: value,
        };
        let rendered = serde_json::to_string_pretty(&envelope)?;

        let snapshot_path =
            write_snapshot(dir, &stem, generated_at_ms, &fingerprint, &rendered)?;

        let latest_path = dir.join(format!("{stem}.latest.json"));
        write_atomic(&latest_path, &rendered)?;

        tracing::debug!(
            snapshot = %snapshot_path.display(),
            fingerprint = %fingerprint,
            "provenance snapshot written"
        );

        Ok(SavedArtifact {
            snapshot_path,
            latest_path,
            fingerprint,
            run_id,
            generated_at_ms,
        })
    }

    /// Persist a run manifest keyed by run identifier into `dir`.
    ///
    /// Consumed by repair/audit tooling that reconciles run status against
    /// manifest files.
    pub fn save_run(&self, run: &RunContext, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let path = dir.join(format!("run-{}.json", run.run_id));
        let rendered = serde_json::to_string_pretty(run)?;
        write_atomic(&path, &rendered)?;
        Ok(path)
    }
}

/// SHA-256 hex fingerprint of a JSON value in canonical form.
///
/// serde_json object maps are BTreeMap-backed, so compact serialization of
/// a `Value` is already key-sorted and canonical.
pub fn fingerprint_value(value: &serde_json::Value) -> String {
    let canonical = value.to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Write the snapshot with create-new semantics so an existing snapshot is
/// never mutated. Same-millisecond saves of identical content get a
/// numbered suffix.
fn write_snapshot(
    dir: &Path,
    stem: &str,
    generated_at_ms: u64,
    fingerprint: &str,
    rendered: &str,
) -> Result<PathBuf> {
    let hash8 = &fingerprint[..8];
    for attempt in 0u32.. {
        let name = if attempt == 0 {
            format!("{stem}.{generated_at_ms}.{hash8}.json")
        } else {
            format!("{stem}.{generated_at_ms}.{hash8}-{attempt}.json")
        };
        let path = dir.join(name);
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(rendered.as_bytes())?;
                return Ok(path);
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err.into()),
        }
    }
    unreachable!("snapshot suffix space exhausted")
}

/// Temp-file write plus rename, so readers of the target never observe a
/// partial file.
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Lightweight timestamp without chrono dependency
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_save_writes_snapshot_and_latest() {
        let tmp = TempDir::new().unwrap();
        let writer = ProvenanceWriter::new();

        let payload = json!({"statistic": 0.41, "n": 1000});
        let saved = writer
            .save(&payload, tmp.path().join("results.json"))
            .unwrap();

        assert!(saved.snapshot_path.exists());
        assert!(saved.latest_path.exists());
        assert!(saved
            .latest_path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .contains("latest"));

        let envelope: ArtifactEnvelope =
            serde_json::from_str(&fs::read_to_string(&saved.latest_path).unwrap()).unwrap();
        assert_eq!(envelope.fingerprint, saved.fingerprint);
        assert_eq!(envelope.payload, payload);
        assert!(envelope.verify());
    }

    #[test]
    fn test_second_save_keeps_history() {
        let tmp = TempDir::new().unwrap();
        let writer = ProvenanceWriter::new();
        let dest = tmp.path().join("metric.json");

        let first = writer.save(&json!({"v": 1}), &dest).unwrap();
        let second = writer.save(&json!({"v": 2}), &dest).unwrap();

        assert_ne!(first.snapshot_path, second.snapshot_path);
        assert!(first.snapshot_path.exists());
        assert!(second.snapshot_path.exists());
        assert_eq!(first.latest_path, second.latest_path);

        // First snapshot still holds the first payload
        let old: ArtifactEnvelope =
            serde_json::from_str(&fs::read_to_string(&first.snapshot_path).unwrap()).unwrap();
        assert_eq!(old.payload, json!({"v": 1}));

        // Latest points at the second payload
        let latest: ArtifactEnvelope =
            serde_json::from_str(&fs::read_to_string(&second.latest_path).unwrap()).unwrap();
        assert_eq!(latest.payload, json!({"v": 2}));
        assert_eq!(latest.fingerprint, second.fingerprint);
    }

    #[test]
    fn test_identical_payload_same_fingerprint() {
        let a = fingerprint_value(&json!({"b": 2, "a": 1}));
        let b = fingerprint_value(&json!({"a": 1, "b": 2}));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_distinct_payloads_distinct_fingerprints() {
        let a = fingerprint_value(&json!({"a": 1}));
        let b = fingerprint_value(&json!({"a": 2}));
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_envelope_fails_verification() {
        let payload = json!({"observed": 0.7});
        let mut envelope = ArtifactEnvelope {
            run_id: None,
            generated_at_ms: 0,
            fingerprint: fingerprint_value(&payload),
            semilla_version: env!("CARGO_PKG_VERSION").to_string(),
            payload,
        };
        assert!(envelope.verify());

        envelope.payload = json!({"observed": 0.9});
        assert!(!envelope.verify());
    }

    #[test]
    fn test_save_run_manifest() {
        let tmp = TempDir::new().unwrap();
        let manager = crate::run::RunManager::new();
        let run = manager
            .start_run(crate::run::RunConfig::with_seed(42))
            .unwrap();
        let ended = manager.end_run(crate::run::RunStatus::Success).unwrap();

        let path = ProvenanceWriter::new().save_run(&ended, tmp.path()).unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with(&format!("run-{}", run.run_id)));

        let back: RunContext =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, ended);
    }

    #[test]
    fn test_unwritable_destination_propagates() {
        let tmp = TempDir::new().unwrap();
        // Make the parent a regular file so create_dir_all fails
        let blocker = tmp.path().join("blocker");
        fs::write(&blocker, "not a directory").unwrap();

        let writer = ProvenanceWriter::new();
        let result = writer.save(&json!({"x": 1}), blocker.join("out.json"));
        assert!(matches!(result, Err(ProvenanceError::Io(_))));
    }

    #[test]
    fn test_destination_without_stem_rejected() {
        let writer = ProvenanceWriter::new();
        let result = writer.save(&json!({}), "..");
        assert!(matches!(result, Err(ProvenanceError::InvalidDestination(_))));
    }
}
