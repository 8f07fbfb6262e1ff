//! Semilla - reproducible statistical-inference substrate
//!
//! This library provides the deterministic-execution machinery that
//! experiment pipelines are built on top of: seed-derived identifiers,
//! governed randomness with an auditable seed ledger, thread-scoped run
//! lifecycle with provenance manifests, and a permutation-based
//! hypothesis-testing engine.

pub mod governor;
pub mod id_service;
pub mod permutation;
pub mod provenance;
pub mod run;

pub use governor::{GovernedRng, GovernorError, RandomnessGovernor, SeedLedgerEntry, Zone};
pub use id_service::DeterministicIdGenerator;
pub use permutation::{
    CancelToken, Determination, NullDistributionSummary, PermutationConfig, PermutationEngine,
    PermutationTestSpec, Tail, TestOutcome,
};
pub use provenance::{ProvenanceError, ProvenanceWriter, SavedArtifact};
pub use run::{RunConfig, RunContext, RunError, RunManager, RunScope, RunStatus};
