//! Deterministic identifier derivation
//!
//! Every identifier in a run traces back to exactly one seed. A
//! [`DeterministicIdGenerator`] derives fixed-width identifiers from
//! (seed, counter, namespace, context) via SHA-256, so two generators
//! constructed with the same seed and driven through the same call
//! sequence produce identical identifiers across processes and time.
//!
//! # Example
//!
//! ```
//! use semilla::id_service::DeterministicIdGenerator;
//!
//! let mut a = DeterministicIdGenerator::new(42);
//! let mut b = DeterministicIdGenerator::new(42);
//! assert_eq!(a.next_id("trial"), b.next_id("trial"));
//! ```

use sha2::{Digest, Sha256};

/// Deterministic generator of fixed-width identifiers.
///
/// Owns a monotonic call counter; the counter is an observable side effect
/// of `next_id`/`next_uuid`. One generator instance belongs to one logical
/// owner - hand concurrent consumers their own instance via [`fork`].
///
/// [`fork`]: DeterministicIdGenerator::fork
#[derive(Debug, Clone)]
pub struct DeterministicIdGenerator {
    seed: u64,
    counter: u64,
    namespace: String,
}

impl DeterministicIdGenerator {
    /// Create a root generator for the given seed.
    pub fn new(seed: u64) -> Self {
        DeterministicIdGenerator {
            seed,
            counter: 0,
            namespace: String::new(),
        }
    }

    /// The seed this generator derives from.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Current value of the monotonic call counter.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Namespace path accumulated through forks (empty for a root generator).
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Return the next identifier for `context` as a 32-char hex string.
    ///
    /// Increments the counter. Identical (seed, counter, namespace, context)
    /// inputs always produce identical outputs.
    pub fn next_id(&mut self, context: &str) -> String {
        let digest = self.next_digest(context);
        hex::encode(&digest[..16])
    }

    /// Return the next identifier for `context` in canonical UUID layout.
    ///
    /// Same derivation as [`next_id`], reformatted with the version nibble
    /// set to 4 and the RFC 4122 variant bits set, so downstream tooling
    /// that expects UUID-shaped strings accepts it.
    ///
    /// [`next_id`]: DeterministicIdGenerator::next_id
    pub fn next_uuid(&mut self, context: &str) -> String {
        let digest = self.next_digest(context);
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;

        let h = hex::encode(bytes);
        format!(
            "{}-{}-{}-{}-{}",
            &h[0..8],
            &h[8..12],
            &h[12..16],
            &h[16..20],
            &h[20..32]
        )
    }

    /// Derive an independent child generator for `namespace`.
    ///
    /// The child is seeded from the parent's seed combined with the
    /// namespace label, owns its own zero-based counter, and never reads or
    /// mutates the parent's counter. Forks with different namespace labels
    /// never produce colliding identifiers for the same counter value
    /// because the namespace path participates in every digest.
    pub fn fork(&self, namespace: &str) -> DeterministicIdGenerator {
        let mut hasher = Sha256::new();
        hasher.update(b"semilla.fork");
        hasher.update(self.seed.to_le_bytes());
        update_framed(&mut hasher, self.namespace.as_bytes());
        update_framed(&mut hasher, namespace.as_bytes());
        let digest = hasher.finalize();

        let mut seed_bytes = [0u8; 8];
        seed_bytes.copy_from_slice(&digest[..8]);

        let child_namespace = if self.namespace.is_empty() {
            namespace.to_string()
        } else {
            format!("{}/{}", self.namespace, namespace)
        };

        DeterministicIdGenerator {
            seed: u64::from_le_bytes(seed_bytes),
            counter: 0,
            namespace: child_namespace,
        }
    }

    /// Reset the counter to zero so the generator replays its exact
    /// original sequence. Used to produce identical fixtures across
    /// independent executions.
    pub fn reset(&mut self) {
        self.counter = 0;
    }

    fn next_digest(&mut self, context: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"semilla.id");
        hasher.update(self.seed.to_le_bytes());
        hasher.update(self.counter.to_le_bytes());
        update_framed(&mut hasher, self.namespace.as_bytes());
        update_framed(&mut hasher, context.as_bytes());
        self.counter += 1;
        hasher.finalize().into()
    }
}

/// Length-prefix variable-width fields so ("ab", "c") and ("a", "bc") hash
/// differently.
fn update_framed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}
