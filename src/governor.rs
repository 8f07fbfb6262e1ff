//! Randomness governance
//!
//! Enforces the two-mode randomness discipline every analyzer in the
//! pipeline runs under: either randomness is forbidden outright, or it is
//! permitted but must be seeded and logged. The current mode (the *zone*)
//! is tracked per thread; entering a zone returns a guard that restores the
//! prior zone on drop, so nesting is strictly last-in-first-out and
//! panic-safe.
//!
//! All randomness flows through the [`GovernedRng`] facade, which checks
//! the calling thread's zone on every primitive call. There is no way to
//! obtain raw randomness from this crate without passing the check.
//!
//! # Example
//!
//! ```
//! use semilla::governor::RandomnessGovernor;
//!
//! let governor = RandomnessGovernor::new();
//! let mut zone = governor.seeded("demo", 42, "doc example");
//! let value = zone.rng().next_u64().unwrap();
//! drop(zone);
//!
//! assert_eq!(governor.ledger().len(), 1);
//! let _ = value;
//! ```

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::ThreadId;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors raised by the randomness governor
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GovernorError {
    #[error("randomness violation: '{operation}' invoked inside forbidden zone '{context}'")]
    RandomnessViolation {
        /// Label of the forbidden zone that was active
        context: String,
        /// The randomness primitive that was called
        operation: &'static str,
    },
}

/// Result type for governed randomness operations
pub type Result<T> = std::result::Result<T, GovernorError>;

/// The randomness permission mode of the calling thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Zone {
    /// Any randomness primitive call fails with a violation
    Forbidden,
    /// Randomness is permitted; the seed was registered in the ledger
    Seeded,
    /// Escape hatch: permitted but unaudited. Discouraged.
    Unrestricted,
}

/// One append-only audit record: which seed was registered, when, and why
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedLedgerEntry {
    /// Context label supplied at zone entry
    pub label: String,
    /// The seed registered for this scope
    pub seed: u64,
    /// Free-form purpose string for the audit trail
    pub purpose: String,
    /// Milliseconds since UNIX epoch when the entry was appended
    pub recorded_at_ms: u64,
}

#[derive(Debug)]
struct ZoneFrame {
    zone: Zone,
    label: String,
}

#[derive(Debug, Default)]
struct GovernorInner {
    /// Append-only; entries appear in call order. Only the append is
    /// synchronized - audit reads take a snapshot.
    ledger: Mutex<Vec<SeedLedgerEntry>>,
    /// Per-thread zone stacks, owned by the instance rather than by a
    /// process-global.
    zones: Mutex<HashMap<ThreadId, Vec<ZoneFrame>>>,
}

/// Controls whether randomness primitives may be invoked, and logs every
/// seed used.
///
/// Cheaply cloneable; clones share the same ledger and zone state. The
/// zone is tracked per thread: guards returned by [`forbidden`],
/// [`seeded`], and [`unrestricted`] push a frame for the calling thread
/// and pop it on drop.
///
/// [`forbidden`]: RandomnessGovernor::forbidden
/// [`seeded`]: RandomnessGovernor::seeded
/// [`unrestricted`]: RandomnessGovernor::unrestricted
#[derive(Debug, Clone, Default)]
pub struct RandomnessGovernor {
    inner: Arc<GovernorInner>,
}

impl RandomnessGovernor {
    /// Create a governor with an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a zone in which any randomness primitive call fails.
    ///
    /// The label names the analytic context in violation messages.
    pub fn forbidden(&self, label: &str) -> ZoneGuard {
        self.push(Zone::Forbidden, label)
    }

    /// Enter a zone in which randomness is permitted and traceable.
    ///
    /// Appends a [`SeedLedgerEntry`] and seeds a fresh [`GovernedRng`]
    /// from `seed`.
    pub fn seeded(&self, label: &str, seed: u64, purpose: &str) -> SeededZone {
        self.append_ledger(SeedLedgerEntry {
            label: label.to_string(),
            seed,
            purpose: purpose.to_string(),
            recorded_at_ms: now_ms(),
        });

        let guard = self.push(Zone::Seeded, label);
        SeededZone {
            rng: GovernedRng {
                governor: self.clone(),
                rng: StdRng::seed_from_u64(seed),
            },
            _guard: guard,
        }
    }

    /// Enter the unaudited escape-hatch zone. Permitted but discouraged;
    /// prefer [`seeded`](RandomnessGovernor::seeded).
    pub fn unrestricted(&self) -> ZoneGuard {
        self.push(Zone::Unrestricted, "unrestricted")
    }

    /// The calling thread's current zone. A thread that has entered no
    /// zone is `Unrestricted`.
    pub fn current_zone(&self) -> Zone {
        self.current_frame()
            .map(|(zone, _)| zone)
            .unwrap_or(Zone::Unrestricted)
    }

    /// Snapshot of the seed ledger, in append order.
    pub fn ledger(&self) -> Vec<SeedLedgerEntry> {
        self.lock_ledger().clone()
    }

    /// Run `f` inside a forbidden zone: the body is asserted to be
    /// analytically pure with respect to randomness.
    pub fn assert_pure<R>(&self, label: &str, f: impl FnOnce() -> R) -> R {
        let _guard = self.forbidden(label);
        f()
    }

    /// Run `f` with a governed generator inside a seeded zone.
    pub fn with_seed<R>(
        &self,
        label: &str,
        seed: u64,
        purpose: &str,
        f: impl FnOnce(&mut GovernedRng) -> R,
    ) -> R {
        let mut zone = self.seeded(label, seed, purpose);
        f(zone.rng())
    }

    fn push(&self, zone: Zone, label: &str) -> ZoneGuard {
        let thread = std::thread::current().id();
        self.lock_zones()
            .entry(thread)
            .or_default()
            .push(ZoneFrame {
                zone,
                label: label.to_string(),
            });
        ZoneGuard {
            governor: self.clone(),
            thread,
            _not_send: PhantomData,
        }
    }

    fn pop(&self, thread: ThreadId) {
        let mut zones = self.lock_zones();
        if let Some(stack) = zones.get_mut(&thread) {
            stack.pop();
            if stack.is_empty() {
                zones.remove(&thread);
            }
        }
    }

    fn current_frame(&self) -> Option<(Zone, String)> {
        let thread = std::thread::current().id();
        let zones = self.lock_zones();
        zones
            .get(&thread)
            .and_then(|stack| stack.last())
            .map(|frame| (frame.zone, frame.label.clone()))
    }

    fn append_ledger(&self, entry: SeedLedgerEntry) {
        self.lock_ledger().push(entry);
    }

    // Recover from poisoning: the ledger is append-only and the zone map
    // must stay poppable from guard drops during unwinding.
    fn lock_ledger(&self) -> std::sync::MutexGuard<'_, Vec<SeedLedgerEntry>> {
        self.inner
            .ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_zones(&self) -> std::sync::MutexGuard<'_, HashMap<ThreadId, Vec<ZoneFrame>>> {
        self.inner
            .zones
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scoped zone entry; restores the prior zone when dropped.
///
/// Not `Send`: the zone it pushed belongs to the thread that entered it.
#[derive(Debug)]
pub struct ZoneGuard {
    governor: RandomnessGovernor,
    thread: ThreadId,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ZoneGuard {
    fn drop(&mut self) {
        self.governor.pop(self.thread);
    }
}

/// A seeded zone together with its governed generator.
#[derive(Debug)]
pub struct SeededZone {
    rng: GovernedRng,
    _guard: ZoneGuard,
}

impl SeededZone {
    /// The governed generator seeded at zone entry.
    pub fn rng(&mut self) -> &mut GovernedRng {
        &mut self.rng
    }

    /// Detach the generator from the zone, for callers that must store it
    /// across scopes. Exits the zone; the generator remains subject to the
    /// zone check on every later call, so it still fails inside a
    /// forbidden zone.
    pub fn into_rng(self) -> GovernedRng {
        self.rng
    }
}

/// Facade over the underlying random-number primitive.
///
/// Every call checks the calling thread's zone first, so a generator that
/// leaks out of its seeded scope still fails inside a forbidden zone.
#[derive(Debug)]
pub struct GovernedRng {
    governor: RandomnessGovernor,
    rng: StdRng,
}

impl GovernedRng {
    /// Next raw 64-bit value from the governed stream.
    pub fn next_u64(&mut self) -> Result<u64> {
        self.check("next_u64")?;
        Ok(self.rng.gen())
    }

    /// Uniform float in `[0, 1)`.
    pub fn gen_f64(&mut self) -> Result<f64> {
        self.check("gen_f64")?;
        Ok(self.rng.gen())
    }

    /// Uniform index in `[0, n)`. `n` must be positive.
    pub fn gen_index(&mut self, n: usize) -> Result<usize> {
        self.check("gen_index")?;
        Ok(self.rng.gen_range(0..n))
    }

    /// Shuffle a slice in place (Fisher-Yates via the governed stream).
    pub fn shuffle<T>(&mut self, values: &mut [T]) -> Result<()> {
        self.check("shuffle")?;
        values.shuffle(&mut self.rng);
        Ok(())
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        match self.governor.current_frame() {
            Some((Zone::Forbidden, label)) => {
                tracing::warn!(
                    context = %label,
                    operation,
                    "randomness primitive invoked inside forbidden zone"
                );
                Err(GovernorError::RandomnessViolation {
                    context: label,
                    operation,
                })
            }
            _ => Ok(()),
        }
    }
}

/// Lightweight timestamp without chrono dependency
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
