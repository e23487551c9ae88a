//! Identity-pair authorization with a frequency-based risk heuristic.
//!
//! A `(source, destination)` pair may communicate only if it is on the
//! allow-list **and** its current risk score is below [`RISK_THRESHOLD`].
//!
//! # Risk model
//!
//! Every authorization check of an allow-listed pair increments that pair's
//! request counter; the score comes from the post-increment count:
//!
//! | Count | Level | Score |
//! |-------|-------|-------|
//! | 1..=5 | [`RiskLevel::Low`] | 0.1 |
//! | 6..=10 | [`RiskLevel::Medium`] | 0.6 |
//! | > 10 | [`RiskLevel::High`] | 0.9 |
//!
//! Counters never decay and live as long as the engine, so a pair is denied
//! from its 11th check onward until the process restarts.  A sliding time
//! window per pair is the natural upgrade path.
//!
//! Pairs are ordered: allowing `(A, B)` says nothing about `(B, A)`.  A pair
//! that is not allow-listed is denied without touching its counter.

use std::collections::{HashMap, HashSet};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AllowRuleConfig;
use crate::identity::Identity;
use crate::Result;

/// Scores at or above this value are denied.
pub const RISK_THRESHOLD: f64 = 0.8;

type Pair = (Identity, Identity);

// ─────────────────────────────────────────────────────────────────────────────
// Public decision types
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyDecision {
    /// Communication is permitted.
    Allow,
    /// Communication is forbidden.
    Deny,
}

impl PolicyDecision {
    /// `true` for [`PolicyDecision::Allow`].
    #[must_use]
    pub fn is_allow(self) -> bool {
        self == Self::Allow
    }
}

impl From<bool> for PolicyDecision {
    fn from(allowed: bool) -> Self {
        if allowed { Self::Allow } else { Self::Deny }
    }
}

/// Risk bucket derived from a pair's request count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Up to 5 requests.
    Low,
    /// 6 to 10 requests.
    Medium,
    /// More than 10 requests.
    High,
}

impl RiskLevel {
    /// Bucket for a post-increment request count.
    #[must_use]
    pub fn from_count(count: u64) -> Self {
        match count {
            0..=5 => Self::Low,
            6..=10 => Self::Medium,
            _ => Self::High,
        }
    }

    /// Numeric score for this level.
    #[must_use]
    pub fn score(self) -> f64 {
        match self {
            Self::Low => 0.1,
            Self::Medium => 0.6,
            Self::High => 0.9,
        }
    }
}

/// Detailed result of [`PolicyEngine::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    /// Final decision.
    pub decision: PolicyDecision,
    /// Risk level, present only when the pair was allow-listed.
    pub risk: Option<RiskLevel>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

/// Allow-list plus per-pair risk counters.
///
/// Shared behind an `Arc`; all methods take `&self`.
#[derive(Debug, Default)]
pub struct PolicyEngine {
    allowed: RwLock<HashSet<Pair>>,
    /// Guarded by a mutex so concurrent checks of one pair never lose an
    /// increment.
    counters: Mutex<HashMap<Pair, u64>>,
}

impl PolicyEngine {
    /// Empty engine: everything is denied.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine pre-loaded with configured allow rules.
    pub fn from_rules(rules: &[AllowRuleConfig]) -> Result<Self> {
        let engine = Self::new();
        for rule in rules {
            engine.allow(
                Identity::parse(&rule.source)?,
                Identity::parse(&rule.destination)?,
            );
        }
        Ok(engine)
    }

    /// Add `(source, destination)` to the allow-list.  Idempotent.
    pub fn allow(&self, source: Identity, destination: Identity) {
        debug!(source = %source, destination = %destination, "Policy rule added");
        self.allowed.write().insert((source, destination));
    }

    /// `true` when the ordered pair is allow-listed.  Does not count.
    #[must_use]
    pub fn is_allow_listed(&self, source: &Identity, destination: &Identity) -> bool {
        // HashSet<(A, B)> cannot be looked up with borrowed halves, so clone.
        self.allowed
            .read()
            .contains(&(source.clone(), destination.clone()))
    }

    /// Increment the pair's counter and return the resulting score.
    pub fn risk_score(&self, source: &Identity, destination: &Identity) -> f64 {
        self.risk_level(source, destination).score()
    }

    /// Current counter for the pair, without incrementing.
    #[must_use]
    pub fn request_count(&self, source: &Identity, destination: &Identity) -> u64 {
        self.counters
            .lock()
            .get(&(source.clone(), destination.clone()))
            .copied()
            .unwrap_or(0)
    }

    /// `true` when the pair is allow-listed and its score is below
    /// [`RISK_THRESHOLD`].
    pub fn is_allowed(&self, source: &Identity, destination: &Identity) -> bool {
        self.evaluate(source, destination).decision.is_allow()
    }

    /// Full authorization check.
    pub fn evaluate(&self, source: &Identity, destination: &Identity) -> Evaluation {
        if !self.is_allow_listed(source, destination) {
            debug!(source = %source, destination = %destination, "Pair not allow-listed");
            return Evaluation {
                decision: PolicyDecision::Deny,
                risk: None,
            };
        }

        let level = self.risk_level(source, destination);
        let score = level.score();
        debug!(
            source = %source,
            destination = %destination,
            risk = score,
            "Risk score computed"
        );

        Evaluation {
            decision: PolicyDecision::from(score < RISK_THRESHOLD),
            risk: Some(level),
        }
    }

    fn risk_level(&self, source: &Identity, destination: &Identity) -> RiskLevel {
        let mut counters = self.counters.lock();
        let count = counters
            .entry((source.clone(), destination.clone()))
            .or_insert(0);
        *count = count.saturating_add(1);
        RiskLevel::from_count(*count)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
