//! Audit trail of authorization decisions.
//!
//! Every decision the sidecar proxy makes becomes one [`AuditEvent`] handed
//! to an [`AuditSink`].  Sinks are append-only: nothing in this crate reads,
//! mutates or deletes a recorded event.
//!
//! # Sinks
//!
//! | Sink | Destination |
//! |------|-------------|
//! | [`JsonlAuditSink`] | One JSON object per line, fsynced after each append |
//! | [`TracingAuditSink`] | `tracing::info!` with the event as a JSON field |
//! | [`MemoryAuditSink`] | In-process `Vec`, for tests and the demo |

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::Identity;
use crate::policy::PolicyDecision;
use crate::Result;

/// One recorded authorization decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event id.
    pub id: Uuid,
    /// When the decision was made.
    pub timestamp: DateTime<Utc>,
    /// Authenticated caller; absent when validation failed.
    pub source: Option<Identity>,
    /// Requested peer.
    pub destination: Identity,
    /// Outcome.
    pub decision: PolicyDecision,
    /// Why the request was denied, when there is more to say than the decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    /// Event for a decision between two authenticated identities.
    #[must_use]
    pub fn decision(source: Identity, destination: Identity, decision: PolicyDecision) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: Some(source),
            destination,
            decision,
            reason: None,
        }
    }

    /// Deny event for a request whose certificate failed validation.
    #[must_use]
    pub fn rejected(destination: Identity, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: None,
            destination,
            decision: PolicyDecision::Deny,
            reason: Some(reason.into()),
        }
    }

    /// Attach a reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Append-only destination for audit events.
pub trait AuditSink: Send + Sync {
    /// Record one event.
    fn append(&self, event: &AuditEvent) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// JSON Lines file
// ─────────────────────────────────────────────────────────────────────────────

/// Durable JSON Lines log.
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAuditSink {
    /// Open (or create) the log at `path` for appending.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Location of the log.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditSink {
    fn append(&self, event: &AuditEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = self.file.lock();
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// tracing
// ─────────────────────────────────────────────────────────────────────────────

/// Emits each event through `tracing`, queryable by any log aggregator.
///
/// ```text
/// INFO cipher_mesh::audit audit={"id":"…","decision":"allow",…} Audit event
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn append(&self, event: &AuditEvent) -> Result<()> {
        let json = serde_json::to_string(event)?;
        tracing::info!(audit = %json, "Audit event");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory
// ─────────────────────────────────────────────────────────────────────────────

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    /// Empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// `true` when nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, event: &AuditEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
