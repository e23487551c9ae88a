//! Time-driven certificate renewal.
//!
//! A [`RotationManager`] watches one certificate file and calls its
//! [`Renewer`] once less than half of the certificate's lifetime remains.
//!
//! ```text
//! Stopped ──start()──▶ Running ──stop() / drop──▶ Stopped
//! ```
//!
//! The background loop is a tokio task ticking on a fixed interval.  Each
//! iteration runs on the blocking pool (file read, parse, possibly a CA
//! reissue) and any failure is logged and retried on the next tick; only a
//! shutdown signal ends the loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::certificate::CertificateInfo;
use crate::{Error, Result};

/// Default tick interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Action that replaces the watched certificate with a fresh one.
///
/// Any `Fn() -> Result<()>` closure is a renewer.
pub trait Renewer: Send + Sync {
    /// Reissue the certificate, overwriting it in place.
    fn renew(&self) -> Result<()>;
}

impl<F> Renewer for F
where
    F: Fn() -> Result<()> + Send + Sync,
{
    fn renew(&self) -> Result<()> {
        self()
    }
}

/// Result of one rotation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationOutcome {
    /// The renewer ran.
    Renewed,
    /// More than half the lifetime remains; nothing to do.
    Fresh {
        /// Time left on the certificate.
        remaining: TimeDelta,
    },
}

/// State shared with the background task.
struct Watch {
    cert_path: PathBuf,
    renewer: Arc<dyn Renewer>,
    renewals: AtomicU64,
}

impl Watch {
    fn check_at(&self, now: DateTime<Utc>) -> Result<RotationOutcome> {
        let bytes = std::fs::read(&self.cert_path)?;
        let info = CertificateInfo::from_bytes(&bytes)?;
        let remaining = info.remaining_at(now);

        if !info.needs_rotation_at(now) {
            debug!(
                path = %self.cert_path.display(),
                remaining_secs = remaining.num_seconds(),
                "Certificate fresh"
            );
            return Ok(RotationOutcome::Fresh { remaining });
        }

        self.renewer.renew()?;
        self.renewals.fetch_add(1, Ordering::Relaxed);
        info!(
            path = %self.cert_path.display(),
            remaining_secs = remaining.num_seconds(),
            lifetime_secs = info.lifetime().num_seconds(),
            "Certificate renewed"
        );
        Ok(RotationOutcome::Renewed)
    }
}

struct Running {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Periodic renewal of one certificate.
pub struct RotationManager {
    watch: Arc<Watch>,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for RotationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationManager")
            .field("cert_path", &self.watch.cert_path)
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl RotationManager {
    /// Watch `cert_path`, renewing through `renewer`, checking every `interval`.
    pub fn new(
        cert_path: impl Into<PathBuf>,
        renewer: Arc<dyn Renewer>,
        interval: Duration,
    ) -> Self {
        Self {
            watch: Arc::new(Watch {
                cert_path: cert_path.into(),
                renewer,
                renewals: AtomicU64::new(0),
            }),
            interval,
            running: Mutex::new(None),
        }
    }

    /// Watched certificate file.
    #[must_use]
    pub fn cert_path(&self) -> &Path {
        &self.watch.cert_path
    }

    /// Tick interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Renewals performed so far (by the loop or by direct checks).
    #[must_use]
    pub fn renewal_count(&self) -> u64 {
        self.watch.renewals.load(Ordering::Relaxed)
    }

    /// Run one check now.
    pub fn check_once(&self) -> Result<RotationOutcome> {
        self.check_at(Utc::now())
    }

    /// Run one check as of `now`.
    pub fn check_at(&self, now: DateTime<Utc>) -> Result<RotationOutcome> {
        self.watch.check_at(now)
    }

    /// Start the background loop on the current tokio runtime.
    ///
    /// Returns `Ok(false)` if it is already running.
    pub fn start(&self) -> Result<bool> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Internal(format!("Rotation requires a tokio runtime: {e}")))?;

        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Ok(false);
        }

        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let handle = runtime.spawn(rotation_loop(
            Arc::clone(&self.watch),
            self.interval,
            shutdown_rx,
        ));
        *running = Some(Running { shutdown, handle });

        info!(
            path = %self.watch.cert_path.display(),
            interval = ?self.interval,
            "Rotation started"
        );
        Ok(true)
    }

    /// Signal the loop to exit and wait for an in-flight iteration to finish.
    ///
    /// No-op when not running.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(Running { shutdown, handle }) = running else {
            return;
        };
        let _ = shutdown.send(());
        if let Err(e) = handle.await {
            warn!(error = %e, "Rotation task ended abnormally");
        }
        info!(path = %self.watch.cert_path.display(), "Rotation stopped");
    }

    /// `true` while the background loop is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}

/// The loop exits on a shutdown message or when the sender is dropped.
async fn rotation_loop(
    watch: Arc<Watch>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let watch = Arc::clone(&watch);
                match tokio::task::spawn_blocking(move || watch.check_at(Utc::now())).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(error = %e, "Rotation check failed"),
                    Err(e) => warn!(error = %e, "Rotation check panicked"),
                }
            }
            _ = shutdown.recv() => {
                debug!("Rotation loop shutting down");
                break;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
