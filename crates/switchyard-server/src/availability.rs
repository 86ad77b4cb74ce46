//! Degraded-mode controller.
//!
//! One controller per hub. It probes the coordination store on a fixed
//! interval, folds probe results and failures reported by other components
//! into a [`ProbeTracker`], and publishes the resulting mode through
//! [`AvailabilityState`]. Readers on the hot path only do an atomic load.
//!
//! Every Degraded→Healthy transition runs exactly one resync pass over the
//! registered [`ResyncTarget`]s.

#![allow(clippy::disallowed_types, reason = "Short critical sections, no await while held")]

use std::{
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use switchyard_core::{AvailabilityMode, Environment, ProbeConfig, ProbeOutcome, ProbeTracker, Transition};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    metrics::HubMetrics,
    store::{CoordinationStore, StoreError},
};

/// Interval between liveness probes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(2);

/// Time a probe may take before it counts as failed.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Controller configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityConfig {
    /// Interval between probes
    pub probe_interval: Duration,
    /// Probe deadline
    pub probe_timeout: Duration,
    /// Hysteresis thresholds
    pub probe: ProbeConfig,
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self {
            probe_interval: DEFAULT_PROBE_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            probe: ProbeConfig::default(),
        }
    }
}

/// Current availability mode, shared by every component of a hub.
///
/// Starts Healthy. Only the controller changes it.
#[derive(Debug)]
pub struct AvailabilityState {
    mode: AtomicU8,
    changes: watch::Sender<AvailabilityMode>,
    last_transition: Mutex<Option<DateTime<Utc>>>,
}

impl Default for AvailabilityState {
    fn default() -> Self {
        Self::new()
    }
}

impl AvailabilityState {
    /// Healthy state with no recorded transition.
    pub fn new() -> Self {
        let (changes, _) = watch::channel(AvailabilityMode::Healthy);
        Self {
            mode: AtomicU8::new(AvailabilityMode::Healthy.as_u8()),
            changes,
            last_transition: Mutex::new(None),
        }
    }

    /// Current mode.
    pub fn mode(&self) -> AvailabilityMode {
        AvailabilityMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    /// Whether the store is considered reachable.
    pub fn is_healthy(&self) -> bool {
        self.mode().is_healthy()
    }

    /// Time of the last mode change.
    pub fn last_transition(&self) -> Option<DateTime<Utc>> {
        *self.last_transition.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stream of mode changes.
    pub fn subscribe(&self) -> watch::Receiver<AvailabilityMode> {
        self.changes.subscribe()
    }

    /// Wait until the mode is Healthy. Returns `false` if cancelled first.
    pub async fn wait_healthy(&self, cancel: &CancellationToken) -> bool {
        if self.is_healthy() {
            return true;
        }

        let mut rx = self.subscribe();
        tokio::select! {
            () = cancel.cancelled() => false,
            healthy = async { rx.wait_for(|mode| mode.is_healthy()).await.is_ok() } => healthy,
        }
    }

    fn set(&self, mode: AvailabilityMode, at: DateTime<Utc>) {
        self.mode.store(mode.as_u8(), Ordering::Release);
        *self.last_transition.lock().unwrap_or_else(PoisonError::into_inner) = Some(at);
        self.changes.send_replace(mode);
    }
}

/// Sink for dependency failures observed outside the probe loop.
pub trait FailureReporter: Send + Sync + 'static {
    /// Count a failed store call against availability.
    fn report_failure(&self, component: &'static str, error: &StoreError);
}

/// Component that re-establishes store state after an outage.
#[async_trait]
pub trait ResyncTarget: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Push locally held state back to the store. Returns how many entries
    /// were written.
    async fn resync(&self) -> Result<usize, StoreError>;
}

/// Probe loop and hysteresis.
pub struct AvailabilityController<E: Environment> {
    env: E,
    store: Arc<dyn CoordinationStore>,
    state: Arc<AvailabilityState>,
    tracker: Mutex<ProbeTracker>,
    config: AvailabilityConfig,
    targets: Mutex<Vec<Weak<dyn ResyncTarget>>>,
    metrics: Arc<dyn HubMetrics>,
    resyncs: AtomicU64,
}

impl<E: Environment> AvailabilityController<E> {
    /// Create a controller in Healthy mode.
    pub fn new(
        env: E,
        store: Arc<dyn CoordinationStore>,
        config: AvailabilityConfig,
        metrics: Arc<dyn HubMetrics>,
    ) -> Self {
        Self {
            env,
            store,
            state: Arc::new(AvailabilityState::new()),
            tracker: Mutex::new(ProbeTracker::new(config.probe)),
            config,
            targets: Mutex::new(Vec::new()),
            metrics,
            resyncs: AtomicU64::new(0),
        }
    }

    /// Shared mode handle.
    pub fn state(&self) -> &Arc<AvailabilityState> {
        &self.state
    }

    /// Current mode.
    pub fn mode(&self) -> AvailabilityMode {
        self.state.mode()
    }

    /// Number of resync passes run so far.
    pub fn resync_count(&self) -> u64 {
        self.resyncs.load(Ordering::Relaxed)
    }

    /// Configuration in use.
    pub fn config(&self) -> &AvailabilityConfig {
        &self.config
    }

    /// Add a resync target. The controller only keeps a weak reference.
    pub fn register(&self, target: &Arc<dyn ResyncTarget>) {
        self.targets.lock().unwrap_or_else(PoisonError::into_inner).push(Arc::downgrade(target));
    }

    /// Fold one outcome into the tracker and apply any transition.
    ///
    /// Does not resync; [`AvailabilityController::probe_once`] does that for
    /// recoveries.
    pub fn record(&self, outcome: ProbeOutcome) -> Option<Transition> {
        let mut tracker = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
        let transition = tracker.record(outcome)?;

        // Publish under the tracker lock so racing reports apply in order
        self.state.set(transition.to, self.env.wall_clock());
        drop(tracker);

        self.metrics.set_degraded(!transition.to.is_healthy());
        if transition.is_recovery() {
            tracing::info!("Coordination store recovered, leaving degraded mode");
        } else {
            tracing::warn!("Coordination store unavailable, entering degraded mode");
        }
        Some(transition)
    }

    /// Run one liveness probe. Returns the mode afterwards.
    pub async fn probe_once(&self) -> AvailabilityMode {
        let outcome = match tokio::time::timeout(self.config.probe_timeout, self.store.ping()).await {
            Ok(Ok(())) => ProbeOutcome::Success,
            Ok(Err(error)) => {
                tracing::debug!(%error, "Probe failed");
                ProbeOutcome::Failure
            },
            Err(_) => {
                tracing::debug!(timeout = ?self.config.probe_timeout, "Probe timed out");
                ProbeOutcome::Failure
            },
        };

        if self.record(outcome).is_some_and(|t| t.is_recovery()) {
            self.resync().await;
        }
        self.mode()
    }

    /// Run one resync pass over every live target.
    ///
    /// Returns the number of entries written.
    pub async fn resync(&self) -> usize {
        self.resyncs.fetch_add(1, Ordering::Relaxed);

        let targets: Vec<Arc<dyn ResyncTarget>> = {
            let mut targets = self.targets.lock().unwrap_or_else(PoisonError::into_inner);
            targets.retain(|t| t.strong_count() > 0);
            targets.iter().filter_map(Weak::upgrade).collect()
        };

        let mut written = 0;
        for target in targets {
            match target.resync().await {
                Ok(count) => {
                    tracing::info!(target = target.name(), count, "Resync complete");
                    written += count;
                },
                Err(error) => {
                    tracing::warn!(target = target.name(), %error, "Resync failed");
                    self.report_failure(target.name(), &error);
                },
            }
        }
        written
    }

    /// Probe until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::debug!(interval = ?self.config.probe_interval, "Availability probe loop started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.env.sleep(self.config.probe_interval) => {},
            }
            self.probe_once().await;
        }
        tracing::debug!("Availability probe loop stopped");
    }
}

impl<E: Environment> FailureReporter for AvailabilityController<E> {
    fn report_failure(&self, component: &'static str, error: &StoreError) {
        if !error.is_availability() {
            tracing::debug!(component, %error, "Ignoring data error");
            return;
        }
        tracing::debug!(component, %error, "Dependency failure reported");
        self.record(ProbeOutcome::Failure);
    }
}
