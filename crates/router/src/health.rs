//! Rolling view of peer-service liveness.
//!
//! Fed by retained `system/health/+` messages (its subscription is exempt
//! from dispatcher dedup so retained re-delivery on reconnect re-seeds
//! the state). Readers get copy-on-read snapshots; change notifications
//! go through a conflated `watch` channel so a slow consumer only ever
//! observes the latest mutation and never blocks the writer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tars_contracts::events::HealthStatus;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::metrics::{names, Metrics};

/// Latest known health for one service.
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub ok: bool,
    pub event: Option<String>,
    pub err: Option<String>,
    /// Producer-side timestamp from the health envelope.
    pub ts: f64,
    /// When this record was last mutated, on our clock.
    pub last_seen: Instant,
}

/// A `(service, record)` pair pushed on every mutation.
pub type HealthChange = (String, ServiceRecord);

/// Registry of peer-service health records.
///
/// Written by its own subscriber, read by many. Records are created on
/// first observation and never removed; a service that has never been
/// seen reads as `None` ("unknown").
#[derive(Clone)]
pub struct HealthRegistry {
    inner: Arc<RwLock<HashMap<String, ServiceRecord>>>,
    changes: watch::Sender<Option<HealthChange>>,
    stale_after: Duration,
    created: Instant,
    metrics: Metrics,
}

impl HealthRegistry {
    pub fn new(stale_after: Duration, metrics: Metrics) -> Self {
        let (changes, _) = watch::channel(None);
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            changes,
            stale_after,
            created: Instant::now(),
            metrics,
        }
    }

    /// Record a health status arrival for `service`.
    pub fn observe(&self, service: &str, status: &HealthStatus, ts: f64) {
        self.observe_at(service, status, ts, Instant::now());
    }

    /// [`Self::observe`] with an explicit clock, for tests.
    pub fn observe_at(&self, service: &str, status: &HealthStatus, ts: f64, now: Instant) {
        let record = ServiceRecord {
            ok: status.ok,
            event: status.event.clone(),
            err: status.err.clone(),
            ts,
            last_seen: now,
        };

        {
            let mut map = match self.inner.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            map.insert(service.to_string(), record.clone());
        }

        self.metrics.set_gauge(
            names::SERVICE_HEALTH,
            service,
            if status.ok { 1.0 } else { 0.0 },
        );
        debug!(service, ok = status.ok, event = ?status.event, "health record updated");
        let _ = self.changes.send_replace(Some((service.to_string(), record)));
    }

    /// Current record for `service`, or `None` when never observed.
    ///
    /// A record older than the staleness grace period reads as unhealthy
    /// with `err = "stale"`, without mutating stored state.
    pub fn snapshot(&self, service: &str) -> Option<ServiceRecord> {
        self.snapshot_at(service, Instant::now())
    }

    pub fn snapshot_at(&self, service: &str, now: Instant) -> Option<ServiceRecord> {
        let map = match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.get(service).map(|record| self.view(record, now))
    }

    /// Copy-on-read snapshot of every known service.
    pub fn snapshot_all(&self) -> HashMap<String, ServiceRecord> {
        let now = Instant::now();
        let map = match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.iter()
            .map(|(name, record)| (name.clone(), self.view(record, now)))
            .collect()
    }

    /// Whether routing may assume `service` is up.
    ///
    /// Known services answer from their (staleness-adjusted) record. A
    /// never-seen service is assumed healthy during the first grace
    /// period after startup and unhealthy after — a cold start must not
    /// drop transcripts while peers publish their first retained health.
    pub fn assume_ok(&self, service: &str) -> bool {
        self.assume_ok_at(service, Instant::now())
    }

    pub fn assume_ok_at(&self, service: &str, now: Instant) -> bool {
        match self.snapshot_at(service, now) {
            Some(record) => record.ok,
            None => now.duration_since(self.created) < self.stale_after,
        }
    }

    /// Conflated stream of mutations; `None` until the first one.
    pub fn subscribe_changes(&self) -> watch::Receiver<Option<HealthChange>> {
        self.changes.subscribe()
    }

    /// Flip records that outlived the grace period to stale, notifying
    /// once per transition.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    pub fn sweep_at(&self, now: Instant) {
        let mut transitions: Vec<HealthChange> = Vec::new();
        {
            let mut map = match self.inner.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            for (name, record) in map.iter_mut() {
                let expired = now.duration_since(record.last_seen) >= self.stale_after;
                if expired && record.ok {
                    record.ok = false;
                    record.err = Some("stale".into());
                    transitions.push((name.clone(), record.clone()));
                }
            }
        }
        for (service, record) in transitions {
            info!(service = %service, "service went stale");
            self.metrics.set_gauge(names::SERVICE_HEALTH, &service, 0.0);
            let _ = self.changes.send_replace(Some((service, record)));
        }
    }

    /// Run the staleness sweep until shutdown.
    pub async fn run_sweeper(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    fn view(&self, record: &ServiceRecord, now: Instant) -> ServiceRecord {
        let mut view = record.clone();
        if now.duration_since(record.last_seen) >= self.stale_after {
            view.ok = false;
            view.err = Some("stale".into());
        }
        view
    }
}
