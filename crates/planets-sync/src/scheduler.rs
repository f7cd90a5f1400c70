//! Periodic and on-demand sync cycles behind a single-slot gate.
//!
//! At most one cycle (fetch, reconcile, upsert) runs at a time. Manual
//! triggers that arrive while a cycle is running wait for the gate and are
//! coalesced: every trigger requested before a cycle started is answered with
//! that cycle's outcome, so a burst of triggers costs one follow-up cycle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use planets_catalog::CatalogClient;
use planets_core::{KeyFailure, SyncResult, WriteCounts};
use planets_storage::PlanetStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::reconcile::Reconciler;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncError {
    #[error("catalog fetch failed: {reason}")]
    FetchFailure { cycle_id: Uuid, reason: String },
    #[error("store write failed: {reason}")]
    WriteFailure {
        cycle_id: Uuid,
        reason: String,
        counts: WriteCounts,
        failures: Vec<KeyFailure>,
    },
    #[error("sync scheduler is already running")]
    AlreadyRunning,
    #[error("a sync cycle is already in progress")]
    Busy,
    #[error("sync scheduler is stopped")]
    Stopped,
    #[error("invalid schedule: {reason}")]
    InvalidSchedule { reason: String },
}

/// What to do when the catalog returns zero records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyFetchPolicy {
    /// Complete the cycle without touching the store.
    #[default]
    Skip,
    /// Hand the empty batch to the store like any other.
    Apply,
    /// Treat the fetch as failed.
    Reject,
}

impl std::str::FromStr for EmptyFetchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "apply" => Ok(Self::Apply),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown empty fetch policy {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Every(Duration),
    Cron(String),
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Upper bound on the fetch phase. Writes are never interrupted.
    pub cycle_timeout: Duration,
    pub empty_fetch: EmptyFetchPolicy,
    pub report_capacity: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            cycle_timeout: Duration::from_secs(300),
            empty_fetch: EmptyFetchPolicy::default(),
            report_capacity: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Timer,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum CycleOutcome {
    Succeeded(SyncResult),
    Failed(SyncError),
}

impl CycleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    pub fn into_result(self) -> Result<SyncResult, SyncError> {
        match self {
            Self::Succeeded(result) => Ok(result),
            Self::Failed(err) => Err(err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub trigger: TriggerSource,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: CycleOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: SchedulerState,
    /// A timer or cron ticker is active.
    pub ticking: bool,
    pub cycles_completed: u64,
    pub consecutive_failures: u32,
    pub last_cycle: Option<CycleReport>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            state: SchedulerState::Idle,
            ticking: false,
            cycles_completed: 0,
            consecutive_failures: 0,
            last_cycle: None,
        }
    }
}

enum Ticker {
    Interval {
        cancel: CancellationToken,
        handle: JoinHandle<()>,
    },
    Cron {
        cancel: CancellationToken,
        sched: JobScheduler,
    },
}

struct SchedulerCore {
    catalog: Arc<dyn CatalogClient>,
    store: Arc<dyn PlanetStore>,
    reconciler: Reconciler,
    options: SchedulerOptions,
    gate: Mutex<()>,
    /// Ticket handed to the most recent trigger request.
    requested: AtomicU64,
    /// Highest ticket answered by a completed cycle.
    served: AtomicU64,
    stopped: AtomicBool,
    status: watch::Sender<SyncStatus>,
    reports: broadcast::Sender<CycleReport>,
}

pub struct SyncScheduler {
    core: Arc<SchedulerCore>,
    ticker: Mutex<Option<Ticker>>,
}

impl SyncScheduler {
    pub fn new(
        catalog: Arc<dyn CatalogClient>,
        store: Arc<dyn PlanetStore>,
        options: SchedulerOptions,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::default());
        let (reports, _) = broadcast::channel(options.report_capacity.max(1));
        Self {
            core: Arc::new(SchedulerCore {
                catalog,
                store,
                reconciler: Reconciler::new(),
                options,
                gate: Mutex::new(()),
                requested: AtomicU64::new(0),
                served: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
                status,
                reports,
            }),
            ticker: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<dyn PlanetStore> {
        &self.core.store
    }

    /// Ticks every `interval`, the first tick firing immediately.
    pub async fn start(&self, interval: Duration) -> Result<(), SyncError> {
        if interval.is_zero() {
            return Err(SyncError::InvalidSchedule {
                reason: "interval must be greater than zero".to_string(),
            });
        }
        let mut ticker = self.ticker.lock().await;
        self.ensure_startable(&ticker)?;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(self.core.clone().tick_loop(interval, cancel.clone()));
        *ticker = Some(Ticker::Interval { cancel, handle });
        self.core.status.send_modify(|s| s.ticking = true);
        info!(interval_secs = interval.as_secs_f64(), "sync scheduler started");
        Ok(())
    }

    /// Ticks on a cron expression.
    pub async fn start_cron(&self, expression: &str) -> Result<(), SyncError> {
        let mut ticker = self.ticker.lock().await;
        self.ensure_startable(&ticker)?;

        let invalid = |err: JobSchedulerError| SyncError::InvalidSchedule {
            reason: format!("{expression}: {err}"),
        };
        let sched = JobScheduler::new().await.map_err(invalid)?;
        let cancel = CancellationToken::new();
        let core = self.core.clone();
        let job_cancel = cancel.clone();
        let job = Job::new_async(expression, move |_uuid, _l| {
            let core = core.clone();
            let cancel = job_cancel.clone();
            Box::pin(async move {
                if !cancel.is_cancelled() {
                    let _ = core.run_coalesced(TriggerSource::Timer).await;
                }
            })
        })
        .map_err(invalid)?;
        sched.add(job).await.map_err(invalid)?;
        sched.start().await.map_err(invalid)?;

        *ticker = Some(Ticker::Cron { cancel, sched });
        self.core.status.send_modify(|s| s.ticking = true);
        info!(cron = expression, "sync scheduler started");
        Ok(())
    }

    pub async fn start_schedule(&self, schedule: &Schedule) -> Result<(), SyncError> {
        match schedule {
            Schedule::Every(interval) => self.start(*interval).await,
            Schedule::Cron(expression) => self.start_cron(expression).await,
        }
    }

    /// Runs a cycle and returns its outcome, waiting behind any cycle in
    /// progress. Triggers queued behind the same cycle share one follow-up run.
    pub async fn trigger_sync(&self) -> Result<SyncResult, SyncError> {
        self.core.run_coalesced(TriggerSource::Manual).await
    }

    /// Like [`trigger_sync`](Self::trigger_sync) but returns `Busy` instead of waiting.
    pub async fn try_trigger_sync(&self) -> Result<SyncResult, SyncError> {
        self.core.try_run().await
    }

    /// Cancels the ticker, waits for an in-flight cycle, and refuses all
    /// later triggers. Calling it again is a no-op.
    pub async fn stop(&self) {
        let mut ticker = self.ticker.lock().await;
        if self.core.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping sync scheduler");

        match ticker.take() {
            Some(Ticker::Interval { cancel, handle }) => {
                cancel.cancel();
                if let Err(err) = handle.await {
                    error!(error = %err, "sync ticker task failed");
                }
            }
            Some(Ticker::Cron { cancel, mut sched }) => {
                cancel.cancel();
                if let Err(err) = sched.shutdown().await {
                    warn!(error = %err, "cron scheduler shutdown failed");
                }
            }
            None => {}
        }

        // Manual cycles still hold the gate; wait them out.
        let _gate = self.core.gate.lock().await;
        self.core.status.send_modify(|s| {
            s.state = SchedulerState::Stopped;
            s.ticking = false;
        });
        info!("sync scheduler stopped");
    }

    pub fn status(&self) -> SyncStatus {
        self.core.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.core.status.subscribe()
    }

    /// Every completed cycle, timer-driven or manual, is published here.
    pub fn subscribe_reports(&self) -> broadcast::Receiver<CycleReport> {
        self.core.reports.subscribe()
    }

    fn ensure_startable(&self, ticker: &Option<Ticker>) -> Result<(), SyncError> {
        if self.core.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::Stopped);
        }
        if ticker.is_some() {
            return Err(SyncError::AlreadyRunning);
        }
        Ok(())
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.core.stopped.store(true, Ordering::SeqCst);
        self.core.status.send_modify(|s| {
            s.state = SchedulerState::Stopped;
            s.ticking = false;
        });
        match self.ticker.get_mut().take() {
            Some(Ticker::Interval { cancel, .. }) => cancel.cancel(),
            Some(Ticker::Cron { cancel, mut sched }) => {
                // Jobs check the token, so ticks stop even if shutdown cannot be spawned.
                cancel.cancel();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        if let Err(err) = sched.shutdown().await {
                            warn!(error = %err, "cron scheduler shutdown failed");
                        }
                    });
                }
            }
            None => {}
        }
    }
}

impl SchedulerCore {
    async fn tick_loop(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    // Outcomes reach callers through the status and report channels.
                    let _ = self.run_coalesced(TriggerSource::Timer).await;
                }
            }
        }
        debug!("sync ticker exited");
    }

    async fn run_coalesced(&self, trigger: TriggerSource) -> Result<SyncResult, SyncError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::Stopped);
        }
        let ticket = self.requested.fetch_add(1, Ordering::SeqCst) + 1;
        let _gate = self.gate.lock().await;
        self.run_locked(ticket, trigger).await
    }

    async fn try_run(&self) -> Result<SyncResult, SyncError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::Stopped);
        }
        let _gate = self.gate.try_lock().map_err(|_| SyncError::Busy)?;
        let ticket = self.requested.fetch_add(1, Ordering::SeqCst) + 1;
        self.run_locked(ticket, TriggerSource::Manual).await
    }

    /// Caller holds the gate.
    async fn run_locked(&self, ticket: u64, trigger: TriggerSource) -> Result<SyncResult, SyncError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::Stopped);
        }

        if self.served.load(Ordering::SeqCst) >= ticket {
            let last = self.status.borrow().last_cycle.clone();
            if let Some(report) = last {
                debug!(cycle_id = %report.cycle_id, ?trigger, "trigger coalesced into completed cycle");
                return report.outcome.into_result();
            }
        }

        let covers = self.requested.load(Ordering::SeqCst);
        let report = self.run_cycle(trigger).await;
        self.served.store(covers, Ordering::SeqCst);
        self.record(report.clone());
        report.outcome.into_result()
    }

    async fn run_cycle(&self, trigger: TriggerSource) -> CycleReport {
        let cycle_id = Uuid::new_v4();
        let started_at = Utc::now();
        self.status.send_modify(|s| s.state = SchedulerState::Running);

        let span = info_span!("sync_cycle", %cycle_id, ?trigger);
        let outcome = self.execute(cycle_id, started_at).instrument(span.clone()).await;
        let finished_at = Utc::now();

        span.in_scope(|| match &outcome {
            CycleOutcome::Succeeded(result) => info!(
                fetched = result.fetched,
                skipped = result.skipped,
                matched = result.matched,
                modified = result.modified,
                upserted = result.upserted,
                empty_upstream = result.empty_upstream,
                "sync cycle completed"
            ),
            CycleOutcome::Failed(err) => error!(error = %err, "sync cycle failed"),
        });

        CycleReport {
            cycle_id,
            trigger,
            started_at,
            finished_at,
            outcome,
        }
    }

    async fn execute(&self, cycle_id: Uuid, started_at: DateTime<Utc>) -> CycleOutcome {
        let timeout = self.options.cycle_timeout;
        let records = match tokio::time::timeout(timeout, self.catalog.fetch_all()).await {
            Ok(Ok(records)) => records,
            Ok(Err(err)) => {
                return CycleOutcome::Failed(SyncError::FetchFailure {
                    cycle_id,
                    reason: err.to_string(),
                })
            }
            Err(_) => {
                return CycleOutcome::Failed(SyncError::FetchFailure {
                    cycle_id,
                    reason: format!("catalog fetch timed out after {}s", timeout.as_secs_f64()),
                })
            }
        };

        let fetched = records.len();
        let empty_upstream = fetched == 0;
        if empty_upstream {
            match self.options.empty_fetch {
                EmptyFetchPolicy::Reject => {
                    return CycleOutcome::Failed(SyncError::FetchFailure {
                        cycle_id,
                        reason: "catalog returned no records".to_string(),
                    })
                }
                EmptyFetchPolicy::Skip => {
                    warn!(catalog = self.catalog.name(), "catalog returned no records; store left untouched");
                    return CycleOutcome::Succeeded(SyncResult {
                        cycle_id,
                        started_at,
                        finished_at: Utc::now(),
                        fetched,
                        skipped: 0,
                        superseded: 0,
                        matched: 0,
                        modified: 0,
                        upserted: 0,
                        empty_upstream,
                    });
                }
                EmptyFetchPolicy::Apply => {
                    warn!(catalog = self.catalog.name(), "catalog returned no records; applying empty batch");
                }
            }
        }

        let plan = self.reconciler.to_write_ops(records);
        if plan.skipped > 0 {
            warn!(skipped = plan.skipped, "catalog records without a name were skipped");
        }

        let write = match self.store.bulk_upsert(&plan.ops).await {
            Ok(write) => write,
            Err(err) => {
                return CycleOutcome::Failed(SyncError::WriteFailure {
                    cycle_id,
                    reason: err.to_string(),
                    counts: WriteCounts::default(),
                    failures: Vec::new(),
                })
            }
        };

        if !write.is_complete() {
            for failure in &write.failures {
                warn!(key = %failure.name, reason = %failure.reason, "planet upsert failed");
            }
            return CycleOutcome::Failed(SyncError::WriteFailure {
                cycle_id,
                reason: format!("{} of {} keys failed", write.failures.len(), plan.ops.len()),
                counts: write.counts,
                failures: write.failures,
            });
        }

        CycleOutcome::Succeeded(SyncResult {
            cycle_id,
            started_at,
            finished_at: Utc::now(),
            fetched,
            skipped: plan.skipped,
            superseded: plan.superseded,
            matched: write.counts.matched,
            modified: write.counts.modified,
            upserted: write.counts.upserted,
            empty_upstream,
        })
    }

    fn record(&self, report: CycleReport) {
        let success = report.outcome.is_success();
        self.status.send_modify(|s| {
            if s.state == SchedulerState::Running {
                s.state = SchedulerState::Idle;
            }
            s.cycles_completed += 1;
            s.consecutive_failures = if success {
                0
            } else {
                s.consecutive_failures.saturating_add(1)
            };
            s.last_cycle = Some(report.clone());
        });
        // No subscribers is fine.
        let _ = self.reports.send(report);
    }
}
