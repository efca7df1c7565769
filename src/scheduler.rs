//! Cadence scheduler
//!
//! One recurring timer per cadence tier. Each tick scans the tier's records
//! and restakes the accounts one after another, writing every outcome back to
//! the record store. A tier whose [`ActiveJob`] is already in the store at
//! startup is left alone so a crashed run never ends up scheduled twice.

use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::restake::{RestakeEngine, RestakeOutcome};
use crate::store::RecordStore;
use crate::types::{ActiveJob, Amount, Cadence, Record};

/// Timer period per tier, with optional overrides of the defaults
#[derive(Debug, Clone, Default)]
pub struct TierPeriods {
    overrides: HashMap<Cadence, Duration>,
}

impl TierPeriods {
    pub fn with_override(mut self, cadence: Cadence, period: Duration) -> Self {
        self.overrides.insert(cadence, period);
        self
    }

    pub fn period(&self, cadence: Cadence) -> Option<Duration> {
        self.overrides
            .get(&cadence)
            .copied()
            .or_else(|| cadence.period())
    }
}

/// Counters for one tick
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub accounts: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub pending: usize,
    pub restaked: Amount,
}

enum AccountResult {
    Succeeded(Amount),
    Failed,
    Pending,
    Skipped,
}

pub struct Scheduler {
    store: Arc<RecordStore>,
    engine: Arc<RestakeEngine>,
    periods: TierPeriods,
    /// Stops the timers; a tick already running completes
    stop: CancellationToken,
    /// Cancels chain calls of the tick in flight
    abort: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(store: Arc<RecordStore>, engine: Arc<RestakeEngine>, periods: TierPeriods) -> Self {
        Self {
            store,
            engine,
            periods,
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Install a timer for every tier without an active job. Returns the tiers
    /// installed by this call.
    pub fn start(self: &Arc<Self>) -> Result<Vec<Cadence>> {
        let mut installed = Vec::new();

        for cadence in Cadence::SCHEDULED {
            if let Some(existing) = self.store.get_active_job(cadence)? {
                warn!(
                    %cadence,
                    handle = %existing.handle,
                    started_at = existing.started_at,
                    "Active job already recorded for tier, not installing another timer"
                );
                continue;
            }
            let Some(period) = self.periods.period(cadence) else {
                continue;
            };

            let job = ActiveJob::new(cadence);
            self.store.put_active_job(&job)?;
            let handle = tokio::spawn(Arc::clone(self).run_timer(cadence, period));
            self.tasks.lock().push(handle);

            info!(%cadence, handle = %job.handle, period_secs = period.as_secs(), "Installed tier timer");
            installed.push(cadence);
        }

        Ok(installed)
    }

    async fn run_timer(self: Arc<Self>, cadence: Cadence, period: Duration) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {
                    match self.run_tick(cadence).await {
                        Ok(summary) => info!(%cadence, ?summary, "Tick complete"),
                        Err(e) => error!(%cadence, "Tick failed: {}", e),
                    }
                }
            }
        }
        debug!(%cadence, "Tier timer stopped");
    }

    /// Restake every account filed under `cadence`, sequentially. One
    /// account's failure is recorded on its record and never stops the batch.
    pub async fn run_tick(&self, cadence: Cadence) -> Result<TickSummary> {
        let records = self.store.scan_by_cadence(cadence)?;
        let mut summary = TickSummary {
            accounts: records.len(),
            ..Default::default()
        };
        info!(%cadence, accounts = records.len(), "Tick started");

        for record in records {
            if self.abort.is_cancelled() {
                warn!(%cadence, "Tick aborted");
                break;
            }
            match self.process(&record).await {
                AccountResult::Succeeded(amount) => {
                    summary.succeeded += 1;
                    summary.restaked = summary.restaked.saturating_add(amount);
                }
                AccountResult::Failed => summary.failed += 1,
                AccountResult::Pending => summary.pending += 1,
                AccountResult::Skipped => {}
            }
        }

        Ok(summary)
    }

    async fn process(&self, record: &Record) -> AccountResult {
        let address = record.address.as_str();

        if let Some(pending) = &record.pending_tx {
            match self.engine.settle_pending(&self.store, record, &self.abort).await {
                Ok(_) => {}
                Err(Error::Cancelled) => return AccountResult::Skipped,
                Err(e) => {
                    // The earlier transaction may still land; do not send another
                    warn!(%address, tx_hash = %pending.tx_hash, "Reconciliation failed: {}", e);
                    let now = Utc::now();
                    self.write(address, |r| r.record_failure(&e, now));
                    return AccountResult::Failed;
                }
            }
        }

        let now = Utc::now();
        match self.engine.restake(address, record.tolerance, &self.abort).await {
            Ok(outcome) => {
                self.write(address, |r| outcome.apply(r, now));
                match outcome {
                    RestakeOutcome::Pending(_) => AccountResult::Pending,
                    outcome => {
                        let restaked = outcome.restaked();
                        info!(%address, %restaked, "Restaked");
                        AccountResult::Succeeded(restaked)
                    }
                }
            }
            // Aborted before anything was submitted
            Err(Error::Cancelled) => AccountResult::Skipped,
            Err(e) => {
                error!(%address, "Restake failed: {}", e);
                self.write(address, |r| r.record_failure(&e, now));
                AccountResult::Failed
            }
        }
    }

    /// Read-modify-write of one record. A record removed mid-tick stays removed.
    fn write<F>(&self, address: &str, f: F)
    where
        F: Fn(&mut Record),
    {
        match self.store.update(address, f) {
            Ok(_) => {}
            Err(Error::RecordNotFound(_)) => debug!(%address, "Record removed during tick"),
            Err(e) => error!(%address, "Failed to store run result: {}", e),
        }
    }

    /// Cancel chain calls of the tick in flight. Remaining accounts are skipped.
    pub fn abort_in_flight(&self) {
        self.abort.cancel();
    }

    /// Stop every timer, wait for running ticks, then clear the active job
    /// table. Returns the number of jobs cleared.
    pub async fn shutdown(&self) -> Result<usize> {
        self.stop.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!("Tier timer task failed: {}", e);
            }
        }

        let cleared = self.store.clear_all_active_jobs()?;
        info!("Scheduler stopped, cleared {} active job(s)", cleared);
        Ok(cleared)
    }
}
