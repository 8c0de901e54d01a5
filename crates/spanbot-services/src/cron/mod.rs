//! Persistent timer-wheel scheduler.
//!
//! All jobs live in memory, loaded from the single JSON store at start.
//! One armed timer sleeps until the minimum `next_run_at_ms` across all
//! enabled jobs; mutations wake it through a [`Notify`] so it re-arms
//! immediately. Due jobs run sequentially in `next_run_at_ms` order
//! through the user-supplied handler; the whole store is rewritten after
//! every mutation, execution, and rearm. A watcher re-reads the store
//! every five seconds to pick up external edits (e.g. CLI-added jobs).

pub mod schedule;
pub mod storage;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use spanbot_types::cron::{CronJob, CronStore, JobStatus, ScheduleKind};
use spanbot_types::event::OutboundMessage;

use crate::error::{Result, ServiceError};
use schedule::{STALE_AT_THRESHOLD_MS, compute_next_run, validate_schedule};
use storage::CronStorage;

/// Handler invoked for each firing job; returns the agent's response.
pub type JobHandler = Arc<dyn Fn(CronJob) -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// Sink for delivery-target outbound messages.
pub type DeliverFn = Arc<dyn Fn(OutboundMessage) + Send + Sync>;

/// Default interval for the external-edit watcher.
const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(5);

/// Longest sleep when no job is armed (the rearm notify cuts it short).
const IDLE_SLEEP: Duration = Duration::from_secs(3600);

/// Timer-wheel scheduler over a persistent job store.
pub struct CronService {
    storage: CronStorage,
    jobs: Mutex<HashMap<String, CronJob>>,
    on_job: JobHandler,
    on_deliver: Option<DeliverFn>,
    rearm: Notify,
    last_saved: Mutex<Option<SystemTime>>,
    watch_interval: Duration,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl CronService {
    /// Load the store and arm every enabled job.
    pub async fn new(
        store_path: PathBuf,
        on_job: JobHandler,
        on_deliver: Option<DeliverFn>,
    ) -> Result<Self> {
        let storage = CronStorage::new(store_path);
        let store = storage.load().await?;
        let now = now_ms();

        let mut jobs = HashMap::new();
        for mut job in store.jobs {
            arm_job(&mut job, now);
            jobs.insert(job.id.clone(), job);
        }

        info!(jobs = jobs.len(), "cron service loaded");
        let service = Self {
            storage,
            jobs: Mutex::new(jobs),
            on_job,
            on_deliver,
            rearm: Notify::new(),
            last_saved: Mutex::new(None),
            watch_interval: DEFAULT_WATCH_INTERVAL,
        };
        service.save().await?;
        Ok(service)
    }

    /// Override the external-edit watch interval (tests).
    pub fn with_watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = interval;
        self
    }

    /// Add a job; an empty id is replaced with a generated `job-{uuid8}`.
    pub async fn add_job(&self, mut job: CronJob) -> Result<String> {
        validate_schedule(&job)?;

        if job.id.is_empty() {
            job.id = generate_job_id();
        }
        let now = now_ms();
        job.created_at_ms = now;
        job.updated_at_ms = now;
        arm_job(&mut job, now);

        let id = job.id.clone();
        self.jobs.lock().await.insert(id.clone(), job);
        self.save().await?;
        self.rearm.notify_waiters();

        info!(job = %id, "cron job added");
        Ok(id)
    }

    /// Remove a job by id.
    pub async fn remove_job(&self, job_id: &str) -> Result<()> {
        if self.jobs.lock().await.remove(job_id).is_none() {
            return Err(ServiceError::JobNotFound(job_id.to_owned()));
        }
        self.save().await?;
        self.rearm.notify_waiters();
        info!(job = %job_id, "cron job removed");
        Ok(())
    }

    /// Enable or disable a job; re-enabling re-arms it.
    pub async fn enable_job(&self, job_id: &str, enabled: bool) -> Result<()> {
        {
            let mut jobs = self.jobs.lock().await;
            let job = jobs
                .get_mut(job_id)
                .ok_or_else(|| ServiceError::JobNotFound(job_id.to_owned()))?;
            job.enabled = enabled;
            job.updated_at_ms = now_ms();
            if enabled {
                job.state.next_run_at_ms = None;
                arm_job(job, now_ms());
            }
        }
        self.save().await?;
        self.rearm.notify_waiters();
        info!(job = %job_id, enabled, "cron job toggled");
        Ok(())
    }

    /// All jobs, sorted by creation time.
    pub async fn list_jobs(&self) -> Vec<CronJob> {
        let jobs = self.jobs.lock().await;
        let mut list: Vec<CronJob> = jobs.values().cloned().collect();
        list.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms).then(a.id.cmp(&b.id)));
        list
    }

    /// Fire a job immediately, bypassing its schedule.
    pub async fn run_job_now(&self, job_id: &str) -> Result<()> {
        if !self.jobs.lock().await.contains_key(job_id) {
            return Err(ServiceError::JobNotFound(job_id.to_owned()));
        }
        self.execute_job(job_id, true).await;
        self.rearm.notify_waiters();
        Ok(())
    }

    /// The minimum armed wake time across all enabled jobs.
    pub async fn next_wake_ms(&self) -> Option<i64> {
        self.jobs
            .lock()
            .await
            .values()
            .filter(|j| j.enabled)
            .filter_map(|j| j.state.next_run_at_ms)
            .min()
    }

    /// Run the armed timer until cancelled.
    pub async fn start(&self, cancel: tokio_util::sync::CancellationToken) {
        info!("cron service started");
        let mut watcher = tokio::time::interval(self.watch_interval);
        watcher.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        watcher.tick().await;

        loop {
            let sleep_for = match self.next_wake_ms().await {
                Some(at) => Duration::from_millis((at - now_ms()).max(0) as u64),
                None => IDLE_SLEEP,
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("cron service shutting down");
                    return;
                }
                _ = self.rearm.notified() => continue,
                _ = watcher.tick() => {
                    self.check_external_edits().await;
                }
                _ = tokio::time::sleep(sleep_for) => {
                    self.tick().await;
                }
            }
        }
    }

    /// Run every due job in `next_run_at_ms` order, then persist.
    async fn tick(&self) {
        let now = now_ms();
        let mut due: Vec<(i64, String)> = {
            let jobs = self.jobs.lock().await;
            jobs.values()
                .filter(|j| j.enabled)
                .filter_map(|j| {
                    j.state
                        .next_run_at_ms
                        .filter(|&at| at <= now)
                        .map(|at| (at, j.id.clone()))
                })
                .collect()
        };
        due.sort();

        for (_, id) in due {
            self.execute_job(&id, false).await;
        }
    }

    /// Execute one job and update its state.
    async fn execute_job(&self, job_id: &str, manual: bool) {
        let Some(job) = self.jobs.lock().await.get(job_id).cloned() else {
            return;
        };

        let now = now_ms();

        // A one-shot that overslept its target by more than five minutes
        // is skipped permanently rather than fired late.
        if !manual
            && job.schedule.kind == ScheduleKind::At
            && let Some(at) = job.state.next_run_at_ms
            && now - at > STALE_AT_THRESHOLD_MS
        {
            warn!(job = %job_id, "one-shot overslept its window, skipping");
            let mut jobs = self.jobs.lock().await;
            if let Some(j) = jobs.get_mut(job_id) {
                j.state.next_run_at_ms = None;
                j.state.last_status = Some(JobStatus::Skipped);
                j.updated_at_ms = now;
            }
            drop(jobs);
            if let Err(e) = self.save().await {
                error!(error = %e, "failed to persist cron store");
            }
            return;
        }

        info!(job = %job_id, name = %job.name, "firing cron job");
        let result = (self.on_job)(job.clone()).await;
        let now = now_ms();

        if let Ok(response) = &result
            && job.payload.deliver
            && !response.is_empty()
            && let (Some(channel), Some(to)) = (&job.payload.channel, &job.payload.to)
            && let Some(deliver) = &self.on_deliver
        {
            deliver(OutboundMessage::new(
                channel.clone(),
                to.clone(),
                response.clone(),
            ));
        }

        {
            let mut jobs = self.jobs.lock().await;
            if let Some(j) = jobs.get_mut(job_id) {
                j.state.last_run_at_ms = Some(now);
                j.updated_at_ms = now;
                match &result {
                    Ok(_) => {
                        j.state.last_status = Some(JobStatus::Ok);
                        j.state.last_error = None;
                    }
                    Err(e) => {
                        j.state.last_status = Some(JobStatus::Error);
                        j.state.last_error = Some(e.to_string());
                        error!(job = %job_id, error = %e, "cron job failed");
                    }
                }

                // One-shots leave the store after any run, successful or not.
                if j.schedule.kind == ScheduleKind::At || j.delete_after_run {
                    jobs.remove(job_id);
                    debug!(job = %job_id, "one-shot job removed after run");
                } else {
                    j.state.next_run_at_ms = compute_next_run(j, now);
                }
            }
        }

        if let Err(e) = self.save().await {
            error!(error = %e, "failed to persist cron store");
        }
    }

    /// Reload the store when someone else modified the file.
    async fn check_external_edits(&self) {
        let current = self.storage.modified();
        let last = *self.last_saved.lock().await;
        if current == last || current.is_none() {
            return;
        }

        match self.storage.load().await {
            Ok(store) => {
                info!(jobs = store.jobs.len(), "cron store changed externally, reloading");
                let now = now_ms();
                let mut jobs = self.jobs.lock().await;
                jobs.clear();
                for mut job in store.jobs {
                    arm_job(&mut job, now);
                    jobs.insert(job.id.clone(), job);
                }
                drop(jobs);
                *self.last_saved.lock().await = current;
                self.rearm.notify_waiters();
            }
            Err(e) => warn!(error = %e, "failed to reload cron store"),
        }
    }

    async fn save(&self) -> Result<()> {
        let store = CronStore {
            version: 1,
            jobs: self.list_jobs().await,
        };
        self.storage.save(&store).await?;
        *self.last_saved.lock().await = self.storage.modified();
        Ok(())
    }
}

/// Generate a short unique job id.
pub fn generate_job_id() -> String {
    format!("job-{}", &uuid::Uuid::new_v4().to_string()[..8])
}

/// Ensure a job has a next run time when its schedule still has one.
fn arm_job(job: &mut CronJob, now: i64) {
    if !job.enabled {
        return;
    }
    if job.state.next_run_at_ms.is_none() {
        job.state.next_run_at_ms = compute_next_run(job, now);
        if job.state.next_run_at_ms.is_none() && job.schedule.kind == ScheduleKind::At {
            job.state.last_status = Some(JobStatus::Skipped);
        }
    }
}
