use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use strata_core::config::{MailConfig, WorkerConfig};
use tokio::{
    sync::{watch, OwnedSemaphorePermit, Semaphore},
    task::{JoinError, JoinSet},
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

use crate::{
    collaborators::{Mailer, ReportExecutor, ResultExporter, TabularResult},
    email::compose_report_email,
    error::{ExecutionError, Result, SchedulerError},
    schedule::compute_next,
    store::ScheduleStore,
    types::{RunStatus, Schedule},
};

/// Source of "now" for the worker.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Tuning for [`ScheduleWorker`].
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Identity recorded on claims. Must be unique per running worker.
    pub worker_id: String,
    pub poll_interval: Duration,
    pub execution_timeout: Duration,
    pub shutdown_grace: Duration,
    pub max_concurrent_runs: usize,
    pub subject_prefix: String,
}

impl WorkerOptions {
    pub fn from_config(worker_id: impl Into<String>, worker: &WorkerConfig, mail: &MailConfig) -> Self {
        Self {
            worker_id: worker_id.into(),
            poll_interval: worker.poll_interval(),
            execution_timeout: worker.execution_timeout(),
            shutdown_grace: worker.shutdown_grace(),
            max_concurrent_runs: worker.max_concurrent_runs,
            subject_prefix: mail.subject_prefix.clone(),
        }
    }
}

/// What happened to one served occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeOutcome {
    pub schedule_id: String,
    pub run_id: String,
    pub status: RunStatus,
    /// The occurrence the schedule was advanced to. `None` once exhausted.
    pub next_run_at: Option<DateTime<Utc>>,
    pub delivered: bool,
    /// The claim was lost before the advance could be committed; nothing was delivered.
    pub superseded: bool,
}

/// Polls the store for due schedules and serves each one exactly once per
/// occurrence.
///
/// Each due schedule is claimed in the store before its report runs, so any
/// number of workers may share a database. Runs execute concurrently (bounded
/// by `max_concurrent_runs`); a slow report never delays discovery of others.
/// A schedule is only claimed once a run slot is free, so a claim is never
/// held while waiting for capacity.
#[derive(Clone)]
pub struct ScheduleWorker {
    inner: Arc<Inner>,
}

struct Inner {
    store: ScheduleStore,
    executor: Arc<dyn ReportExecutor>,
    exporter: Arc<dyn ResultExporter>,
    mailer: Arc<dyn Mailer>,
    clock: Arc<dyn Clock>,
    options: WorkerOptions,
    permits: Arc<Semaphore>,
}

/// Result of one dispatch pass.
#[derive(Debug, Clone, Copy, Default)]
struct Dispatch {
    dispatched: usize,
    /// Due schedules were left unclaimed because every run slot was busy.
    deferred: bool,
}

impl ScheduleWorker {
    pub fn new(
        store: ScheduleStore,
        executor: Arc<dyn ReportExecutor>,
        exporter: Arc<dyn ResultExporter>,
        mailer: Arc<dyn Mailer>,
        options: WorkerOptions,
    ) -> Self {
        Self::with_clock(store, executor, exporter, mailer, options, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: ScheduleStore,
        executor: Arc<dyn ReportExecutor>,
        exporter: Arc<dyn ResultExporter>,
        mailer: Arc<dyn Mailer>,
        options: WorkerOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(options.max_concurrent_runs.max(1)));
        Self {
            inner: Arc::new(Inner {
                store,
                executor,
                exporter,
                mailer,
                clock,
                options,
                permits,
            }),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.options.worker_id
    }

    /// Main loop. Polls every `poll_interval` until `shutdown` broadcasts
    /// `true` (or its sender is dropped), then lets in-flight runs finish
    /// within `shutdown_grace`.
    ///
    /// Returns an error only when the schedule store fails; in-flight runs
    /// are still drained first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let opts = &self.inner.options;
        info!(
            worker_id = %opts.worker_id,
            poll_secs = opts.poll_interval.as_secs_f64(),
            max_concurrent = opts.max_concurrent_runs,
            "schedule worker started"
        );

        match self.inner.store.release_claims(&opts.worker_id) {
            Ok(n) if n > 0 => warn!(count = n, "released claims left by a previous run of this worker"),
            Ok(_) => {}
            Err(e) => return Err(e),
        }

        let mut interval = tokio::time::interval(opts.poll_interval.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tasks: JoinSet<Result<ServeOutcome>> = JoinSet::new();
        let mut fatal: Option<SchedulerError> = None;
        let mut backlog = false;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.dispatch_due(&mut tasks) {
                        Ok(d) => backlog = d.deferred,
                        Err(e) => {
                            error!("poll cycle failed: {e}");
                            fatal = Some(e);
                            break;
                        }
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = settle(joined) {
                        fatal = Some(e);
                        break;
                    }
                    // a slot just opened; pick up what the last poll had to leave
                    if backlog {
                        match self.dispatch_due(&mut tasks) {
                            Ok(d) => backlog = d.deferred,
                            Err(e) => {
                                error!("poll cycle failed: {e}");
                                fatal = Some(e);
                                break;
                            }
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("schedule worker shutting down");
                        break;
                    }
                }
            }
        }

        self.drain(&mut tasks).await;
        info!("schedule worker stopped");
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// One complete poll cycle: dispatch everything due now and wait for all
    /// of it to finish. Runs beyond `max_concurrent_runs` are served in
    /// further rounds as slots free up.
    pub async fn run_once(&self) -> Result<Vec<ServeOutcome>> {
        let mut tasks = JoinSet::new();
        let mut outcomes = Vec::new();
        loop {
            let dispatch = self.dispatch_due(&mut tasks)?;
            while let Some(joined) = tasks.join_next().await {
                if let Some(outcome) = settle(joined)? {
                    outcomes.push(outcome);
                }
            }
            if !dispatch.deferred || dispatch.dispatched == 0 {
                return Ok(outcomes);
            }
        }
    }

    // --- private helpers ---------------------------------------------------

    /// Claim due schedules while run slots are free and spawn their runs.
    /// Performs no writes when nothing is due.
    fn dispatch_due(&self, tasks: &mut JoinSet<Result<ServeOutcome>>) -> Result<Dispatch> {
        let inner = &self.inner;
        let now = inner.clock.now();
        let due = inner.store.get_due_schedules(now)?;
        if due.is_empty() {
            return Ok(Dispatch::default());
        }
        info!(count = due.len(), "processing due schedule(s)");

        let mut dispatch = Dispatch::default();
        for schedule in due {
            let Some(observed) = schedule.next_run_at else {
                continue;
            };
            let Ok(permit) = Arc::clone(&inner.permits).try_acquire_owned() else {
                debug!(
                    in_flight = tasks.len(),
                    "all run slots busy; leaving remaining schedules for later"
                );
                dispatch.deferred = true;
                break;
            };
            match inner.store.claim(&schedule.id, observed, &inner.options.worker_id, now) {
                Ok(()) => {
                    let inner = Arc::clone(&self.inner);
                    tasks.spawn(async move { inner.serve(schedule, permit).await });
                    dispatch.dispatched += 1;
                }
                Err(e) if e.is_concurrent_modification() => {
                    debug!(schedule_id = %schedule.id, "schedule claimed elsewhere; skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(dispatch)
    }

    async fn drain(&self, tasks: &mut JoinSet<Result<ServeOutcome>>) {
        if tasks.is_empty() {
            return;
        }
        let grace = self.inner.options.shutdown_grace;
        info!(in_flight = tasks.len(), grace_secs = grace.as_secs(), "waiting for in-flight runs");
        let finished = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = settle(joined) {
                    error!("run failed during shutdown: {e}");
                }
            }
        })
        .await;
        if finished.is_err() {
            warn!(
                remaining = tasks.len(),
                "grace period elapsed; abandoning in-flight runs (their claims expire)"
            );
            tasks.abort_all();
        }
    }
}

/// Unpack a finished run task. Store failures propagate; panics and
/// non-fatal errors are logged and swallowed.
fn settle(
    joined: std::result::Result<Result<ServeOutcome>, JoinError>,
) -> Result<Option<ServeOutcome>> {
    match joined {
        Ok(Ok(outcome)) => Ok(Some(outcome)),
        Ok(Err(e)) if e.is_fatal() => Err(e),
        Ok(Err(e)) => {
            error!("schedule run ended with error: {e}");
            Ok(None)
        }
        Err(e) if e.is_cancelled() => Ok(None),
        Err(e) => {
            error!("schedule run task panicked: {e}");
            Ok(None)
        }
    }
}

impl Inner {
    /// Execute one claimed occurrence, record it, advance the schedule and
    /// deliver the result.
    async fn serve(&self, schedule: Schedule, _permit: OwnedSemaphorePermit) -> Result<ServeOutcome> {
        let run_id = self.store.start_run(&schedule, self.clock.now())?;
        info!(schedule_id = %schedule.id, name = %schedule.name, %run_id, "running schedule");

        let started = Instant::now();
        let timeout = self.options.execution_timeout;
        let executed = match tokio::time::timeout(
            timeout,
            self.executor.execute(&schedule.report_id, &schedule.parameters),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ExecutionError(format!(
                "execution timed out after {}s",
                timeout.as_secs_f64()
            ))),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match executed {
            Ok(result) => {
                let cache_handle = match self.exporter.write_cache(&run_id, &result).await {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        warn!(schedule_id = %schedule.id, %run_id, "result cache write failed: {e}");
                        None
                    }
                };
                self.store.complete_run(
                    &run_id,
                    result.row_count() as u64,
                    duration_ms,
                    cache_handle.as_deref(),
                    self.clock.now(),
                )?;
                info!(
                    schedule_id = %schedule.id,
                    rows = result.row_count(),
                    duration_ms,
                    "schedule run completed"
                );
                Some(result)
            }
            Err(e) => {
                self.store.fail_run(&run_id, &e.0, duration_ms, self.clock.now())?;
                error!(schedule_id = %schedule.id, %run_id, "schedule run failed: {e}");
                None
            }
        };

        // Advance from the moment the occurrence was served, never from the
        // occurrence itself: missed occurrences are skipped, not queued.
        let serviced_at = self.clock.now();
        let tz = self.store.timezone_for(&schedule);
        let next_run_at = match compute_next(&schedule.definition, serviced_at, &tz) {
            Ok(next) => next,
            Err(e) => {
                error!(schedule_id = %schedule.id, "cannot compute next occurrence, disabling: {e}");
                None
            }
        };
        let last_run_at = result.as_ref().map(|_| serviced_at);

        let mut outcome = ServeOutcome {
            schedule_id: schedule.id.clone(),
            run_id: run_id.clone(),
            status: if result.is_some() {
                RunStatus::Completed
            } else {
                RunStatus::Failed
            },
            next_run_at,
            delivered: false,
            superseded: false,
        };

        match self.store.claim_and_advance(
            &schedule.id,
            &self.options.worker_id,
            next_run_at,
            last_run_at,
        ) {
            Ok(()) => {}
            Err(e) if e.is_concurrent_modification() => {
                warn!(schedule_id = %schedule.id, "claim lost before advance; result not delivered");
                outcome.superseded = true;
                return Ok(outcome);
            }
            Err(e) => return Err(e),
        }

        match next_run_at {
            Some(next) => info!(schedule_id = %schedule.id, next_run_at = %next, "schedule advanced"),
            None => info!(schedule_id = %schedule.id, "schedule has no future runs (disabled)"),
        }

        if let Some(result) = result {
            outcome.delivered = self.deliver(&schedule, &run_id, &result).await?;
        }
        Ok(outcome)
    }

    /// Email the result. A failed hand-off is recorded on the run and does
    /// not fail it.
    async fn deliver(&self, schedule: &Schedule, run_id: &str, result: &TabularResult) -> Result<bool> {
        if schedule.recipients.is_empty() {
            debug!(schedule_id = %schedule.id, "no recipients; skipping delivery");
            return Ok(false);
        }

        let report_name = match self.store.get_report(&schedule.report_id) {
            Ok(report) => report.name,
            Err(SchedulerError::ReportNotFound { .. }) => schedule.name.clone(),
            Err(e) => return Err(e),
        };

        let attachment = match self.exporter.render_attachment(&report_name, result) {
            Ok(a) => Some(a),
            Err(e) => {
                warn!(schedule_id = %schedule.id, "attachment rendering failed: {e}");
                None
            }
        };

        let email = compose_report_email(
            &self.options.subject_prefix,
            &report_name,
            &schedule.recipients,
            result,
            schedule.max_inline_rows,
            attachment,
        );

        match self.mailer.send(&email).await {
            Ok(()) => {
                info!(schedule_id = %schedule.id, recipients = ?schedule.recipients, "email sent");
                Ok(true)
            }
            Err(e) => {
                warn!(schedule_id = %schedule.id, "failed to send email: {e}");
                self.store.record_delivery_error(run_id, &e.0)?;
                Ok(false)
            }
        }
    }
}
