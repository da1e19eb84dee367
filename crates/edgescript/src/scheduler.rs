//! Time-driven trigger scheduling.
//!
//! Two disjoint strategies coexist. Fixed-interval triggers each get a
//! dedicated ticker task. Cron triggers all share one dispatcher task that
//! sleeps until the earliest upcoming occurrence across every registered
//! expression (6-field, seconds resolution). Both strategies re-check the
//! time-of-day / day-of-week gate immediately before every fire, so a
//! trigger added on Friday with a weekday-only gate goes quiet over the
//! weekend without being touched.
//!
//! The running flag lives behind its own mutex, separate from the job map,
//! so `stop` can flip it and then tear the jobs down without lock ordering
//! hazards.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, NaiveTime};
use cron::Schedule;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dispatch::{trigger_input, ScriptDispatcher};
use crate::error::Error;
use crate::script::{PeriodicConfig, TriggerType};
use crate::trigger::Trigger;

enum JobKind {
    Interval {
        handle: JoinHandle<()>,
    },
    Cron {
        schedule: Schedule,
        next_fire: Option<DateTime<Local>>,
    },
}

struct Job {
    trigger: Arc<Trigger>,
    kind: JobKind,
}

/// Manages periodic triggers: fixed-interval tickers and cron schedules.
pub struct Scheduler {
    dispatcher: RwLock<Option<Arc<dyn ScriptDispatcher>>>,
    jobs: Mutex<HashMap<String, Job>>,
    running: Mutex<bool>,
    cron_notify: Arc<Notify>,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let jobs = self.lock_jobs().len();
        f.debug_struct("Scheduler")
            .field("jobs", &jobs)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            dispatcher: RwLock::new(None),
            jobs: Mutex::new(HashMap::new()),
            running: Mutex::new(false),
            cron_notify: Arc::new(Notify::new()),
            shutdown: Mutex::new(None),
        }
    }
}

impl Scheduler {
    /// Create a stopped scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire the dispatcher that gated fires enqueue into.
    pub fn set_dispatcher(&self, dispatcher: Arc<dyn ScriptDispatcher>) {
        *self
            .dispatcher
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(dispatcher);
    }

    /// Whether the scheduler accepts and fires triggers.
    #[must_use]
    pub fn is_running(&self) -> bool {
        *self
            .running
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Start scheduling. Idempotent.
    pub fn start(self: &Arc<Self>) {
        {
            let mut running = self
                .running
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if *running {
                return;
            }
            *running = true;
        }

        let token = CancellationToken::new();
        *self
            .shutdown
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(token.clone());

        let weak = Arc::downgrade(self);
        let notify = Arc::clone(&self.cron_notify);
        tokio::spawn(async move { cron_loop(weak, notify, token).await });
        tracing::debug!("Scheduler started");
    }

    /// Stop scheduling: cancels the cron dispatcher, aborts every interval
    /// ticker, and clears the job map.
    pub fn stop(&self) {
        {
            let mut running = self
                .running
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if !*running {
                return;
            }
            *running = false;
        }

        if let Some(token) = self
            .shutdown
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }

        let mut jobs = self.lock_jobs();
        for job in jobs.values() {
            if let JobKind::Interval { handle, .. } = &job.kind {
                handle.abort();
            }
        }
        jobs.clear();
        tracing::debug!("Scheduler stopped");
    }

    /// Register a periodic trigger.
    ///
    /// # Errors
    ///
    /// - [`Error::SchedulerNotRunning`] if called while stopped.
    /// - [`Error::TriggerConfig`] for non-periodic triggers, duplicate ids,
    ///   missing schedules, non-positive intervals, or invalid cron syntax.
    pub fn add_trigger(self: &Arc<Self>, trigger: Trigger) -> Result<(), Error> {
        if !self.is_running() {
            return Err(Error::SchedulerNotRunning);
        }
        if trigger.trigger_type != TriggerType::Periodic {
            return Err(Error::TriggerConfig(format!(
                "trigger '{}' is not periodic",
                trigger.id
            )));
        }
        let Some(periodic) = trigger.periodic.clone() else {
            return Err(Error::TriggerConfig(format!(
                "periodic trigger '{}' has no schedule",
                trigger.id
            )));
        };

        let trigger = Arc::new(trigger);
        let kind = if let Some(period) = periodic.interval() {
            if period.is_zero() {
                return Err(Error::TriggerConfig(format!(
                    "periodic trigger '{}' has a zero interval",
                    trigger.id
                )));
            }
            JobKind::Interval {
                handle: self.spawn_ticker(Arc::clone(&trigger), period),
            }
        } else if let Some(expression) = periodic.cron.as_deref() {
            let schedule = Schedule::from_str(expression).map_err(|e| {
                Error::TriggerConfig(format!(
                    "invalid cron expression '{expression}': {e}"
                ))
            })?;
            let next_fire = schedule.upcoming(Local).next();
            JobKind::Cron { schedule, next_fire }
        } else {
            return Err(Error::TriggerConfig(format!(
                "periodic trigger '{}' needs a cron expression or a positive interval",
                trigger.id
            )));
        };

        {
            let mut jobs = self.lock_jobs();
            if jobs.contains_key(&trigger.id) {
                if let JobKind::Interval { handle, .. } = &kind {
                    handle.abort();
                }
                return Err(Error::TriggerConfig(format!(
                    "trigger id already scheduled: {}",
                    trigger.id
                )));
            }
            jobs.insert(trigger.id.clone(), Job { trigger: Arc::clone(&trigger), kind });
        }

        self.cron_notify.notify_one();
        tracing::debug!(trigger_id = %trigger.id, "Periodic trigger scheduled");
        Ok(())
    }

    /// Remove a scheduled trigger, stopping its ticker or cron job.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TriggerConfig`] if the id is unknown.
    pub fn remove_trigger(&self, trigger_id: &str) -> Result<(), Error> {
        let job = self.lock_jobs().remove(trigger_id).ok_or_else(|| {
            Error::TriggerConfig(format!("unknown scheduled trigger: {trigger_id}"))
        })?;
        if let JobKind::Interval { handle, .. } = &job.kind {
            handle.abort();
        }
        self.cron_notify.notify_one();
        tracing::debug!(trigger_id = %trigger_id, "Periodic trigger removed");
        Ok(())
    }

    /// Change the period of a fixed-interval trigger in place.
    ///
    /// Cron triggers cannot be retimed; remove and re-add them instead.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TriggerConfig`] for unknown ids, cron triggers, or a
    /// zero interval.
    pub fn update_trigger_interval(
        self: &Arc<Self>,
        trigger_id: &str,
        period: Duration,
    ) -> Result<(), Error> {
        if period.is_zero() {
            return Err(Error::TriggerConfig(format!(
                "zero interval for trigger '{trigger_id}'"
            )));
        }

        let mut jobs = self.lock_jobs();
        let job = jobs.get_mut(trigger_id).ok_or_else(|| {
            Error::TriggerConfig(format!("unknown scheduled trigger: {trigger_id}"))
        })?;
        match &mut job.kind {
            JobKind::Cron { .. } => Err(Error::TriggerConfig(format!(
                "trigger '{trigger_id}' is cron-scheduled; remove and re-add it"
            ))),
            JobKind::Interval { handle } => {
                handle.abort();
                *handle = self.spawn_ticker(Arc::clone(&job.trigger), period);
                tracing::debug!(trigger_id = %trigger_id, ?period, "Interval updated");
                Ok(())
            }
        }
    }

    /// Number of scheduled triggers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_jobs().len()
    }

    /// Whether no triggers are scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_jobs().is_empty()
    }

    fn spawn_ticker(self: &Arc<Self>, trigger: Arc<Trigger>, period: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(scheduler) = Weak::upgrade(&weak) else { break };
                scheduler.fire_if_gated(&trigger);
            }
        })
    }

    /// Apply the time-window gate and dispatch when it passes.
    fn fire_if_gated(&self, trigger: &Trigger) {
        if !trigger.is_enabled() {
            return;
        }
        if let Some(periodic) = &trigger.periodic {
            if !gate_allows(periodic, Local::now()) {
                tracing::trace!(trigger_id = %trigger.id, "Fire suppressed by time window");
                return;
            }
        }

        let dispatcher = self
            .dispatcher
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        let Some(dispatcher) = dispatcher else {
            tracing::warn!(trigger_id = %trigger.id, "No dispatcher wired, fire dropped");
            return;
        };

        trigger.record_fire();
        let input = trigger_input(trigger.trigger_type, &trigger.id);
        if let Err(err) = dispatcher.execute_async(&trigger.script_id, input) {
            tracing::warn!(
                trigger_id = %trigger.id,
                script_id = %trigger.script_id,
                error = %err,
                "Scheduled dispatch rejected"
            );
        }
    }

    /// Earliest upcoming cron occurrence across all jobs.
    fn next_cron_fire(&self) -> Option<DateTime<Local>> {
        self.lock_jobs()
            .values()
            .filter_map(|job| match &job.kind {
                JobKind::Cron { next_fire, .. } => *next_fire,
                JobKind::Interval { .. } => None,
            })
            .min()
    }

    /// Collect cron jobs due at `now`, advancing their next occurrence.
    fn take_due_cron(&self, now: DateTime<Local>) -> Vec<Arc<Trigger>> {
        let mut due = Vec::new();
        let mut jobs = self.lock_jobs();
        for job in jobs.values_mut() {
            if let JobKind::Cron { schedule, next_fire } = &mut job.kind {
                if next_fire.is_some_and(|at| at <= now) {
                    due.push(Arc::clone(&job.trigger));
                    *next_fire = schedule.after(&now).next();
                }
            }
        }
        due
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Job>> {
        self.jobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Shared dispatcher for every cron trigger: sleeps until the earliest next
/// occurrence, fires the due jobs, repeats. Woken early when the job set
/// changes.
async fn cron_loop(weak: Weak<Scheduler>, notify: Arc<Notify>, token: CancellationToken) {
    loop {
        let Some(scheduler) = Weak::upgrade(&weak) else { break };
        let next = scheduler.next_cron_fire();
        drop(scheduler);

        match next {
            None => {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = notify.notified() => {}
                }
            }
            Some(at) => {
                let wait = (at - Local::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    () = token.cancelled() => break,
                    () = notify.notified() => {}
                    () = tokio::time::sleep(wait) => {
                        let Some(scheduler) = Weak::upgrade(&weak) else { break };
                        let now = Local::now();
                        for trigger in scheduler.take_due_cron(now) {
                            scheduler.fire_if_gated(&trigger);
                        }
                    }
                }
            }
        }
    }
}

/// Time-window gate: day-of-week allow-list (Monday = 1 … Sunday = 7) and an
/// optional `[start, end]` wall-clock window, either bound optional.
fn gate_allows(config: &PeriodicConfig, now: DateTime<Local>) -> bool {
    if let Some(days) = &config.days_of_week {
        if !days.is_empty() {
            let today = now.weekday().number_from_monday() as u8;
            if !days.contains(&today) {
                return false;
            }
        }
    }

    let time = now.time();
    if let Some(start) = config.start_time.as_deref() {
        match parse_time_of_day(start) {
            Some(bound) if time >= bound => {}
            Some(_) => return false,
            None => {
                tracing::warn!(start_time = %start, "Unparseable window start, fire suppressed");
                return false;
            }
        }
    }
    if let Some(end) = config.end_time.as_deref() {
        match parse_time_of_day(end) {
            Some(bound) if time <= bound => {}
            Some(_) => return false,
            None => {
                tracing::warn!(end_time = %end, "Unparseable window end, fire suppressed");
                return false;
            }
        }
    }

    true
}

/// Parse `HH:MM:SS` or `HH:MM`.
fn parse_time_of_day(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .ok()
}
