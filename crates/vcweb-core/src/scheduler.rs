//! Periodic tick scheduler.
//!
//! Each tick ends timed rounds whose duration has run out. When daily
//! rounds are enabled the first tick of every calendar day also runs the
//! daily pass: active daily experiments advance (or complete after their
//! final round) strictly before inactive ones scheduled for the day are
//! activated. Every experiment records the day it was last moved, so a
//! repeated daily pass on the same day changes nothing.
//!
//! Experiments are held behind their own `tokio` mutex; a failing
//! experiment is logged and skipped without affecting the others.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};
use vcweb_types::ExperimentStatus;

use crate::config::SchedulerConfig;
use crate::experiment::{Experiment, ExperimentError, Transition};

/// An experiment shared between the scheduler and its callers.
pub type SharedExperiment = Arc<Mutex<Experiment>>;

/// Smallest accepted tick interval in milliseconds.
pub const MIN_TICK_INTERVAL_MS: u64 = 100;

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

/// Runtime control shared with the scheduler loop.
#[derive(Debug)]
pub struct SchedulerControl {
    stop_requested: AtomicBool,
    wake: Notify,
    tick_interval_ms: AtomicU64,
}

impl SchedulerControl {
    /// Control state with the given tick interval.
    pub fn new(tick_interval_ms: u64) -> Self {
        Self {
            stop_requested: AtomicBool::new(false),
            wake: Notify::new(),
            tick_interval_ms: AtomicU64::new(tick_interval_ms.max(MIN_TICK_INTERVAL_MS)),
        }
    }

    /// Ask the loop to stop and wake it if it is sleeping.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    /// Whether a stop has been requested.
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Current tick interval in milliseconds.
    pub fn tick_interval_ms(&self) -> u64 {
        self.tick_interval_ms.load(Ordering::Acquire)
    }

    /// Change the tick interval. Returns the previous interval, or `None`
    /// if `ms` is below [`MIN_TICK_INTERVAL_MS`].
    pub fn set_tick_interval_ms(&self, ms: u64) -> Option<u64> {
        if ms < MIN_TICK_INTERVAL_MS {
            return None;
        }
        Some(self.tick_interval_ms.swap(ms, Ordering::AcqRel))
    }
}

// ---------------------------------------------------------------------------
// Daily transitions
// ---------------------------------------------------------------------------

/// What the daily pass did to one experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DailyOutcome {
    /// Moved to the next round or repetition.
    Advanced,
    /// Finished its final round.
    Completed,
    /// Activated on its start date.
    Activated,
    /// Nothing to do today.
    Skipped,
}

impl Experiment {
    /// Daily advance of an active daily-round experiment. Skipped when the
    /// experiment already moved today or was activated today.
    ///
    /// # Errors
    ///
    /// See [`Experiment::advance_to_next_round`].
    pub fn advance_daily(&mut self, today: NaiveDate) -> Result<DailyOutcome, ExperimentError> {
        if !self.configuration.has_daily_rounds || !self.is_active() {
            return Ok(DailyOutcome::Skipped);
        }
        let activated_today = self
            .date_activated
            .is_some_and(|d| d.date_naive() == today);
        if self.last_daily_advance == Some(today) || activated_today {
            debug!(experiment_id = %self.id, %today, "Already moved today");
            return Ok(DailyOutcome::Skipped);
        }
        self.transaction("advance_daily", |e, pending| {
            let outcome = if e.should_repeat() || e.has_next_round() {
                e.advance_in(pending)?;
                DailyOutcome::Advanced
            } else {
                e.complete_in(pending)?;
                DailyOutcome::Completed
            };
            e.last_daily_advance = Some(today);
            Ok(outcome)
        })
    }

    /// Activate an inactive daily-round experiment whose start date is
    /// `today`.
    ///
    /// # Errors
    ///
    /// See [`Experiment::activate`].
    pub fn activate_if_due(&mut self, today: NaiveDate) -> Result<DailyOutcome, ExperimentError> {
        if !self.configuration.has_daily_rounds
            || self.status != ExperimentStatus::Inactive
            || self.start_date != Some(today)
        {
            return Ok(DailyOutcome::Skipped);
        }
        self.transaction("activate_if_due", |e, pending| {
            let outcome = match e.activate_in(pending)? {
                Transition::Applied => DailyOutcome::Activated,
                Transition::NoOp(_) => DailyOutcome::Skipped,
            };
            e.last_daily_advance = Some(today);
            Ok(outcome)
        })
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Counts from one daily pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DailyReport {
    /// Experiments advanced.
    pub advanced: usize,
    /// Experiments completed.
    pub completed: usize,
    /// Experiments activated.
    pub activated: usize,
    /// Experiments whose transition failed.
    pub failed: usize,
}

/// Counts from one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Rounds ended because their time ran out.
    pub expired_rounds: usize,
    /// The daily pass, when one ran.
    pub daily: Option<DailyReport>,
}

/// Drives every registered experiment from the periodic tick.
#[derive(Debug, Default)]
pub struct Scheduler {
    experiments: Vec<SharedExperiment>,
    daily_rounds_enabled: bool,
    last_daily_pass: Option<NaiveDate>,
}

impl Scheduler {
    /// An empty scheduler.
    pub const fn new(config: &SchedulerConfig) -> Self {
        Self {
            experiments: Vec::new(),
            daily_rounds_enabled: config.daily_rounds_enabled,
            last_daily_pass: None,
        }
    }

    /// Register an experiment and return its shared handle.
    pub fn add(&mut self, experiment: Experiment) -> SharedExperiment {
        let shared = Arc::new(Mutex::new(experiment));
        self.experiments.push(Arc::clone(&shared));
        shared
    }

    /// Registered experiments.
    pub fn experiments(&self) -> &[SharedExperiment] {
        &self.experiments
    }

    /// End every running round whose time has expired at `now`.
    pub async fn check_elapsed_time(&self, now: DateTime<Utc>) -> usize {
        let mut expired = 0_usize;
        for shared in &self.experiments {
            let mut experiment = shared.lock().await;
            match experiment.check_elapsed_time(now) {
                Ok(Transition::Applied) => expired = expired.saturating_add(1),
                Ok(Transition::NoOp(_)) => {}
                Err(e) => warn!(
                    experiment_id = %experiment.id(),
                    error = %e,
                    "Elapsed time check failed"
                ),
            }
        }
        expired
    }

    /// The daily pass for `today`: advance active daily experiments, then
    /// activate the ones starting today.
    pub async fn daily_tick(&self, today: NaiveDate) -> DailyReport {
        let mut report = DailyReport::default();
        for shared in &self.experiments {
            let mut experiment = shared.lock().await;
            match experiment.advance_daily(today) {
                Ok(DailyOutcome::Advanced) => report.advanced = report.advanced.saturating_add(1),
                Ok(DailyOutcome::Completed) => {
                    report.completed = report.completed.saturating_add(1);
                }
                Ok(DailyOutcome::Activated | DailyOutcome::Skipped) => {}
                Err(e) => {
                    report.failed = report.failed.saturating_add(1);
                    warn!(experiment_id = %experiment.id(), error = %e, "Daily advance failed");
                }
            }
        }
        for shared in &self.experiments {
            let mut experiment = shared.lock().await;
            match experiment.activate_if_due(today) {
                Ok(DailyOutcome::Activated) => {
                    report.activated = report.activated.saturating_add(1);
                }
                Ok(_) => {}
                Err(e) => {
                    report.failed = report.failed.saturating_add(1);
                    warn!(experiment_id = %experiment.id(), error = %e, "Daily activation failed");
                }
            }
        }
        info!(
            %today,
            advanced = report.advanced,
            completed = report.completed,
            activated = report.activated,
            failed = report.failed,
            "Daily pass"
        );
        report
    }

    /// One tick at `now`.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let expired_rounds = self.check_elapsed_time(now).await;
        let today = now.date_naive();
        let daily = if self.daily_rounds_enabled && self.last_daily_pass != Some(today) {
            let report = self.daily_tick(today).await;
            self.last_daily_pass = Some(today);
            Some(report)
        } else {
            None
        };
        TickReport {
            expired_rounds,
            daily,
        }
    }
}

/// Tick until a stop is requested. Returns the number of ticks run.
pub async fn run_scheduler(scheduler: &mut Scheduler, control: &SchedulerControl) -> u64 {
    let mut ticks: u64 = 0;
    info!(
        experiments = scheduler.experiments().len(),
        tick_interval_ms = control.tick_interval_ms(),
        daily_rounds = scheduler.daily_rounds_enabled,
        "Scheduler starting"
    );
    loop {
        if control.is_stop_requested() {
            info!(ticks, "Scheduler stopped");
            return ticks;
        }
        let report = scheduler.tick(Utc::now()).await;
        ticks = ticks.saturating_add(1);
        if report.expired_rounds > 0 {
            debug!(tick = ticks, expired = report.expired_rounds, "Ended expired rounds");
        }
        let interval = tokio::time::Duration::from_millis(control.tick_interval_ms());
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = control.wake.notified() => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Duration;
    use vcweb_types::{ExperimenterId, RoundConfiguration, RoundType};

    use super::*;
    use crate::parameter::ParameterRegistry;
    use crate::round::ExperimentConfiguration;
    use crate::signals::SignalBus;

    fn daily_experiment(rounds: u32, start_date: NaiveDate) -> Experiment {
        let owner = ExperimenterId::new();
        let mut config = ExperimentConfiguration::new("daily", owner);
        config.has_daily_rounds = true;
        for _ in 0..rounds {
            config.push_round(RoundConfiguration::new(RoundType::Regular));
        }
        let mut e = Experiment::new(
            config,
            owner,
            Arc::new(ParameterRegistry::with_well_known()),
            Arc::new(SignalBus::new()),
        )
        .unwrap()
        .with_start_date(start_date);
        e.setup_test_participants(2, None, "example.com", "", None)
            .unwrap();
        e
    }

    fn enabled() -> SchedulerConfig {
        SchedulerConfig {
            daily_rounds_enabled: true,
            ..SchedulerConfig::default()
        }
    }

    #[tokio::test]
    async fn daily_pass_activates_then_advances_then_completes() {
        let day1 = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let day2 = day1.succ_opt().unwrap();
        let day3 = day2.succ_opt().unwrap();
        let mut scheduler = Scheduler::new(&enabled());
        let shared = scheduler.add(daily_experiment(2, day1));

        let report = scheduler.daily_tick(day1).await;
        assert_eq!(report.activated, 1);
        assert_eq!(report.advanced, 0);
        assert_eq!(shared.lock().await.current_round_sequence_number(), 1);

        let report = scheduler.daily_tick(day2).await;
        assert_eq!(report.advanced, 1);
        assert_eq!(shared.lock().await.current_round_sequence_number(), 2);

        let report = scheduler.daily_tick(day3).await;
        assert_eq!(report.completed, 1);
        assert_eq!(shared.lock().await.status(), ExperimentStatus::Completed);
    }

    #[tokio::test]
    async fn repeated_daily_pass_is_idempotent() {
        let day1 = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let day2 = day1.succ_opt().unwrap();
        let mut scheduler = Scheduler::new(&enabled());
        let shared = scheduler.add(daily_experiment(3, day1));

        scheduler.daily_tick(day1).await;
        scheduler.daily_tick(day1).await;
        scheduler.daily_tick(day2).await;
        let report = scheduler.daily_tick(day2).await;
        assert_eq!(report, DailyReport::default());
        assert_eq!(shared.lock().await.current_round_sequence_number(), 2);
    }

    #[tokio::test]
    async fn not_yet_due_experiments_stay_inactive() {
        let day1 = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let mut scheduler = Scheduler::new(&enabled());
        let shared = scheduler.add(daily_experiment(2, day1.succ_opt().unwrap()));
        scheduler.daily_tick(day1).await;
        assert_eq!(shared.lock().await.status(), ExperimentStatus::Inactive);
    }

    #[tokio::test]
    async fn tick_ends_expired_rounds() {
        let owner = ExperimenterId::new();
        let mut config = ExperimentConfiguration::new("timed", owner);
        config.push_round(RoundConfiguration::new(RoundType::Regular).with_duration(30));
        let mut e = Experiment::new(
            config,
            owner,
            Arc::new(ParameterRegistry::with_well_known()),
            Arc::new(SignalBus::new()),
        )
        .unwrap();
        e.activate().unwrap();
        let started = e.current_round_start_time().unwrap();

        let mut scheduler = Scheduler::new(&SchedulerConfig::default());
        let shared = scheduler.add(e);
        let report = scheduler.tick(started + Duration::seconds(10)).await;
        assert_eq!(report.expired_rounds, 0);
        assert!(report.daily.is_none());

        let report = scheduler.tick(started + Duration::seconds(31)).await;
        assert_eq!(report.expired_rounds, 1);
        assert_eq!(shared.lock().await.status(), ExperimentStatus::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_request() {
        let mut scheduler = Scheduler::new(&SchedulerConfig::default());
        let control = SchedulerControl::new(100);
        let stopper = async {
            tokio::time::sleep(tokio::time::Duration::from_millis(350)).await;
            control.request_stop();
        };
        let (ticks, ()) = tokio::join!(run_scheduler(&mut scheduler, &control), stopper);
        assert!(ticks >= 1);
        assert!(control.is_stop_requested());
    }

    #[test]
    fn tick_interval_has_a_floor() {
        let control = SchedulerControl::new(1000);
        assert_eq!(control.set_tick_interval_ms(10), None);
        assert_eq!(control.set_tick_interval_ms(500), Some(1000));
        assert_eq!(control.tick_interval_ms(), 500);
    }
}
