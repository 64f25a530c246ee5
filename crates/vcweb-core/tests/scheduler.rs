//! Scheduler ticks against shared experiments.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use chrono::{Duration, Utc};
use vcweb_core::config::SchedulerConfig;
use vcweb_core::{
    Experiment, ExperimentConfiguration, ParameterRegistry, Scheduler, SignalBus,
};
use vcweb_types::{ExperimentStatus, ExperimenterId, RoundConfiguration, RoundType};

fn experiment(daily: bool, rounds: &[RoundConfiguration]) -> Experiment {
    let owner = ExperimenterId::new();
    let mut config = ExperimentConfiguration::new("scheduled", owner);
    config.has_daily_rounds = daily;
    for round in rounds {
        config.push_round(round.clone());
    }
    let mut e = Experiment::new(
        config,
        owner,
        Arc::new(ParameterRegistry::with_well_known()),
        Arc::new(SignalBus::new()),
    )
    .unwrap();
    e.setup_test_participants(3, None, "example.com", "", None)
        .unwrap();
    e
}

#[tokio::test]
async fn daily_experiment_moves_once_per_calendar_day() {
    let now = Utc::now();
    let regular = RoundConfiguration::new(RoundType::Regular);
    let daily = experiment(true, &[regular.clone(), regular.clone(), regular])
        .with_start_date(now.date_naive());

    let mut scheduler = Scheduler::new(&SchedulerConfig {
        daily_rounds_enabled: true,
        ..SchedulerConfig::default()
    });
    let shared = scheduler.add(daily);

    let first = scheduler.tick(now).await;
    assert_eq!(first.daily.unwrap().activated, 1);
    assert_eq!(shared.lock().await.current_round_sequence_number(), 1);

    // Same day: no second daily pass.
    assert!(scheduler.tick(now).await.daily.is_none());

    let tomorrow = now + Duration::days(1);
    let second = scheduler.tick(tomorrow).await;
    assert_eq!(second.daily.unwrap().advanced, 1);
    assert_eq!(shared.lock().await.current_round_sequence_number(), 2);
}

#[tokio::test]
async fn non_daily_experiments_ignore_the_daily_pass() {
    let now = Utc::now();
    let plain = experiment(false, &[RoundConfiguration::new(RoundType::Regular)])
        .with_start_date(now.date_naive());
    let mut scheduler = Scheduler::new(&SchedulerConfig {
        daily_rounds_enabled: true,
        ..SchedulerConfig::default()
    });
    let shared = scheduler.add(plain);
    scheduler.tick(now).await;
    assert_eq!(shared.lock().await.status(), ExperimentStatus::Inactive);
}

#[tokio::test]
async fn timed_rounds_end_on_the_first_tick_after_expiry() {
    let timed = RoundConfiguration::new(RoundType::Regular).with_duration(5);
    let mut e = experiment(false, &[timed.clone(), timed]);
    e.activate().unwrap();
    let started = e.current_round_start_time().unwrap();

    let mut scheduler = Scheduler::new(&SchedulerConfig::default());
    let shared = scheduler.add(e);

    assert_eq!(scheduler.tick(started + Duration::seconds(5)).await.expired_rounds, 0);
    assert_eq!(scheduler.tick(started + Duration::seconds(6)).await.expired_rounds, 1);
    assert_eq!(scheduler.tick(started + Duration::seconds(7)).await.expired_rounds, 0);

    let guard = shared.lock().await;
    assert_eq!(guard.status(), ExperimentStatus::Active);
    assert_eq!(guard.current_round_sequence_number(), 1);
}
