//! Engine binary for vcweb experiments.
//!
//! Loads configuration, builds the demo experiment from its definition
//! file, registers test participants and runs the scheduler loop until the
//! experiment completes or the process is interrupted.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `vcweb-config.yaml`
//! 2. Initialize structured logging (tracing)
//! 3. Build the parameter registry and experiment configuration
//! 4. Create the experiment, its signal bus and test participants
//! 5. Connect to `PostgreSQL` and forward signals (when enabled)
//! 6. Start the experiment and run the scheduler loop
//! 7. Log the final snapshot and archive the experiment

mod error;

use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vcweb_core::config::LoggingConfig;
use vcweb_core::signals::SIGNAL_CHANNEL_CAPACITY;
use vcweb_core::{
    Experiment, ExperimentCommand, ExperimentDefinition, LoggingListener, ParameterRegistry,
    Scheduler, SchedulerControl, SharedExperiment, SignalBus, VcwebConfig, run_scheduler,
};
use vcweb_db::{PostgresConfig, PostgresPool};
use vcweb_types::{ExperimenterId, Signal};

use crate::error::EngineError;

/// Path of the engine configuration, relative to the working directory.
const CONFIG_PATH: &str = "vcweb-config.yaml";

/// Application entry point for the engine.
///
/// # Errors
///
/// Returns an error if any initialization step fails.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration.
    let config = load_config()?;

    // 2. Initialize structured logging.
    init_logging(&config.logging);
    info!(
        tick_interval_ms = config.scheduler.tick_interval_ms,
        daily_rounds = config.scheduler.daily_rounds_enabled,
        persistence = config.infrastructure.persistence_enabled,
        "vcweb-engine starting"
    );

    // 3. Registry and configuration.
    let registry = Arc::new(ParameterRegistry::with_well_known());
    let experimenter = ExperimenterId::new();
    let definition = load_definition(&config.demo.experiment_definition_path)?;
    let configuration = definition.build(experimenter, &registry)?;
    info!(
        name = %configuration.name,
        rounds = configuration.final_sequence_number(),
        parameters = registry.len(),
        "Experiment configuration built"
    );

    // 4. Experiment, signals and participants.
    let bus = Arc::new(SignalBus::with_channel(SIGNAL_CHANNEL_CAPACITY));
    bus.register(Arc::new(LoggingListener));
    let daily = configuration.has_daily_rounds;
    let mut experiment = Experiment::new(
        configuration,
        experimenter,
        Arc::clone(&registry),
        Arc::clone(&bus),
    )?;
    if let Some(seed) = config.demo.seed {
        experiment = experiment.with_seed(seed);
    }
    if daily {
        experiment = experiment.with_start_date(chrono::Utc::now().date_naive());
    }
    let credentials = experiment.setup_test_participants(
        config.demo.participant_count,
        config.demo.institution.as_deref(),
        &config.demo.email_suffix,
        "",
        None,
    )?;
    info!(
        experiment_id = %experiment.id(),
        participants = credentials.len(),
        "Test participants registered"
    );

    // 5. Optional persistence.
    let pool = if config.infrastructure.persistence_enabled {
        let pg_config = PostgresConfig::from(&config.infrastructure);
        let pool = PostgresPool::connect(&pg_config).await.map_err(EngineError::from)?;
        pool.run_migrations().await.map_err(EngineError::from)?;
        if let Some(rx) = bus.subscribe() {
            tokio::spawn(forward_signals(pool.clone(), rx));
        }
        Some(pool)
    } else {
        None
    };

    // 6. Start and run.
    let control = Arc::new(SchedulerControl::new(config.scheduler.tick_interval_ms));
    let mut scheduler = Scheduler::new(&config.scheduler);
    let shared = scheduler.add(experiment);
    if !daily {
        if let Some(rx) = bus.subscribe() {
            tokio::spawn(drive_experiment(
                Arc::clone(&shared),
                rx,
                Arc::clone(&control),
                experimenter,
            ));
        }
        shared
            .lock()
            .await
            .invoke(ExperimentCommand::Activate, experimenter)?;
    }
    {
        let control = Arc::clone(&control);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, stopping");
                control.request_stop();
            }
        });
    }
    let ticks = run_scheduler(&mut scheduler, &control).await;

    // 7. Report and archive.
    let experiment = shared.lock().await;
    let snapshot = experiment.to_dict(true, chrono::Utc::now());
    match serde_json::to_string(&snapshot) {
        Ok(json) => info!(snapshot = %json, "Final experiment snapshot"),
        Err(e) => warn!(error = %e, "Failed to serialize snapshot"),
    }
    if let Some(pool) = pool {
        pool.archives()
            .save(&experiment.archive_record())
            .await
            .map_err(EngineError::from)?;
        pool.close().await;
    }

    info!(
        experiment_id = %experiment.id(),
        status = experiment.status().as_str(),
        ticks,
        "vcweb-engine shutdown complete"
    );
    Ok(())
}

/// Initialize `tracing-subscriber`. `RUST_LOG` takes precedence over the
/// configured level.
fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

/// Load `vcweb-config.yaml`, falling back to defaults when it is absent.
fn load_config() -> Result<VcwebConfig, EngineError> {
    let config_path = Path::new(CONFIG_PATH);
    if config_path.exists() {
        Ok(VcwebConfig::from_file(config_path)?)
    } else {
        Ok(VcwebConfig::default())
    }
}

fn load_definition(path: &str) -> Result<ExperimentDefinition, EngineError> {
    let definition_path = Path::new(path);
    if !definition_path.exists() {
        return Err(EngineError::MissingDefinition {
            path: path.to_owned(),
        });
    }
    Ok(ExperimentDefinition::from_file(definition_path)?)
}

/// Append every broadcast signal to the signal log.
async fn forward_signals(pool: PostgresPool, mut rx: broadcast::Receiver<Signal>) {
    loop {
        match rx.recv().await {
            Ok(signal) => {
                if let Err(e) = pool.signals().append(&[signal]).await {
                    warn!(error = %e, "Failed to archive signal");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Signal archiver lagged, signals dropped");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

/// Play the experiment as its experimenter would: whenever a round ends,
/// advance to the next one, and complete after the last. Stops the
/// scheduler once the experiment is completed.
async fn drive_experiment(
    experiment: SharedExperiment,
    mut rx: broadcast::Receiver<Signal>,
    control: Arc<SchedulerControl>,
    experimenter: ExperimenterId,
) {
    loop {
        match rx.recv().await {
            Ok(Signal::RoundEnded(ended)) => {
                let mut e = experiment.lock().await;
                if ended.experiment != e.id() || e.is_round_in_progress() {
                    continue;
                }
                let command = if e.should_repeat() || e.has_next_round() {
                    ExperimentCommand::AdvanceToNextRound
                } else {
                    ExperimentCommand::Complete
                };
                if let Err(err) = e.invoke(command, experimenter) {
                    warn!(
                        experiment_id = %e.id(),
                        action = command.as_str(),
                        error = %err,
                        "Action failed"
                    );
                }
                if e.is_archived() {
                    control.request_stop();
                    return;
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Experiment driver lagged");
            }
            Err(RecvError::Closed) => return,
        }
    }
}
