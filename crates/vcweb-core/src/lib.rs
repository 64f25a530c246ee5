//! Experiment core for vcweb: parameters, values, rounds, groups and the
//! round state machine.
//!
//! An experiment plays an ordered list of rounds. Participants are
//! partitioned into groups, every round records typed data values for its
//! groups and participants, and the experimenter (or the scheduler) moves
//! the experiment from round to round.
//!
//! # Modules
//!
//! - [`parameter`] -- Parameter registry and raw value conversion.
//! - [`value_store`] -- Typed data values keyed by owner and parameter.
//! - [`round`] -- Experiment configuration and its ordered round list.
//! - [`state`] -- Per-experiment tables (groups, memberships, round data).
//! - [`allocator`] -- Group allocation and group clusters.
//! - [`experiment`] -- The [`Experiment`] state machine.
//! - [`command`] -- Experimenter actions invoked by name.
//! - [`registration`] -- Participant registration.
//! - [`signals`] -- [`SignalBus`] and listeners.
//! - [`snapshot`] -- Monitoring snapshot and archive records.
//! - [`scheduler`] -- Periodic tick and daily rounds.
//! - [`config`] -- `vcweb-config.yaml` and experiment definition files.
//!
//! [`Experiment`]: experiment::Experiment
//! [`SignalBus`]: signals::SignalBus

pub mod allocator;
pub mod command;
pub mod config;
pub mod experiment;
pub mod parameter;
pub mod registration;
pub mod round;
pub mod scheduler;
pub mod signals;
pub mod snapshot;
pub mod state;
pub mod value_store;

pub use command::{ExperimentCommand, InvokeOutcome};
pub use config::{ConfigError, ExperimentDefinition, VcwebConfig};
pub use experiment::{Experiment, ExperimentError, NoOpReason, RoundOffset, Transition};
pub use parameter::{ParameterRegistry, WellKnownParameter};
pub use registration::{Credential, ParticipantIdentity};
pub use round::ExperimentConfiguration;
pub use scheduler::{Scheduler, SchedulerControl, SharedExperiment, run_scheduler};
pub use signals::{LoggingListener, SignalBus, SignalListener};
pub use snapshot::ExperimentArchive;
