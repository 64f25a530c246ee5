//! The experiment round state machine.
//!
//! An [`Experiment`] owns one configuration, its runtime state and the
//! pointer to the current round. Status moves through
//! `Inactive -> Active -> RoundInProgress -> (Active | Completed)`.
//!
//! # Transactions
//!
//! Every public transition runs inside [`Experiment::transaction`]: the
//! status, counters and [`ExperimentState`] are checkpointed first and
//! restored if the transition returns an error. Signals raised inside a
//! transition are queued and only dispatched once it has committed.
//!
//! Ordering mistakes (starting a round that is already running, advancing
//! past the final round, acting on a completed experiment) are not errors;
//! they are logged and reported as [`Transition::NoOp`].

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, error, info, warn};
use vcweb_types::{
    DataValue, DataValueId, ExperimentId, ExperimentStatus, ExperimenterId, GroupClusterId,
    GroupId, ParticipantGroupId, ParticipantId, RoundConfiguration, RoundConfigurationId,
    RoundData, RoundDataId, RoundEnded, RoundStarted, Signal, Value, ValueOwner,
};

use crate::allocator::{self, Allocation, AllocationError, AllocationOptions};
use crate::command::CommandError;
use crate::parameter::{ConversionError, ParameterRegistry, RegistryError, WellKnownParameter};
use crate::registration::RegistrationError;
use crate::round::{
    ExperimentConfiguration, InitialDataValues, InitialValue, RoundConfigurationError,
};
use crate::signals::SignalBus;
use crate::state::ExperimentState;
use crate::value_store::ValueStoreError;

// ---------------------------------------------------------------------------
// Errors and outcomes
// ---------------------------------------------------------------------------

/// Errors that abort an experiment operation. The experiment is rolled
/// back to its state before the operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExperimentError {
    /// The caller does not own the experiment.
    #[error("experimenter {requester} may not control experiment {experiment}")]
    Unauthorized {
        /// The experiment acted on.
        experiment: ExperimentId,
        /// The caller.
        requester: ExperimenterId,
    },

    /// The configuration has no rounds.
    #[error("experiment configuration {name:?} has no rounds")]
    EmptyConfiguration {
        /// Configuration name.
        name: String,
    },

    /// The current sequence number has no round configuration.
    #[error("no round with sequence number {sequence_number}")]
    MissingRound {
        /// The sequence number looked up.
        sequence_number: u32,
    },

    /// No round data exists yet for the requested round.
    #[error("no round data for round {sequence_number} repetition {repetition}")]
    NoRoundData {
        /// Sequence number of the round.
        sequence_number: u32,
        /// Repetition index.
        repetition: u32,
    },

    /// Unknown round data id.
    #[error("no round data with id {id}")]
    UnknownRoundData {
        /// The requested id.
        id: RoundDataId,
    },

    /// Unknown group membership.
    #[error("no participant group relationship with id {id}")]
    UnknownMembership {
        /// The requested id.
        id: ParticipantGroupId,
    },

    /// Unknown group.
    #[error("no group with id {id}")]
    UnknownGroup {
        /// The requested id.
        id: GroupId,
    },

    /// Unknown or unauthorized command.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Group allocation failed.
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    /// A parameter was missing from the registry.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A value could not be converted to its parameter type.
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    /// A data value could not be read or written.
    #[error(transparent)]
    Value(#[from] ValueStoreError),

    /// The configuration rejected an edit or lookup.
    #[error(transparent)]
    Round(#[from] RoundConfigurationError),

    /// Participants could not be registered.
    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

/// Why a transition did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoOpReason {
    /// `start_round` while a round is running.
    RoundAlreadyInProgress,
    /// `activate` on an active experiment.
    AlreadyActive,
    /// Any round transition on a completed experiment.
    Completed,
    /// `advance_to_next_round` on the final round.
    PastFinalRound,
    /// `check_elapsed_time` before the round timer ran out.
    NotExpired,
}

/// Result of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// State changed.
    Applied,
    /// Nothing changed.
    NoOp(NoOpReason),
}

impl Transition {
    /// Whether state changed.
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Which repetition of a round to look up relative to the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOffset {
    /// The current repetition.
    Current,
    /// The previous repetition, wrapping to the last one from the first.
    Previous,
    /// The next repetition.
    Next,
}

// ---------------------------------------------------------------------------
// Experiment
// ---------------------------------------------------------------------------

/// A running instance of an experiment configuration.
#[derive(Debug)]
pub struct Experiment {
    pub(crate) id: ExperimentId,
    pub(crate) experimenter: ExperimenterId,
    pub(crate) configuration: ExperimentConfiguration,
    pub(crate) status: ExperimentStatus,
    pub(crate) current_round_sequence_number: u32,
    pub(crate) current_repeated_round_sequence_number: u32,
    pub(crate) current_round_start_time: Option<DateTime<Utc>>,
    pub(crate) date_activated: Option<DateTime<Utc>>,
    pub(crate) start_date: Option<NaiveDate>,
    pub(crate) last_daily_advance: Option<NaiveDate>,
    pub(crate) state: ExperimentState,
    pub(crate) registry: Arc<ParameterRegistry>,
    pub(crate) signals: Arc<SignalBus>,
    pub(crate) rng: StdRng,
    pub(crate) created_at: DateTime<Utc>,
}

struct Checkpoint {
    status: ExperimentStatus,
    current_round_sequence_number: u32,
    current_repeated_round_sequence_number: u32,
    current_round_start_time: Option<DateTime<Utc>>,
    date_activated: Option<DateTime<Utc>>,
    last_daily_advance: Option<NaiveDate>,
    state: ExperimentState,
}

impl Checkpoint {
    fn capture(experiment: &Experiment) -> Self {
        Self {
            status: experiment.status,
            current_round_sequence_number: experiment.current_round_sequence_number,
            current_repeated_round_sequence_number: experiment
                .current_repeated_round_sequence_number,
            current_round_start_time: experiment.current_round_start_time,
            date_activated: experiment.date_activated,
            last_daily_advance: experiment.last_daily_advance,
            state: experiment.state.clone(),
        }
    }

    fn restore(self, experiment: &mut Experiment) {
        experiment.status = self.status;
        experiment.current_round_sequence_number = self.current_round_sequence_number;
        experiment.current_repeated_round_sequence_number =
            self.current_repeated_round_sequence_number;
        experiment.current_round_start_time = self.current_round_start_time;
        experiment.date_activated = self.date_activated;
        experiment.last_daily_advance = self.last_daily_advance;
        experiment.state = self.state;
    }
}

impl Experiment {
    /// Create an inactive experiment on round 1.
    ///
    /// # Errors
    ///
    /// Returns [`ExperimentError::EmptyConfiguration`] if the configuration
    /// has no rounds.
    pub fn new(
        configuration: ExperimentConfiguration,
        experimenter: ExperimenterId,
        registry: Arc<ParameterRegistry>,
        signals: Arc<SignalBus>,
    ) -> Result<Self, ExperimentError> {
        if configuration.rounds().is_empty() {
            return Err(ExperimentError::EmptyConfiguration {
                name: configuration.name,
            });
        }
        let experiment = Self {
            id: ExperimentId::new(),
            experimenter,
            configuration,
            status: ExperimentStatus::Inactive,
            current_round_sequence_number: 1,
            current_repeated_round_sequence_number: 0,
            current_round_start_time: None,
            date_activated: None,
            start_date: None,
            last_daily_advance: None,
            state: ExperimentState::default(),
            registry,
            signals,
            rng: StdRng::from_os_rng(),
            created_at: Utc::now(),
        };
        info!(
            experiment_id = %experiment.id,
            configuration = %experiment.configuration.name,
            rounds = experiment.configuration.final_sequence_number(),
            "Created experiment"
        );
        Ok(experiment)
    }

    /// Use a deterministic random source for group allocation.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Set the day a daily-round experiment is activated by the scheduler.
    #[must_use]
    pub const fn with_start_date(mut self, start_date: NaiveDate) -> Self {
        self.start_date = Some(start_date);
        self
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Experiment id.
    pub const fn id(&self) -> ExperimentId {
        self.id
    }

    /// Owning experimenter.
    pub const fn experimenter(&self) -> ExperimenterId {
        self.experimenter
    }

    /// The experiment's configuration.
    pub const fn configuration(&self) -> &ExperimentConfiguration {
        &self.configuration
    }

    /// Mutable access to the configuration, for editing rounds and
    /// configuration parameter values.
    pub const fn configuration_mut(&mut self) -> &mut ExperimentConfiguration {
        &mut self.configuration
    }

    /// Current status.
    pub const fn status(&self) -> ExperimentStatus {
        self.status
    }

    /// 1-based sequence number of the current round.
    pub const fn current_round_sequence_number(&self) -> u32 {
        self.current_round_sequence_number
    }

    /// 0-based repetition index within the current round.
    pub const fn current_repeated_round_sequence_number(&self) -> u32 {
        self.current_repeated_round_sequence_number
    }

    /// When the running round started.
    pub const fn current_round_start_time(&self) -> Option<DateTime<Utc>> {
        self.current_round_start_time
    }

    /// When the experiment was last activated.
    pub const fn date_activated(&self) -> Option<DateTime<Utc>> {
        self.date_activated
    }

    /// Scheduled activation day for daily experiments.
    pub const fn start_date(&self) -> Option<NaiveDate> {
        self.start_date
    }

    /// Runtime rows.
    pub const fn state(&self) -> &ExperimentState {
        &self.state
    }

    /// Parameter registry used for value conversion.
    pub fn registry(&self) -> &ParameterRegistry {
        &self.registry
    }

    /// When the experiment was created.
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether a round is running.
    pub fn is_round_in_progress(&self) -> bool {
        self.status == ExperimentStatus::RoundInProgress
    }

    /// Active or running a round.
    pub const fn is_active(&self) -> bool {
        matches!(
            self.status,
            ExperimentStatus::Active | ExperimentStatus::RoundInProgress
        )
    }

    /// Completed experiments count as archived.
    pub fn is_archived(&self) -> bool {
        self.status == ExperimentStatus::Completed
    }

    // -----------------------------------------------------------------------
    // Round queries
    // -----------------------------------------------------------------------

    /// The current round configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ExperimentError::MissingRound`] if the configuration was
    /// edited so that the current sequence number no longer exists.
    pub fn current_round(&self) -> Result<&RoundConfiguration, ExperimentError> {
        self.configuration
            .round(self.current_round_sequence_number)
            .ok_or(ExperimentError::MissingRound {
                sequence_number: self.current_round_sequence_number,
            })
    }

    /// Whether advancing would replay the current round.
    pub fn should_repeat(&self) -> bool {
        self.current_round().is_ok_and(|rc| {
            rc.is_repeating_round()
                && self.current_repeated_round_sequence_number.saturating_add(1) < rc.repeat
        })
    }

    /// Whether a round follows the current one.
    pub fn has_next_round(&self) -> bool {
        self.current_round_sequence_number < self.configuration.final_sequence_number()
    }

    /// Whether the current round is the final one.
    pub fn is_last_round(&self) -> bool {
        self.current_round_sequence_number == self.configuration.final_sequence_number()
    }

    /// The round an advance would move to; the current round when it will
    /// repeat or is the last.
    ///
    /// # Errors
    ///
    /// See [`Self::current_round`].
    pub fn next_round(&self) -> Result<&RoundConfiguration, ExperimentError> {
        if !self.should_repeat() && self.has_next_round() {
            let next = self.current_round_sequence_number.saturating_add(1);
            return self
                .configuration
                .round(next)
                .ok_or(ExperimentError::MissingRound {
                    sequence_number: next,
                });
        }
        self.current_round()
    }

    /// The round played before the current one; the current round while
    /// it is being repeated.
    ///
    /// # Errors
    ///
    /// See [`Self::current_round`].
    pub fn previous_round(&self) -> Result<&RoundConfiguration, ExperimentError> {
        let current = self.current_round()?;
        if current.is_repeating_round() && self.current_repeated_round_sequence_number > 0 {
            return Ok(current);
        }
        let previous = self.current_round_sequence_number.saturating_sub(1).max(1);
        self.configuration
            .round(previous)
            .ok_or(ExperimentError::MissingRound {
                sequence_number: previous,
            })
    }

    /// `Round s/F (repeating round k of r)` or `Round s of F`.
    pub fn sequence_label(&self) -> String {
        let last = self.configuration.final_sequence_number();
        match self.current_round() {
            Ok(rc) if rc.is_repeating_round() => format!(
                "Round {}/{} (repeating round {} of {})",
                self.current_round_sequence_number,
                last,
                self.current_repeated_round_sequence_number.saturating_add(1),
                rc.repeat
            ),
            Ok(rc) => format!("Round {} of {}", rc.sequence_number, last),
            Err(_) => format!("Round {} of {}", self.current_round_sequence_number, last),
        }
    }

    /// Status label followed by the current round type label.
    pub fn status_label(&self) -> String {
        match self.current_round() {
            Ok(rc) => format!("{}, {}", self.status.label(), rc.round_type.label()),
            Err(_) => self.status.label().to_owned(),
        }
    }

    /// Seconds since the running timed round started, 0 otherwise.
    pub fn current_round_elapsed_seconds(&self, now: DateTime<Utc>) -> i64 {
        match (self.current_round_start_time, self.current_round()) {
            (Some(start), Ok(rc)) if rc.is_timed_round() => {
                now.signed_duration_since(start).num_seconds().max(0)
            }
            _ => 0,
        }
    }

    /// Seconds left in a timed round (never negative), or -1 when the
    /// current round is untimed.
    pub fn time_remaining(&self, now: DateTime<Utc>) -> i64 {
        match self.current_round() {
            Ok(rc) if rc.is_timed_round() => i64::from(rc.duration)
                .saturating_sub(self.current_round_elapsed_seconds(now))
                .max(0),
            _ => -1,
        }
    }

    /// Whether the running round has outlived its duration.
    pub fn is_time_expired(&self, now: DateTime<Utc>) -> bool {
        self.current_round().is_ok_and(|rc| {
            rc.is_timed_round() && self.current_round_elapsed_seconds(now) > i64::from(rc.duration)
        })
    }

    // -----------------------------------------------------------------------
    // Round data
    // -----------------------------------------------------------------------

    /// Repetition index used for round data of `round`: the current index
    /// (plus one when `increment`) for the current repeating round, 0 for
    /// any other round.
    pub fn repetition_index(&self, round: &RoundConfiguration, increment: bool) -> u32 {
        if round.is_repeating_round() && round.sequence_number == self.current_round_sequence_number
        {
            if increment {
                self.current_repeated_round_sequence_number.saturating_add(1)
            } else {
                self.current_repeated_round_sequence_number
            }
        } else {
            0
        }
    }

    /// Round data of the current repetition of the current round.
    pub fn current_round_data(&self) -> Option<&RoundData> {
        let rc = self.current_round().ok()?;
        self.state
            .round_data_for(rc.id, self.repetition_index(rc, false))
    }

    /// Round data for a repetition of `round` relative to the current one.
    /// For a non-repeating round this is always repetition 0.
    pub fn get_round_data(&self, round: RoundConfigurationId, offset: RoundOffset) -> Option<&RoundData> {
        let rc = self.configuration.round_by_id(round)?;
        let repetition = if rc.is_repeating_round() {
            let current = self.current_repeated_round_sequence_number;
            match offset {
                RoundOffset::Current => current,
                RoundOffset::Previous if current == 0 => rc.repeat.saturating_sub(1),
                RoundOffset::Previous => current.saturating_sub(1),
                RoundOffset::Next => current.saturating_add(1),
            }
        } else {
            0
        };
        let found = self.state.round_data_for(rc.id, repetition);
        if found.is_none() {
            debug!(
                experiment_id = %self.id,
                round = rc.sequence_number,
                repetition,
                "No round data yet"
            );
        }
        found
    }

    /// Round data for `round` at [`Self::repetition_index`], created when
    /// absent. Experimenter-driven experiments also get a
    /// `participant_ready = false` value for every current membership.
    /// The flag reports whether the round data was created.
    ///
    /// # Errors
    ///
    /// Returns [`ExperimentError::Registry`] if `participant_ready` is not
    /// registered.
    pub fn get_or_create_round_data(
        &mut self,
        round: &RoundConfiguration,
        increment: bool,
    ) -> Result<(RoundDataId, bool), ExperimentError> {
        let repetition = self.repetition_index(round, increment);
        let (id, created) = match self.state.round_data_for(round.id, repetition) {
            Some(rd) => (rd.id, false),
            None => {
                let rd = RoundData {
                    id: RoundDataId::new(),
                    round_configuration: round.id,
                    repeating_round_sequence_number: repetition,
                    elapsed_time: 0,
                    experimenter_notes: String::new(),
                    created_at: Utc::now(),
                };
                let id = rd.id;
                self.state.round_data.push(rd);
                (id, true)
            }
        };
        if self.configuration.is_experimenter_driven {
            self.seed_participant_ready(id)?;
        }
        debug!(
            experiment_id = %self.id,
            round = round.sequence_number,
            repetition,
            created,
            "Round data"
        );
        Ok((id, created))
    }

    fn seed_participant_ready(&mut self, round_data: RoundDataId) -> Result<(), ExperimentError> {
        let ready = self.registry.well_known(WellKnownParameter::ParticipantReady)?;
        let session_id = self.current_round()?.session_id.clone();
        let owners: Vec<ValueOwner> = self
            .state
            .memberships_in_session(&session_id)
            .iter()
            .map(|m| ValueOwner::Participant {
                participant_group: m.id,
                round_data,
            })
            .collect();
        for owner in owners {
            self.state
                .data_values
                .get_or_create(owner, &ready, Some(&Value::Bool(false)))?;
        }
        Ok(())
    }

    fn require_round_data(&self, round_data: Option<RoundDataId>) -> Result<RoundDataId, ExperimentError> {
        if let Some(id) = round_data {
            return self
                .state
                .round_data_by_id(id)
                .map(|rd| rd.id)
                .ok_or(ExperimentError::UnknownRoundData { id });
        }
        self.current_round_data()
            .map(|rd| rd.id)
            .ok_or(ExperimentError::NoRoundData {
                sequence_number: self.current_round_sequence_number,
                repetition: self.current_repeated_round_sequence_number,
            })
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Run `body` all-or-nothing. Signals pushed by `body` are dispatched
    /// after it returns `Ok`; on `Err` the experiment is restored and the
    /// signals are dropped.
    pub(crate) fn transaction<T, F>(&mut self, action: &'static str, body: F) -> Result<T, ExperimentError>
    where
        F: FnOnce(&mut Self, &mut Vec<Signal>) -> Result<T, ExperimentError>,
    {
        let checkpoint = Checkpoint::capture(self);
        let mut pending = Vec::new();
        match body(self, &mut pending) {
            Ok(value) => {
                if !pending.is_empty() {
                    let report = self.signals.dispatch_all(&pending);
                    debug!(
                        experiment_id = %self.id,
                        action,
                        signals = pending.len(),
                        failed = report.failed,
                        "Dispatched signals"
                    );
                }
                Ok(value)
            }
            Err(e) => {
                error!(
                    experiment_id = %self.id,
                    action,
                    error = %e,
                    "Transition failed, rolled back"
                );
                checkpoint.restore(self);
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Activate an inactive experiment and start its current round.
    ///
    /// # Errors
    ///
    /// See [`Self::start_round`].
    pub fn activate(&mut self) -> Result<Transition, ExperimentError> {
        self.transaction("activate", Self::activate_in)
    }

    /// Start the current round, allocating groups first when the round
    /// asks for it or none exist.
    ///
    /// # Errors
    ///
    /// Returns [`ExperimentError::Allocation`] when groups cannot be
    /// allocated, or [`ExperimentError::Registry`] when a required
    /// parameter is missing.
    pub fn start_round(&mut self) -> Result<Transition, ExperimentError> {
        self.transaction("start_round", Self::start_round_in)
    }

    /// End the current round. Accepted while no round is running, in which
    /// case only the signal is raised again.
    ///
    /// # Errors
    ///
    /// See [`Self::current_round`].
    pub fn end_round(&mut self) -> Result<Transition, ExperimentError> {
        self.transaction("end_round", Self::end_round_in)
    }

    /// Move to the next repetition or the next round and start it.
    ///
    /// # Errors
    ///
    /// See [`Self::start_round`].
    pub fn advance_to_next_round(&mut self) -> Result<Transition, ExperimentError> {
        self.transaction("advance_to_next_round", Self::advance_in)
    }

    /// End and restart the current round.
    ///
    /// # Errors
    ///
    /// See [`Self::start_round`].
    pub fn restart_round(&mut self) -> Result<Transition, ExperimentError> {
        self.transaction("restart_round", |e, pending| {
            if e.is_archived() {
                return Ok(e.completed_noop("restart_round"));
            }
            e.end_round_in(pending)?;
            e.start_round_in(pending)
        })
    }

    /// Deactivate and reactivate from the first round, discarding all
    /// groups and round data.
    ///
    /// # Errors
    ///
    /// See [`Self::start_round`].
    pub fn restart(&mut self) -> Result<Transition, ExperimentError> {
        self.transaction("restart", |e, pending| {
            if e.is_archived() {
                return Ok(e.completed_noop("restart"));
            }
            e.log("Restarting experiment from the first round, clearing all data");
            e.deactivate_in(pending)?;
            e.activate_in(pending)
        })
    }

    /// Delete groups and round data and return to an inactive first round.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature matches the other
    /// transitions.
    pub fn deactivate(&mut self) -> Result<Transition, ExperimentError> {
        self.transaction("deactivate", Self::deactivate_in)
    }

    /// Unregister every participant, then deactivate.
    ///
    /// # Errors
    ///
    /// See [`Self::deactivate`].
    pub fn clear(&mut self) -> Result<Transition, ExperimentError> {
        self.transaction("clear", |e, pending| {
            if e.is_archived() {
                return Ok(e.completed_noop("clear"));
            }
            let participants = e.state.registrations.len();
            e.state.registrations.clear();
            e.state.participants.clear();
            e.state.memberships.clear();
            info!(experiment_id = %e.id, participants, "Cleared participants");
            e.deactivate_in(pending)
        })
    }

    /// End the running round, if any, and mark the experiment completed.
    ///
    /// # Errors
    ///
    /// See [`Self::end_round`].
    pub fn complete(&mut self) -> Result<Transition, ExperimentError> {
        self.transaction("complete", Self::complete_in)
    }

    /// Same as [`Self::complete`].
    ///
    /// # Errors
    ///
    /// See [`Self::end_round`].
    pub fn archive(&mut self) -> Result<Transition, ExperimentError> {
        self.transaction("archive", Self::complete_in)
    }

    /// End the running round when its timer has expired.
    ///
    /// # Errors
    ///
    /// See [`Self::end_round`].
    pub fn check_elapsed_time(&mut self, now: DateTime<Utc>) -> Result<Transition, ExperimentError> {
        if !self.is_round_in_progress() || !self.is_time_expired(now) {
            return Ok(Transition::NoOp(NoOpReason::NotExpired));
        }
        info!(
            experiment_id = %self.id,
            round = self.current_round_sequence_number,
            "Round time expired"
        );
        self.end_round()
    }

    /// Reallocate groups outside of a round transition.
    ///
    /// # Errors
    ///
    /// Returns [`ExperimentError::Allocation`] when existing groups must be
    /// preserved and no session id is available.
    pub fn allocate_groups(&mut self, options: &AllocationOptions) -> Result<Allocation, ExperimentError> {
        self.transaction("allocate_groups", |e, pending| {
            let allocation = e.allocate_in(options)?;
            pending.extend(allocation.signals.iter().cloned());
            Ok(allocation)
        })
    }

    fn completed_noop(&self, action: &'static str) -> Transition {
        debug!(experiment_id = %self.id, action, "Ignoring action on completed experiment");
        Transition::NoOp(NoOpReason::Completed)
    }

    fn allocate_in(&mut self, options: &AllocationOptions) -> Result<Allocation, ExperimentError> {
        let round = self.current_round()?.clone();
        Ok(allocator::allocate_groups(
            &mut self.state,
            self.id,
            &round,
            self.configuration.max_group_size,
            options,
            &mut self.rng,
        )?)
    }

    pub(crate) fn activate_in(&mut self, pending: &mut Vec<Signal>) -> Result<Transition, ExperimentError> {
        match self.status {
            ExperimentStatus::Completed => Ok(self.completed_noop("activate")),
            ExperimentStatus::Active | ExperimentStatus::RoundInProgress => {
                debug!(experiment_id = %self.id, "Already active");
                Ok(Transition::NoOp(NoOpReason::AlreadyActive))
            }
            ExperimentStatus::Inactive => {
                self.status = ExperimentStatus::Active;
                self.date_activated = Some(Utc::now());
                self.log("Activated");
                self.start_round_in(pending)
            }
        }
    }

    pub(crate) fn start_round_in(&mut self, pending: &mut Vec<Signal>) -> Result<Transition, ExperimentError> {
        match self.status {
            ExperimentStatus::Completed => return Ok(self.completed_noop("start_round")),
            ExperimentStatus::RoundInProgress => {
                warn!(
                    experiment_id = %self.id,
                    round = self.current_round_sequence_number,
                    "Round already started, ignoring"
                );
                return Ok(Transition::NoOp(NoOpReason::RoundAlreadyInProgress));
            }
            ExperimentStatus::Inactive | ExperimentStatus::Active => {}
        }

        let round = self.current_round()?.clone();
        // Groups first: round data seeds values for the final memberships.
        if round.randomize_groups || self.state.groups.is_empty() {
            let allocation = self.allocate_in(&AllocationOptions::for_round(&round))?;
            pending.extend(allocation.signals);
        }
        let (round_data, _) = self.get_or_create_round_data(&round, false)?;
        if round.initialize_data_values {
            let templates = self.configuration.initial_values.clone();
            self.initialize_data_values(&templates, round_data)?;
        }

        let now = Utc::now();
        self.status = ExperimentStatus::RoundInProgress;
        self.current_round_start_time = Some(now);
        self.log("Starting round");
        pending.push(Signal::RoundStarted(RoundStarted {
            experiment: self.id,
            round_configuration: round.id,
            sequence_number: round.sequence_number,
            repeating_round_sequence_number: self.current_repeated_round_sequence_number,
            round_type: round.round_type,
            time: now,
        }));
        info!(
            experiment_id = %self.id,
            round = round.sequence_number,
            repetition = self.current_repeated_round_sequence_number,
            groups = self.state.groups.len(),
            "Round started"
        );
        Ok(Transition::Applied)
    }

    pub(crate) fn end_round_in(&mut self, pending: &mut Vec<Signal>) -> Result<Transition, ExperimentError> {
        if self.is_archived() {
            return Ok(self.completed_noop("end_round"));
        }
        let round = self.current_round()?.clone();
        let now = Utc::now();
        let was_running = self.is_round_in_progress();
        let elapsed = self
            .current_round_start_time
            .map_or(0, |start| now.signed_duration_since(start).num_seconds().max(0));

        self.status = ExperimentStatus::Active;
        for membership in &mut self.state.memberships {
            membership.survey_completed = false;
        }
        if was_running {
            let repetition = self.repetition_index(&round, false);
            if let Some(rd) = self
                .state
                .round_data
                .iter_mut()
                .find(|rd| rd.round_configuration == round.id && rd.repeating_round_sequence_number == repetition)
            {
                rd.elapsed_time = u64::try_from(elapsed).unwrap_or(0);
            }
        }
        self.log(&format!("Ending round with elapsed time {elapsed}s"));
        pending.push(Signal::RoundEnded(RoundEnded {
            experiment: self.id,
            round_configuration: round.id,
            sequence_number: round.sequence_number,
            repeating_round_sequence_number: self.current_repeated_round_sequence_number,
            time: now,
        }));
        info!(
            experiment_id = %self.id,
            round = round.sequence_number,
            repetition = self.current_repeated_round_sequence_number,
            elapsed,
            "Round ended"
        );
        Ok(Transition::Applied)
    }

    pub(crate) fn advance_in(&mut self, pending: &mut Vec<Signal>) -> Result<Transition, ExperimentError> {
        if self.is_archived() {
            return Ok(self.completed_noop("advance_to_next_round"));
        }
        let repeat = self.should_repeat();
        if !repeat && !self.has_next_round() {
            warn!(
                experiment_id = %self.id,
                round = self.current_round_sequence_number,
                "Trying to advance past the last round, ignoring"
            );
            return Ok(Transition::NoOp(NoOpReason::PastFinalRound));
        }
        if self.is_round_in_progress() {
            self.end_round_in(pending)?;
        }
        if repeat {
            self.current_repeated_round_sequence_number =
                self.current_repeated_round_sequence_number.saturating_add(1);
        } else {
            self.current_round_sequence_number = self.current_round_sequence_number.saturating_add(1);
            self.current_repeated_round_sequence_number = 0;
        }
        self.start_round_in(pending)
    }

    pub(crate) fn deactivate_in(&mut self, _pending: &mut Vec<Signal>) -> Result<Transition, ExperimentError> {
        if self.is_archived() {
            return Ok(self.completed_noop("deactivate"));
        }
        self.log("Deactivating experiment, deleting all data");
        let groups = self.state.remove_groups(|_| true);
        let round_data = self.state.remove_all_round_data();
        self.status = ExperimentStatus::Inactive;
        self.current_round_sequence_number = 1;
        self.current_repeated_round_sequence_number = 0;
        self.current_round_start_time = None;
        info!(experiment_id = %self.id, groups, round_data, "Deactivated");
        Ok(Transition::Applied)
    }

    pub(crate) fn complete_in(&mut self, pending: &mut Vec<Signal>) -> Result<Transition, ExperimentError> {
        if self.is_archived() {
            return Ok(self.completed_noop("complete"));
        }
        if self.is_round_in_progress() {
            self.end_round_in(pending)?;
        }
        self.log("Marking as COMPLETED");
        self.status = ExperimentStatus::Completed;
        info!(experiment_id = %self.id, "Completed");
        Ok(Transition::Applied)
    }

    // -----------------------------------------------------------------------
    // Data values
    // -----------------------------------------------------------------------

    /// Seed the configured initial values for every group, membership and
    /// cluster of the round's session in `round_data`. Skipped when the
    /// round does not ask for it or on repetitions after the first.
    /// Existing values are kept. Returns the number of values created.
    ///
    /// # Errors
    ///
    /// Returns [`ExperimentError::Registry`] for an unregistered parameter
    /// name, or [`ExperimentError::Value`] for an unconvertible default.
    pub fn initialize_data_values(
        &mut self,
        templates: &InitialDataValues,
        round_data: RoundDataId,
    ) -> Result<usize, ExperimentError> {
        let rd = self
            .state
            .round_data_by_id(round_data)
            .ok_or(ExperimentError::UnknownRoundData { id: round_data })?;
        let round = self
            .configuration
            .round_by_id(rd.round_configuration)
            .ok_or(RoundConfigurationError::UnknownRound {
                id: rd.round_configuration,
            })?;
        if !round.initialize_data_values {
            debug!(experiment_id = %self.id, "Round does not initialize data values");
            return Ok(0);
        }
        if round.is_repeating_round() && self.current_repeated_round_sequence_number > 0 {
            debug!(
                experiment_id = %self.id,
                repetition = self.current_repeated_round_sequence_number,
                "Skipping initialization for repetition"
            );
            return Ok(0);
        }

        let session_id = round.session_id.clone();
        let clusters: Vec<GroupClusterId> = self
            .state
            .group_clusters
            .iter()
            .filter(|c| c.session_id == session_id)
            .map(|c| c.id)
            .collect();
        let groups: Vec<GroupId> = self
            .state
            .groups_in_session(&session_id)
            .iter()
            .map(|g| g.id)
            .collect();
        let memberships: Vec<ParticipantGroupId> = self
            .state
            .memberships_in_session(&session_id)
            .iter()
            .map(|m| m.id)
            .collect();

        let mut owners: Vec<(ValueOwner, &InitialValue)> = Vec::new();
        for template in &templates.group_cluster {
            owners.extend(clusters.iter().map(|&group_cluster| {
                (ValueOwner::GroupCluster { group_cluster, round_data }, template)
            }));
        }
        for template in &templates.group {
            owners.extend(
                groups
                    .iter()
                    .map(|&group| (ValueOwner::Group { group, round_data }, template)),
            );
        }
        for template in &templates.participant {
            owners.extend(memberships.iter().map(|&participant_group| {
                (
                    ValueOwner::Participant {
                        participant_group,
                        round_data,
                    },
                    template,
                )
            }));
        }

        let mut created = 0_usize;
        for (owner, template) in owners {
            let parameter = self.registry.get(&template.parameter)?;
            let (_, fresh) =
                self.state
                    .data_values
                    .get_or_create(owner, &parameter, template.default.as_ref())?;
            if fresh {
                created = created.saturating_add(1);
            }
        }
        debug!(experiment_id = %self.id, created, "Initialized data values");
        Ok(created)
    }

    /// Copy values into the round data of [`Self::next_round`] (the next
    /// repetition when the current round repeats). Does nothing on the
    /// last round.
    ///
    /// # Errors
    ///
    /// Returns [`ExperimentError::Value`] if any id is unknown; nothing is
    /// copied in that case.
    pub fn copy_to_next_round(&mut self, values: &[DataValueId]) -> Result<Vec<DataValue>, ExperimentError> {
        if self.is_last_round() {
            debug!(experiment_id = %self.id, "Last round, nothing to copy");
            return Ok(Vec::new());
        }
        self.transaction("copy_to_next_round", |e, _| {
            let next = e.next_round()?.clone();
            let (round_data, _) = e.get_or_create_round_data(&next, true)?;
            Ok(e.state.data_values.copy_to(values, round_data)?)
        })
    }

    /// A group's value for `parameter` in `round_data` (default: the
    /// current round data), created with the parameter default when absent.
    ///
    /// # Errors
    ///
    /// Returns [`ExperimentError::NoRoundData`] before the first round has
    /// started, [`ExperimentError::Registry`] for an unknown parameter.
    pub fn group_data_value(
        &mut self,
        group: GroupId,
        parameter: &str,
        round_data: Option<RoundDataId>,
    ) -> Result<DataValue, ExperimentError> {
        if self.state.group(group).is_none() {
            return Err(ExperimentError::UnknownGroup { id: group });
        }
        let round_data = self.require_round_data(round_data)?;
        let parameter = self.registry.get(parameter)?;
        let default = crate::parameter::default_value(&parameter)?;
        Ok(self
            .state
            .data_values
            .get(ValueOwner::Group { group, round_data }, &parameter, Some(&default))?)
    }

    /// Set a group's value for `parameter` and record it in the group's
    /// activity log.
    ///
    /// # Errors
    ///
    /// See [`Self::group_data_value`]; also conversion errors.
    pub fn set_group_data_value(
        &mut self,
        group: GroupId,
        parameter: &str,
        value: &Value,
        round_data: Option<RoundDataId>,
    ) -> Result<DataValue, ExperimentError> {
        if self.state.group(group).is_none() {
            return Err(ExperimentError::UnknownGroup { id: group });
        }
        let round_data = self.require_round_data(round_data)?;
        let parameter = self.registry.get(parameter)?;
        let stored = self
            .state
            .data_values
            .set(ValueOwner::Group { group, round_data }, &parameter, value)?;
        let round = self.current_round().ok().map(|rc| rc.id);
        self.state.log(
            round,
            Some(group),
            format!("{} set to {}", parameter.label(), stored.value),
        );
        Ok(stored)
    }

    /// A participant's value for `parameter`.
    ///
    /// # Errors
    ///
    /// See [`Self::group_data_value`].
    pub fn participant_data_value(
        &mut self,
        membership: ParticipantGroupId,
        parameter: &str,
        round_data: Option<RoundDataId>,
    ) -> Result<DataValue, ExperimentError> {
        let owner = self.participant_owner(membership, round_data)?;
        let parameter = self.registry.get(parameter)?;
        let default = crate::parameter::default_value(&parameter)?;
        Ok(self.state.data_values.get(owner, &parameter, Some(&default))?)
    }

    /// Set a participant's value for `parameter`.
    ///
    /// # Errors
    ///
    /// See [`Self::group_data_value`]; also conversion errors.
    pub fn set_participant_data_value(
        &mut self,
        membership: ParticipantGroupId,
        parameter: &str,
        value: &Value,
        round_data: Option<RoundDataId>,
    ) -> Result<DataValue, ExperimentError> {
        let owner = self.participant_owner(membership, round_data)?;
        let parameter = self.registry.get(parameter)?;
        Ok(self.state.data_values.set(owner, &parameter, value)?)
    }

    /// Record a participant's decision for `parameter` in the current round.
    ///
    /// # Errors
    ///
    /// See [`Self::set_participant_data_value`].
    pub fn submit_participant_data_value(
        &mut self,
        membership: ParticipantGroupId,
        parameter: &str,
        value: &Value,
    ) -> Result<DataValue, ExperimentError> {
        let owner = self.participant_owner(membership, None)?;
        let parameter = self.registry.get(parameter)?;
        let converted = crate::parameter::convert(&parameter, value)?;
        let (row, _) = self.state.data_values.get_or_create(owner, &parameter, None)?;
        Ok(self.state.data_values.submit(row.id, converted)?)
    }

    /// Set a participant's `participant_ready` flag for the current round.
    ///
    /// # Errors
    ///
    /// See [`Self::set_participant_data_value`].
    pub fn set_participant_ready(
        &mut self,
        membership: ParticipantGroupId,
        ready: bool,
    ) -> Result<DataValue, ExperimentError> {
        self.set_participant_data_value(
            membership,
            WellKnownParameter::ParticipantReady.name(),
            &Value::Bool(ready),
            None,
        )
    }

    fn participant_owner(
        &self,
        membership: ParticipantGroupId,
        round_data: Option<RoundDataId>,
    ) -> Result<ValueOwner, ExperimentError> {
        if self.state.membership(membership).is_none() {
            return Err(ExperimentError::UnknownMembership { id: membership });
        }
        Ok(ValueOwner::Participant {
            participant_group: membership,
            round_data: self.require_round_data(round_data)?,
        })
    }

    // -----------------------------------------------------------------------
    // Participants
    // -----------------------------------------------------------------------

    /// Number of registered participants.
    pub fn participant_count(&self) -> u32 {
        self.state.participant_count()
    }

    /// The membership of `participant` in the current round's session.
    pub fn membership_for(&self, participant: ParticipantId) -> Option<ParticipantGroupId> {
        let session_id = self.current_round().ok()?.session_id.as_str();
        self.state
            .membership_for(participant, session_id)
            .map(|m| m.id)
    }

    /// Participants flagged ready in the running round; 0 between rounds.
    pub fn number_of_ready_participants(&self) -> u32 {
        if !self.is_round_in_progress() {
            return 0;
        }
        let (Some(rd), Ok(ready)) = (
            self.current_round_data(),
            self.registry.well_known(WellKnownParameter::ParticipantReady),
        ) else {
            return 0;
        };
        let count = self
            .state
            .data_values
            .in_round(rd.id, ready.id)
            .iter()
            .filter(|v| v.value.as_bool() == Some(true))
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Whether every registered participant is ready.
    pub fn all_participants_ready(&self) -> bool {
        self.number_of_ready_participants() == self.participant_count()
    }

    /// Whether every registered participant submitted a value for
    /// `parameter` in `round_data` (default: the current round data).
    pub fn all_participants_submitted(&self, parameter: &str, round_data: Option<RoundDataId>) -> bool {
        let (Ok(round_data), Ok(parameter)) =
            (self.require_round_data(round_data), self.registry.get(parameter))
        else {
            return false;
        };
        let submitted = self
            .state
            .data_values
            .in_round(round_data, parameter.id)
            .iter()
            .filter(|v| v.submitted)
            .count();
        u32::try_from(submitted).is_ok_and(|n| n == self.participant_count())
    }

    // -----------------------------------------------------------------------
    // Misc
    // -----------------------------------------------------------------------

    /// Append an entry to the experiment activity log for the current round.
    pub fn log(&mut self, message: &str) {
        let round = self.current_round().ok().map(|rc| rc.id);
        debug!(experiment_id = %self.id, entry = message, "Activity");
        self.state.log(round, None, message.to_owned());
    }

    /// A fresh, inactive experiment for `experimenter` running a deep copy
    /// of this configuration. Runtime state is not copied.
    ///
    /// # Errors
    ///
    /// See [`Self::new`].
    pub fn clone_experiment(&self, experimenter: ExperimenterId) -> Result<Self, ExperimentError> {
        let mut copy = Self::new(
            self.configuration.clone_for(experimenter),
            experimenter,
            Arc::clone(&self.registry),
            Arc::clone(&self.signals),
        )?;
        copy.start_date = self.start_date;
        info!(
            experiment_id = %self.id,
            clone_id = %copy.id,
            "Cloned experiment"
        );
        Ok(copy)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Duration;
    use vcweb_types::{
        Parameter, ParameterScope, ParameterType, Participant, Registration, RegistrationId,
        RoundType,
    };

    use super::*;

    fn experiment(rounds: &[RoundConfiguration], participants: u32) -> Experiment {
        let mut config = ExperimentConfiguration::new("test", ExperimenterId::new());
        for rc in rounds {
            config.push_round(rc.clone());
        }
        let creator = config.creator;
        let mut e = Experiment::new(
            config,
            creator,
            Arc::new(ParameterRegistry::with_well_known()),
            Arc::new(SignalBus::new()),
        )
        .unwrap()
        .with_seed(42);
        for n in 1..=participants {
            let participant = Participant {
                id: ParticipantId::new(),
                email: format!("s{n}@example.com"),
                full_name: None,
                institution: None,
                created_at: Utc::now(),
            };
            e.state.registrations.push(Registration {
                id: RegistrationId::new(),
                participant: participant.id,
                participant_identifier: String::new(),
                sequential_participant_identifier: n,
                created_at: Utc::now(),
            });
            e.state.participants.push(participant);
        }
        e
    }

    fn regular() -> RoundConfiguration {
        RoundConfiguration::new(RoundType::Regular)
    }

    #[test]
    fn empty_configuration_is_rejected() {
        let config = ExperimentConfiguration::new("empty", ExperimenterId::new());
        let err = Experiment::new(
            config,
            ExperimenterId::new(),
            Arc::new(ParameterRegistry::new()),
            Arc::new(SignalBus::new()),
        )
        .unwrap_err();
        assert!(matches!(err, ExperimentError::EmptyConfiguration { .. }));
    }

    #[test]
    fn activate_starts_first_round_and_seeds_ready_flags() {
        let mut e = experiment(&[regular(), regular()], 4);
        assert_eq!(e.activate().unwrap(), Transition::Applied);
        assert_eq!(e.status(), ExperimentStatus::RoundInProgress);
        assert!(e.current_round_start_time().is_some());
        assert!(e.date_activated().is_some());
        assert_eq!(e.state().round_data.len(), 1);
        assert_eq!(e.state().memberships.len(), 4);
        assert_eq!(e.number_of_ready_participants(), 0);
        assert!(!e.all_participants_ready());

        assert_eq!(
            e.activate().unwrap(),
            Transition::NoOp(NoOpReason::AlreadyActive)
        );
    }

    #[test]
    fn start_round_twice_is_a_noop() {
        let mut e = experiment(&[regular()], 2);
        e.start_round().unwrap();
        let before = e.state().clone();
        assert_eq!(
            e.start_round().unwrap(),
            Transition::NoOp(NoOpReason::RoundAlreadyInProgress)
        );
        assert_eq!(e.state(), &before);
    }

    #[test]
    fn ready_flags_count_while_round_runs() {
        let mut e = experiment(&[regular()], 2);
        e.activate().unwrap();
        let memberships: Vec<ParticipantGroupId> =
            e.state().memberships.iter().map(|m| m.id).collect();
        for m in &memberships {
            e.set_participant_ready(*m, true).unwrap();
        }
        assert_eq!(e.number_of_ready_participants(), 2);
        assert!(e.all_participants_ready());

        e.end_round().unwrap();
        assert_eq!(e.number_of_ready_participants(), 0);
    }

    #[test]
    fn end_round_is_accepted_when_not_running() {
        let mut e = experiment(&[regular()], 1);
        e.activate().unwrap();
        e.end_round().unwrap();
        assert_eq!(e.end_round().unwrap(), Transition::Applied);
        assert_eq!(e.status(), ExperimentStatus::Active);
    }

    #[test]
    fn timed_round_expires() {
        let mut e = experiment(&[regular().with_duration(60)], 1);
        e.activate().unwrap();
        let start = e.current_round_start_time().unwrap();

        assert_eq!(e.time_remaining(start + Duration::seconds(20)), 40);
        assert_eq!(
            e.check_elapsed_time(start + Duration::seconds(30)).unwrap(),
            Transition::NoOp(NoOpReason::NotExpired)
        );
        assert_eq!(
            e.check_elapsed_time(start + Duration::seconds(61)).unwrap(),
            Transition::Applied
        );
        assert_eq!(e.status(), ExperimentStatus::Active);
    }

    #[test]
    fn untimed_round_has_no_time_remaining() {
        let mut e = experiment(&[regular()], 1);
        e.activate().unwrap();
        assert_eq!(e.time_remaining(Utc::now()), -1);
    }

    #[test]
    fn labels_describe_current_round() {
        let mut e = experiment(
            &[
                RoundConfiguration::new(RoundType::Welcome),
                regular().with_repeat(3),
            ],
            1,
        );
        assert_eq!(e.sequence_label(), "Round 1 of 2");
        assert_eq!(e.status_label(), "Not active, Initial welcome page");
        e.activate().unwrap();
        e.advance_to_next_round().unwrap();
        e.advance_to_next_round().unwrap();
        assert_eq!(e.sequence_label(), "Round 2/2 (repeating round 2 of 3)");
        assert_eq!(
            e.status_label(),
            "Round in progress, Regular experiment round"
        );
    }

    #[test]
    fn round_data_offsets_wrap_for_repeating_rounds() {
        let mut e = experiment(&[regular().with_repeat(3)], 1);
        e.activate().unwrap();
        let round = e.current_round().unwrap().id;
        e.advance_to_next_round().unwrap();

        let previous = e.get_round_data(round, RoundOffset::Previous).unwrap();
        assert_eq!(previous.repeating_round_sequence_number, 0);
        assert!(e.get_round_data(round, RoundOffset::Next).is_none());
        assert_eq!(
            e.current_round_data().unwrap().repeating_round_sequence_number,
            1
        );
    }

    #[test]
    fn deactivate_resets_everything_but_participants() {
        let mut e = experiment(&[regular(), regular()], 3);
        e.activate().unwrap();
        e.advance_to_next_round().unwrap();
        e.deactivate().unwrap();

        assert_eq!(e.status(), ExperimentStatus::Inactive);
        assert_eq!(e.current_round_sequence_number(), 1);
        assert_eq!(e.current_repeated_round_sequence_number(), 0);
        assert!(e.state().groups.is_empty());
        assert!(e.state().round_data.is_empty());
        assert!(e.state().data_values.is_empty());
        assert_eq!(e.participant_count(), 3);
    }

    #[test]
    fn clear_removes_participants() {
        let mut e = experiment(&[regular()], 3);
        e.activate().unwrap();
        e.clear().unwrap();
        assert_eq!(e.participant_count(), 0);
        assert!(e.state().memberships.is_empty());
        assert_eq!(e.status(), ExperimentStatus::Inactive);
    }

    #[test]
    fn completed_experiment_ignores_transitions() {
        let mut e = experiment(&[regular(), regular()], 2);
        e.activate().unwrap();
        e.complete().unwrap();
        assert_eq!(e.status(), ExperimentStatus::Completed);
        assert!(e.is_archived());

        let completed = Transition::NoOp(NoOpReason::Completed);
        assert_eq!(e.activate().unwrap(), completed);
        assert_eq!(e.start_round().unwrap(), completed);
        assert_eq!(e.advance_to_next_round().unwrap(), completed);
        assert_eq!(e.deactivate().unwrap(), completed);
        assert_eq!(e.clear().unwrap(), completed);
        assert_eq!(e.restart().unwrap(), completed);
        assert_eq!(e.status(), ExperimentStatus::Completed);
        assert_eq!(e.participant_count(), 2);
    }

    #[test]
    fn restart_returns_to_first_round() {
        let mut e = experiment(&[regular(), regular()], 2);
        e.activate().unwrap();
        e.advance_to_next_round().unwrap();
        assert_eq!(e.restart().unwrap(), Transition::Applied);
        assert_eq!(e.current_round_sequence_number(), 1);
        assert_eq!(e.status(), ExperimentStatus::RoundInProgress);
        assert_eq!(e.state().round_data.len(), 1);
    }

    #[test]
    fn initial_values_seed_groups_and_participants_once() {
        let mut first = regular().with_repeat(2);
        first.initialize_data_values = true;
        let mut e = experiment(&[first], 4);
        e.configuration.max_group_size = 2;
        e.registry
            .register(
                Parameter::new("harvest", ParameterScope::Participant, ParameterType::Int)
                    .with_default("3"),
            )
            .unwrap();
        e.registry
            .register(Parameter::new(
                "resource_level",
                ParameterScope::Group,
                ParameterType::Int,
            ))
            .unwrap();
        e.configuration.initial_values = InitialDataValues {
            group: vec![InitialValue {
                parameter: "resource_level".to_owned(),
                default: Some(Value::Int(100)),
            }],
            participant: vec![InitialValue {
                parameter: "harvest".to_owned(),
                default: None,
            }],
            group_cluster: Vec::new(),
        };

        e.activate().unwrap();
        let group = e.state().groups.first().unwrap().id;
        let level = e.group_data_value(group, "resource_level", None).unwrap();
        assert_eq!(level.value, Value::Int(100));
        let rd = e.current_round_data().unwrap().id;
        let harvest = e.registry.get("harvest").unwrap();
        assert_eq!(e.state().data_values.in_round(rd, harvest.id).len(), 4);

        // second repetition: no seeding
        e.advance_to_next_round().unwrap();
        let rd = e.current_round_data().unwrap().id;
        assert!(e.state().data_values.in_round(rd, harvest.id).is_empty());
    }

    #[test]
    fn copy_to_next_round_targets_next_repetition() {
        let mut e = experiment(&[regular().with_repeat(2), regular()], 2);
        e.registry
            .register(Parameter::new(
                "resource_level",
                ParameterScope::Group,
                ParameterType::Int,
            ))
            .unwrap();
        e.activate().unwrap();
        let group = e.state().groups.first().unwrap().id;
        let value = e
            .set_group_data_value(group, "resource_level", &Value::Int(80), None)
            .unwrap();

        let copies = e.copy_to_next_round(&[value.id]).unwrap();
        assert_eq!(copies.len(), 1);
        e.advance_to_next_round().unwrap();
        let carried = e.group_data_value(group, "resource_level", None).unwrap();
        assert_eq!(carried.value, Value::Int(80));
        assert_ne!(carried.id, value.id);
    }

    #[test]
    fn failed_start_rolls_back() {
        let mut config = ExperimentConfiguration::new("test", ExperimenterId::new());
        config.push_round(regular());
        let creator = config.creator;
        // No participant_ready parameter registered.
        let mut e = Experiment::new(
            config,
            creator,
            Arc::new(ParameterRegistry::new()),
            Arc::new(SignalBus::new()),
        )
        .unwrap();
        let err = e.activate().unwrap_err();
        assert!(matches!(err, ExperimentError::Registry(_)));
        assert_eq!(e.status(), ExperimentStatus::Inactive);
        assert!(e.state().round_data.is_empty());
        assert!(e.state().groups.is_empty());
    }

    #[test]
    fn submissions_are_counted() {
        let mut e = experiment(&[regular()], 2);
        e.registry
            .register(Parameter::new(
                "harvest",
                ParameterScope::Participant,
                ParameterType::Int,
            ))
            .unwrap();
        e.activate().unwrap();
        let memberships: Vec<ParticipantGroupId> =
            e.state().memberships.iter().map(|m| m.id).collect();
        let (first, second) = (memberships.first().unwrap(), memberships.get(1).unwrap());

        e.submit_participant_data_value(*first, "harvest", &Value::Str("4".to_owned()))
            .unwrap();
        assert!(!e.all_participants_submitted("harvest", None));
        e.submit_participant_data_value(*second, "harvest", &Value::Int(2))
            .unwrap();
        assert!(e.all_participants_submitted("harvest", None));
    }

    #[test]
    fn clone_experiment_is_fresh_and_inactive() {
        let mut e = experiment(&[regular(), regular()], 2);
        e.activate().unwrap();
        let other = ExperimenterId::new();
        let copy = e.clone_experiment(other).unwrap();
        assert_ne!(copy.id(), e.id());
        assert_eq!(copy.experimenter(), other);
        assert_eq!(copy.status(), ExperimentStatus::Inactive);
        assert_eq!(copy.participant_count(), 0);
        assert_eq!(copy.configuration().final_sequence_number(), 2);
    }
}
