//! Typed signal payloads raised by experiment transitions.
//!
//! Signals are delivered to listeners after the transition that raised them
//! has committed. They are also what the engine appends to the signal log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::enums::RoundType;
use crate::ids::{
    ExperimentId, GroupId, ParticipantGroupId, ParticipantId, RoundConfigurationId,
};

/// A round has started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct RoundStarted {
    /// Experiment the round belongs to.
    pub experiment: ExperimentId,
    /// Round configuration now in progress.
    pub round_configuration: RoundConfigurationId,
    /// Sequence number of the round.
    pub sequence_number: u32,
    /// Repetition index of the round.
    pub repeating_round_sequence_number: u32,
    /// Kind of round.
    pub round_type: RoundType,
    /// When the round started.
    pub time: DateTime<Utc>,
}

/// A round has ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct RoundEnded {
    /// Experiment the round belongs to.
    pub experiment: ExperimentId,
    /// Round configuration that ended.
    pub round_configuration: RoundConfigurationId,
    /// Sequence number of the round.
    pub sequence_number: u32,
    /// Repetition index of the round.
    pub repeating_round_sequence_number: u32,
    /// When the round ended.
    pub time: DateTime<Utc>,
}

/// A participant was added to a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ParticipantAdded {
    /// Experiment the group belongs to.
    pub experiment: ExperimentId,
    /// The new membership.
    pub participant_group: ParticipantGroupId,
    /// The participant added.
    pub participant: ParticipantId,
    /// The group joined.
    pub group: GroupId,
    /// Number of the group joined.
    pub group_number: u32,
    /// Participant number within the group.
    pub participant_number: u32,
    /// When the participant was added.
    pub time: DateTime<Utc>,
}

/// Any signal raised by an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "signal", rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum Signal {
    /// See [`RoundStarted`].
    RoundStarted(RoundStarted),
    /// See [`RoundEnded`].
    RoundEnded(RoundEnded),
    /// See [`ParticipantAdded`].
    ParticipantAdded(ParticipantAdded),
}

impl Signal {
    /// Snake-case signal name (`round_started` etc).
    pub const fn name(&self) -> &'static str {
        match self {
            Self::RoundStarted(_) => "round_started",
            Self::RoundEnded(_) => "round_ended",
            Self::ParticipantAdded(_) => "participant_added",
        }
    }

    /// Experiment that raised the signal.
    pub const fn experiment(&self) -> ExperimentId {
        match self {
            Self::RoundStarted(s) => s.experiment,
            Self::RoundEnded(s) => s.experiment,
            Self::ParticipantAdded(s) => s.experiment,
        }
    }

    /// When the signal was raised.
    pub const fn time(&self) -> DateTime<Utc> {
        match self {
            Self::RoundStarted(s) => s.time,
            Self::RoundEnded(s) => s.time,
            Self::ParticipantAdded(s) => s.time,
        }
    }
}
