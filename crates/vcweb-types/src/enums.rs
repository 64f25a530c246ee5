//! Enumeration types for the vcweb experiment framework.
//!
//! Status, round kind, parameter scope and parameter value type. The serde
//! names match the identifiers used in experiment definition files and in
//! archived snapshots.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ---------------------------------------------------------------------------
// Experiment status
// ---------------------------------------------------------------------------

/// Lifecycle status of an experiment.
///
/// `Inactive -> Active -> RoundInProgress -> (Active | Completed)`.
/// `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export, export_to = "bindings/")]
pub enum ExperimentStatus {
    /// Not yet activated, or reset by a deactivate.
    Inactive,
    /// Activated with no round currently running.
    Active,
    /// A round is running and its timer is ticking.
    RoundInProgress,
    /// Finished; no further rounds may be played.
    Completed,
}

impl ExperimentStatus {
    /// Human-readable status description.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Inactive => "Not active",
            Self::Active => "Active, no round in progress",
            Self::RoundInProgress => "Round in progress",
            Self::Completed => "Completed",
        }
    }

    /// Wire name used in snapshots (`ROUND_IN_PROGRESS` etc).
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inactive => "INACTIVE",
            Self::Active => "ACTIVE",
            Self::RoundInProgress => "ROUND_IN_PROGRESS",
            Self::Completed => "COMPLETED",
        }
    }
}

impl core::fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Round types
// ---------------------------------------------------------------------------

/// The kind of phase a round configuration describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export, export_to = "bindings/")]
pub enum RoundType {
    /// Initial welcome page / waiting room.
    Welcome,
    /// General introduction to the experiment.
    GeneralInstructions,
    /// A regular, playable experiment round.
    Regular,
    /// Communication round.
    Chat,
    /// Summary shown at the end of a round or experiment.
    Debriefing,
    /// Instructions page.
    Instructions,
    /// Practice round, playable but usually unpaid.
    Practice,
    /// Comprehension quiz.
    Quiz,
    /// Embedded or external survey.
    Survey,
}

impl RoundType {
    /// Human-readable round type description.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Welcome => "Initial welcome page",
            Self::GeneralInstructions => "General introduction",
            Self::Regular => "Regular experiment round",
            Self::Chat => "Communication round",
            Self::Debriefing => "Debriefing round summary",
            Self::Instructions => "Instructions",
            Self::Practice => "Practice round",
            Self::Quiz => "Quiz round",
            Self::Survey => "Survey round",
        }
    }

    /// Whether participants make decisions in this kind of round.
    pub const fn is_playable(self) -> bool {
        matches!(self, Self::Practice | Self::Regular)
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Which kind of entity owns values of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum ParameterScope {
    /// Round configuration data applicable to all groups for a round.
    Round,
    /// Experiment configuration data relevant to the entire experiment.
    Experiment,
    /// Group data for a given group in a given round.
    Group,
    /// Group cluster data for a given cluster in a given round.
    GroupCluster,
    /// Participant data for a given participant in a given round.
    Participant,
}

/// Declared value type of a parameter.
///
/// Selects which [`crate::Value`] variant is authoritative for values of the
/// parameter and which conversion rule applies to raw input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum ParameterType {
    /// Signed integer.
    Int,
    /// Free text.
    String,
    /// Integer id of a record resolved through a registered lookup.
    #[serde(alias = "foreignkey")]
    ForeignKey,
    /// Floating-point number.
    Float,
    /// True/false flag.
    Boolean,
    /// One of a fixed set of string choices.
    Enum,
}

impl ParameterType {
    /// Whether conversion retries through a float parse (`"3.7"` -> `3`).
    pub const fn is_integer_type(self) -> bool {
        matches!(self, Self::Int | Self::ForeignKey)
    }
}
