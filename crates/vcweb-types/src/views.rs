//! Read-only snapshot views for dashboards and JSON consumers.
//!
//! Field names are camel-cased on the wire to match the monitoring UI.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::enums::{ExperimentStatus, RoundType};
use crate::ids::{ExperimentId, GroupId, ParticipantGroupId, RoundDataId};

/// Summary of one round data row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct RoundDataSummary {
    /// Round data identifier.
    pub pk: RoundDataId,
    /// `N`, or `N.k` for the k-th repetition of a repeating round.
    pub round_number: String,
    /// Kind of round.
    pub round_type: RoundType,
    /// Seconds the round was in progress.
    pub elapsed_time: u64,
    /// Experimenter notes.
    pub experimenter_notes: String,
}

/// Summary of one group in the current session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct GroupSummary {
    /// Group identifier.
    pub pk: GroupId,
    /// Display name (`Group A`).
    pub name: String,
    /// Group number.
    pub number: u32,
    /// Current member count.
    pub size: u32,
    /// Session the group belongs to.
    pub session_id: String,
    /// Memberships in participant-number order.
    pub participants: Vec<ParticipantGroupId>,
}

/// Snapshot of an experiment's status for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct ExperimentSnapshot {
    /// Experiment identifier.
    pub pk: ExperimentId,
    /// Current status.
    pub status: ExperimentStatus,
    /// `<status label>, <round type label>`.
    pub round_status_label: String,
    /// `Round s of F`, or the repeating variant.
    pub round_sequence_label: String,
    /// Seconds left in a timed round, -1 for untimed rounds.
    pub time_remaining: i64,
    /// When the current round started.
    pub current_round_start_time: Option<DateTime<Utc>>,
    /// Number of registered participants.
    pub participant_count: u32,
    /// Number of participants flagged ready in the current round.
    pub ready_participants: u32,
    /// Whether a round is in progress.
    pub is_round_in_progress: bool,
    /// Whether the experiment is active (neither inactive nor completed).
    pub is_active: bool,
    /// Whether the experiment has completed.
    pub is_archived: bool,
    /// Payment exchange rate.
    #[ts(as = "String")]
    pub exchange_rate: Decimal,
    /// Every round data row, when requested.
    pub all_round_data: Option<Vec<RoundDataSummary>>,
    /// Groups of the current session, when requested.
    pub groups: Option<Vec<GroupSummary>>,
}
