//! Read-only projections of an experiment.
//!
//! [`Experiment::to_dict`] builds the monitoring snapshot; the archive
//! record is the full serialized experiment handed to persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use vcweb_types::{
    ExperimentId, ExperimentSnapshot, ExperimentStatus, ExperimenterId, GroupSummary, RoundData,
    RoundDataSummary,
};

use crate::experiment::Experiment;
use crate::parameter::ParameterRegistry;
use crate::round::ExperimentConfiguration;
use crate::signals::SignalBus;
use crate::state::ExperimentState;

/// A complete, serializable copy of an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentArchive {
    /// Experiment id.
    pub id: ExperimentId,
    /// Owning experimenter.
    pub experimenter: ExperimenterId,
    /// Configuration name, for listings.
    pub name: String,
    /// Status when archived.
    pub status: ExperimentStatus,
    /// Current round pointer.
    pub current_round_sequence_number: u32,
    /// Current repetition index.
    pub current_repeated_round_sequence_number: u32,
    /// Last activation time.
    pub date_activated: Option<DateTime<Utc>>,
    /// The configuration played.
    pub configuration: ExperimentConfiguration,
    /// Every runtime row.
    pub state: ExperimentState,
    /// When the record was made.
    pub archived_at: DateTime<Utc>,
}

impl Experiment {
    /// Monitoring snapshot at `now`. Round data (newest first) and group
    /// summaries are included when `include_round_data` is set.
    pub fn to_dict(&self, include_round_data: bool, now: DateTime<Utc>) -> ExperimentSnapshot {
        let (all_round_data, groups) = if include_round_data {
            (Some(self.round_data_summaries()), Some(self.group_summaries()))
        } else {
            (None, None)
        };
        ExperimentSnapshot {
            pk: self.id,
            status: self.status,
            round_status_label: self.status_label(),
            round_sequence_label: self.sequence_label(),
            time_remaining: self.time_remaining(now),
            current_round_start_time: self.current_round_start_time,
            participant_count: self.participant_count(),
            ready_participants: self.number_of_ready_participants(),
            is_round_in_progress: self.is_round_in_progress(),
            is_active: self.is_active(),
            is_archived: self.is_archived(),
            exchange_rate: self.configuration.exchange_rate,
            all_round_data,
            groups,
        }
    }

    /// `N` for a plain round, `N.k` for repetition `k` (1-based) of a
    /// repeating round.
    pub fn round_data_number(&self, round_data: &RoundData) -> String {
        match self.configuration.round_by_id(round_data.round_configuration) {
            Some(rc) if rc.is_repeating_round() => format!(
                "{}.{}",
                rc.round_number(),
                round_data.repeating_round_sequence_number.saturating_add(1)
            ),
            Some(rc) => rc.round_number().to_string(),
            None => String::new(),
        }
    }

    fn round_data_summaries(&self) -> Vec<RoundDataSummary> {
        self.state
            .round_data
            .iter()
            .rev()
            .filter_map(|rd| {
                let rc = self.configuration.round_by_id(rd.round_configuration)?;
                Some(RoundDataSummary {
                    pk: rd.id,
                    round_number: self.round_data_number(rd),
                    round_type: rc.round_type,
                    elapsed_time: rd.elapsed_time,
                    experimenter_notes: rd.experimenter_notes.clone(),
                })
            })
            .collect()
    }

    fn group_summaries(&self) -> Vec<GroupSummary> {
        let session_id = self
            .current_round()
            .map(|rc| rc.session_id.clone())
            .unwrap_or_default();
        self.state
            .groups_in_session(&session_id)
            .into_iter()
            .map(|g| GroupSummary {
                pk: g.id,
                name: g.name(),
                number: g.number,
                size: self.state.group_size(g.id),
                session_id: g.session_id.clone(),
                participants: self.state.members_of(g.id).iter().map(|m| m.id).collect(),
            })
            .collect()
    }

    /// Serializable copy of the whole experiment.
    pub fn archive_record(&self) -> ExperimentArchive {
        ExperimentArchive {
            id: self.id,
            experimenter: self.experimenter,
            name: self.configuration.name.clone(),
            status: self.status,
            current_round_sequence_number: self.current_round_sequence_number,
            current_repeated_round_sequence_number: self.current_repeated_round_sequence_number,
            date_activated: self.date_activated,
            configuration: self.configuration.clone(),
            state: self.state.clone(),
            archived_at: Utc::now(),
        }
    }

    /// Rebuild an experiment from an archive record. No round is running
    /// afterwards: an archived in-progress round comes back as active.
    pub fn from_archive(
        archive: ExperimentArchive,
        registry: Arc<ParameterRegistry>,
        signals: Arc<SignalBus>,
    ) -> Self {
        let status = match archive.status {
            ExperimentStatus::RoundInProgress => ExperimentStatus::Active,
            other => other,
        };
        Self {
            id: archive.id,
            experimenter: archive.experimenter,
            configuration: archive.configuration,
            status,
            current_round_sequence_number: archive.current_round_sequence_number,
            current_repeated_round_sequence_number: archive.current_repeated_round_sequence_number,
            current_round_start_time: None,
            date_activated: archive.date_activated,
            start_date: None,
            last_daily_advance: None,
            state: archive.state,
            registry,
            signals,
            rng: StdRng::from_os_rng(),
            created_at: archive.archived_at,
        }
    }
}
