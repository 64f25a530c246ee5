//! Core entity structs for the vcweb experiment framework.
//!
//! These are plain records: parameters, typed values and their owners,
//! round configurations, participants, groups, clusters and round data.
//! Behavior that needs more than one record (conversion, allocation, the
//! round state machine) lives in `vcweb-core`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::enums::{ParameterScope, ParameterType, RoundType};
use crate::ids::{
    DataValueId, ExperimentConfigurationId, GroupClusterId, GroupId, ParameterId,
    ParticipantGroupId, ParticipantId, RegistrationId, RoundConfigurationId, RoundDataId,
};

// ---------------------------------------------------------------------------
// Typed values
// ---------------------------------------------------------------------------

/// A single strongly-typed parameter value.
///
/// The variant stored for a parameter is selected by its
/// [`ParameterType`]; raw input of any variant is coerced into the right one
/// by the conversion rules in `vcweb-core`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum Value {
    /// Signed integer.
    Int(i64),
    /// Floating-point number.
    Float(f64),
    /// Free text.
    Str(String),
    /// True/false flag.
    Bool(bool),
    /// One of a parameter's enumerated choices.
    Enum(String),
    /// Integer id of a referenced record.
    ForeignKey(i64),
    /// Absent value (the none value of enum parameters).
    Null,
}

impl Value {
    /// Integer payload of `Int` and `ForeignKey` values.
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) | Self::ForeignKey(v) => Some(*v),
            _ => None,
        }
    }

    /// Float payload, widening integers.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Text payload of `Str` and `Enum` values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) | Self::Enum(v) => Some(v),
            _ => None,
        }
    }

    /// Boolean payload.
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Whether this is the `Null` value.
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl core::fmt::Display for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Int(v) | Self::ForeignKey(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v:?}"),
            Self::Str(v) | Self::Enum(v) => f.write_str(v),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Null => Ok(()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// A named, typed slot for configuration or round data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Parameter {
    /// Unique parameter identifier.
    pub id: ParameterId,
    /// Unique machine name, e.g. `participant_ready`.
    pub name: String,
    /// Optional human-readable name.
    pub display_name: Option<String>,
    /// Optional longer description.
    pub description: Option<String>,
    /// Which kind of entity owns values of this parameter.
    pub scope: ParameterScope,
    /// Declared value type.
    pub value_type: ParameterType,
    /// Kind of record a foreign key parameter refers to.
    pub class_name: Option<String>,
    /// Raw default, converted through the value type on use.
    pub default_value_string: Option<String>,
    /// Allowed choices for enum parameters.
    pub enum_choices: Vec<String>,
    /// Whether a value must be supplied.
    pub is_required: bool,
    /// When the parameter was defined.
    pub created_at: DateTime<Utc>,
    /// When the parameter was last changed.
    pub modified_at: DateTime<Utc>,
}

impl Parameter {
    /// Create a parameter with no default, no display name and no choices.
    pub fn new(name: &str, scope: ParameterScope, value_type: ParameterType) -> Self {
        let now = Utc::now();
        Self {
            id: ParameterId::new(),
            name: name.to_owned(),
            display_name: None,
            description: None,
            scope,
            value_type,
            class_name: None,
            default_value_string: None,
            enum_choices: Vec::new(),
            is_required: false,
            created_at: now,
            modified_at: now,
        }
    }

    /// Set the raw default value string.
    #[must_use]
    pub fn with_default(mut self, default_value_string: &str) -> Self {
        self.default_value_string = Some(default_value_string.to_owned());
        self
    }

    /// Set the foreign key target kind.
    #[must_use]
    pub fn with_class_name(mut self, class_name: &str) -> Self {
        self.class_name = Some(class_name.to_owned());
        self
    }

    /// Display label: the display name, or the name title-cased with
    /// underscores replaced by spaces (`harvest_decision` ->
    /// `Harvest Decision`).
    pub fn label(&self) -> String {
        if let Some(display_name) = self.display_name.as_deref().filter(|d| !d.is_empty()) {
            return display_name.to_owned();
        }
        self.name
            .split('_')
            .filter(|word| !word.is_empty())
            .map(|word| {
                let mut chars = word.chars();
                chars.next().map_or_else(String::new, |first| {
                    first
                        .to_uppercase()
                        .chain(chars.flat_map(char::to_lowercase))
                        .collect()
                })
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ---------------------------------------------------------------------------
// Parameterized values
// ---------------------------------------------------------------------------

/// The entity a stored value belongs to.
///
/// Configuration owners are timeless; group, participant and cluster owners
/// always carry the round data the value was recorded in, so a value can
/// never be detached from its round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum ValueOwner {
    /// Experiment-scope configuration value.
    ExperimentConfiguration(ExperimentConfigurationId),
    /// Round-scope configuration value.
    RoundConfiguration(RoundConfigurationId),
    /// Group data for one round.
    Group {
        /// Owning group.
        group: GroupId,
        /// Round data the value belongs to.
        round_data: RoundDataId,
    },
    /// Participant data for one round.
    Participant {
        /// Owning group membership.
        participant_group: ParticipantGroupId,
        /// Round data the value belongs to.
        round_data: RoundDataId,
    },
    /// Group cluster data for one round.
    GroupCluster {
        /// Owning cluster.
        group_cluster: GroupClusterId,
        /// Round data the value belongs to.
        round_data: RoundDataId,
    },
}

impl ValueOwner {
    /// The round data this owner is bound to, if any.
    pub const fn round_data(&self) -> Option<RoundDataId> {
        match self {
            Self::ExperimentConfiguration(_) | Self::RoundConfiguration(_) => None,
            Self::Group { round_data, .. }
            | Self::Participant { round_data, .. }
            | Self::GroupCluster { round_data, .. } => Some(*round_data),
        }
    }

    /// The same owner rebound to another round data. Configuration owners
    /// are returned unchanged.
    #[must_use]
    pub const fn with_round_data(self, round_data: RoundDataId) -> Self {
        match self {
            Self::ExperimentConfiguration(_) | Self::RoundConfiguration(_) => self,
            Self::Group { group, .. } => Self::Group { group, round_data },
            Self::Participant {
                participant_group, ..
            } => Self::Participant {
                participant_group,
                round_data,
            },
            Self::GroupCluster { group_cluster, .. } => Self::GroupCluster {
                group_cluster,
                round_data,
            },
        }
    }

    /// Parameter scope matching this kind of owner.
    pub const fn scope(&self) -> ParameterScope {
        match self {
            Self::ExperimentConfiguration(_) => ParameterScope::Experiment,
            Self::RoundConfiguration(_) => ParameterScope::Round,
            Self::Group { .. } => ParameterScope::Group,
            Self::Participant { .. } => ParameterScope::Participant,
            Self::GroupCluster { .. } => ParameterScope::GroupCluster,
        }
    }
}

/// A stored value bound to one parameter and one owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct DataValue {
    /// Unique value identifier.
    pub id: DataValueId,
    /// The parameter this value is for.
    pub parameter: ParameterId,
    /// Owning entity (and round data, for round-bound owners).
    pub owner: ValueOwner,
    /// The typed payload.
    pub value: Value,
    /// Inactive values are retained for history but ignored by lookups.
    pub is_active: bool,
    /// Set when a participant submits this value as their decision.
    pub submitted: bool,
    /// When the value row was created.
    pub created_at: DateTime<Utc>,
    /// When the value was last written.
    pub modified_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Round configuration
// ---------------------------------------------------------------------------

/// One phase of an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct RoundConfiguration {
    /// Unique round configuration identifier.
    pub id: RoundConfigurationId,
    /// 1-based position within the experiment configuration.
    pub sequence_number: u32,
    /// Number shown to participants (0 = use `sequence_number`).
    pub display_number: u32,
    /// What kind of phase this is.
    pub round_type: RoundType,
    /// Duration in seconds (0 = untimed).
    pub duration: u32,
    /// Number of repetitions (0 = non-repeating).
    pub repeat: u32,
    /// Reallocate groups at the start of this round.
    pub randomize_groups: bool,
    /// Keep existing groups when reallocating (requires a session id).
    pub preserve_existing_groups: bool,
    /// Partition groups into clusters after allocation.
    pub create_group_clusters: bool,
    /// Number of groups per cluster.
    pub group_cluster_size: u32,
    /// Seed configured data values when this round starts.
    pub initialize_data_values: bool,
    /// Session the round's groups belong to.
    pub session_id: String,
    /// Whether chat is enabled during the round.
    pub chat_enabled: bool,
    /// External survey URL for survey rounds.
    pub survey_url: Option<String>,
    /// Instructions template.
    pub instructions: Option<String>,
    /// Debriefing template.
    pub debriefing: Option<String>,
    /// Name of the UI template used to render the round.
    pub template_id: Option<String>,
    /// When the round configuration was authored.
    pub created_at: DateTime<Utc>,
    /// When the round configuration was last changed.
    pub modified_at: DateTime<Utc>,
}

impl RoundConfiguration {
    /// Create a round of the given type with default settings. The sequence
    /// number is assigned when the round is added to a configuration.
    pub fn new(round_type: RoundType) -> Self {
        let now = Utc::now();
        Self {
            id: RoundConfigurationId::new(),
            sequence_number: 0,
            display_number: 0,
            round_type,
            duration: 0,
            repeat: 0,
            randomize_groups: false,
            preserve_existing_groups: true,
            create_group_clusters: false,
            group_cluster_size: 2,
            initialize_data_values: false,
            session_id: String::new(),
            chat_enabled: false,
            survey_url: None,
            instructions: None,
            debriefing: None,
            template_id: None,
            created_at: now,
            modified_at: now,
        }
    }

    /// Set the repeat count.
    #[must_use]
    pub const fn with_repeat(mut self, repeat: u32) -> Self {
        self.repeat = repeat;
        self
    }

    /// Set the duration in seconds.
    #[must_use]
    pub const fn with_duration(mut self, duration: u32) -> Self {
        self.duration = duration;
        self
    }

    /// Whether this round repeats.
    pub const fn is_repeating_round(&self) -> bool {
        self.repeat > 0
    }

    /// Whether this round has a timer.
    pub const fn is_timed_round(&self) -> bool {
        self.duration > 0
    }

    /// Whether participants make decisions in this round.
    pub const fn is_playable_round(&self) -> bool {
        self.round_type.is_playable()
    }

    /// Whether an external survey is attached.
    pub fn is_survey_enabled(&self) -> bool {
        self.survey_url.as_deref().is_some_and(|url| !url.trim().is_empty())
    }

    /// The number shown to participants.
    pub const fn round_number(&self) -> u32 {
        if self.display_number == 0 {
            self.sequence_number
        } else {
            self.display_number
        }
    }

    /// `Round N` for regular rounds, the round type label otherwise.
    pub fn display_label(&self) -> String {
        if self.round_type == RoundType::Regular {
            format!("Round {}", self.round_number())
        } else {
            self.round_type.label().to_owned()
        }
    }

    /// `s of F`, or `s of F [x r]` for repeating rounds.
    pub fn sequence_label(&self, final_sequence_number: u32) -> String {
        if self.is_repeating_round() {
            format!(
                "{} of {} [x {}]",
                self.sequence_number, final_sequence_number, self.repeat
            )
        } else {
            format!("{} of {}", self.sequence_number, final_sequence_number)
        }
    }
}

// ---------------------------------------------------------------------------
// Participants and groups
// ---------------------------------------------------------------------------

/// A participant account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Participant {
    /// Unique participant identifier.
    pub id: ParticipantId,
    /// Normalized (trimmed, lowercased) email address.
    pub email: String,
    /// Optional full name.
    pub full_name: Option<String>,
    /// Optional institution.
    pub institution: Option<String>,
    /// When the account was created.
    pub created_at: DateTime<Utc>,
}

/// A participant's registration in one experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Registration {
    /// Unique registration identifier.
    pub id: RegistrationId,
    /// The registered participant.
    pub participant: ParticipantId,
    /// Opaque generated identifier (32 hex chars).
    pub participant_identifier: String,
    /// 1-based registration order within the experiment.
    pub sequential_participant_identifier: u32,
    /// When the participant was registered.
    pub created_at: DateTime<Utc>,
}

/// A group of participants within one session of an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Group {
    /// Unique group identifier.
    pub id: GroupId,
    /// 1-based number, unique within the experiment and session.
    pub number: u32,
    /// Capacity (0 = open, never full).
    pub max_size: u32,
    /// Session the group belongs to.
    pub session_id: String,
    /// When the group was created.
    pub created_at: DateTime<Utc>,
}

impl Group {
    /// `Group A`, `Group B`, ... wrapping after `Z`.
    pub fn name(&self) -> String {
        let offset = self.number.saturating_sub(1).checked_rem(26).unwrap_or(0);
        let letter = u8::try_from(offset)
            .ok()
            .and_then(|o| b'A'.checked_add(o))
            .map_or('A', char::from);
        format!("Group {letter}")
    }

    /// Whether a group of `size` members is at capacity.
    pub const fn is_full(&self, size: u32) -> bool {
        self.max_size > 0 && size >= self.max_size
    }

    /// Whether the group can take another member at `size`.
    pub const fn is_open(&self, size: u32) -> bool {
        !self.is_full(size)
    }
}

/// A participant's membership in one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ParticipantGroupRelationship {
    /// Unique membership identifier.
    pub id: ParticipantGroupId,
    /// The member.
    pub participant: ParticipantId,
    /// The group joined.
    pub group: GroupId,
    /// 1-based number local to the group.
    pub participant_number: u32,
    /// Round configuration in which the participant joined.
    pub round_joined: RoundConfigurationId,
    /// Whether the membership is active.
    pub active: bool,
    /// Set until the participant first loads the experiment page.
    pub first_visit: bool,
    /// Per-round survey completion flag, cleared when a round ends.
    pub survey_completed: bool,
    /// When the participant joined.
    pub created_at: DateTime<Utc>,
}

/// A cluster of groups within one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct GroupCluster {
    /// Unique cluster identifier.
    pub id: GroupClusterId,
    /// Session the cluster belongs to.
    pub session_id: String,
    /// Member groups in cluster order.
    pub groups: Vec<GroupId>,
    /// When the cluster was created.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Round data and activity log
// ---------------------------------------------------------------------------

/// Data recorded for one repetition of one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct RoundData {
    /// Unique round data identifier.
    pub id: RoundDataId,
    /// The round configuration played.
    pub round_configuration: RoundConfigurationId,
    /// 0-based repetition index (always 0 for non-repeating rounds).
    pub repeating_round_sequence_number: u32,
    /// Seconds elapsed while the round was in progress.
    pub elapsed_time: u64,
    /// Free-form notes from the experimenter.
    pub experimenter_notes: String,
    /// When the round data was created.
    pub created_at: DateTime<Utc>,
}

/// An entry in an experiment's activity log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ActivityLogEntry {
    /// Round in progress when the entry was written.
    pub round_configuration: Option<RoundConfigurationId>,
    /// Group the entry concerns, for group activity.
    pub group: Option<GroupId>,
    /// Log message.
    pub message: String,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_label_title_cases_name() {
        let p = Parameter::new("harvest_decision", ParameterScope::Participant, ParameterType::Int);
        assert_eq!(p.label(), "Harvest Decision");
    }

    #[test]
    fn parameter_label_prefers_display_name() {
        let mut p = Parameter::new("chat_message", ParameterScope::Participant, ParameterType::String);
        p.display_name = Some("Chat".to_owned());
        assert_eq!(p.label(), "Chat");
    }

    #[test]
    fn value_serializes_tagged() {
        let json = serde_json::to_string(&Value::Int(3)).ok();
        assert_eq!(json.as_deref(), Some(r#"{"type":"int","value":3}"#));
    }

    #[test]
    fn value_display() {
        assert_eq!(Value::Float(3.0).to_string(), "3.0");
        assert_eq!(Value::Int(-1).to_string(), "-1");
        assert_eq!(Value::Null.to_string(), "");
    }

    #[test]
    fn owner_rebinds_round_data() {
        let group = GroupId::new();
        let first = RoundDataId::new();
        let second = RoundDataId::new();
        let owner = ValueOwner::Group {
            group,
            round_data: first,
        };
        assert_eq!(owner.round_data(), Some(first));
        assert_eq!(owner.with_round_data(second).round_data(), Some(second));

        let config = ValueOwner::ExperimentConfiguration(ExperimentConfigurationId::new());
        assert_eq!(config.with_round_data(second), config);
        assert_eq!(config.round_data(), None);
    }

    #[test]
    fn round_labels() {
        let mut rc = RoundConfiguration::new(RoundType::Regular).with_repeat(3);
        rc.sequence_number = 2;
        assert_eq!(rc.round_number(), 2);
        assert_eq!(rc.display_label(), "Round 2");
        assert_eq!(rc.sequence_label(4), "2 of 4 [x 3]");

        rc.display_number = 1;
        assert_eq!(rc.display_label(), "Round 1");

        let mut welcome = RoundConfiguration::new(RoundType::Welcome);
        welcome.sequence_number = 1;
        assert_eq!(welcome.display_label(), "Initial welcome page");
        assert_eq!(welcome.sequence_label(4), "1 of 4");
    }

    #[test]
    fn group_capacity() {
        let group = Group {
            id: GroupId::new(),
            number: 2,
            max_size: 5,
            session_id: String::new(),
            created_at: Utc::now(),
        };
        assert_eq!(group.name(), "Group B");
        assert!(group.is_open(4));
        assert!(group.is_full(5));

        let open = Group { max_size: 0, ..group };
        assert!(!open.is_full(1000));
    }
}
