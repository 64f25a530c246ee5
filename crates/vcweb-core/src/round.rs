//! Experiment configuration: the ordered round list and configuration-level
//! parameter values.
//!
//! Round sequence numbers are always exactly `1..=N`. Rounds are kept in a
//! vector in play order and renumbered from their position after every
//! insert, remove or move, so gaps and duplicates cannot occur.

use chrono::{DateTime, Utc};
use minijinja::Environment;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;
use vcweb_types::{
    DataValue, ExperimentConfigurationId, ExperimenterId, Parameter, RoundConfiguration,
    RoundConfigurationId, Value, ValueOwner,
};

use crate::value_store::{ValueStore, ValueStoreError};

/// Errors from editing or querying an experiment configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoundConfigurationError {
    /// A sequence number outside `1..=N` (or `1..=N+1` for inserts).
    #[error("sequence number {sequence_number} out of range (1..={max})")]
    SequenceOutOfRange {
        /// The requested sequence number.
        sequence_number: u32,
        /// Largest acceptable sequence number.
        max: u32,
    },

    /// No round with the given id.
    #[error("no round configuration with id {id}")]
    UnknownRound {
        /// The requested id.
        id: RoundConfigurationId,
    },

    /// Instructions or debriefing template failed to render.
    #[error("template error: {0}")]
    Template(String),

    /// A configuration parameter value could not be read or written.
    #[error(transparent)]
    Value(#[from] ValueStoreError),
}

/// A data value seeded when a round with `initialize_data_values` starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialValue {
    /// Name of the parameter to seed.
    pub parameter: String,
    /// Raw default, converted through the parameter type.
    #[serde(default)]
    pub default: Option<Value>,
}

/// Data values seeded for every group, participant and cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitialDataValues {
    /// Group-scope values.
    #[serde(default)]
    pub group: Vec<InitialValue>,
    /// Participant-scope values.
    #[serde(default)]
    pub participant: Vec<InitialValue>,
    /// Group cluster-scope values.
    #[serde(default)]
    pub group_cluster: Vec<InitialValue>,
}

impl InitialDataValues {
    /// Whether nothing is configured.
    pub const fn is_empty(&self) -> bool {
        self.group.is_empty() && self.participant.is_empty() && self.group_cluster.is_empty()
    }
}

/// An authored experiment design: settings, rounds and parameter values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfiguration {
    /// Unique configuration identifier.
    pub id: ExperimentConfigurationId,
    /// Human-readable name.
    pub name: String,
    /// Experimenter who authored the configuration.
    pub creator: ExperimenterId,
    /// Participant cap (0 = unlimited).
    pub max_number_of_participants: u32,
    /// Group capacity used by allocation (0 = a single open group).
    pub max_group_size: u32,
    /// Currency units per experiment point.
    pub exchange_rate: Decimal,
    /// Payment for showing up.
    pub show_up_payment: Decimal,
    /// Payment cap.
    pub maximum_payment: Decimal,
    /// Treatment identifier for analysis.
    pub treatment_id: Option<String>,
    /// Rounds are advanced by the experimenter rather than participants.
    pub is_experimenter_driven: bool,
    /// Rounds advance once per day.
    pub has_daily_rounds: bool,
    /// Listed publicly.
    pub is_public: bool,
    /// Subject line for registration emails.
    pub registration_email_subject: Option<String>,
    /// Values seeded when a round with `initialize_data_values` starts.
    pub initial_values: InitialDataValues,
    /// When the configuration was authored.
    pub created_at: DateTime<Utc>,
    /// When the configuration was last changed.
    pub modified_at: DateTime<Utc>,
    rounds: Vec<RoundConfiguration>,
    parameter_values: ValueStore,
}

impl ExperimentConfiguration {
    /// Create an empty configuration with default payment settings
    /// (exchange rate 0.20, show-up payment 5.00, maximum payment 40.00).
    pub fn new(name: &str, creator: ExperimenterId) -> Self {
        let now = Utc::now();
        Self {
            id: ExperimentConfigurationId::new(),
            name: name.to_owned(),
            creator,
            max_number_of_participants: 0,
            max_group_size: 5,
            exchange_rate: Decimal::new(20, 2),
            show_up_payment: Decimal::new(500, 2),
            maximum_payment: Decimal::new(4000, 2),
            treatment_id: None,
            is_experimenter_driven: true,
            has_daily_rounds: false,
            is_public: false,
            registration_email_subject: None,
            initial_values: InitialDataValues::default(),
            created_at: now,
            modified_at: now,
            rounds: Vec::new(),
            parameter_values: ValueStore::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Round list
    // -----------------------------------------------------------------------

    /// Rounds in sequence order.
    pub fn rounds(&self) -> &[RoundConfiguration] {
        &self.rounds
    }

    /// The round at a 1-based sequence number.
    pub fn round(&self, sequence_number: u32) -> Option<&RoundConfiguration> {
        let index = usize::try_from(sequence_number.checked_sub(1)?).ok()?;
        self.rounds.get(index)
    }

    /// A round by id.
    pub fn round_by_id(&self, id: RoundConfigurationId) -> Option<&RoundConfiguration> {
        self.rounds.iter().find(|rc| rc.id == id)
    }

    /// Append a round, returning its id.
    pub fn push_round(&mut self, round: RoundConfiguration) -> RoundConfigurationId {
        let id = round.id;
        self.rounds.push(round);
        self.renumber();
        id
    }

    /// Insert a round at `sequence_number`, shifting later rounds up.
    ///
    /// # Errors
    ///
    /// Returns [`RoundConfigurationError::SequenceOutOfRange`] unless
    /// `1 <= sequence_number <= N + 1`.
    pub fn insert_round(
        &mut self,
        sequence_number: u32,
        round: RoundConfiguration,
    ) -> Result<RoundConfigurationId, RoundConfigurationError> {
        let max = self.final_sequence_number().saturating_add(1);
        let index = self.index_of(sequence_number, max)?;
        let id = round.id;
        self.rounds.insert(index, round);
        self.renumber();
        Ok(id)
    }

    /// Remove the round at `sequence_number`, shifting later rounds down.
    /// Its round-scope parameter values are removed with it.
    ///
    /// # Errors
    ///
    /// Returns [`RoundConfigurationError::SequenceOutOfRange`] unless
    /// `1 <= sequence_number <= N`.
    pub fn remove_round(
        &mut self,
        sequence_number: u32,
    ) -> Result<RoundConfiguration, RoundConfigurationError> {
        let index = self.index_of(sequence_number, self.final_sequence_number())?;
        let removed = self.rounds.remove(index);
        let owner = ValueOwner::RoundConfiguration(removed.id);
        self.parameter_values.remove_where(|v| v.owner == owner);
        self.renumber();
        Ok(removed)
    }

    /// Move the round at `from` to position `to`; rounds in between shift
    /// by one toward the vacated position.
    ///
    /// # Errors
    ///
    /// Returns [`RoundConfigurationError::SequenceOutOfRange`] if either
    /// position is outside `1..=N`.
    pub fn move_round(&mut self, from: u32, to: u32) -> Result<(), RoundConfigurationError> {
        let last = self.final_sequence_number();
        let from_index = self.index_of(from, last)?;
        let to_index = self.index_of(to, last)?;
        let round = self.rounds.remove(from_index);
        self.rounds.insert(to_index, round);
        self.renumber();
        debug!(from, to, "Moved round configuration");
        Ok(())
    }

    /// Edit a round's settings in place. The sequence number and id are
    /// restored afterwards; use [`Self::move_round`] to reorder.
    ///
    /// # Errors
    ///
    /// Returns [`RoundConfigurationError::UnknownRound`] for an unknown id.
    pub fn configure_round<F>(
        &mut self,
        id: RoundConfigurationId,
        edit: F,
    ) -> Result<(), RoundConfigurationError>
    where
        F: FnOnce(&mut RoundConfiguration),
    {
        let round = self
            .rounds
            .iter_mut()
            .find(|rc| rc.id == id)
            .ok_or(RoundConfigurationError::UnknownRound { id })?;
        let sequence_number = round.sequence_number;
        edit(round);
        round.id = id;
        round.sequence_number = sequence_number;
        round.modified_at = Utc::now();
        Ok(())
    }

    /// Number of round configuration rows (a repeating round counts once).
    pub fn final_sequence_number(&self) -> u32 {
        u32::try_from(self.rounds.len()).unwrap_or(u32::MAX)
    }

    /// Rounds actually played: each non-repeating round once, each
    /// repeating round `repeat` times.
    pub fn total_number_of_rounds(&self) -> u32 {
        self.rounds.iter().fold(0_u32, |total, rc| {
            total.saturating_add(if rc.is_repeating_round() { rc.repeat } else { 1 })
        })
    }

    /// Whether groups are unbounded.
    pub const fn is_open(&self) -> bool {
        self.max_group_size == 0
    }

    fn index_of(&self, sequence_number: u32, max: u32) -> Result<usize, RoundConfigurationError> {
        if sequence_number == 0 || sequence_number > max {
            return Err(RoundConfigurationError::SequenceOutOfRange {
                sequence_number,
                max,
            });
        }
        usize::try_from(sequence_number.saturating_sub(1)).map_err(|_| {
            RoundConfigurationError::SequenceOutOfRange {
                sequence_number,
                max,
            }
        })
    }

    fn renumber(&mut self) {
        let mut next = 1_u32;
        for rc in &mut self.rounds {
            rc.sequence_number = next;
            next = next.saturating_add(1);
        }
        self.modified_at = Utc::now();
    }

    // -----------------------------------------------------------------------
    // Parameter values
    // -----------------------------------------------------------------------

    /// Configuration-level parameter values.
    pub const fn parameter_values(&self) -> &ValueStore {
        &self.parameter_values
    }

    /// The experiment-scope value of `parameter`, materialized with
    /// `default` when absent.
    ///
    /// # Errors
    ///
    /// Returns [`RoundConfigurationError::Value`] if `default` cannot be
    /// converted.
    pub fn parameter_value(
        &mut self,
        parameter: &Parameter,
        default: Option<&Value>,
    ) -> Result<DataValue, RoundConfigurationError> {
        let owner = ValueOwner::ExperimentConfiguration(self.id);
        Ok(self
            .parameter_values
            .get_or_create(owner, parameter, default)?
            .0)
    }

    /// Set the experiment-scope value of `parameter`.
    ///
    /// # Errors
    ///
    /// Returns [`RoundConfigurationError::Value`] if `value` cannot be
    /// converted.
    pub fn set_parameter_value(
        &mut self,
        parameter: &Parameter,
        value: &Value,
    ) -> Result<DataValue, RoundConfigurationError> {
        let owner = ValueOwner::ExperimentConfiguration(self.id);
        Ok(self.parameter_values.set(owner, parameter, value)?)
    }

    /// The round-scope value of `parameter`. When the round has none and
    /// `inheritable` is set, the experiment-scope value is used instead.
    ///
    /// # Errors
    ///
    /// Returns [`RoundConfigurationError::UnknownRound`] for an unknown
    /// round, or [`RoundConfigurationError::Value`].
    pub fn round_parameter_value(
        &mut self,
        round: RoundConfigurationId,
        parameter: &Parameter,
        default: Option<&Value>,
        inheritable: bool,
    ) -> Result<DataValue, RoundConfigurationError> {
        if self.round_by_id(round).is_none() {
            return Err(RoundConfigurationError::UnknownRound { id: round });
        }
        let owner = ValueOwner::RoundConfiguration(round);
        if let Some(found) = self.parameter_values.find(&owner, parameter.id) {
            return Ok(found.clone());
        }
        if inheritable {
            return self.parameter_value(parameter, default);
        }
        Ok(self
            .parameter_values
            .get_or_create(owner, parameter, default)?
            .0)
    }

    /// Set the round-scope value of `parameter`.
    ///
    /// # Errors
    ///
    /// Returns [`RoundConfigurationError::UnknownRound`] for an unknown
    /// round, or [`RoundConfigurationError::Value`].
    pub fn set_round_parameter_value(
        &mut self,
        round: RoundConfigurationId,
        parameter: &Parameter,
        value: &Value,
    ) -> Result<DataValue, RoundConfigurationError> {
        if self.round_by_id(round).is_none() {
            return Err(RoundConfigurationError::UnknownRound { id: round });
        }
        let owner = ValueOwner::RoundConfiguration(round);
        Ok(self.parameter_values.set(owner, parameter, value)?)
    }

    // -----------------------------------------------------------------------
    // Cloning
    // -----------------------------------------------------------------------

    /// Deep copy for `creator` with fresh ids for the configuration, its
    /// rounds and its parameter values.
    #[must_use]
    pub fn clone_for(&self, creator: ExperimenterId) -> Self {
        let mut copy = Self::new(&self.name, creator);
        copy.max_number_of_participants = self.max_number_of_participants;
        copy.max_group_size = self.max_group_size;
        copy.exchange_rate = self.exchange_rate;
        copy.show_up_payment = self.show_up_payment;
        copy.maximum_payment = self.maximum_payment;
        copy.treatment_id.clone_from(&self.treatment_id);
        copy.is_experimenter_driven = self.is_experimenter_driven;
        copy.has_daily_rounds = self.has_daily_rounds;
        copy.is_public = self.is_public;
        copy.registration_email_subject
            .clone_from(&self.registration_email_subject);
        copy.initial_values = self.initial_values.clone();

        let mut round_ids = Vec::with_capacity(self.rounds.len());
        for rc in &self.rounds {
            let new_round = RoundConfiguration {
                id: RoundConfigurationId::new(),
                ..rc.clone()
            };
            round_ids.push((rc.id, new_round.id));
            copy.rounds.push(new_round);
        }
        copy.renumber();

        for value in self.parameter_values.iter().filter(|v| v.is_active) {
            let owner = match value.owner {
                ValueOwner::ExperimentConfiguration(_) => ValueOwner::ExperimentConfiguration(copy.id),
                ValueOwner::RoundConfiguration(old) => {
                    match round_ids.iter().find(|(from, _)| *from == old) {
                        Some((_, new)) => ValueOwner::RoundConfiguration(*new),
                        None => continue,
                    }
                }
                other => other,
            };
            copy.parameter_values.restore(DataValue {
                id: vcweb_types::DataValueId::new(),
                owner,
                ..value.clone()
            });
        }
        copy
    }
}

// ---------------------------------------------------------------------------
// Templating
// ---------------------------------------------------------------------------

/// Render round instructions or debriefing text. The template sees
/// `round_number`, `participant_id` and any keys of `extra` (an object).
///
/// # Errors
///
/// Returns [`RoundConfigurationError::Template`] on a syntax or render
/// error.
pub fn templatize(
    template: &str,
    round: &RoundConfiguration,
    participant_id: Option<&str>,
    extra: &serde_json::Value,
) -> Result<String, RoundConfigurationError> {
    let mut context = match extra {
        serde_json::Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    context.insert("round_number".to_owned(), round.round_number().into());
    context.insert(
        "participant_id".to_owned(),
        participant_id.map_or(serde_json::Value::Null, Into::into),
    );

    let env = Environment::new();
    env.render_str(template, serde_json::Value::Object(context))
        .map_err(|e| RoundConfigurationError::Template(format!("round template failed: {e}")))
}

/// Rendered instructions for a round, empty when it has none.
///
/// # Errors
///
/// See [`templatize`].
pub fn render_instructions(
    round: &RoundConfiguration,
    participant_id: Option<&str>,
) -> Result<String, RoundConfigurationError> {
    round.instructions.as_deref().map_or_else(
        || Ok(String::new()),
        |t| templatize(t, round, participant_id, &serde_json::Value::Null),
    )
}

/// Rendered debriefing for a round, empty when it has none.
///
/// # Errors
///
/// See [`templatize`].
pub fn render_debriefing(
    round: &RoundConfiguration,
    participant_id: Option<&str>,
) -> Result<String, RoundConfigurationError> {
    round.debriefing.as_deref().map_or_else(
        || Ok(String::new()),
        |t| templatize(t, round, participant_id, &serde_json::Value::Null),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rust_decimal_macros::dec;
    use vcweb_types::{ParameterScope, ParameterType, RoundType};

    use super::*;

    fn configuration(types: &[RoundType]) -> ExperimentConfiguration {
        let mut config = ExperimentConfiguration::new("test", ExperimenterId::new());
        for t in types {
            config.push_round(RoundConfiguration::new(*t));
        }
        config
    }

    fn sequence_numbers(config: &ExperimentConfiguration) -> Vec<u32> {
        config.rounds().iter().map(|rc| rc.sequence_number).collect()
    }

    #[test]
    fn defaults_match_payment_settings() {
        let config = ExperimentConfiguration::new("test", ExperimenterId::new());
        assert_eq!(config.exchange_rate, dec!(0.20));
        assert_eq!(config.show_up_payment, dec!(5.00));
        assert_eq!(config.maximum_payment, dec!(40.00));
        assert_eq!(config.max_group_size, 5);
        assert!(config.is_experimenter_driven);
    }

    #[test]
    fn sequence_numbers_stay_dense() {
        let mut config = configuration(&[RoundType::Welcome, RoundType::Regular, RoundType::Debriefing]);
        assert_eq!(sequence_numbers(&config), vec![1, 2, 3]);

        let practice = config
            .insert_round(2, RoundConfiguration::new(RoundType::Practice))
            .unwrap();
        assert_eq!(sequence_numbers(&config), vec![1, 2, 3, 4]);
        assert_eq!(config.round(2).map(|rc| rc.id), Some(practice));

        config.remove_round(1).unwrap();
        assert_eq!(sequence_numbers(&config), vec![1, 2, 3]);
        assert_eq!(config.round(1).map(|rc| rc.round_type), Some(RoundType::Practice));

        config.move_round(3, 1).unwrap();
        assert_eq!(sequence_numbers(&config), vec![1, 2, 3]);
        assert_eq!(config.round(1).map(|rc| rc.round_type), Some(RoundType::Debriefing));
        assert_eq!(config.round(2).map(|rc| rc.round_type), Some(RoundType::Practice));
    }

    #[test]
    fn out_of_range_edits_are_rejected() {
        let mut config = configuration(&[RoundType::Regular]);
        assert!(config.insert_round(0, RoundConfiguration::new(RoundType::Chat)).is_err());
        assert!(config.insert_round(3, RoundConfiguration::new(RoundType::Chat)).is_err());
        assert!(config.insert_round(2, RoundConfiguration::new(RoundType::Chat)).is_ok());
        assert!(config.remove_round(3).is_err());
        assert!(config.move_round(1, 5).is_err());
        assert_eq!(sequence_numbers(&config), vec![1, 2]);
    }

    #[test]
    fn configure_round_cannot_break_ordering() {
        let mut config = configuration(&[RoundType::Welcome, RoundType::Regular]);
        let id = config.round(2).map(|rc| rc.id).unwrap();
        config
            .configure_round(id, |rc| {
                rc.sequence_number = 9;
                rc.duration = 60;
            })
            .unwrap();
        assert_eq!(sequence_numbers(&config), vec![1, 2]);
        assert_eq!(config.round(2).map(|rc| rc.duration), Some(60));
    }

    #[test]
    fn repeat_expansion() {
        let mut config = configuration(&[RoundType::Welcome]);
        config.push_round(RoundConfiguration::new(RoundType::Regular).with_repeat(3));
        config.push_round(RoundConfiguration::new(RoundType::Debriefing));
        assert_eq!(config.total_number_of_rounds(), 5);
        assert_eq!(config.final_sequence_number(), 3);
    }

    #[test]
    fn round_values_inherit_from_experiment() {
        let mut config = configuration(&[RoundType::Regular]);
        let round = config.round(1).map(|rc| rc.id).unwrap();
        let p = Parameter::new("max_harvest", ParameterScope::Round, ParameterType::Int);

        config.set_parameter_value(&p, &Value::Int(10)).unwrap();
        let inherited = config.round_parameter_value(round, &p, None, true).unwrap();
        assert_eq!(inherited.value, Value::Int(10));

        config.set_round_parameter_value(round, &p, &Value::Int(4)).unwrap();
        let own = config.round_parameter_value(round, &p, None, true).unwrap();
        assert_eq!(own.value, Value::Int(4));
    }

    #[test]
    fn clone_for_gets_fresh_identity() {
        let mut config = configuration(&[RoundType::Welcome, RoundType::Regular]);
        let round = config.round(2).map(|rc| rc.id).unwrap();
        let p = Parameter::new("max_harvest", ParameterScope::Round, ParameterType::Int);
        config.set_round_parameter_value(round, &p, &Value::Int(4)).unwrap();

        let creator = ExperimenterId::new();
        let mut copy = config.clone_for(creator);
        assert_ne!(copy.id, config.id);
        assert_eq!(copy.creator, creator);
        assert_eq!(sequence_numbers(&copy), vec![1, 2]);

        let copied_round = copy.round(2).map(|rc| rc.id).unwrap();
        assert_ne!(copied_round, round);
        let value = copy.round_parameter_value(copied_round, &p, None, false).unwrap();
        assert_eq!(value.value, Value::Int(4));
    }

    #[test]
    fn templatize_substitutes_round_number_and_participant() {
        let mut rc = RoundConfiguration::new(RoundType::Regular);
        rc.sequence_number = 3;
        rc.instructions =
            Some("Round {{ round_number }} for participant {{ participant_id }}".to_owned());
        let rendered = render_instructions(&rc, Some("7")).unwrap();
        assert_eq!(rendered, "Round 3 for participant 7");

        let extra = serde_json::json!({ "harvest": 12 });
        let text = templatize("You harvested {{ harvest }}", &rc, None, &extra).unwrap();
        assert_eq!(text, "You harvested 12");
    }

    #[test]
    fn templatize_reports_syntax_errors() {
        let rc = RoundConfiguration::new(RoundType::Regular);
        assert!(matches!(
            templatize("{{ unclosed", &rc, None, &serde_json::Value::Null),
            Err(RoundConfigurationError::Template(_))
        ));
    }
}
