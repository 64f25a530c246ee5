//! Parameterized value store.
//!
//! Holds every [`DataValue`] of an experiment (or of an experiment
//! configuration) in creation order. A lookup by owner and parameter
//! returns the most recently created active row; reads never fail for a
//! missing row, they materialize one holding the parameter's none value
//! (or the supplied default).
//!
//! The store is plain data. Exclusive access is provided by whoever owns
//! it: the experiment's mutex makes every get-or-create a lock-then-read.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vcweb_types::{DataValue, DataValueId, Parameter, ParameterId, RoundDataId, Value, ValueOwner};

use crate::parameter::{ConversionError, convert, none_value};

/// Errors from value store writes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueStoreError {
    /// The value could not be converted to the parameter's type.
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    /// No value row with the given id exists.
    #[error("no data value with id {id}")]
    NotFound {
        /// The requested id.
        id: DataValueId,
    },

    /// Increment requested on a non-numeric value.
    #[error("parameter {parameter} does not hold a numeric value")]
    NotNumeric {
        /// Name of the parameter.
        parameter: String,
    },

    /// Integer increment overflowed.
    #[error("increment of parameter {parameter} overflowed")]
    Overflow {
        /// Name of the parameter.
        parameter: String,
    },
}

/// Every stored value of one experiment or configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueStore {
    values: Vec<DataValue>,
}

impl ValueStore {
    /// Create an empty store.
    pub const fn new() -> Self {
        Self { values: Vec::new() }
    }

    /// Number of stored rows, active or not.
    pub const fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the store holds no rows.
    pub const fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// All rows in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &DataValue> {
        self.values.iter()
    }

    /// A row by id.
    pub fn by_id(&self, id: DataValueId) -> Option<&DataValue> {
        self.values.iter().find(|v| v.id == id)
    }

    /// The most recent active row for `(owner, parameter)`, without
    /// materializing one.
    pub fn find(&self, owner: &ValueOwner, parameter: ParameterId) -> Option<&DataValue> {
        self.values
            .iter()
            .rev()
            .find(|v| v.is_active && v.parameter == parameter && v.owner == *owner)
    }

    /// Every active row for `(owner, parameter)`, newest first.
    pub fn get_all(&self, owner: &ValueOwner, parameter: ParameterId) -> Vec<&DataValue> {
        self.values
            .iter()
            .rev()
            .filter(|v| v.is_active && v.parameter == parameter && v.owner == *owner)
            .collect()
    }

    /// Every active row recorded in `round_data` for `parameter`.
    pub fn in_round(&self, round_data: RoundDataId, parameter: ParameterId) -> Vec<&DataValue> {
        self.values
            .iter()
            .filter(|v| {
                v.is_active && v.parameter == parameter && v.owner.round_data() == Some(round_data)
            })
            .collect()
    }

    /// Get the value for `(owner, parameter)`, creating it when absent.
    ///
    /// A fresh row holds `default` converted through the parameter's type,
    /// or the none value when no default is given. An existing row is
    /// returned unchanged and `default` is ignored. The flag reports
    /// whether a row was created.
    ///
    /// # Errors
    ///
    /// Returns [`ValueStoreError::Conversion`] if `default` cannot be
    /// converted.
    pub fn get_or_create(
        &mut self,
        owner: ValueOwner,
        parameter: &Parameter,
        default: Option<&Value>,
    ) -> Result<(DataValue, bool), ValueStoreError> {
        if let Some(existing) = self.find(&owner, parameter.id) {
            return Ok((existing.clone(), false));
        }
        let value = match default {
            Some(raw) => convert(parameter, raw)?,
            None => none_value(parameter.value_type),
        };
        let created = self.push(owner, parameter.id, value);
        Ok((created, true))
    }

    /// Like [`Self::get_or_create`], logging a warning when the row had to
    /// be materialized.
    ///
    /// # Errors
    ///
    /// See [`Self::get_or_create`].
    pub fn get(
        &mut self,
        owner: ValueOwner,
        parameter: &Parameter,
        default: Option<&Value>,
    ) -> Result<DataValue, ValueStoreError> {
        let (value, created) = self.get_or_create(owner, parameter, default)?;
        if created {
            warn!(
                parameter = %parameter.name,
                owner = ?owner,
                "No data value found, created one"
            );
        }
        Ok(value)
    }

    /// Convert `value` and write it to the row for `(owner, parameter)`,
    /// creating the row when absent.
    ///
    /// # Errors
    ///
    /// Returns [`ValueStoreError::Conversion`] if `value` cannot be
    /// converted.
    pub fn set(
        &mut self,
        owner: ValueOwner,
        parameter: &Parameter,
        value: &Value,
    ) -> Result<DataValue, ValueStoreError> {
        let converted = convert(parameter, value)?;
        let (existing, _) = self.get_or_create(owner, parameter, None)?;
        self.write(existing.id, converted)
    }

    /// Convert `value` and append it as a new row, even if the owner
    /// already has one (chat messages, comments).
    ///
    /// # Errors
    ///
    /// Returns [`ValueStoreError::Conversion`] if `value` cannot be
    /// converted.
    pub fn create(
        &mut self,
        owner: ValueOwner,
        parameter: &Parameter,
        value: &Value,
    ) -> Result<DataValue, ValueStoreError> {
        let converted = convert(parameter, value)?;
        Ok(self.push(owner, parameter.id, converted))
    }

    /// Convert `value` and overwrite the row with id `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ValueStoreError::NotFound`] for an unknown id, or
    /// [`ValueStoreError::Conversion`].
    pub fn update(
        &mut self,
        id: DataValueId,
        parameter: &Parameter,
        value: &Value,
    ) -> Result<DataValue, ValueStoreError> {
        let converted = convert(parameter, value)?;
        self.write(id, converted)
    }

    /// Add `amount` to the numeric value for `(owner, parameter)`.
    ///
    /// # Errors
    ///
    /// Returns [`ValueStoreError::NotNumeric`] when either side is not a
    /// number, or [`ValueStoreError::Overflow`].
    pub fn increment(
        &mut self,
        owner: ValueOwner,
        parameter: &Parameter,
        amount: &Value,
    ) -> Result<DataValue, ValueStoreError> {
        let (existing, _) = self.get_or_create(owner, parameter, None)?;
        let not_numeric = || ValueStoreError::NotNumeric {
            parameter: parameter.name.clone(),
        };
        let next = match (&existing.value, amount) {
            (Value::Int(current), _) => {
                let delta = amount.as_int().ok_or_else(not_numeric)?;
                Value::Int(current.checked_add(delta).ok_or_else(|| {
                    ValueStoreError::Overflow {
                        parameter: parameter.name.clone(),
                    }
                })?)
            }
            (Value::Float(current), _) => {
                let delta = amount.as_float().ok_or_else(not_numeric)?;
                Value::Float(current + delta)
            }
            _ => return Err(not_numeric()),
        };
        self.write(existing.id, next)
    }

    /// Mark a row as submitted with the given (already converted) value.
    ///
    /// # Errors
    ///
    /// Returns [`ValueStoreError::NotFound`] for an unknown id.
    pub fn submit(&mut self, id: DataValueId, value: Value) -> Result<DataValue, ValueStoreError> {
        let row = self
            .values
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or(ValueStoreError::NotFound { id })?;
        row.value = value;
        row.submitted = true;
        row.modified_at = Utc::now();
        Ok(row.clone())
    }

    /// Exclude a row from lookups while keeping it for history.
    ///
    /// # Errors
    ///
    /// Returns [`ValueStoreError::NotFound`] for an unknown id.
    pub fn deactivate(&mut self, id: DataValueId) -> Result<(), ValueStoreError> {
        let row = self
            .values
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or(ValueStoreError::NotFound { id })?;
        row.is_active = false;
        row.modified_at = Utc::now();
        Ok(())
    }

    /// Clone each given row into `round_data` under a fresh id. The
    /// originals are left in place, so every round keeps its own history.
    ///
    /// # Errors
    ///
    /// Returns [`ValueStoreError::NotFound`] if any id is unknown; nothing
    /// is copied in that case.
    pub fn copy_to(
        &mut self,
        ids: &[DataValueId],
        round_data: RoundDataId,
    ) -> Result<Vec<DataValue>, ValueStoreError> {
        let sources = ids
            .iter()
            .map(|id| {
                self.by_id(*id)
                    .cloned()
                    .ok_or(ValueStoreError::NotFound { id: *id })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let now = Utc::now();
        let copies: Vec<DataValue> = sources
            .into_iter()
            .map(|source| DataValue {
                id: DataValueId::new(),
                owner: source.owner.with_round_data(round_data),
                submitted: false,
                created_at: now,
                modified_at: now,
                ..source
            })
            .collect();
        debug!(
            count = copies.len(),
            round_data = %round_data,
            "Copied data values to next round"
        );
        self.values.extend(copies.iter().cloned());
        Ok(copies)
    }

    /// Insert an existing row as-is (cloned configurations).
    pub fn restore(&mut self, value: DataValue) {
        self.values.push(value);
    }

    /// Remove every row matching `predicate`, returning how many went.
    pub fn remove_where<F>(&mut self, predicate: F) -> usize
    where
        F: Fn(&DataValue) -> bool,
    {
        let before = self.values.len();
        self.values.retain(|v| !predicate(v));
        before.saturating_sub(self.values.len())
    }

    fn push(&mut self, owner: ValueOwner, parameter: ParameterId, value: Value) -> DataValue {
        let now = Utc::now();
        let row = DataValue {
            id: DataValueId::new(),
            parameter,
            owner,
            value,
            is_active: true,
            submitted: false,
            created_at: now,
            modified_at: now,
        };
        self.values.push(row.clone());
        row
    }

    fn write(&mut self, id: DataValueId, value: Value) -> Result<DataValue, ValueStoreError> {
        let row = self
            .values
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or(ValueStoreError::NotFound { id })?;
        row.value = value;
        row.modified_at = Utc::now();
        Ok(row.clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use vcweb_types::{GroupId, ParameterScope, ParameterType, ParticipantGroupId};

    use super::*;

    fn group_owner(round_data: RoundDataId) -> ValueOwner {
        ValueOwner::Group {
            group: GroupId::new(),
            round_data,
        }
    }

    fn int_param() -> Parameter {
        Parameter::new("harvest", ParameterScope::Group, ParameterType::Int)
    }

    #[test]
    fn default_materialization_round_trip() {
        let mut store = ValueStore::new();
        let owner = group_owner(RoundDataId::new());
        let p = int_param();

        let first = store.get(owner, &p, Some(&Value::Int(7))).unwrap();
        assert_eq!(first.value, Value::Int(7));

        let second = store.get(owner, &p, None).unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.value, Value::Int(7));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn missing_value_reads_none_value() {
        let mut store = ValueStore::new();
        let p = Parameter::new("choice", ParameterScope::Group, ParameterType::Enum);
        let (value, created) = store
            .get_or_create(group_owner(RoundDataId::new()), &p, None)
            .unwrap();
        assert!(created);
        assert_eq!(value.value, Value::Null);
    }

    #[test]
    fn set_converts_through_parameter_type() {
        let mut store = ValueStore::new();
        let owner = group_owner(RoundDataId::new());
        let p = int_param();

        let written = store.set(owner, &p, &Value::from("12.9")).unwrap();
        assert_eq!(written.value, Value::Int(12));
        assert_eq!(store.find(&owner, p.id).map(|v| v.value.clone()), Some(Value::Int(12)));

        let err = store.set(owner, &p, &Value::from("twelve")).unwrap_err();
        assert!(matches!(err, ValueStoreError::Conversion(_)));
        assert_eq!(store.find(&owner, p.id).map(|v| v.value.clone()), Some(Value::Int(12)));
    }

    #[test]
    fn get_returns_most_recent_active_row() {
        let mut store = ValueStore::new();
        let owner = ValueOwner::Participant {
            participant_group: ParticipantGroupId::new(),
            round_data: RoundDataId::new(),
        };
        let p = Parameter::new("chat_message", ParameterScope::Participant, ParameterType::String);

        store.create(owner, &p, &Value::from("hello")).unwrap();
        let latest = store.create(owner, &p, &Value::from("again")).unwrap();
        assert_eq!(store.get_all(&owner, p.id).len(), 2);
        assert_eq!(store.find(&owner, p.id).map(|v| v.id), Some(latest.id));

        store.deactivate(latest.id).unwrap();
        assert_eq!(
            store.find(&owner, p.id).map(|v| v.value.clone()),
            Some(Value::from("hello"))
        );
    }

    #[test]
    fn copy_to_clones_with_fresh_identity() {
        let mut store = ValueStore::new();
        let first_round = RoundDataId::new();
        let next_round = RoundDataId::new();
        let owner = group_owner(first_round);
        let p = int_param();

        let original = store.set(owner, &p, &Value::Int(37)).unwrap();
        let copies = store.copy_to(&[original.id], next_round).unwrap();

        assert_eq!(copies.len(), 1);
        let copy = copies.first().unwrap();
        assert_ne!(copy.id, original.id);
        assert_eq!(copy.value, Value::Int(37));
        assert_eq!(copy.owner.round_data(), Some(next_round));
        assert_eq!(store.by_id(original.id).map(|v| v.owner), Some(owner));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn copy_to_unknown_id_copies_nothing() {
        let mut store = ValueStore::new();
        let owner = group_owner(RoundDataId::new());
        let kept = store.set(owner, &int_param(), &Value::Int(1)).unwrap();
        let missing = DataValueId::new();
        let err = store.copy_to(&[kept.id, missing], RoundDataId::new()).unwrap_err();
        assert_eq!(err, ValueStoreError::NotFound { id: missing });
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn increment_adds_to_numeric_values() {
        let mut store = ValueStore::new();
        let owner = group_owner(RoundDataId::new());
        let p = int_param();
        store.increment(owner, &p, &Value::Int(5)).unwrap();
        let total = store.increment(owner, &p, &Value::Int(3)).unwrap();
        assert_eq!(total.value, Value::Int(8));

        let text = Parameter::new("note", ParameterScope::Group, ParameterType::String);
        assert!(matches!(
            store.increment(owner, &text, &Value::Int(1)),
            Err(ValueStoreError::NotNumeric { .. })
        ));
    }

    #[test]
    fn remove_where_drops_round_bound_rows() {
        let mut store = ValueStore::new();
        let doomed = RoundDataId::new();
        store.set(group_owner(doomed), &int_param(), &Value::Int(1)).unwrap();
        store
            .set(group_owner(RoundDataId::new()), &int_param(), &Value::Int(2))
            .unwrap();
        assert_eq!(store.remove_where(|v| v.owner.round_data() == Some(doomed)), 1);
        assert_eq!(store.len(), 1);
    }
}
