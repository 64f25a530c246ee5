//! Parameter registry and value conversion.
//!
//! A [`ParameterRegistry`] owns every [`Parameter`] definition known to a
//! process. Components that need a parameter (the state machine needs
//! `participant_ready`, chat handlers need `chat_message`) receive the
//! registry as an `Arc` and look parameters up by name. Lookups go through
//! a name-keyed cache of `Arc<Parameter>` which is cleared whenever the
//! registry is mutated.
//!
//! Conversion is permissive: integer types retry through a float parse and
//! truncate, and a float parameter given text that is not a number keeps
//! the raw value. Only integer types reject input outright.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, warn};
use vcweb_types::{Parameter, ParameterId, ParameterScope, ParameterType, Value};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A raw value could not be coerced to a parameter's declared type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot convert {raw:?} to {value_type:?} for parameter {parameter}")]
pub struct ConversionError {
    /// Name of the parameter being converted for.
    pub parameter: String,
    /// The declared type of the parameter.
    pub value_type: ParameterType,
    /// The offending raw value, rendered as text.
    pub raw: String,
}

/// Errors from registry lookups and mutations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A parameter with the same name is already registered.
    #[error("parameter {name} is already registered")]
    DuplicateName {
        /// The conflicting name.
        name: String,
    },

    /// No parameter with the given name exists.
    #[error("no parameter named {name}")]
    NotFound {
        /// The requested name.
        name: String,
    },

    /// No parameter with the given id exists.
    #[error("no parameter with id {id}")]
    UnknownId {
        /// The requested id.
        id: ParameterId,
    },
}

// ---------------------------------------------------------------------------
// Conversion
// ---------------------------------------------------------------------------

/// The type-appropriate sentinel read when a value has never been set.
pub const fn none_value(value_type: ParameterType) -> Value {
    match value_type {
        ParameterType::Int => Value::Int(0),
        ParameterType::String => Value::Str(String::new()),
        ParameterType::ForeignKey => Value::ForeignKey(-1),
        ParameterType::Float => Value::Float(0.0),
        ParameterType::Boolean => Value::Bool(false),
        ParameterType::Enum => Value::Null,
    }
}

/// Coerce `raw` into the variant selected by `parameter.value_type`.
///
/// # Errors
///
/// Returns [`ConversionError`] when an int or foreign key parameter is
/// given a value that parses neither as an integer nor as a float.
pub fn convert(parameter: &Parameter, raw: &Value) -> Result<Value, ConversionError> {
    match parameter.value_type {
        ParameterType::Int => to_integer(raw)
            .map(Value::Int)
            .ok_or_else(|| conversion_error(parameter, raw)),
        ParameterType::ForeignKey => to_integer(raw)
            .map(Value::ForeignKey)
            .ok_or_else(|| conversion_error(parameter, raw)),
        ParameterType::Float => Ok(to_float(raw).map_or_else(
            || {
                warn!(
                    parameter = %parameter.name,
                    raw = %raw,
                    "Float conversion failed, keeping raw value"
                );
                raw.clone()
            },
            Value::Float,
        )),
        ParameterType::String => Ok(Value::Str(raw.to_string())),
        ParameterType::Enum => Ok(Value::Enum(raw.to_string())),
        ParameterType::Boolean => Ok(Value::Bool(is_truthy(raw))),
    }
}

/// Convert a raw string (form input, YAML default) for `parameter`.
///
/// # Errors
///
/// See [`convert`].
pub fn convert_str(parameter: &Parameter, raw: &str) -> Result<Value, ConversionError> {
    convert(parameter, &Value::Str(raw.to_owned()))
}

/// The parameter's converted default, or its none value when it has no
/// default string.
///
/// # Errors
///
/// See [`convert`].
pub fn default_value(parameter: &Parameter) -> Result<Value, ConversionError> {
    match parameter.default_value_string.as_deref() {
        Some(raw) if !raw.is_empty() => convert_str(parameter, raw),
        _ => Ok(none_value(parameter.value_type)),
    }
}

fn conversion_error(parameter: &Parameter, raw: &Value) -> ConversionError {
    ConversionError {
        parameter: parameter.name.clone(),
        value_type: parameter.value_type,
        raw: raw.to_string(),
    }
}

fn to_integer(raw: &Value) -> Option<i64> {
    match raw {
        Value::Int(v) | Value::ForeignKey(v) => Some(*v),
        Value::Bool(b) => Some(i64::from(*b)),
        Value::Float(f) => truncate(*f),
        Value::Str(s) | Value::Enum(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().and_then(truncate))
        }
        Value::Null => None,
    }
}

#[allow(clippy::cast_precision_loss)]
fn to_float(raw: &Value) -> Option<f64> {
    match raw {
        Value::Float(f) => Some(*f),
        Value::Int(v) | Value::ForeignKey(v) => Some(*v as f64),
        Value::Bool(b) => Some(f64::from(u8::from(*b))),
        Value::Str(s) | Value::Enum(s) => s.trim().parse::<f64>().ok(),
        Value::Null => None,
    }
}

/// Truncate toward zero, rejecting NaN, infinities and out-of-range values.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn truncate(f: f64) -> Option<i64> {
    let t = f.trunc();
    (t.is_finite() && t >= i64::MIN as f64 && t < i64::MAX as f64).then_some(t as i64)
}

fn is_truthy(raw: &Value) -> bool {
    match raw {
        Value::Bool(b) => *b,
        Value::Int(v) | Value::ForeignKey(v) => *v != 0,
        Value::Float(f) => *f != 0.0,
        Value::Str(s) | Value::Enum(s) => !s.is_empty() && !s.eq_ignore_ascii_case("false"),
        Value::Null => false,
    }
}

// ---------------------------------------------------------------------------
// Well-known parameters
// ---------------------------------------------------------------------------

/// Participant-scope parameters the framework itself reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WellKnownParameter {
    /// A chat message posted by a participant.
    ChatMessage,
    /// A comment on another participant's data value.
    Comment,
    /// A "like" of another participant's data value.
    Like,
    /// Set when a participant is ready to advance.
    ParticipantReady,
}

impl WellKnownParameter {
    /// Every well-known parameter.
    pub const ALL: [Self; 4] = [
        Self::ChatMessage,
        Self::Comment,
        Self::Like,
        Self::ParticipantReady,
    ];

    /// Registered parameter name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::ChatMessage => "chat_message",
            Self::Comment => "comment",
            Self::Like => "like",
            Self::ParticipantReady => "participant_ready",
        }
    }

    /// A fresh definition of this parameter.
    pub fn definition(self) -> Parameter {
        let value_type = match self {
            Self::ChatMessage | Self::Comment => ParameterType::String,
            Self::Like => ParameterType::ForeignKey,
            Self::ParticipantReady => ParameterType::Boolean,
        };
        let parameter = Parameter::new(self.name(), ParameterScope::Participant, value_type);
        match self {
            Self::Like => parameter.with_class_name("core.ParticipantRoundDataValue"),
            Self::ParticipantReady => parameter.with_default("false"),
            Self::ChatMessage | Self::Comment => parameter,
        }
    }
}

// ---------------------------------------------------------------------------
// Foreign key lookups
// ---------------------------------------------------------------------------

/// Resolves the integer id stored by a foreign key parameter into the
/// record it refers to.
pub trait ForeignKeyLookup: Send + Sync {
    /// Look up the record with the given id.
    fn resolve(&self, id: i64) -> Option<serde_json::Value>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// All parameter definitions known to the process.
#[derive(Default)]
pub struct ParameterRegistry {
    /// Definitions keyed by id. Source of truth.
    parameters: RwLock<BTreeMap<ParameterId, Arc<Parameter>>>,

    /// Name-keyed cache, cleared on every registry mutation.
    cache: RwLock<HashMap<String, Arc<Parameter>>>,

    /// Foreign key resolvers keyed by `class_name`.
    lookups: RwLock<HashMap<String, Arc<dyn ForeignKeyLookup>>>,
}

impl core::fmt::Debug for ParameterRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ParameterRegistry")
            .field("parameters", &self.len())
            .field("cached", &self.cached_len())
            .finish_non_exhaustive()
    }
}

impl ParameterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the [`WellKnownParameter`] definitions.
    pub fn with_well_known() -> Self {
        let registry = Self::new();
        for kind in WellKnownParameter::ALL {
            // Names are distinct, registration into an empty registry
            // cannot conflict.
            let _ = registry.register(kind.definition());
        }
        registry
    }

    /// Add a parameter definition.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateName`] if the name is taken.
    pub fn register(&self, parameter: Parameter) -> Result<Arc<Parameter>, RegistryError> {
        let mut parameters = self
            .parameters
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if parameters.values().any(|p| p.name == parameter.name) {
            return Err(RegistryError::DuplicateName {
                name: parameter.name,
            });
        }
        debug!(
            name = %parameter.name,
            scope = ?parameter.scope,
            value_type = ?parameter.value_type,
            "Registered parameter"
        );
        let parameter = Arc::new(parameter);
        parameters.insert(parameter.id, Arc::clone(&parameter));
        drop(parameters);
        self.invalidate();
        Ok(parameter)
    }

    /// Replace an existing definition (matched by id).
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownId`] if no definition has the id, or
    /// [`RegistryError::DuplicateName`] if a rename collides.
    pub fn update(&self, parameter: Parameter) -> Result<Arc<Parameter>, RegistryError> {
        let mut parameters = self
            .parameters
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !parameters.contains_key(&parameter.id) {
            return Err(RegistryError::UnknownId { id: parameter.id });
        }
        if parameters
            .values()
            .any(|p| p.id != parameter.id && p.name == parameter.name)
        {
            return Err(RegistryError::DuplicateName {
                name: parameter.name,
            });
        }
        let parameter = Arc::new(parameter);
        parameters.insert(parameter.id, Arc::clone(&parameter));
        drop(parameters);
        self.invalidate();
        Ok(parameter)
    }

    /// Remove a definition by name.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if no parameter has the name.
    pub fn remove(&self, name: &str) -> Result<Arc<Parameter>, RegistryError> {
        let mut parameters = self
            .parameters
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let id = parameters
            .values()
            .find(|p| p.name == name)
            .map(|p| p.id)
            .ok_or_else(|| RegistryError::NotFound {
                name: name.to_owned(),
            })?;
        let removed = parameters
            .remove(&id)
            .ok_or(RegistryError::UnknownId { id })?;
        drop(parameters);
        self.invalidate();
        Ok(removed)
    }

    /// Look up a parameter by name.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if no parameter has the name.
    pub fn get(&self, name: &str) -> Result<Arc<Parameter>, RegistryError> {
        if let Some(hit) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Ok(Arc::clone(hit));
        }
        let found = self
            .parameters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|p| p.name == name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                name: name.to_owned(),
            })?;
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), Arc::clone(&found));
        Ok(found)
    }

    /// Look up a parameter by id.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownId`] if no parameter has the id.
    pub fn get_by_id(&self, id: ParameterId) -> Result<Arc<Parameter>, RegistryError> {
        self.parameters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(RegistryError::UnknownId { id })
    }

    /// Look up a well-known parameter.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if it was never registered.
    pub fn well_known(&self, kind: WellKnownParameter) -> Result<Arc<Parameter>, RegistryError> {
        self.get(kind.name())
    }

    /// Every definition, ordered by id (creation order).
    pub fn all(&self) -> Vec<Arc<Parameter>> {
        self.parameters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Number of registered parameters.
    pub fn len(&self) -> usize {
        self.parameters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no parameters are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of names currently cached.
    pub fn cached_len(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Drop every cached lookup.
    pub fn invalidate(&self) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Register the resolver for foreign keys of `class_name`.
    pub fn register_lookup(&self, class_name: &str, lookup: Arc<dyn ForeignKeyLookup>) {
        self.lookups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(class_name.to_owned(), lookup);
    }

    /// Resolve a stored foreign key value through the lookup registered for
    /// the parameter's `class_name`. Returns `None` for non foreign key
    /// parameters, unset values (`-1`), and missing lookups or records.
    pub fn resolve_foreign_key(&self, parameter: &Parameter, value: &Value) -> Option<serde_json::Value> {
        if parameter.value_type != ParameterType::ForeignKey {
            return None;
        }
        let id = value.as_int().filter(|id| *id >= 0)?;
        let class_name = parameter.class_name.as_deref()?;
        let lookup = self
            .lookups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(class_name)
            .cloned()?;
        lookup.resolve(id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn param(value_type: ParameterType) -> Parameter {
        Parameter::new("test_parameter", ParameterScope::Group, value_type)
    }

    #[test]
    fn none_values_per_type() {
        assert_eq!(none_value(ParameterType::Int), Value::Int(0));
        assert_eq!(none_value(ParameterType::String), Value::Str(String::new()));
        assert_eq!(none_value(ParameterType::ForeignKey), Value::ForeignKey(-1));
        assert_eq!(none_value(ParameterType::Float), Value::Float(0.0));
        assert_eq!(none_value(ParameterType::Boolean), Value::Bool(false));
        assert_eq!(none_value(ParameterType::Enum), Value::Null);
    }

    #[test]
    fn int_parses_and_truncates_float_text() {
        let p = param(ParameterType::Int);
        assert_eq!(convert_str(&p, "12").unwrap(), Value::Int(12));
        assert_eq!(convert_str(&p, "3.7").unwrap(), Value::Int(3));
        assert_eq!(convert_str(&p, "-3.7").unwrap(), Value::Int(-3));
        assert_eq!(convert(&p, &Value::Float(9.99)).unwrap(), Value::Int(9));
        assert_eq!(convert(&p, &Value::Bool(true)).unwrap(), Value::Int(1));
    }

    #[test]
    fn int_rejects_text() {
        let p = param(ParameterType::Int);
        let err = convert_str(&p, "abc").unwrap_err();
        assert_eq!(err.value_type, ParameterType::Int);
        assert_eq!(err.raw, "abc");
        assert!(convert(&p, &Value::Null).is_err());
    }

    #[test]
    fn foreign_key_stores_integer_id() {
        let p = param(ParameterType::ForeignKey);
        assert_eq!(convert(&p, &Value::Int(42)).unwrap(), Value::ForeignKey(42));
        assert_eq!(convert_str(&p, "7.9").unwrap(), Value::ForeignKey(7));
        assert!(convert_str(&p, "seven").is_err());
    }

    #[test]
    fn float_passes_through_unparseable_text() {
        let p = param(ParameterType::Float);
        assert_eq!(convert_str(&p, "2.5").unwrap(), Value::Float(2.5));
        assert_eq!(convert(&p, &Value::Int(2)).unwrap(), Value::Float(2.0));
        assert_eq!(
            convert_str(&p, "not a number").unwrap(),
            Value::Str("not a number".to_owned())
        );
    }

    #[test]
    fn boolean_false_is_case_insensitive() {
        let p = param(ParameterType::Boolean);
        assert_eq!(convert_str(&p, "false").unwrap(), Value::Bool(false));
        assert_eq!(convert_str(&p, "FALSE").unwrap(), Value::Bool(false));
        assert_eq!(convert_str(&p, "").unwrap(), Value::Bool(false));
        assert_eq!(convert_str(&p, "true").unwrap(), Value::Bool(true));
        assert_eq!(convert_str(&p, "no").unwrap(), Value::Bool(true));
        assert_eq!(convert(&p, &Value::Int(0)).unwrap(), Value::Bool(false));
    }

    #[test]
    fn string_and_enum_stringify() {
        assert_eq!(
            convert(&param(ParameterType::String), &Value::Int(5)).unwrap(),
            Value::Str("5".to_owned())
        );
        assert_eq!(
            convert_str(&param(ParameterType::Enum), "high").unwrap(),
            Value::Enum("high".to_owned())
        );
    }

    #[test]
    fn default_value_uses_default_string() {
        let p = param(ParameterType::Int).with_default("10");
        assert_eq!(default_value(&p).unwrap(), Value::Int(10));
        assert_eq!(default_value(&param(ParameterType::Int)).unwrap(), Value::Int(0));
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let registry = ParameterRegistry::new();
        registry.register(param(ParameterType::Int)).unwrap();
        let err = registry.register(param(ParameterType::Float)).unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateName {
                name: "test_parameter".to_owned()
            }
        );
    }

    #[test]
    fn registry_cache_is_invalidated_on_change() {
        let registry = ParameterRegistry::with_well_known();
        assert_eq!(registry.len(), 4);

        let ready = registry.well_known(WellKnownParameter::ParticipantReady).unwrap();
        assert_eq!(ready.value_type, ParameterType::Boolean);
        assert_eq!(registry.cached_len(), 1);

        registry.register(param(ParameterType::Int)).unwrap();
        assert_eq!(registry.cached_len(), 0);

        let mut renamed = (*registry.get("test_parameter").unwrap()).clone();
        renamed.display_name = Some("Renamed".to_owned());
        registry.update(renamed).unwrap();
        assert_eq!(
            registry.get("test_parameter").unwrap().display_name.as_deref(),
            Some("Renamed")
        );

        registry.remove("test_parameter").unwrap();
        assert!(matches!(
            registry.get("test_parameter"),
            Err(RegistryError::NotFound { .. })
        ));
    }

    struct Fixed;

    impl ForeignKeyLookup for Fixed {
        fn resolve(&self, id: i64) -> Option<serde_json::Value> {
            (id == 3).then(|| serde_json::json!({ "id": 3, "name": "fixed" }))
        }
    }

    #[test]
    fn foreign_keys_resolve_through_registered_lookup() {
        let registry = ParameterRegistry::with_well_known();
        let like = registry.well_known(WellKnownParameter::Like).unwrap();
        assert!(registry.resolve_foreign_key(&like, &Value::ForeignKey(3)).is_none());

        registry.register_lookup("core.ParticipantRoundDataValue", Arc::new(Fixed));
        let resolved = registry.resolve_foreign_key(&like, &Value::ForeignKey(3));
        assert_eq!(resolved.and_then(|v| v.get("id").cloned()), Some(serde_json::json!(3)));
        assert!(registry.resolve_foreign_key(&like, &Value::ForeignKey(-1)).is_none());
    }
}
