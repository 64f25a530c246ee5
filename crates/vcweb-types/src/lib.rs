//! Shared type definitions for the vcweb experiment framework.
//!
//! This crate is the single source of truth for the records shared across
//! the workspace. Types defined here flow downstream to `TypeScript` via
//! `ts-rs` for the experimenter dashboard.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers for all entity identifiers
//! - [`enums`] -- Experiment status, round types, parameter scopes and types
//! - [`structs`] -- Parameters, typed values, rounds, groups, round data
//! - [`signals`] -- Typed payloads raised by experiment transitions
//! - [`views`] -- Read-only snapshot projections

pub mod enums;
pub mod ids;
pub mod signals;
pub mod structs;
pub mod views;

// Re-export all public types at crate root for convenience.
pub use enums::{ExperimentStatus, ParameterScope, ParameterType, RoundType};
pub use ids::{
    DataValueId, ExperimentConfigurationId, ExperimentId, ExperimenterId, GroupClusterId, GroupId,
    ParameterId, ParticipantGroupId, ParticipantId, RegistrationId, RoundConfigurationId,
    RoundDataId,
};
pub use signals::{ParticipantAdded, RoundEnded, RoundStarted, Signal};
pub use structs::{
    ActivityLogEntry, DataValue, Group, GroupCluster, Parameter, Participant,
    ParticipantGroupRelationship, Registration, RoundConfiguration, RoundData, Value, ValueOwner,
};
pub use views::{ExperimentSnapshot, GroupSummary, RoundDataSummary};

#[cfg(test)]
mod tests {
    //! `TypeScript` binding generation.

    #[test]
    fn export_bindings() {
        // ts-rs writes the bindings for every #[ts(export)] type reached
        // here into `bindings/` relative to the crate root.
        use ts_rs::TS;

        // IDs
        let _ = crate::ids::ExperimentId::export_all();
        let _ = crate::ids::ExperimentConfigurationId::export_all();
        let _ = crate::ids::RoundConfigurationId::export_all();
        let _ = crate::ids::ParameterId::export_all();
        let _ = crate::ids::GroupId::export_all();
        let _ = crate::ids::GroupClusterId::export_all();
        let _ = crate::ids::ParticipantId::export_all();
        let _ = crate::ids::RegistrationId::export_all();
        let _ = crate::ids::ParticipantGroupId::export_all();
        let _ = crate::ids::RoundDataId::export_all();
        let _ = crate::ids::DataValueId::export_all();
        let _ = crate::ids::ExperimenterId::export_all();

        // Enums
        let _ = crate::enums::ExperimentStatus::export_all();
        let _ = crate::enums::RoundType::export_all();
        let _ = crate::enums::ParameterScope::export_all();
        let _ = crate::enums::ParameterType::export_all();

        // Structs
        let _ = crate::structs::Value::export_all();
        let _ = crate::structs::Parameter::export_all();
        let _ = crate::structs::ValueOwner::export_all();
        let _ = crate::structs::DataValue::export_all();
        let _ = crate::structs::RoundConfiguration::export_all();
        let _ = crate::structs::Participant::export_all();
        let _ = crate::structs::Registration::export_all();
        let _ = crate::structs::Group::export_all();
        let _ = crate::structs::ParticipantGroupRelationship::export_all();
        let _ = crate::structs::GroupCluster::export_all();
        let _ = crate::structs::RoundData::export_all();
        let _ = crate::structs::ActivityLogEntry::export_all();

        // Signals and views
        let _ = crate::signals::Signal::export_all();
        let _ = crate::views::ExperimentSnapshot::export_all();
    }
}
