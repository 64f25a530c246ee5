//! Type-safe identifier wrappers around [`Uuid`].
//!
//! Every entity in an experiment has a strongly-typed ID so that a group
//! identifier can never be passed where a round data identifier is
//! expected. All IDs use UUID v7 (time-ordered), which keeps archived rows
//! in creation order when indexed.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

/// Declares an identifier newtype. Each id is `Copy`, serializes as the bare
/// UUID string and parses back with [`str::parse`].
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
        #[ts(export, export_to = "bindings/")]
        pub struct $name(pub Uuid);

        impl $name {
            /// A fresh v7 identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// The wrapped [`Uuid`].
            pub const fn into_inner(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim()).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.into_inner()
            }
        }
    };
}

define_id! {
    /// Unique identifier for a running (or archived) experiment.
    ExperimentId
}

define_id! {
    /// Unique identifier for an authored experiment configuration.
    ExperimentConfigurationId
}

define_id! {
    /// Unique identifier for one round configuration row.
    RoundConfigurationId
}

define_id! {
    /// Unique identifier for a parameter definition.
    ParameterId
}

define_id! {
    /// Unique identifier for a group of participants.
    GroupId
}

define_id! {
    /// Unique identifier for a cluster of groups.
    GroupClusterId
}

define_id! {
    /// Unique identifier for a participant account.
    ParticipantId
}

define_id! {
    /// Unique identifier for a participant's registration in one experiment.
    RegistrationId
}

define_id! {
    /// Unique identifier for a participant's membership in one group.
    ParticipantGroupId
}

define_id! {
    /// Unique identifier for the data of one round repetition.
    RoundDataId
}

define_id! {
    /// Unique identifier for a stored parameterized value.
    DataValueId
}

define_id! {
    /// Unique identifier for an experimenter account.
    ExperimenterId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = GroupId::new();
        let b = GroupId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn ids_are_time_ordered() {
        let first = RoundDataId::new();
        let second = RoundDataId::new();
        assert!(first.into_inner().get_version_num() == 7);
        assert!(second.into_inner().get_version_num() == 7);
    }

    #[test]
    fn display_output_parses_back() {
        let id = ParticipantId::new();
        let parsed: ParticipantId = format!(" {id} ").parse().ok().unwrap_or_default();
        assert_eq!(parsed, id);
        assert!("not-an-id".parse::<ParticipantId>().is_err());
    }

    #[test]
    fn id_serializes_as_plain_uuid() {
        let id = ExperimentId::new();
        let json = serde_json::to_string(&id).ok();
        assert_eq!(json, Some(format!("\"{id}\"")));
    }
}
