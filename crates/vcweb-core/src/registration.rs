//! Participant registration.
//!
//! Registration is a one-shot operation: an experiment that already has
//! participants refuses a second batch.

use chrono::Utc;
use rand::Rng;
use rand::distr::Alphanumeric;
use tracing::{debug, info, warn};
use vcweb_types::{Participant, ParticipantId, Registration, RegistrationId};

use crate::experiment::{Experiment, ExperimentError};

/// Length of generated passwords.
pub const GENERATED_PASSWORD_LENGTH: usize = 12;

/// Password used for demo participants when none is given.
pub const DEFAULT_TEST_PASSWORD: &str = "test";

/// Errors from registering participants.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    /// The experiment already has participants.
    #[error("experiment already has {count} participants")]
    AlreadyRegistered {
        /// Participants already registered.
        count: u32,
    },

    /// An address without a local part or domain.
    #[error("invalid email address {email:?}")]
    InvalidEmail {
        /// The rejected address.
        email: String,
    },
}

/// Who to register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantIdentity {
    /// Email address, normalized on registration.
    pub email: String,
    /// Optional full name.
    pub full_name: Option<String>,
    /// Optional institution.
    pub institution: Option<String>,
}

impl ParticipantIdentity {
    /// An identity with only an email address.
    pub fn new(email: &str) -> Self {
        Self {
            email: email.to_owned(),
            full_name: None,
            institution: None,
        }
    }

    /// Parse `Full Name <email>` or a bare address. Blank lines give `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match (line.find('<'), line.rfind('>')) {
            (Some(open), Some(close)) if open < close => {
                let email = line.get(open.saturating_add(1)..close)?.trim();
                let name = line.get(..open)?.trim().trim_matches('"').trim();
                Some(Self {
                    email: email.to_owned(),
                    full_name: (!name.is_empty()).then(|| name.to_owned()),
                    institution: None,
                })
            }
            _ => Some(Self::new(line)),
        }
    }
}

/// Login details handed back for each registered participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// The participant account.
    pub participant: ParticipantId,
    /// Normalized email address (the username).
    pub email: String,
    /// Password set for the account.
    pub password: String,
    /// Opaque participant identifier.
    pub participant_identifier: String,
    /// 1-based registration order.
    pub sequential_participant_identifier: u32,
}

fn valid_email(email: &str) -> bool {
    !email.contains(char::is_whitespace)
        && email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'))
}

fn generate_password() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

impl Experiment {
    /// Register a batch of participants. Emails are trimmed and lowercased;
    /// repeated addresses are registered once. Every participant gets
    /// `password`, or a generated one when `None`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::AlreadyRegistered`] when the experiment
    /// has participants, or [`RegistrationError::InvalidEmail`]. Nothing is
    /// registered on error.
    pub fn register_participants(
        &mut self,
        identities: &[ParticipantIdentity],
        password: Option<&str>,
    ) -> Result<Vec<Credential>, ExperimentError> {
        let count = self.participant_count();
        if count > 0 {
            warn!(
                experiment_id = %self.id,
                count,
                "Experiment already has participants, aborting registration"
            );
            return Err(RegistrationError::AlreadyRegistered { count }.into());
        }

        let mut seen: Vec<String> = Vec::with_capacity(identities.len());
        let mut accepted: Vec<(String, &ParticipantIdentity)> = Vec::with_capacity(identities.len());
        for identity in identities {
            let email = identity.email.trim().to_lowercase();
            if !valid_email(&email) {
                return Err(RegistrationError::InvalidEmail { email }.into());
            }
            if seen.contains(&email) {
                debug!(email = %email, "Skipping duplicate email");
                continue;
            }
            seen.push(email.clone());
            accepted.push((email, identity));
        }

        let now = Utc::now();
        let mut credentials = Vec::with_capacity(accepted.len());
        for (sequence, (email, identity)) in (1_u32..).zip(accepted) {
            let participant = Participant {
                id: ParticipantId::new(),
                email: email.clone(),
                full_name: identity
                    .full_name
                    .as_deref()
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(str::to_owned),
                institution: identity.institution.clone(),
                created_at: now,
            };
            let registration = Registration {
                id: RegistrationId::new(),
                participant: participant.id,
                participant_identifier: uuid::Uuid::new_v4().simple().to_string(),
                sequential_participant_identifier: sequence,
                created_at: now,
            };
            credentials.push(Credential {
                participant: participant.id,
                email,
                password: password.map_or_else(generate_password, str::to_owned),
                participant_identifier: registration.participant_identifier.clone(),
                sequential_participant_identifier: sequence,
            });
            self.state.participants.push(participant);
            self.state.registrations.push(registration);
        }
        info!(
            experiment_id = %self.id,
            registered = credentials.len(),
            "Registered participants"
        );
        Ok(credentials)
    }

    /// Register `count` demo participants `s1{username_suffix}@{email_suffix}`,
    /// `s2...`, named `Student N`.
    ///
    /// # Errors
    ///
    /// See [`Self::register_participants`].
    pub fn setup_test_participants(
        &mut self,
        count: u32,
        institution: Option<&str>,
        email_suffix: &str,
        username_suffix: &str,
        password: Option<&str>,
    ) -> Result<Vec<Credential>, ExperimentError> {
        let identities: Vec<ParticipantIdentity> = (1..=count)
            .map(|i| ParticipantIdentity {
                email: format!("s{i}{username_suffix}@{email_suffix}"),
                full_name: Some(format!("Student {i}")),
                institution: institution.map(str::to_owned),
            })
            .collect();
        self.register_participants(&identities, Some(password.unwrap_or(DEFAULT_TEST_PASSWORD)))
    }
}
