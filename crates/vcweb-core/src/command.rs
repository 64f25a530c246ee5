//! Experimenter commands.
//!
//! The closed set of actions an experimenter may invoke on an experiment
//! by name. Only the owning experimenter may invoke them.

use std::str::FromStr;

use tracing::{info, warn};
use vcweb_types::ExperimenterId;

use crate::experiment::{Experiment, ExperimentError, Transition};

/// Errors from parsing a command name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// The name is not one of [`ExperimentCommand::ALL`].
    #[error("invalid experiment action {name:?}")]
    UnknownAction {
        /// The rejected name.
        name: String,
    },
}

/// An action an experimenter may invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExperimentCommand {
    /// [`Experiment::advance_to_next_round`].
    AdvanceToNextRound,
    /// [`Experiment::end_round`].
    EndRound,
    /// [`Experiment::start_round`].
    StartRound,
    /// [`Experiment::activate`].
    Activate,
    /// [`Experiment::deactivate`].
    Deactivate,
    /// [`Experiment::complete`].
    Complete,
    /// [`Experiment::restart_round`].
    RestartRound,
    /// [`Experiment::restart`].
    Restart,
    /// [`Experiment::clone_experiment`] for the caller.
    Clone,
    /// [`Experiment::clear`].
    Clear,
    /// [`Experiment::archive`].
    Archive,
}

impl ExperimentCommand {
    /// Every command.
    pub const ALL: [Self; 11] = [
        Self::AdvanceToNextRound,
        Self::EndRound,
        Self::StartRound,
        Self::Activate,
        Self::Deactivate,
        Self::Complete,
        Self::RestartRound,
        Self::Restart,
        Self::Clone,
        Self::Clear,
        Self::Archive,
    ];

    /// The action name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AdvanceToNextRound => "advance_to_next_round",
            Self::EndRound => "end_round",
            Self::StartRound => "start_round",
            Self::Activate => "activate",
            Self::Deactivate => "deactivate",
            Self::Complete => "complete",
            Self::RestartRound => "restart_round",
            Self::Restart => "restart",
            Self::Clone => "clone",
            Self::Clear => "clear",
            Self::Archive => "archive",
        }
    }
}

impl FromStr for ExperimentCommand {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| CommandError::UnknownAction { name: s.to_owned() })
    }
}

impl core::fmt::Display for ExperimentCommand {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an invoked command produced.
#[derive(Debug)]
pub enum InvokeOutcome {
    /// A state transition.
    Transition(Transition),
    /// A new experiment owned by the caller.
    Cloned(Box<Experiment>),
}

impl Experiment {
    /// Run `command` on behalf of `requester`.
    ///
    /// # Errors
    ///
    /// Returns [`ExperimentError::Unauthorized`] unless `requester` owns the
    /// experiment, otherwise whatever the command returns.
    pub fn invoke(
        &mut self,
        command: ExperimentCommand,
        requester: ExperimenterId,
    ) -> Result<InvokeOutcome, ExperimentError> {
        if requester != self.experimenter {
            warn!(
                experiment_id = %self.id,
                requester = %requester,
                action = command.as_str(),
                "Rejected action from non-owner"
            );
            return Err(ExperimentError::Unauthorized {
                experiment: self.id,
                requester,
            });
        }
        info!(experiment_id = %self.id, action = command.as_str(), "Invoking action");
        let transition = match command {
            ExperimentCommand::AdvanceToNextRound => self.advance_to_next_round()?,
            ExperimentCommand::EndRound => self.end_round()?,
            ExperimentCommand::StartRound => self.start_round()?,
            ExperimentCommand::Activate => self.activate()?,
            ExperimentCommand::Deactivate => self.deactivate()?,
            ExperimentCommand::Complete => self.complete()?,
            ExperimentCommand::RestartRound => self.restart_round()?,
            ExperimentCommand::Restart => self.restart()?,
            ExperimentCommand::Clear => self.clear()?,
            ExperimentCommand::Archive => self.archive()?,
            ExperimentCommand::Clone => {
                return Ok(InvokeOutcome::Cloned(Box::new(
                    self.clone_experiment(requester)?,
                )));
            }
        };
        Ok(InvokeOutcome::Transition(transition))
    }

    /// Parse `action` and [`invoke`](Self::invoke) it.
    ///
    /// # Errors
    ///
    /// Returns [`ExperimentError::Command`] for a name outside the
    /// allow-list, checked before ownership.
    pub fn invoke_action(
        &mut self,
        action: &str,
        requester: ExperimenterId,
    ) -> Result<InvokeOutcome, ExperimentError> {
        let command = action.parse::<ExperimentCommand>()?;
        self.invoke(command, requester)
    }
}
