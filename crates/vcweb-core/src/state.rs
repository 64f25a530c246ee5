//! Mutable per-experiment tables.
//!
//! Everything an experiment creates while it runs: registrations, groups,
//! memberships, clusters, round data, data values and the activity log.
//! The whole state is cloned before a transition and restored if the
//! transition fails, which is what makes transitions all-or-nothing.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;
use vcweb_types::{
    ActivityLogEntry, Group, GroupCluster, GroupId, Participant, ParticipantGroupId,
    ParticipantGroupRelationship, ParticipantId, Registration, RoundConfigurationId, RoundData,
    RoundDataId, ValueOwner,
};

use crate::value_store::ValueStore;

/// Every row an experiment owns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentState {
    /// Participant accounts registered with the experiment.
    pub participants: Vec<Participant>,
    /// Registrations in registration order.
    pub registrations: Vec<Registration>,
    /// Groups in creation order.
    pub groups: Vec<Group>,
    /// Group memberships in creation order.
    pub memberships: Vec<ParticipantGroupRelationship>,
    /// Group clusters in creation order.
    pub group_clusters: Vec<GroupCluster>,
    /// Round data in creation order.
    pub round_data: Vec<RoundData>,
    /// Group, participant and cluster data values.
    pub data_values: ValueStore,
    /// Experiment and group activity log.
    pub activity_log: Vec<ActivityLogEntry>,
}

impl ExperimentState {
    // -----------------------------------------------------------------------
    // Participants
    // -----------------------------------------------------------------------

    /// Registered participant ids in registration order.
    pub fn registered_participants(&self) -> Vec<ParticipantId> {
        self.registrations.iter().map(|r| r.participant).collect()
    }

    /// A participant account by id.
    pub fn participant(&self, id: ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    /// Number of registered participants.
    pub fn participant_count(&self) -> u32 {
        u32::try_from(self.registrations.len()).unwrap_or(u32::MAX)
    }

    // -----------------------------------------------------------------------
    // Groups
    // -----------------------------------------------------------------------

    /// A group by id.
    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    /// Groups of a session, ordered by number.
    pub fn groups_in_session(&self, session_id: &str) -> Vec<&Group> {
        let mut groups: Vec<&Group> = self
            .groups
            .iter()
            .filter(|g| g.session_id == session_id)
            .collect();
        groups.sort_by_key(|g| g.number);
        groups
    }

    /// Current member count of a group.
    pub fn group_size(&self, group: GroupId) -> u32 {
        u32::try_from(self.memberships.iter().filter(|m| m.group == group).count())
            .unwrap_or(u32::MAX)
    }

    /// Memberships of a group ordered by participant number.
    pub fn members_of(&self, group: GroupId) -> Vec<&ParticipantGroupRelationship> {
        let mut members: Vec<&ParticipantGroupRelationship> =
            self.memberships.iter().filter(|m| m.group == group).collect();
        members.sort_by_key(|m| m.participant_number);
        members
    }

    /// Memberships in every group of a session.
    pub fn memberships_in_session(&self, session_id: &str) -> Vec<&ParticipantGroupRelationship> {
        self.memberships
            .iter()
            .filter(|m| {
                self.group(m.group)
                    .is_some_and(|g| g.session_id == session_id)
            })
            .collect()
    }

    /// A membership by id.
    pub fn membership(&self, id: ParticipantGroupId) -> Option<&ParticipantGroupRelationship> {
        self.memberships.iter().find(|m| m.id == id)
    }

    /// A participant's membership within a session.
    pub fn membership_for(
        &self,
        participant: ParticipantId,
        session_id: &str,
    ) -> Option<&ParticipantGroupRelationship> {
        self.memberships_in_session(session_id)
            .into_iter()
            .find(|m| m.participant == participant)
    }

    /// Delete the groups matching `predicate` together with their
    /// memberships, cluster references and data values. Clusters left
    /// without groups are deleted too. Returns the number of groups removed.
    pub fn remove_groups<F>(&mut self, predicate: F) -> usize
    where
        F: Fn(&Group) -> bool,
    {
        let doomed: Vec<GroupId> = self
            .groups
            .iter()
            .filter(|g| predicate(g))
            .map(|g| g.id)
            .collect();
        if doomed.is_empty() {
            return 0;
        }
        let doomed_memberships: Vec<ParticipantGroupId> = self
            .memberships
            .iter()
            .filter(|m| doomed.contains(&m.group))
            .map(|m| m.id)
            .collect();

        self.groups.retain(|g| !doomed.contains(&g.id));
        self.memberships.retain(|m| !doomed.contains(&m.group));
        for cluster in &mut self.group_clusters {
            cluster.groups.retain(|g| !doomed.contains(g));
        }
        let emptied: Vec<_> = self
            .group_clusters
            .iter()
            .filter(|c| c.groups.is_empty())
            .map(|c| c.id)
            .collect();
        self.group_clusters.retain(|c| !c.groups.is_empty());

        let values = self.data_values.remove_where(|v| match v.owner {
            ValueOwner::Group { group, .. } => doomed.contains(&group),
            ValueOwner::Participant {
                participant_group, ..
            } => doomed_memberships.contains(&participant_group),
            ValueOwner::GroupCluster { group_cluster, .. } => emptied.contains(&group_cluster),
            ValueOwner::ExperimentConfiguration(_) | ValueOwner::RoundConfiguration(_) => false,
        });
        debug!(
            groups = doomed.len(),
            memberships = doomed_memberships.len(),
            data_values = values,
            "Removed groups"
        );
        doomed.len()
    }

    // -----------------------------------------------------------------------
    // Round data
    // -----------------------------------------------------------------------

    /// Round data for `(round_configuration, repetition)`.
    pub fn round_data_for(
        &self,
        round_configuration: RoundConfigurationId,
        repeating_round_sequence_number: u32,
    ) -> Option<&RoundData> {
        self.round_data.iter().find(|rd| {
            rd.round_configuration == round_configuration
                && rd.repeating_round_sequence_number == repeating_round_sequence_number
        })
    }

    /// Round data by id.
    pub fn round_data_by_id(&self, id: RoundDataId) -> Option<&RoundData> {
        self.round_data.iter().find(|rd| rd.id == id)
    }

    /// Delete every round data row and the values recorded in them.
    pub fn remove_all_round_data(&mut self) -> usize {
        let removed = self.round_data.len();
        self.round_data.clear();
        self.data_values.remove_where(|v| v.owner.round_data().is_some());
        removed
    }

    // -----------------------------------------------------------------------
    // Activity log
    // -----------------------------------------------------------------------

    /// Append an activity log entry.
    pub fn log(
        &mut self,
        round_configuration: Option<RoundConfigurationId>,
        group: Option<GroupId>,
        message: String,
    ) {
        self.activity_log.push(ActivityLogEntry {
            round_configuration,
            group,
            message,
            created_at: Utc::now(),
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use vcweb_types::{
        GroupClusterId, Parameter, ParameterScope, ParameterType, RoundConfigurationId, Value,
    };

    use super::*;

    fn group(number: u32, session_id: &str) -> Group {
        Group {
            id: GroupId::new(),
            number,
            max_size: 5,
            session_id: session_id.to_owned(),
            created_at: Utc::now(),
        }
    }

    fn member(group: GroupId, participant_number: u32) -> ParticipantGroupRelationship {
        ParticipantGroupRelationship {
            id: ParticipantGroupId::new(),
            participant: ParticipantId::new(),
            group,
            participant_number,
            round_joined: RoundConfigurationId::new(),
            active: true,
            first_visit: true,
            survey_completed: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn remove_groups_cascades() {
        let mut state = ExperimentState::default();
        let kept = group(1, "a");
        let doomed = group(1, "b");
        let kept_member = member(kept.id, 1);
        let doomed_member = member(doomed.id, 1);
        let round_data = RoundDataId::new();
        let p = Parameter::new("ready", ParameterScope::Participant, ParameterType::Boolean);

        state
            .data_values
            .set(
                ValueOwner::Participant {
                    participant_group: doomed_member.id,
                    round_data,
                },
                &p,
                &Value::Bool(true),
            )
            .unwrap();
        state
            .data_values
            .set(
                ValueOwner::Participant {
                    participant_group: kept_member.id,
                    round_data,
                },
                &p,
                &Value::Bool(true),
            )
            .unwrap();
        state.group_clusters.push(GroupCluster {
            id: GroupClusterId::new(),
            session_id: "b".to_owned(),
            groups: vec![doomed.id],
            created_at: Utc::now(),
        });
        state.groups.extend([kept.clone(), doomed]);
        state.memberships.extend([kept_member, doomed_member]);

        assert_eq!(state.remove_groups(|g| g.session_id == "b"), 1);
        assert_eq!(state.groups, vec![kept]);
        assert_eq!(state.memberships.len(), 1);
        assert!(state.group_clusters.is_empty());
        assert_eq!(state.data_values.len(), 1);
    }

    #[test]
    fn session_queries_filter_by_session() {
        let mut state = ExperimentState::default();
        let second = group(2, "s1");
        let first = group(1, "s1");
        let other = group(1, "s2");
        let m = member(first.id, 1);
        let participant = m.participant;
        state.groups.extend([second, first.clone(), other]);
        state.memberships.push(m);

        let numbers: Vec<u32> = state.groups_in_session("s1").iter().map(|g| g.number).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(state.group_size(first.id), 1);
        assert!(state.membership_for(participant, "s1").is_some());
        assert!(state.membership_for(participant, "s2").is_none());
    }
}
