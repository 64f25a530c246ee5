//! Group allocation.
//!
//! Partitions an experiment's registered participants into groups of at
//! most `max_group_size` members. Participants are added one at a time; a
//! full group spills into a new group numbered one higher. Participant
//! numbers are local to each group.
//!
//! Clustering is an optional refinement on top of allocation. When the
//! group count is not a multiple of the cluster size no clusters are made,
//! and the groups are kept.

use chrono::Utc;
use rand::Rng;
use rand::seq::SliceRandom;
use tracing::{debug, error, info};
use vcweb_types::{
    ExperimentId, Group, GroupCluster, GroupClusterId, GroupId, ParticipantAdded,
    ParticipantGroupId, ParticipantGroupRelationship, ParticipantId, RoundConfiguration, Signal,
};

use crate::state::ExperimentState;

/// Errors that abort allocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    /// Existing groups must be preserved but no session id is available
    /// for the new ones.
    #[error(
        "cannot allocate new groups and preserve existing groups without a session id on round {sequence_number}"
    )]
    MissingSessionId {
        /// Sequence number of the current round.
        sequence_number: u32,
    },

    /// A participant was added to a group that does not exist.
    #[error("no group with id {id}")]
    UnknownGroup {
        /// The requested group.
        id: GroupId,
    },
}

/// How to allocate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationOptions {
    /// Shuffle participants before assigning them.
    pub randomize: bool,
    /// Keep existing groups instead of deleting them.
    pub preserve_existing_groups: bool,
    /// Session for the new groups. Falls back to the current round's
    /// session id when existing groups are preserved.
    pub session_id: String,
}

impl AllocationOptions {
    /// Options taken from a round configuration, shuffled.
    pub fn for_round(round: &RoundConfiguration) -> Self {
        Self {
            randomize: true,
            preserve_existing_groups: round.preserve_existing_groups,
            session_id: round.session_id.clone(),
        }
    }
}

/// Result of clustering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterOutcome {
    /// The current round does not request clusters.
    NotRequested,
    /// Clusters were created.
    Created {
        /// Number of clusters made.
        clusters: usize,
    },
    /// The group count is not a multiple of the cluster size; nothing was
    /// created.
    Indivisible {
        /// Number of groups in the session.
        groups: usize,
        /// Requested groups per cluster.
        cluster_size: u32,
    },
}

/// Result of an allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// Session the new groups belong to.
    pub session_id: String,
    /// New groups in number order.
    pub groups: Vec<GroupId>,
    /// Groups deleted before allocating.
    pub deleted_groups: usize,
    /// One `participant_added` signal per placement.
    pub signals: Vec<Signal>,
    /// What clustering did.
    pub clusters: ClusterOutcome,
}

/// Allocate every registered participant into fresh groups.
///
/// `round` is the experiment's current round: it supplies the fallback
/// session id, the round joined, and the clustering settings.
///
/// # Errors
///
/// Returns [`AllocationError::MissingSessionId`] when groups exist, must be
/// preserved, and neither `options` nor `round` provide a session id. The
/// state is untouched in that case.
pub fn allocate_groups<R>(
    state: &mut ExperimentState,
    experiment: ExperimentId,
    round: &RoundConfiguration,
    max_group_size: u32,
    options: &AllocationOptions,
    rng: &mut R,
) -> Result<Allocation, AllocationError>
where
    R: Rng + ?Sized,
{
    let mut participants = state.registered_participants();
    if options.randomize {
        participants.shuffle(rng);
    }
    debug!(
        experiment_id = %experiment,
        participants = participants.len(),
        randomize = options.randomize,
        session_id = %options.session_id,
        "Allocating groups"
    );

    let mut session_id = options.session_id.clone();
    let mut deleted_groups = 0;
    if !state.groups.is_empty() {
        if options.preserve_existing_groups {
            if session_id.is_empty() {
                session_id.clone_from(&round.session_id);
            }
            if session_id.is_empty() {
                error!(
                    experiment_id = %experiment,
                    round = round.sequence_number,
                    "Cannot preserve existing groups, no session id set"
                );
                return Err(AllocationError::MissingSessionId {
                    sequence_number: round.sequence_number,
                });
            }
            debug!(session_id = %session_id, "Preserving existing groups");
        } else {
            let groups: Vec<(GroupId, u32)> =
                state.groups.iter().map(|g| (g.id, g.number)).collect();
            for (id, number) in groups {
                let members: Vec<String> = state
                    .members_of(id)
                    .iter()
                    .map(|m| m.participant.to_string())
                    .collect();
                state.log(
                    Some(round.id),
                    Some(id),
                    format!("reallocating/deleting group {number} with members {members:?}"),
                );
            }
            deleted_groups = state.remove_groups(|_| true);
        }
    }

    // Numbers continue after any preserved group of the same session.
    let first_number = state
        .groups_in_session(&session_id)
        .last()
        .map_or(1, |g| g.number.saturating_add(1));
    let mut current = create_group(state, first_number, max_group_size, &session_id);
    let mut groups = vec![current];
    let mut signals = Vec::with_capacity(participants.len());
    for participant in participants {
        let (membership, signal) = add_participant(state, experiment, current, participant, round)?;
        if membership.group != current {
            current = membership.group;
            groups.push(current);
        }
        signals.push(signal);
    }

    let clusters = create_group_clusters(state, experiment, round, rng);
    info!(
        experiment_id = %experiment,
        groups = groups.len(),
        deleted_groups,
        session_id = %session_id,
        "Allocated groups"
    );
    Ok(Allocation {
        session_id,
        groups,
        deleted_groups,
        signals,
        clusters,
    })
}

/// Add a participant to `group`, spilling into a new group numbered one
/// higher (same capacity and session) when `group` is full.
///
/// # Errors
///
/// Returns [`AllocationError::UnknownGroup`] if `group` does not exist.
pub fn add_participant(
    state: &mut ExperimentState,
    experiment: ExperimentId,
    group: GroupId,
    participant: ParticipantId,
    round: &RoundConfiguration,
) -> Result<(ParticipantGroupRelationship, Signal), AllocationError> {
    let target = state
        .group(group)
        .cloned()
        .ok_or(AllocationError::UnknownGroup { id: group })?;
    let target = if target.is_full(state.group_size(target.id)) {
        let next = create_group(
            state,
            target.number.saturating_add(1),
            target.max_size,
            &target.session_id,
        );
        state
            .group(next)
            .cloned()
            .ok_or(AllocationError::UnknownGroup { id: next })?
    } else {
        target
    };

    let now = Utc::now();
    let membership = ParticipantGroupRelationship {
        id: ParticipantGroupId::new(),
        participant,
        group: target.id,
        participant_number: state.group_size(target.id).saturating_add(1),
        round_joined: round.id,
        active: true,
        first_visit: true,
        survey_completed: false,
        created_at: now,
    };
    state.memberships.push(membership.clone());
    let signal = Signal::ParticipantAdded(ParticipantAdded {
        experiment,
        participant_group: membership.id,
        participant,
        group: target.id,
        group_number: target.number,
        participant_number: membership.participant_number,
        time: now,
    });
    Ok((membership, signal))
}

/// Rebuild the clusters of the round's session when the round requests
/// clustering: existing clusters of the session are deleted, the session's
/// groups shuffled and consumed in runs of `group_cluster_size`.
pub fn create_group_clusters<R>(
    state: &mut ExperimentState,
    experiment: ExperimentId,
    round: &RoundConfiguration,
    rng: &mut R,
) -> ClusterOutcome
where
    R: Rng + ?Sized,
{
    if !round.create_group_clusters {
        return ClusterOutcome::NotRequested;
    }
    let session_id = round.session_id.as_str();
    state.group_clusters.retain(|c| c.session_id != session_id);

    let mut groups: Vec<GroupId> = state
        .groups_in_session(session_id)
        .iter()
        .map(|g| g.id)
        .collect();
    let cluster_size = round.group_cluster_size;
    let chunk = usize::try_from(cluster_size).unwrap_or(0);
    if chunk == 0 || groups.len().checked_rem(chunk) != Some(0) {
        error!(
            experiment_id = %experiment,
            round = round.sequence_number,
            groups = groups.len(),
            cluster_size,
            "Cannot create clusters, group count is not evenly divisible"
        );
        return ClusterOutcome::Indivisible {
            groups: groups.len(),
            cluster_size,
        };
    }

    groups.shuffle(rng);
    let now = Utc::now();
    let before = state.group_clusters.len();
    state
        .group_clusters
        .extend(groups.chunks(chunk).map(|members| GroupCluster {
            id: GroupClusterId::new(),
            session_id: session_id.to_owned(),
            groups: members.to_vec(),
            created_at: now,
        }));
    let clusters = state.group_clusters.len().saturating_sub(before);
    debug!(
        experiment_id = %experiment,
        clusters,
        cluster_size,
        "Created group clusters"
    );
    ClusterOutcome::Created { clusters }
}

fn create_group(
    state: &mut ExperimentState,
    number: u32,
    max_size: u32,
    session_id: &str,
) -> GroupId {
    let group = Group {
        id: GroupId::new(),
        number,
        max_size,
        session_id: session_id.to_owned(),
        created_at: Utc::now(),
    };
    let id = group.id;
    state.groups.push(group);
    id
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use vcweb_types::{Participant, Registration, RegistrationId, RoundType};

    use super::*;

    fn state_with(count: u32) -> ExperimentState {
        let mut state = ExperimentState::default();
        for n in 1..=count {
            let participant = Participant {
                id: ParticipantId::new(),
                email: format!("s{n}@example.com"),
                full_name: None,
                institution: None,
                created_at: Utc::now(),
            };
            state.registrations.push(Registration {
                id: RegistrationId::new(),
                participant: participant.id,
                participant_identifier: String::new(),
                sequential_participant_identifier: n,
                created_at: Utc::now(),
            });
            state.participants.push(participant);
        }
        state
    }

    fn ordered() -> AllocationOptions {
        AllocationOptions {
            randomize: false,
            preserve_existing_groups: false,
            session_id: String::new(),
        }
    }

    fn sizes(state: &ExperimentState, session_id: &str) -> Vec<u32> {
        state
            .groups_in_session(session_id)
            .iter()
            .map(|g| state.group_size(g.id))
            .collect()
    }

    #[test]
    fn twelve_participants_spill_into_three_groups() {
        let mut state = state_with(12);
        let round = RoundConfiguration::new(RoundType::Regular);
        let mut rng = StdRng::seed_from_u64(1);
        let allocation =
            allocate_groups(&mut state, ExperimentId::new(), &round, 5, &ordered(), &mut rng)
                .unwrap();

        assert_eq!(allocation.groups.len(), 3);
        assert_eq!(sizes(&state, ""), vec![5, 5, 2]);
        assert_eq!(allocation.signals.len(), 12);
        for membership in &state.memberships {
            let group = state.group(membership.group).unwrap();
            assert!(membership.participant_number >= 1);
            assert!(membership.participant_number <= group.max_size);
        }
    }

    #[test]
    fn non_random_allocation_keeps_registration_order() {
        let mut state = state_with(6);
        let round = RoundConfiguration::new(RoundType::Regular);
        let mut rng = StdRng::seed_from_u64(1);
        allocate_groups(&mut state, ExperimentId::new(), &round, 3, &ordered(), &mut rng).unwrap();

        let expected = state.registered_participants();
        let placed: Vec<ParticipantId> = state
            .groups_in_session("")
            .iter()
            .flat_map(|g| state.members_of(g.id))
            .map(|m| m.participant)
            .collect();
        assert_eq!(placed, expected);
    }

    #[test]
    fn open_groups_never_spill() {
        let mut state = state_with(9);
        let round = RoundConfiguration::new(RoundType::Regular);
        let mut rng = StdRng::seed_from_u64(1);
        allocate_groups(&mut state, ExperimentId::new(), &round, 0, &ordered(), &mut rng).unwrap();
        assert_eq!(sizes(&state, ""), vec![9]);
    }

    #[test]
    fn reallocation_deletes_existing_groups() {
        let mut state = state_with(4);
        let round = RoundConfiguration::new(RoundType::Regular);
        let mut rng = StdRng::seed_from_u64(1);
        let experiment = ExperimentId::new();
        allocate_groups(&mut state, experiment, &round, 2, &ordered(), &mut rng).unwrap();
        let again =
            allocate_groups(&mut state, experiment, &round, 2, &ordered(), &mut rng).unwrap();

        assert_eq!(again.deleted_groups, 2);
        assert_eq!(state.groups.len(), 2);
        assert_eq!(state.memberships.len(), 4);
        assert_eq!(state.activity_log.len(), 2);
    }

    #[test]
    fn preserving_without_session_id_fails_cleanly() {
        let mut state = state_with(4);
        let round = RoundConfiguration::new(RoundType::Regular);
        let mut rng = StdRng::seed_from_u64(1);
        let experiment = ExperimentId::new();
        allocate_groups(&mut state, experiment, &round, 2, &ordered(), &mut rng).unwrap();
        let before = state.clone();

        let preserve = AllocationOptions {
            preserve_existing_groups: true,
            ..ordered()
        };
        let err = allocate_groups(&mut state, experiment, &round, 2, &preserve, &mut rng)
            .unwrap_err();
        assert!(matches!(err, AllocationError::MissingSessionId { .. }));
        assert_eq!(state, before);
    }

    #[test]
    fn preserving_with_session_id_keeps_old_groups() {
        let mut state = state_with(4);
        let mut round = RoundConfiguration::new(RoundType::Regular);
        let mut rng = StdRng::seed_from_u64(1);
        let experiment = ExperimentId::new();
        allocate_groups(&mut state, experiment, &round, 2, &ordered(), &mut rng).unwrap();

        round.session_id = "afternoon".to_owned();
        let preserve = AllocationOptions {
            preserve_existing_groups: true,
            ..ordered()
        };
        let allocation =
            allocate_groups(&mut state, experiment, &round, 2, &preserve, &mut rng).unwrap();
        assert_eq!(allocation.session_id, "afternoon");
        assert_eq!(state.groups.len(), 4);
        assert_eq!(sizes(&state, ""), vec![2, 2]);
        assert_eq!(sizes(&state, "afternoon"), vec![2, 2]);
    }

    #[test]
    fn clusters_chunk_divisible_groups() {
        let mut state = state_with(8);
        let mut round = RoundConfiguration::new(RoundType::Regular);
        round.create_group_clusters = true;
        round.group_cluster_size = 2;
        let mut rng = StdRng::seed_from_u64(7);
        let allocation =
            allocate_groups(&mut state, ExperimentId::new(), &round, 2, &ordered(), &mut rng)
                .unwrap();

        assert_eq!(allocation.clusters, ClusterOutcome::Created { clusters: 2 });
        let mut clustered: Vec<GroupId> = state
            .group_clusters
            .iter()
            .flat_map(|c| c.groups.iter().copied())
            .collect();
        clustered.sort();
        let mut all: Vec<GroupId> = state.groups.iter().map(|g| g.id).collect();
        all.sort();
        assert_eq!(clustered, all);
    }

    #[test]
    fn indivisible_clusters_are_skipped_but_groups_kept() {
        let mut state = state_with(6);
        let mut round = RoundConfiguration::new(RoundType::Regular);
        round.create_group_clusters = true;
        round.group_cluster_size = 2;
        let mut rng = StdRng::seed_from_u64(7);
        let allocation =
            allocate_groups(&mut state, ExperimentId::new(), &round, 2, &ordered(), &mut rng)
                .unwrap();

        assert_eq!(
            allocation.clusters,
            ClusterOutcome::Indivisible {
                groups: 3,
                cluster_size: 2
            }
        );
        assert!(state.group_clusters.is_empty());
        assert_eq!(state.groups.len(), 3);
    }
}
