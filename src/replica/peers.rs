use std::collections::BTreeSet;
use std::fmt;

/// ReplicaId is the stable identity of a cluster member. It is opaque to the replica; the
/// transport decides how to route to it.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn new(id: impl Into<String>) -> Self {
        ReplicaId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// ClusterTracker knows who is in the (static) cluster.
#[derive(Clone, Debug)]
pub(crate) struct ClusterTracker {
    my_replica_id: ReplicaId,
    peers: BTreeSet<ReplicaId>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ClusterTrackerError {
    #[error("my replica ID {0} not in cluster config")]
    MeNotInCluster(ReplicaId),
    #[error("replica ID {0} listed more than once")]
    DuplicateMember(ReplicaId),
}

impl ClusterTracker {
    pub(crate) fn create_valid_cluster(
        my_replica_id: ReplicaId,
        cluster_members: impl IntoIterator<Item = ReplicaId>,
    ) -> Result<Self, ClusterTrackerError> {
        let mut found_me = false;
        let mut peers = BTreeSet::new();
        for member in cluster_members {
            if member == my_replica_id {
                if found_me {
                    return Err(ClusterTrackerError::DuplicateMember(member));
                }
                found_me = true;
            } else if !peers.insert(member.clone()) {
                return Err(ClusterTrackerError::DuplicateMember(member));
            }
        }

        if !found_me {
            return Err(ClusterTrackerError::MeNotInCluster(my_replica_id));
        }

        Ok(ClusterTracker { my_replica_id, peers })
    }

    pub(crate) fn my_replica_id(&self) -> &ReplicaId {
        &self.my_replica_id
    }

    pub(crate) fn peer_ids(&self) -> impl Iterator<Item = &ReplicaId> {
        self.peers.iter()
    }

    pub(crate) fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    pub(crate) fn contains_member(&self, replica_id: &ReplicaId) -> bool {
        replica_id == &self.my_replica_id || self.peers.contains(replica_id)
    }

    pub(crate) fn contains_peer(&self, replica_id: &ReplicaId) -> bool {
        self.peers.contains(replica_id)
    }

    /// Number of replicas (including me) needed for a quorum.
    pub(crate) fn majority(&self) -> usize {
        Self::majority_of(self.cluster_size())
    }

    pub(crate) fn majority_of(cluster_size: usize) -> usize {
        (cluster_size / 2) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<ReplicaId> {
        names.iter().map(|n| ReplicaId::new(*n)).collect()
    }

    #[test]
    fn cluster_tracker_membership() {
        let tracker = ClusterTracker::create_valid_cluster(ReplicaId::new("b"), ids(&["a", "b", "c"])).unwrap();

        assert_eq!(tracker.cluster_size(), 3);
        assert_eq!(tracker.majority(), 2);
        assert!(tracker.contains_member(&ReplicaId::new("b")));
        assert!(!tracker.contains_peer(&ReplicaId::new("b")));
        assert!(tracker.contains_peer(&ReplicaId::new("c")));
        assert!(!tracker.contains_member(&ReplicaId::new("z")));
        assert_eq!(tracker.peer_ids().cloned().collect::<Vec<_>>(), ids(&["a", "c"]));
    }

    #[test]
    fn cluster_tracker_rejects_bad_config() {
        assert!(matches!(
            ClusterTracker::create_valid_cluster(ReplicaId::new("z"), ids(&["a", "b"])),
            Err(ClusterTrackerError::MeNotInCluster(_))
        ));
        assert!(matches!(
            ClusterTracker::create_valid_cluster(ReplicaId::new("a"), ids(&["a", "b", "b"])),
            Err(ClusterTrackerError::DuplicateMember(_))
        ));
    }

    #[test]
    fn majority_math() {
        assert_eq!(ClusterTracker::majority_of(1), 1);
        assert_eq!(ClusterTracker::majority_of(2), 2);
        assert_eq!(ClusterTracker::majority_of(3), 2);
        assert_eq!(ClusterTracker::majority_of(4), 3);
        assert_eq!(ClusterTracker::majority_of(5), 3);
    }
}
