use crate::replica::peers::ReplicaId;
use std::fmt;
use std::sync::Arc;

/// A raft leadership term. Terms only move forward.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Term(u64);

impl Term {
    pub fn new(term: u64) -> Self {
        Term(term)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn incr(&mut self) {
        self.0 += 1;
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// PersistentLocalState holds the two values a replica must never forget across a restart: its
/// current term and its vote in that term. A store method that returns has made the change
/// durable, and the replica only answers a peer after that.
///
/// The `store_*` methods are compare-and-set style and return whether anything changed.
///
/// A replica that may restart must be given an implementation backed by durable storage;
/// otherwise it could vote twice in one term.
pub trait PersistentLocalState {
    /// Moves to `new_term` if it is newer, forgetting the vote cast in the old term.
    fn store_term_if_increased(&mut self, new_term: Term) -> bool;

    /// Records `vote` unless the term has moved past `expected_current_term` or a vote was already
    /// cast in it.
    fn store_vote_for_term_if_unvoted(&mut self, expected_current_term: Term, vote: ReplicaId) -> bool;

    /// Starts a new term with a vote for ourselves. Returns that term.
    fn increment_term_and_vote_for_self(&mut self) -> Term;

    fn current_term(&self) -> Term;
    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>);
}

/// Keeps term and vote in RAM. Good enough for a process that never restarts (tests, demo).
pub struct VolatileLocalState {
    current_term: Term,
    voted_for_this_term: Option<Arc<ReplicaId>>,
    my_replica_id: Arc<ReplicaId>,
}

impl VolatileLocalState {
    pub fn new(my_replica_id: ReplicaId) -> Self {
        VolatileLocalState {
            current_term: Term::new(0),
            voted_for_this_term: None,
            my_replica_id: Arc::new(my_replica_id),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_term(my_replica_id: ReplicaId, current_term: Term, voted_for: Option<ReplicaId>) -> Self {
        VolatileLocalState {
            current_term,
            voted_for_this_term: voted_for.map(Arc::new),
            my_replica_id: Arc::new(my_replica_id),
        }
    }
}

impl PersistentLocalState for VolatileLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> bool {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for_this_term = None;
            return true;
        }
        false
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_term: Term, vote: ReplicaId) -> bool {
        if expected_term != self.current_term || self.voted_for_this_term.is_some() {
            return false;
        }

        self.voted_for_this_term.replace(Arc::new(vote));
        true
    }

    fn increment_term_and_vote_for_self(&mut self) -> Term {
        self.current_term.incr();
        self.voted_for_this_term = Some(self.my_replica_id.clone());
        self.current_term
    }

    fn current_term(&self) -> Term {
        self.current_term
    }

    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>) {
        (self.current_term, self.voted_for_this_term.clone())
    }
}
