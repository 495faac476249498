use crate::replica::{RoleSnapshot, Term};
use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// ElectionStateSnapshot is what the replica looked like right after a role transition.
#[derive(Clone, Debug)]
pub(crate) struct ElectionStateSnapshot {
    pub(crate) role: RoleSnapshot,
    pub(crate) term: Term,
    pub(crate) observed_at: DateTime<Utc>,
}

impl ElectionStateSnapshot {
    pub(super) fn now(role: RoleSnapshot, term: Term) -> Self {
        ElectionStateSnapshot {
            role,
            term,
            observed_at: Utc::now(),
        }
    }
}

pub(super) fn new(initial_state: ElectionStateSnapshot) -> (ElectionStateChangeNotifier, ElectionStateChangeListener) {
    let (snd, rcv) = watch::channel(initial_state);

    (ElectionStateChangeNotifier { snd }, ElectionStateChangeListener { rcv })
}

pub(super) struct ElectionStateChangeNotifier {
    snd: watch::Sender<ElectionStateSnapshot>,
}

impl ElectionStateChangeNotifier {
    pub(super) fn notify_new_state(&self, new_state: ElectionStateSnapshot) {
        // Nobody listening is fine.
        let _ = self.snd.send(new_state);
    }
}

/// ElectionStateChangeListener sees the latest transition only. Intermediate transitions that
/// happen between two calls to `next()` are collapsed.
#[derive(Clone)]
pub(crate) struct ElectionStateChangeListener {
    rcv: watch::Receiver<ElectionStateSnapshot>,
}

impl ElectionStateChangeListener {
    /// Returns None once the replica is gone.
    pub(crate) async fn next(&mut self) -> Option<ElectionStateSnapshot> {
        match self.rcv.changed().await {
            Ok(_) => Some(self.rcv.borrow().clone()),
            Err(_) => None,
        }
    }

    pub(crate) fn latest(&self) -> ElectionStateSnapshot {
        self.rcv.borrow().clone()
    }
}
