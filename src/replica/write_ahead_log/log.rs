use crate::commitlog;
use crate::commitlog::Index;
use crate::replica::local_state::Term;
use crate::replica::write_ahead_log::WriteAheadLogEntry;
use std::io;

/// WriteAheadLog is the raft-specific log facade.
///
/// Note: A log entry has 3 states (not modeled directly in code):
/// 1. Persisted - written to disk, not yet replicated to majority
/// 2. Committed - written to disk, replicated to majority
/// 3. Applied - a committed entry that has also been applied to the state machine
///
/// A log entry's state has no global truth. Each replica will have their own local view of what
/// state the log entry is in.
pub(crate) struct WriteAheadLog<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    // Application's info/debug log.
    logger: slog::Logger,

    // This is the log that we're replicating.
    log: L,
    // Metadata about the highest log entry that we've locally written. It must be updated atomically.
    latest_entry_metadata: Option<(Term, Index)>,

    // Index of highest log entry known to be committed. None if nothing is committed.
    commit_index: Option<Index>,
    // Index of highest log entry applied to state machine. None if nothing is applied.
    last_applied_index: Option<Index>,
}

impl<L> WriteAheadLog<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    /// Wraps `log`, which may already hold entries from a previous run. Nothing is considered
    /// committed until the cluster says so again (or a snapshot is restored).
    pub(crate) fn new(logger: slog::Logger, log: L) -> Result<Self, io::Error> {
        let latest_entry_metadata = match log.next_index().checked_minus(1) {
            None => None,
            Some(last_index) => match log.read(last_index)? {
                Some(entry) => Some((entry.term, last_index)),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("log reports entries up to {:?} but it can't be read", last_index),
                    ))
                }
            },
        };

        if let Some((term, index)) = latest_entry_metadata {
            slog::info!(logger, "Initialized from existing log. Last entry: term {:?} index {:?}", term, index);
        }

        Ok(WriteAheadLog {
            logger,
            log,
            latest_entry_metadata,
            commit_index: None,
            last_applied_index: None,
        })
    }

    pub(crate) fn latest_entry(&self) -> Option<(Term, Index)> {
        self.latest_entry_metadata
    }

    pub(crate) fn latest_index(&self) -> Option<Index> {
        self.latest_entry_metadata.map(|(_, index)| index)
    }

    pub(crate) fn read(&self, index: Index) -> Result<Option<WriteAheadLogEntry>, io::Error> {
        self.log.read(index)
    }

    pub(crate) fn read_required(&self, index: Index) -> Result<WriteAheadLogEntry, io::Error> {
        match self.read(index)? {
            Some(entry) => Ok(entry),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no log entry at index {:?}", index),
            )),
        }
    }

    pub(crate) fn term_at(&self, index: Index) -> Result<Option<Term>, io::Error> {
        if let Some((latest_term, latest_index)) = self.latest_entry_metadata {
            if latest_index == index {
                return Ok(Some(latest_term));
            }
        }

        Ok(self.read(index)?.map(|entry| entry.term))
    }

    /// Remove anything starting at `index` and later.
    pub(crate) fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        if let Some(commit_index) = self.commit_index {
            assert!(
                index > commit_index,
                "Can't truncate committed entries. Truncate from {:?}, commit index {:?}",
                index,
                commit_index,
            );
        }

        let mut new_latest_entry_metadata = None;
        if let Some(new_latest_entry_index) = index.checked_minus(1) {
            new_latest_entry_metadata = self
                .read(new_latest_entry_index)?
                .map(|latest_entry| (latest_entry.term, new_latest_entry_index));
        }

        // Only update state after we've successfully read what new state will be.
        self.log.truncate(index)?;
        slog::info!(self.logger, "Truncated log from index {:?}", index);

        self.latest_entry_metadata = new_latest_entry_metadata;
        Ok(())
    }

    pub(crate) fn append(&mut self, entry: WriteAheadLogEntry) -> Result<Index, io::Error> {
        let appended_term = entry.term;
        let appended_index = self.log.append(entry)?;
        // Only update state after log action completes.
        self.latest_entry_metadata = Some((appended_term, appended_index));

        Ok(appended_index)
    }

    pub(crate) fn commit_index(&self) -> Option<Index> {
        self.commit_index
    }

    pub(crate) fn last_applied_index(&self) -> Option<Index> {
        self.last_applied_index
    }

    /// Leader's commit rule. Returns true if commit index moved.
    pub(crate) fn ratchet_fwd_commit_index_if_valid(
        &mut self,
        tentative_new_commit_index: Index,
        current_term: Term,
    ) -> Result<bool, io::Error> {
        if matches!(self.commit_index, Some(ci) if ci >= tentative_new_commit_index) {
            return Ok(false);
        }

        // > If there exists an N such that N > commitIndex, a majority
        // > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
        // > set commitIndex = N (§5.3, §5.4).
        let entry = self.read_required(tentative_new_commit_index)?;
        if entry.term != current_term {
            return Ok(false);
        }

        self.ratchet_fwd_commit_index(tentative_new_commit_index);
        Ok(true)
    }

    /// Follower's commit rule. The caller has already bounded `new_commit_index` by what it
    /// verified against the leader. Going backwards is a no-op. Returns true if commit index
    /// moved.
    pub(crate) fn ratchet_fwd_commit_index(&mut self, new_commit_index: Index) -> bool {
        if matches!(self.commit_index, Some(ci) if ci >= new_commit_index) {
            return false;
        }

        // Assert we only mark as committed if we have the entry locally.
        let latest_locally_written_index = self
            .latest_index()
            .expect("Can't ratchet commit index forward if we don't have any local logs");
        assert!(
            latest_locally_written_index >= new_commit_index,
            "Can't ratchet commit index forwards past our local log. Expected [latest log] {:?} >= {:?} [input]",
            latest_locally_written_index,
            new_commit_index,
        );

        self.commit_index.replace(new_commit_index);
        true
    }

    /// Next committed entry that has not been applied yet.
    pub(crate) fn next_entry_to_apply(&self) -> Result<Option<(Index, WriteAheadLogEntry)>, io::Error> {
        let commit_index = match self.commit_index {
            None => return Ok(None),
            Some(ci) => ci,
        };
        let next_index = match self.last_applied_index {
            None => Index::start_index(),
            Some(applied) => applied.plus(1),
        };
        if next_index > commit_index {
            return Ok(None);
        }

        let entry = self.read_required(next_index)?;
        Ok(Some((next_index, entry)))
    }

    /// Applied advances exactly one step at a time.
    pub(crate) fn mark_applied(&mut self, index: Index) {
        let expected = match self.last_applied_index {
            None => Index::start_index(),
            Some(applied) => applied.plus(1),
        };
        assert_eq!(index, expected, "Entries must be applied in order without gaps.");
        assert!(
            matches!(self.commit_index, Some(ci) if ci >= index),
            "Can't apply uncommitted entry {:?}",
            index,
        );

        self.last_applied_index.replace(index);
    }

    /// Starts commit and applied indexes at a snapshot taken from an earlier incarnation of this
    /// log. The entry at `index` must still be in the log with the snapshot's term.
    pub(crate) fn restore_snapshot_point(&mut self, index: Index, term: Term) -> Result<(), io::Error> {
        match self.term_at(index)? {
            Some(t) if t == term => {}
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "snapshot at index {:?} term {:?} doesn't match log (found term {:?})",
                        index, term, other
                    ),
                ))
            }
        }

        self.commit_index.replace(index);
        self.last_applied_index.replace(index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::{InMemoryLog, Log};

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn new_wal() -> WriteAheadLog<InMemoryLog<WriteAheadLogEntry>> {
        WriteAheadLog::new(logger(), InMemoryLog::create().unwrap()).unwrap()
    }

    fn cmd(term: u64) -> WriteAheadLogEntry {
        WriteAheadLogEntry::command(Term::new(term), vec![term as u8])
    }

    #[test]
    fn initializes_from_existing_log() {
        let mut log = InMemoryLog::create().unwrap();
        log.append(cmd(1)).unwrap();
        log.append(cmd(3)).unwrap();

        let wal = WriteAheadLog::new(logger(), log).unwrap();
        assert_eq!(wal.latest_entry(), Some((Term::new(3), Index::new(2))));
        assert_eq!(wal.commit_index(), None);
        assert_eq!(wal.last_applied_index(), None);
    }

    #[test]
    fn truncate_updates_latest_entry() {
        let mut wal = new_wal();
        wal.append(cmd(1)).unwrap();
        wal.append(cmd(1)).unwrap();
        wal.append(cmd(2)).unwrap();

        wal.truncate(Index::new(3)).unwrap();
        assert_eq!(wal.latest_entry(), Some((Term::new(1), Index::new(2))));

        wal.truncate(Index::new(1)).unwrap();
        assert_eq!(wal.latest_entry(), None);
    }

    #[test]
    fn commit_requires_current_term_entry() {
        let mut wal = new_wal();
        wal.append(cmd(1)).unwrap();
        wal.append(cmd(2)).unwrap();

        // Entry 1 is from an older term, it can't be committed by counting replicas.
        assert!(!wal.ratchet_fwd_commit_index_if_valid(Index::new(1), Term::new(2)).unwrap());
        assert_eq!(wal.commit_index(), None);

        assert!(wal.ratchet_fwd_commit_index_if_valid(Index::new(2), Term::new(2)).unwrap());
        assert_eq!(wal.commit_index(), Some(Index::new(2)));

        // Never backwards.
        assert!(!wal.ratchet_fwd_commit_index_if_valid(Index::new(1), Term::new(1)).unwrap());
        assert!(!wal.ratchet_fwd_commit_index(Index::new(1)));
        assert_eq!(wal.commit_index(), Some(Index::new(2)));
    }

    #[test]
    fn apply_walks_committed_entries_in_order() {
        let mut wal = new_wal();
        wal.append(cmd(1)).unwrap();
        wal.append(cmd(1)).unwrap();
        wal.append(cmd(1)).unwrap();
        assert!(wal.next_entry_to_apply().unwrap().is_none());

        wal.ratchet_fwd_commit_index(Index::new(2));
        let mut applied = Vec::new();
        while let Some((index, _)) = wal.next_entry_to_apply().unwrap() {
            wal.mark_applied(index);
            applied.push(index);
        }

        assert_eq!(applied, vec![Index::new(1), Index::new(2)]);
        assert_eq!(wal.last_applied_index(), Some(Index::new(2)));
    }

    #[test]
    #[should_panic]
    fn truncating_committed_entry_panics() {
        let mut wal = new_wal();
        wal.append(cmd(1)).unwrap();
        wal.append(cmd(1)).unwrap();
        wal.ratchet_fwd_commit_index(Index::new(2));

        let _ = wal.truncate(Index::new(2));
    }

    #[test]
    fn restore_snapshot_point_checks_term() {
        let mut wal = new_wal();
        wal.append(cmd(1)).unwrap();
        wal.append(cmd(2)).unwrap();

        assert!(wal.restore_snapshot_point(Index::new(2), Term::new(1)).is_err());
        assert!(wal.restore_snapshot_point(Index::new(5), Term::new(2)).is_err());

        wal.restore_snapshot_point(Index::new(2), Term::new(2)).unwrap();
        assert_eq!(wal.commit_index(), Some(Index::new(2)));
        assert_eq!(wal.last_applied_index(), Some(Index::new(2)));
    }
}
