use std::convert::TryFrom;
use std::num::NonZeroU64;
use std::{fmt, io};

/// Position of an entry in the log. The first entry is at 1; "no entry" is spelled
/// `Option<Index>::None` in memory and `0` on the wire.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Index(NonZeroU64);

impl Index {
    /// Panics on 0.
    pub fn new(index: u64) -> Self {
        match NonZeroU64::new(index) {
            Some(index) => Index(index),
            None => panic!("Log index 0 is reserved for 'no entry'"),
        }
    }

    pub fn new_usize(index: usize) -> Self {
        Self::new(index as u64)
    }

    pub fn from_u64_opt(index: u64) -> Option<Self> {
        NonZeroU64::new(index).map(Index)
    }

    pub fn start_index() -> Self {
        Self::new(1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0.get()
    }

    pub fn plus(&self, delta: u64) -> Index {
        Index::new(self.as_u64() + delta)
    }

    pub fn checked_minus(&self, delta: u64) -> Option<Index> {
        self.as_u64().checked_sub(delta).and_then(Self::from_u64_opt)
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn index_as_u64(index: Option<Index>) -> u64 {
    index.map(|i| i.as_u64()).unwrap_or(0)
}

/// Log is the storage contract the replica builds on: entries addressed by index, appended at
/// the tail, and cut back from the tail when a leader overwrites a divergent suffix.
pub trait Log<E: Entry> {
    /// Writes `entry` at `next_index()` and returns that index.
    fn append(&mut self, entry: E) -> Result<Index, io::Error>;

    fn read(&self, index: Index) -> Result<Option<E>, io::Error>;

    /// Removes the entry at `index` and everything after it.
    fn truncate(&mut self, index: Index) -> Result<(), io::Error>;

    fn next_index(&self) -> Index;
}

/// An entry knows how to turn itself into bytes and back. Decoding is fallible because the
/// bytes come from storage.
pub trait Entry: Clone + TryFrom<Vec<u8>, Error = io::Error> + Into<Vec<u8>> {}
