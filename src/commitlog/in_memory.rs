use crate::commitlog::{Entry, Index, Log};
use std::convert::TryFrom;
use std::io;
use std::marker::PhantomData;

/// InMemoryLog keeps encoded entries in a `Vec`. Entries go through the byte encoding on the way in
/// and out, same as a disk-backed log would, so codec bugs show up here too.
pub struct InMemoryLog<E: Entry> {
    encoded_entries: Vec<Vec<u8>>,
    _entry: PhantomData<E>,
}

impl<E: Entry> InMemoryLog<E> {
    pub fn create() -> Result<Self, io::Error> {
        Ok(InMemoryLog {
            encoded_entries: Vec::new(),
            _entry: PhantomData,
        })
    }

    fn slot(index: Index) -> usize {
        index.as_u64() as usize - 1
    }
}

impl<E: Entry> Log<E> for InMemoryLog<E> {
    fn append(&mut self, entry: E) -> Result<Index, io::Error> {
        let index = self.next_index();
        self.encoded_entries.push(entry.into());
        Ok(index)
    }

    fn read(&self, index: Index) -> Result<Option<E>, io::Error> {
        self.encoded_entries
            .get(Self::slot(index))
            .map(|bytes| E::try_from(bytes.clone()))
            .transpose()
    }

    fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        self.encoded_entries.truncate(Self::slot(index));
        Ok(())
    }

    fn next_index(&self) -> Index {
        Index::new_usize(self.encoded_entries.len() + 1)
    }
}
