use crate::commitlog;
use crate::replica::local_state::Term;
use std::convert::TryFrom;
use std::io;

/// Byte representation:
///
/// ```text
/// |                                         1                                   |
/// | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | ... |
/// +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+-...-+
/// |Vrs|Knd|       Term (8 bytes, LE)      |     Data (variable size)        ... |
/// +---+---+-------------------------------+---------------------------------...-+
/// ```
///
/// * `Vrs` - version of the serialized payload
/// * `Knd` - entry kind; a client command, or the no-op a new leader appends
/// * `Term` - raft leadership term when this entry was created
/// * `Data` - app specific data payload (an encoded command); empty for no-ops
///
/// Not needed:
///
/// * Checksum is not needed, it's guaranteed by underlying commitlog.
/// * Size/length of `Data` is not needed; the underlying commitlog will give us the correctly allocated array.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteAheadLogEntry {
    pub(crate) term: Term,
    pub(crate) kind: EntryKind,
    pub(crate) data: Vec<u8>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum EntryKind {
    Command,
    NoOp,
}

const RAFT_LOG_ENTRY_FORMAT_VERSION: u8 = 2;
const HEADER_LEN: usize = 1 + 1 + 8;

impl WriteAheadLogEntry {
    pub fn command(term: Term, data: Vec<u8>) -> Self {
        WriteAheadLogEntry {
            term,
            kind: EntryKind::Command,
            data,
        }
    }

    pub fn no_op(term: Term) -> Self {
        WriteAheadLogEntry {
            term,
            kind: EntryKind::NoOp,
            data: Vec::new(),
        }
    }
}

impl EntryKind {
    fn as_byte(self) -> u8 {
        match self {
            EntryKind::Command => 0,
            EntryKind::NoOp => 1,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(EntryKind::Command),
            1 => Some(EntryKind::NoOp),
            _ => None,
        }
    }
}

impl commitlog::Entry for WriteAheadLogEntry {}

impl TryFrom<Vec<u8>> for WriteAheadLogEntry {
    type Error = io::Error;

    fn try_from(mut bytes: Vec<u8>) -> Result<Self, Self::Error> {
        if bytes.len() < HEADER_LEN {
            return Err(invalid_data(format!("log entry too short: {} bytes", bytes.len())));
        }
        if bytes[0] != RAFT_LOG_ENTRY_FORMAT_VERSION {
            return Err(invalid_data(format!("unknown log entry format version {}", bytes[0])));
        }
        let kind = EntryKind::from_byte(bytes[1])
            .ok_or_else(|| invalid_data(format!("unknown log entry kind {}", bytes[1])))?;

        let mut term_bytes = [0u8; 8];
        term_bytes.copy_from_slice(&bytes[2..HEADER_LEN]);
        let term = Term::new(u64::from_le_bytes(term_bytes));

        let data = bytes.split_off(HEADER_LEN);

        Ok(WriteAheadLogEntry { term, kind, data })
    }
}

impl From<WriteAheadLogEntry> for Vec<u8> {
    fn from(entry: WriteAheadLogEntry) -> Self {
        let mut bytes: Vec<u8> = Vec::with_capacity(HEADER_LEN + entry.data.len());

        bytes.push(RAFT_LOG_ENTRY_FORMAT_VERSION);
        bytes.push(entry.kind.as_byte());
        bytes.extend_from_slice(&entry.term.as_u64().to_le_bytes());
        bytes.extend_from_slice(&entry.data);

        bytes
    }
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_layout() {
        let entry = WriteAheadLogEntry::command(Term::new(0x0102), vec![0xAA, 0xBB]);
        let bytes: Vec<u8> = entry.clone().into();

        assert_eq!(
            bytes,
            vec![RAFT_LOG_ENTRY_FORMAT_VERSION, 0, 0x02, 0x01, 0, 0, 0, 0, 0, 0, 0xAA, 0xBB]
        );
        assert_eq!(WriteAheadLogEntry::try_from(bytes).unwrap(), entry);

        let no_op: Vec<u8> = WriteAheadLogEntry::no_op(Term::new(7)).into();
        assert_eq!(no_op.len(), HEADER_LEN);
        assert_eq!(no_op[1], 1);
        assert_eq!(
            WriteAheadLogEntry::try_from(no_op).unwrap(),
            WriteAheadLogEntry::no_op(Term::new(7))
        );
    }

    #[test]
    fn rejects_corrupt_bytes() {
        let err = WriteAheadLogEntry::try_from(vec![RAFT_LOG_ENTRY_FORMAT_VERSION, 0, 1]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mut bad_version: Vec<u8> = WriteAheadLogEntry::no_op(Term::new(1)).into();
        bad_version[0] = 99;
        assert!(WriteAheadLogEntry::try_from(bad_version).is_err());

        let mut bad_kind: Vec<u8> = WriteAheadLogEntry::no_op(Term::new(1)).into();
        bad_kind[1] = 7;
        assert!(WriteAheadLogEntry::try_from(bad_kind).is_err());
    }
}
