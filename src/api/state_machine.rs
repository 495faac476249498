use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt;

/// StateMachine is the application specific view of applying the replicated log in sequential
/// consistent order.
pub trait StateMachine: Send + 'static {
    /// apply_command is called only when it's guaranteed that the command has been committed
    /// (i.e. replicated to a majority). Because of this guarantee, you will never need to reverse
    /// a command once you've been asked to apply it, so your impl need not be reversible.
    ///
    /// Every replica applies the same commands in the same order, so this must be deterministic.
    /// The returned bytes (or error) are handed back to the client that submitted the command, if
    /// that client is still waiting on this replica.
    fn apply_command(&mut self, name: &str, args: &[u8]) -> Result<Bytes, ApplicationError>;

    /// apply_query reads applied state. It must not mutate anything.
    fn apply_query(&self, name: &str, args: &[u8]) -> Result<Bytes, ApplicationError>;

    fn take_snapshot(&self) -> Bytes;

    /// Replaces all state with the snapshot's.
    fn install_snapshot(&mut self, snapshot: Bytes) -> Result<(), ApplicationError>;
}

/// An error raised by the application's state machine. It is surfaced verbatim to the client and
/// never affects consensus.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ApplicationError {
    pub message: String,
}

impl ApplicationError {
    pub fn new(message: impl Into<String>) -> Self {
        ApplicationError {
            message: message.into(),
        }
    }
}

/// A named state transition with opaque arguments.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Command {
    pub name: String,
    pub args: Bytes,
}

/// A named read of applied state with opaque arguments.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Query {
    pub name: String,
    pub args: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandDecodeError {
    #[error("Command payload is truncated")]
    Truncated,
    #[error("Command name is not UTF-8")]
    NameNotUtf8,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandEncodeError {
    #[error("Command name is {0} bytes, longer than 65535")]
    NameTooLong(usize),
}

impl Command {
    pub fn new(name: impl Into<String>, args: impl Into<Bytes>) -> Self {
        Command {
            name: name.into(),
            args: args.into(),
        }
    }

    /// `| name_len (u16 BE) | name | args |`
    pub fn encode(&self) -> Result<Bytes, CommandEncodeError> {
        let name_len = u16::try_from(self.name.len()).map_err(|_| CommandEncodeError::NameTooLong(self.name.len()))?;

        let mut buf = BytesMut::with_capacity(2 + self.name.len() + self.args.len());
        buf.put_u16(name_len);
        buf.put_slice(self.name.as_bytes());
        buf.put_slice(&self.args);

        Ok(buf.freeze())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CommandDecodeError> {
        if bytes.len() < 2 {
            return Err(CommandDecodeError::Truncated);
        }
        let name_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        let rest = &bytes[2..];
        if rest.len() < name_len {
            return Err(CommandDecodeError::Truncated);
        }

        let name = std::str::from_utf8(&rest[..name_len]).map_err(|_| CommandDecodeError::NameNotUtf8)?;

        Ok(Command {
            name: name.to_string(),
            args: Bytes::copy_from_slice(&rest[name_len..]),
        })
    }
}

impl Query {
    pub fn new(name: impl Into<String>, args: impl Into<Bytes>) -> Self {
        Query {
            name: name.into(),
            args: args.into(),
        }
    }
}

/// Snapshotable is the part of application state that `RegisteredStateMachine` can't derive from
/// the registered handlers.
pub trait Snapshotable {
    fn snapshot(&self) -> Bytes;
    fn restore(&mut self, snapshot: Bytes) -> Result<(), ApplicationError>;
}

type CommandHandler<S> = Box<dyn Fn(&mut S, &[u8]) -> Result<Bytes, ApplicationError> + Send>;
type QueryHandler<S> = Box<dyn Fn(&S, &[u8]) -> Result<Bytes, ApplicationError> + Send>;

/// CommandRegistry maps command and query names to handlers. Names are resolved once, when the
/// handler is registered; dispatch is a map lookup.
pub struct CommandRegistry<S> {
    commands: HashMap<String, CommandHandler<S>>,
    queries: HashMap<String, QueryHandler<S>>,
}

impl<S> CommandRegistry<S> {
    pub fn new() -> Self {
        CommandRegistry {
            commands: HashMap::new(),
            queries: HashMap::new(),
        }
    }

    pub fn with_command<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut S, &[u8]) -> Result<Bytes, ApplicationError> + Send + 'static,
    {
        self.commands.insert(name.into(), Box::new(handler));
        self
    }

    pub fn with_query<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&S, &[u8]) -> Result<Bytes, ApplicationError> + Send + 'static,
    {
        self.queries.insert(name.into(), Box::new(handler));
        self
    }
}

impl<S> Default for CommandRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> fmt::Debug for CommandRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.commands.keys().collect::<Vec<_>>())
            .field("queries", &self.queries.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// RegisteredStateMachine is a `StateMachine` built from plain application state plus a
/// `CommandRegistry`.
pub struct RegisteredStateMachine<S> {
    state: S,
    registry: CommandRegistry<S>,
}

impl<S> RegisteredStateMachine<S> {
    pub fn new(state: S, registry: CommandRegistry<S>) -> Self {
        RegisteredStateMachine { state, registry }
    }

    pub fn state(&self) -> &S {
        &self.state
    }
}

impl<S> StateMachine for RegisteredStateMachine<S>
where
    S: Snapshotable + Send + 'static,
{
    fn apply_command(&mut self, name: &str, args: &[u8]) -> Result<Bytes, ApplicationError> {
        match self.registry.commands.get(name) {
            Some(handler) => handler(&mut self.state, args),
            None => Err(ApplicationError::new(format!("Unknown command '{}'", name))),
        }
    }

    fn apply_query(&self, name: &str, args: &[u8]) -> Result<Bytes, ApplicationError> {
        match self.registry.queries.get(name) {
            Some(handler) => handler(&self.state, args),
            None => Err(ApplicationError::new(format!("Unknown query '{}'", name))),
        }
    }

    fn take_snapshot(&self) -> Bytes {
        self.state.snapshot()
    }

    fn install_snapshot(&mut self, snapshot: Bytes) -> Result<(), ApplicationError> {
        self.state.restore(snapshot)
    }
}
