use crate::replica;
use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, HeartbeatError, HeartbeatInput, HeartbeatOutput,
    QueryInput, QueryOutput, ReplicaStatusOutput, RequestVoteError, RequestVoteInput, RequestVoteOutput,
    ServeQueryError, SubmitCommandError, SubmitCommandInput, SubmitCommandOutput, TakeSnapshotError,
    TakeSnapshotOutput,
};
use std::error::Error;
use std::fmt::Debug;
use tokio::sync::{mpsc, oneshot};

// Disk interaction is synchronous, and the application state machine is applied inline. Anything
// that waits on the network happens on a spawned task and comes back as another event.
#[derive(Debug)]
pub(crate) enum Event {
    // Leader: Write to log, replicate eagerly, park callback until applied.
    // Candidate: Reject request.
    // Follower: Redirect.
    Submit(
        SubmitCommandInput,
        Callback<SubmitCommandOutput, SubmitCommandError>,
    ),

    // Leader: Read applied state.
    // Candidate/Follower: Redirect.
    Query(QueryInput, Callback<QueryOutput, ServeQueryError>),

    // Leader: Grant vote if applicable (includes write to disk). Transition to follower.
    // Candidate: Grant vote if applicable (includes write to disk). Transition to follower.
    // Follower: Grant vote if applicable (includes write to disk).
    RequestVote(RequestVoteInput, Callback<RequestVoteOutput, RequestVoteError>),

    // Leader: discard
    // Candidate: Update local state. Transition to leader if quorum vote.
    // Follower: discard
    RequestVoteReplyFromPeer(replica::RequestVoteReplyFromPeer),

    // Leader: Transition to follower if applicable. Otherwise reject.
    // Candidate: Transition to follower. Clean up log. Respond to request.
    // Follower: Write to disk then respond. Reset timeout.
    AppendEntries(AppendEntriesInput, Callback<AppendEntriesOutput, AppendEntriesError>),

    // Same as AppendEntries, minus the log.
    Heartbeat(HeartbeatInput, Callback<HeartbeatOutput, HeartbeatError>),

    // Leader: Update local state tracking each peer's replication progress. If committed, apply to
    // state machine and send response to submit client.
    // Candidate: discard
    // Follower: discard
    AppendEntriesReplyFromPeer(replica::AppendEntriesReplyFromPeer),

    // Leader: Send AppendEntries (or a heartbeat) to the peer. Check quorum.
    // Candidate: NOT POSSIBLE - discard
    // Follower: NOT POSSIBLE - discard
    LeaderTimer(replica::LeaderTimerTick),

    // Leader: NOT POSSIBLE - discard
    // Candidate: Start a new election.
    // Follower: Transition to candidate, unless we voted since the last reset.
    ElectionTimeout(replica::ElectionTimeoutTick),

    TakeSnapshot(Callback<TakeSnapshotOutput, TakeSnapshotError>),

    Status(oneshot::Sender<ReplicaStatusOutput>),
}

#[derive(Debug)]
pub(crate) struct Callback<O: Debug, E: Error>(pub(crate) oneshot::Sender<Result<O, E>>);

impl<O: Debug, E: Error> Callback<O, E> {
    pub(crate) fn send(self, message: Result<O, E>) {
        let _ = self.0.send(message);
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Replica actor has exited")]
pub(crate) struct ActorExited;

/// ActorClient is the strong handle to the replica actor. The event loop runs for as long as one
/// of these is alive.
#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: mpsc::Sender<Event>,
}

/// WeakActorClient doesn't keep the replica actor alive. Timers, peer calls and the RPC server
/// hold these, so dropping the last `ActorClient` shuts everything down.
#[derive(Clone)]
pub(crate) struct WeakActorClient {
    sender: mpsc::WeakSender<Event>,
}

impl ActorClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        (ActorClient { sender: tx }, rx)
    }

    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }

    pub(crate) async fn submit(&self, input: SubmitCommandInput) -> Result<SubmitCommandOutput, SubmitCommandError> {
        let (tx, rx) = oneshot::channel();
        send(&self.sender, Event::Submit(input, Callback(tx)))
            .await
            .map_err(|_| SubmitCommandError::ActorExited)?;

        rx.await.unwrap_or(Err(SubmitCommandError::ActorExited))
    }

    pub(crate) async fn query(&self, input: QueryInput) -> Result<QueryOutput, ServeQueryError> {
        let (tx, rx) = oneshot::channel();
        send(&self.sender, Event::Query(input, Callback(tx)))
            .await
            .map_err(|_| ServeQueryError::ActorExited)?;

        rx.await.unwrap_or(Err(ServeQueryError::ActorExited))
    }

    pub(crate) async fn take_snapshot(&self) -> Result<TakeSnapshotOutput, TakeSnapshotError> {
        let (tx, rx) = oneshot::channel();
        send(&self.sender, Event::TakeSnapshot(Callback(tx)))
            .await
            .map_err(|_| TakeSnapshotError::ActorExited)?;

        rx.await.unwrap_or(Err(TakeSnapshotError::ActorExited))
    }

    pub(crate) async fn status(&self) -> Result<ReplicaStatusOutput, ActorExited> {
        let (tx, rx) = oneshot::channel();
        send(&self.sender, Event::Status(tx)).await?;

        rx.await.map_err(|_| ActorExited)
    }
}

impl WeakActorClient {
    fn upgrade(&self) -> Result<mpsc::Sender<Event>, ActorExited> {
        self.sender.upgrade().ok_or(ActorExited)
    }

    pub(crate) async fn submit(&self, input: SubmitCommandInput) -> Result<SubmitCommandOutput, SubmitCommandError> {
        let sender = self.upgrade().map_err(|_| SubmitCommandError::ActorExited)?;
        ActorClient { sender }.submit(input).await
    }

    pub(crate) async fn request_vote(&self, input: RequestVoteInput) -> Result<RequestVoteOutput, RequestVoteError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::RequestVote(input, Callback(tx)))
            .await
            .map_err(|_| RequestVoteError::ActorExited)?;

        rx.await.unwrap_or(Err(RequestVoteError::ActorExited))
    }

    pub(crate) async fn append_entries(
        &self,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::AppendEntries(input, Callback(tx)))
            .await
            .map_err(|_| AppendEntriesError::ActorExited)?;

        rx.await.unwrap_or(Err(AppendEntriesError::ActorExited))
    }

    pub(crate) async fn heartbeat(&self, input: HeartbeatInput) -> Result<HeartbeatOutput, HeartbeatError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Heartbeat(input, Callback(tx)))
            .await
            .map_err(|_| HeartbeatError::ActorExited)?;

        rx.await.unwrap_or(Err(HeartbeatError::ActorExited))
    }

    pub(crate) async fn notify_request_vote_reply_from_peer(
        &self,
        input: replica::RequestVoteReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.send(Event::RequestVoteReplyFromPeer(input)).await
    }

    pub(crate) async fn notify_append_entries_reply_from_peer(
        &self,
        input: replica::AppendEntriesReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.send(Event::AppendEntriesReplyFromPeer(input)).await
    }

    pub(crate) async fn leader_timer(&self, input: replica::LeaderTimerTick) -> Result<(), ActorExited> {
        self.send(Event::LeaderTimer(input)).await
    }

    pub(crate) async fn election_timeout(&self, input: replica::ElectionTimeoutTick) -> Result<(), ActorExited> {
        self.send(Event::ElectionTimeout(input)).await
    }

    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        let sender = self.upgrade()?;
        send(&sender, event).await
    }
}

async fn send(sender: &mpsc::Sender<Event>, event: Event) -> Result<(), ActorExited> {
    sender.send(event).await.map_err(|_| ActorExited)
}

/// ReplicaActor is replica logic in actor model.
pub(crate) struct ReplicaActor<L, S>
where
    L: crate::commitlog::Log<replica::WriteAheadLogEntry>,
    S: replica::PersistentLocalState,
{
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    replica: replica::Replica<L, S>,
}

impl<L, S> ReplicaActor<L, S>
where
    L: crate::commitlog::Log<replica::WriteAheadLogEntry> + Send + 'static,
    S: replica::PersistentLocalState + Send + 'static,
{
    pub(crate) fn new(logger: slog::Logger, receiver: mpsc::Receiver<Event>, replica: replica::Replica<L, S>) -> Self {
        ReplicaActor {
            logger,
            receiver,
            replica,
        }
    }

    pub(crate) async fn run_event_loop(mut self) {
        slog::info!(self.logger, "Replica event loop started");
        while let Some(event) = self.receiver.recv().await {
            self.handle_event(event);
        }
        slog::info!(self.logger, "Replica event loop exited");
    }

    // This must NOT be async. Any long running work must be spawned on another task
    // and/or come as a callback to this actor.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Submit(input, callback) => {
                // Callback is parked until the entry is applied.
                self.replica.handle_submit_command(input, callback);
            }
            Event::Query(input, callback) => {
                let result = self.replica.handle_query(input);
                callback.send(result);
            }
            Event::RequestVote(input, callback) => {
                let result = self.replica.server_handle_request_vote(input);
                callback.send(result);
            }
            Event::RequestVoteReplyFromPeer(input) => {
                self.replica.handle_request_vote_reply_from_peer(input);
            }
            Event::AppendEntries(input, callback) => {
                let result = self.replica.server_handle_append_entries(input);
                callback.send(result);
            }
            Event::Heartbeat(input, callback) => {
                let result = self.replica.server_handle_heartbeat(input);
                callback.send(result);
            }
            Event::AppendEntriesReplyFromPeer(input) => {
                self.replica.handle_append_entries_reply_from_peer(input);
            }
            Event::LeaderTimer(input) => {
                self.replica.handle_leader_timer(input);
            }
            Event::ElectionTimeout(input) => {
                self.replica.handle_election_timeout(input);
            }
            Event::TakeSnapshot(callback) => {
                let result = self.replica.handle_take_snapshot();
                callback.send(result);
            }
            Event::Status(reply) => {
                let _ = reply.send(self.replica.status());
            }
        }
    }
}
