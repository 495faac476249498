use bytes::Bytes;
use raft_replica::{
    ApplicationError, Command, CommandRegistry, InMemoryLog, InMemoryNetwork, Log, PersistentLocalState, Query,
    RaftClient, RaftClientConfig, RaftOptions, RaftRole, RegisteredStateMachine, ReplicaId, ReplicaStatus, Snapshot,
    Snapshotable, SubmitError, Term, WriteAheadLogEntry,
};
use slog::Drain;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::error::Error;
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};

const ELECTION_TIMEOUT_MS: u64 = 300;
const HEARTBEAT_MS: u64 = 50;

#[tokio::test]
async fn leader_election() -> Result<(), Box<dyn Error>> {
    let cluster = Cluster::start(5).await?;

    let leader_id = cluster.wait_for_stable_leader(&[], Duration::from_secs(10)).await;

    let statuses = cluster.statuses(&[]).await;
    let leaders: Vec<_> = statuses.values().filter(|s| s.role == RaftRole::Leader).collect();
    assert_eq!(leaders.len(), 1);
    let term = leaders[0].term;
    for (id, status) in statuses.iter().filter(|(id, _)| **id != leader_id) {
        assert_eq!(status.role, RaftRole::Follower, "{} isn't following", id);
        assert_eq!(status.term, term);
        assert_eq!(status.leader.as_deref(), Some(leader_id.as_str()));
    }

    Ok(())
}

#[tokio::test]
async fn simple_commit() -> Result<(), Box<dyn Error>> {
    let cluster = Cluster::start(3).await?;
    let leader_id = cluster.wait_for_stable_leader(&[], Duration::from_secs(10)).await;
    let leader = cluster.client(&leader_id);

    let output = leader.replicated_state_machine.submit(add(5)).await?;
    assert_eq!(output.result, Bytes::from("5"));

    let output = leader.replicated_state_machine.submit(add(2)).await?;
    assert_eq!(output.result, Bytes::from("7"));
    let committed_index = output.entry_id.index();

    // Every replica eventually applies both commands.
    cluster
        .wait_until(Duration::from_secs(5), |statuses| {
            statuses.values().all(|s| s.last_applied >= committed_index)
        })
        .await;

    let value = leader
        .replicated_state_machine
        .query(Query::new("get", Bytes::new()))
        .await?;
    assert_eq!(value, Bytes::from("7"));

    // The application's own errors come back to the submitter. The entry still commits.
    let result = leader.replicated_state_machine.submit(Command::new("add", Bytes::new())).await;
    match result {
        Err(SubmitError::Application(e)) => assert_eq!(e, ApplicationError::new("missing delta")),
        other => panic!("Expected an application error, got {:?}", other),
    }

    Ok(())
}

#[tokio::test]
async fn follower_redirects_to_leader() -> Result<(), Box<dyn Error>> {
    let cluster = Cluster::start(3).await?;
    let leader_id = cluster.wait_for_stable_leader(&[], Duration::from_secs(10)).await;

    let follower_id = cluster.ids.iter().find(|id| **id != leader_id).unwrap();
    let follower = cluster.client(follower_id);

    match follower.replicated_state_machine.submit(add(1)).await {
        Err(SubmitError::NotLeader { leader }) => assert_eq!(leader, Some(leader_id.clone())),
        other => panic!("Expected a redirect, got {:?}", other),
    }
    assert!(follower
        .replicated_state_machine
        .query(Query::new("get", Bytes::new()))
        .await
        .is_err());

    Ok(())
}

#[tokio::test]
async fn isolated_leader_steps_down() -> Result<(), Box<dyn Error>> {
    let cluster = Cluster::start(3).await?;
    let old_leader_id = cluster.wait_for_stable_leader(&[], Duration::from_secs(10)).await;
    let old_leader = cluster.client(&old_leader_id);

    cluster.network.isolate(&old_leader_id);

    // Can't reach a majority, so the command never commits and the caller hears about it once the
    // leader gives up.
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        old_leader.replicated_state_machine.submit(add(9)),
    )
    .await
    .expect("Pending submission was never resolved");
    assert!(
        matches!(result, Err(SubmitError::LeadershipLost)),
        "Expected leadership loss, got {:?}",
        result
    );

    let new_leader_id = cluster
        .wait_for_stable_leader(&[old_leader_id.as_str()], Duration::from_secs(10))
        .await;
    assert_ne!(new_leader_id, old_leader_id);
    cluster.client(&new_leader_id).replicated_state_machine.submit(add(3)).await?;

    // Once reconnected, the old leader drops its uncommitted entry and catches up.
    cluster.network.heal(&old_leader_id);
    let leader_id = cluster.wait_for_stable_leader(&[], Duration::from_secs(10)).await;
    let output = cluster.client(&leader_id).replicated_state_machine.submit(add(4)).await?;
    assert_eq!(output.result, Bytes::from("7"));

    let committed_index = output.entry_id.index();
    cluster
        .wait_until(Duration::from_secs(5), |statuses| {
            statuses
                .values()
                .all(|s| s.last_applied == committed_index && s.last_log_index == committed_index)
        })
        .await;

    Ok(())
}

#[tokio::test]
async fn snapshot_seeds_new_replica() -> Result<(), Box<dyn Error>> {
    let cluster = Cluster::start(1).await?;
    let leader_id = cluster.wait_for_stable_leader(&[], Duration::from_secs(5)).await;
    let leader = cluster.client(&leader_id);

    leader.replicated_state_machine.submit(add(40)).await?;
    leader.replicated_state_machine.submit(add(2)).await?;

    let snapshot = leader.replicated_state_machine.take_snapshot().await?;
    let status = leader.replicated_state_machine.status().await?;
    assert_eq!(snapshot.last_included_index, status.last_applied);
    assert_eq!(snapshot.last_included_term, status.term);

    // A brand new replica has an empty log, so it can only take the state.
    let seeded = Cluster::start_with_snapshot(
        1,
        Some(Snapshot {
            last_included_index: 0,
            last_included_term: 0,
            data: snapshot.data.clone(),
        }),
    )
    .await?;
    let seeded_leader_id = seeded.wait_for_stable_leader(&[], Duration::from_secs(5)).await;
    let value = seeded
        .client(&seeded_leader_id)
        .replicated_state_machine
        .query(Query::new("get", Bytes::new()))
        .await?;
    assert_eq!(value, Bytes::from("42"));

    // A snapshot pointing past the end of the log is refused.
    let result = Cluster::start_with_snapshot(1, Some(snapshot)).await;
    assert!(result.is_err());

    Ok(())
}

#[tokio::test]
async fn restart_on_existing_log_continues_from_its_term() -> Result<(), Box<dyn Error>> {
    // What a previous run left behind: two commands written by the term 3 leader.
    let mut log = InMemoryLog::<WriteAheadLogEntry>::create()?;
    for delta in [40, 2].iter() {
        log.append(WriteAheadLogEntry::command(Term::new(3), add(*delta).encode()?.to_vec()))?;
    }

    let id = repl_id(0);
    let network = InMemoryNetwork::new(Duration::from_millis(100));
    let client = raft_replica::try_create_raft_client_with_log(single_member_config(&network, &id), log).await?;
    network.register(id.clone(), client.rpc_server());

    let status = wait_for_leader(&client, Duration::from_secs(5)).await;
    assert!(status.term > 3, "Elected at term {}, below its own log", status.term);
    // The new leader's no-op commits the old entries.
    assert_eq!(status.last_log_index, 3);
    assert_eq!(status.commit_index, 3);

    let value = client
        .replicated_state_machine
        .query(Query::new("get", Bytes::new()))
        .await?;
    assert_eq!(value, Bytes::from("42"));

    Ok(())
}

#[tokio::test]
async fn restart_resumes_saved_term_and_vote() -> Result<(), Box<dyn Error>> {
    let id = repl_id(0);
    let disk = Arc::new(Mutex::new(SavedTermAndVote {
        term: 7,
        voted_for: Some("replica-9".to_string()),
    }));
    let local_state = DiskLocalState {
        my_replica_id: ReplicaId::new(id.clone()),
        disk: disk.clone(),
    };

    let network = InMemoryNetwork::new(Duration::from_millis(100));
    let client = raft_replica::try_create_raft_client_with_storage(
        single_member_config(&network, &id),
        InMemoryLog::<WriteAheadLogEntry>::create()?,
        local_state,
    )
    .await?;
    network.register(id.clone(), client.rpc_server());

    let status = wait_for_leader(&client, Duration::from_secs(5)).await;
    assert_eq!(status.term, 8);

    // The self-vote for the new term reached the store before we led.
    let saved = disk.lock().unwrap();
    assert_eq!(saved.term, 8);
    assert_eq!(saved.voted_for.as_deref(), Some(id.as_str()));

    Ok(())
}

struct SavedTermAndVote {
    term: u64,
    voted_for: Option<String>,
}

/// Writes straight through to a shared record, standing in for a file the replica fsyncs.
struct DiskLocalState {
    my_replica_id: ReplicaId,
    disk: Arc<Mutex<SavedTermAndVote>>,
}

impl PersistentLocalState for DiskLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> bool {
        let mut disk = self.disk.lock().unwrap();
        if new_term.as_u64() <= disk.term {
            return false;
        }
        disk.term = new_term.as_u64();
        disk.voted_for = None;
        true
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_current_term: Term, vote: ReplicaId) -> bool {
        let mut disk = self.disk.lock().unwrap();
        if expected_current_term.as_u64() != disk.term || disk.voted_for.is_some() {
            return false;
        }
        disk.voted_for = Some(vote.as_str().to_string());
        true
    }

    fn increment_term_and_vote_for_self(&mut self) -> Term {
        let mut disk = self.disk.lock().unwrap();
        disk.term += 1;
        disk.voted_for = Some(self.my_replica_id.as_str().to_string());
        Term::new(disk.term)
    }

    fn current_term(&self) -> Term {
        Term::new(self.disk.lock().unwrap().term)
    }

    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>) {
        let disk = self.disk.lock().unwrap();
        let voted_for = disk.voted_for.clone().map(|id| Arc::new(ReplicaId::new(id)));
        (Term::new(disk.term), voted_for)
    }
}

fn single_member_config(network: &InMemoryNetwork, id: &str) -> RaftClientConfig {
    RaftClientConfig {
        my_replica_id: id.to_string(),
        cluster_members: vec![id.to_string()],
        state_machine: Box::new(counter_state_machine()),
        transport: Arc::new(network.transport_for(id.to_string())),
        info_logger: create_root_logger_for_stdout(),
        options: RaftOptions::from_millis(ELECTION_TIMEOUT_MS, HEARTBEAT_MS),
        initial_snapshot: None,
    }
}

async fn wait_for_leader(client: &RaftClient, timeout: Duration) -> ReplicaStatus {
    let deadline = Instant::now() + timeout;
    loop {
        let status = client.replicated_state_machine.status().await.expect("Replica exited");
        if status.role == RaftRole::Leader && status.last_applied == status.commit_index {
            return status;
        }
        if Instant::now() >= deadline {
            panic!("Timeout waiting for leader. Last seen: {:#?}", status);
        }
        sleep(Duration::from_millis(HEARTBEAT_MS)).await;
    }
}

struct Cluster {
    network: InMemoryNetwork,
    ids: Vec<String>,
    clients: HashMap<String, RaftClient>,
}

impl Cluster {
    async fn start(num_members: usize) -> Result<Cluster, Box<dyn Error>> {
        Self::start_with_snapshot(num_members, None).await
    }

    async fn start_with_snapshot(num_members: usize, snapshot: Option<Snapshot>) -> Result<Cluster, Box<dyn Error>> {
        let network = InMemoryNetwork::new(Duration::from_millis(100));
        let ids: Vec<String> = (0..num_members).map(repl_id).collect();

        let mut clients = HashMap::with_capacity(num_members);
        for id in ids.iter() {
            let client = raft_replica::try_create_raft_client(RaftClientConfig {
                my_replica_id: id.clone(),
                cluster_members: ids.clone(),
                state_machine: Box::new(counter_state_machine()),
                transport: Arc::new(network.transport_for(id.clone())),
                info_logger: create_root_logger_for_stdout(),
                options: RaftOptions::from_millis(ELECTION_TIMEOUT_MS, HEARTBEAT_MS),
                initial_snapshot: snapshot.clone(),
            })
            .await?;
            network.register(id.clone(), client.rpc_server());
            clients.insert(id.clone(), client);
        }

        Ok(Cluster { network, ids, clients })
    }

    fn client(&self, id: &str) -> &RaftClient {
        self.clients.get(id).expect("Unknown replica")
    }

    async fn statuses(&self, excluding: &[&str]) -> HashMap<String, ReplicaStatus> {
        let mut statuses = HashMap::with_capacity(self.ids.len());
        for id in self.ids.iter().filter(|id| !excluding.contains(&id.as_str())) {
            let status = self
                .client(id)
                .replicated_state_machine
                .status()
                .await
                .expect("Replica exited");
            statuses.insert(id.clone(), status);
        }
        statuses
    }

    async fn wait_until<F>(&self, timeout: Duration, condition: F)
    where
        F: Fn(&HashMap<String, ReplicaStatus>) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let statuses = self.statuses(&[]).await;
            if condition(&statuses) {
                return;
            }
            if Instant::now() >= deadline {
                panic!("Timeout waiting for cluster. Last seen: {:#?}", statuses);
            }
            sleep(Duration::from_millis(HEARTBEAT_MS)).await;
        }
    }

    /// Waits until exactly one replica leads and every other (non-excluded) replica follows it on
    /// the same term.
    async fn wait_for_stable_leader(&self, excluding: &[&str], timeout: Duration) -> String {
        let deadline = Instant::now() + timeout;
        loop {
            let statuses = self.statuses(excluding).await;
            if let Some(leader_id) = stable_leader(&statuses) {
                return leader_id;
            }
            if Instant::now() >= deadline {
                panic!("Timeout waiting for leader election. Last seen: {:#?}", statuses);
            }
            sleep(Duration::from_millis(HEARTBEAT_MS)).await;
        }
    }
}

fn stable_leader(statuses: &HashMap<String, ReplicaStatus>) -> Option<String> {
    let mut leaders = statuses.iter().filter(|(_, s)| s.role == RaftRole::Leader);
    let (leader_id, leader_status) = leaders.next()?;
    if leaders.next().is_some() {
        return None;
    }

    let all_following = statuses.iter().filter(|(id, _)| *id != leader_id).all(|(_, s)| {
        s.role == RaftRole::Follower && s.term == leader_status.term && s.leader.as_ref() == Some(leader_id)
    });

    if all_following {
        Some(leader_id.clone())
    } else {
        None
    }
}

#[derive(Default)]
struct Counter {
    value: u64,
}

impl Snapshotable for Counter {
    fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.value.to_be_bytes())
    }

    fn restore(&mut self, snapshot: Bytes) -> Result<(), ApplicationError> {
        let bytes = <[u8; 8]>::try_from(&snapshot[..]).map_err(|_| ApplicationError::new("bad snapshot"))?;
        self.value = u64::from_be_bytes(bytes);
        Ok(())
    }
}

fn counter_state_machine() -> RegisteredStateMachine<Counter> {
    let registry = CommandRegistry::new()
        .with_command("add", |counter: &mut Counter, args: &[u8]| {
            let delta = args.first().copied().ok_or_else(|| ApplicationError::new("missing delta"))?;
            counter.value += delta as u64;
            Ok(Bytes::from(counter.value.to_string()))
        })
        .with_query("get", |counter: &Counter, _args: &[u8]| {
            Ok(Bytes::from(counter.value.to_string()))
        });

    RegisteredStateMachine::new(Counter::default(), registry)
}

fn add(delta: u8) -> Command {
    Command::new("add", vec![delta])
}

fn repl_id(id: usize) -> String {
    format!("replica-{}", id + 1)
}

fn create_root_logger_for_stdout() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog::LevelFilter::new(drain, slog::Level::Info).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!())
}

async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}
