use bytes::Bytes;
use raft_replica::{
    ApplicationError, Command, CommandRegistry, InMemoryNetwork, Query, RaftClient, RaftClientConfig,
    RaftElectionState, RaftEvent, RaftOptions, RegisteredStateMachine, Snapshotable, SubmitError,
};
use slog::Drain;
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

const CLUSTER: [&str; 3] = ["id-1", "id-2", "id-3"];

#[derive(Default)]
struct KeyValueStore {
    entries: BTreeMap<String, String>,
}

impl Snapshotable for KeyValueStore {
    fn snapshot(&self) -> Bytes {
        let mut out = String::new();
        for (key, value) in self.entries.iter() {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        Bytes::from(out)
    }

    fn restore(&mut self, snapshot: Bytes) -> Result<(), ApplicationError> {
        let text = std::str::from_utf8(&snapshot).map_err(|_| ApplicationError::new("snapshot is not UTF-8"))?;
        self.entries = text
            .lines()
            .map(parse_assignment)
            .collect::<Result<_, _>>()?;
        Ok(())
    }
}

fn parse_assignment(line: &str) -> Result<(String, String), ApplicationError> {
    let mut parts = line.splitn(2, '=');
    match (parts.next(), parts.next()) {
        (Some(key), Some(value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(ApplicationError::new(format!("expected key=value, got '{}'", line))),
    }
}

fn key_value_state_machine() -> RegisteredStateMachine<KeyValueStore> {
    let registry = CommandRegistry::new()
        .with_command("set", |store: &mut KeyValueStore, args: &[u8]| {
            let text = std::str::from_utf8(args).map_err(|_| ApplicationError::new("args are not UTF-8"))?;
            let (key, value) = parse_assignment(text)?;
            let previous = store.entries.insert(key, value);
            Ok(Bytes::from(previous.unwrap_or_default()))
        })
        .with_query("get", |store: &KeyValueStore, args: &[u8]| {
            let key = std::str::from_utf8(args).map_err(|_| ApplicationError::new("key is not UTF-8"))?;
            store
                .entries
                .get(key)
                .map(|value| Bytes::from(value.clone()))
                .ok_or_else(|| ApplicationError::new(format!("no such key '{}'", key)))
        });

    RegisteredStateMachine::new(KeyValueStore::default(), registry)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let logger = create_root_logger_for_stdout();
    let network = InMemoryNetwork::new(Duration::from_millis(100));

    let mut clients = HashMap::with_capacity(CLUSTER.len());
    for id in CLUSTER.iter() {
        let client = raft_replica::try_create_raft_client(RaftClientConfig {
            my_replica_id: id.to_string(),
            cluster_members: CLUSTER.iter().map(|m| m.to_string()).collect(),
            state_machine: Box::new(key_value_state_machine()),
            transport: Arc::new(network.transport_for(*id)),
            info_logger: logger.clone(),
            options: RaftOptions::from_millis(500, 50),
            initial_snapshot: None,
        })
        .await?;
        network.register(*id, client.rpc_server());
        clients.insert(id.to_string(), client);
    }

    let leader_id = discover_leader_id(&mut clients, Duration::from_secs(10)).await?;
    slog::info!(logger, "Leader is {}", leader_id);

    let leader = &clients[&leader_id];
    for assignment in ["color=blue", "shape=circle", "color=green"].iter() {
        let command = Command::new("set", Bytes::from(assignment.to_string()));
        match leader.replicated_state_machine.submit(command).await {
            Ok(output) => println!(
                "set {} -> committed at index {} term {}, previous value '{}'",
                assignment,
                output.entry_id.index(),
                output.entry_id.term(),
                String::from_utf8_lossy(&output.result)
            ),
            Err(SubmitError::NotLeader { leader }) => println!("set {} -> redirected to {:?}", assignment, leader),
            Err(e) => println!("set {} -> failed: {}", assignment, e),
        }
    }

    let color = leader
        .replicated_state_machine
        .query(Query::new("get", Bytes::from_static(b"color")))
        .await?;
    println!("get color -> '{}'", String::from_utf8_lossy(&color));

    for id in CLUSTER.iter() {
        let status = clients[*id].replicated_state_machine.status().await?;
        println!("{}: {:?}", id, status);
    }

    Ok(())
}

async fn discover_leader_id(
    clients: &mut HashMap<String, RaftClient>,
    timeout: Duration,
) -> Result<String, Box<dyn Error>> {
    let deadline = Instant::now() + timeout;
    let (any_client_id, any_client) = clients.iter_mut().next().ok_or("no replicas")?;

    let mut event = any_client.event_listener.latest_event();
    loop {
        let RaftEvent::Election { state, .. } = event;
        match state {
            RaftElectionState::Leader => return Ok(any_client_id.clone()),
            RaftElectionState::Follower { leader: Some(leader) } => return Ok(leader),
            RaftElectionState::Follower { leader: None } | RaftElectionState::Candidate => {}
        }

        event = tokio::time::timeout_at(deadline, any_client.event_listener.next_event())
            .await
            .map_err(|_| "timed out waiting for a leader")?
            .ok_or("replica exited")?;
    }
}

fn create_root_logger_for_stdout() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!())
}
