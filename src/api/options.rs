use std::cmp;
use std::convert::TryFrom;
use tokio::time::Duration;

/// Timing knobs. Anything left as `None` gets a default derived from the election timeout.
#[derive(Clone, Debug, Default)]
pub struct RaftOptions {
    /// Followers wait a random time in `[0.75T, 1.25T]` without hearing from a leader before
    /// starting an election. Default 1s.
    pub election_timeout: Option<Duration>,
    /// Default 100ms.
    pub leader_heartbeat_duration: Option<Duration>,
    /// Timeout for a single call to a peer. Default 300ms, capped at half the election timeout.
    pub leader_append_entries_timeout: Option<Duration>,
    /// How long a leader keeps leading without hearing back from a majority. Default is the
    /// election timeout.
    pub leader_step_down_timeout: Option<Duration>,
}

impl RaftOptions {
    pub fn from_millis(election_timeout_ms: u64, heartbeat_interval_ms: u64) -> Self {
        RaftOptions {
            election_timeout: Some(Duration::from_millis(election_timeout_ms)),
            leader_heartbeat_duration: Some(Duration::from_millis(heartbeat_interval_ms)),
            ..RaftOptions::default()
        }
    }
}

#[derive(Debug)]
pub(super) struct RaftOptionsValidated {
    pub election_timeout: Duration,
    pub leader_heartbeat_duration: Duration,
    pub leader_append_entries_timeout: Duration,
    pub leader_step_down_timeout: Duration,
}

impl RaftOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.leader_heartbeat_duration == Duration::from_millis(0) {
            return Err("Leader's heartbeat must be non-zero");
        }
        if self.leader_heartbeat_duration > self.election_timeout / 2 {
            return Err("Leader's heartbeat must be at most half the election timeout");
        }
        if self.leader_append_entries_timeout >= self.election_timeout * 3 / 4 {
            return Err("Leader's AppendEntries RPC timeout must be less than the follower's minimum election timeout");
        }
        if self.leader_step_down_timeout < self.leader_heartbeat_duration {
            return Err("Leader's step down timeout must be at least one heartbeat");
        }

        Ok(())
    }
}

impl TryFrom<RaftOptions> for RaftOptionsValidated {
    type Error = &'static str;

    fn try_from(options: RaftOptions) -> Result<Self, Self::Error> {
        let election_timeout = options.election_timeout.unwrap_or(Duration::from_millis(1000));
        let values = RaftOptionsValidated {
            election_timeout,
            leader_heartbeat_duration: options.leader_heartbeat_duration.unwrap_or(Duration::from_millis(100)),
            leader_append_entries_timeout: options
                .leader_append_entries_timeout
                .unwrap_or_else(|| cmp::min(Duration::from_millis(300), election_timeout / 2)),
            leader_step_down_timeout: options.leader_step_down_timeout.unwrap_or(election_timeout),
        };

        values.validate()?;
        Ok(values)
    }
}
