mod election_timer;
mod leader_timer;
mod time;

#[cfg(test)]
mod test_utils;

pub(super) use election_timer::ElectionTimerHandle;
pub(super) use election_timer::TimerGenerations;
pub(super) use leader_timer::LeaderTimerHandle;
