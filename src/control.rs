use std::fmt;
use std::str::FromStr;

use crate::config::ImporterConfig;
use crate::{Error, Result};

pub const TICK: &str = "tick";
pub const TERMINATE: &str = "$TERM";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    Tick,
    Terminate,
}

impl ControlCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlCommand::Tick => TICK,
            ControlCommand::Terminate => TERMINATE,
        }
    }
}

impl FromStr for ControlCommand {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            TICK => Ok(ControlCommand::Tick),
            TERMINATE => Ok(ControlCommand::Terminate),
            other => Err(Error::Protocol(format!("unknown control command: {other:?}"))),
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a worker should do on a given tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickActions {
    pub ping: bool,
    pub sample_storage: bool,
    /// Cache generation after this tick. Changes once per refresh interval,
    /// offset by worker id so workers do not flush at the same time.
    pub generation: u64,
}

#[derive(Clone, Debug)]
pub struct TickSchedule {
    worker_id: u64,
    ticks: u64,
    ping_interval: u64,
    storage_interval: u64,
    refresh_interval: u64,
}

impl TickSchedule {
    pub fn new(
        worker_id: usize,
        ping_interval: u64,
        storage_interval: u64,
        refresh_interval: u64,
    ) -> Self {
        Self {
            worker_id: worker_id as u64,
            ticks: 0,
            ping_interval: ping_interval.max(1),
            storage_interval: storage_interval.max(1),
            refresh_interval: refresh_interval.max(1),
        }
    }

    pub fn from_config(worker_id: usize, config: &ImporterConfig) -> Self {
        Self::new(
            worker_id,
            config.ping_interval,
            config.storage_interval,
            config.refresh_interval,
        )
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Generation before any tick has been seen.
    pub fn initial_generation(&self) -> u64 {
        self.generation_at(0)
    }

    pub fn tick(&mut self) -> TickActions {
        let ping = self.ticks % self.ping_interval == 0;
        self.ticks += 1;
        TickActions {
            ping,
            sample_storage: self.ticks % self.storage_interval == 0,
            generation: self.generation_at(self.ticks),
        }
    }

    fn generation_at(&self, ticks: u64) -> u64 {
        (ticks + self.worker_id + 1) / self.refresh_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_commands_only() {
        assert_eq!("tick".parse::<ControlCommand>().unwrap(), ControlCommand::Tick);
        assert_eq!(
            "$TERM".parse::<ControlCommand>().unwrap(),
            ControlCommand::Terminate
        );
        assert!(matches!(
            "reload".parse::<ControlCommand>(),
            Err(Error::Protocol(_))
        ));
        assert_eq!(ControlCommand::Terminate.to_string(), "$TERM");
    }

    #[test]
    fn pings_on_multiples_of_interval_starting_at_zero() {
        let mut schedule = TickSchedule::new(0, 5, 60, 3600);
        let pings: Vec<u64> = (0..12)
            .filter_map(|n| schedule.tick().ping.then_some(n))
            .collect();
        assert_eq!(pings, vec![0, 5, 10]);
    }

    #[test]
    fn storage_sampled_every_interval() {
        let mut schedule = TickSchedule::new(0, 5, 3, 3600);
        let samples: Vec<bool> = (0..6).map(|_| schedule.tick().sample_storage).collect();
        assert_eq!(samples, vec![false, false, true, false, false, true]);
    }

    #[test]
    fn generations_are_staggered_by_worker() {
        for worker in 0..3u64 {
            let mut schedule = TickSchedule::new(worker as usize, 5, 60, 10);
            let initial = schedule.initial_generation();
            let flush_tick = (1..=20)
                .find(|_| schedule.tick().generation != initial)
                .unwrap();
            assert_eq!(flush_tick, 10 - worker - 1);
        }
    }

    #[test]
    fn generation_changes_once_per_interval() {
        let mut schedule = TickSchedule::new(1, 5, 60, 4);
        let mut last = schedule.initial_generation();
        let mut changes = 0;
        for _ in 0..40 {
            let g = schedule.tick().generation;
            if g != last {
                changes += 1;
                last = g;
            }
        }
        assert_eq!(changes, 10);
    }
}
