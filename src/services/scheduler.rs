//! Per-game timers: debounce windows, periodic resync and clock polling.
//!
//! Timers are keyed by game id and [`TaskKind`]; scheduling a key again replaces the previous
//! timer. When a timer fires, its work runs as a detached task, so cancelling the timer never
//! interrupts work that has already started.

use std::{future::Future, time::Duration};

use dashmap::DashMap;
use tokio::{
    task::JoinHandle,
    time::{MissedTickBehavior, interval_at, sleep, Instant},
};
use tracing::trace;

use crate::state::game::GameId;

/// Kind of timer attached to a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// One-shot remote write after the quiescence window.
    Debounce,
    /// Periodic safety-net push while the game is open.
    Resync,
    /// Periodic automatic phase check.
    ClockPoll,
}

/// Registry of cancellable timers.
#[derive(Default)]
pub struct Scheduler {
    timers: DashMap<(GameId, TaskKind), JoinHandle<()>>,
}

impl Scheduler {
    /// Empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` once after `delay`, replacing any pending timer with the same key.
    pub fn schedule_once<Fut>(&self, game_id: &str, kind: TaskKind, delay: Duration, work: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            tokio::spawn(work);
        });
        self.install(game_id, kind, handle);
    }

    /// Run `work` every `period`, first after one full period. Runs never overlap.
    pub fn schedule_interval<F, Fut>(&self, game_id: &str, kind: TaskKind, period: Duration, mut work: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let _ = tokio::spawn(work()).await;
            }
        });
        self.install(game_id, kind, handle);
    }

    /// Whether a timer is pending for the key.
    pub fn is_scheduled(&self, game_id: &str, kind: TaskKind) -> bool {
        self.timers
            .get(&(game_id.to_string(), kind))
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Cancel the timer for the key. Returns whether one was pending.
    pub fn cancel(&self, game_id: &str, kind: TaskKind) -> bool {
        match self.timers.remove(&(game_id.to_string(), kind)) {
            Some((_, handle)) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }

    /// Cancel every timer of `game_id`.
    pub fn cancel_game(&self, game_id: &str) {
        self.timers.retain(|(id, kind), handle| {
            if id == game_id {
                trace!(game_id = %id, ?kind, "cancelling timer");
                handle.abort();
                false
            } else {
                true
            }
        });
    }

    /// Cancel everything.
    pub fn cancel_all(&self) {
        self.timers.retain(|_, handle| {
            handle.abort();
            false
        });
    }

    fn install(&self, game_id: &str, kind: TaskKind, handle: JoinHandle<()>) {
        if let Some(previous) = self.timers.insert((game_id.to_string(), kind), handle) {
            previous.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
