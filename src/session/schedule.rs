//! Timer-driven info events.
//!
//! Each schedule is a tokio task that sends [`SessionMsg::Info`] into the
//! owning session's queue, so a timer fire is handled exactly like any other
//! inbound message. Tasks are aborted when the session is released, and
//! fires already queued by then carry a stale generation.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::SessionMsg;
use crate::view::InfoEvent;

pub struct Scheduler {
    tx: mpsc::Sender<SessionMsg>,
    generation: u64,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(tx: mpsc::Sender<SessionMsg>, generation: u64) -> Self {
        Self {
            tx,
            generation,
            tasks: Vec::new(),
        }
    }

    /// Deliver `event` every `period`, first fire one period from now.
    pub fn every(&mut self, event: InfoEvent, period: Duration) {
        let tx = self.tx.clone();
        let generation = self.generation;
        crate::debug!("schedule"; "'{}' every {:?}", event.name, period);
        self.track(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            // A slow session gets one fire, not a burst of catch-up fires.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let msg = SessionMsg::Info {
                    generation,
                    event: event.clone(),
                };
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
        }));
    }

    pub fn once(&mut self, event: InfoEvent, after: Duration) {
        let tx = self.tx.clone();
        let generation = self.generation;
        self.track(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(SessionMsg::Info { generation, event }).await;
        }));
    }

    fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }

    /// Number of schedules still running.
    pub fn active(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }

    pub fn cancel_all(&mut self) {
        let count = self.tasks.len();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if count > 0 {
            crate::debug!("schedule"; "cancelled {} timer(s)", count);
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

// ============================================================================
// Tests
// ============================================================================
