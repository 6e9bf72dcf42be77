//! Event coalescing: turns a bursty stream of [`WatchEvent`]s into sync
//! triggers
//!
//! A pass fires when one of these happens:
//! - the quiet period elapses after the last event,
//! - more than `overflow_threshold` distinct paths are pending,
//! - an event arrives more than `max_delay` after the previous fire.
//!
//! Triggers go through a single-slot mailbox: firing while a trigger is
//! still unconsumed is a no-op.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, trace};

use crate::config::SyncTuning;
use crate::watcher::WatchEvent;

/// Create a connected trigger pair
#[must_use]
pub fn trigger() -> (Trigger, TriggerReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (Trigger { tx }, TriggerReceiver { rx })
}

/// Sending half of the single-slot trigger mailbox
#[derive(Debug, Clone)]
pub struct Trigger {
    tx: mpsc::Sender<()>,
}

impl Trigger {
    /// Request a sync pass. Never blocks.
    ///
    /// Returns `false` if a trigger was already pending (or the receiver is
    /// gone), in which case nothing changes.
    pub fn fire(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

/// Receiving half of the trigger mailbox
#[derive(Debug)]
pub struct TriggerReceiver {
    rx: mpsc::Receiver<()>,
}

impl TriggerReceiver {
    /// Wait for the next trigger. Returns `false` once every [`Trigger`] has
    /// been dropped and nothing is pending.
    pub async fn wait(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }

    /// Consume a pending trigger without waiting
    pub fn try_take(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

/// Why the collector fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireReason {
    QuietPeriod,
    Overflow,
    MaxDelay,
}

/// Coalescing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorPolicy {
    pub debounce: Duration,
    pub max_delay: Duration,
    pub overflow_threshold: usize,
}

impl From<&SyncTuning> for CollectorPolicy {
    fn from(tuning: &SyncTuning) -> Self {
        Self {
            debounce: tuning.debounce,
            max_delay: tuning.max_delay,
            overflow_threshold: tuning.overflow_threshold,
        }
    }
}

/// Deduplicates watch events and decides when a pass should run.
///
/// All state is owned by the task running [`EventCollector::run`].
#[derive(Debug)]
pub struct EventCollector {
    policy: CollectorPolicy,
    trigger: Trigger,
    pending: HashSet<String>,
    /// Quiet-period countdown, `None` when stopped
    deadline: Option<Instant>,
    /// Last fire, or construction time before the first one
    last_fire: Instant,
}

impl EventCollector {
    #[must_use]
    pub fn new(policy: CollectorPolicy, trigger: Trigger) -> Self {
        Self {
            policy,
            trigger,
            pending: HashSet::new(),
            deadline: None,
            last_fire: Instant::now(),
        }
    }

    /// Number of distinct paths waiting for a pass
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Consume `events` until the sender side closes.
    pub async fn run(mut self, mut events: mpsc::Receiver<WatchEvent>) {
        loop {
            let countdown = self.deadline;
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        self.on_event(event.path, Instant::now());
                    }
                    None => break,
                },
                () = wait_for(countdown) => {
                    self.on_countdown(Instant::now());
                }
            }
        }
        debug!("Event stream closed, collector stopping");
    }

    /// Record one event. Returns why it fired, if it did.
    pub fn on_event(&mut self, path: String, now: Instant) -> Option<FireReason> {
        trace!("Event for {path}");
        self.pending.insert(path);
        self.deadline = Some(now + self.policy.debounce);

        if self.pending.len() > self.policy.overflow_threshold {
            debug!("{} paths pending, forcing sync", self.pending.len());
            self.fire(now, FireReason::Overflow);
            return Some(FireReason::Overflow);
        }

        if now.duration_since(self.last_fire) > self.policy.max_delay {
            debug!("No sync for over {:?}, forcing one", self.policy.max_delay);
            self.fire(now, FireReason::MaxDelay);
            return Some(FireReason::MaxDelay);
        }
        None
    }

    /// Handle expiry of the quiet period
    pub fn on_countdown(&mut self, now: Instant) -> Option<FireReason> {
        self.deadline = None;
        if self.pending.is_empty() {
            return None;
        }
        debug!("Quiet for {:?}, syncing {} paths", self.policy.debounce, self.pending.len());
        self.fire(now, FireReason::QuietPeriod);
        Some(FireReason::QuietPeriod)
    }

    fn fire(&mut self, now: Instant, reason: FireReason) {
        if !self.trigger.fire() {
            trace!("Trigger already pending ({reason:?})");
        }
        self.pending.clear();
        self.last_fire = now;
        self.deadline = None;
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
