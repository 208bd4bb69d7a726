//! The workqueue that decides when a reconcile pass may start for each Application. It's plain
//! synchronous bookkeeping: the operator loop owns it, spawns the passes that it hands out, and
//! reports back when they finish.
use crate::resource::ObjectId;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

const INITIAL_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// What happened to a key when it was added
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueued {
    Queued,
    AlreadyQueued,
    /// A pass is in flight, so the key will be queued again once it finishes
    MarkedDirty,
    /// A pass was in flight for an older generation of the Application. The caller must abort
    /// that pass, and the key has been queued again.
    Superseded,
}

/// A key that may start a pass now
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Dequeued {
    pub id: ObjectId,
    pub round: u64,
}

#[derive(Debug)]
struct KeyState {
    queued: bool,
    in_flight: bool,
    dirty: bool,
    forget_when_done: bool,
    /// Incremented every time a pass starts, so that stale retries and completions are ignored
    round: u64,
    latest_generation: Option<i64>,
    in_flight_generation: Option<i64>,
    retry_timer: ExponentialBackoff,
}

impl KeyState {
    fn new(max_retry_interval: Duration) -> KeyState {
        let mut retry_timer = ExponentialBackoff {
            initial_interval: INITIAL_RETRY_INTERVAL,
            max_interval: max_retry_interval.max(INITIAL_RETRY_INTERVAL),
            max_elapsed_time: None,
            ..Default::default()
        };
        retry_timer.reset();
        KeyState {
            queued: false,
            in_flight: false,
            dirty: false,
            forget_when_done: false,
            round: 0,
            latest_generation: None,
            in_flight_generation: None,
            retry_timer,
        }
    }

    fn is_superseded_by(&self, generation: Option<i64>) -> bool {
        match (self.in_flight_generation, generation) {
            (Some(running), Some(new)) => new > running,
            _ => false,
        }
    }
}

#[derive(Debug)]
pub(crate) struct WorkQueue {
    keys: HashMap<ObjectId, KeyState>,
    ready: VecDeque<ObjectId>,
    in_flight: usize,
    max_concurrent: usize,
    max_retry_interval: Duration,
}

impl WorkQueue {
    pub fn new(max_concurrent: usize, max_retry_interval: Duration) -> WorkQueue {
        WorkQueue {
            keys: HashMap::new(),
            ready: VecDeque::new(),
            in_flight: 0,
            max_concurrent: max_concurrent.max(1),
            max_retry_interval,
        }
    }

    /// Number of keys waiting for a pass to start
    pub fn len(&self) -> usize {
        self.ready.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Adds the key, along with the generation of the Application if the trigger was an event on
    /// the Application itself
    pub fn add(&mut self, id: ObjectId, generation: Option<i64>) -> Enqueued {
        let max_retry_interval = self.max_retry_interval;
        let state = self
            .keys
            .entry(id.clone())
            .or_insert_with(|| KeyState::new(max_retry_interval));
        state.forget_when_done = false;
        if generation > state.latest_generation {
            state.latest_generation = generation;
        }

        if state.in_flight {
            if state.is_superseded_by(generation) {
                state.in_flight = false;
                state.dirty = false;
                state.queued = true;
                self.in_flight -= 1;
                self.ready.push_back(id);
                Enqueued::Superseded
            } else {
                state.dirty = true;
                Enqueued::MarkedDirty
            }
        } else if state.queued {
            Enqueued::AlreadyQueued
        } else {
            state.queued = true;
            self.ready.push_back(id);
            Enqueued::Queued
        }
    }

    /// Returns the next key to start a pass for, unless the concurrency limit has been reached
    pub fn pop(&mut self) -> Option<Dequeued> {
        if self.in_flight >= self.max_concurrent {
            return None;
        }
        while let Some(id) = self.ready.pop_front() {
            let state = match self.keys.get_mut(&id) {
                Some(state) if state.queued => state,
                _ => continue,
            };
            state.queued = false;
            state.in_flight = true;
            state.round += 1;
            state.in_flight_generation = state.latest_generation;
            self.in_flight += 1;
            let round = state.round;
            return Some(Dequeued { id, round });
        }
        None
    }

    /// Records the end of a pass. Returns the delay before the pass should be retried, if it
    /// failed and nothing else has queued it again already. Completions of passes that are no
    /// longer in flight are ignored.
    pub fn done(&mut self, id: &ObjectId, round: u64, succeeded: bool) -> Option<Duration> {
        let state = match self.keys.get_mut(id) {
            Some(state) if state.in_flight && state.round == round => state,
            _ => {
                log::debug!("Ignoring completion of stale pass {} for: {}", round, id);
                return None;
            }
        };
        state.in_flight = false;
        state.in_flight_generation = None;
        self.in_flight -= 1;

        if state.forget_when_done {
            self.keys.remove(id);
            return None;
        }

        let retry_delay = if succeeded {
            state.retry_timer.reset();
            None
        } else {
            state.retry_timer.next_backoff()
        };

        if state.dirty {
            state.dirty = false;
            state.queued = true;
            self.ready.push_back(id.clone());
            None
        } else {
            retry_delay
        }
    }

    /// Queues a retry that was scheduled when the given round failed. Returns false if another
    /// pass has started since then, or the key is already queued.
    pub fn retry(&mut self, id: &ObjectId, round: u64) -> bool {
        let is_current = self
            .keys
            .get(id)
            .map(|state| state.round == round && !state.in_flight && !state.queued)
            .unwrap_or(false);
        if is_current {
            self.add(id.clone(), None);
        }
        is_current
    }

    /// Drops all state for the key, after its Application has been deleted. A pass that's already
    /// in flight is left to finish.
    pub fn forget(&mut self, id: &ObjectId) {
        if let Some(state) = self.keys.get_mut(id) {
            if state.in_flight {
                state.forget_when_done = true;
                state.dirty = false;
            } else {
                self.keys.remove(id);
            }
        }
    }

    /// Removes every in-flight key, returning them so their passes can be aborted
    pub fn drain_in_flight(&mut self) -> Vec<ObjectId> {
        self.in_flight = 0;
        self.keys
            .iter_mut()
            .filter(|(_, state)| state.in_flight)
            .map(|(id, state)| {
                state.in_flight = false;
                id.clone()
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn id(name: &str) -> ObjectId {
        ObjectId::new("ns", name)
    }

    fn queue() -> WorkQueue {
        WorkQueue::new(2, Duration::from_secs(10))
    }

    #[test]
    fn keys_are_deduplicated_while_queued() {
        let mut queue = queue();
        assert_eq!(Enqueued::Queued, queue.add(id("a"), None));
        assert_eq!(Enqueued::AlreadyQueued, queue.add(id("a"), Some(1)));
        assert_eq!(1, queue.len());

        let first = queue.pop().unwrap();
        assert_eq!(id("a"), first.id);
        assert_eq!(1, first.round);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn trigger_during_pass_requeues_after_it_finishes() {
        let mut queue = queue();
        queue.add(id("a"), Some(1));
        let pass = queue.pop().unwrap();

        assert_eq!(Enqueued::MarkedDirty, queue.add(id("a"), None));
        assert!(queue.pop().is_none(), "only one pass per key may be in flight");

        assert_eq!(None, queue.done(&pass.id, pass.round, true));
        let next = queue.pop().unwrap();
        assert_eq!(id("a"), next.id);
        assert_eq!(2, next.round);
    }

    #[test]
    fn concurrency_across_keys_is_bounded() {
        let mut queue = queue();
        queue.add(id("a"), None);
        queue.add(id("b"), None);
        queue.add(id("c"), None);

        let a = queue.pop().unwrap();
        let _b = queue.pop().unwrap();
        assert!(queue.pop().is_none());
        assert_eq!(2, queue.in_flight());

        queue.done(&a.id, a.round, true);
        assert_eq!(id("c"), queue.pop().unwrap().id);
    }

    #[test]
    fn failed_pass_is_retried_with_growing_backoff() {
        let mut queue = WorkQueue::new(1, Duration::from_secs(60));
        queue.add(id("a"), None);

        let pass = queue.pop().unwrap();
        let first_delay = queue.done(&pass.id, pass.round, false).unwrap();
        assert!(first_delay <= Duration::from_millis(150));
        assert!(queue.pop().is_none(), "retry must wait for the timer");

        let mut last_round = pass.round;
        let mut delay = first_delay;
        for _ in 0..9 {
            assert!(queue.retry(&id("a"), last_round));
            let pass = queue.pop().unwrap();
            delay = queue.done(&pass.id, pass.round, false).unwrap();
            last_round = pass.round;
        }
        assert!(delay > first_delay);
        assert!(delay <= Duration::from_secs(60));
    }

    #[test]
    fn backoff_is_reset_after_success() {
        let mut queue = queue();
        for _ in 0..6 {
            queue.add(id("a"), None);
            let pass = queue.pop().unwrap();
            queue.done(&pass.id, pass.round, false);
        }
        queue.add(id("a"), None);
        let pass = queue.pop().unwrap();
        assert_eq!(None, queue.done(&pass.id, pass.round, true));

        queue.add(id("a"), None);
        let pass = queue.pop().unwrap();
        let delay = queue.done(&pass.id, pass.round, false).unwrap();
        assert!(delay <= Duration::from_millis(150));
    }

    #[test]
    fn stale_retry_is_ignored() {
        let mut queue = queue();
        queue.add(id("a"), None);
        let failed = queue.pop().unwrap();
        assert!(queue.done(&failed.id, failed.round, false).is_some());

        // an event starts a newer pass before the retry timer fires
        queue.add(id("a"), None);
        let newer = queue.pop().unwrap();
        queue.done(&newer.id, newer.round, true);

        assert!(!queue.retry(&failed.id, failed.round));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn newer_generation_supersedes_the_in_flight_pass() {
        let mut queue = queue();
        queue.add(id("a"), Some(3));
        let old = queue.pop().unwrap();

        assert_eq!(Enqueued::MarkedDirty, queue.add(id("a"), Some(3)));
        assert_eq!(Enqueued::Superseded, queue.add(id("a"), Some(4)));

        let new = queue.pop().unwrap();
        assert_eq!(old.round + 1, new.round);

        // the aborted pass may still report back, which must not end the new one
        assert_eq!(None, queue.done(&old.id, old.round, false));
        assert_eq!(1, queue.in_flight());
        assert_eq!(None, queue.done(&new.id, new.round, true));
        assert_eq!(0, queue.in_flight());
    }

    #[test]
    fn child_events_never_supersede_a_pass() {
        let mut queue = queue();
        queue.add(id("a"), Some(3));
        queue.pop().unwrap();
        assert_eq!(Enqueued::MarkedDirty, queue.add(id("a"), None));
    }

    #[test]
    fn forget_drops_state_once_the_pass_finishes() {
        let mut queue = queue();
        queue.add(id("a"), None);
        let pass = queue.pop().unwrap();
        queue.add(id("a"), None);

        queue.forget(&pass.id);
        assert_eq!(None, queue.done(&pass.id, pass.round, false));
        assert!(queue.keys.is_empty());
        assert!(queue.pop().is_none());

        queue.add(id("b"), None);
        queue.forget(&id("b"));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn drain_returns_in_flight_keys() {
        let mut queue = queue();
        queue.add(id("a"), None);
        queue.add(id("b"), None);
        queue.pop().unwrap();

        assert_eq!(vec![id("a")], queue.drain_in_flight());
        assert_eq!(0, queue.in_flight());
    }
}
