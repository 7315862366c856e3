//! Clocks
//!
//! A clock is the discrete time source of a graph. Every sink compares the
//! timestamp of its last update with the clock it is attached to, and only
//! runs again once the clock has moved on.
//!
//! # Kinds
//!
//! - An *invariable* clock runs at a rate that only changes when set
//!   explicitly. Audio is the typical example: samples are produced in
//!   bursts, but every sample stands for the same slice of time.
//! - A *variable* clock measures the wall-clock time between two ticks and
//!   derives its rate from it, like the frame rate of a render loop. It can
//!   be capped with a maximal rate, in which case `tick` sleeps until the
//!   minimal period has passed.
//!
//! # Thread Safety
//!
//! Clocks are shared as `Arc<Clock>`. The persistent-sink set is the one
//! structure that may be touched from another thread while the owning
//! thread ticks, so it sits behind a lock.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexSet;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::graph::{Graph, NodeId};

/// A discrete point in time of a clock.
pub type Timestamp = u64;

/// Unique identifier for a clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClockId(u64);

impl ClockId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "clock#{}", self.0)
    }
}

#[derive(Debug)]
enum Pace {
    Invariable {
        rate: f32,
    },
    Variable {
        rate: f32,
        maximal: Option<f32>,
        last: Instant,
    },
}

/// A discrete time source.
#[derive(Debug)]
pub struct Clock {
    id: ClockId,

    /// Number of ticks so far.
    now: AtomicU64,

    pace: Mutex<Pace>,

    /// Sinks updated on every tick, in registration order.
    persistent: Mutex<IndexSet<NodeId>>,
}

impl Clock {
    fn with_pace(pace: Pace) -> Arc<Self> {
        Arc::new(Self {
            id: ClockId::new(),
            now: AtomicU64::new(0),
            pace: Mutex::new(pace),
            persistent: Mutex::new(IndexSet::new()),
        })
    }

    /// Create a clock running at a fixed rate (in Hertz).
    pub fn invariable(rate: f32) -> Arc<Self> {
        Self::with_pace(Pace::Invariable { rate })
    }

    /// Create a clock whose rate follows the time elapsed between ticks.
    ///
    /// `starting_rate` is reported until the first tick.
    pub fn variable(starting_rate: f32) -> Arc<Self> {
        Self::with_pace(Pace::Variable {
            rate: starting_rate,
            maximal: None,
            last: Instant::now(),
        })
    }

    /// Get the clock's unique ID.
    pub fn id(&self) -> ClockId {
        self.id
    }

    /// The current time index.
    pub fn now(&self) -> Timestamp {
        self.now.load(Ordering::Acquire)
    }

    /// The rate at which the clock runs, in Hertz.
    pub fn rate(&self) -> f32 {
        match *self.pace.lock() {
            Pace::Invariable { rate } | Pace::Variable { rate, .. } => rate,
        }
    }

    /// The time between two ticks, in seconds.
    pub fn delta(&self) -> f32 {
        1.0 / self.rate()
    }

    /// Does this clock derive its rate from wall-clock time?
    pub fn is_variable(&self) -> bool {
        matches!(*self.pace.lock(), Pace::Variable { .. })
    }

    /// Change the rate of an invariable clock.
    pub fn set_rate(&self, rate: f32) -> Result<()> {
        match &mut *self.pace.lock() {
            Pace::Invariable { rate: current } => {
                *current = rate;
                Ok(())
            }
            Pace::Variable { .. } => Err(Error::VariableRate(self.id)),
        }
    }

    /// The rate a variable clock will not exceed, if any.
    pub fn maximal_rate(&self) -> Option<f32> {
        match *self.pace.lock() {
            Pace::Invariable { .. } => None,
            Pace::Variable { maximal, .. } => maximal,
        }
    }

    /// Cap (or uncap, with `None`) the rate of a variable clock.
    ///
    /// Rates that are not positive uncap the clock as well. A rate whose
    /// period does not fit a [`Duration`] is refused with
    /// [`Error::RateOutOfRange`].
    pub fn set_maximal_rate(&self, rate: Option<f32>) -> Result<()> {
        match &mut *self.pace.lock() {
            Pace::Invariable { .. } => Err(Error::FixedRate(self.id)),
            Pace::Variable { maximal, .. } => {
                let rate = rate.filter(|rate| *rate > 0.0);
                if rate.is_some_and(|rate| minimal_period(rate).is_none()) {
                    return Err(Error::RateOutOfRange(self.id));
                }
                *maximal = rate;
                Ok(())
            }
        }
    }

    /// Move the clock forward and update its persistent sinks in `graph`.
    ///
    /// Every signal attached to this clock will generate a new sample the
    /// next time it is pulled. Persistent sinks are updated right away, in
    /// registration order, from a snapshot of the set; sinks that belong to
    /// another graph are skipped. A failing sink does not stop the others,
    /// the first failure is returned once all were visited.
    pub fn tick(&self, graph: &mut Graph) -> Result<Timestamp> {
        let now = self.advance();

        let snapshot: Vec<NodeId> = self.persistent.lock().iter().copied().collect();
        let mut first_error = None;
        for sink in snapshot {
            if !graph.contains(sink) {
                trace!(clock = %self.id, %sink, "persistent sink not in this graph");
                continue;
            }
            if let Err(error) = graph.update(sink) {
                warn!(clock = %self.id, %sink, %error, "persistent sink failed to update");
                first_error.get_or_insert(error);
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(now),
        }
    }

    /// Advance the time index by one and recompute a variable rate.
    pub(crate) fn advance(&self) -> Timestamp {
        let wait = match &*self.pace.lock() {
            Pace::Variable {
                maximal: Some(maximal),
                last,
                ..
            } => minimal_period(*maximal).and_then(|period| period.checked_sub(last.elapsed())),
            _ => None,
        };
        if let Some(wait) = wait {
            std::thread::sleep(wait);
        }

        if let Pace::Variable { rate, last, .. } = &mut *self.pace.lock() {
            let now = Instant::now();
            let elapsed = now.duration_since(*last).as_secs_f64();
            if elapsed > 0.0 {
                *rate = (1.0 / elapsed) as f32;
            }
            *last = now;
        }

        self.now.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Register a sink to be updated on every tick.
    ///
    /// Returns `false` if it already was. This does not notify the sink's
    /// listeners; [`Graph::set_persistency`] does.
    pub fn add_persistent_sink(&self, sink: NodeId) -> bool {
        let added = self.persistent.lock().insert(sink);
        if added {
            debug!(clock = %self.id, %sink, "sink made persistent");
        }
        added
    }

    /// Stop updating a sink on every tick.
    ///
    /// Returns `false` if it was not persistent.
    pub fn remove_persistent_sink(&self, sink: NodeId) -> bool {
        let removed = self.persistent.lock().shift_remove(&sink);
        if removed {
            debug!(clock = %self.id, %sink, "sink no longer persistent");
        }
        removed
    }

    /// Is the sink updated on every tick of this clock?
    pub fn is_sink_persistent(&self, sink: NodeId) -> bool {
        self.persistent.lock().contains(&sink)
    }

    /// The persistent sinks, in registration order.
    pub fn persistent_sinks(&self) -> Vec<NodeId> {
        self.persistent.lock().iter().copied().collect()
    }
}

/// The shortest time between two ticks of a clock capped at `rate`.
fn minimal_period(rate: f32) -> Option<Duration> {
    Duration::try_from_secs_f64(1.0 / f64::from(rate)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_advances_by_one() {
        let clock = Clock::invariable(44100.0);
        let mut graph = Graph::new();
        assert_eq!(clock.now(), 0);

        assert_eq!(clock.tick(&mut graph), Ok(1));
        assert_eq!(clock.tick(&mut graph), Ok(2));
        assert_eq!(clock.now(), 2);
    }

    #[test]
    fn invariable_rate_and_delta() {
        let clock = Clock::invariable(50.0);
        assert_eq!(clock.rate(), 50.0);
        assert!((clock.delta() - 0.02).abs() < f32::EPSILON);

        clock.set_rate(100.0).unwrap();
        assert_eq!(clock.rate(), 100.0);
        assert!(!clock.is_variable());
        assert_eq!(clock.set_maximal_rate(Some(10.0)), Err(Error::FixedRate(clock.id())));
    }

    #[test]
    fn variable_rate_follows_elapsed_time() {
        let clock = Clock::variable(60.0);
        assert_eq!(clock.rate(), 60.0);
        assert_eq!(clock.set_rate(30.0), Err(Error::VariableRate(clock.id())));

        std::thread::sleep(Duration::from_millis(20));
        clock.advance();

        // At least 20ms passed, so the rate can't be above 50Hz.
        assert!(clock.rate() <= 50.0);
        assert!(clock.rate() > 0.0);
    }

    #[test]
    fn maximal_rate_caps_ticks() {
        let clock = Clock::variable(1000.0);
        clock.set_maximal_rate(Some(100.0)).unwrap();
        assert_eq!(clock.maximal_rate(), Some(100.0));

        let start = Instant::now();
        clock.advance();
        clock.advance();
        clock.advance();

        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(clock.rate() <= 100.5);
    }

    #[test]
    fn unreachable_maximal_rate_is_refused() {
        let clock = Clock::variable(60.0);
        clock.set_maximal_rate(Some(100.0)).unwrap();

        assert_eq!(
            clock.set_maximal_rate(Some(1e-30)),
            Err(Error::RateOutOfRange(clock.id()))
        );
        assert_eq!(clock.maximal_rate(), Some(100.0));

        clock.set_maximal_rate(Some(0.0)).unwrap();
        assert_eq!(clock.maximal_rate(), None);
        assert_eq!(clock.tick(&mut Graph::new()), Ok(1));
    }

    #[test]
    fn persistent_set_keeps_registration_order() {
        let clock = Clock::invariable(1.0);
        let (a, b, c) = (NodeId::new(), NodeId::new(), NodeId::new());

        assert!(clock.add_persistent_sink(b));
        assert!(clock.add_persistent_sink(a));
        assert!(clock.add_persistent_sink(c));
        assert!(!clock.add_persistent_sink(a));
        assert_eq!(clock.persistent_sinks(), vec![b, a, c]);

        assert!(clock.remove_persistent_sink(a));
        assert!(!clock.remove_persistent_sink(a));
        assert!(!clock.is_sink_persistent(a));
        assert_eq!(clock.persistent_sinks(), vec![b, c]);
    }

    #[test]
    fn clock_ids_are_unique() {
        let c1 = Clock::invariable(1.0);
        let c2 = Clock::invariable(1.0);
        assert_ne!(c1.id(), c2.id());
    }
}
