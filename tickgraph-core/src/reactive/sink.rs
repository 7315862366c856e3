//! Sink Protocol
//!
//! A sink is anything that can be told to catch up with a clock. It keeps
//! the timestamp of its last update and only reruns its hook once the clock
//! has moved past it. Signals and values are sinks too; this module holds
//! the bookkeeping they all share.
//!
//! # Update Rules
//!
//! 1. An attached sink that already ran at the clock's current time index
//!    does nothing.
//! 2. Otherwise it records the time index and runs its hook.
//! 3. An unattached sink runs its hook on every update ("free-running").
//!
//! # Listeners
//!
//! Listeners hear about clock and persistency changes. Notification walks a
//! snapshot of the listener list, so a listener may add or remove listeners
//! (itself included) while being notified.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, trace};

use crate::clock::{Clock, Timestamp};
use crate::error::{Error, Result};
use crate::graph::{Graph, NodeBody, NodeId, NodeKind, Slot};

use super::context::Context;

/// A node that updates with a clock but produces no output.
///
/// Typical sinks are side-effecting stages, e.g. the stage handing samples
/// to an audio device. Make them persistent to have them run on every tick
/// even though nothing pulls them.
pub trait Sink: Send + 'static {
    /// Bring the sink up to date with its clock.
    fn on_update(&mut self, cx: &mut Context<'_>) -> Result<()>;

    /// The sink was attached to another clock (or detached).
    fn clock_changed(&mut self, _clock: Option<&Arc<Clock>>) {}
}

/// Observer of a sink's clock and persistency.
///
/// Listeners receive the graph so they can react structurally, including
/// adding or removing listeners while being notified.
pub trait SinkListener: Send + Sync {
    /// The sink was attached to another clock (or detached, with `None`).
    fn clock_changed(&self, _graph: &mut Graph, _sink: NodeId, _clock: Option<&Arc<Clock>>) {}

    /// The sink became persistent or stopped being so.
    fn persistency_changed(&self, _graph: &mut Graph, _sink: NodeId, _persistent: bool) {}
}

/// Handle returned when registering a listener, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Clock bookkeeping shared by every node.
pub(crate) struct SinkState {
    pub(crate) clock: Option<Arc<Clock>>,

    /// Time index of the last update.
    pub(crate) timestamp: Timestamp,

    /// Has the first update happened yet?
    pub(crate) started: bool,

    pub(crate) listeners: Vec<(ListenerId, Arc<dyn SinkListener>)>,
}

impl SinkState {
    pub(crate) fn new(clock: Option<&Arc<Clock>>) -> Self {
        Self {
            clock: clock.cloned(),
            timestamp: clock.map_or(0, |clock| clock.now()),
            started: false,
            listeners: Vec::new(),
        }
    }

    /// Decide whether the hook must run, and record the update if so.
    pub(crate) fn begin_update(&mut self) -> bool {
        if let Some(clock) = &self.clock {
            let now = clock.now();
            if self.started && self.timestamp >= now {
                return false;
            }
            self.timestamp = now;
        }
        self.started = true;
        true
    }

    /// Force the hook to run on the next update, even within the same tick.
    pub(crate) fn invalidate(&mut self) {
        self.started = false;
    }

    pub(crate) fn is_persistent(&self, id: NodeId) -> bool {
        self.clock
            .as_ref()
            .is_some_and(|clock| clock.is_sink_persistent(id))
    }
}

pub(crate) fn same_clock(a: Option<&Arc<Clock>>, b: Option<&Arc<Clock>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

/// The clock a set of inputs runs at. Unattached inputs go with any clock.
pub(crate) fn shared_clock<'a>(
    clocks: impl IntoIterator<Item = Option<&'a Arc<Clock>>>,
) -> Result<Option<Arc<Clock>>> {
    let mut shared: Option<&Arc<Clock>> = None;
    for clock in clocks.into_iter().flatten() {
        match shared {
            Some(current) if !Arc::ptr_eq(current, clock) => {
                return Err(Error::ClockMismatch {
                    left: current.id(),
                    right: clock.id(),
                });
            }
            Some(_) => {}
            None => shared = Some(clock),
        }
    }
    Ok(shared.cloned())
}

/// Nodes to move to another clock, in the order they were reached.
pub(crate) type ClockPlan = IndexMap<NodeId, Option<Arc<Clock>>>;

struct SinkBody<K>(K);

impl<K: Sink> NodeBody for SinkBody<K> {
    fn run(&mut self, cx: &mut Context<'_>) -> Result<()> {
        self.0.on_update(cx)
    }

    fn clock_changed(&mut self, clock: Option<&Arc<Clock>>) {
        self.0.clock_changed(clock);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Graph {
    /// Add a plain sink, optionally attached to a clock.
    pub fn insert_sink<K: Sink>(&mut self, clock: Option<&Arc<Clock>>, sink: K) -> NodeId {
        self.insert_slot(Slot::new(NodeKind::Sink, clock, Box::new(SinkBody(sink))))
    }

    /// Borrow the state of a sink inserted with [`Graph::insert_sink`].
    pub fn sink_ref<K: Sink>(&self, node: NodeId) -> Result<&K> {
        self.body_ref::<SinkBody<K>>(node, std::any::type_name::<K>())
            .map(|body| &body.0)
    }

    /// Mutably borrow the state of a sink inserted with [`Graph::insert_sink`].
    pub fn sink_mut<K: Sink>(&mut self, node: NodeId) -> Result<&mut K> {
        self.body_mut::<SinkBody<K>>(node, std::any::type_name::<K>())
            .map(|body| &mut body.0)
    }

    /// Make sure the node is up to date with its clock.
    ///
    /// Runs the node's hook at most once per tick. A node whose hook is
    /// already running further up the stack (a feedback loop) is left
    /// alone, and its previous sample is what gets read.
    pub fn update(&mut self, node: impl Into<NodeId>) -> Result<()> {
        let id = node.into();
        let slot = self.slot_mut(id)?;
        if !slot.sink.begin_update() {
            return Ok(());
        }
        let Some(mut body) = slot.body.take() else {
            trace!(node = %id, "reentrant update, serving previous sample");
            return Ok(());
        };

        trace!(node = %id, "running update hook");
        let result = body.run(&mut Context::new(self, id));

        if let Some(slot) = self.nodes.get_mut(&id) {
            slot.body = Some(body);
            if result.is_err() {
                // Retry on the next pull instead of serving a half-made sample.
                slot.sink.invalidate();
            }
        }
        result
    }

    /// The clock the node runs at, if any.
    pub fn clock(&self, node: impl Into<NodeId>) -> Result<Option<Arc<Clock>>> {
        Ok(self.slot(node.into())?.sink.clock.clone())
    }

    /// Attach the node to another clock, or detach it with `None`.
    ///
    /// A persistent node stays persistent on the new clock. Detaching a
    /// persistent node ends its persistency, which listeners are told about.
    ///
    /// The values referencing or owning the node move along, and so do the
    /// operators they feed. The change is refused with
    /// [`Error::ClockMismatch`] when one of those operators would end up
    /// with inputs on two clocks, or when the node itself is a value or
    /// operator whose inputs run at another clock. Detaching such a node
    /// fails with [`Error::ClockFollowsInputs`].
    pub fn set_clock(&mut self, node: impl Into<NodeId>, clock: Option<&Arc<Clock>>) -> Result<()> {
        let id = node.into();
        let slot = self.slot(id)?;
        if same_clock(slot.sink.clock.as_ref(), clock) {
            return Ok(());
        }

        let inputs: Vec<NodeId> = match slot.body.as_ref().and_then(|body| body.as_value()) {
            Some(value) => value.target().into_iter().collect(),
            None => slot.children.to_vec(),
        };
        let followed = shared_clock(
            inputs
                .iter()
                .map(|input| self.nodes.get(input).and_then(|slot| slot.sink.clock.as_ref())),
        )?;
        match (followed, clock) {
            (Some(followed), Some(clock)) if !Arc::ptr_eq(&followed, clock) => {
                return Err(Error::ClockMismatch {
                    left: followed.id(),
                    right: clock.id(),
                });
            }
            (Some(followed), None) => {
                return Err(Error::ClockFollowsInputs {
                    node: id,
                    clock: followed.id(),
                });
            }
            _ => {}
        }

        let plan = self.plan_clock(id, clock.cloned())?;
        self.apply_clock_plan(plan);
        Ok(())
    }

    /// Work out which nodes move when `origin` moves to `clock`.
    ///
    /// Values follow the node they reference or own, operators follow the
    /// clock their inputs share and keep theirs while all inputs are
    /// unattached. Fails without touching anything when an operator would
    /// end up with inputs on two clocks.
    pub(crate) fn plan_clock(&self, origin: NodeId, clock: Option<Arc<Clock>>) -> Result<ClockPlan> {
        let mut plan = ClockPlan::new();
        plan.insert(origin, clock);
        let mut pending = vec![origin];

        while let Some(id) = pending.pop() {
            let Some(slot) = self.nodes.get(&id) else {
                continue;
            };
            let clock = plan.get(&id).cloned().flatten();
            for consumer in slot.dependents.iter().copied().chain(slot.owner) {
                let Some(consumer_slot) = self.nodes.get(&consumer) else {
                    continue;
                };
                let next = if consumer_slot.kind == NodeKind::Value {
                    clock.clone()
                } else {
                    let inputs = consumer_slot
                        .children
                        .iter()
                        .map(|child| self.planned_clock(&plan, *child));
                    shared_clock(inputs)?.or_else(|| consumer_slot.sink.clock.clone())
                };
                if !same_clock(self.planned_clock(&plan, consumer), next.as_ref()) {
                    plan.insert(consumer, next);
                    pending.push(consumer);
                }
            }
        }
        Ok(plan)
    }

    fn planned_clock<'a>(&'a self, plan: &'a ClockPlan, id: NodeId) -> Option<&'a Arc<Clock>> {
        match plan.get(&id) {
            Some(clock) => clock.as_ref(),
            None => self.nodes.get(&id).and_then(|slot| slot.sink.clock.as_ref()),
        }
    }

    /// Move every node of the plan, skipping nodes removed in the meantime.
    pub(crate) fn apply_clock_plan(&mut self, plan: ClockPlan) {
        for (id, clock) in plan {
            self.attach_clock(id, clock.as_ref());
        }
    }

    fn attach_clock(&mut self, id: NodeId, clock: Option<&Arc<Clock>>) {
        let Some(slot) = self.nodes.get_mut(&id) else {
            return;
        };
        if same_clock(slot.sink.clock.as_ref(), clock) {
            return;
        }

        let persistent = slot.sink.is_persistent(id);
        if persistent {
            if let Some(old) = &slot.sink.clock {
                old.remove_persistent_sink(id);
            }
        }

        slot.sink.clock = clock.cloned();
        if let Some(clock) = clock {
            slot.sink.timestamp = clock.now();
            if persistent {
                clock.add_persistent_sink(id);
            }
        }
        if let Some(body) = slot.body.as_mut() {
            body.clock_changed(clock);
        }
        debug!(node = %id, clock = ?clock.map(|clock| clock.id()), "clock changed");

        if persistent && clock.is_none() {
            self.notify_sink_listeners(id, |listener, graph| {
                listener.persistency_changed(graph, id, false)
            });
        }
        self.notify_sink_listeners(id, |listener, graph| listener.clock_changed(graph, id, clock));
    }

    /// Have the node update on every tick of its clock, pulled or not.
    ///
    /// Fails with [`Error::Unattached`] when the node has no clock. Setting
    /// the state the node is already in does nothing.
    pub fn set_persistency(&mut self, node: impl Into<NodeId>, persistent: bool) -> Result<()> {
        let id = node.into();
        let Some(clock) = self.slot(id)?.sink.clock.clone() else {
            return Err(Error::Unattached(id));
        };

        let changed = if persistent {
            clock.add_persistent_sink(id)
        } else {
            clock.remove_persistent_sink(id)
        };
        if changed {
            self.notify_sink_listeners(id, |listener, graph| {
                listener.persistency_changed(graph, id, persistent)
            });
        }
        Ok(())
    }

    /// Is the node updated on every tick of its clock?
    pub fn is_persistent(&self, node: impl Into<NodeId>) -> Result<bool> {
        let id = node.into();
        Ok(self.slot(id)?.sink.is_persistent(id))
    }

    /// Register a listener for the node's clock and persistency changes.
    pub fn add_sink_listener(
        &mut self,
        node: impl Into<NodeId>,
        listener: Arc<dyn SinkListener>,
    ) -> Result<ListenerId> {
        let listener_id = ListenerId::new();
        self.slot_mut(node.into())?
            .sink
            .listeners
            .push((listener_id, listener));
        Ok(listener_id)
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn remove_sink_listener(&mut self, node: impl Into<NodeId>, listener: ListenerId) -> Result<bool> {
        let listeners = &mut self.slot_mut(node.into())?.sink.listeners;
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != listener);
        Ok(listeners.len() != before)
    }

    /// Number of listeners registered on the node.
    pub fn sink_listener_count(&self, node: impl Into<NodeId>) -> Result<usize> {
        Ok(self.slot(node.into())?.sink.listeners.len())
    }

    fn notify_sink_listeners(&mut self, id: NodeId, notify: impl Fn(&dyn SinkListener, &mut Graph)) {
        let Some(slot) = self.nodes.get(&id) else {
            return;
        };
        let snapshot: Vec<Arc<dyn SinkListener>> = slot
            .sink
            .listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            notify(listener.as_ref(), self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    struct Counter(Arc<AtomicUsize>);

    impl Sink for Counter {
        fn on_update(&mut self, _cx: &mut Context<'_>) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl SinkListener for Recorder {
        fn clock_changed(&self, _graph: &mut Graph, _sink: NodeId, clock: Option<&Arc<Clock>>) {
            self.events
                .lock()
                .push(format!("clock:{}", clock.is_some()));
        }

        fn persistency_changed(&self, _graph: &mut Graph, _sink: NodeId, persistent: bool) {
            self.events.lock().push(format!("persistent:{persistent}"));
        }
    }

    #[test]
    fn update_runs_once_per_tick() {
        let clock = Clock::invariable(10.0);
        let mut graph = Graph::new();
        let count = Arc::new(AtomicUsize::new(0));
        let sink = graph.insert_sink(Some(&clock), Counter(count.clone()));

        graph.update(sink).unwrap();
        graph.update(sink).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        clock.tick(&mut graph).unwrap();
        graph.update(sink).unwrap();
        graph.update(sink).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unattached_sink_is_free_running() {
        let mut graph = Graph::new();
        let count = Arc::new(AtomicUsize::new(0));
        let sink = graph.insert_sink(None, Counter(count.clone()));

        graph.update(sink).unwrap();
        graph.update(sink).unwrap();
        graph.update(sink).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn persistent_sink_updates_on_tick() {
        let clock = Clock::invariable(10.0);
        let mut graph = Graph::new();
        let persistent = Arc::new(AtomicUsize::new(0));
        let lazy = Arc::new(AtomicUsize::new(0));
        let a = graph.insert_sink(Some(&clock), Counter(persistent.clone()));
        graph.insert_sink(Some(&clock), Counter(lazy.clone()));

        graph.set_persistency(a, true).unwrap();
        assert!(graph.is_persistent(a).unwrap());

        clock.tick(&mut graph).unwrap();
        clock.tick(&mut graph).unwrap();
        assert_eq!(persistent.load(Ordering::SeqCst), 2);
        assert_eq!(lazy.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn persistency_requires_a_clock() {
        let mut graph = Graph::new();
        let sink = graph.insert_sink(None, Counter(Arc::default()));
        assert_eq!(graph.set_persistency(sink, true), Err(Error::Unattached(sink)));
        assert!(!graph.is_persistent(sink).unwrap());
    }

    #[test]
    fn persistency_notifies_only_on_change() {
        let clock = Clock::invariable(10.0);
        let mut graph = Graph::new();
        let sink = graph.insert_sink(Some(&clock), Counter(Arc::default()));
        let recorder = Arc::new(Recorder::default());
        graph.add_sink_listener(sink, recorder.clone()).unwrap();

        graph.set_persistency(sink, true).unwrap();
        graph.set_persistency(sink, true).unwrap();
        graph.set_persistency(sink, false).unwrap();
        graph.set_persistency(sink, false).unwrap();

        assert_eq!(
            *recorder.events.lock(),
            vec!["persistent:true".to_string(), "persistent:false".to_string()]
        );
    }

    #[test]
    fn set_clock_moves_persistency() {
        let first = Clock::invariable(10.0);
        let second = Clock::invariable(20.0);
        let mut graph = Graph::new();
        let sink = graph.insert_sink(Some(&first), Counter(Arc::default()));
        graph.set_persistency(sink, true).unwrap();

        let recorder = Arc::new(Recorder::default());
        graph.add_sink_listener(sink, recorder.clone()).unwrap();

        graph.set_clock(sink, Some(&second)).unwrap();
        assert!(!first.is_sink_persistent(sink));
        assert!(second.is_sink_persistent(sink));

        // Same clock again: nothing happens.
        graph.set_clock(sink, Some(&second)).unwrap();

        graph.set_clock(sink, None).unwrap();
        assert!(!second.is_sink_persistent(sink));
        assert!(!graph.is_persistent(sink).unwrap());

        assert_eq!(
            *recorder.events.lock(),
            vec![
                "clock:true".to_string(),
                "persistent:false".to_string(),
                "clock:false".to_string(),
            ]
        );
    }

    struct RemoveSelf {
        id: Mutex<Option<ListenerId>>,
        calls: AtomicUsize,
    }

    impl SinkListener for RemoveSelf {
        fn clock_changed(&self, graph: &mut Graph, sink: NodeId, _clock: Option<&Arc<Clock>>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = self.id.lock().take() {
                graph.remove_sink_listener(sink, id).unwrap();
            }
        }
    }

    #[test]
    fn listeners_may_remove_themselves() {
        let clock = Clock::invariable(10.0);
        let mut graph = Graph::new();
        let sink = graph.insert_sink(None, Counter(Arc::default()));

        let remover = Arc::new(RemoveSelf {
            id: Mutex::new(None),
            calls: AtomicUsize::new(0),
        });
        let recorder = Arc::new(Recorder::default());
        let id = graph.add_sink_listener(sink, remover.clone()).unwrap();
        *remover.id.lock() = Some(id);
        graph.add_sink_listener(sink, recorder.clone()).unwrap();

        graph.set_clock(sink, Some(&clock)).unwrap();
        assert_eq!(remover.calls.load(Ordering::SeqCst), 1);
        // The listener after the remover was still notified.
        assert_eq!(*recorder.events.lock(), vec!["clock:true".to_string()]);
        assert_eq!(graph.sink_listener_count(sink).unwrap(), 1);

        graph.set_clock(sink, None).unwrap();
        assert_eq!(remover.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sink_state_is_reachable() {
        let mut graph = Graph::new();
        let count = Arc::new(AtomicUsize::new(0));
        let sink = graph.insert_sink(None, Counter(count.clone()));
        graph.sink_mut::<Counter>(sink).unwrap().0.fetch_add(5, Ordering::SeqCst);
        assert_eq!(graph.sink_ref::<Counter>(sink).unwrap().0.load(Ordering::SeqCst), 5);
    }
}
