//! The root container that owns the tree, the worker pool and the registry.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crossbeam_channel::{Receiver, TryRecvError};

use super::node::{Node, Plan};
use super::{Capability, LifecycleState, PrepareContext, Registry};
use crate::error::{Error, Result};

type Outcome = std::result::Result<(), String>;

/// Root of a processing tree. Top-level nodes run in insertion order, so a
/// node may depend on any node added before it.
pub struct Compound {
    name: String,
    roots: Vec<Node>,
    globals: Registry,
    registry: Registry,
    generation: u64,
    state: LifecycleState,
    in_flight: Option<Receiver<Outcome>>,
    pool: Arc<rayon::ThreadPool>,
    lanes: usize,
    ticks: u64,
    faulted: bool,
    disposed: bool,
}

impl Compound {
    /// A compound on a worker pool sized by rayon's defaults.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        Self::with_threads(name, 0)
    }

    /// `threads == 0` lets rayon pick.
    pub fn with_threads(name: impl Into<String>, threads: usize) -> Result<Self> {
        let name = name.into();
        let prefix = name.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |i| format!("{}-worker-{}", prefix, i))
            .build()?;
        log::debug!(
            "compound '{}' started with {} worker threads",
            name,
            pool.current_num_threads()
        );
        Ok(Self {
            name,
            roots: Vec::new(),
            globals: Registry::new(),
            registry: Registry::new(),
            generation: 0,
            state: LifecycleState::Idle,
            in_flight: None,
            pool: Arc::new(pool),
            lanes: 0,
            ticks: 0,
            faulted: false,
            disposed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    /// Completed ticks since construction.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Lanes fanned out by the last prepared tick.
    pub fn lanes(&self) -> usize {
        self.lanes
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Lifecycle state of the unit called `name`.
    pub fn state_of(&self, name: &str) -> Option<LifecycleState> {
        self.roots
            .iter()
            .find_map(|root| root.find_unit(name))
            .map(|unit| unit.state())
    }

    /// Append a top-level node.
    pub fn add(&mut self, node: impl Into<Node>) -> Result<()> {
        self.ensure_editable()?;
        let node = node.into();
        let mut names = Vec::new();
        node.collect_names(&mut names);
        let mut seen = HashSet::new();
        if let Some(dup) = names.iter().find(|n| !seen.insert(**n)) {
            return Err(Error::DuplicateUnit(dup.to_string()));
        }
        for root in &self.roots {
            let mut existing = Vec::new();
            root.collect_names(&mut existing);
            if let Some(dup) = names.iter().find(|n| existing.contains(*n)) {
                return Err(Error::DuplicateUnit(dup.to_string()));
            }
        }
        self.roots.push(node);
        self.topology_changed();
        Ok(())
    }

    /// Detach the node called `name` from anywhere in the tree.
    pub fn remove(&mut self, name: &str) -> Result<Node> {
        self.ensure_editable()?;
        let removed = match self.roots.iter().position(|r| r.name() == name) {
            Some(index) => Some(self.roots.remove(index)),
            None => self.roots.iter_mut().find_map(|r| r.remove(name)),
        };
        let node = removed.ok_or_else(|| Error::UnknownUnit(name.to_string()))?;
        self.topology_changed();
        Ok(node)
    }

    /// Register a compound-wide capability, replacing any previous one.
    pub fn provide<C: Capability>(&mut self, handle: C::Handle) -> Result<()> {
        self.ensure_editable()?;
        self.globals.replace::<C>(handle);
        self.topology_changed();
        Ok(())
    }

    fn ensure_editable(&self) -> Result<()> {
        if self.disposed {
            return Err(Error::Disposed);
        }
        if self.state != LifecycleState::Idle {
            return Err(Error::TickInFlight);
        }
        Ok(())
    }

    fn topology_changed(&mut self) {
        let mut registry = self.globals.clone();
        for root in &self.roots {
            root.register(&mut registry);
        }
        self.registry = registry;
        self.generation += 1;
        if self.faulted {
            log::info!("compound '{}' reconfigured, clearing fault", self.name);
        }
        self.faulted = false;
        log::debug!(
            "compound '{}' topology generation {}",
            self.name,
            self.generation
        );
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.disposed {
            Err(Error::Disposed)
        } else if self.faulted {
            Err(Error::Faulted)
        } else {
            Ok(())
        }
    }

    fn expect(&self, expected: LifecycleState) -> Result<()> {
        if self.state == expected {
            return Ok(());
        }
        Err(match (expected, self.state) {
            (LifecycleState::Idle, LifecycleState::Scheduled) => Error::TickInFlight,
            (LifecycleState::Scheduled, LifecycleState::Idle) => Error::NoTickInFlight,
            _ => Error::Lifecycle {
                unit: self.name.clone(),
                expected,
                found: self.state,
            },
        })
    }

    /// Abort the tick and poison the compound until it is reconfigured.
    fn fault(&mut self, err: Error) -> Error {
        log::error!("compound '{}' faulted: {}", self.name, err);
        for root in &mut self.roots {
            root.abort();
        }
        self.in_flight = None;
        self.state = LifecycleState::Idle;
        if err.is_fatal() {
            self.faulted = true;
        }
        err
    }

    /// Snapshot every unit's pending configuration.
    pub fn lock(&mut self) -> Result<()> {
        self.ensure_usable()?;
        self.expect(LifecycleState::Idle)?;
        for root in &mut self.roots {
            if let Err(err) = root.lock() {
                return Err(self.fault(err));
            }
        }
        self.state = LifecycleState::Locked;
        Ok(())
    }

    /// Resolve dependencies and size outputs. Returns the total lane count.
    pub fn prepare(&mut self) -> Result<usize> {
        self.ensure_usable()?;
        self.expect(LifecycleState::Locked)?;
        let ctx = PrepareContext::new(&self.registry, self.generation);
        let mut lanes = 0;
        let mut failure = None;
        for root in &mut self.roots {
            match root.prepare(&ctx) {
                Ok(n) => lanes += n,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = failure {
            return Err(self.fault(err));
        }
        self.lanes = lanes;
        self.state = LifecycleState::Prepared;
        Ok(lanes)
    }

    /// Hand the prepared tick to the worker pool and return immediately.
    pub fn schedule(&mut self) -> Result<()> {
        self.ensure_usable()?;
        if self.state == LifecycleState::Scheduled {
            return Err(Error::TickInFlight);
        }
        self.expect(LifecycleState::Prepared)?;

        let mut steps = Vec::with_capacity(self.roots.len());
        for root in &mut self.roots {
            match root.schedule() {
                Ok(plan) => steps.push(plan),
                Err(err) => return Err(self.fault(err)),
            }
        }
        let plan = Plan::Sequence(steps);

        let (tx, rx) = crossbeam_channel::bounded(1);
        self.pool.spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| plan.execute()))
                .map_err(|payload| panic_message(payload.as_ref()));
            let _ = tx.send(outcome);
        });

        log::trace!("compound '{}' scheduled {} lanes", self.name, self.lanes);
        self.in_flight = Some(rx);
        self.state = LifecycleState::Scheduled;
        Ok(())
    }

    /// Poll for completion without blocking.
    pub fn try_complete(&mut self) -> Result<bool> {
        if self.state == LifecycleState::Completed {
            return Ok(true);
        }
        self.ensure_usable()?;
        self.expect(LifecycleState::Scheduled)?;
        let outcome = match self.in_flight.as_ref().map(Receiver::try_recv) {
            Some(Ok(outcome)) => outcome,
            Some(Err(TryRecvError::Empty)) => return Ok(false),
            Some(Err(TryRecvError::Disconnected)) | None => {
                Err("worker dropped the tick".to_string())
            }
        };
        self.finish(outcome)?;
        Ok(true)
    }

    /// Block until every lane of the scheduled tick has finished.
    pub fn complete(&mut self) -> Result<()> {
        if self.state == LifecycleState::Completed {
            return Ok(());
        }
        self.ensure_usable()?;
        self.expect(LifecycleState::Scheduled)?;
        let outcome = match self.in_flight.as_ref().map(Receiver::recv) {
            Some(Ok(outcome)) => outcome,
            Some(Err(_)) | None => Err("worker dropped the tick".to_string()),
        };
        self.finish(outcome)
    }

    fn finish(&mut self, outcome: Outcome) -> Result<()> {
        self.in_flight = None;
        if let Err(message) = outcome {
            return Err(self.fault(Error::WorkerPanicked(message)));
        }
        for root in &mut self.roots {
            if let Err(err) = root.complete() {
                return Err(self.fault(err));
            }
        }
        self.state = LifecycleState::Completed;
        Ok(())
    }

    /// Single-threaded post-processing, in tree order.
    pub fn apply(&mut self) -> Result<()> {
        self.ensure_usable()?;
        self.expect(LifecycleState::Completed)?;
        for root in &mut self.roots {
            if let Err(err) = root.apply() {
                return Err(self.fault(err));
            }
        }
        self.state = LifecycleState::Applied;
        Ok(())
    }

    pub fn unlock(&mut self) -> Result<()> {
        self.ensure_usable()?;
        self.expect(LifecycleState::Applied)?;
        for root in &mut self.roots {
            if let Err(err) = root.unlock() {
                return Err(self.fault(err));
            }
        }
        self.state = LifecycleState::Idle;
        self.ticks += 1;
        Ok(())
    }

    /// Lock, prepare and schedule in one call.
    pub fn begin(&mut self) -> Result<()> {
        self.lock()?;
        self.prepare()?;
        self.schedule()
    }

    /// Wait for the scheduled tick, then apply and unlock it.
    pub fn finish_tick(&mut self) -> Result<()> {
        self.complete()?;
        self.apply()?;
        self.unlock()
    }

    /// Run a whole tick synchronously on the calling thread's behalf.
    pub fn run(&mut self) -> Result<()> {
        self.begin()?;
        self.finish_tick()
    }

    /// Wait out any in-flight tick and release every unit's buffers.
    pub fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Err(Error::Disposed);
        }
        if let Some(rx) = self.in_flight.take() {
            match rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(message)) => {
                    log::warn!("compound '{}': drained tick panicked: {}", self.name, message)
                }
                Err(_) => log::warn!("compound '{}': drained tick never reported", self.name),
            }
        }
        for root in &mut self.roots {
            root.abort();
            root.dispose();
        }
        self.roots.clear();
        self.registry.clear();
        self.globals.clear();
        self.state = LifecycleState::Idle;
        self.disposed = true;
        log::debug!("compound '{}' disposed after {} ticks", self.name, self.ticks);
        Ok(())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::pipeline::{Chain, Dependency, Group, Job, Processor};

    struct Counter;

    impl Capability for Counter {
        type Handle = Arc<AtomicUsize>;
        const NAME: &'static str = "counter";
    }

    /// Provides a counter, bumps it once per lane.
    struct Producer {
        name: String,
        counter: Arc<AtomicUsize>,
        lanes: usize,
    }

    impl Producer {
        fn new(name: &str, lanes: usize) -> Self {
            Self {
                name: name.to_string(),
                counter: Arc::new(AtomicUsize::new(0)),
                lanes,
            }
        }
    }

    impl Processor for Producer {
        fn name(&self) -> &str {
            &self.name
        }

        fn register(&self, registry: &mut Registry) {
            registry.provide::<Counter>(self.counter.clone());
        }

        fn prepare(&mut self, _ctx: &PrepareContext<'_>) -> Result<Job> {
            let counter = self.counter.clone();
            let lanes = self.lanes;
            Ok(Job::parallel(lanes, move || {
                let mut slots = vec![0u8; lanes];
                crate::pipeline::fan_out(&mut slots, |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }))
        }
    }

    /// Records lifecycle calls and reads the counter after the producer ran.
    struct Observer {
        name: String,
        counter: Dependency<Counter>,
        seen: Arc<Mutex<Vec<usize>>>,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Observer {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                counter: Dependency::new(),
                seen: Arc::new(Mutex::new(Vec::new())),
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl Processor for Observer {
        fn name(&self) -> &str {
            &self.name
        }

        fn lock(&mut self) {
            self.calls.lock().push("lock");
        }

        fn prepare(&mut self, ctx: &PrepareContext<'_>) -> Result<Job> {
            self.calls.lock().push("prepare");
            let counter = self.counter.resolve(&self.name, ctx)?;
            let seen = self.seen.clone();
            Ok(Job::single(move || {
                seen.lock().push(counter.load(Ordering::SeqCst));
            }))
        }

        fn apply(&mut self) {
            self.calls.lock().push("apply");
        }

        fn unlock(&mut self) {
            self.calls.lock().push("unlock");
        }
    }

    struct Panicker;

    impl Processor for Panicker {
        fn name(&self) -> &str {
            "panicker"
        }

        fn prepare(&mut self, _ctx: &PrepareContext<'_>) -> Result<Job> {
            Ok(Job::single(|| panic!("lane exploded")))
        }
    }

    fn compound() -> Compound {
        Compound::with_threads("test", 2).unwrap()
    }

    #[test]
    fn chain_runs_members_in_order() {
        let observer = Observer::new("observer");
        let seen = observer.seen.clone();
        let mut compound = compound();
        compound
            .add(
                Chain::new("chain")
                    .with(Node::unit(Producer::new("producer", 8)))
                    .with(Node::unit(observer)),
            )
            .unwrap();

        compound.run().unwrap();
        compound.run().unwrap();
        assert_eq!(*seen.lock(), vec![8, 16]);
        assert_eq!(compound.ticks(), 2);
        assert_eq!(compound.lanes(), 9);
    }

    #[test]
    fn lifecycle_calls_form_complete_cycles() {
        let observer = Observer::new("observer");
        let calls = observer.calls.clone();
        let mut compound = compound();
        compound.add(Node::unit(Producer::new("producer", 1))).unwrap();
        compound.add(Node::unit(observer)).unwrap();

        for _ in 0..3 {
            assert_eq!(compound.state_of("observer"), Some(LifecycleState::Idle));
            compound.lock().unwrap();
            assert_eq!(compound.state_of("observer"), Some(LifecycleState::Locked));
            compound.prepare().unwrap();
            assert_eq!(compound.state_of("observer"), Some(LifecycleState::Prepared));
            compound.schedule().unwrap();
            assert_eq!(compound.state_of("observer"), Some(LifecycleState::Scheduled));
            compound.complete().unwrap();
            assert_eq!(compound.state_of("observer"), Some(LifecycleState::Completed));
            compound.apply().unwrap();
            assert_eq!(compound.state_of("observer"), Some(LifecycleState::Applied));
            compound.unlock().unwrap();
        }

        let calls = calls.lock();
        assert_eq!(calls.len(), 12);
        for cycle in calls.chunks(4) {
            assert_eq!(cycle, &["lock", "prepare", "apply", "unlock"]);
        }
    }

    #[test]
    fn try_complete_eventually_reports_done() {
        let mut compound = compound();
        compound.add(Node::unit(Producer::new("producer", 64))).unwrap();
        compound.begin().unwrap();
        while !compound.try_complete().unwrap() {
            std::thread::yield_now();
        }
        compound.apply().unwrap();
        compound.unlock().unwrap();
        assert_eq!(compound.state(), LifecycleState::Idle);
    }

    #[test]
    fn scheduling_twice_is_rejected() {
        let mut compound = compound();
        compound.add(Node::unit(Producer::new("producer", 4))).unwrap();
        compound.begin().unwrap();
        assert!(matches!(compound.schedule(), Err(Error::TickInFlight)));
        assert!(matches!(compound.lock(), Err(Error::TickInFlight)));
        assert!(!compound.is_faulted());
        compound.finish_tick().unwrap();
        assert!(matches!(compound.complete(), Err(Error::NoTickInFlight)));
        assert!(!compound.is_faulted());
        compound.run().unwrap();
        assert_eq!(compound.ticks(), 2);
    }

    #[test]
    fn missing_dependency_faults_until_reconfigured() {
        let mut compound = compound();
        compound.add(Node::unit(Observer::new("observer"))).unwrap();

        let err = compound.run().unwrap_err();
        assert!(matches!(err, Error::MissingDependency { .. }));
        assert!(compound.is_faulted());
        assert!(matches!(compound.run(), Err(Error::Faulted)));
        assert_eq!(compound.state_of("observer"), Some(LifecycleState::Idle));

        // Adding a producer clears the fault and the observer re-resolves.
        compound.remove("observer").unwrap();
        compound.add(Node::unit(Producer::new("producer", 2))).unwrap();
        compound.add(Node::unit(Observer::new("observer"))).unwrap();
        compound.run().unwrap();
    }

    #[test]
    fn cross_branch_lookup_finds_producer_in_other_root() {
        let observer = Observer::new("observer");
        let seen = observer.seen.clone();
        let mut compound = compound();
        compound
            .add(Chain::new("left").with(Node::unit(Producer::new("producer", 3))))
            .unwrap();
        compound.add(Group::new("right").with(Node::unit(observer))).unwrap();
        compound.run().unwrap();
        assert_eq!(*seen.lock(), vec![3]);
    }

    #[test]
    fn group_members_all_run() {
        let a = Observer::new("a");
        let b = Observer::new("b");
        let (seen_a, seen_b) = (a.seen.clone(), b.seen.clone());
        let mut compound = compound();
        compound.add(Node::unit(Producer::new("producer", 5))).unwrap();
        compound
            .add(Group::new("group").with(Node::unit(a)).with(Node::unit(b)))
            .unwrap();
        compound.run().unwrap();
        assert_eq!(*seen_a.lock(), vec![5]);
        assert_eq!(*seen_b.lock(), vec![5]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut compound = compound();
        compound.add(Node::unit(Producer::new("producer", 1))).unwrap();
        let err = compound
            .add(Chain::new("c").with(Node::unit(Producer::new("producer", 1))))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateUnit(name) if name == "producer"));
    }

    #[test]
    fn duplicate_names_inside_one_node_are_rejected() {
        let mut compound = compound();
        let err = compound
            .add(
                Group::new("pair")
                    .with(Node::unit(Producer::new("same", 1)))
                    .with(Node::unit(Producer::new("same", 1))),
            )
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateUnit(name) if name == "same"));
        assert_eq!(compound.state_of("same"), None);
        assert_eq!(compound.generation(), 0);
    }

    #[test]
    fn remove_bumps_generation() {
        let mut compound = compound();
        compound
            .add(Chain::new("chain").with(Node::unit(Producer::new("producer", 1))))
            .unwrap();
        let before = compound.generation();
        compound.remove("producer").unwrap();
        assert!(compound.generation() > before);
        assert_eq!(compound.registry().count::<Counter>(), 0);
        assert!(matches!(compound.remove("producer"), Err(Error::UnknownUnit(_))));
    }

    #[test]
    fn worker_panic_is_reported() {
        let mut compound = compound();
        compound.add(Node::unit(Panicker)).unwrap();
        match compound.run() {
            Err(Error::WorkerPanicked(message)) => assert!(message.contains("lane exploded")),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(compound.state(), LifecycleState::Idle);
    }

    #[test]
    fn dispose_is_terminal() {
        let mut compound = compound();
        compound.add(Node::unit(Producer::new("producer", 1))).unwrap();
        compound.begin().unwrap();
        compound.dispose().unwrap();
        assert!(matches!(compound.run(), Err(Error::Disposed)));
        assert!(matches!(compound.dispose(), Err(Error::Disposed)));
    }

    #[test]
    fn dispose_drains_a_panicked_tick() {
        let mut compound = compound();
        compound.add(Node::unit(Panicker)).unwrap();
        compound.begin().unwrap();
        compound.dispose().unwrap();
        assert_eq!(compound.state(), LifecycleState::Idle);
        assert!(matches!(compound.begin(), Err(Error::Disposed)));
    }
}
