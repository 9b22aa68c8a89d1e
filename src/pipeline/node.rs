//! Units and the containers that compose them.

use super::{Job, LifecycleState, PrepareContext, Processor, Registry};
use crate::error::{Error, Result};

/// One schedulable processor plus its lifecycle bookkeeping.
pub struct Unit {
    processor: Box<dyn Processor>,
    state: LifecycleState,
    job: Option<Job>,
    lanes: usize,
}

impl Unit {
    pub fn new(processor: impl Processor + 'static) -> Self {
        Self {
            processor: Box::new(processor),
            state: LifecycleState::Idle,
            job: None,
            lanes: 0,
        }
    }

    pub fn name(&self) -> &str {
        self.processor.name()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Lane count returned by the last `prepare`.
    pub fn lanes(&self) -> usize {
        self.lanes
    }

    fn expect(&self, expected: LifecycleState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::Lifecycle {
                unit: self.name().to_string(),
                expected,
                found: self.state,
            })
        }
    }

    fn transition(&mut self, next: LifecycleState) {
        log::trace!("{}: {:?} -> {:?}", self.name(), self.state, next);
        self.state = next;
    }

    fn lock(&mut self) -> Result<()> {
        if self.state == LifecycleState::Applied {
            self.unlock()?;
        }
        self.expect(LifecycleState::Idle)?;
        self.processor.lock();
        self.transition(LifecycleState::Locked);
        Ok(())
    }

    fn prepare(&mut self, ctx: &PrepareContext<'_>) -> Result<usize> {
        self.expect(LifecycleState::Locked)?;
        let job = self.processor.prepare(ctx)?;
        self.lanes = job.lanes();
        self.job = Some(job);
        self.transition(LifecycleState::Prepared);
        Ok(self.lanes)
    }

    fn schedule(&mut self) -> Result<Plan> {
        self.expect(LifecycleState::Prepared)?;
        let job = self.job.take().unwrap_or_else(Job::idle);
        self.transition(LifecycleState::Scheduled);
        Ok(Plan::Job(job))
    }

    fn complete(&mut self) -> Result<()> {
        self.expect(LifecycleState::Scheduled)?;
        self.transition(LifecycleState::Completed);
        Ok(())
    }

    fn apply(&mut self) -> Result<()> {
        self.expect(LifecycleState::Completed)?;
        self.processor.apply();
        self.transition(LifecycleState::Applied);
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        self.expect(LifecycleState::Applied)?;
        self.processor.unlock();
        self.transition(LifecycleState::Idle);
        Ok(())
    }

    /// Drop a half-run tick and return to idle.
    fn abort(&mut self) {
        if self.state != LifecycleState::Idle {
            self.job = None;
            self.processor.unlock();
            self.transition(LifecycleState::Idle);
        }
    }

    fn dispose(&mut self) {
        self.job = None;
        self.processor.dispose();
    }
}

/// Ordered members. Member `k + 1` only starts after member `k`'s lanes have
/// all finished.
pub struct Chain {
    name: String,
    members: Vec<Node>,
}

impl Chain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
        }
    }

    pub fn with(mut self, member: impl Into<Node>) -> Self {
        self.members.push(member.into());
        self
    }

    pub fn push(&mut self, member: impl Into<Node>) {
        self.members.push(member.into());
    }
}

/// Unordered siblings that never read each other's outputs. Their lanes are
/// dispatched together.
pub struct Group {
    name: String,
    members: Vec<Node>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
        }
    }

    pub fn with(mut self, member: impl Into<Node>) -> Self {
        self.members.push(member.into());
        self
    }

    pub fn push(&mut self, member: impl Into<Node>) {
        self.members.push(member.into());
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Any element of a compound's tree.
pub enum Node {
    Unit(Unit),
    Chain(Chain),
    Group(Group),
}

impl From<Unit> for Node {
    fn from(unit: Unit) -> Self {
        Node::Unit(unit)
    }
}

impl From<Chain> for Node {
    fn from(chain: Chain) -> Self {
        Node::Chain(chain)
    }
}

impl From<Group> for Node {
    fn from(group: Group) -> Self {
        Node::Group(group)
    }
}

/// Execution tree built at schedule time, mirroring the node tree.
pub(crate) enum Plan {
    Job(Job),
    Sequence(Vec<Plan>),
    Parallel(Vec<Plan>),
}

impl Plan {
    pub(crate) fn execute(self) {
        match self {
            Plan::Job(job) => job.run(),
            Plan::Sequence(steps) => {
                for step in steps {
                    step.execute();
                }
            }
            Plan::Parallel(branches) => rayon::scope(|scope| {
                for branch in branches {
                    scope.spawn(move |_| branch.execute());
                }
            }),
        }
    }
}

impl Node {
    pub fn unit(processor: impl Processor + 'static) -> Self {
        Node::Unit(Unit::new(processor))
    }

    pub fn name(&self) -> &str {
        match self {
            Node::Unit(unit) => unit.name(),
            Node::Chain(chain) => &chain.name,
            Node::Group(group) => &group.name,
        }
    }

    fn members_mut(&mut self) -> &mut [Node] {
        match self {
            Node::Unit(_) => &mut [],
            Node::Chain(chain) => chain.members.as_mut_slice(),
            Node::Group(group) => group.members.as_mut_slice(),
        }
    }

    fn members(&self) -> &[Node] {
        match self {
            Node::Unit(_) => &[],
            Node::Chain(chain) => chain.members.as_slice(),
            Node::Group(group) => group.members.as_slice(),
        }
    }

    /// Every node name in the subtree, depth first.
    pub(crate) fn collect_names<'a>(&'a self, names: &mut Vec<&'a str>) {
        names.push(self.name());
        for member in self.members() {
            member.collect_names(names);
        }
    }

    pub(crate) fn find_unit(&self, name: &str) -> Option<&Unit> {
        match self {
            Node::Unit(unit) if unit.name() == name => Some(unit),
            _ => self.members().iter().find_map(|m| m.find_unit(name)),
        }
    }

    /// Detach the first descendant named `name`.
    pub(crate) fn remove(&mut self, name: &str) -> Option<Node> {
        let members = match self {
            Node::Unit(_) => return None,
            Node::Chain(chain) => &mut chain.members,
            Node::Group(group) => &mut group.members,
        };
        if let Some(index) = members.iter().position(|m| m.name() == name) {
            return Some(members.remove(index));
        }
        members.iter_mut().find_map(|m| m.remove(name))
    }

    pub(crate) fn register(&self, registry: &mut Registry) {
        match self {
            Node::Unit(unit) => unit.processor.register(registry),
            _ => {
                for member in self.members() {
                    member.register(registry);
                }
            }
        }
    }

    pub(crate) fn lock(&mut self) -> Result<()> {
        match self {
            Node::Unit(unit) => unit.lock(),
            _ => self.members_mut().iter_mut().try_for_each(Node::lock),
        }
    }

    /// Prepare in list order; returns the total lane count of the subtree.
    pub(crate) fn prepare(&mut self, ctx: &PrepareContext<'_>) -> Result<usize> {
        match self {
            Node::Unit(unit) => unit.prepare(ctx),
            _ => {
                let mut lanes = 0;
                for member in self.members_mut() {
                    lanes += member.prepare(ctx)?;
                }
                Ok(lanes)
            }
        }
    }

    pub(crate) fn schedule(&mut self) -> Result<Plan> {
        match self {
            Node::Unit(unit) => unit.schedule(),
            Node::Chain(chain) => Ok(Plan::Sequence(
                chain
                    .members
                    .iter_mut()
                    .map(Node::schedule)
                    .collect::<Result<_>>()?,
            )),
            Node::Group(group) => Ok(Plan::Parallel(
                group
                    .members
                    .iter_mut()
                    .map(Node::schedule)
                    .collect::<Result<_>>()?,
            )),
        }
    }

    pub(crate) fn complete(&mut self) -> Result<()> {
        match self {
            Node::Unit(unit) => unit.complete(),
            _ => self.members_mut().iter_mut().try_for_each(Node::complete),
        }
    }

    pub(crate) fn apply(&mut self) -> Result<()> {
        match self {
            Node::Unit(unit) => unit.apply(),
            _ => self.members_mut().iter_mut().try_for_each(Node::apply),
        }
    }

    pub(crate) fn unlock(&mut self) -> Result<()> {
        match self {
            Node::Unit(unit) => unit.unlock(),
            _ => self.members_mut().iter_mut().try_for_each(Node::unlock),
        }
    }

    pub(crate) fn abort(&mut self) {
        match self {
            Node::Unit(unit) => unit.abort(),
            _ => self.members_mut().iter_mut().for_each(Node::abort),
        }
    }

    pub(crate) fn dispose(&mut self) {
        match self {
            Node::Unit(unit) => unit.dispose(),
            _ => self.members_mut().iter_mut().for_each(Node::dispose),
        }
    }
}
