//! Tick-driven scheduling core shared by every analysis stage.
//!
//! A [`Processor`] is driven through a fixed lifecycle once per tick:
//!
//! ```text
//! Idle -> Locked -> Prepared -> Scheduled -> Completed -> Applied -> Idle
//!  lock()   prepare()   (fan-out)   (wait)      apply()    unlock()
//! ```
//!
//! Processors are wrapped in [`Unit`]s and composed into [`Chain`]s (ordered)
//! and [`Group`]s (unordered siblings) under a single [`Compound`] root, which
//! owns the worker pool and the capability [`Registry`] used for late-bound
//! dependency lookup.

mod compound;
mod node;
mod registry;

pub use compound::Compound;
pub use node::{Chain, Group, Node, Unit};
pub use registry::{Capability, Dependency, Registry};

use rayon::prelude::*;

use crate::error::Result;

/// Lifecycle stage of a unit, or of a whole compound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Idle,
    Locked,
    Prepared,
    Scheduled,
    Completed,
    Applied,
}

/// A pipeline stage.
///
/// `lock` snapshots pending configuration, `prepare` resolves dependencies,
/// sizes outputs and hands back the [`Job`] to fan out, `apply` runs on the
/// ticking thread once every lane has finished, and `unlock` drops whatever
/// was borrowed for the tick.
pub trait Processor: Send {
    fn name(&self) -> &str;

    /// Publish the capabilities this processor provides. Called whenever the
    /// compound topology changes.
    fn register(&self, _registry: &mut Registry) {}

    fn lock(&mut self) {}

    fn prepare(&mut self, ctx: &PrepareContext<'_>) -> Result<Job>;

    fn apply(&mut self) {}

    fn unlock(&mut self) {}

    /// Release every owned buffer. The processor is not used again afterwards.
    fn dispose(&mut self) {}
}

/// Read-only view of the compound handed to [`Processor::prepare`].
pub struct PrepareContext<'a> {
    registry: &'a Registry,
    generation: u64,
}

impl<'a> PrepareContext<'a> {
    pub fn new(registry: &'a Registry, generation: u64) -> Self {
        Self {
            registry,
            generation,
        }
    }

    pub fn registry(&self) -> &Registry {
        self.registry
    }

    /// Topology generation; bumps whenever units are added or removed.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// The work a unit contributes to one tick.
///
/// The closure owns everything it touches (shared buffer handles, resolved
/// ranges) so it can run on the worker pool while the ticking thread returns.
pub struct Job {
    lanes: usize,
    work: Box<dyn FnOnce() + Send + 'static>,
}

impl Job {
    /// A job fanned out over `lanes` independent lanes. The closure is
    /// expected to use [`fan_out`] internally.
    pub fn parallel(lanes: usize, work: impl FnOnce() + Send + 'static) -> Self {
        Self {
            lanes,
            work: Box::new(work),
        }
    }

    pub fn single(work: impl FnOnce() + Send + 'static) -> Self {
        Self::parallel(1, work)
    }

    /// Nothing to do this tick.
    pub fn idle() -> Self {
        Self::parallel(0, || {})
    }

    pub fn lanes(&self) -> usize {
        self.lanes
    }

    pub(crate) fn run(self) {
        (self.work)()
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").field("lanes", &self.lanes).finish()
    }
}

/// Run `lane(i, &mut slots[i])` for every slot in parallel.
///
/// Each lane gets exclusive access to its own slot only, so lanes cannot
/// observe each other and completion order does not matter.
pub fn fan_out<T, F>(slots: &mut [T], lane: F)
where
    T: Send,
    F: Fn(usize, &mut T) + Sync + Send,
{
    slots
        .par_iter_mut()
        .enumerate()
        .for_each(|(i, slot)| lane(i, slot));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_out_writes_every_slot() {
        let mut out = vec![0usize; 257];
        fan_out(&mut out, |i, slot| *slot = i * 2);
        assert!(out.iter().enumerate().all(|(i, &v)| v == i * 2));
    }

    #[test]
    fn job_reports_lanes() {
        assert_eq!(Job::parallel(16, || {}).lanes(), 16);
        assert_eq!(Job::single(|| {}).lanes(), 1);
        assert_eq!(Job::idle().lanes(), 0);
    }
}
