//! Typed capability lookup across a compound's tree.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use super::PrepareContext;
use crate::error::{Error, Result};

/// Marker type naming something a unit can provide to the rest of the tree.
///
/// The handle is what consumers receive; it is cloned out of the registry
/// and should be cheap to clone (usually a bundle of `Arc`s).
pub trait Capability: 'static {
    type Handle: Clone + Send + Sync + 'static;

    const NAME: &'static str;
}

/// Providers keyed by capability, in registration order.
#[derive(Clone, Default)]
pub struct Registry {
    entries: HashMap<TypeId, Vec<Arc<dyn Any + Send + Sync>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provide<C: Capability>(&mut self, handle: C::Handle) {
        self.entries
            .entry(TypeId::of::<C>())
            .or_default()
            .push(Arc::new(handle));
    }

    /// Drop every provider of `C`, then register `handle` as the only one.
    pub fn replace<C: Capability>(&mut self, handle: C::Handle) {
        self.entries.remove(&TypeId::of::<C>());
        self.provide::<C>(handle);
    }

    /// The first registered provider of `C`.
    pub fn first<C: Capability>(&self) -> Option<C::Handle> {
        self.entries
            .get(&TypeId::of::<C>())?
            .first()?
            .downcast_ref::<C::Handle>()
            .cloned()
    }

    pub fn count<C: Capability>(&self) -> usize {
        self.entries
            .get(&TypeId::of::<C>())
            .map_or(0, Vec::len)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// A consumer-side cache of one capability lookup.
///
/// The lookup runs on first use and again only after the compound's
/// topology generation moves.
pub struct Dependency<C: Capability> {
    cached: Option<(u64, C::Handle)>,
    lookups: usize,
    _capability: PhantomData<C>,
}

impl<C: Capability> Default for Dependency<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Capability> Dependency<C> {
    pub fn new() -> Self {
        Self {
            cached: None,
            lookups: 0,
            _capability: PhantomData,
        }
    }

    pub fn resolve(&mut self, unit: &str, ctx: &PrepareContext<'_>) -> Result<C::Handle> {
        let handle = match self.cached.take() {
            Some((generation, handle)) if generation == ctx.generation() => handle,
            _ => {
                self.lookups += 1;
                log::trace!("{} resolving {} (generation {})", unit, C::NAME, ctx.generation());
                ctx.registry()
                    .first::<C>()
                    .ok_or_else(|| Error::MissingDependency {
                        unit: unit.to_string(),
                        capability: C::NAME,
                    })?
            }
        };
        self.cached = Some((ctx.generation(), handle.clone()));
        Ok(handle)
    }

    /// Number of registry lookups performed so far.
    pub fn lookups(&self) -> usize {
        self.lookups
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }
}
