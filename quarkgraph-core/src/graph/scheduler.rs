//! Propagation Engine
//!
//! The engine brings the slots of one transaction up to date after a batch of
//! writes. It never touches published revisions: it reads through the base
//! revision and keeps everything it creates in the transaction's own scope.
//!
//! # Algorithm
//!
//! A pass has two phases:
//!
//! 1. **Walk.** Starting from the seeds (written, forced and newly added
//!    identifiers, plus dependents of removed ones) follow valid outgoing
//!    edges. Every reached node is tagged with the pass epoch and its
//!    `edges_flow` counts the incoming edges from other reached nodes.
//!
//! 2. **Kahn scheduling.** Nodes whose `edges_flow` is zero (or forced) are
//!    eligible and popped in ascending `(level, id)` order. A node runs its
//!    calculation only when it is dirty: written, forced, new, or one of its
//!    dependencies changed. Otherwise it resolves unchanged. On resolution
//!    each counted dependent gets its `edges_flow` decremented, and is marked
//!    dirty only if the value changed per the identifier's equality.
//!
//! Calculations discover their dependencies while running. Reading a node that
//! is still pending resolves it on the spot: sync calculations recurse, while
//! generators are driven from an explicit frame stack. Reaching a node that is
//! in progress is a cycle and fails the pass.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use dashmap::DashMap;
use indexmap::{IndexMap, IndexSet};
use smallvec::SmallVec;
use tracing::trace;

use super::quark::{CalcState, Quark, Resolution, ShadowQuark, Slot};
use super::revision::{Revision, RevisionClock};
use crate::error::GraphError;
use crate::identifier::calculation::{
    Calculation, ErasedGenerator, GeneratorFactory, Resolve, SyncFn,
};
use crate::identifier::{Effect, IdentifierDef, IdentifierId, Level, Resume, Step, Value, WriteArgs};

/// Identifiers live for a transaction: registered in the checkout and not
/// removed by the transaction itself.
#[derive(Clone, Copy)]
pub(crate) struct Scope<'a> {
    identifiers: &'a DashMap<IdentifierId, Arc<IdentifierDef>>,
    removed: &'a IndexSet<IdentifierId>,
}

impl<'a> Scope<'a> {
    pub(crate) fn new(
        identifiers: &'a DashMap<IdentifierId, Arc<IdentifierDef>>,
        removed: &'a IndexSet<IdentifierId>,
    ) -> Self {
        Self {
            identifiers,
            removed,
        }
    }

    pub(crate) fn lookup(&self, id: IdentifierId) -> Option<Arc<IdentifierDef>> {
        if self.removed.contains(&id) {
            return None;
        }
        self.identifiers.get(&id).map(|entry| Arc::clone(entry.value()))
    }
}

/// A node the walk starts from.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Seed {
    pub(crate) id: IdentifierId,
    pub(crate) dirty: bool,
}

enum Demand {
    Ready(Value),
    Calculate,
}

enum Runner {
    Sync(SyncFn),
    Generator(GeneratorFactory),
}

struct Frame {
    id: IdentifierId,
    generator: Box<dyn ErasedGenerator>,
    input: Resume,
}

/// One propagation pass over a transaction's slots.
pub(crate) struct Propagation<'a> {
    scope: Scope<'a>,
    base: &'a Revision,
    clock: RevisionClock,
    epoch: u64,
    slots: &'a mut IndexMap<IdentifierId, Slot>,
    forced: &'a IndexSet<IdentifierId>,
    recalculated: &'a mut Vec<IdentifierId>,
    heap: BinaryHeap<Reverse<(Level, IdentifierId)>>,
    active: Vec<IdentifierId>,
    fatal: Option<GraphError>,
}

impl<'a> Propagation<'a> {
    pub(crate) fn new(
        scope: Scope<'a>,
        base: &'a Revision,
        clock: RevisionClock,
        epoch: u64,
        slots: &'a mut IndexMap<IdentifierId, Slot>,
        forced: &'a IndexSet<IdentifierId>,
        recalculated: &'a mut Vec<IdentifierId>,
    ) -> Self {
        Self {
            scope,
            base,
            clock,
            epoch,
            slots,
            forced,
            recalculated,
            heap: BinaryHeap::new(),
            active: Vec::new(),
            fatal: None,
        }
    }

    fn label(&self, id: IdentifierId) -> String {
        self.slots
            .get(&id)
            .map(|slot| slot.identifier().label())
            .or_else(|| self.base.get(id).map(|slot| slot.identifier().label()))
            .unwrap_or_else(|| id.to_string())
    }

    fn unknown(&self, id: IdentifierId) -> GraphError {
        GraphError::UnknownIdentifier {
            identifier: self.label(id),
        }
    }

    fn lookup(&self, id: IdentifierId) -> Result<Arc<IdentifierDef>, GraphError> {
        self.scope.lookup(id).ok_or_else(|| self.unknown(id))
    }

    fn slot_mut(&mut self, id: IdentifierId) -> Result<&mut Slot, GraphError> {
        if !self.slots.contains_key(&id) {
            return Err(self.unknown(id));
        }
        self.slots.get_mut(&id).ok_or(GraphError::UnknownIdentifier {
            identifier: id.to_string(),
        })
    }

    fn is_pending(&self, id: IdentifierId) -> bool {
        self.slots
            .get(&id)
            .is_some_and(|slot| slot.walk().is_pending(self.epoch))
    }

    fn is_in_progress(&self, id: IdentifierId) -> bool {
        self.slots.get(&id).is_some_and(|slot| {
            let walk = slot.walk();
            walk.visit_epoch == self.epoch && walk.resolution == Resolution::InProgress
        })
    }

    fn dependents_of(&self, id: IdentifierId) -> Vec<IdentifierId> {
        match self.slots.get(&id) {
            Some(slot) => slot.dependents().iter().copied().collect(),
            None => self
                .base
                .get(id)
                .map(|slot| slot.dependents().iter().copied().collect())
                .unwrap_or_default(),
        }
    }

    fn dependencies_of(&self, id: IdentifierId) -> SmallVec<[IdentifierId; 4]> {
        match self.slots.get(&id) {
            Some(slot) => slot.dependencies().iter().copied().collect(),
            None => self
                .base
                .get(id)
                .map(|slot| slot.dependencies().iter().copied().collect())
                .unwrap_or_default(),
        }
    }

    /// An edge is stale once the dependent left the scope, or its last
    /// calculation no longer read the dependency. The walk drops stale edges.
    fn is_dependent(&self, dependency: IdentifierId, dependent: IdentifierId) -> bool {
        self.scope.lookup(dependent).is_some()
            && self.dependencies_of(dependent).contains(&dependency)
    }

    /// Make sure `id` has a slot in the transaction scope.
    pub(crate) fn ensure_slot(&mut self, id: IdentifierId) -> Result<(), GraphError> {
        if self.slots.contains_key(&id) {
            return Ok(());
        }
        let slot = match self.base.get(id) {
            Some(prior) => Slot::Shadow(ShadowQuark::new(prior, self.clock)),
            None => Slot::Quark(Quark::new(self.lookup(id)?, self.clock, None)),
        };
        self.slots.insert(id, slot);
        Ok(())
    }

    /// Tag `id` as reached in this pass. Returns true on the first visit.
    fn visit(&mut self, id: IdentifierId, dirty: bool) -> Result<bool, GraphError> {
        self.ensure_slot(id)?;
        let (clock, epoch) = (self.clock, self.epoch);
        let forced = self.forced.contains(&id);
        let slot = self.slot_mut(id)?;
        let first = slot.walk().visit_epoch != epoch;
        if first {
            slot.walk_mut().begin(clock, epoch);
            if forced {
                slot.acquire().force_calculation();
            }
        }
        if dirty {
            slot.walk_mut().dirty = true;
        }
        Ok(first)
    }

    /// Phase one: reach every node affected by the seeds and count edges.
    pub(crate) fn walk(
        &mut self,
        seeds: &[Seed],
        removed: &IndexSet<IdentifierId>,
    ) -> Result<(), GraphError> {
        let mut seeds: Vec<Seed> = seeds.to_vec();
        for &id in removed {
            for dependent in self.dependents_of(id) {
                if self.is_dependent(id, dependent) {
                    seeds.push(Seed {
                        id: dependent,
                        dirty: true,
                    });
                }
            }
            self.slots.shift_remove(&id);
        }

        let mut visited = Vec::new();
        let mut queue = Vec::new();
        for seed in &seeds {
            if self.scope.lookup(seed.id).is_none() {
                continue;
            }
            if self.visit(seed.id, seed.dirty)? {
                visited.push(seed.id);
                queue.push(seed.id);
            }
        }

        while let Some(id) = queue.pop() {
            for dependent in self.dependents_of(id) {
                if !self.is_dependent(id, dependent) {
                    self.slot_mut(id)?.remove_dependent(dependent);
                    continue;
                }
                if self.visit(dependent, false)? {
                    visited.push(dependent);
                    queue.push(dependent);
                }
                self.slot_mut(id)?.walk_mut().outgoing.push(dependent);
                self.slot_mut(dependent)?.walk_mut().edges_flow.increment();
            }
        }

        for &id in &visited {
            if let Some(slot) = self.slots.get(&id) {
                if slot.walk().edges_flow.is_ready() {
                    self.heap
                        .push(Reverse((slot.identifier().meta().level, id)));
                }
            }
        }
        trace!(
            epoch = self.epoch,
            visited = visited.len(),
            ready = self.heap.len(),
            "walk finished"
        );
        Ok(())
    }

    /// Phase two: resolve every node reached by the walk.
    pub(crate) fn run_to_completion(&mut self) -> Result<(), GraphError> {
        loop {
            while let Some(Reverse((_, id))) = self.heap.pop() {
                if self.is_pending(id) {
                    self.settle(id)?;
                }
            }
            // Nodes still pending were only reachable through stale edges
            // that never resolved. Resolving one pulls in its real dependencies.
            let epoch = self.epoch;
            let leftover = self
                .slots
                .iter()
                .filter(|(_, slot)| slot.walk().is_pending(epoch))
                .map(|(id, slot)| (slot.identifier().meta().level, *id))
                .min();
            match leftover {
                Some((_, id)) => self.settle(id)?,
                None => return Ok(()),
            }
        }
    }

    /// Resolve an eligible node popped from the heap.
    fn settle(&mut self, id: IdentifierId) -> Result<(), GraphError> {
        let forced = self.forced.contains(&id);
        let slot = self.slot_mut(id)?;
        let def = Arc::clone(slot.identifier());

        if def.is_variable() && !forced {
            self.complete_variable(id)?;
            return Ok(());
        }

        let written = slot.as_quark().is_some_and(Quark::has_proposed_value);
        let stale = slot.walk().dirty || slot.value().is_none();
        if def.meta().lazy && stale && !written && !forced {
            // Published without a value, calculated when first read.
            let quark = slot.acquire();
            quark.value = None;
            trace!(identifier = %def.label(), "lazy node left stale");
            self.complete(id, true);
            return Ok(());
        }

        self.resolve(id).map(|_| ())
    }

    fn complete_variable(&mut self, id: IdentifierId) -> Result<Option<Value>, GraphError> {
        let slot = self.slot_mut(id)?;
        let def = Arc::clone(slot.identifier());
        let value = slot.value().cloned();
        let changed = match (&value, slot.walk().dirty, slot.as_quark()) {
            (Some(value), true, Some(quark)) => {
                match quark.settled.clone().or_else(|| quark.committed_value()) {
                    Some(old) => !def.equality(&old, value),
                    None => true,
                }
            }
            _ => false,
        };
        self.complete(id, changed);
        Ok(value)
    }

    /// Value of `id`, calculating it first if needed.
    pub(crate) fn resolve(&mut self, id: IdentifierId) -> Result<Value, GraphError> {
        match self.demand(id)? {
            Demand::Ready(value) => Ok(value),
            Demand::Calculate => self.compute(id),
        }
    }

    fn demand(&mut self, id: IdentifierId) -> Result<Demand, GraphError> {
        let def = self.lookup(id)?;
        let epoch = self.epoch;

        let base = self.base;

        let Some(slot) = self.slots.get(&id) else {
            let prior = base.get(id);
            if let Some(value) = prior.and_then(|slot| slot.value()) {
                return Ok(Demand::Ready(Arc::clone(value)));
            }
            let quark = Quark::new(def, self.clock, prior.cloned());
            self.slots.insert(id, Slot::Quark(quark));
            return self.calculate_or_uninitialized(id);
        };

        let walk = slot.walk();
        let resolution = (walk.visit_epoch == epoch).then_some(walk.resolution);
        let value = slot.value().cloned();
        match resolution {
            Some(Resolution::InProgress) => Err(self.cycle(id)),
            Some(Resolution::Pending) => self.verify(id),
            _ => match value {
                Some(value) => Ok(Demand::Ready(value)),
                None => self.calculate_or_uninitialized(id),
            },
        }
    }

    fn calculate_or_uninitialized(&self, id: IdentifierId) -> Result<Demand, GraphError> {
        let variable = self
            .slots
            .get(&id)
            .is_some_and(|slot| slot.identifier().is_variable());
        if variable && !self.forced.contains(&id) {
            return Err(GraphError::Uninitialized {
                identifier: self.label(id),
            });
        }
        Ok(Demand::Calculate)
    }

    fn cycle(&self, id: IdentifierId) -> GraphError {
        let start = self
            .active
            .iter()
            .position(|&active| active == id)
            .unwrap_or(0);
        let path = self.active[start..]
            .iter()
            .chain(std::iter::once(&id))
            .map(|&node| self.label(node))
            .collect();
        GraphError::Cycle { path }
    }

    /// Decide whether a pending node must be recalculated, resolving its
    /// pending dependencies first when nothing marked it dirty yet.
    fn verify(&mut self, id: IdentifierId) -> Result<Demand, GraphError> {
        let forced = self.forced.contains(&id);
        let slot = self.slot_mut(id)?;
        if slot.identifier().is_variable() && !forced {
            return match self.complete_variable(id)? {
                Some(value) => Ok(Demand::Ready(value)),
                None => self.calculate_or_uninitialized(id),
            };
        }

        let walk = slot.walk();
        if walk.dirty || walk.edges_flow.is_forced() || slot.value().is_none() {
            return Ok(Demand::Calculate);
        }

        slot.walk_mut().resolution = Resolution::InProgress;
        self.active.push(id);
        for dependency in self.dependencies_of(id) {
            if self.is_in_progress(dependency) {
                // Its new value is not known yet, so recalculate. Reading it
                // again reports the cycle, if there still is one.
                self.slot_mut(id)?.walk_mut().dirty = true;
                break;
            }
            if self.is_pending(dependency) {
                self.resolve(dependency)?;
            }
            if self.slots.get(&id).is_some_and(|slot| slot.walk().dirty) {
                break;
            }
        }
        self.active.pop();

        let slot = self.slot_mut(id)?;
        slot.walk_mut().resolution = Resolution::Pending;
        if slot.walk().dirty {
            return Ok(Demand::Calculate);
        }
        let value = slot.value().cloned();
        self.complete(id, false);
        value
            .map(Demand::Ready)
            .ok_or_else(|| GraphError::Uninitialized {
                identifier: self.label(id),
            })
    }

    /// Acquire the node and mark it in progress.
    fn begin(&mut self, id: IdentifierId) -> Result<Runner, GraphError> {
        let (clock, epoch) = (self.clock, self.epoch);
        let quark = self.slot_mut(id)?.acquire();
        let def = Arc::clone(&quark.identifier);
        let runner = match def.calculation() {
            Calculation::Abstract => {
                return Err(GraphError::AbstractCalculation {
                    identifier: def.label(),
                })
            }
            Calculation::Sync(calculation) => Runner::Sync(Arc::clone(calculation)),
            Calculation::Generator(factory) => Runner::Generator(Arc::clone(factory)),
        };
        quark.dependencies.clear();
        quark.calculation = CalcState::Running;
        if quark.walk.visit_epoch != epoch {
            quark.walk.begin(clock, epoch);
        }
        quark.walk.resolution = Resolution::InProgress;
        self.active.push(id);
        trace!(identifier = %def.label(), "calculation started");
        Ok(runner)
    }

    fn finish(&mut self, id: IdentifierId, value: Value) -> Result<(), GraphError> {
        let quark = self
            .slot_mut(id)?
            .as_quark_mut()
            .ok_or(GraphError::ShadowMutation {
                identifier: id.to_string(),
            })?;
        let def = Arc::clone(&quark.identifier);
        let reference = quark.settled.clone().or_else(|| quark.committed_value());
        let changed = reference.map_or(true, |old| !def.equality(&old, &value));
        quark.value = Some(value);
        quark.calculation = CalcState::Completed;
        self.active.pop();
        self.recalculated.push(id);
        trace!(identifier = %def.label(), changed, "calculation finished");
        self.complete(id, changed);
        Ok(())
    }

    /// Mark `id` resolved and notify the dependents counted by the walk.
    fn complete(&mut self, id: IdentifierId, changed: bool) {
        let epoch = self.epoch;
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        let first = !matches!(slot.walk().resolution, Resolution::Resolved { .. });
        slot.walk_mut().resolution = Resolution::Resolved { changed };
        if let Slot::Quark(quark) = slot {
            quark.settled = quark.value.clone();
        }
        if !first || slot.walk().visit_epoch != epoch {
            return;
        }

        let outgoing = std::mem::take(&mut slot.walk_mut().outgoing);
        for dependent in outgoing {
            let Some(slot) = self.slots.get_mut(&dependent) else {
                continue;
            };
            let level = slot.identifier().meta().level;
            let walk = slot.walk_mut();
            if !walk.is_unresolved(epoch) {
                continue;
            }
            walk.dirty |= changed;
            walk.edges_flow.decrement();
            if walk.resolution == Resolution::Pending
                && !walk.edges_flow.is_forced()
                && walk.edges_flow.is_ready()
            {
                self.heap.push(Reverse((level, dependent)));
            }
        }
    }

    /// Record that `reader` read `dependency`.
    fn link(&mut self, dependency: IdentifierId, reader: IdentifierId) -> Result<(), GraphError> {
        self.ensure_slot(dependency)?;
        self.slot_mut(dependency)?.add_dependent(reader);
        if let Some(quark) = self.slot_mut(reader)?.as_quark_mut() {
            if !quark.dependencies.contains(&dependency) {
                quark.dependencies.push(dependency);
            }
        }
        Ok(())
    }

    fn read_dependency(
        &mut self,
        reader: IdentifierId,
        dependency: IdentifierId,
    ) -> Result<Value, GraphError> {
        let result = self
            .resolve(dependency)
            .and_then(|value| self.link(dependency, reader).map(|_| value));
        if let Err(error) = &result {
            self.fatal = Some(error.clone());
        }
        result
    }

    fn proposed_or_current(&mut self, id: IdentifierId) -> Result<Value, GraphError> {
        let label = self.label(id);
        let quark = self.slot_mut(id)?.acquire();
        quark.used_proposed_or_current = true;
        quark
            .proposed_value()
            .or_else(|| quark.committed_value())
            .ok_or(GraphError::Uninitialized { identifier: label })
    }

    fn proposed_args(&self, id: IdentifierId) -> Option<WriteArgs> {
        self.slots
            .get(&id)
            .and_then(Slot::as_quark)
            .and_then(|quark| quark.proposed_args().cloned())
    }

    fn compute(&mut self, id: IdentifierId) -> Result<Value, GraphError> {
        match self.begin(id)? {
            Runner::Sync(calculation) => self.run_sync(id, &calculation),
            Runner::Generator(factory) => self.drive(id, factory()),
        }
    }

    fn failure(&mut self, id: IdentifierId, error: anyhow::Error) -> GraphError {
        self.fatal.take().unwrap_or_else(|| GraphError::Calculation {
            identifier: self.label(id),
            error: Arc::new(error),
        })
    }

    fn run_sync(&mut self, id: IdentifierId, calculation: &SyncFn) -> Result<Value, GraphError> {
        let def = self.lookup(id)?;
        let result = {
            let mut reader = Reader {
                engine: self,
                current: id,
                def,
            };
            calculation(&mut reader)
        };
        match result {
            Ok(value) => match self.fatal.take() {
                // A read error swallowed by the calculation still fails the pass.
                Some(error) => Err(error),
                None => {
                    self.finish(id, value.clone())?;
                    Ok(value)
                }
            },
            Err(error) => Err(self.failure(id, error)),
        }
    }

    /// Run generator calculations, nested ones included, on an explicit stack.
    fn drive(
        &mut self,
        root: IdentifierId,
        generator: Box<dyn ErasedGenerator>,
    ) -> Result<Value, GraphError> {
        let mut stack = vec![Frame {
            id: root,
            generator,
            input: Resume::start(),
        }];

        while let Some(frame) = stack.last_mut() {
            let id = frame.id;
            let input = std::mem::take(&mut frame.input);
            let step = match frame.generator.resume(input) {
                Ok(step) => step,
                Err(error) => return Err(self.failure(id, error)),
            };

            let resumed = match step {
                Step::Done(value) => {
                    stack.pop();
                    self.finish(id, value.clone())?;
                    match stack.last() {
                        Some(parent) => {
                            self.link(id, parent.id)?;
                            value
                        }
                        None => return Ok(value),
                    }
                }
                Step::Yield(Effect::Read(dependency)) => match self.demand(dependency)? {
                    Demand::Ready(value) => {
                        self.link(dependency, id)?;
                        value
                    }
                    Demand::Calculate => match self.begin(dependency)? {
                        Runner::Generator(factory) => {
                            stack.push(Frame {
                                id: dependency,
                                generator: factory(),
                                input: Resume::start(),
                            });
                            continue;
                        }
                        Runner::Sync(calculation) => {
                            let value = self.run_sync(dependency, &calculation)?;
                            self.link(dependency, id)?;
                            value
                        }
                    },
                },
                Step::Yield(Effect::ProposedOrCurrent) => self.proposed_or_current(id)?,
                Step::Yield(Effect::ProposedArgs) => Arc::new(self.proposed_args(id)) as Value,
            };

            if let Some(frame) = stack.last_mut() {
                frame.input = Resume::with(resumed);
            }
        }

        Err(self.unknown(root))
    }
}

/// Engine handle given to a running sync calculation.
struct Reader<'e, 'a> {
    engine: &'e mut Propagation<'a>,
    current: IdentifierId,
    def: Arc<IdentifierDef>,
}

impl Resolve for Reader<'_, '_> {
    fn read(&mut self, dependency: IdentifierId) -> Result<Value, GraphError> {
        self.engine.read_dependency(self.current, dependency)
    }

    fn proposed_or_current(&mut self) -> Result<Value, GraphError> {
        self.engine.proposed_or_current(self.current)
    }

    fn proposed_args(&self) -> Option<WriteArgs> {
        self.engine.proposed_args(self.current)
    }

    fn definition(&self) -> &IdentifierDef {
        &self.def
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::{Identifier, IdentifierBuilder};
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::OnceLock;

    struct Fixture {
        identifiers: DashMap<IdentifierId, Arc<IdentifierDef>>,
        removed: IndexSet<IdentifierId>,
        forced: IndexSet<IdentifierId>,
        base: Revision,
        slots: IndexMap<IdentifierId, Slot>,
        recalculated: Vec<IdentifierId>,
        epoch: u64,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                identifiers: DashMap::new(),
                removed: IndexSet::new(),
                forced: IndexSet::new(),
                base: Revision::root(),
                slots: IndexMap::new(),
                recalculated: Vec::new(),
                epoch: 0,
            }
        }

        fn add<T>(&self, id: &Identifier<T>) {
            self.identifiers.insert(id.id(), id.definition().clone());
        }

        fn write<T: Send + Sync + 'static>(&mut self, id: &Identifier<T>, value: T) {
            self.slots
                .entry(id.id())
                .or_insert_with(|| Slot::Quark(Quark::new(id.definition().clone(), 1, None)));
            let quark = self.slots.get_mut(&id.id()).unwrap().acquire();
            id.definition().write(quark, Arc::new(value), None);
        }

        fn pass(&mut self, seeds: &[IdentifierId]) -> Result<(), GraphError> {
            self.epoch += 1;
            let seeds: Vec<Seed> = seeds.iter().map(|&id| Seed { id, dirty: true }).collect();
            let removed = IndexSet::new();
            let mut engine = Propagation::new(
                Scope::new(&self.identifiers, &self.removed),
                &self.base,
                1,
                self.epoch,
                &mut self.slots,
                &self.forced,
                &mut self.recalculated,
            );
            engine.walk(&seeds, &removed)?;
            engine.run_to_completion()
        }

        fn value<T: Clone + 'static>(&self, id: &Identifier<T>) -> Option<T> {
            self.slots
                .get(&id.id())
                .and_then(|slot| slot.value())
                .and_then(|value| value.downcast_ref::<T>().cloned())
        }
    }

    #[test]
    fn diamond_recalculates_each_node_once() {
        let runs = Arc::new(AtomicI32::new(0));
        let source = Identifier::<i32>::variable("source");
        let (s1, s2) = (source.clone(), source.clone());
        let left = IdentifierBuilder::<i32>::calculated("left")
            .calculation(move |ctx| Ok(ctx.read(&s1)? + 1))
            .build();
        let right = IdentifierBuilder::<i32>::calculated("right")
            .calculation(move |ctx| Ok(ctx.read(&s2)? * 2))
            .build();
        let (l, r, counter) = (left.clone(), right.clone(), runs.clone());
        let sum = IdentifierBuilder::<i32>::calculated("sum")
            .calculation(move |ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(ctx.read(&l)? + ctx.read(&r)?)
            })
            .build();

        let mut fixture = Fixture::new();
        for def in [source.definition(), left.definition(), right.definition(), sum.definition()] {
            fixture.identifiers.insert(def.id(), def.clone());
        }
        fixture.write(&source, 3);
        fixture
            .pass(&[source.id(), left.id(), right.id(), sum.id()])
            .unwrap();
        assert_eq!(fixture.value(&sum), Some(10));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        fixture.write(&source, 4);
        fixture.pass(&[source.id()]).unwrap();
        assert_eq!(fixture.value(&sum), Some(13));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn walk_counts_incoming_edges() {
        let source = Identifier::<i32>::variable("source");
        let s = source.clone();
        let double = IdentifierBuilder::<i32>::calculated("double")
            .calculation(move |ctx| Ok(ctx.read(&s)? * 2))
            .build();

        let mut fixture = Fixture::new();
        fixture.add(&source);
        fixture.add(&double);
        fixture.write(&source, 1);
        fixture.pass(&[source.id(), double.id()]).unwrap();

        fixture.epoch += 1;
        let removed = IndexSet::new();
        let mut engine = Propagation::new(
            Scope::new(&fixture.identifiers, &fixture.removed),
            &fixture.base,
            1,
            fixture.epoch,
            &mut fixture.slots,
            &fixture.forced,
            &mut fixture.recalculated,
        );
        engine
            .walk(&[Seed { id: source.id(), dirty: true }], &removed)
            .unwrap();
        let double_slot = engine.slots.get(&double.id()).unwrap();
        assert_eq!(double_slot.as_quark().unwrap().edges_flow().pending(), Some(1));
        assert_eq!(engine.heap.len(), 1);
    }

    #[test]
    fn sync_cycle_reports_path() {
        let b_cell: Arc<OnceLock<Identifier<i32>>> = Arc::new(OnceLock::new());
        let b_later = b_cell.clone();
        let a = IdentifierBuilder::<i32>::calculated("a")
            .calculation(move |ctx| {
                let b = b_later.get().ok_or_else(|| anyhow::anyhow!("b not built"))?;
                Ok(ctx.read(b)?)
            })
            .build();
        let a_ref = a.clone();
        let b = IdentifierBuilder::<i32>::calculated("b")
            .calculation(move |ctx| Ok(ctx.read(&a_ref)?))
            .build();
        b_cell.set(b.clone()).unwrap();

        let mut fixture = Fixture::new();
        fixture.add(&a);
        fixture.add(&b);
        let err = fixture.pass(&[a.id(), b.id()]).unwrap_err();
        match err {
            GraphError::Cycle { path } => {
                assert_eq!(path.len(), 3);
                assert_eq!(path.first(), path.last());
                assert!(path[0].starts_with("a#"));
            }
            other => panic!("expected a cycle, got {other}"),
        }
    }

    #[test]
    fn generator_reads_resolve_on_explicit_stack() {
        let source = Identifier::<i32>::variable("source");
        let s = source.clone();
        let inner = IdentifierBuilder::<i32>::calculated("inner")
            .generator(move || {
                let s = s.clone();
                move |input: Resume| -> anyhow::Result<Step<i32>> {
                    if input.is_start() {
                        Ok(Step::read(&s))
                    } else {
                        Ok(Step::Done(input.value::<i32>()? + 1))
                    }
                }
            })
            .level(Level(20))
            .build();
        let i = inner.clone();
        let outer = IdentifierBuilder::<i32>::calculated("outer")
            .generator(move || {
                let i = i.clone();
                move |input: Resume| -> anyhow::Result<Step<i32>> {
                    if input.is_start() {
                        Ok(Step::read(&i))
                    } else {
                        Ok(Step::Done(input.value::<i32>()? * 10))
                    }
                }
            })
            .build();

        let mut fixture = Fixture::new();
        fixture.add(&source);
        fixture.add(&inner);
        fixture.add(&outer);
        fixture.write(&source, 4);
        fixture.pass(&[outer.id(), inner.id(), source.id()]).unwrap();

        assert_eq!(fixture.value(&inner), Some(5));
        assert_eq!(fixture.value(&outer), Some(50));
        let outer_slot = fixture.slots.get(&outer.id()).unwrap();
        assert_eq!(outer_slot.dependencies(), &[inner.id()]);
        let inner_slot = fixture.slots.get(&inner.id()).unwrap();
        assert!(inner_slot.dependents().contains(&outer.id()));
    }

    #[test]
    fn unregistered_read_is_unknown_identifier() {
        let stranger = Identifier::<i32>::variable("stranger");
        let s = stranger.clone();
        let reader = IdentifierBuilder::<i32>::calculated("reader")
            .calculation(move |ctx| Ok(ctx.read(&s)?))
            .build();

        let mut fixture = Fixture::new();
        fixture.add(&reader);
        let err = fixture.pass(&[reader.id()]).unwrap_err();
        assert!(matches!(err, GraphError::UnknownIdentifier { .. }));
    }
}
