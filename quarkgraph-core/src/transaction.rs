//! Transactions
//!
//! A transaction stages writes against the revision its checkout was at when
//! it was opened. Nothing it does is visible outside until [`Transaction::commit`]
//! succeeds, and a commit either publishes one new revision or nothing at all.
//!
//! # Commit protocol
//!
//! 1. Take the checkout's commit lock. Commits are serialized, readers of
//!    published revisions never wait on it.
//! 2. If the head moved since the transaction was opened, rebase: drop the
//!    transaction-local slots and replay the staged writes on the new head.
//! 3. Run the propagation pass seeded with everything staged since the last
//!    pass.
//! 4. Publish the owned quarks, and the shadows that gained dependents, as a
//!    revision with clock `base + 1`.
//!
//! Any failure in between leaves the checkout untouched.

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, trace, warn};

use crate::checkout::{Checkout, CommitPhase, Pending};
use crate::error::GraphError;
use crate::graph::scheduler::{Propagation, Scope, Seed};
use crate::graph::{Quark, Revision, RevisionClock, ShadowQuark, Slot};
use crate::identifier::calculation::downcast;
use crate::identifier::{
    AsIdentifier, Data, Identifier, IdentifierDef, IdentifierId, Value, WriteArgs,
};

/// Summary of a commit.
#[derive(Debug, Clone)]
pub struct PropagationResult {
    /// The checkout's head after the commit.
    pub revision: Arc<Revision>,
    /// Identifiers whose calculation ran, in order of completion.
    pub recalculated: Vec<IdentifierId>,
    /// False when there was nothing to publish and the head did not move.
    pub committed: bool,
}

#[derive(Clone)]
struct StagedWrite {
    definition: Arc<IdentifierDef>,
    value: Value,
    args: Option<WriteArgs>,
}

/// What a transaction was asked to do.
#[derive(Clone, Default)]
struct Intent {
    writes: IndexMap<IdentifierId, StagedWrite>,
    touched: IndexSet<IdentifierId>,
    removed: IndexSet<IdentifierId>,
    forced: IndexSet<IdentifierId>,
}

impl Intent {
    fn is_empty(&self) -> bool {
        self.writes.is_empty()
            && self.touched.is_empty()
            && self.removed.is_empty()
            && self.forced.is_empty()
    }

    fn seeds(&self) -> Vec<Seed> {
        self.writes
            .keys()
            .chain(&self.touched)
            .chain(&self.forced)
            .map(|&id| Seed { id, dirty: true })
            .collect()
    }
}

/// Staging area for writes against a checkout.
pub struct Transaction {
    checkout: Checkout,
    base: Arc<Revision>,
    slots: IndexMap<IdentifierId, Slot>,
    /// Everything staged since the transaction was opened, replayed on rebase.
    intent: Intent,
    /// Staged since the last propagation pass.
    staged: Intent,
    epoch: u64,
    recalculated: Vec<IdentifierId>,
    poisoned: Option<GraphError>,
}

impl Transaction {
    pub(crate) fn new(checkout: Checkout, base: Arc<Revision>, pending: Pending) -> Self {
        let staged = Intent {
            touched: pending.touched,
            removed: pending.removed,
            ..Intent::default()
        };
        Self {
            checkout,
            base,
            slots: IndexMap::new(),
            intent: staged.clone(),
            staged,
            epoch: 0,
            recalculated: Vec::new(),
            poisoned: None,
        }
    }

    /// The revision this transaction builds on.
    pub fn base(&self) -> &Arc<Revision> {
        &self.base
    }

    /// Clock of the revision a successful commit publishes.
    pub fn clock(&self) -> RevisionClock {
        self.base.clock() + 1
    }

    pub fn checkout(&self) -> &Checkout {
        &self.checkout
    }

    fn check(&self) -> Result<(), GraphError> {
        match &self.poisoned {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn ensure_live(&self, definition: &IdentifierDef) -> Result<(), GraphError> {
        Scope::new(self.checkout.identifiers(), &self.intent.removed)
            .lookup(definition.id())
            .map(|_| ())
            .ok_or_else(|| GraphError::UnknownIdentifier {
                identifier: definition.label(),
            })
    }

    /// The quark a write to `identifier` lands on, materialized in this
    /// transaction's scope.
    pub fn get_write_target(
        &mut self,
        identifier: &impl AsIdentifier,
    ) -> Result<&mut Quark, GraphError> {
        let definition = Arc::clone(identifier.definition());
        self.ensure_live(&definition)?;
        let id = definition.id();
        let clock = self.clock();
        if !self.slots.contains_key(&id) {
            let slot = match self.base.get(id) {
                Some(prior) => Slot::Shadow(ShadowQuark::new(prior, clock)),
                None => Slot::Quark(Quark::new(Arc::clone(&definition), clock, None)),
            };
            self.slots.insert(id, slot);
        }
        match self.slots.get_mut(&id) {
            Some(slot) => Ok(slot.acquire()),
            None => Err(GraphError::UnknownIdentifier {
                identifier: definition.label(),
            }),
        }
    }

    /// Stage a write.
    pub fn write<T: Data>(
        &mut self,
        identifier: &Identifier<T>,
        value: T,
    ) -> Result<(), GraphError> {
        self.write_with_args(identifier, value, None)
    }

    /// Stage a write together with arguments describing how it was made.
    /// Calculations see them through `proposed_args`.
    pub fn write_with_args<T: Data>(
        &mut self,
        identifier: &Identifier<T>,
        value: T,
        args: Option<WriteArgs>,
    ) -> Result<(), GraphError> {
        self.check()?;
        let definition = Arc::clone(identifier.definition());
        let value: Value = Arc::new(value);
        let quark = self.get_write_target(identifier)?;
        definition.write(quark, Arc::clone(&value), args.clone());
        trace!(identifier = %definition.label(), "write staged");

        let write = StagedWrite {
            definition,
            value,
            args,
        };
        self.intent.writes.insert(identifier.id(), write.clone());
        self.staged.writes.insert(identifier.id(), write);
        Ok(())
    }

    /// Recalculate `identifier` on the next pass even if none of its inputs changed.
    pub fn force(&mut self, identifier: &impl AsIdentifier) -> Result<(), GraphError> {
        self.check()?;
        self.get_write_target(identifier)?.force_calculation();
        self.intent.forced.insert(identifier.id());
        self.staged.forced.insert(identifier.id());
        Ok(())
    }

    /// Stage the removal of `identifier`. On commit it is unregistered from
    /// the checkout and tombstoned in the new revision.
    pub fn remove(&mut self, identifier: &impl AsIdentifier) -> Result<(), GraphError> {
        self.check()?;
        let definition = identifier.definition();
        self.ensure_live(definition)?;
        let id = definition.id();
        for intent in [&mut self.intent, &mut self.staged] {
            intent.writes.shift_remove(&id);
            intent.touched.shift_remove(&id);
            intent.forced.shift_remove(&id);
            intent.removed.insert(id);
        }
        Ok(())
    }

    /// Read `identifier` as this transaction sees it, bringing staged writes
    /// up to date first.
    pub fn read<T: Data>(&mut self, identifier: &Identifier<T>) -> Result<T, GraphError> {
        self.check()?;
        let definition = identifier.definition();
        self.ensure_live(definition)?;
        let result = self
            .run_pass()
            .and_then(|()| self.resolve(identifier.id()));
        match result {
            Ok(value) => downcast(&value, definition),
            Err(error) => {
                warn!(%error, "read failed, transaction poisoned");
                self.poisoned = Some(error.clone());
                Err(error)
            }
        }
    }

    /// [`read`](Self::read) once no commit is in flight on the checkout.
    pub async fn read_async<T: Data>(
        &mut self,
        identifier: &Identifier<T>,
    ) -> Result<T, GraphError> {
        self.checkout.idle().await;
        self.read(identifier)
    }

    /// Discard the transaction.
    pub fn rollback(self) {
        debug!(
            base = self.base.clock(),
            writes = self.intent.writes.len(),
            "transaction rolled back"
        );
    }

    fn run_pass(&mut self) -> Result<(), GraphError> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let staged = std::mem::take(&mut self.staged);
        let clock = self.clock();
        self.epoch += 1;
        let mut engine = Propagation::new(
            Scope::new(self.checkout.identifiers(), &self.intent.removed),
            &self.base,
            clock,
            self.epoch,
            &mut self.slots,
            &staged.forced,
            &mut self.recalculated,
        );
        engine.walk(&staged.seeds(), &staged.removed)?;
        engine.run_to_completion()
    }

    fn resolve(&mut self, id: IdentifierId) -> Result<Value, GraphError> {
        let clock = self.clock();
        let mut engine = Propagation::new(
            Scope::new(self.checkout.identifiers(), &self.intent.removed),
            &self.base,
            clock,
            self.epoch,
            &mut self.slots,
            &self.staged.forced,
            &mut self.recalculated,
        );
        engine.resolve(id)
    }

    /// Stage structural changes made since the transaction was opened.
    /// Changes it already staged are not run again.
    fn absorb(&mut self, pending: &Pending) {
        for &id in &pending.touched {
            if self.intent.touched.insert(id) {
                self.staged.touched.insert(id);
            }
        }
        for &id in &pending.removed {
            if self.intent.removed.insert(id) {
                self.staged.removed.insert(id);
            }
        }
    }

    fn rebase(&mut self, head: Arc<Revision>) -> Result<(), GraphError> {
        debug!(from = self.base.clock(), to = head.clock(), "rebasing transaction");
        self.base = head;
        self.slots.clear();
        self.recalculated.clear();

        let intent = self.intent.clone();
        for write in intent.writes.values() {
            if self.ensure_live(&write.definition).is_err() {
                warn!(
                    identifier = %write.definition.label(),
                    "dropping write to removed identifier"
                );
                continue;
            }
            let quark = self.get_write_target(&write.definition)?;
            write
                .definition
                .write(quark, Arc::clone(&write.value), write.args.clone());
        }
        self.staged = intent;
        Ok(())
    }

    /// Drop the edges pointing at identifiers this transaction removes, so
    /// their former dependencies are published without them.
    fn forget_removed(&mut self) {
        let removed: Vec<IdentifierId> = self.intent.removed.iter().copied().collect();
        let clock = self.clock();
        for &id in &removed {
            let Some(prior) = self.base.get(id) else {
                continue;
            };
            for &dependency in prior.dependencies() {
                if self.slots.contains_key(&dependency)
                    || self.intent.removed.contains(&dependency)
                {
                    continue;
                }
                if let Some(slot) = self.base.get(dependency) {
                    if slot.dependents().contains(&id) {
                        self.slots.insert(dependency, Slot::Shadow(ShadowQuark::new(slot, clock)));
                    }
                }
            }
        }
        for slot in self.slots.values_mut() {
            for &id in &removed {
                slot.remove_dependent(id);
            }
        }
    }

    /// Propagate and publish a new revision.
    #[tracing::instrument(name = "commit", skip(self), fields(base = self.base.clock()))]
    pub fn commit(mut self) -> Result<PropagationResult, GraphError> {
        if let Some(error) = self.poisoned.take() {
            warn!(%error, "commit of a failed transaction");
            return Err(error);
        }

        let checkout = self.checkout.clone();
        let result = {
            let _guard = checkout.lock_commit();
            checkout.set_phase(CommitPhase::Committing);
            let result = self.commit_locked(&checkout);
            checkout.set_phase(CommitPhase::Idle);
            result
        };

        let (result, leaving) = result?;
        for definition in leaving {
            definition.leave_graph(&checkout);
        }
        Ok(result)
    }

    fn commit_locked(
        &mut self,
        checkout: &Checkout,
    ) -> Result<(PropagationResult, Vec<Arc<IdentifierDef>>), GraphError> {
        let pending = checkout.take_pending();
        self.absorb(&pending);

        let head = checkout.revision();
        let outcome = if Arc::ptr_eq(&head, &self.base) {
            self.run_pass()
        } else {
            self.rebase(head).and_then(|()| self.run_pass())
        };
        if let Err(error) = outcome {
            warn!(%error, "propagation failed, transaction discarded");
            checkout.restore_pending(pending);
            return Err(error);
        }

        self.forget_removed();
        let clock = self.clock();
        let mut scope = IndexMap::new();
        for (id, slot) in self.slots.drain(..) {
            if self.intent.removed.contains(&id) {
                continue;
            }
            match slot {
                Slot::Quark(mut quark) => {
                    quark.seal();
                    scope.insert(id, Arc::new(Slot::Quark(quark)));
                }
                Slot::Shadow(mut shadow) if shadow.edges_changed => {
                    shadow.seal();
                    scope.insert(id, Arc::new(Slot::Shadow(shadow)));
                }
                Slot::Shadow(_) => {}
            }
        }
        let tombstones: IndexSet<IdentifierId> = self
            .intent
            .removed
            .iter()
            .copied()
            .filter(|&id| self.base.get(id).is_some())
            .collect();
        let leaving: Vec<Arc<IdentifierDef>> = self
            .intent
            .removed
            .iter()
            .filter_map(|&id| checkout.unregister(id))
            .collect();
        let recalculated = std::mem::take(&mut self.recalculated);

        if scope.is_empty() && tombstones.is_empty() {
            debug!("nothing to publish");
            let result = PropagationResult {
                revision: Arc::clone(&self.base),
                recalculated,
                committed: false,
            };
            return Ok((result, leaving));
        }

        let published = scope.len();
        let revision = Arc::new(Revision::publish(
            &self.base,
            clock,
            scope,
            tombstones,
            checkout.config().compaction_depth,
        ));
        checkout.publish(Arc::clone(&revision));
        debug!(
            clock,
            published,
            recalculated = recalculated.len(),
            "revision published"
        );

        let result = PropagationResult {
            revision,
            recalculated,
            committed: true,
        };
        Ok((result, leaving))
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("base", &self.base.clock())
            .field("slots", &self.slots.len())
            .field("writes", &self.intent.writes.len())
            .field("poisoned", &self.poisoned.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::IdentifierBuilder;

    #[test]
    fn staged_writes_are_invisible_outside() {
        let graph = Checkout::new();
        let x = Identifier::<i32>::variable("x");
        graph.add_node(&x).unwrap();
        graph.write(&x, 1).unwrap();

        let mut txn = graph.transaction();
        txn.write(&x, 2).unwrap();
        assert_eq!(txn.read(&x).unwrap(), 2);
        assert_eq!(graph.read(&x).unwrap(), 1);

        txn.rollback();
        assert_eq!(graph.read(&x).unwrap(), 1);
    }

    #[test]
    fn write_target_is_acquired_in_transaction_scope() {
        let graph = Checkout::new();
        let x = Identifier::<i32>::variable("x");
        graph.add_node(&x).unwrap();
        let committed = graph.write(&x, 1).unwrap().revision;

        let mut txn = graph.transaction();
        let quark = txn.get_write_target(&x).unwrap();
        assert_eq!(quark.created_at(), committed.clock() + 1);
        assert!(Arc::ptr_eq(quark.previous().unwrap(), committed.own(x.id()).unwrap()));
    }

    #[test]
    fn reads_see_recalculated_values_before_commit() {
        let graph = Checkout::new();
        let x = Identifier::<i32>::variable("x");
        let source = x.clone();
        let double = IdentifierBuilder::<i32>::calculated("double")
            .calculation(move |ctx| Ok(ctx.read(&source)? * 2))
            .build();
        graph.add_node(&x).unwrap();
        graph.add_node(&double).unwrap();
        graph.write(&x, 2).unwrap();

        let mut txn = graph.transaction();
        txn.write(&x, 5).unwrap();
        assert_eq!(txn.read(&double).unwrap(), 10);
        txn.write(&x, 6).unwrap();
        assert_eq!(txn.read(&double).unwrap(), 12);

        let result = txn.commit().unwrap();
        assert!(result.committed);
        assert_eq!(result.revision.read(&double), Some(12));
        assert_eq!(graph.read(&double).unwrap(), 12);
    }

    #[test]
    fn commit_rebases_onto_moved_head() {
        let graph = Checkout::new();
        let a = Identifier::<i32>::variable("a");
        let b = Identifier::<i32>::variable("b");
        let (ra, rb) = (a.clone(), b.clone());
        let sum = IdentifierBuilder::<i32>::calculated("sum")
            .calculation(move |ctx| Ok(ctx.read(&ra)? + ctx.read(&rb)?))
            .build();
        for node in [a.definition(), b.definition(), sum.definition()] {
            graph.add_node(node).unwrap();
        }
        let mut setup = graph.transaction();
        setup.write(&a, 1).unwrap();
        setup.write(&b, 1).unwrap();
        setup.commit().unwrap();

        let mut slow = graph.transaction();
        slow.write(&a, 10).unwrap();
        assert_eq!(slow.read(&sum).unwrap(), 11);

        graph.write(&b, 100).unwrap();
        let result = slow.commit().unwrap();
        assert_eq!(result.revision.clock(), 3);
        assert_eq!(graph.read(&sum).unwrap(), 110);
    }

    #[test]
    fn empty_commit_publishes_nothing() {
        let graph = Checkout::new();
        let before = graph.revision();
        let result = graph.transaction().commit().unwrap();
        assert!(!result.committed);
        assert!(Arc::ptr_eq(&result.revision, &before));
        assert!(Arc::ptr_eq(&graph.revision(), &before));
    }

    #[test]
    fn failed_read_poisons_transaction() {
        let graph = Checkout::new();
        let x = Identifier::<i32>::variable("x");
        graph.add_node(&x).unwrap();

        let mut txn = graph.transaction();
        let err = txn.read(&x).unwrap_err();
        assert!(matches!(err, GraphError::Uninitialized { .. }));
        assert!(txn.write(&x, 1).is_err());
        assert!(txn.commit().is_err());
    }

    #[test]
    fn removal_is_staged_until_commit() {
        let graph = Checkout::new();
        let x = Identifier::<i32>::variable("x");
        graph.add_node(&x).unwrap();
        graph.write(&x, 1).unwrap();

        let mut txn = graph.transaction();
        txn.remove(&x).unwrap();
        assert!(matches!(txn.read(&x), Err(GraphError::UnknownIdentifier { .. })));
        assert!(graph.contains(&x));

        let mut txn = graph.transaction();
        txn.remove(&x).unwrap();
        let result = txn.commit().unwrap();
        assert!(result.revision.is_tombstoned(x.id()));
        assert!(!graph.contains(&x));
    }
}
