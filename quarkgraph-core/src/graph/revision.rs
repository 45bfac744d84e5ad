//! Revisions
//!
//! A revision is an immutable, clock-stamped state of the whole graph. It only
//! stores the slots created in it and reaches everything else through its
//! `previous` link, so a lookup walks the chain until the nearest revision
//! holding the identifier.
//!
//! Chains are bounded: once a commit would make the chain deeper than the
//! configured compaction depth, the new revision is published flattened, with
//! every visible slot copied in and no `previous` link.

use std::fmt;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use super::quark::Slot;
use crate::identifier::{Identifier, IdentifierId, Value};

/// Logical clock of a revision.
pub type RevisionClock = u64;

/// An immutable point in the timeline.
pub struct Revision {
    clock: RevisionClock,
    previous: Option<Arc<Revision>>,
    scope: IndexMap<IdentifierId, Arc<Slot>>,
    tombstones: IndexSet<IdentifierId>,
    depth: usize,
}

impl Revision {
    /// The empty revision every checkout starts from.
    pub fn root() -> Self {
        Self {
            clock: 0,
            previous: None,
            scope: IndexMap::new(),
            tombstones: IndexSet::new(),
            depth: 0,
        }
    }

    pub fn clock(&self) -> RevisionClock {
        self.clock
    }

    pub fn previous(&self) -> Option<&Arc<Revision>> {
        self.previous.as_ref()
    }

    /// Number of `previous` links behind this revision.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The slot of `id` as seen from this revision.
    pub fn get(&self, id: IdentifierId) -> Option<&Arc<Slot>> {
        let mut cursor = Some(self);
        while let Some(revision) = cursor {
            if let Some(slot) = revision.scope.get(&id) {
                return Some(slot);
            }
            if revision.tombstones.contains(&id) {
                return None;
            }
            cursor = revision.previous.as_deref();
        }
        None
    }

    /// The slot of `id` if it was created in this revision.
    pub fn own(&self, id: IdentifierId) -> Option<&Arc<Slot>> {
        self.scope.get(&id)
    }

    /// Identifiers with a slot created in this revision.
    pub fn scope(&self) -> impl Iterator<Item = IdentifierId> + '_ {
        self.scope.keys().copied()
    }

    /// Whether `id` was removed in this revision.
    pub fn is_tombstoned(&self, id: IdentifierId) -> bool {
        self.tombstones.contains(&id)
    }

    /// The committed value of `id`, `None` if absent or not calculated yet.
    pub fn value(&self, id: IdentifierId) -> Option<Value> {
        self.get(id).and_then(|slot| slot.value().cloned())
    }

    /// Typed read of a committed value.
    pub fn read<T: Clone + 'static>(&self, identifier: &Identifier<T>) -> Option<T> {
        self.value(identifier.id())
            .and_then(|value| value.downcast_ref::<T>().cloned())
    }

    /// Every slot reachable from this revision, newest version first.
    pub fn visible(&self) -> IndexMap<IdentifierId, Arc<Slot>> {
        let mut visible = IndexMap::new();
        let mut removed = IndexSet::new();
        let mut cursor = Some(self);
        while let Some(revision) = cursor {
            for (id, slot) in &revision.scope {
                if !removed.contains(id) && !visible.contains_key(id) {
                    visible.insert(*id, Arc::clone(slot));
                }
            }
            removed.extend(revision.tombstones.iter().copied());
            cursor = revision.previous.as_deref();
        }
        visible
    }

    /// Build the revision following `base`.
    pub(crate) fn publish(
        base: &Arc<Revision>,
        clock: RevisionClock,
        scope: IndexMap<IdentifierId, Arc<Slot>>,
        tombstones: IndexSet<IdentifierId>,
        compaction_depth: usize,
    ) -> Self {
        let depth = base.depth + 1;
        if depth <= compaction_depth {
            return Self {
                clock,
                previous: Some(Arc::clone(base)),
                scope,
                tombstones,
                depth,
            };
        }

        tracing::debug!(clock, depth, "flattening revision chain");
        let mut flat: IndexMap<IdentifierId, Arc<Slot>> = base
            .visible()
            .into_iter()
            .filter(|(id, _)| !tombstones.contains(id) && !scope.contains_key(id))
            .collect();
        flat.extend(scope);
        let scope = flat
            .into_iter()
            .map(|(id, slot)| (id, Arc::new(slot.detached())))
            .collect();
        Self {
            clock,
            previous: None,
            scope,
            tombstones: IndexSet::new(),
            depth: 0,
        }
    }
}

impl fmt::Debug for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Revision")
            .field("clock", &self.clock)
            .field("depth", &self.depth)
            .field("scope", &self.scope.keys().collect::<Vec<_>>())
            .field("tombstones", &self.tombstones)
            .finish()
    }
}
