//! Quarks
//!
//! A quark is the state of one identifier within one revision: its value, the
//! value proposed for it by the transaction being prepared, and its edges.
//!
//! # Copy-on-write
//!
//! Revisions only store the quarks created in them. A quark keeps a link to
//! the slot of the same identifier in the preceding revision (`previous`), so
//! unchanged nodes are shared by every later revision instead of being copied.
//!
//! When a transaction needs a node only for traversal, or only to record a new
//! dependent, it places a [`ShadowQuark`] in its scope: a read-only view that
//! resolves its value through `origin`, the owned quark of an earlier
//! revision. Before any value is written the slot must be acquired with
//! [`Slot::acquire`], which materializes an owned [`Quark`] for the current
//! revision. The owned/shadow distinction is the variant of [`Slot`].

use std::fmt;
use std::sync::Arc;

use indexmap::IndexSet;
use smallvec::SmallVec;

use super::RevisionClock;
use crate::error::GraphError;
use crate::identifier::{IdentifierDef, IdentifierId, Value, WriteArgs};

/// Readiness counter of a node during propagation.
///
/// Counts the incoming edges from nodes visited in the current pass that have
/// not resolved yet. A node is ready once the count reaches zero, or when it
/// is forced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EdgesFlow(i64);

impl EdgesFlow {
    /// Sentinel: ready regardless of pending incoming edges.
    pub const FORCED: EdgesFlow = EdgesFlow(-1);

    pub fn is_forced(&self) -> bool {
        self.0 < 0
    }

    pub fn is_ready(&self) -> bool {
        self.0 <= 0
    }

    /// Number of pending incoming edges, `None` when forced.
    pub fn pending(&self) -> Option<u32> {
        u32::try_from(self.0).ok()
    }

    pub(crate) fn increment(&mut self) {
        if !self.is_forced() {
            self.0 += 1;
        }
    }

    pub(crate) fn decrement(&mut self) {
        if self.0 > 0 {
            self.0 -= 1;
        }
    }
}

/// How far propagation got with a node in the current pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Resolution {
    #[default]
    Unvisited,
    /// Reached by the walk, not resolved yet.
    Pending,
    /// Being calculated or verified. Reaching it again is a cycle.
    InProgress,
    /// Resolved in this pass.
    Resolved { changed: bool },
}

/// Traversal bookkeeping, private to the transaction owning the slot.
#[derive(Debug, Clone, Default)]
pub(crate) struct Walk {
    pub(crate) edges_flow: EdgesFlow,
    pub(crate) visited_at: Option<RevisionClock>,
    pub(crate) visit_epoch: u64,
    /// A written value or a changed dependency requires recalculation.
    pub(crate) dirty: bool,
    pub(crate) resolution: Resolution,
    /// Dependents counted by the walk, notified on resolution.
    pub(crate) outgoing: SmallVec<[IdentifierId; 4]>,
}

impl Walk {
    pub(crate) fn begin(&mut self, clock: RevisionClock, epoch: u64) {
        *self = Walk {
            visited_at: Some(clock),
            visit_epoch: epoch,
            resolution: Resolution::Pending,
            ..Walk::default()
        };
    }

    pub(crate) fn is_pending(&self, epoch: u64) -> bool {
        self.visit_epoch == epoch && self.resolution == Resolution::Pending
    }

    pub(crate) fn is_unresolved(&self, epoch: u64) -> bool {
        self.visit_epoch == epoch
            && matches!(self.resolution, Resolution::Pending | Resolution::InProgress)
    }
}

/// State of a running calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum CalcState {
    #[default]
    NotStarted,
    Running,
    Completed,
}

/// Owned state of one identifier in one revision.
#[derive(Clone)]
pub struct Quark {
    pub(crate) identifier: Arc<IdentifierDef>,
    pub(crate) created_at: RevisionClock,
    pub(crate) value: Option<Value>,
    pub(crate) proposed_value: Option<Value>,
    pub(crate) proposed_args: Option<WriteArgs>,
    built_proposed_value: Option<Option<Value>>,
    pub(crate) used_proposed_or_current: bool,
    /// Value dependents observed when the node last resolved in this transaction.
    pub(crate) settled: Option<Value>,
    pub(crate) previous: Option<Arc<Slot>>,
    pub(crate) dependents: IndexSet<IdentifierId>,
    pub(crate) dependencies: SmallVec<[IdentifierId; 4]>,
    pub(crate) calculation: CalcState,
    pub(crate) walk: Walk,
}

impl Quark {
    /// Create the quark of `identifier` for the revision at `created_at`.
    ///
    /// Value and edges start out as those of `previous`.
    pub fn new(
        identifier: Arc<IdentifierDef>,
        created_at: RevisionClock,
        previous: Option<Arc<Slot>>,
    ) -> Self {
        let (value, dependents, dependencies) = match &previous {
            Some(prior) => (
                prior.value().cloned(),
                prior.dependents().clone(),
                prior.dependencies().iter().copied().collect(),
            ),
            None => (None, IndexSet::new(), SmallVec::new()),
        };
        Self {
            identifier,
            created_at,
            value,
            proposed_value: None,
            proposed_args: None,
            built_proposed_value: None,
            used_proposed_or_current: false,
            settled: None,
            previous,
            dependents,
            dependencies,
            calculation: CalcState::NotStarted,
            walk: Walk::default(),
        }
    }

    pub fn identifier(&self) -> &Arc<IdentifierDef> {
        &self.identifier
    }

    /// Clock of the revision this quark belongs to.
    pub fn created_at(&self) -> RevisionClock {
        self.created_at
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn set_value(&mut self, value: Value) {
        self.value = Some(value);
    }

    pub(crate) fn set_proposed_value(&mut self, value: Value) {
        self.proposed_value = Some(value);
    }

    pub(crate) fn set_proposed_args(&mut self, args: Option<WriteArgs>) {
        self.proposed_args = args;
    }

    /// Whether a value was explicitly proposed for this quark.
    pub fn has_proposed_value(&self) -> bool {
        self.proposed_value.is_some()
    }

    pub fn proposed_args(&self) -> Option<&WriteArgs> {
        self.proposed_args.as_ref()
    }

    /// The explicitly proposed value, else the identifier's default proposal.
    ///
    /// The default is built at most once per quark.
    pub fn proposed_value(&mut self) -> Option<Value> {
        if let Some(value) = &self.proposed_value {
            return Some(value.clone());
        }
        if self.built_proposed_value.is_none() {
            let previous = self.committed_value();
            let built = self.identifier.build_proposed_value(previous.as_ref());
            self.built_proposed_value = Some(built);
        }
        self.built_proposed_value.clone().flatten()
    }

    /// Whether a calculation asked for the proposed or current value.
    pub fn used_proposed_or_current(&self) -> bool {
        self.used_proposed_or_current
    }

    /// Nearest value committed by an earlier revision.
    pub fn committed_value(&self) -> Option<Value> {
        let mut cursor = self.previous.as_ref();
        while let Some(slot) = cursor {
            if let Some(value) = slot.value() {
                return Some(value.clone());
            }
            cursor = slot.previous();
        }
        None
    }

    pub fn previous(&self) -> Option<&Arc<Slot>> {
        self.previous.as_ref()
    }

    /// Identifiers reading this one.
    pub fn dependents(&self) -> &IndexSet<IdentifierId> {
        &self.dependents
    }

    /// Identifiers read by the last calculation.
    pub fn dependencies(&self) -> &[IdentifierId] {
        &self.dependencies
    }

    pub fn edges_flow(&self) -> EdgesFlow {
        self.walk.edges_flow
    }

    pub fn visited_at(&self) -> Option<RevisionClock> {
        self.walk.visited_at
    }

    pub fn visit_epoch(&self) -> u64 {
        self.walk.visit_epoch
    }

    /// Make the node ready for recalculation regardless of its incoming edges.
    pub fn force_calculation(&mut self) {
        self.walk.edges_flow = EdgesFlow::FORCED;
    }

    /// Sever the link to the previous revision and drop calculation state.
    pub fn cleanup(&mut self) {
        self.previous = None;
        self.calculation = CalcState::NotStarted;
        self.settled = None;
        self.walk = Walk::default();
    }

    /// Drop transaction-only state before the quark is published.
    pub(crate) fn seal(&mut self) {
        self.proposed_value = None;
        self.proposed_args = None;
        self.built_proposed_value = None;
        self.used_proposed_or_current = false;
        self.settled = None;
        self.calculation = CalcState::NotStarted;
        self.walk = Walk::default();
    }
}

impl fmt::Debug for Quark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Quark")
            .field("identifier", &self.identifier.label())
            .field("created_at", &self.created_at)
            .field("has_value", &self.value.is_some())
            .field("has_previous", &self.previous.is_some())
            .field("dependents", &self.dependents)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

/// Read-only view of a node that has not been materialized in its revision.
#[derive(Clone)]
pub struct ShadowQuark {
    pub(crate) identifier: Arc<IdentifierDef>,
    pub(crate) created_at: RevisionClock,
    /// Always an owned quark of an earlier revision.
    pub(crate) origin: Arc<Slot>,
    pub(crate) previous: Arc<Slot>,
    pub(crate) dependents: IndexSet<IdentifierId>,
    /// Dependents were added, so the shadow must be published.
    pub(crate) edges_changed: bool,
    pub(crate) walk: Walk,
}

impl ShadowQuark {
    /// Shadow `prior`, the slot of the same identifier in the base revision.
    pub(crate) fn new(prior: &Arc<Slot>, created_at: RevisionClock) -> Self {
        let origin = match &**prior {
            Slot::Quark(_) => Arc::clone(prior),
            Slot::Shadow(shadow) => Arc::clone(&shadow.origin),
        };
        Self {
            identifier: Arc::clone(prior.identifier()),
            created_at,
            origin,
            previous: Arc::clone(prior),
            dependents: prior.dependents().clone(),
            edges_changed: false,
            walk: Walk::default(),
        }
    }

    pub fn identifier(&self) -> &Arc<IdentifierDef> {
        &self.identifier
    }

    pub fn created_at(&self) -> RevisionClock {
        self.created_at
    }

    /// The owned slot this shadow reads through.
    pub fn origin(&self) -> &Arc<Slot> {
        &self.origin
    }

    pub fn dependents(&self) -> &IndexSet<IdentifierId> {
        &self.dependents
    }

    fn origin_quark(&self) -> &Quark {
        match &*self.origin {
            Slot::Quark(quark) => quark,
            Slot::Shadow(shadow) => shadow.origin_quark(),
        }
    }

    /// An owned quark for this shadow's revision, keeping edges and walk state.
    fn materialize(&self) -> Quark {
        let mut quark = Quark::new(
            Arc::clone(&self.identifier),
            self.created_at,
            Some(Arc::clone(&self.previous)),
        );
        quark.dependents = self.dependents.clone();
        quark.walk = self.walk.clone();
        quark
    }

    pub(crate) fn seal(&mut self) {
        self.edges_changed = false;
        self.walk = Walk::default();
    }
}

impl fmt::Debug for ShadowQuark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShadowQuark")
            .field("identifier", &self.identifier.label())
            .field("created_at", &self.created_at)
            .field("origin_created_at", &self.origin.created_at())
            .field("dependents", &self.dependents)
            .finish()
    }
}

/// The place of one identifier in a revision.
#[derive(Debug, Clone)]
pub enum Slot {
    Quark(Quark),
    Shadow(ShadowQuark),
}

impl Slot {
    pub fn identifier(&self) -> &Arc<IdentifierDef> {
        match self {
            Slot::Quark(quark) => &quark.identifier,
            Slot::Shadow(shadow) => &shadow.identifier,
        }
    }

    pub fn created_at(&self) -> RevisionClock {
        match self {
            Slot::Quark(quark) => quark.created_at,
            Slot::Shadow(shadow) => shadow.created_at,
        }
    }

    pub fn is_shadow(&self) -> bool {
        matches!(self, Slot::Shadow(_))
    }

    /// The value, read through the origin for shadows.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Slot::Quark(quark) => quark.value.as_ref(),
            Slot::Shadow(shadow) => shadow.origin.value(),
        }
    }

    /// Set the value of an owned quark. Shadows must be acquired first.
    pub fn set_value(&mut self, value: Value) -> Result<(), GraphError> {
        match self {
            Slot::Quark(quark) => {
                quark.set_value(value);
                Ok(())
            }
            Slot::Shadow(shadow) => Err(GraphError::ShadowMutation {
                identifier: shadow.identifier.label(),
            }),
        }
    }

    pub fn previous(&self) -> Option<&Arc<Slot>> {
        match self {
            Slot::Quark(quark) => quark.previous.as_ref(),
            Slot::Shadow(shadow) => Some(&shadow.previous),
        }
    }

    pub fn dependents(&self) -> &IndexSet<IdentifierId> {
        match self {
            Slot::Quark(quark) => &quark.dependents,
            Slot::Shadow(shadow) => &shadow.dependents,
        }
    }

    /// Record `dependent` as reading this node. Returns false if it already was.
    pub(crate) fn add_dependent(&mut self, dependent: IdentifierId) -> bool {
        match self {
            Slot::Quark(quark) => quark.dependents.insert(dependent),
            Slot::Shadow(shadow) => {
                let inserted = shadow.dependents.insert(dependent);
                shadow.edges_changed |= inserted;
                inserted
            }
        }
    }

    /// Forget `dependent`. Returns false if it was not recorded.
    pub(crate) fn remove_dependent(&mut self, dependent: IdentifierId) -> bool {
        match self {
            Slot::Quark(quark) => quark.dependents.shift_remove(&dependent),
            Slot::Shadow(shadow) => {
                let removed = shadow.dependents.shift_remove(&dependent);
                shadow.edges_changed |= removed;
                removed
            }
        }
    }

    pub fn dependencies(&self) -> &[IdentifierId] {
        match self {
            Slot::Quark(quark) => &quark.dependencies,
            Slot::Shadow(shadow) => shadow.origin.dependencies(),
        }
    }

    pub(crate) fn walk(&self) -> &Walk {
        match self {
            Slot::Quark(quark) => &quark.walk,
            Slot::Shadow(shadow) => &shadow.walk,
        }
    }

    pub(crate) fn walk_mut(&mut self) -> &mut Walk {
        match self {
            Slot::Quark(quark) => &mut quark.walk,
            Slot::Shadow(shadow) => &mut shadow.walk,
        }
    }

    pub fn as_quark(&self) -> Option<&Quark> {
        match self {
            Slot::Quark(quark) => Some(quark),
            Slot::Shadow(_) => None,
        }
    }

    pub fn as_quark_mut(&mut self) -> Option<&mut Quark> {
        match self {
            Slot::Quark(quark) => Some(quark),
            Slot::Shadow(_) => None,
        }
    }

    pub fn as_shadow(&self) -> Option<&ShadowQuark> {
        match self {
            Slot::Quark(_) => None,
            Slot::Shadow(shadow) => Some(shadow),
        }
    }

    /// Materialize an owned quark in place and return it for mutation.
    pub fn acquire(&mut self) -> &mut Quark {
        if let Slot::Shadow(shadow) = &*self {
            let quark = shadow.materialize();
            *self = Slot::Quark(quark);
        }
        match self {
            Slot::Quark(quark) => quark,
            Slot::Shadow(_) => unreachable!("shadow slot was just materialized"),
        }
    }

    /// A self-contained copy without links to earlier revisions.
    pub(crate) fn detached(&self) -> Slot {
        let mut quark = match self {
            Slot::Quark(quark) => quark.clone(),
            Slot::Shadow(shadow) => {
                let mut quark = shadow.origin_quark().clone();
                quark.dependents = shadow.dependents.clone();
                quark
            }
        };
        quark.cleanup();
        Slot::Quark(quark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::{Identifier, IdentifierBuilder};

    fn value(v: i32) -> Value {
        Arc::new(v)
    }

    fn read(value: Option<&Value>) -> Option<i32> {
        value.and_then(|v| v.downcast_ref::<i32>().copied())
    }

    fn committed(id: &Identifier<i32>, v: i32, clock: RevisionClock) -> Arc<Slot> {
        let mut quark = Quark::new(id.definition().clone(), clock, None);
        quark.set_value(value(v));
        Arc::new(Slot::Quark(quark))
    }

    #[test]
    fn edges_flow_counts_and_forces() {
        let mut flow = EdgesFlow::default();
        assert!(flow.is_ready());
        flow.increment();
        flow.increment();
        assert_eq!(flow.pending(), Some(2));
        assert!(!flow.is_ready());
        flow.decrement();
        flow.decrement();
        flow.decrement();
        assert_eq!(flow.pending(), Some(0));

        let mut forced = EdgesFlow::FORCED;
        forced.increment();
        assert!(forced.is_forced());
        assert!(forced.is_ready());
        assert_eq!(forced.pending(), None);
    }

    #[test]
    fn shadow_reads_through_origin_and_rejects_writes() {
        let id = Identifier::<i32>::variable("x");
        let prior = committed(&id, 7, 1);
        let mut slot = Slot::Shadow(ShadowQuark::new(&prior, 2));

        assert!(slot.is_shadow());
        assert_eq!(read(slot.value()), Some(7));
        let err = slot.set_value(value(8)).unwrap_err();
        assert!(matches!(err, GraphError::ShadowMutation { .. }));
        assert_eq!(read(slot.value()), Some(7));
    }

    #[test]
    fn shadow_of_shadow_keeps_owned_origin() {
        let id = Identifier::<i32>::variable("x");
        let prior = committed(&id, 1, 1);
        let shadow = Arc::new(Slot::Shadow(ShadowQuark::new(&prior, 2)));
        let again = ShadowQuark::new(&shadow, 3);

        assert!(Arc::ptr_eq(again.origin(), &prior));
        assert!(Arc::ptr_eq(&again.previous, &shadow));
    }

    #[test]
    fn acquire_materializes_owned_quark() {
        let id = Identifier::<i32>::variable("x");
        let prior = committed(&id, 1, 1);
        let mut slot = Slot::Shadow(ShadowQuark::new(&prior, 2));
        slot.add_dependent(IdentifierId::from(900));

        let quark = slot.acquire();
        assert_eq!(quark.created_at(), 2);
        assert!(Arc::ptr_eq(quark.previous().unwrap(), &prior));
        assert!(quark.dependents().contains(&IdentifierId::from(900)));
        quark.set_value(value(2));

        assert!(!slot.is_shadow());
        assert_eq!(read(slot.value()), Some(2));
        assert_eq!(read(prior.value()), Some(1));
    }

    #[test]
    fn new_dependents_mark_shadow_edges_changed() {
        let id = Identifier::<i32>::variable("x");
        let prior = committed(&id, 1, 1);
        let mut slot = Slot::Shadow(ShadowQuark::new(&prior, 2));

        assert!(slot.add_dependent(IdentifierId::from(901)));
        assert!(!slot.add_dependent(IdentifierId::from(901)));
        assert!(slot.as_shadow().unwrap().edges_changed);
        assert!(prior.dependents().is_empty());
    }

    #[test]
    fn dropped_dependents_mark_shadow_edges_changed() {
        let id = Identifier::<i32>::variable("x");
        let mut quark = Quark::new(id.definition().clone(), 1, None);
        quark.dependents.insert(IdentifierId::from(903));
        let prior = Arc::new(Slot::Quark(quark));
        let mut slot = Slot::Shadow(ShadowQuark::new(&prior, 2));

        assert!(!slot.remove_dependent(IdentifierId::from(904)));
        assert!(!slot.as_shadow().unwrap().edges_changed);
        assert!(slot.remove_dependent(IdentifierId::from(903)));
        assert!(slot.dependents().is_empty());
        assert!(slot.as_shadow().unwrap().edges_changed);
        assert_eq!(prior.dependents().len(), 1);
    }

    #[test]
    fn proposed_value_is_built_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        let id = IdentifierBuilder::<i32>::calculated("continued")
            .proposed_default(move |previous| {
                counter.fetch_add(1, Ordering::SeqCst);
                previous.map(|p| p * 10)
            })
            .build();
        let prior = committed(&id, 4, 1);
        let mut quark = Quark::new(id.definition().clone(), 2, Some(prior));

        assert_eq!(read(quark.proposed_value().as_ref()), Some(40));
        assert_eq!(read(quark.proposed_value().as_ref()), Some(40));
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        quark.set_proposed_value(value(5));
        assert!(quark.has_proposed_value());
        assert_eq!(read(quark.proposed_value().as_ref()), Some(5));
    }

    #[test]
    fn committed_value_skips_stale_versions() {
        let id = Identifier::<i32>::calculated("lazy");
        let first = committed(&id, 3, 1);
        let mut stale = Quark::new(id.definition().clone(), 2, Some(first));
        stale.value = None;
        let stale = Arc::new(Slot::Quark(stale));
        let current = Quark::new(id.definition().clone(), 3, Some(stale));

        assert_eq!(read(current.value()), None);
        assert_eq!(read(current.committed_value().as_ref()), Some(3));
    }

    #[test]
    fn cleanup_severs_previous() {
        let id = Identifier::<i32>::variable("x");
        let prior = committed(&id, 1, 1);
        let mut quark = Quark::new(id.definition().clone(), 2, Some(prior));
        quark.force_calculation();
        assert!(quark.edges_flow().is_forced());

        quark.cleanup();
        assert!(quark.previous().is_none());
        assert!(!quark.edges_flow().is_forced());
        assert_eq!(read(quark.value()), Some(1));
    }

    #[test]
    fn detached_shadow_becomes_standalone_quark() {
        let id = Identifier::<i32>::variable("x");
        let prior = committed(&id, 9, 1);
        let mut shadow = Slot::Shadow(ShadowQuark::new(&prior, 2));
        shadow.add_dependent(IdentifierId::from(902));

        let detached = shadow.detached();
        let quark = detached.as_quark().unwrap();
        assert!(quark.previous().is_none());
        assert_eq!(read(quark.value()), Some(9));
        assert!(quark.dependents().contains(&IdentifierId::from(902)));
    }
}
