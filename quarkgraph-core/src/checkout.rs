//! Checkout
//!
//! The externally visible graph: the set of live identifiers plus the head
//! revision. A checkout is a cheap handle and can be cloned and shared across
//! threads; all clones see the same graph.
//!
//! ```rust,ignore
//! let graph = Checkout::new();
//! graph.add_node(&first)?;
//! graph.add_node(&full_name)?;
//! graph.write(&first, "Mark".to_string())?;
//! assert_eq!(graph.read(&full_name)?, "Mark Twain");
//! ```
//!
//! Reads of published revisions never block. Commits are serialized by a
//! commit lock, and `read_async` waits until no commit is in flight.
//! Calculations must not write to the checkout they are running in.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use indexmap::IndexSet;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tokio::sync::watch;
use tracing::debug;

use crate::config::GraphConfig;
use crate::error::GraphError;
use crate::graph::Revision;
use crate::identifier::calculation::downcast;
use crate::identifier::{AsIdentifier, Data, Identifier, IdentifierDef, IdentifierId, WriteArgs};
use crate::transaction::{PropagationResult, Transaction};

/// Whether a commit is running on a checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPhase {
    Idle,
    Committing,
}

/// Structural changes made since the last commit.
#[derive(Debug, Clone, Default)]
pub(crate) struct Pending {
    pub(crate) touched: IndexSet<IdentifierId>,
    pub(crate) removed: IndexSet<IdentifierId>,
}

#[derive(Default)]
struct History {
    undo: VecDeque<Arc<Revision>>,
    redo: Vec<Arc<Revision>>,
}

struct Inner {
    config: GraphConfig,
    identifiers: DashMap<IdentifierId, Arc<IdentifierDef>>,
    head: RwLock<Arc<Revision>>,
    history: Mutex<History>,
    pending: Mutex<Pending>,
    commit_lock: Mutex<()>,
    phase: watch::Sender<CommitPhase>,
}

/// A live view of the graph anchored at its head revision.
#[derive(Clone)]
pub struct Checkout {
    inner: Arc<Inner>,
}

impl Checkout {
    /// Create an empty checkout with the default configuration.
    pub fn new() -> Self {
        Self::build(GraphConfig::default())
    }

    /// Create an empty checkout.
    pub fn with_config(config: GraphConfig) -> Result<Self, GraphError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: GraphConfig) -> Self {
        let (phase, _) = watch::channel(CommitPhase::Idle);
        Self {
            inner: Arc::new(Inner {
                config,
                identifiers: DashMap::new(),
                head: RwLock::new(Arc::new(Revision::root())),
                history: Mutex::new(History::default()),
                pending: Mutex::new(Pending::default()),
                commit_lock: Mutex::new(()),
                phase,
            }),
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.inner.config
    }

    /// The head revision.
    pub fn revision(&self) -> Arc<Revision> {
        Arc::clone(&self.inner.head.read())
    }

    /// Whether a commit is running.
    pub fn phase(&self) -> CommitPhase {
        *self.inner.phase.borrow()
    }

    /// Whether `identifier` is part of this checkout.
    pub fn contains(&self, identifier: &impl AsIdentifier) -> bool {
        self.inner.identifiers.contains_key(&identifier.id())
    }

    /// Number of live identifiers.
    pub fn len(&self) -> usize {
        self.inner.identifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.identifiers.is_empty()
    }

    /// Add an identifier. It is calculated on the next commit.
    ///
    /// Adding an identifier that is already live does nothing.
    pub fn add_node(&self, identifier: &impl AsIdentifier) -> Result<(), GraphError> {
        let definition = identifier.definition();
        let id = definition.id();
        match self.inner.identifiers.entry(id) {
            Entry::Occupied(_) => {
                if self.inner.pending.lock().removed.shift_remove(&id) {
                    debug!(identifier = %definition.label(), "pending removal cancelled");
                }
                return Ok(());
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(definition));
            }
        }
        {
            let mut pending = self.inner.pending.lock();
            pending.removed.shift_remove(&id);
            pending.touched.insert(id);
        }
        debug!(identifier = %definition.label(), "identifier added");
        definition.enter_graph(self);

        if self.inner.config.auto_commit {
            self.propagate()?;
        }
        Ok(())
    }

    /// Stage the removal of an identifier. It leaves the checkout with the
    /// next successful commit, which recalculates its dependents and fails if
    /// they still read it.
    ///
    /// Removing an identifier that is not live does nothing.
    pub fn remove_node(&self, identifier: &impl AsIdentifier) -> Result<(), GraphError> {
        let definition = identifier.definition();
        let id = definition.id();
        if !self.contains(identifier) {
            return Ok(());
        }
        {
            let mut pending = self.inner.pending.lock();
            if !pending.removed.insert(id) {
                return Ok(());
            }
            pending.touched.shift_remove(&id);
        }
        debug!(identifier = %definition.label(), "identifier removal staged");

        if self.inner.config.auto_commit {
            self.propagate()?;
        }
        Ok(())
    }

    /// Read the committed value of `identifier`.
    ///
    /// Identifiers without a committed value (just added, or lazy) are
    /// calculated in a transaction that is committed right away.
    pub fn read<T: Data>(&self, identifier: &Identifier<T>) -> Result<T, GraphError> {
        let definition = identifier.definition();
        if !self.contains(identifier) {
            return Err(GraphError::UnknownIdentifier {
                identifier: definition.label(),
            });
        }
        let touched = self.inner.pending.lock().touched.contains(&identifier.id());
        if !touched {
            if let Some(value) = self.revision().value(identifier.id()) {
                return downcast(&value, definition);
            }
        }

        let mut transaction = self.transaction();
        let value = transaction.read(identifier)?;
        transaction.commit()?;
        Ok(value)
    }

    /// [`read`](Self::read) once no commit is in flight.
    pub async fn read_async<T: Data>(&self, identifier: &Identifier<T>) -> Result<T, GraphError> {
        self.idle().await;
        self.read(identifier)
    }

    /// Write `value` and commit immediately.
    pub fn write<T: Data>(
        &self,
        identifier: &Identifier<T>,
        value: T,
    ) -> Result<PropagationResult, GraphError> {
        self.write_with_args(identifier, value, None)
    }

    /// Write `value` along with write arguments and commit immediately.
    pub fn write_with_args<T: Data>(
        &self,
        identifier: &Identifier<T>,
        value: T,
        args: Option<WriteArgs>,
    ) -> Result<PropagationResult, GraphError> {
        let mut transaction = self.transaction();
        transaction.write_with_args(identifier, value, args)?;
        transaction.commit()
    }

    /// Commit pending structural changes.
    #[tracing::instrument(skip(self))]
    pub fn propagate(&self) -> Result<PropagationResult, GraphError> {
        self.transaction().commit()
    }

    /// Open a transaction on the head revision.
    pub fn transaction(&self) -> Transaction {
        let pending = self.inner.pending.lock().clone();
        Transaction::new(self.clone(), self.revision(), pending)
    }

    /// Move the head back to the previous revision. Returns false when the
    /// history is exhausted.
    ///
    /// Only revisions are restored; identifiers added or removed since stay so.
    pub fn undo(&self) -> bool {
        let _guard = self.inner.commit_lock.lock();
        let mut history = self.inner.history.lock();
        let Some(previous) = history.undo.pop_back() else {
            return false;
        };
        let clock = previous.clock();
        let current = std::mem::replace(&mut *self.inner.head.write(), previous);
        history.redo.push(current);
        debug!(clock, "undo");
        true
    }

    /// Re-apply the last undone revision. Returns false when there is none.
    pub fn redo(&self) -> bool {
        let _guard = self.inner.commit_lock.lock();
        let mut history = self.inner.history.lock();
        let Some(next) = history.redo.pop() else {
            return false;
        };
        let clock = next.clock();
        let current = std::mem::replace(&mut *self.inner.head.write(), next);
        history.undo.push_back(current);
        debug!(clock, "redo");
        true
    }

    pub(crate) fn identifiers(&self) -> &DashMap<IdentifierId, Arc<IdentifierDef>> {
        &self.inner.identifiers
    }

    pub(crate) fn lock_commit(&self) -> MutexGuard<'_, ()> {
        self.inner.commit_lock.lock()
    }

    pub(crate) fn set_phase(&self, phase: CommitPhase) {
        self.inner.phase.send_replace(phase);
    }

    pub(crate) async fn idle(&self) {
        let mut phase = self.inner.phase.subscribe();
        // The sender is owned by `self`, so the channel can not close here.
        let _ = phase.wait_for(|phase| *phase == CommitPhase::Idle).await;
    }

    pub(crate) fn take_pending(&self) -> Pending {
        std::mem::take(&mut *self.inner.pending.lock())
    }

    /// Put back structural changes of a failed commit.
    pub(crate) fn restore_pending(&self, restored: Pending) {
        let mut pending = self.inner.pending.lock();
        for id in restored.touched {
            if !pending.removed.contains(&id) {
                pending.touched.insert(id);
            }
        }
        for id in restored.removed {
            if !pending.touched.contains(&id) {
                pending.removed.insert(id);
            }
        }
    }

    pub(crate) fn unregister(&self, id: IdentifierId) -> Option<Arc<IdentifierDef>> {
        self.inner.identifiers.remove(&id).map(|(_, definition)| definition)
    }

    /// Make `revision` the head. Called with the commit lock held.
    pub(crate) fn publish(&self, revision: Arc<Revision>) {
        let mut history = self.inner.history.lock();
        let previous = std::mem::replace(&mut *self.inner.head.write(), revision);
        let limit = self.inner.config.history_limit;
        if limit > 0 {
            history.undo.push_back(previous);
            while history.undo.len() > limit {
                history.undo.pop_front();
            }
        }
        history.redo.clear();
    }
}

impl Default for Checkout {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Checkout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checkout")
            .field("clock", &self.revision().clock())
            .field("identifiers", &self.len())
            .field("config", &self.inner.config)
            .finish()
    }
}
