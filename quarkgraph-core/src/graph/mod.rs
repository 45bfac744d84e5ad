//! Versioned Dependency Graph
//!
//! This module holds the storage side of the engine and the scheduler that
//! keeps it consistent.
//!
//! # Overview
//!
//! - [`Quark`]: the state of one identifier in one revision. It carries its
//!   outgoing edges (`dependents`) next to its value, so a node version and its
//!   adjacency list share one allocation.
//! - [`Slot`]: an owned quark, or a read-only [`ShadowQuark`] reading through
//!   a quark of an earlier revision.
//! - [`Revision`]: an immutable snapshot storing only the slots created in it,
//!   chained to its predecessor.
//! - `scheduler`: the propagation pass run by transactions.
//!
//! Edges are discovered at runtime. A calculation reading another identifier
//! records the edge on both ends: the reader lists the dependency, the
//! dependency lists the reader as a dependent.

mod quark;
mod revision;
pub(crate) mod scheduler;

pub use quark::{EdgesFlow, Quark, ShadowQuark, Slot};
pub use revision::{Revision, RevisionClock};
