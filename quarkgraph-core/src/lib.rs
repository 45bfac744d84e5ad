//! Quarkgraph Core
//!
//! An incremental computation engine. Named, typed cells (identifiers) derive
//! their values from each other, and only the cells affected by a write are
//! recalculated. Writes are staged in transactions and committed atomically,
//! each commit publishing a new immutable revision layered copy-on-write over
//! the previous one.
//!
//! # Architecture
//!
//! - `identifier`: identifier definitions and the calculation protocol
//!   (plain functions, or resumable generators yielding read effects)
//! - `graph`: quarks, shadow quarks, revisions and the propagation engine
//! - `transaction`: write staging and the commit protocol
//! - `checkout`: the live graph, its head revision and undo history
//! - `config` / `error`: configuration and the error taxonomy
//!
//! # Example
//!
//! ```rust,ignore
//! use quarkgraph_core::{Checkout, Identifier, IdentifierBuilder};
//!
//! let first = Identifier::<String>::variable("firstName");
//! let last = Identifier::<String>::variable("lastName");
//! let (f, l) = (first.clone(), last.clone());
//! let full = IdentifierBuilder::<String>::calculated("fullName")
//!     .calculation(move |ctx| Ok(format!("{} {}", ctx.read(&f)?, ctx.read(&l)?)))
//!     .build();
//!
//! let graph = Checkout::new();
//! graph.add_node(&first)?;
//! graph.add_node(&last)?;
//! graph.add_node(&full)?;
//!
//! let mut txn = graph.transaction();
//! txn.write(&first, "Mark".into())?;
//! txn.write(&last, "Twain".into())?;
//! txn.commit()?;
//!
//! assert_eq!(graph.read(&full)?, "Mark Twain");
//! ```

pub mod checkout;
pub mod config;
pub mod error;
pub mod graph;
pub mod identifier;
pub mod transaction;

pub use checkout::{Checkout, CommitPhase};
pub use config::GraphConfig;
pub use error::GraphError;
pub use graph::{EdgesFlow, Quark, Revision, RevisionClock, ShadowQuark, Slot};
pub use identifier::{
    AsIdentifier, CalculationContext, Data, Effect, Generator, Identifier, IdentifierBuilder,
    IdentifierDef, IdentifierId, Level, Meta, QuarkKind, Resume, Step, Value, WriteArgs,
};
pub use transaction::{PropagationResult, Transaction};
