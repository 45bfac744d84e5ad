//! Calculation Protocol
//!
//! A calculation produces the value of one identifier. It comes in two
//! flavours:
//!
//! - **Sync**: a plain function receiving a [`CalculationContext`]. Reading
//!   another identifier through the context resolves it on the spot, which
//!   may recurse into the propagation engine.
//!
//! - **Generator**: a resumable step machine implementing [`Generator`]. Each
//!   time it needs a value it returns [`Step::Yield`] with an [`Effect`] and
//!   is resumed with the resolved value. The engine drives generators from an
//!   explicit frame stack, so chains of generators do not grow the native
//!   stack.
//!
//! In both cases the dependencies of a node are discovered while its
//! calculation runs: every read records an edge.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use smallvec::SmallVec;

use super::{Identifier, IdentifierDef, IdentifierId};
use crate::error::GraphError;

/// Type-erased value stored in a quark.
pub type Value = Arc<dyn Any + Send + Sync>;

/// Extra arguments passed along with a write.
pub type WriteArgs = SmallVec<[Value; 2]>;

/// Something a calculation asks the engine for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Effect {
    /// The value of another identifier.
    Read(IdentifierId),
    /// The value proposed for the calculated identifier in this transaction,
    /// falling back to its current value.
    ProposedOrCurrent,
    /// The arguments the proposed value was written with, as `Option<WriteArgs>`.
    ProposedArgs,
}

/// Outcome of resuming a generator once.
pub enum Step<T> {
    /// Suspend until the effect is resolved.
    Yield(Effect),
    /// The calculation finished with a value.
    Done(T),
}

impl<T> Step<T> {
    /// Suspend to read `identifier`.
    pub fn read<U>(identifier: &Identifier<U>) -> Self {
        Step::Yield(Effect::Read(identifier.id()))
    }

    /// Suspend to read the proposed or current value of the running identifier.
    pub fn proposed_or_current() -> Self {
        Step::Yield(Effect::ProposedOrCurrent)
    }
}

/// Input a generator is resumed with.
///
/// The first resume carries nothing; every following one carries the
/// resolution of the effect yielded just before.
#[derive(Clone, Default)]
pub struct Resume(Option<Value>);

impl Resume {
    pub(crate) fn start() -> Self {
        Self(None)
    }

    pub(crate) fn with(value: Value) -> Self {
        Self(Some(value))
    }

    /// Returns true for the first resume of a generator.
    pub fn is_start(&self) -> bool {
        self.0.is_none()
    }

    /// The resolved value, if it has type `U`.
    pub fn get<U: Clone + 'static>(&self) -> Option<U> {
        self.0.as_ref().and_then(|v| v.downcast_ref::<U>().cloned())
    }

    /// The resolved value, failing when it is absent or has another type.
    pub fn value<U: Clone + 'static>(&self) -> anyhow::Result<U> {
        match self.get::<U>() {
            Some(value) => Ok(value),
            None => anyhow::bail!(
                "generator resumed without a {} value",
                std::any::type_name::<U>()
            ),
        }
    }

    /// The write arguments, when resumed after [`Effect::ProposedArgs`].
    pub fn args(&self) -> Option<WriteArgs> {
        self.get::<Option<WriteArgs>>().flatten()
    }
}

/// A resumable calculation producing a `T`.
///
/// Any `FnMut(Resume) -> anyhow::Result<Step<T>>` closure is a generator, so
/// a state machine can live in the closure's captured variables.
pub trait Generator<T>: Send {
    /// Advance the calculation.
    fn resume(&mut self, input: Resume) -> anyhow::Result<Step<T>>;
}

impl<T, F> Generator<T> for F
where
    F: FnMut(Resume) -> anyhow::Result<Step<T>> + Send,
{
    fn resume(&mut self, input: Resume) -> anyhow::Result<Step<T>> {
        self(input)
    }
}

/// Generator with its result type erased.
pub(crate) trait ErasedGenerator: Send {
    fn resume(&mut self, input: Resume) -> anyhow::Result<Step<Value>>;
}

struct TypedGenerator<G, T> {
    inner: G,
    _value: PhantomData<fn() -> T>,
}

impl<G, T> ErasedGenerator for TypedGenerator<G, T>
where
    G: Generator<T>,
    T: Send + Sync + 'static,
{
    fn resume(&mut self, input: Resume) -> anyhow::Result<Step<Value>> {
        Ok(match self.inner.resume(input)? {
            Step::Yield(effect) => Step::Yield(effect),
            Step::Done(value) => Step::Done(Arc::new(value) as Value),
        })
    }
}

pub(crate) fn erase_generator<G, T>(inner: G) -> Box<dyn ErasedGenerator>
where
    G: Generator<T> + 'static,
    T: Send + Sync + 'static,
{
    Box::new(TypedGenerator {
        inner,
        _value: PhantomData,
    })
}

/// Engine side of a running sync calculation.
pub(crate) trait Resolve {
    fn read(&mut self, dependency: IdentifierId) -> Result<Value, GraphError>;
    fn proposed_or_current(&mut self) -> Result<Value, GraphError>;
    fn proposed_args(&self) -> Option<WriteArgs>;
    fn definition(&self) -> &IdentifierDef;
}

/// Handle passed to sync calculations of an `Identifier<T>`.
pub struct CalculationContext<'a, T> {
    resolver: &'a mut dyn Resolve,
    _value: PhantomData<fn() -> T>,
}

impl<'a, T: Clone + 'static> CalculationContext<'a, T> {
    pub(crate) fn new(resolver: &'a mut dyn Resolve) -> Self {
        Self {
            resolver,
            _value: PhantomData,
        }
    }

    /// Read another identifier, recording it as a dependency.
    pub fn read<U: Clone + 'static>(
        &mut self,
        identifier: &Identifier<U>,
    ) -> Result<U, GraphError> {
        let value = self.resolver.read(identifier.id())?;
        downcast(&value, identifier.definition())
    }

    /// The value proposed for this identifier in the current transaction, or
    /// its current value when nothing was proposed.
    pub fn proposed_or_current(&mut self) -> Result<T, GraphError> {
        let value = self.resolver.proposed_or_current()?;
        downcast(&value, self.resolver.definition())
    }

    /// Arguments the proposed value was written with.
    pub fn proposed_args(&self) -> Option<WriteArgs> {
        self.resolver.proposed_args()
    }

    /// One write argument, if present and of type `A`.
    pub fn proposed_arg<A: Clone + 'static>(&self, index: usize) -> Option<A> {
        self.proposed_args()
            .and_then(|args| args.get(index).and_then(|a| a.downcast_ref::<A>().cloned()))
    }
}

pub(crate) type SyncFn = Arc<dyn Fn(&mut dyn Resolve) -> anyhow::Result<Value> + Send + Sync>;
pub(crate) type GeneratorFactory = Arc<dyn Fn() -> Box<dyn ErasedGenerator> + Send + Sync>;

/// Calculation of an identifier, with its value type erased.
#[derive(Clone)]
pub(crate) enum Calculation {
    /// Never invoked: variables get their value written directly.
    Abstract,
    Sync(SyncFn),
    Generator(GeneratorFactory),
}

impl Calculation {
    pub(crate) fn is_sync(&self) -> bool {
        !matches!(self, Calculation::Generator(_))
    }

    /// Default calculation of calculated values: keep what was proposed,
    /// otherwise keep the current value.
    pub(crate) fn proposed_or_current() -> Self {
        Calculation::Sync(Arc::new(|resolver: &mut dyn Resolve| {
            Ok(resolver.proposed_or_current()?)
        }))
    }
}

impl std::fmt::Debug for Calculation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Calculation::Abstract => f.write_str("Abstract"),
            Calculation::Sync(_) => f.write_str("Sync"),
            Calculation::Generator(_) => f.write_str("Generator"),
        }
    }
}

pub(crate) fn downcast<U: Clone + 'static>(
    value: &Value,
    def: &IdentifierDef,
) -> Result<U, GraphError> {
    value
        .downcast_ref::<U>()
        .cloned()
        .ok_or_else(|| GraphError::TypeMismatch {
            identifier: def.label(),
            expected: std::any::type_name::<U>(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_downcasts_values() {
        let start = Resume::start();
        assert!(start.is_start());
        assert_eq!(start.get::<i32>(), None);

        let resumed = Resume::with(Arc::new(7_i32));
        assert!(!resumed.is_start());
        assert_eq!(resumed.get::<i32>(), Some(7));
        assert_eq!(resumed.get::<String>(), None);
        assert!(resumed.value::<String>().is_err());
    }

    #[test]
    fn closures_are_generators() {
        let mut calls = 0;
        let mut generator = move |input: Resume| -> anyhow::Result<Step<i32>> {
            calls += 1;
            if input.is_start() {
                Ok(Step::Yield(Effect::ProposedOrCurrent))
            } else {
                Ok(Step::Done(input.value::<i32>()? + calls))
            }
        };

        assert!(matches!(
            generator.resume(Resume::start()).unwrap(),
            Step::Yield(Effect::ProposedOrCurrent)
        ));
        match generator.resume(Resume::with(Arc::new(40_i32))).unwrap() {
            Step::Done(value) => assert_eq!(value, 42),
            Step::Yield(_) => panic!("generator should have finished"),
        }
    }

    #[test]
    fn erased_generator_boxes_result() {
        let mut erased = erase_generator(|_: Resume| -> anyhow::Result<Step<String>> {
            Ok(Step::Done("done".to_string()))
        });
        match erased.resume(Resume::start()).unwrap() {
            Step::Done(value) => assert_eq!(value.downcast_ref::<String>().unwrap(), "done"),
            Step::Yield(_) => panic!("expected a value"),
        }
    }

    #[test]
    fn resume_exposes_write_args() {
        let args: WriteArgs = smallvec::smallvec![Arc::new("keep") as Value];
        let resumed = Resume::with(Arc::new(Some(args)));
        let args = resumed.args().unwrap();
        assert_eq!(args.len(), 1);
        assert_eq!(*args[0].downcast_ref::<&str>().unwrap(), "keep");
    }
}
