//! Identifiers
//!
//! An identifier is the immutable definition of one node kind in the graph:
//! how its value is calculated, how two values are compared, its scheduling
//! level and whether it is written from outside (a variable) or derived (a
//! calculated value).
//!
//! # Typed and erased forms
//!
//! The engine stores definitions type-erased as [`IdentifierDef`], sharing
//! them behind an `Arc`. Callers hold an [`Identifier<T>`], a cheap typed
//! handle over the same definition, so reads and writes are checked at
//! compile time.
//!
//! ```rust,ignore
//! let first = Identifier::<String>::variable("firstName");
//! let last = Identifier::<String>::variable("lastName");
//!
//! let (f, l) = (first.clone(), last.clone());
//! let full = IdentifierBuilder::<String>::calculated("fullName")
//!     .calculation(move |ctx| Ok(format!("{} {}", ctx.read(&f)?, ctx.read(&l)?)))
//!     .build();
//! ```

pub mod calculation;

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use calculation::{
    CalculationContext, Effect, Generator, Resume, Step, Value, WriteArgs,
};

use calculation::{erase_generator, Calculation, Resolve};

use crate::checkout::Checkout;
use crate::error::GraphError;
use crate::graph::Quark;
use crate::transaction::Transaction;
use crate::PropagationResult;

/// Unique identifier of a node definition.
///
/// Ids are handed out in creation order, which the propagation engine uses to
/// break ties between nodes of the same level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentifierId(u64);

impl IdentifierId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl From<u64> for IdentifierId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for IdentifierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Coarse scheduling priority. Lower levels are recalculated first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Level(pub u32);

impl Level {
    /// Constants and inputs.
    pub const CONSTANT: Level = Level(0);
    /// Nodes reading only constants.
    pub const DEPENDS_ONLY_ON_CONSTANT: Level = Level(1);
    /// General derived nodes.
    pub const DEPENDS_ON_SELF_KIND: Level = Level(10);
}

impl Default for Level {
    fn default() -> Self {
        Level::DEPENDS_ON_SELF_KIND
    }
}

/// Which quark variant an identifier instantiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuarkKind {
    /// Externally written; the write sets the quark value directly.
    Variable,
    /// Derived by running the calculation.
    Calculated,
}

/// Descriptive attributes of an identifier.
#[derive(Debug, Clone)]
pub struct Meta {
    /// Human readable name, used in errors and logs.
    pub name: Arc<str>,
    /// Scheduling level.
    pub level: Level,
    /// Calculated only when read, not eagerly during propagation.
    pub lazy: bool,
    /// Whether the calculation is a plain function rather than a generator.
    pub sync: bool,
    /// Whether a started calculation always runs to completion.
    pub total: bool,
    /// Quark variant selector.
    pub kind: QuarkKind,
}

type EqualityFn = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;
type BuildFn = Arc<dyn Fn(Option<&Value>) -> Option<Value> + Send + Sync>;
type HookFn = Arc<dyn Fn(&Checkout) + Send + Sync>;

/// Type-erased identifier definition.
pub struct IdentifierDef {
    id: IdentifierId,
    meta: Meta,
    calculation: Calculation,
    equality: EqualityFn,
    build_proposed: Option<BuildFn>,
    on_enter: Option<HookFn>,
    on_leave: Option<HookFn>,
}

impl IdentifierDef {
    /// The unique id of this definition.
    pub fn id(&self) -> IdentifierId {
        self.id
    }

    /// Descriptive attributes.
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// The identifier's name.
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// `name#id`, used in diagnostics.
    pub fn label(&self) -> String {
        format!("{}{}", self.meta.name, self.id)
    }

    pub fn is_variable(&self) -> bool {
        self.meta.kind == QuarkKind::Variable
    }

    pub(crate) fn calculation(&self) -> &Calculation {
        &self.calculation
    }

    /// Compare two values with the identifier's equality predicate.
    pub fn equality(&self, a: &Value, b: &Value) -> bool {
        (self.equality)(a, b)
    }

    /// Synthesize a default proposed value from the previous one.
    pub(crate) fn build_proposed_value(&self, previous: Option<&Value>) -> Option<Value> {
        self.build_proposed.as_ref().and_then(|build| build(previous))
    }

    /// Place a proposed value into `quark`.
    ///
    /// Variables take the value directly; calculated values record it as the
    /// proposed value, to be consumed by their calculation.
    pub fn write(&self, quark: &mut Quark, value: Value, args: Option<WriteArgs>) {
        match self.meta.kind {
            QuarkKind::Variable => quark.set_value(value),
            QuarkKind::Calculated => quark.set_proposed_value(value),
        }
        quark.set_proposed_args(args);
    }

    pub(crate) fn enter_graph(&self, checkout: &Checkout) {
        if let Some(hook) = &self.on_enter {
            hook(checkout);
        }
    }

    pub(crate) fn leave_graph(&self, checkout: &Checkout) {
        if let Some(hook) = &self.on_leave {
            hook(checkout);
        }
    }
}

impl fmt::Debug for IdentifierDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentifierDef")
            .field("id", &self.id)
            .field("meta", &self.meta)
            .field("calculation", &self.calculation)
            .finish()
    }
}

/// Anything that names an identifier definition.
pub trait AsIdentifier {
    /// The shared definition.
    fn definition(&self) -> &Arc<IdentifierDef>;

    /// Its id.
    fn id(&self) -> IdentifierId {
        IdentifierDef::id(self.definition())
    }
}

impl AsIdentifier for Arc<IdentifierDef> {
    fn definition(&self) -> &Arc<IdentifierDef> {
        self
    }
}

/// Bound for values stored in the graph.
pub trait Data: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Data for T {}

/// Typed handle to an identifier whose values are `T`.
pub struct Identifier<T> {
    def: Arc<IdentifierDef>,
    _value: PhantomData<fn() -> T>,
}

impl<T> Clone for Identifier<T> {
    fn clone(&self) -> Self {
        Self {
            def: Arc::clone(&self.def),
            _value: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Identifier<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Identifier").field(&self.def.label()).finish()
    }
}

impl<T> AsIdentifier for Identifier<T> {
    fn definition(&self) -> &Arc<IdentifierDef> {
        &self.def
    }
}

impl<T> Identifier<T> {
    /// The unique id.
    pub fn id(&self) -> IdentifierId {
        self.def.id
    }

    /// The name.
    pub fn name(&self) -> &str {
        self.def.name()
    }

    /// Descriptive attributes.
    pub fn meta(&self) -> &Meta {
        &self.def.meta
    }

    /// The shared, type-erased definition.
    pub fn definition(&self) -> &Arc<IdentifierDef> {
        &self.def
    }
}

impl<T: Data + PartialEq> Identifier<T> {
    /// A variable compared with `PartialEq`.
    pub fn variable(name: impl Into<Arc<str>>) -> Self {
        IdentifierBuilder::variable(name).partial_eq().build()
    }

    /// A calculated value with the default calculation (keep the proposed
    /// value, else the current one), compared with `PartialEq`.
    pub fn calculated(name: impl Into<Arc<str>>) -> Self {
        IdentifierBuilder::calculated(name).partial_eq().build()
    }
}

impl<T: Data> Identifier<T> {
    /// Write into an explicit quark.
    pub fn write(&self, quark: &mut Quark, value: T, args: Option<WriteArgs>) {
        self.def.write(quark, Arc::new(value), args);
    }

    /// Stage a write in a transaction.
    pub fn write_to_transaction(
        &self,
        transaction: &mut Transaction,
        value: T,
    ) -> Result<(), GraphError> {
        transaction.write(self, value)
    }

    /// Write to the graph through a fresh transaction, committed immediately.
    pub fn write_to_graph(
        &self,
        checkout: &Checkout,
        value: T,
    ) -> Result<PropagationResult, GraphError> {
        checkout.write(self, value)
    }

    /// Read the committed value from the graph.
    pub fn read_from_graph(&self, checkout: &Checkout) -> Result<T, GraphError> {
        checkout.read(self)
    }

    /// Read the value as seen by a transaction.
    pub fn read_from_transaction(&self, transaction: &mut Transaction) -> Result<T, GraphError> {
        transaction.read(self)
    }

    /// Read from the graph once no commit is in flight.
    pub async fn read_from_graph_async(&self, checkout: &Checkout) -> Result<T, GraphError> {
        checkout.read_async(self).await
    }
}

/// Builder for identifiers.
pub struct IdentifierBuilder<T> {
    name: Arc<str>,
    kind: QuarkKind,
    level: Level,
    lazy: bool,
    total: bool,
    calculation: Calculation,
    equality: Option<EqualityFn>,
    build_proposed: Option<BuildFn>,
    on_enter: Option<HookFn>,
    on_leave: Option<HookFn>,
    _value: PhantomData<fn() -> T>,
}

impl<T: Data> IdentifierBuilder<T> {
    fn new(name: Arc<str>, kind: QuarkKind, level: Level, calculation: Calculation) -> Self {
        Self {
            name,
            kind,
            level,
            lazy: false,
            total: true,
            calculation,
            equality: None,
            build_proposed: None,
            on_enter: None,
            on_leave: None,
            _value: PhantomData,
        }
    }

    /// Start a variable: externally written, never recalculated.
    pub fn variable(name: impl Into<Arc<str>>) -> Self {
        Self::new(name.into(), QuarkKind::Variable, Level::CONSTANT, Calculation::Abstract)
    }

    /// Start a calculated value using the default calculation.
    pub fn calculated(name: impl Into<Arc<str>>) -> Self {
        Self::new(
            name.into(),
            QuarkKind::Calculated,
            Level::default(),
            Calculation::proposed_or_current(),
        )
    }

    /// Use a sync calculation. Turns the identifier into a calculated value.
    pub fn calculation<F>(mut self, calculation: F) -> Self
    where
        F: Fn(&mut CalculationContext<'_, T>) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.kind = QuarkKind::Calculated;
        self.calculation = Calculation::Sync(Arc::new(move |resolver: &mut dyn Resolve| {
            let mut ctx = CalculationContext::new(resolver);
            Ok(Arc::new(calculation(&mut ctx)?) as Value)
        }));
        self
    }

    /// Use a generator calculation. `factory` creates a fresh generator for
    /// every run. Turns the identifier into a calculated value.
    pub fn generator<F, G>(mut self, factory: F) -> Self
    where
        F: Fn() -> G + Send + Sync + 'static,
        G: Generator<T> + 'static,
    {
        self.kind = QuarkKind::Calculated;
        self.calculation = Calculation::Generator(Arc::new(move || erase_generator(factory())));
        self
    }

    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    pub fn total(mut self, total: bool) -> Self {
        self.total = total;
        self
    }

    /// Decide whether a recalculated value differs from the previous one.
    pub fn equality<F>(mut self, equality: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        self.equality = Some(Arc::new(move |a: &Value, b: &Value| {
            match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
                (Some(a), Some(b)) => equality(a, b),
                _ => false,
            }
        }));
        self
    }

    /// Compare values with `PartialEq`.
    pub fn partial_eq(self) -> Self
    where
        T: PartialEq,
    {
        self.equality(|a: &T, b: &T| a == b)
    }

    /// Default proposed value for quarks never written explicitly. Receives
    /// the previous value, if any. Called at most once per quark.
    pub fn proposed_default<F>(mut self, build: F) -> Self
    where
        F: Fn(Option<&T>) -> Option<T> + Send + Sync + 'static,
    {
        self.build_proposed = Some(Arc::new(move |previous: Option<&Value>| {
            let previous = previous.and_then(|v| v.downcast_ref::<T>());
            build(previous).map(|v| Arc::new(v) as Value)
        }));
        self
    }

    /// Hook fired when the identifier joins a checkout.
    pub fn on_enter_graph<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Checkout) + Send + Sync + 'static,
    {
        self.on_enter = Some(Arc::new(hook));
        self
    }

    /// Hook fired when the identifier leaves a checkout.
    pub fn on_leave_graph<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Checkout) + Send + Sync + 'static,
    {
        self.on_leave = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Identifier<T> {
        // Without an explicit predicate values are compared by identity.
        let equality = self
            .equality
            .unwrap_or_else(|| Arc::new(|a: &Value, b: &Value| Arc::ptr_eq(a, b)));
        let sync = self.calculation.is_sync();
        Identifier {
            def: Arc::new(IdentifierDef {
                id: IdentifierId::next(),
                meta: Meta {
                    name: self.name,
                    level: self.level,
                    lazy: self.lazy,
                    sync,
                    total: self.total,
                    kind: self.kind,
                },
                calculation: self.calculation,
                equality,
                build_proposed: self.build_proposed,
                on_enter: self.on_enter,
                on_leave: self.on_leave,
            }),
            _value: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_ids_follow_creation_order() {
        let a = Identifier::<i32>::variable("a");
        let b = Identifier::<i32>::variable("b");
        assert!(a.id() < b.id());
        assert_eq!(a.definition().label(), format!("a#{}", a.id().raw()));
    }

    #[test]
    fn erased_and_typed_handles_share_the_id() {
        fn id_of(identifier: &impl AsIdentifier) -> IdentifierId {
            identifier.id()
        }
        let typed = Identifier::<i32>::variable("shared");
        let erased = Arc::clone(typed.definition());
        assert_eq!(AsIdentifier::id(&typed), typed.id());
        assert_eq!(AsIdentifier::id(&erased), typed.id());
        assert_eq!(id_of(&erased), id_of(&typed));
    }

    #[test]
    fn kinds_and_defaults() {
        let var = Identifier::<i32>::variable("input");
        assert_eq!(var.meta().kind, QuarkKind::Variable);
        assert_eq!(var.meta().level, Level::CONSTANT);
        assert!(var.meta().sync);
        assert!(var.meta().total);
        assert!(!var.meta().lazy);

        let calc = Identifier::<i32>::calculated("derived");
        assert_eq!(calc.meta().kind, QuarkKind::Calculated);
        assert_eq!(calc.meta().level, Level::DEPENDS_ON_SELF_KIND);
        assert!(calc.meta().sync);
    }

    #[test]
    fn generator_calculations_are_not_sync() {
        let id = IdentifierBuilder::<i32>::calculated("gen")
            .generator(|| |_: Resume| -> anyhow::Result<Step<i32>> { Ok(Step::Done(1)) })
            .level(Level::DEPENDS_ONLY_ON_CONSTANT)
            .lazy(true)
            .build();
        assert!(!id.meta().sync);
        assert!(id.meta().lazy);
        assert_eq!(id.meta().level, Level::DEPENDS_ONLY_ON_CONSTANT);
    }

    #[test]
    fn calculation_turns_variable_builder_into_calculated() {
        let id = IdentifierBuilder::<i32>::variable("formula")
            .calculation(|_| Ok(3))
            .build();
        assert_eq!(id.meta().kind, QuarkKind::Calculated);
    }

    #[test]
    fn custom_equality_is_applied_to_erased_values() {
        let id = IdentifierBuilder::<f64>::calculated("approx")
            .equality(|a, b| (a - b).abs() < 0.01)
            .build();
        let a: Value = Arc::new(1.0_f64);
        let b: Value = Arc::new(1.005_f64);
        let c: Value = Arc::new(2.0_f64);
        assert!(id.definition().equality(&a, &b));
        assert!(!id.definition().equality(&a, &c));
    }

    #[test]
    fn default_equality_is_identity() {
        #[derive(Clone)]
        struct Opaque;
        let id = IdentifierBuilder::<Opaque>::calculated("opaque").build();
        let a: Value = Arc::new(Opaque);
        let b: Value = Arc::new(Opaque);
        assert!(id.definition().equality(&a, &a.clone()));
        assert!(!id.definition().equality(&a, &b));
    }

    #[test]
    fn proposed_default_receives_previous_value() {
        let id = IdentifierBuilder::<i32>::calculated("continued")
            .proposed_default(|previous| previous.map(|p| p + 1))
            .build();
        let previous: Value = Arc::new(41_i32);
        let built = id.definition().build_proposed_value(Some(&previous)).unwrap();
        assert_eq!(*built.downcast_ref::<i32>().unwrap(), 42);
        assert!(id.definition().build_proposed_value(None).is_none());
    }
}
