//! Generic functions, methods and the per-invocation [`Call`] context.
//!
//! A generic function is a named operation with a fixed arity. Each of its
//! methods carries one class selector per argument; the method applies to a
//! call when every selector is an ancestor-or-self of the corresponding
//! argument's class.
//!
//! Method bodies receive a [`Call`], which exposes the arguments and the
//! operations that only make sense from inside a method: continuing with the
//! next less specific method and forwarding to another receiver.

use crate::runtime::exception::{Location, Throws};
use crate::runtime::registry::Runtime;
use crate::runtime::{ClassId, Object, Value};
use fxhash::FxHashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Maximum number of dispatched arguments of a generic function.
pub const MAX_ARITY: usize = 5;

/// Identifier of a generic function inside one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GenericId(pub(crate) u32);

impl GenericId {
    /// The built-in deinitializer generic (arity 1).
    pub const DEINIT: GenericId = GenericId(0);

    /// Returns the raw identifier.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identifier of a method inside one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub(crate) u32);

impl MethodId {
    /// Returns the raw identifier.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Body of a method or of an unrecognized-message hook.
pub type MethodBody = Box<dyn Fn(&Call<'_>) -> Throws<Value> + Send + Sync>;

pub(crate) struct GenericInfo {
    pub(crate) name: String,
    pub(crate) arity: usize,
    pub(crate) methods: Vec<MethodId>,
    /// Indexed by class id: methods whose first selector is an ancestor of
    /// that class, nearest first. Filled in by `freeze`.
    pub(crate) by_first_arg: Vec<Vec<MethodId>>,
    /// Applicable methods per argument class tuple, filled on first send.
    pub(crate) cache: RwLock<FxHashMap<[ClassId; MAX_ARITY], Arc<[Candidate]>>>,
}

pub(crate) struct MethodInfo {
    pub(crate) selectors: [ClassId; MAX_ARITY],
    pub(crate) body: MethodBody,
}

impl MethodInfo {
    pub(crate) fn selectors(&self, arity: usize) -> &[ClassId] {
        &self.selectors[..arity]
    }
}

/// A generic function of a frozen runtime.
#[derive(Clone, Copy)]
pub struct Generic {
    pub(crate) runtime: &'static Runtime,
    pub(crate) id: GenericId,
}

impl Generic {
    pub(crate) fn info(&self) -> &'static GenericInfo {
        self.runtime.generic_info(self.id)
    }

    #[must_use]
    pub fn id(&self) -> GenericId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        &self.info().name
    }

    #[must_use]
    pub fn arity(&self) -> usize {
        self.info().arity
    }

    /// Number of methods registered for this generic.
    #[must_use]
    pub fn method_count(&self) -> usize {
        self.info().methods.len()
    }

    /// Selector class names of every method, in registration order.
    #[must_use]
    pub fn signatures(&self) -> Vec<Vec<&'static str>> {
        let arity = self.arity();
        self.info()
            .methods
            .iter()
            .map(|&m| {
                self.runtime
                    .method_info(m)
                    .selectors(arity)
                    .iter()
                    .map(|&c| self.runtime.class_info(c).name.as_str())
                    .collect()
            })
            .collect()
    }
}

impl PartialEq for Generic {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.runtime, other.runtime) && self.id == other.id
    }
}

impl Eq for Generic {}

impl fmt::Debug for Generic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generic")
            .field("name", &self.name())
            .field("arity", &self.arity())
            .field("methods", &self.method_count())
            .finish()
    }
}

/// One applicable method with its ancestry distance at each argument.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Candidate {
    pub(crate) method: MethodId,
    pub(crate) distances: [u16; MAX_ARITY],
}

/// Context of one method invocation.
///
/// A `Call` lives for the duration of the method body. It borrows the
/// arguments of the dispatch that created it.
///
/// # Example
///
/// ```rust
/// use oxicos::runtime::{ClassId, RegistryBuilder, Value, try_protected};
///
/// let mut builder = RegistryBuilder::new();
/// let base = builder.define_class("Base", ClassId::OBJECT, 0).unwrap();
/// let derived = builder.define_class("Derived", base, 0).unwrap();
/// let depth = builder.define_generic("depth", 1).unwrap();
/// builder
///     .define_method(depth, &[base], |_call| Ok(Value::Int(1)))
///     .unwrap();
/// builder
///     .define_method(depth, &[derived], |call| {
///         let inherited = call.next_method()?.as_int().unwrap_or(0);
///         Ok(Value::Int(inherited + 1))
///     })
///     .unwrap();
/// let runtime = builder.freeze().unwrap();
///
/// let result = try_protected(|_| {
///     let obj = runtime.allocate(derived, 0)?;
///     runtime.send(depth, &[&obj])
/// });
/// assert_eq!(result.unwrap(), Value::Int(2));
/// ```
pub struct Call<'a> {
    pub(crate) runtime: &'static Runtime,
    pub(crate) generic: GenericId,
    pub(crate) args: &'a [&'a Object],
    pub(crate) extra: &'a [Value],
    pub(crate) applicable: &'a [Candidate],
    /// Index into `applicable` of the running method; `None` inside an
    /// unrecognized-message hook.
    pub(crate) current: Option<usize>,
    pub(crate) location: Location,
}

impl<'a> Call<'a> {
    /// Returns the runtime dispatching this call.
    #[must_use]
    pub fn runtime(&self) -> &'static Runtime {
        self.runtime
    }

    /// Returns the generic function being invoked.
    #[must_use]
    pub fn generic(&self) -> Generic {
        Generic {
            runtime: self.runtime,
            id: self.generic,
        }
    }

    /// Returns the dispatched argument at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below the generic's arity.
    #[must_use]
    pub fn arg(&self, index: usize) -> &'a Object {
        self.args[index]
    }

    /// Returns all dispatched arguments.
    #[must_use]
    pub fn args(&self) -> &'a [&'a Object] {
        self.args
    }

    /// Returns the extra (non-dispatched) arguments.
    #[must_use]
    pub fn extra(&self) -> &'a [Value] {
        self.extra
    }

    /// Returns the extra argument at `index`, if supplied.
    #[must_use]
    pub fn extra_arg(&self, index: usize) -> Option<&'a Value> {
        self.extra.get(index)
    }

    /// Returns the method being executed, `None` inside an
    /// unrecognized-message hook.
    #[must_use]
    pub fn method(&self) -> Option<MethodId> {
        self.current.map(|i| self.applicable[i].method)
    }

    /// Returns the location of the originating `send`.
    #[must_use]
    pub fn location(&self) -> Location {
        self.location
    }

    pub(crate) fn class_names(&self) -> Vec<String> {
        self.args.iter().map(|o| o.class_name().to_string()).collect()
    }
}

impl fmt::Debug for Call<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("generic", &self.generic().name())
            .field("args", &self.class_names())
            .field("extra", &self.extra.len())
            .field("method", &self.method())
            .finish()
    }
}
