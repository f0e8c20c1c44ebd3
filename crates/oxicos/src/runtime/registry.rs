//! Class and generic function registration.
//!
//! Registration happens on a [`RegistryBuilder`]. [`RegistryBuilder::freeze`]
//! consumes the builder, precomputes the dispatch tables and returns the
//! immutable [`Runtime`]. Like class metadata in other object runtimes, a
//! frozen runtime is never deallocated: it is leaked and handed out as
//! `&'static Runtime`, which is `Sync` and can be shared across threads.
//!
//! # Example
//!
//! ```rust
//! use oxicos::runtime::{ClassId, RegistryBuilder, Value, try_protected};
//!
//! let mut builder = RegistryBuilder::new();
//! let shape = builder.define_class("Shape", ClassId::OBJECT, 0).unwrap();
//! let square = builder.define_class("Square", shape, 8).unwrap();
//! let area = builder.define_generic("area", 1).unwrap();
//! builder
//!     .define_method(area, &[square], |call| {
//!         let side: f64 = call.arg(0).read(0).unwrap();
//!         Ok(Value::Float(side * side))
//!     })
//!     .unwrap();
//! let runtime = builder.freeze().unwrap();
//!
//! let result = try_protected(|_| {
//!     let sq = runtime.allocate(square, 0)?;
//!     sq.write(0, 3.0_f64).unwrap();
//!     runtime.send(area, &[&sq])
//! });
//! assert_eq!(result.unwrap(), Value::Float(9.0));
//! ```

use crate::error::{Error, Result};
use crate::runtime::class::{BUILTIN_CLASSES, ClassInfo};
use crate::runtime::exception::Throws;
use crate::runtime::generic::{GenericInfo, MAX_ARITY, MethodBody, MethodInfo};
use crate::runtime::{
    Call, Class, ClassId, Config, Generic, GenericId, MethodId, Value,
};
use fxhash::FxHashMap;
use oxicos_log::{debug, info};
use std::sync::RwLock;

/// End of every deinitializer chain.
fn root_deinit(_call: &Call<'_>) -> Throws<Value> {
    Ok(Value::Unit)
}

/// Build-phase registry.
///
/// Every builder starts with the built-in classes (see [`ClassId`]), the
/// built-in `deinit` generic ([`GenericId::DEINIT`]) and a no-op `deinit`
/// method on `Object` that ends every deinitializer chain.
pub struct RegistryBuilder {
    config: Config,
    classes: Vec<ClassInfo>,
    class_names: FxHashMap<String, ClassId>,
    generics: Vec<GenericInfo>,
    generic_names: FxHashMap<String, GenericId>,
    methods: Vec<MethodInfo>,
    global_unrecognized: Option<MethodBody>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    /// Creates a builder with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a builder with the given configuration.
    #[must_use]
    pub fn with_config(config: Config) -> Self {
        let mut builder = Self {
            config,
            classes: Vec::new(),
            class_names: FxHashMap::default(),
            generics: Vec::new(),
            generic_names: FxHashMap::default(),
            methods: Vec::new(),
            global_unrecognized: None,
        };

        for (name, superclass) in BUILTIN_CLASSES {
            builder.push_class(name, superclass, 0);
        }
        builder.push_generic("deinit", 1);
        builder.push_method(GenericId::DEINIT, &[ClassId::OBJECT], Box::new(root_deinit));

        builder
    }

    /// Returns the configuration the runtime will be frozen with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn push_class(
        &mut self,
        name: &str,
        superclass: Option<ClassId>,
        instance_size: usize,
    ) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        let mut cpl = vec![id];
        if let Some(parent) = superclass {
            cpl.extend_from_slice(&self.classes[parent.index()].cpl);
        }
        self.classes.push(ClassInfo {
            name: name.to_string(),
            superclass,
            instance_size,
            cpl,
            unrecognized: None,
        });
        self.class_names.insert(name.to_string(), id);
        id
    }

    fn push_generic(&mut self, name: &str, arity: usize) -> GenericId {
        let id = GenericId(self.generics.len() as u32);
        self.generics.push(GenericInfo {
            name: name.to_string(),
            arity,
            methods: Vec::new(),
            by_first_arg: Vec::new(),
            cache: RwLock::default(),
        });
        self.generic_names.insert(name.to_string(), id);
        id
    }

    fn push_method(
        &mut self,
        generic: GenericId,
        selectors: &[ClassId],
        body: MethodBody,
    ) -> MethodId {
        let id = MethodId(self.methods.len() as u32);
        let mut padded = [ClassId::OBJECT; MAX_ARITY];
        padded[..selectors.len()].copy_from_slice(selectors);
        self.methods.push(MethodInfo {
            selectors: padded,
            body,
        });
        self.generics[generic.index()].methods.push(id);
        id
    }

    fn class(&self, id: ClassId) -> Result<&ClassInfo> {
        self.classes
            .get(id.index())
            .ok_or(Error::UnknownClass { id: id.raw() })
    }

    fn class_names_of(&self, selectors: &[ClassId]) -> Vec<String> {
        selectors
            .iter()
            .map(|c| self.classes[c.index()].name.clone())
            .collect()
    }

    /// Defines a class under `superclass` with `instance_size` bytes of
    /// instance storage (inherited bytes included).
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownClass`] if `superclass` is not registered
    /// - [`Error::InheritanceCycle`] if `name` already names an ancestor
    /// - [`Error::ClassAlreadyExists`] if `name` is taken
    /// - [`Error::InstanceSizeTooSmall`] if `instance_size` is smaller than
    ///   the superclass's
    pub fn define_class(
        &mut self,
        name: &str,
        superclass: ClassId,
        instance_size: usize,
    ) -> Result<ClassId> {
        let parent = self.class(superclass)?;

        if parent
            .cpl
            .iter()
            .any(|&ancestor| self.classes[ancestor.index()].name == name)
        {
            return Err(Error::InheritanceCycle {
                name: name.to_string(),
            });
        }

        if self.class_names.contains_key(name) {
            return Err(Error::ClassAlreadyExists {
                name: name.to_string(),
            });
        }

        if instance_size < parent.instance_size {
            return Err(Error::InstanceSizeTooSmall {
                class: name.to_string(),
                size: instance_size,
                superclass_size: parent.instance_size,
            });
        }

        let id = self.push_class(name, Some(superclass), instance_size);
        debug!(
            "defined class {} < {} ({} bytes)",
            name, self.classes[superclass.index()].name, instance_size
        );
        Ok(id)
    }

    /// Defines a generic function dispatching on `arity` arguments.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArity`] unless `1 <= arity <= MAX_ARITY`;
    /// [`Error::GenericAlreadyExists`] if `name` is taken.
    pub fn define_generic(&mut self, name: &str, arity: usize) -> Result<GenericId> {
        if !(1..=MAX_ARITY).contains(&arity) {
            return Err(Error::InvalidArity {
                generic: name.to_string(),
                arity,
            });
        }
        if self.generic_names.contains_key(name) {
            return Err(Error::GenericAlreadyExists {
                name: name.to_string(),
            });
        }

        let id = self.push_generic(name, arity);
        debug!("defined generic {}/{}", name, arity);
        Ok(id)
    }

    /// Adds a method to `generic`, specialized on one class per argument.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownGeneric`] / [`Error::UnknownClass`] for foreign ids
    /// - [`Error::ArityMismatch`] if `selectors.len()` differs from the arity
    /// - [`Error::DuplicateMethod`] if a method with the same selectors exists
    pub fn define_method<F>(
        &mut self,
        generic: GenericId,
        selectors: &[ClassId],
        body: F,
    ) -> Result<MethodId>
    where
        F: Fn(&Call<'_>) -> Throws<Value> + Send + Sync + 'static,
    {
        let info = self
            .generics
            .get(generic.index())
            .ok_or(Error::UnknownGeneric { id: generic.raw() })?;

        if selectors.len() != info.arity {
            return Err(Error::ArityMismatch {
                generic: info.name.clone(),
                expected: info.arity,
                got: selectors.len(),
            });
        }
        for &class in selectors {
            self.class(class)?;
        }

        let arity = info.arity;
        if info
            .methods
            .iter()
            .any(|m| self.methods[m.index()].selectors(arity) == selectors)
        {
            return Err(Error::DuplicateMethod {
                generic: info.name.clone(),
                selectors: self.class_names_of(selectors),
            });
        }

        let id = self.push_method(generic, selectors, Box::new(body));
        debug!(
            "defined method {}({})",
            self.generics[generic.index()].name,
            self.class_names_of(selectors).join(", ")
        );
        Ok(id)
    }

    /// Adds a deinitializer for `class`.
    ///
    /// The body runs when the last reference to an instance is released. It
    /// should end with `call.next_method()` so superclass deinitializers run.
    ///
    /// # Errors
    ///
    /// As [`define_method`](Self::define_method).
    pub fn define_deinit<F>(&mut self, class: ClassId, body: F) -> Result<MethodId>
    where
        F: Fn(&Call<'_>) -> Throws<Value> + Send + Sync + 'static,
    {
        self.define_method(GenericId::DEINIT, &[class], body)
    }

    /// Installs the unrecognized-message hook of `class`.
    ///
    /// The hook runs when no method applies and the first argument is an
    /// instance of `class` or of a subclass without a hook of its own.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownClass`] if `class` is not registered.
    pub fn set_unrecognized<F>(&mut self, class: ClassId, hook: F) -> Result<()>
    where
        F: Fn(&Call<'_>) -> Throws<Value> + Send + Sync + 'static,
    {
        self.class(class)?;
        self.classes[class.index()].unrecognized = Some(Box::new(hook));
        Ok(())
    }

    /// Installs the hook used when no class hook applies.
    pub fn set_global_unrecognized<F>(&mut self, hook: F)
    where
        F: Fn(&Call<'_>) -> Throws<Value> + Send + Sync + 'static,
    {
        self.global_unrecognized = Some(Box::new(hook));
    }

    /// Looks up a class registered so far.
    #[must_use]
    pub fn class_by_name(&self, name: &str) -> Option<ClassId> {
        self.class_names.get(name).copied()
    }

    /// Looks up a generic registered so far.
    #[must_use]
    pub fn generic_by_name(&self, name: &str) -> Option<GenericId> {
        self.generic_names.get(name).copied()
    }

    /// Ends the build phase.
    ///
    /// # Errors
    ///
    /// [`Error::AmbiguousMethods`] if the ambiguity check is enabled and two
    /// methods of some generic can tie.
    pub fn freeze(mut self) -> Result<&'static Runtime> {
        let classes = &self.classes;
        let methods = &self.methods;

        for generic in &mut self.generics {
            generic.by_first_arg = classes
                .iter()
                .map(|class| {
                    let mut candidates: Vec<(usize, MethodId)> = generic
                        .methods
                        .iter()
                        .filter_map(|&m| {
                            let first = methods[m.index()].selectors[0];
                            let depth = classes[first.index()].depth();
                            class.distance_to(first, depth).map(|d| (d, m))
                        })
                        .collect();
                    candidates.sort_by_key(|&(distance, _)| distance);
                    candidates.into_iter().map(|(_, m)| m).collect()
                })
                .collect();
        }

        let runtime = Runtime {
            config: self.config,
            classes: self.classes,
            class_names: self.class_names,
            generics: self.generics,
            generic_names: self.generic_names,
            methods: self.methods,
            global_unrecognized: self.global_unrecognized,
        };

        if runtime.config.check_ambiguity {
            runtime.check_ambiguity()?;
        }

        info!(
            "registry frozen: {} classes, {} generics, {} methods ({} precedence)",
            runtime.classes.len(),
            runtime.generics.len(),
            runtime.methods.len(),
            runtime.config.precedence
        );
        Ok(Box::leak(Box::new(runtime)))
    }
}

/// Frozen, read-only registry: the run phase.
pub struct Runtime {
    pub(crate) config: Config,
    pub(crate) classes: Vec<ClassInfo>,
    class_names: FxHashMap<String, ClassId>,
    pub(crate) generics: Vec<GenericInfo>,
    generic_names: FxHashMap<String, GenericId>,
    pub(crate) methods: Vec<MethodInfo>,
    pub(crate) global_unrecognized: Option<MethodBody>,
}

impl Runtime {
    pub(crate) fn class_info(&self, id: ClassId) -> &ClassInfo {
        &self.classes[id.index()]
    }

    pub(crate) fn try_class_info(&self, id: ClassId) -> Option<&ClassInfo> {
        self.classes.get(id.index())
    }

    pub(crate) fn generic_info(&self, id: GenericId) -> &GenericInfo {
        &self.generics[id.index()]
    }

    pub(crate) fn method_info(&self, id: MethodId) -> &MethodInfo {
        &self.methods[id.index()]
    }

    /// Ancestry distance from `class` up to `ancestor`.
    pub(crate) fn distance(&self, class: ClassId, ancestor: ClassId) -> Option<usize> {
        let depth = self.class_info(ancestor).depth();
        self.class_info(class).distance_to(ancestor, depth)
    }

    /// Returns the configuration this runtime was frozen with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the class with identifier `id`.
    #[must_use]
    pub fn class(&'static self, id: ClassId) -> Option<Class> {
        self.try_class_info(id)?;
        Some(Class { runtime: self, id })
    }

    /// Looks up a class by name.
    #[must_use]
    pub fn class_by_name(&'static self, name: &str) -> Option<Class> {
        let id = *self.class_names.get(name)?;
        Some(Class { runtime: self, id })
    }

    /// Returns the generic function with identifier `id`.
    #[must_use]
    pub fn generic(&'static self, id: GenericId) -> Option<Generic> {
        self.generics.get(id.index())?;
        Some(Generic { runtime: self, id })
    }

    /// Looks up a generic function by name.
    #[must_use]
    pub fn generic_by_name(&'static self, name: &str) -> Option<Generic> {
        let id = *self.generic_names.get(name)?;
        Some(Generic { runtime: self, id })
    }

    /// Iterates all classes in definition order.
    pub fn classes(&'static self) -> impl Iterator<Item = Class> {
        (0..self.classes.len()).map(move |i| Class {
            runtime: self,
            id: ClassId(i as u32),
        })
    }

    #[must_use]
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    #[must_use]
    pub fn generic_count(&self) -> usize {
        self.generics.len()
    }

    #[must_use]
    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    /// Returns true if `ancestor` is `class` or one of its ancestors.
    #[must_use]
    pub fn is_subclass_of(&self, class: ClassId, ancestor: ClassId) -> bool {
        match (self.try_class_info(class), self.try_class_info(ancestor)) {
            (Some(c), Some(a)) => c.distance_to(ancestor, a.depth()).is_some(),
            _ => false,
        }
    }

    /// Returns true if some method of `generic` applies to arguments of the
    /// given classes. Unrecognized-message hooks are not considered.
    #[must_use]
    pub fn responds_to(&self, generic: GenericId, classes: &[ClassId]) -> bool {
        let Some(info) = self.generics.get(generic.index()) else {
            return false;
        };
        if classes.len() != info.arity
            || classes.iter().any(|&c| self.try_class_info(c).is_none())
        {
            return false;
        }
        !self.applicable(info, classes).is_empty()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("classes", &self.classes.len())
            .field("generics", &self.generics.len())
            .field("methods", &self.methods.len())
            .finish_non_exhaustive()
    }
}
