//! `Class` metadata and inheritance for the `OxiCOS` runtime.
//!
//! Classes form a single rooted tree under the built-in `Object` class. Each
//! class records its class precedence list (itself first, the root last), so
//! the ancestry distance used by dispatch is an O(1) lookup:
//! `distance(c, a) = depth(c) - depth(a)` when `a` sits at that position in
//! the precedence list of `c`.
//!
//! # Built-in classes
//!
//! Every registry starts with the same classes at the same identifiers, so
//! the constants on [`ClassId`] are valid in any runtime.

use crate::runtime::generic::MethodBody;
use crate::runtime::registry::Runtime;
use std::fmt;

/// Identifier of a class inside one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub(crate) u32);

impl ClassId {
    /// Root of the class tree.
    pub const OBJECT: ClassId = ClassId(0);
    /// Class of the nil exception marker.
    pub const NIL: ClassId = ClassId(1);
    /// Root of all exception classes.
    pub const EXCEPTION: ClassId = ClassId(2);
    /// Raised when object storage cannot be allocated.
    pub const EX_BAD_ALLOC: ClassId = ClassId(3);
    /// Raised by illegal class changes and unknown classes.
    pub const EX_BAD_CLASS: ClassId = ClassId(4);
    /// Raised when a message cannot be dispatched.
    pub const EX_BAD_MESSAGE: ClassId = ClassId(5);
    /// Raised when dispatch finds more than one most specific method.
    pub const EX_AMBIGUOUS: ClassId = ClassId(6);

    /// Returns the raw identifier.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Name, parent and instance size of each built-in class, in id order.
pub(crate) const BUILTIN_CLASSES: [(&str, Option<ClassId>); 7] = [
    ("Object", None),
    ("Nil", Some(ClassId::OBJECT)),
    ("Exception", Some(ClassId::OBJECT)),
    ("ExBadAlloc", Some(ClassId::EXCEPTION)),
    ("ExBadClass", Some(ClassId::EXCEPTION)),
    ("ExBadMessage", Some(ClassId::EXCEPTION)),
    ("ExAmbiguous", Some(ClassId::EX_BAD_MESSAGE)),
];

/// Registry record for one class.
pub(crate) struct ClassInfo {
    pub(crate) name: String,
    pub(crate) superclass: Option<ClassId>,
    pub(crate) instance_size: usize,
    /// Class precedence list: self first, root last.
    pub(crate) cpl: Vec<ClassId>,
    /// Hook run when a generic has no method for a call whose first argument
    /// is an instance of this class (or of a subclass without its own hook).
    pub(crate) unrecognized: Option<MethodBody>,
}

impl ClassInfo {
    pub(crate) fn depth(&self) -> usize {
        self.cpl.len() - 1
    }

    /// Ancestry distance from this class up to `ancestor`, if it is one.
    pub(crate) fn distance_to(&self, ancestor: ClassId, ancestor_depth: usize) -> Option<usize> {
        let distance = self.depth().checked_sub(ancestor_depth)?;
        (self.cpl.get(distance) == Some(&ancestor)).then_some(distance)
    }
}

/// A class of a frozen runtime.
///
/// `Class` is a copyable handle; the metadata lives as long as the runtime
/// (for the rest of the program).
///
/// # Example
///
/// ```rust
/// use oxicos::runtime::{ClassId, RegistryBuilder};
///
/// let mut builder = RegistryBuilder::new();
/// let shape = builder.define_class("Shape", ClassId::OBJECT, 8).unwrap();
/// let circle = builder.define_class("Circle", shape, 16).unwrap();
/// let runtime = builder.freeze().unwrap();
///
/// let class = runtime.class(circle).unwrap();
/// assert_eq!(class.name(), "Circle");
/// assert!(class.is_subclass_of(shape));
/// assert_eq!(class.superclass().unwrap().name(), "Shape");
/// ```
#[derive(Clone, Copy)]
pub struct Class {
    pub(crate) runtime: &'static Runtime,
    pub(crate) id: ClassId,
}

impl Class {
    pub(crate) fn info(&self) -> &'static ClassInfo {
        self.runtime.class_info(self.id)
    }

    /// Returns the class identifier.
    #[must_use]
    pub fn id(&self) -> ClassId {
        self.id
    }

    /// Returns the class name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        &self.info().name
    }

    /// Returns the runtime this class belongs to.
    #[must_use]
    pub fn runtime(&self) -> &'static Runtime {
        self.runtime
    }

    /// Returns the superclass, `None` only for the root class.
    #[must_use]
    pub fn superclass(&self) -> Option<Class> {
        self.info().superclass.map(|id| Class {
            runtime: self.runtime,
            id,
        })
    }

    /// Total instance storage in bytes.
    #[must_use]
    pub fn instance_size(&self) -> usize {
        self.info().instance_size
    }

    /// Iterates the class precedence list, starting with this class.
    pub fn precedence_list(&self) -> impl Iterator<Item = Class> + 'static {
        let runtime = self.runtime;
        self.info()
            .cpl
            .iter()
            .map(move |&id| Class { runtime, id })
    }

    /// Returns true if `ancestor` is this class or one of its ancestors.
    #[must_use]
    pub fn is_subclass_of(&self, ancestor: ClassId) -> bool {
        self.distance_to(ancestor).is_some()
    }

    /// Number of inheritance steps from this class up to `ancestor`.
    #[must_use]
    pub fn distance_to(&self, ancestor: ClassId) -> Option<usize> {
        let ancestor_depth = self.runtime.try_class_info(ancestor)?.depth();
        self.info().distance_to(ancestor, ancestor_depth)
    }
}

impl PartialEq for Class {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.runtime, other.runtime) && self.id == other.id
    }
}

impl Eq for Class {}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("id", &self.id.0)
            .field("name", &self.name())
            .field("instance_size", &self.instance_size())
            .finish()
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
