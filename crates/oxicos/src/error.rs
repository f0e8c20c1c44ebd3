//! Error types for the `OxiCOS` runtime.
//!
//! Registration and payload access report failures as `Result<T, Error>`.
//! Failures detected while the runtime is running (dispatch, allocation,
//! class changes) are raised as exception objects instead; the `Error` that
//! describes them travels with the exception as its cause.

use std::fmt;

/// Errors that can occur in the `OxiCOS` runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Object storage could not be allocated.
    OutOfMemory {
        /// Payload bytes requested.
        requested: usize,
    },

    /// Reference count overflow detected.
    RefCountOverflow,

    /// Class name already exists in the registry.
    ClassAlreadyExists {
        /// The duplicated name.
        name: String,
    },

    /// Generic function name already exists in the registry.
    GenericAlreadyExists {
        /// The duplicated name.
        name: String,
    },

    /// A class identifier does not belong to this registry.
    UnknownClass {
        /// The raw identifier.
        id: u32,
    },

    /// A generic identifier does not belong to this registry.
    UnknownGeneric {
        /// The raw identifier.
        id: u32,
    },

    /// Inheritance cycle detected.
    InheritanceCycle {
        /// The class whose definition would close the cycle.
        name: String,
    },

    /// A subclass declared less instance storage than its superclass.
    InstanceSizeTooSmall {
        /// The class being defined.
        class: String,
        /// Its declared instance size.
        size: usize,
        /// The superclass instance size.
        superclass_size: usize,
    },

    /// Generic arity outside the supported range.
    InvalidArity {
        /// The generic being defined.
        generic: String,
        /// The requested arity.
        arity: usize,
    },

    /// Number of selectors or arguments does not match the generic's arity.
    ArityMismatch {
        /// The generic function.
        generic: String,
        /// Its arity.
        expected: usize,
        /// What was supplied.
        got: usize,
    },

    /// A method with an identical selector tuple is already registered.
    DuplicateMethod {
        /// The generic function.
        generic: String,
        /// Class names of the selector tuple.
        selectors: Vec<String>,
    },

    /// Two methods can tie for some argument classes (detected at freeze).
    AmbiguousMethods {
        /// The generic function.
        generic: String,
        /// Selector tuple of the first method.
        first: Vec<String>,
        /// Selector tuple of the second method.
        second: Vec<String>,
    },

    /// No method applies and no unrecognized-message hook is installed.
    NoApplicableMethod {
        /// The generic function.
        generic: String,
        /// Runtime class names of the arguments.
        classes: Vec<String>,
    },

    /// Two or more maximally specific methods apply.
    AmbiguousDispatch {
        /// The generic function.
        generic: String,
        /// Runtime class names of the arguments.
        classes: Vec<String>,
    },

    /// `next_method` was called with no less specific method left.
    NoNextMethod {
        /// The generic function.
        generic: String,
        /// Runtime class names of the arguments.
        classes: Vec<String>,
    },

    /// Forwarding loop detected (self-forward or depth exceeded).
    ForwardingLoop {
        /// The generic being forwarded.
        generic: String,
        /// Forwarding depth when the loop was detected.
        depth: u32,
    },

    /// `change_class` target needs more storage than the object has.
    IllegalClassChange {
        /// Current class name.
        from: String,
        /// Requested class name.
        to: String,
        /// Instance size of the requested class.
        required: usize,
        /// Storage allocated for the object.
        allocated: usize,
    },

    /// Payload access outside the object's storage.
    PayloadOutOfBounds {
        /// Byte offset of the access.
        offset: usize,
        /// Width of the access.
        len: usize,
        /// Payload size.
        size: usize,
    },

    /// An exception was thrown while the thread was already unwinding.
    ThrowDuringUnwind,

    /// Protected regions were not left in LIFO order.
    RegionOrder {
        /// Depth of the innermost frame.
        innermost: usize,
        /// Depth of the region being left.
        leaving: usize,
    },
}

fn join(names: &[String]) -> String {
    names.join(", ")
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory { requested } => {
                write!(f, "Out of memory: cannot allocate {requested} payload bytes")
            }
            Error::RefCountOverflow => {
                write!(f, "Reference count overflow detected")
            }
            Error::ClassAlreadyExists { name } => {
                write!(f, "Class '{name}' already exists in registry")
            }
            Error::GenericAlreadyExists { name } => {
                write!(f, "Generic '{name}' already exists in registry")
            }
            Error::UnknownClass { id } => write!(f, "Unknown class id {id}"),
            Error::UnknownGeneric { id } => write!(f, "Unknown generic id {id}"),
            Error::InheritanceCycle { name } => {
                write!(f, "Inheritance cycle detected at class '{name}'")
            }
            Error::InstanceSizeTooSmall {
                class,
                size,
                superclass_size,
            } => write!(
                f,
                "Class '{class}' declares {size} bytes, less than its superclass's {superclass_size}"
            ),
            Error::InvalidArity { generic, arity } => {
                write!(f, "Generic '{generic}' has unsupported arity {arity}")
            }
            Error::ArityMismatch {
                generic,
                expected,
                got,
            } => write!(
                f,
                "Arity mismatch for '{generic}': expected {expected}, got {got}"
            ),
            Error::DuplicateMethod { generic, selectors } => write!(
                f,
                "Method {generic}({}) is already defined",
                join(selectors)
            ),
            Error::AmbiguousMethods {
                generic,
                first,
                second,
            } => write!(
                f,
                "Methods {generic}({}) and {generic}({}) are ambiguous",
                join(first),
                join(second)
            ),
            Error::NoApplicableMethod { generic, classes } => write!(
                f,
                "No applicable method for {generic}({})",
                join(classes)
            ),
            Error::AmbiguousDispatch { generic, classes } => write!(
                f,
                "Ambiguous dispatch for {generic}({})",
                join(classes)
            ),
            Error::NoNextMethod { generic, classes } => write!(
                f,
                "No next method for {generic}({})",
                join(classes)
            ),
            Error::ForwardingLoop { generic, depth } => write!(
                f,
                "Forwarding loop detected for '{generic}' at depth {depth}"
            ),
            Error::IllegalClassChange {
                from,
                to,
                required,
                allocated,
            } => write!(
                f,
                "Cannot change class {from} to {to}: needs {required} bytes, object has {allocated}"
            ),
            Error::PayloadOutOfBounds { offset, len, size } => write!(
                f,
                "Payload access of {len} bytes at offset {offset} exceeds {size} bytes"
            ),
            Error::ThrowDuringUnwind => {
                write!(f, "Exception thrown during stack unwinding")
            }
            Error::RegionOrder { innermost, leaving } => write!(
                f,
                "Protected region {leaving} left while region {innermost} is innermost"
            ),
        }
    }
}

impl std::error::Error for Error {}

/// Result type for `OxiCOS` registration and payload operations.
pub type Result<T> = std::result::Result<T, Error>;
