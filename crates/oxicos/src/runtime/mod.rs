//! `OxiCOS` runtime module.
//!
//! # Architecture
//!
//! The runtime is organized into several modules:
//!
//! - [`config`]: Runtime configuration (precedence rule, forwarding limit)
//! - [`class`]: Class handles, inheritance and class precedence lists
//! - [`generic`]: Generic functions, methods and call contexts
//! - [`registry`]: Build-phase registration and the frozen [`Runtime`]
//! - [`dispatch`]: Multimethod selection, `next_method` and ambiguity checks
//! - [`forwarding`]: Unrecognized-message hooks and forwarding
//! - [`object`]: Object allocation, reference counting and deinit chains
//! - [`pool`]: Autorelease pools
//! - [`exception`]: Throwing, catching and termination
//! - [`protect`]: Protected regions and the protection stack
//! - [`value`]: Values returned by methods
//!
//! # Phases
//!
//! Classes, generics and methods are registered on a [`RegistryBuilder`].
//! [`RegistryBuilder::freeze`] turns it into an immutable `&'static Runtime`
//! that any thread may dispatch through. Objects, pools and protected regions
//! are per-thread.

pub mod class;
pub mod config;
pub mod dispatch;
pub mod exception;
pub mod forwarding;
pub mod generic;
pub mod object;
pub mod pool;
pub mod protect;
pub mod registry;
pub mod value;

pub use class::{Class, ClassId};
pub use config::{Config, Precedence};
pub use exception::{
    Caught, Location, TerminateHandler, Termination, Thrown, Throws, default_terminate,
    set_terminate, throw, uncaught,
};
pub use forwarding::forward_depth;
pub use generic::{Call, Generic, GenericId, MAX_ARITY, MethodBody, MethodId};
pub use object::{Object, Scalar, release, retain};
pub use pool::{AutoreleasePool, Autoreleased, autorelease, pool_depth};
pub use protect::{
    Cleanup, Guarded, Protected, Region, UnwindState, protect, protect_with, protection_depth,
    protection_stack, show_protection_stack, try_protected, unwind_state,
};
pub use registry::{RegistryBuilder, Runtime};
pub use value::Value;
