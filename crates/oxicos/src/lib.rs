//! `OxiCOS`: a C Object System style runtime for Rust
//!
//! `OxiCOS` is a dynamic object runtime built around generic functions. It
//! provides:
//!
//! - **Multimethods** dispatched on the runtime classes of every object
//!   argument, with `next_method` chains and configurable precedence
//! - **Reference counting** with deinit chains run along the class hierarchy
//! - **Autorelease pools** deferring releases to the end of a scope
//! - **Exceptions** as ordinary objects, caught by protected regions that
//!   release their protected resources while an exception passes
//!
//! # Example
//!
//! ```rust
//! use oxicos::runtime::{ClassId, RegistryBuilder, Value, try_protected};
//!
//! let mut builder = RegistryBuilder::new();
//! let shape = builder.define_class("Shape", ClassId::OBJECT, 8).unwrap();
//! let square = builder.define_class("Square", shape, 8).unwrap();
//! let area = builder.define_generic("area", 1).unwrap();
//! builder
//!     .define_method(area, &[square], |call| {
//!         let side: f64 = call.arg(0).read(0).unwrap_or_default();
//!         Ok(Value::Float(side * side))
//!     })
//!     .unwrap();
//! let runtime = builder.freeze().unwrap();
//!
//! let value = try_protected(|_| {
//!     let sq = runtime.allocate(square, 0)?;
//!     sq.write(0, 3.0_f64).unwrap();
//!     runtime.send(area, &[&sq])
//! })
//! .unwrap();
//!
//! assert_eq!(value.as_float(), Some(9.0));
//! ```

pub mod error;
pub mod runtime;

// Re-export commonly used types
pub use error::{Error, Result};
pub use runtime::{
    AutoreleasePool, Call, Caught, Class, ClassId, Config, GenericId, Object, Region,
    RegistryBuilder, Runtime, Thrown, Throws, Value, try_protected,
};
