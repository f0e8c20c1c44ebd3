// Common test utilities for integration tests
//
// Shared fixtures: a terminate handler that panics instead of ending the
// process, a per-thread deinit log, and a small shape hierarchy.

#![allow(dead_code)]

use oxicos::runtime::{
    ClassId, Object, RegistryBuilder, Runtime, Termination, Throws, Value, set_terminate,
};
use std::cell::RefCell;
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};

static INSTALL: Once = Once::new();
static NAME_ID: AtomicUsize = AtomicUsize::new(0);

fn panicking_terminate(termination: &Termination) {
    panic!("{termination}");
}

/// Installs the panicking terminate handler (once per test binary).
pub fn setup() {
    INSTALL.call_once(|| {
        set_terminate(panicking_terminate);
    });
}

/// Returns a class name unique within the test binary.
pub fn unique_name(prefix: &str) -> String {
    let id = NAME_ID.fetch_add(1, Ordering::SeqCst);
    format!("{prefix}_{id}")
}

thread_local! {
    static DEINIT_LOG: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Tags recorded by `Tagged` deinitializers on this thread, in order.
pub fn deinit_log() -> Vec<u64> {
    DEINIT_LOG.with(|log| log.borrow().clone())
}

pub fn clear_deinit_log() {
    DEINIT_LOG.with(|log| log.borrow_mut().clear());
}

/// Defines `Tagged`: 8 payload bytes holding a `u64` tag, logged on deinit.
pub fn define_tagged(builder: &mut RegistryBuilder) -> ClassId {
    let tagged = builder
        .define_class("Tagged", ClassId::OBJECT, 8)
        .expect("Failed to define Tagged");
    builder
        .define_deinit(tagged, |call| {
            let tag = call.arg(0).read::<u64>(0).unwrap_or(u64::MAX);
            DEINIT_LOG.with(|log| log.borrow_mut().push(tag));
            call.next_method()
        })
        .expect("Failed to define Tagged deinit");
    tagged
}

/// Allocates a `Tagged` instance carrying `tag`.
pub fn tagged(runtime: &'static Runtime, class: ClassId, tag: u64) -> Throws<Object> {
    let object = runtime.allocate(class, 0)?;
    object.write(0, tag).expect("Tagged payload holds a u64");
    Ok(object)
}

/// Classes of the shape fixture.
#[derive(Debug, Clone, Copy)]
pub struct Shapes {
    pub shape: ClassId,
    pub circle: ClassId,
    pub square: ClassId,
}

/// Defines `Shape` (8 bytes) with subclasses `Circle` and `Square`.
pub fn define_shapes(builder: &mut RegistryBuilder) -> Shapes {
    let shape = builder
        .define_class("Shape", ClassId::OBJECT, 8)
        .expect("Failed to define Shape");
    let circle = builder
        .define_class("Circle", shape, 8)
        .expect("Failed to define Circle");
    let square = builder
        .define_class("Square", shape, 8)
        .expect("Failed to define Square");
    Shapes {
        shape,
        circle,
        square,
    }
}

/// Allocates an instance of `class` whose first `f64` is `size`.
pub fn sized(runtime: &'static Runtime, class: ClassId, size: f64) -> Throws<Object> {
    let object = runtime.allocate(class, 0)?;
    object.write(0, size).expect("shape payload holds an f64");
    Ok(object)
}

/// Extracts an integer result.
pub fn int(value: Value) -> i64 {
    value.as_int().expect("method returned an integer")
}
