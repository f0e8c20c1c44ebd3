//! Integration tests for exceptions and protected regions.

mod common;

use common::{deinit_log, define_tagged, setup, tagged};
use oxicos::runtime::{
    ClassId, Object, Region, RegistryBuilder, Runtime, Throws, UnwindState, protect,
    protect_with, protection_depth, protection_stack, show_protection_stack, unwind_state,
    uncaught,
};
use oxicos::{here, throw, try_protected};
use std::cell::RefCell;
use std::rc::Rc;

fn tagged_runtime() -> (&'static Runtime, ClassId) {
    let mut builder = RegistryBuilder::new();
    let class = define_tagged(&mut builder);
    (builder.freeze().unwrap(), class)
}

fn overflow_runtime() -> (&'static Runtime, ClassId, ClassId) {
    let mut builder = RegistryBuilder::new();
    let class = define_tagged(&mut builder);
    let overflow = builder
        .define_class("Overflow", ClassId::EXCEPTION, 0)
        .unwrap();
    (builder.freeze().unwrap(), class, overflow)
}

// ============================================================================
// Release Order
// ============================================================================

/// Enters `remaining` nested regions, each protecting one tagged object, and
/// throws from the innermost.
fn nest(rt: &'static Runtime, class: ClassId, tag: u64, remaining: u64) -> Throws<()> {
    let region = Region::enter();
    let _obj = region.protect(tagged(rt, class, tag)?);
    if remaining == 1 {
        return Err(throw!(None, "innermost"));
    }
    nest(rt, class, tag + 1, remaining - 1)
}

#[test]
fn test_three_nested_regions_release_innermost_first() {
    setup();
    let (rt, class) = tagged_runtime();

    let caught = try_protected(|_| {
        let result = nest(rt, class, 1, 3);
        assert_eq!(protection_depth(), 1);
        result
    })
    .unwrap_err();

    assert_eq!(deinit_log(), [3, 2, 1]);
    assert_eq!(caught.reason(), Some("innermost"));
    assert_eq!(protection_depth(), 0);
}

#[test]
fn test_inner_then_outer_release_before_handler() {
    setup();
    let (rt, class) = tagged_runtime();

    let outer = Region::enter();
    let result: Throws<()> = (|| {
        let _b = outer.protect(tagged(rt, class, 2)?);
        let inner = Region::enter();
        let _c = inner.protect(tagged(rt, class, 3)?);
        Err(throw!(None))
    })();

    let thrown = result.unwrap_err();
    assert_eq!(deinit_log(), [3, 2]);
    let caught = outer.catch(thrown);
    assert_eq!(caught.class_name(), "Nil");
    assert_eq!(deinit_log(), [3, 2]);
}

#[test]
fn test_normal_exit_keeps_protected_objects() {
    setup();
    let (rt, class) = tagged_runtime();

    let kept = try_protected(|region| {
        let slot = region.protect(tagged(rt, class, 5)?);
        Ok(slot.take())
    })
    .unwrap()
    .unwrap();

    assert!(deinit_log().is_empty());
    assert_eq!(kept.refcount(), 1);
}

#[test]
fn test_taken_objects_are_not_released() {
    setup();
    let (rt, class) = tagged_runtime();
    let mut survivor = None;

    let caught = try_protected(|region| -> Throws<()> {
        let slot = region.protect(tagged(rt, class, 1)?);
        let _other = region.protect(tagged(rt, class, 2)?);
        survivor = slot.take();
        Err(throw!(None))
    })
    .unwrap_err();

    drop(caught);
    assert_eq!(deinit_log(), [2]);
    assert_eq!(survivor.map(|obj| obj.refcount()), Some(1));
}

#[test]
fn test_finalizers_and_objects_share_one_stack() {
    setup();
    let (rt, class) = tagged_runtime();
    let order = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&order);

    let _ = try_protected(|region| -> Throws<()> {
        let _a = region.protect(tagged(rt, class, 1)?);
        let _f = region.protect_with("buffer", move |name| seen.borrow_mut().push(name));
        let _b = protect(tagged(rt, class, 2)?);
        Err(throw!(None))
    })
    .unwrap_err();

    assert_eq!(deinit_log(), [2, 1]);
    assert_eq!(*order.borrow(), ["buffer"]);
}

#[test]
fn test_taken_slots_leave_the_stack() {
    setup();
    let (rt, class) = tagged_runtime();
    let obj = try_protected(|_| tagged(rt, class, 1)).unwrap();

    let region = Region::enter();
    for _ in 0..1000 {
        let slot = region.protect(obj.clone());
        assert_eq!(slot.take().map(|o| o.refcount()), Some(2));
    }
    assert!(protection_stack().is_empty());

    let kept = region.protect(obj.clone());
    let buffer = region.protect_with(vec![0u8; 8], drop);
    assert_eq!(protection_stack().len(), 2);
    assert_eq!(buffer.take().map(|b| b.len()), Some(8));
    drop(kept);
    assert!(protection_stack().is_empty());
    region.leave();

    assert_eq!(obj.refcount(), 1);
    assert!(deinit_log().is_empty());
}

#[test]
fn test_dropped_slot_outside_regions_releases_object() {
    setup();
    let (rt, class) = tagged_runtime();
    let obj = try_protected(|_| tagged(rt, class, 4)).unwrap();
    assert_eq!(protection_depth(), 0);

    let slot = protect(obj.clone());
    assert_eq!(obj.refcount(), 2);
    assert_eq!(protection_stack(), [Some("Tagged".to_string())]);

    drop(slot);
    assert_eq!(obj.refcount(), 1);
    assert!(protection_stack().is_empty());
    assert!(deinit_log().is_empty());
}

// ============================================================================
// Catch and Rethrow
// ============================================================================

#[test]
fn test_rethrow_preserves_identity_and_location() {
    setup();
    let (rt, _, overflow) = overflow_runtime();
    let mut original = None;
    let mut first_location = None;

    let caught = try_protected(|_| -> Throws<()> {
        let exception = rt.allocate(overflow, 0)?;
        original = Some(exception.clone());
        let inner = try_protected(|_| -> Throws<()> { Err(throw!(exception, "deep")) })
            .unwrap_err();
        first_location = Some(inner.location());
        Err(inner.into())
    })
    .unwrap_err();

    let original = original.unwrap();
    assert_eq!(caught.exception(), Some(&original));
    assert_eq!(Some(caught.location()), first_location);
    assert_eq!(caught.reason(), Some("deep"));
    assert!(
        caught
            .location()
            .function()
            .contains("test_rethrow_preserves_identity_and_location")
    );
}

#[test]
fn test_rethrow_at_replaces_location() {
    setup();
    let (rt, _, overflow) = overflow_runtime();

    let replaced = here!();
    let caught = try_protected(|_| -> Throws<()> {
        let exception = rt.allocate(overflow, 0)?;
        let inner =
            try_protected(|_| -> Throws<()> { Err(throw!(exception)) }).unwrap_err();
        assert_ne!(inner.location(), replaced);
        Err(inner.rethrow_at(replaced))
    })
    .unwrap_err();

    assert_eq!(caught.location(), replaced);
    assert_eq!(caught.class_name(), "Overflow");
}

#[test]
fn test_handler_selects_by_class() {
    setup();
    let mut builder = RegistryBuilder::new();
    let class = define_tagged(&mut builder);
    let big = builder.define_class("Big", ClassId::OBJECT, 32).unwrap();
    let rt = builder.freeze().unwrap();

    let outcome = try_protected(|_| -> Throws<()> {
        let obj = tagged(rt, class, 1)?;
        match try_protected(|_| obj.change_class(big)) {
            Err(caught) if caught.is_kind_of(ClassId::EX_BAD_CLASS) => Ok(()),
            Err(caught) => Err(caught.into()),
            Ok(()) => Err(throw!(None, "change succeeded")),
        }
    });

    assert!(outcome.is_ok());
    assert!(!uncaught());
    assert_eq!(deinit_log(), [1]);
}

#[test]
fn test_caught_exception_released_on_drop() {
    setup();
    let (rt, class, _) = overflow_runtime();
    let mut watcher = None;

    let caught = try_protected(|_| -> Throws<()> {
        let exception = tagged(rt, class, 9)?;
        watcher = Some(exception.clone());
        Err(throw!(exception))
    })
    .unwrap_err();

    let watcher = watcher.unwrap();
    assert_eq!(watcher.refcount(), 2);
    let exception = caught.into_exception().unwrap();
    assert!(Object::ptr_eq(&exception, &watcher));
    drop(exception);
    assert_eq!(watcher.refcount(), 1);
}

// ============================================================================
// Unwind State
// ============================================================================

#[test]
fn test_uncaught_while_in_flight() {
    setup();
    assert!(!uncaught());

    let region = Region::enter();
    let thrown = throw!(None);
    assert!(uncaught());
    assert_eq!(unwind_state(), UnwindState::Unwinding);

    let caught = region.catch(thrown);
    assert!(!uncaught());
    assert!(caught.exception().is_none());
}

#[test]
fn test_region_entered_during_unwind_resumes_it() {
    setup();
    let outer = Region::enter();
    let first = throw!(None, "first");

    let inner = Region::enter();
    let second = throw!(None, "second");
    let caught_second = inner.catch(second);
    assert_eq!(caught_second.reason(), Some("second"));
    assert!(uncaught());

    let caught_first = outer.catch(first);
    assert_eq!(caught_first.reason(), Some("first"));
    assert!(!uncaught());
}

#[test]
fn test_catch_in_later_region_ends_unwind() {
    setup();
    let (rt, class) = tagged_runtime();

    let outer = Region::enter();
    let result: Throws<()> = Err(throw!(None, "early"));
    assert!(uncaught());

    let caught = try_protected(|region| {
        let _late = region.protect(tagged(rt, class, 9)?);
        result
    })
    .unwrap_err();
    assert_eq!(caught.reason(), Some("early"));
    assert!(!uncaught());
    assert_eq!(unwind_state(), UnwindState::Normal);

    outer.leave();
    assert_eq!(protection_depth(), 0);
    assert!(!uncaught());
    assert_eq!(deinit_log(), [9]);
}

#[test]
fn test_show_protection_stack_lists_innermost_first() {
    setup();
    let (rt, class) = tagged_runtime();

    let outer = Region::enter();
    let tagged_obj = outer.protect(try_protected(|_| tagged(rt, class, 1)).unwrap());
    let inner = Region::enter();
    let _absent = inner.protect(None);
    let _buffer = protect_with(vec![0u8; 4], drop);

    let mut out = Vec::new();
    show_protection_stack(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().map(str::trim_end).collect();
    assert_eq!(
        lines,
        [
            "prt[   0] = Vec<u8>",
            "prt[   1] = absent",
            "prt[   2] = Tagged",
        ]
    );
    assert_eq!(protection_stack().len(), 3);

    inner.leave();
    outer.leave();
    assert!(tagged_obj.get().is_some());
}

// ============================================================================
// Termination
// ============================================================================

#[test]
#[should_panic(expected = "uncaught exception Nil: nobody listens")]
fn test_throw_without_region_terminates() {
    setup();
    let _thrown = throw!(None, "nobody listens");
}

#[test]
#[should_panic(expected = "uncaught exception Overflow")]
fn test_uncaught_through_all_regions_terminates() {
    setup();
    let (rt, _, overflow) = overflow_runtime();

    let region = Region::enter();
    let exception = rt.allocate(overflow, 0).unwrap();
    let _thrown = throw!(exception);
    drop(region);
}

#[test]
#[should_panic(expected = "uncaught exception Nil: discarded")]
fn test_discarded_exception_terminates() {
    setup();
    let _region = Region::enter();
    let thrown = throw!(None, "discarded");
    drop(thrown);
}

#[test]
#[should_panic(expected = "thrown during unwinding")]
fn test_throw_while_unwinding_is_fatal() {
    setup();
    let _region = Region::enter();
    let _first = throw!(None, "first");
    let _second = throw!(None, "second");
}

#[test]
#[should_panic(expected = "deinit failed")]
fn test_implicit_release_exception_terminates() {
    setup();
    let mut builder = RegistryBuilder::new();
    let faulty = builder.define_class("Faulty", ClassId::OBJECT, 0).unwrap();
    builder
        .define_deinit(faulty, |_| Err(throw!(None, "deinit failed")))
        .unwrap();
    let rt = builder.freeze().unwrap();

    let region = Region::enter();
    let obj = rt.allocate(faulty, 0).unwrap();
    drop(obj);
    region.leave();
}

#[test]
#[should_panic(expected = "Protected region 1 left while region 2 is innermost")]
fn test_regions_left_out_of_order_is_fatal() {
    setup();
    let outer = Region::enter();
    let _inner = Region::enter();
    outer.leave();
}
