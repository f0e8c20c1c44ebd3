//! Integration tests for unrecognized-message hooks and forwarding proxies.

mod common;

use common::{Shapes, define_shapes, setup, sized};
use oxicos::Error;
use oxicos::runtime::{
    Call, ClassId, Config, GenericId, RegistryBuilder, Runtime, Throws, Value, forward_depth,
    try_protected,
};
use oxicos::throw;

const TARGET: &str = "target";

/// Forwards to the object associated under `target`.
fn forward_to_target(call: &Call<'_>) -> Throws<Value> {
    match call.arg(0).association(TARGET) {
        Some(target) => call.forward(&target),
        None => Err(throw!(None, "proxy without target")),
    }
}

struct Fixture {
    rt: &'static Runtime,
    shapes: Shapes,
    proxy: ClassId,
    area: GenericId,
}

fn fixture(config: Config) -> Fixture {
    let mut builder = RegistryBuilder::with_config(config);
    let shapes = define_shapes(&mut builder);
    let proxy = builder.define_class("Proxy", ClassId::OBJECT, 0).unwrap();
    let area = builder.define_generic("area", 1).unwrap();
    builder
        .define_method(area, &[shapes.square], |call| {
            let side: f64 = call.arg(0).read(0).unwrap_or_default();
            Ok(Value::Float(side * side))
        })
        .unwrap();
    builder.set_unrecognized(proxy, forward_to_target).unwrap();
    Fixture {
        rt: builder.freeze().unwrap(),
        shapes,
        proxy,
        area,
    }
}

#[test]
fn test_proxy_forwards_to_target() {
    setup();
    let fx = fixture(Config::default());

    let value = try_protected(|_| {
        let square = sized(fx.rt, fx.shapes.square, 3.0)?;
        let proxy = fx.rt.allocate(fx.proxy, 0)?;
        proxy.set_association(TARGET, Some(square));
        fx.rt.send(fx.area, &[&proxy])
    })
    .unwrap();

    assert_eq!(value.as_float(), Some(9.0));
    assert_eq!(forward_depth(), 0);
}

#[test]
fn test_forwarding_keeps_send_location() {
    setup();
    let fx = fixture(Config::default());

    let caught = try_protected(|_| {
        let circle = fx.rt.allocate(fx.shapes.circle, 0)?;
        let proxy = fx.rt.allocate(fx.proxy, 0)?;
        proxy.set_association(TARGET, Some(circle));
        fx.rt.send(fx.area, &[&proxy])
    })
    .unwrap_err();

    assert_eq!(
        caught.cause(),
        Some(&Error::NoApplicableMethod {
            generic: "area".into(),
            classes: vec!["Circle".into()],
        })
    );
    assert_eq!(caught.location().file(), file!());
}

#[test]
fn test_self_forward_rejected() {
    setup();
    let mut builder = RegistryBuilder::new();
    let mirror = builder.define_class("Mirror", ClassId::OBJECT, 0).unwrap();
    let ping = builder.define_generic("ping", 1).unwrap();
    builder
        .set_unrecognized(mirror, |call| call.forward(call.arg(0)))
        .unwrap();
    let rt = builder.freeze().unwrap();

    let caught = try_protected(|_| {
        let obj = rt.allocate(mirror, 0)?;
        rt.send(ping, &[&obj])
    })
    .unwrap_err();

    assert!(caught.is_kind_of(ClassId::EX_BAD_MESSAGE));
    assert_eq!(
        caught.cause(),
        Some(&Error::ForwardingLoop {
            generic: "ping".into(),
            depth: 0,
        })
    );
}

#[test]
fn test_proxy_cycle_bounded_by_depth() {
    setup();
    let fx = fixture(Config::default().max_forward_depth(4));

    let caught = try_protected(|_| {
        let a = fx.rt.allocate(fx.proxy, 0)?;
        let b = fx.rt.allocate(fx.proxy, 0)?;
        a.set_association(TARGET, Some(b.clone()));
        b.set_association(TARGET, Some(a.clone()));
        let result = fx.rt.send(fx.area, &[&a]);
        // break the cycle so both proxies are freed
        a.set_association(TARGET, None);
        result
    })
    .unwrap_err();

    assert_eq!(
        caught.cause(),
        Some(&Error::ForwardingLoop {
            generic: "area".into(),
            depth: 4,
        })
    );
    assert_eq!(forward_depth(), 0);
}

#[test]
fn test_class_hook_beats_global_hook() {
    setup();
    let mut builder = RegistryBuilder::new();
    let quiet = builder.define_class("Quiet", ClassId::OBJECT, 0).unwrap();
    let quieter = builder.define_class("Quieter", quiet, 0).unwrap();
    let other = builder.define_class("Other", ClassId::OBJECT, 0).unwrap();
    let poke = builder.define_generic("poke", 1).unwrap();
    builder
        .set_unrecognized(quiet, |_| Ok(Value::Int(1)))
        .unwrap();
    builder.set_global_unrecognized(|call| {
        assert_eq!(call.generic().name(), "poke");
        Ok(Value::Int(2))
    });
    let rt = builder.freeze().unwrap();

    let results = try_protected(|_| {
        let mut results = Vec::new();
        for class in [quiet, quieter, other] {
            let obj = rt.allocate(class, 0)?;
            results.push(rt.send(poke, &[&obj])?.as_int());
        }
        Ok(results)
    })
    .unwrap();

    assert_eq!(results, [Some(1), Some(1), Some(2)]);
}

#[test]
fn test_forwarding_multi_argument_replaces_first() {
    setup();
    let mut builder = RegistryBuilder::new();
    let shapes = define_shapes(&mut builder);
    let proxy = builder.define_class("Proxy", ClassId::OBJECT, 0).unwrap();
    let stack = builder.define_generic("stack", 2).unwrap();
    builder
        .define_method(stack, &[shapes.square, shapes.circle], |call| {
            let a: f64 = call.arg(0).read(0).unwrap_or_default();
            let b: f64 = call.arg(1).read(0).unwrap_or_default();
            let extra = call.extra_arg(0).and_then(Value::as_float).unwrap_or_default();
            Ok(Value::Float(a + b + extra))
        })
        .unwrap();
    builder.set_unrecognized(proxy, forward_to_target).unwrap();
    let rt = builder.freeze().unwrap();

    let value = try_protected(|_| {
        let square = sized(rt, shapes.square, 1.0)?;
        let circle = sized(rt, shapes.circle, 2.0)?;
        let proxy_obj = rt.allocate(proxy, 0)?;
        proxy_obj.set_association(TARGET, Some(square));
        rt.send_with(stack, &[&proxy_obj, &circle], &[Value::Float(0.5)])
    })
    .unwrap();

    assert_eq!(value.as_float(), Some(3.5));
}
