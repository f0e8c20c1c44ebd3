//! Property-style tests over generated class hierarchies and method sets.
//!
//! Inputs come from a fixed-seed generator so failures are reproducible.

mod common;

use common::{deinit_log, define_tagged, setup, tagged, unique_name};
use oxicos::runtime::{
    ClassId, Config, Precedence, RegistryBuilder, Value, try_protected,
};

/// Deterministic linear congruential generator.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }
}

// ============================================================================
// Dispatch Properties
// ============================================================================

#[test]
fn test_chain_dispatch_picks_nearest_ancestor_method() {
    setup();
    let mut rng = Lcg(0x5EED);

    for _ in 0..20 {
        let mut builder = RegistryBuilder::new();
        let depth = 1 + rng.below(7) as usize;
        let mut chain = vec![ClassId::OBJECT];
        for _ in 0..depth {
            let parent = *chain.last().unwrap();
            chain.push(builder.define_class(&unique_name("Link"), parent, 0).unwrap());
        }

        let probe = builder.define_generic("probe", 1).unwrap();
        let mut has_method = vec![false; chain.len()];
        has_method[0] = true;
        for level in 1..chain.len() {
            has_method[level] = rng.below(2) == 0;
        }
        for (level, &class) in chain.iter().enumerate() {
            if has_method[level] {
                let tag = level as i64;
                builder
                    .define_method(probe, &[class], move |_| Ok(Value::Int(tag)))
                    .unwrap();
            }
        }
        let rt = builder.freeze().unwrap();

        for (level, &class) in chain.iter().enumerate() {
            let expected = (0..=level).rev().find(|&l| has_method[l]).unwrap() as i64;
            let got = try_protected(|_| {
                let obj = rt.allocate(class, 0)?;
                rt.send(probe, &[&obj])
            })
            .unwrap();
            assert_eq!(got.as_int(), Some(expected), "level {level} of {depth}");
        }
    }
}

#[test]
fn test_disjoint_selector_tuples_never_ambiguous() {
    setup();
    for precedence in [Precedence::LeftToRight, Precedence::Symmetric] {
        let mut builder = RegistryBuilder::with_config(Config::default().precedence(precedence));
        let base = builder.define_class("Base", ClassId::OBJECT, 0).unwrap();
        let leaves: Vec<ClassId> = (0..4)
            .map(|i| builder.define_class(&format!("Leaf{i}"), base, 0).unwrap())
            .collect();

        let pair = builder.define_generic("pair", 2).unwrap();
        for (i, &x) in leaves.iter().enumerate() {
            for (j, &y) in leaves.iter().enumerate() {
                let tag = (i * 10 + j) as i64;
                builder
                    .define_method(pair, &[x, y], move |_| Ok(Value::Int(tag)))
                    .unwrap();
            }
        }
        let rt = builder.freeze().unwrap();
        assert_eq!(rt.generic(pair).unwrap().method_count(), 16);

        for (i, &x) in leaves.iter().enumerate() {
            for (j, &y) in leaves.iter().enumerate() {
                let got = try_protected(|_| {
                    let a = rt.allocate(x, 0)?;
                    let b = rt.allocate(y, 0)?;
                    rt.send(pair, &[&a, &b])
                })
                .unwrap();
                assert_eq!(got.as_int(), Some((i * 10 + j) as i64));
            }
        }
    }
}

// ============================================================================
// Lifecycle Properties
// ============================================================================

#[test]
fn test_balanced_retains_fire_deinit_once() {
    setup();
    let mut builder = RegistryBuilder::new();
    let class = define_tagged(&mut builder);
    let rt = builder.freeze().unwrap();
    let mut rng = Lcg(42);

    for round in 0..16_u64 {
        let obj = try_protected(|_| tagged(rt, class, round)).unwrap();
        let n = rng.below(20) as usize;
        let handles: Vec<_> = (0..n).map(|_| obj.retain()).collect();
        assert_eq!(obj.refcount(), 1 + n as i32);

        for handle in handles {
            handle.release().unwrap();
        }
        assert_eq!(deinit_log().len(), round as usize);
        drop(obj);
        assert_eq!(deinit_log().last(), Some(&round));
    }
    assert_eq!(deinit_log(), (0..16).collect::<Vec<u64>>());
}

#[test]
fn test_change_class_succeeds_iff_size_fits() {
    setup();
    let sizes = [0_usize, 4, 8, 16, 32];
    let mut builder = RegistryBuilder::new();
    let classes: Vec<ClassId> = sizes
        .iter()
        .map(|&size| {
            builder
                .define_class(&format!("Sized{size}"), ClassId::OBJECT, size)
                .unwrap()
        })
        .collect();
    let rt = builder.freeze().unwrap();

    for (&from_size, &from) in sizes.iter().zip(&classes) {
        for extra in [0_usize, 4, 12] {
            let allocated = from_size + extra;
            for (&to_size, &to) in sizes.iter().zip(&classes) {
                let obj = try_protected(|_| rt.allocate(from, extra)).unwrap();
                let result = try_protected(|_| obj.change_class(to));

                if to_size <= allocated {
                    assert!(result.is_ok(), "{from_size}+{extra} -> {to_size}");
                    assert_eq!(obj.class_id(), to);
                } else {
                    let caught = result.unwrap_err();
                    assert!(caught.is_kind_of(ClassId::EX_BAD_CLASS));
                    assert_eq!(obj.class_id(), from);
                }
                assert_eq!(obj.allocated_size(), allocated);
            }
        }
    }
}
