//! Multiple-argument dispatch.
//!
//! A method is applicable to a call when each of its selectors is an
//! ancestor-or-self of the corresponding argument's class. For each
//! applicable method the resolver records the ancestry distance at every
//! argument position; specificity compares these distance vectors:
//!
//! - [`Precedence::LeftToRight`]: lexicographic comparison. Two distinct
//!   applicable methods never have equal vectors, so this is a total order.
//! - [`Precedence::Symmetric`]: componentwise dominance, a partial order.
//!
//! The selected method is the unique maximal element. No element means the
//! message is unrecognized; several mean the call is ambiguous.
//!
//! `next_method` reuses the same selection over the applicable methods that
//! are strictly less specific than the running one.
//!
//! Each generic caches its applicable candidates per argument class tuple.
//! The registry is frozen, so a cached entry never goes stale.

use crate::error::{Error, Result};
use crate::runtime::exception::{Location, Throws, raise};
use crate::runtime::generic::{Candidate, GenericInfo, MAX_ARITY};
use crate::runtime::registry::Runtime;
use crate::runtime::{Call, ClassId, GenericId, MethodId, Object, Precedence, Value};
use oxicos_log::trace;
use std::cmp::Ordering;
use std::sync::{Arc, PoisonError};

/// Outcome of selecting among applicable methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Selection {
    None,
    One(usize),
    Tie(usize, usize),
}

impl Runtime {
    /// Applicable methods of `generic` for arguments of `classes`.
    pub(crate) fn applicable(&self, generic: &GenericInfo, classes: &[ClassId]) -> Vec<Candidate> {
        let arity = generic.arity;
        generic.by_first_arg[classes[0].index()]
            .iter()
            .filter_map(|&method| {
                let selectors = self.method_info(method).selectors(arity);
                let mut distances = [0u16; MAX_ARITY];
                for (slot, (&selector, &class)) in
                    distances.iter_mut().zip(selectors.iter().zip(classes))
                {
                    let distance = self.distance(class, selector)?;
                    *slot = u16::try_from(distance).unwrap_or(u16::MAX);
                }
                Some(Candidate { method, distances })
            })
            .collect()
    }

    /// Applicable methods for a padded class tuple, computed once per tuple.
    pub(crate) fn cached_applicable(
        &self,
        generic: &GenericInfo,
        classes: &[ClassId; MAX_ARITY],
    ) -> Arc<[Candidate]> {
        let cache = generic.cache.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(hit) = cache.get(classes) {
            return Arc::clone(hit);
        }
        drop(cache);

        let computed: Arc<[Candidate]> = self.applicable(generic, &classes[..generic.arity]).into();
        let mut cache = generic.cache.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(cache.entry(*classes).or_insert(computed))
    }

    /// Compares two candidates; `Less` means `a` is more specific.
    pub(crate) fn compare(&self, a: &Candidate, b: &Candidate, arity: usize) -> Option<Ordering> {
        let (a, b) = (&a.distances[..arity], &b.distances[..arity]);
        match self.config.precedence {
            Precedence::LeftToRight => Some(a.cmp(b)),
            Precedence::Symmetric => {
                let mut order = Ordering::Equal;
                for (x, y) in a.iter().zip(b) {
                    match (order, x.cmp(y)) {
                        (_, Ordering::Equal) => {}
                        (Ordering::Equal, step) => order = step,
                        (current, step) if current != step => return None,
                        _ => {}
                    }
                }
                Some(order)
            }
        }
    }

    /// Maximal elements among the candidates accepted by `filter`.
    pub(crate) fn select(
        &self,
        candidates: &[Candidate],
        arity: usize,
        filter: impl Fn(&Candidate) -> bool,
    ) -> Selection {
        let eligible: Vec<usize> = (0..candidates.len())
            .filter(|&i| filter(&candidates[i]))
            .collect();

        let mut maximal = eligible.iter().copied().filter(|&i| {
            !eligible.iter().any(|&j| {
                j != i
                    && self.compare(&candidates[j], &candidates[i], arity) == Some(Ordering::Less)
            })
        });

        match (maximal.next(), maximal.next()) {
            (None, _) => Selection::None,
            (Some(i), None) => Selection::One(i),
            (Some(i), Some(j)) => Selection::Tie(i, j),
        }
    }

    /// Sends `generic` to `args`.
    ///
    /// # Errors
    ///
    /// Raises `ExBadMessage` when no method applies and no unrecognized-message
    /// hook is installed, or when the number of arguments does not match the
    /// generic's arity; raises `ExAmbiguous` when several methods are
    /// maximally specific. Exceptions thrown by the method propagate.
    #[track_caller]
    pub fn send(&'static self, generic: GenericId, args: &[&Object]) -> Throws<Value> {
        self.dispatch(generic, args, &[], Location::caller())
    }

    /// Sends `generic` to `args`, passing `extra` values that take no part in
    /// method selection.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send).
    #[track_caller]
    pub fn send_with(
        &'static self,
        generic: GenericId,
        args: &[&Object],
        extra: &[Value],
    ) -> Throws<Value> {
        self.dispatch(generic, args, extra, Location::caller())
    }

    pub(crate) fn dispatch(
        &'static self,
        generic: GenericId,
        args: &[&Object],
        extra: &[Value],
        location: Location,
    ) -> Throws<Value> {
        let Some(info) = self.generics.get(generic.index()) else {
            return Err(raise(self, Error::UnknownGeneric { id: generic.raw() }, location));
        };

        if args.len() != info.arity {
            return Err(raise(
                self,
                Error::ArityMismatch {
                    generic: info.name.clone(),
                    expected: info.arity,
                    got: args.len(),
                },
                location,
            ));
        }

        let mut classes = [ClassId::OBJECT; MAX_ARITY];
        for (slot, arg) in classes.iter_mut().zip(args) {
            if !std::ptr::eq(arg.runtime(), self) {
                return Err(raise(self, Error::UnknownClass { id: arg.class_id().raw() }, location));
            }
            *slot = arg.class_id();
        }

        let applicable = self.cached_applicable(info, &classes);
        let mut call = Call {
            runtime: self,
            generic,
            args,
            extra,
            applicable: &applicable[..],
            current: None,
            location,
        };

        match self.select(&applicable, info.arity, |_| true) {
            Selection::One(index) => {
                call.current = Some(index);
                let method = applicable[index].method;
                trace!("{} -> method #{}", describe(&call), method.raw());
                (self.method_info(method).body)(&call)
            }
            Selection::None => self.unrecognized(&call),
            Selection::Tie(..) => Err(raise(
                self,
                Error::AmbiguousDispatch {
                    generic: info.name.clone(),
                    classes: call.class_names(),
                },
                location,
            )),
        }
    }

    /// The meet of two selector tuples: at each position the more derived
    /// selector, or `None` if some position holds unrelated classes.
    fn meet(&self, a: &[ClassId], b: &[ClassId]) -> Option<[ClassId; MAX_ARITY]> {
        let mut meet = [ClassId::OBJECT; MAX_ARITY];
        for (slot, (&x, &y)) in meet.iter_mut().zip(a.iter().zip(b)) {
            *slot = if self.distance(x, y).is_some() {
                x
            } else if self.distance(y, x).is_some() {
                y
            } else {
                return None;
            };
        }
        Some(meet)
    }

    /// Rejects generics where two methods can both be maximally specific.
    ///
    /// Any tie between two methods also shows up at the meet of their
    /// selector tuples, so checking every pair's meet covers every call.
    pub(crate) fn check_ambiguity(&self) -> Result<()> {
        for generic in &self.generics {
            let arity = generic.arity;
            for (i, &first) in generic.methods.iter().enumerate() {
                for &second in &generic.methods[i + 1..] {
                    let Some(meet) = self.meet(
                        self.method_info(first).selectors(arity),
                        self.method_info(second).selectors(arity),
                    ) else {
                        continue;
                    };

                    let applicable = self.applicable(generic, &meet[..arity]);
                    if let Selection::Tie(a, b) = self.select(&applicable, arity, |_| true) {
                        let (a, b) = ordered(applicable[a].method, applicable[b].method);
                        return Err(Error::AmbiguousMethods {
                            generic: generic.name.clone(),
                            first: self.selector_names(a, arity),
                            second: self.selector_names(b, arity),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn selector_names(&self, method: MethodId, arity: usize) -> Vec<String> {
        self.method_info(method)
            .selectors(arity)
            .iter()
            .map(|&c| self.class_info(c).name.clone())
            .collect()
    }
}

fn ordered(a: MethodId, b: MethodId) -> (MethodId, MethodId) {
    if a <= b { (a, b) } else { (b, a) }
}

fn describe(call: &Call<'_>) -> String {
    format!("{}({})", call.generic().name(), call.class_names().join(", "))
}

impl Call<'_> {
    fn next_selection(&self) -> Option<Selection> {
        let current = &self.applicable[self.current?];
        let arity = self.args.len();
        Some(self.runtime.select(self.applicable, arity, |candidate| {
            self.runtime.compare(candidate, current, arity) == Some(Ordering::Greater)
        }))
    }

    /// Invokes the next less specific applicable method with the same
    /// arguments.
    ///
    /// # Errors
    ///
    /// Raises `ExBadMessage` when no less specific method applies (or when
    /// called from an unrecognized-message hook), `ExAmbiguous` when the next
    /// step is a tie. Exceptions thrown by the next method propagate.
    #[track_caller]
    pub fn next_method(&self) -> Throws<Value> {
        let location = Location::caller();
        match self.next_selection() {
            Some(Selection::One(index)) => {
                let call = Call {
                    current: Some(index),
                    ..*self
                };
                let method = self.applicable[index].method;
                trace!("{} -> next method #{}", describe(self), method.raw());
                (self.runtime.method_info(method).body)(&call)
            }
            Some(Selection::Tie(..)) => Err(raise(
                self.runtime,
                Error::AmbiguousDispatch {
                    generic: self.generic().name().to_string(),
                    classes: self.class_names(),
                },
                location,
            )),
            Some(Selection::None) | None => Err(raise(
                self.runtime,
                Error::NoNextMethod {
                    generic: self.generic().name().to_string(),
                    classes: self.class_names(),
                },
                location,
            )),
        }
    }

    /// Returns true if [`next_method`](Self::next_method) would find exactly
    /// one method.
    #[must_use]
    pub fn has_next_method(&self) -> bool {
        matches!(self.next_selection(), Some(Selection::One(_)))
    }
}
