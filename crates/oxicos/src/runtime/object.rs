//! Object allocation and lifecycle management for the `OxiCOS` runtime.
//!
//! This module implements the object system with:
//! - Manual reference counting (`Clone` retains, `Drop` releases)
//! - Deinitializer chains dispatched through the built-in `deinit` generic
//! - Zero-initialized byte payloads with typed scalar access
//! - In-place class reassignment (`change_class`)
//! - Associated object references, released after the deinit chain
//!
//! # Architecture
//!
//! Objects are heap-allocated with manual memory management:
//! - Each object has a plain (non-atomic) reference count
//! - When the count reaches 0 the `deinit` generic is sent to the object,
//!   then its storage is freed
//! - Static objects are never freed; retain and release are no-ops on them
//!
//! # Thread Safety
//!
//! `Object` is neither `Send` nor `Sync`: reference counts are not atomic and
//! every object stays on the thread that allocated it.

use crate::error::{Error, Result};
use crate::runtime::exception::{Location, Throws, raise};
use crate::runtime::registry::Runtime;
use crate::runtime::{Class, ClassId, GenericId};
use oxicos_log::{debug, warn};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::mem::ManuallyDrop;
use std::ptr::NonNull;

/// Storage owned elsewhere; never freed.
const FLAG_STATIC: u32 = 1 << 0;
/// The deinit chain is running.
const FLAG_IN_DEINIT: u32 = 1 << 1;
/// The deinit chain has run; storage is kept only while handles remain.
const FLAG_FINALIZED: u32 = 1 << 2;

/// Raw object representation allocated on heap.
pub(crate) struct RawObject {
    /// Runtime whose registry defines `class` (never deallocated).
    runtime: &'static Runtime,
    /// Current class; reassigned in place by `change_class`.
    class: Cell<ClassId>,
    /// Reference count (starts at 1, destroyed when it reaches 0).
    refcount: Cell<i32>,
    flags: Cell<u32>,
    /// Zero-initialized instance storage.
    payload: RefCell<Box<[u8]>>,
    associations: RefCell<Vec<(&'static str, Object)>>,
}

/// Object represents a runtime instance with dynamic dispatch.
///
/// An `Object` value is one counted reference: cloning retains, dropping
/// releases. Equality is identity.
///
/// # Example
///
/// ```rust
/// use oxicos::runtime::{ClassId, RegistryBuilder, try_protected};
///
/// let mut builder = RegistryBuilder::new();
/// let point = builder.define_class("Point", ClassId::OBJECT, 16).unwrap();
/// let runtime = builder.freeze().unwrap();
///
/// try_protected(|_| {
///     let p1 = runtime.allocate(point, 0)?;
///     p1.write(0, 1.5_f64).unwrap();
///
///     // Clone creates a new reference to the same object
///     let p2 = p1.clone();
///     assert_eq!(p1.refcount(), 2);
///     assert_eq!(p2.read::<f64>(0).unwrap(), 1.5);
///     assert_eq!(p1, p2);
///     Ok(())
/// })
/// .unwrap();
/// ```
pub struct Object {
    /// Never null, valid while the count is positive.
    ptr: NonNull<RawObject>,
}

impl Object {
    /// Allocates an instance of `class` with `extra` payload bytes beyond the
    /// class's instance size.
    pub(crate) fn alloc(
        runtime: &'static Runtime,
        class: ClassId,
        extra: usize,
        flags: u32,
    ) -> Result<Object> {
        let info = runtime
            .try_class_info(class)
            .ok_or(Error::UnknownClass { id: class.raw() })?;
        let size = info
            .instance_size
            .checked_add(extra)
            .ok_or(Error::OutOfMemory {
                requested: usize::MAX,
            })?;

        let mut storage = Vec::new();
        storage
            .try_reserve_exact(size)
            .map_err(|_| Error::OutOfMemory { requested: size })?;
        storage.resize(size, 0u8);

        let raw = Box::new(RawObject {
            runtime,
            class: Cell::new(class),
            refcount: Cell::new(1),
            flags: Cell::new(flags),
            payload: RefCell::new(storage.into_boxed_slice()),
            associations: RefCell::new(Vec::new()),
        });

        Ok(Object {
            ptr: NonNull::from(Box::leak(raw)),
        })
    }

    fn raw(&self) -> &RawObject {
        // SAFETY: ptr points to a live RawObject while this handle exists.
        unsafe { self.ptr.as_ref() }
    }

    /// A second handle to the same object that owns no count.
    ///
    /// # Safety
    ///
    /// The alias must not be dropped and must not outlive the counted
    /// reference it was taken from.
    pub(crate) unsafe fn alias(&self) -> ManuallyDrop<Object> {
        ManuallyDrop::new(Object { ptr: self.ptr })
    }

    /// Returns a new counted reference to this object.
    ///
    /// # Panics
    ///
    /// Panics if the reference count overflows; see
    /// [`try_retain`](Self::try_retain).
    #[must_use]
    pub fn retain(&self) -> Object {
        self.clone()
    }

    /// Returns a new counted reference to this object.
    ///
    /// # Errors
    ///
    /// Raises `ExBadAlloc` when the reference count is saturated; the count
    /// is unchanged.
    #[track_caller]
    pub fn try_retain(&self) -> Throws<Object> {
        let location = Location::caller();
        self.increment()
            .map_err(|err| raise(self.runtime(), err, location))?;
        Ok(Object { ptr: self.ptr })
    }

    fn increment(&self) -> Result<()> {
        let raw = self.raw();
        if raw.flags.get() & FLAG_STATIC == 0 {
            let count = raw.refcount.get();
            if count == i32::MAX {
                return Err(Error::RefCountOverflow);
            }
            raw.refcount.set(count + 1);
        }
        Ok(())
    }

    /// Gives up this reference.
    ///
    /// When it was the last one, the deinit chain runs and the storage is
    /// freed.
    ///
    /// # Errors
    ///
    /// Returns the exception thrown by the deinit chain. Storage is freed
    /// regardless.
    pub fn release(self) -> Throws<()> {
        let this = ManuallyDrop::new(self);
        this.release_ref()
    }

    /// Drops the count held by this handle without consuming it.
    fn release_ref(&self) -> Throws<()> {
        let raw = self.raw();
        let flags = raw.flags.get();
        if flags & FLAG_STATIC != 0 {
            return Ok(());
        }

        let count = raw.refcount.get() - 1;
        raw.refcount.set(count);
        if count > 0 || flags & FLAG_IN_DEINIT != 0 {
            return Ok(());
        }

        if flags & FLAG_FINALIZED != 0 {
            // SAFETY: last handle of an object whose deinit chain already ran.
            unsafe { drop(Box::from_raw(self.ptr.as_ptr())) };
            return Ok(());
        }

        Self::destroy(self.ptr)
    }

    fn destroy(ptr: NonNull<RawObject>) -> Throws<()> {
        // SAFETY: the count just reached zero; nothing else frees `ptr`
        // before the end of this function.
        let raw = unsafe { ptr.as_ref() };
        raw.flags.set(raw.flags.get() | FLAG_IN_DEINIT);

        // Owns no count; `ptr` stays valid until freed below.
        let handle = ManuallyDrop::new(Object { ptr });
        let result = raw
            .runtime
            .send(GenericId::DEINIT, &[&*handle])
            .map(drop);

        let associations = raw.associations.take();
        drop(associations);

        raw.flags
            .set((raw.flags.get() & !FLAG_IN_DEINIT) | FLAG_FINALIZED);

        let remaining = raw.refcount.get();
        if remaining > 0 {
            warn!(
                "{} instance resurrected during deinit ({} references kept)",
                handle.class_name(),
                remaining
            );
            return result;
        }

        // SAFETY: ptr was created with Box::leak and no handle remains.
        unsafe { drop(Box::from_raw(ptr.as_ptr())) };
        result
    }

    /// Returns the runtime this object belongs to.
    #[must_use]
    pub fn runtime(&self) -> &'static Runtime {
        self.raw().runtime
    }

    /// Returns the object's current class.
    #[must_use]
    pub fn class(&self) -> Class {
        Class {
            runtime: self.raw().runtime,
            id: self.class_id(),
        }
    }

    #[must_use]
    pub fn class_id(&self) -> ClassId {
        self.raw().class.get()
    }

    #[must_use]
    pub fn class_name(&self) -> &'static str {
        &self.raw().runtime.class_info(self.class_id()).name
    }

    /// Returns true if the object's class is `class` or a subclass of it.
    #[must_use]
    pub fn is_kind_of(&self, class: ClassId) -> bool {
        self.runtime().is_subclass_of(self.class_id(), class)
    }

    /// Returns the current reference count.
    #[must_use]
    pub fn refcount(&self) -> i32 {
        self.raw().refcount.get()
    }

    /// Returns true for objects created by [`Runtime::allocate_static`].
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.raw().flags.get() & FLAG_STATIC != 0
    }

    /// Returns true while the deinit chain runs.
    #[must_use]
    pub fn is_deallocating(&self) -> bool {
        self.raw().flags.get() & FLAG_IN_DEINIT != 0
    }

    /// Payload bytes allocated for this object.
    #[must_use]
    pub fn allocated_size(&self) -> usize {
        self.raw().payload.borrow().len()
    }

    /// Returns true if both handles refer to the same object.
    #[must_use]
    pub fn ptr_eq(a: &Object, b: &Object) -> bool {
        a.ptr == b.ptr
    }

    /// Reassigns the object's class in place.
    ///
    /// Succeeds iff the new class's instance size fits in the storage
    /// allocated for this object. The payload is left untouched.
    ///
    /// # Errors
    ///
    /// Raises `ExBadClass` when the storage is too small or the class is
    /// unknown; the class is unchanged.
    #[track_caller]
    pub fn change_class(&self, class: ClassId) -> Throws<()> {
        let location = Location::caller();
        let runtime = self.runtime();
        let Some(info) = runtime.try_class_info(class) else {
            return Err(raise(runtime, Error::UnknownClass { id: class.raw() }, location));
        };

        let allocated = self.allocated_size();
        if info.instance_size > allocated {
            return Err(raise(
                runtime,
                Error::IllegalClassChange {
                    from: self.class_name().to_string(),
                    to: info.name.clone(),
                    required: info.instance_size,
                    allocated,
                },
                location,
            ));
        }

        debug!("changing class {} -> {}", self.class_name(), info.name);
        self.raw().class.set(class);
        Ok(())
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<()> {
        let size = self.allocated_size();
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(()),
            _ => Err(Error::PayloadOutOfBounds { offset, len, size }),
        }
    }

    /// Reads a scalar at byte `offset` of the payload (native endianness).
    ///
    /// # Errors
    ///
    /// [`Error::PayloadOutOfBounds`] if the value does not fit.
    pub fn read<T: Scalar>(&self, offset: usize) -> Result<T> {
        self.check_bounds(offset, T::SIZE)?;
        let payload = self.raw().payload.borrow();
        Ok(T::from_bytes(&payload[offset..offset + T::SIZE]))
    }

    /// Writes a scalar at byte `offset` of the payload (native endianness).
    ///
    /// # Errors
    ///
    /// [`Error::PayloadOutOfBounds`] if the value does not fit.
    ///
    /// # Panics
    ///
    /// Panics if called from inside [`with_payload`](Self::with_payload) on
    /// the same object.
    pub fn write<T: Scalar>(&self, offset: usize, value: T) -> Result<()> {
        self.check_bounds(offset, T::SIZE)?;
        let mut payload = self.raw().payload.borrow_mut();
        value.write_bytes(&mut payload[offset..offset + T::SIZE]);
        Ok(())
    }

    /// Runs `f` with the whole payload.
    pub fn with_payload<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.raw().payload.borrow())
    }

    /// Runs `f` with the whole payload, mutably.
    pub fn with_payload_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.raw().payload.borrow_mut())
    }

    /// Associates `value` with `key`, returning the previous association.
    /// `None` removes it.
    pub fn set_association(&self, key: &'static str, value: Option<Object>) -> Option<Object> {
        let mut associations = self.raw().associations.borrow_mut();
        let position = associations.iter().position(|(k, _)| *k == key);
        match (position, value) {
            (Some(i), Some(value)) => Some(std::mem::replace(&mut associations[i].1, value)),
            (Some(i), None) => Some(associations.remove(i).1),
            (None, Some(value)) => {
                associations.push((key, value));
                None
            }
            (None, None) => None,
        }
    }

    /// Returns a new reference to the object associated with `key`.
    #[must_use]
    pub fn association(&self, key: &str) -> Option<Object> {
        self.raw()
            .associations
            .borrow()
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, value)| value.clone())
    }
}

impl Runtime {
    /// Allocates an instance of `class` with a zeroed payload of
    /// `instance_size + extra` bytes and a reference count of 1.
    ///
    /// # Errors
    ///
    /// Raises `ExBadAlloc` if the storage cannot be allocated, `ExBadClass`
    /// if `class` is unknown.
    #[track_caller]
    pub fn allocate(&'static self, class: ClassId, extra: usize) -> Throws<Object> {
        let location = Location::caller();
        Object::alloc(self, class, extra, 0).map_err(|err| raise(self, err, location))
    }

    /// Allocates an immortal instance: retain and release are no-ops and the
    /// storage is never freed.
    ///
    /// # Errors
    ///
    /// As [`allocate`](Self::allocate).
    #[track_caller]
    pub fn allocate_static(&'static self, class: ClassId, extra: usize) -> Throws<Object> {
        let location = Location::caller();
        Object::alloc(self, class, extra, FLAG_STATIC).map_err(|err| raise(self, err, location))
    }
}

impl Clone for Object {
    fn clone(&self) -> Self {
        if let Err(err) = self.increment() {
            panic!("{err} in Object::retain");
        }
        Object { ptr: self.ptr }
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        if let Err(thrown) = self.release_ref() {
            // An exception from an implicit release cannot propagate; dropping
            // it reports it as uncaught.
            drop(thrown);
        }
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl Eq for Object {}

impl Hash for Object {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ptr.hash(state);
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("class", &self.class_name())
            .field("refcount", &self.refcount())
            .field("size", &self.allocated_size())
            .field("ptr", &self.ptr)
            .finish()
    }
}

/// Returns a new reference, or `None` for the nil marker.
#[must_use]
pub fn retain(object: Option<&Object>) -> Option<Object> {
    object.map(Object::retain)
}

/// Releases a reference; the nil marker is ignored.
///
/// # Errors
///
/// As [`Object::release`].
pub fn release(object: Option<Object>) -> Throws<()> {
    object.map_or(Ok(()), Object::release)
}

mod sealed {
    pub trait Sealed {}
}

/// Fixed-size values that can be stored in an object payload.
pub trait Scalar: Copy + sealed::Sealed {
    /// Width in bytes.
    const SIZE: usize;

    #[doc(hidden)]
    fn from_bytes(bytes: &[u8]) -> Self;

    #[doc(hidden)]
    fn write_bytes(self, out: &mut [u8]);
}

macro_rules! impl_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Scalar for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn from_bytes(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    buf.copy_from_slice(bytes);
                    <$ty>::from_ne_bytes(buf)
                }

                fn write_bytes(self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_ne_bytes());
                }
            }
        )*
    };
}

impl_scalar!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64);
