//! Autorelease pools.
//!
//! An autorelease pool defers releases to the end of a scope. Objects handed
//! to a pool keep their reference count until the pool is drained; draining
//! releases each of them once, in registration order.
//!
//! Pools nest per thread. The free function [`autorelease`] registers into
//! the innermost pool of the current thread. Without an explicit pool it
//! falls back to a thread-root pool, created on first use and drained when
//! the thread exits.
//!
//! # Example
//!
//! ```rust
//! use oxicos::runtime::{AutoreleasePool, ClassId, RegistryBuilder, try_protected};
//!
//! let mut builder = RegistryBuilder::new();
//! let temp = builder.define_class("Temp", ClassId::OBJECT, 0).unwrap();
//! let runtime = builder.freeze().unwrap();
//!
//! let pool = AutoreleasePool::new();
//! let obj = try_protected(|_| runtime.allocate(temp, 0)).unwrap();
//! let view = pool.autorelease(obj);
//! assert_eq!(view.refcount(), 1);
//! drop(view);
//! assert_eq!(pool.len(), 1);
//! drop(pool); // releases the object
//! ```

use crate::runtime::Object;
use oxicos_log::{trace, warn};
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::rc::Rc;

type Storage = Rc<RefCell<Vec<Object>>>;

/// Releases everything in `storage`, including objects registered while
/// draining. Returns the number released.
fn drain_storage(storage: &Storage) -> usize {
    let mut released = 0;
    loop {
        let batch = std::mem::take(&mut *storage.borrow_mut());
        if batch.is_empty() {
            return released;
        }
        released += batch.len();
        // Vec drops its elements front to back.
        drop(batch);
    }
}

struct RootPool(Storage);

impl Drop for RootPool {
    fn drop(&mut self) {
        let released = drain_storage(&self.0);
        trace!("thread-root pool drained {} objects", released);
    }
}

thread_local! {
    static POOLS: RefCell<Vec<Storage>> = const { RefCell::new(Vec::new()) };
    static ROOT_POOL: RootPool = RootPool(Rc::default());
}

/// A scope-bound autorelease pool.
///
/// Creating a pool makes it the innermost pool of the current thread until
/// it is dropped. Dropping drains it.
pub struct AutoreleasePool {
    storage: Storage,
}

impl AutoreleasePool {
    /// Pushes a new innermost pool.
    #[must_use]
    pub fn new() -> Self {
        let storage = Storage::default();
        let depth = POOLS.with(|pools| {
            let mut pools = pools.borrow_mut();
            pools.push(Rc::clone(&storage));
            pools.len()
        });
        trace!("pushed autorelease pool (depth {})", depth);
        Self { storage }
    }

    /// Registers `object` for release when this pool drains.
    ///
    /// The returned view gives access to the object without owning a count;
    /// it cannot outlive the pool.
    pub fn autorelease(&self, object: Object) -> Autoreleased<'_> {
        // SAFETY: the pool owns `object` until it drains, which needs
        // `&mut self` or a drop and so cannot happen while the view exists.
        let view = unsafe { object.alias() };
        self.storage.borrow_mut().push(object);
        Autoreleased {
            object: view,
            _pool: PhantomData,
        }
    }

    /// Number of objects waiting for release.
    #[must_use]
    pub fn len(&self) -> usize {
        self.storage.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.storage.borrow().is_empty()
    }

    /// Releases every registered object, in registration order. The pool
    /// stays active. Returns the number released.
    pub fn drain(&mut self) -> usize {
        drain_storage(&self.storage)
    }
}

impl Default for AutoreleasePool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AutoreleasePool {
    fn drop(&mut self) {
        let released = drain_storage(&self.storage);

        let removed = POOLS.try_with(|pools| {
            let mut pools = pools.borrow_mut();
            match pools.iter().rposition(|s| Rc::ptr_eq(s, &self.storage)) {
                Some(index) => {
                    pools.remove(index);
                    true
                }
                None => false,
            }
        });
        if removed == Ok(false) {
            warn!("autorelease pool missing from the thread's pool stack");
        }
        trace!("popped autorelease pool ({} released)", released);
    }
}

impl fmt::Debug for AutoreleasePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoreleasePool")
            .field("pending", &self.len())
            .finish()
    }
}

/// An object registered in an [`AutoreleasePool`], borrowed from the pool.
pub struct Autoreleased<'pool> {
    object: ManuallyDrop<Object>,
    _pool: PhantomData<&'pool AutoreleasePool>,
}

impl Deref for Autoreleased<'_> {
    type Target = Object;

    fn deref(&self) -> &Object {
        &self.object
    }
}

impl fmt::Debug for Autoreleased<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// Hands `object` to the innermost autorelease pool of the current thread
/// (the thread-root pool when none is active). Its count is unchanged until
/// that pool drains.
pub fn autorelease(object: Object) {
    let object = POOLS
        .try_with(|pools| match pools.borrow().last() {
            Some(storage) => {
                storage.borrow_mut().push(object);
                None
            }
            None => Some(object),
        })
        .unwrap_or(None);

    if let Some(object) = object {
        // During thread teardown the root pool may already be gone; the
        // object is then released immediately.
        let _ = ROOT_POOL.try_with(move |root| root.0.borrow_mut().push(object));
    }
}

/// Number of explicit pools active on the current thread.
#[must_use]
pub fn pool_depth() -> usize {
    POOLS.with(|pools| pools.borrow().len())
}

impl Object {
    /// Hands this reference to the innermost autorelease pool; see
    /// [`autorelease`].
    pub fn autorelease(self) {
        autorelease(self);
    }
}
