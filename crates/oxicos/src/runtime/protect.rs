//! Protected regions and the per-thread protection stack.
//!
//! Every thread owns a stack of frames, one per active [`Region`], above a
//! permanent sentinel frame. Code registers cleanup obligations on a frame:
//! an object slot released if an exception passes ([`Region::protect`]) or a
//! value with a finalizer ([`Region::protect_with`]).
//!
//! When an exception is thrown, the innermost frame's entries run in LIFO
//! order and the frame becomes the catch target. A region that is left
//! while it is the target passes the exception outward: the next frame's
//! entries run and that frame becomes the target, until a region catches or
//! the sentinel is reached and the process terminates.
//!
//! Leaving a region normally discards its entries without running them:
//! protected values stay with the caller. Taking a value out of its slot, or
//! dropping the slot, withdraws the entry from its frame.
//!
//! # Example
//!
//! ```rust
//! use oxicos::runtime::{ClassId, RegistryBuilder, Region, Throws};
//! use oxicos::throw;
//!
//! let mut builder = RegistryBuilder::new();
//! let buffer = builder.define_class("Buffer", ClassId::OBJECT, 64).unwrap();
//! let runtime = builder.freeze().unwrap();
//!
//! let region = Region::enter();
//! let result: Throws<()> = (|| {
//!     let buf = region.protect(runtime.allocate(buffer, 0)?);
//!     assert_eq!(buf.get().unwrap().refcount(), 2);
//!     Err(throw!(None))
//! })();
//!
//! let caught = region.catch(result.unwrap_err());
//! assert_eq!(caught.class_name(), "Nil");
//! ```

use crate::error::Error;
use crate::runtime::exception::{Caught, Location, Termination, Thrown, Throws, terminate};
use crate::runtime::Object;
use oxicos_log::trace;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::io::{self, Write};
use std::marker::PhantomData;
use std::rc::Rc;

/// Unwind state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindState {
    /// No exception in flight.
    Normal,
    /// An exception is propagating towards a catching region.
    Unwinding,
}

/// A cleanup obligation registered on a protected region.
pub trait Cleanup {
    /// Name shown by [`show_protection_stack`]; `None` once the protected
    /// value is gone.
    fn describe(&self) -> Option<String>;

    /// Runs the cleanup while an exception passes the region.
    fn unwind(self: Box<Self>);
}

pub(crate) struct Entry {
    key: u64,
    cleanup: Box<dyn Cleanup>,
}

/// Where an entry was registered.
#[derive(Debug, Clone, Copy)]
struct EntryKey {
    depth: usize,
    key: u64,
}

struct Frame {
    entries: Vec<Entry>,
    /// State of the thread when the region was entered.
    entered: UnwindState,
    /// In-flight exception when the region was entered.
    saved: Option<Termination>,
    /// The in-flight exception targets this frame.
    target: bool,
}

impl Frame {
    fn new(entered: UnwindState, saved: Option<Termination>) -> Self {
        Self {
            entries: Vec::new(),
            entered,
            saved,
            target: false,
        }
    }
}

struct ExceptionContext {
    sentinel: Frame,
    frames: Vec<Frame>,
    state: UnwindState,
    in_flight: Option<Termination>,
    next_key: u64,
}

impl ExceptionContext {
    fn new() -> Self {
        Self {
            sentinel: Frame::new(UnwindState::Normal, None),
            frames: Vec::new(),
            state: UnwindState::Normal,
            in_flight: None,
            next_key: 0,
        }
    }

    fn innermost(&mut self) -> &mut Frame {
        match self.frames.last_mut() {
            Some(frame) => frame,
            None => &mut self.sentinel,
        }
    }

    fn frame(&mut self, depth: usize) -> &mut Frame {
        match depth.checked_sub(1) {
            Some(index) => &mut self.frames[index],
            None => &mut self.sentinel,
        }
    }

    /// Ends the unwind of an exception thrown before the catching region was
    /// entered: its target frame is cleared and the state saved there comes
    /// back.
    fn settle_outer_target(&mut self) {
        let target = self
            .frames
            .iter_mut()
            .rev()
            .chain(std::iter::once(&mut self.sentinel))
            .find(|frame| frame.target);
        let (state, in_flight) = match target {
            Some(frame) => {
                frame.target = false;
                (frame.entered, frame.saved.clone())
            }
            None => (UnwindState::Normal, None),
        };
        self.state = state;
        self.in_flight = in_flight;
    }
}

thread_local! {
    static CONTEXT: RefCell<ExceptionContext> = RefCell::new(ExceptionContext::new());
}

/// First step of a throw.
pub(crate) enum Unwind {
    /// Thrown while unwinding, outside any region entered since: fatal.
    Nested,
    /// Entries of the innermost frame, to release outside the context borrow.
    Walk {
        entries: Vec<Entry>,
        at_sentinel: bool,
    },
}

/// Marks the innermost frame as catch target and hands back its entries.
pub(crate) fn begin_unwind(report: Termination) -> Unwind {
    CONTEXT.with(|cx| {
        let mut cx = cx.borrow_mut();
        let at_sentinel = cx.frames.is_empty();
        if cx.state == UnwindState::Unwinding && cx.innermost().entered == UnwindState::Normal {
            return Unwind::Nested;
        }

        cx.state = UnwindState::Unwinding;
        cx.in_flight = Some(report);
        let frame = cx.innermost();
        frame.target = true;
        Unwind::Walk {
            entries: std::mem::take(&mut frame.entries),
            at_sentinel,
        }
    })
}

/// Runs protection entries, most recently registered first.
pub(crate) fn release_entries(entries: Vec<Entry>) {
    if !entries.is_empty() {
        trace!("unwinding {} protection entries", entries.len());
    }
    for entry in entries.into_iter().rev() {
        entry.cleanup.unwind();
    }
}

/// Current unwind state of this thread.
#[must_use]
pub fn unwind_state() -> UnwindState {
    CONTEXT.with(|cx| cx.borrow().state)
}

/// Number of active protected regions on this thread.
#[must_use]
pub fn protection_depth() -> usize {
    CONTEXT.with(|cx| cx.borrow().frames.len())
}

fn push_entry(depth: usize, cleanup: Box<dyn Cleanup>) -> EntryKey {
    CONTEXT.with(|cx| {
        let mut cx = cx.borrow_mut();
        cx.next_key += 1;
        let key = cx.next_key;
        cx.frame(depth).entries.push(Entry { key, cleanup });
        EntryKey { depth, key }
    })
}

/// Withdraws an entry without running it. `None` once the entry was released
/// by a throw or discarded with its region.
fn remove_entry(at: EntryKey) -> Option<Box<dyn Cleanup>> {
    CONTEXT
        .try_with(|cx| {
            let mut cx = cx.try_borrow_mut().ok()?;
            if at.depth > cx.frames.len() {
                return None;
            }
            let entries = &mut cx.frame(at.depth).entries;
            let index = entries.iter().rposition(|entry| entry.key == at.key)?;
            Some(entries.remove(index).cleanup)
        })
        .ok()
        .flatten()
}

fn fatal_order(innermost: usize, leaving: usize, location: Location) -> ! {
    terminate(&Termination::fatal(
        Error::RegionOrder { innermost, leaving },
        location,
    ))
}

/// What leaving a frame requires once the context borrow is released.
enum Exit {
    Normal(Vec<Frame>),
    Propagate {
        frame: Frame,
        entries: Vec<Entry>,
        at_sentinel: bool,
        report: Option<Termination>,
    },
    OutOfOrder(usize),
}

/// A protected region.
///
/// Entering pushes a frame on the current thread's protection stack; the
/// frame is popped when the region is left, caught from or dropped. Regions
/// must be left in reverse order of entry.
pub struct Region {
    depth: usize,
    location: Location,
    _not_send: PhantomData<*const ()>,
}

impl Region {
    /// Enters a new innermost region.
    #[track_caller]
    #[must_use]
    pub fn enter() -> Region {
        let location = Location::caller();
        let depth = CONTEXT.with(|cx| {
            let mut cx = cx.borrow_mut();
            let frame = Frame::new(cx.state, cx.in_flight.clone());
            cx.frames.push(frame);
            cx.frames.len()
        });
        trace!("entered protected region {} at {}", depth, location);
        Region {
            depth,
            location,
            _not_send: PhantomData,
        }
    }

    /// Nesting depth of this region (1 for the outermost).
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Protects an object: it is released if an exception passes this region
    /// while it is still in the returned slot.
    pub fn protect(&self, object: impl Into<Option<Object>>) -> Protected {
        protect_at(self.depth, object.into())
    }

    /// Protects a value with a finalizer run if an exception passes this
    /// region while the value is still in the returned slot.
    pub fn protect_with<T, F>(&self, value: T, finalizer: F) -> Guarded<T>
    where
        T: 'static,
        F: FnOnce(T) + 'static,
    {
        protect_with_at(self.depth, value, finalizer)
    }

    /// Registers a custom cleanup on this region. It stays registered until
    /// the region is left or an exception passes it.
    pub fn protect_entry(&self, entry: Box<dyn Cleanup>) {
        push_entry(self.depth, entry);
    }

    /// Leaves the region. If an exception targets it, the exception moves on
    /// to the enclosing region.
    pub fn leave(self) {
        drop(self);
    }

    /// Takes `thrown` as caught by this region and leaves the region.
    ///
    /// The thread's unwind state returns to what it was when the region was
    /// entered. An exception thrown before this region was entered is taken
    /// from the outer region it targets, and the thread returns to the state
    /// that region was entered in.
    pub fn catch(self, thrown: Thrown) -> Caught {
        let payload = thrown.disarm();
        let depth = self.depth;
        let location = self.location;
        std::mem::forget(self);

        let popped = CONTEXT.with(|cx| {
            let mut cx = cx.borrow_mut();
            if cx.frames.len() != depth {
                return Err(cx.frames.len());
            }
            let frame = cx.frames.pop();
            if let Some(frame) = &frame {
                if frame.target || frame.entered == UnwindState::Normal {
                    cx.state = frame.entered;
                    cx.in_flight = frame.saved.clone();
                } else {
                    cx.settle_outer_target();
                }
            }
            Ok(frame)
        });

        match popped {
            Ok(frame) => {
                trace!("region {} caught exception", depth);
                drop(frame);
            }
            Err(innermost) => fatal_order(innermost, depth, location),
        }
        Caught::new(payload)
    }

    fn exit(&self) -> Exit {
        let panicking = std::thread::panicking();
        CONTEXT.with(|cx| {
            let mut cx = cx.borrow_mut();
            if cx.frames.len() != self.depth {
                if panicking {
                    let keep = self.depth.saturating_sub(1).min(cx.frames.len());
                    return Exit::Normal(cx.frames.split_off(keep));
                }
                return Exit::OutOfOrder(cx.frames.len());
            }

            let Some(frame) = cx.frames.pop() else {
                return Exit::OutOfOrder(0);
            };
            if !frame.target || panicking {
                return Exit::Normal(vec![frame]);
            }

            let at_sentinel = cx.frames.is_empty();
            let report = cx.in_flight.clone();
            let next = cx.innermost();
            next.target = true;
            Exit::Propagate {
                frame,
                entries: std::mem::take(&mut next.entries),
                at_sentinel,
                report,
            }
        })
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        match self.exit() {
            Exit::Normal(frames) => {
                trace!("left protected region {}", self.depth);
                drop(frames);
            }
            Exit::Propagate {
                frame,
                entries,
                at_sentinel,
                report,
            } => {
                trace!("exception passes region {}", self.depth);
                drop(frame);
                release_entries(entries);
                if at_sentinel {
                    if let Some(report) = report {
                        terminate(&report);
                    }
                }
            }
            Exit::OutOfOrder(innermost) => fatal_order(innermost, self.depth, self.location),
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("depth", &self.depth)
            .field("location", &self.location)
            .finish()
    }
}

/// Runs `body` inside a new protected region and catches what it throws.
///
/// # Errors
///
/// Returns the caught exception when `body` throws.
#[track_caller]
pub fn try_protected<T>(body: impl FnOnce(&Region) -> Throws<T>) -> Result<T, Caught> {
    let region = Region::enter();
    match body(&region) {
        Ok(value) => {
            region.leave();
            Ok(value)
        }
        Err(thrown) => Err(region.catch(thrown)),
    }
}

// ============================================================================
// Protection Entries
// ============================================================================

type ObjectSlot = Rc<RefCell<Option<Object>>>;

struct ObjectEntry {
    slot: ObjectSlot,
}

impl Cleanup for ObjectEntry {
    fn describe(&self) -> Option<String> {
        self.slot
            .borrow()
            .as_ref()
            .map(|object| object.class_name().to_string())
    }

    fn unwind(self: Box<Self>) {
        let object = self.slot.borrow_mut().take();
        drop(object);
    }
}

/// Slot of an object protected by a region.
///
/// The object stays in the slot (owned by the caller) until it is taken out
/// or an exception passes the region, which releases it. Dropping the slot
/// withdraws the protection and releases the object.
pub struct Protected {
    slot: ObjectSlot,
    entry: Cell<Option<EntryKey>>,
}

impl Protected {
    /// Returns a new reference to the protected object, if still present.
    #[must_use]
    pub fn get(&self) -> Option<Object> {
        self.slot.borrow().clone()
    }

    /// Takes the object out of protection and withdraws the entry.
    #[must_use]
    pub fn take(&self) -> Option<Object> {
        let object = self.slot.borrow_mut().take();
        withdraw(&self.entry);
        object
    }

    /// Returns true when the slot is empty.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        self.slot.borrow().is_none()
    }
}

impl Drop for Protected {
    fn drop(&mut self) {
        withdraw(&self.entry);
    }
}

impl fmt::Debug for Protected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Protected").field(&self.slot.borrow()).finish()
    }
}

struct FinalizerEntry<T, F> {
    slot: Rc<RefCell<Option<T>>>,
    finalizer: F,
}

impl<T, F> Cleanup for FinalizerEntry<T, F>
where
    F: FnOnce(T),
{
    fn describe(&self) -> Option<String> {
        self.slot.borrow().as_ref().map(|_| {
            let name = std::any::type_name::<T>();
            name.rsplit("::").next().unwrap_or(name).to_string()
        })
    }

    fn unwind(self: Box<Self>) {
        let value = self.slot.borrow_mut().take();
        if let Some(value) = value {
            (self.finalizer)(value);
        }
    }
}

/// Slot of a value protected by a region with a finalizer.
///
/// Dropping the slot withdraws the protection and drops the value without
/// running the finalizer.
pub struct Guarded<T> {
    slot: Rc<RefCell<Option<T>>>,
    entry: Cell<Option<EntryKey>>,
}

impl<T> Guarded<T> {
    /// Takes the value out of protection; the finalizer will not run.
    #[must_use]
    pub fn take(&self) -> Option<T> {
        let value = self.slot.borrow_mut().take();
        withdraw(&self.entry);
        value
    }

    /// Returns true once the value was taken or finalized.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.slot.borrow().is_none()
    }
}

impl<T> Drop for Guarded<T> {
    fn drop(&mut self) {
        withdraw(&self.entry);
    }
}

impl<T: Clone> Guarded<T> {
    /// Returns a copy of the value, if still present.
    #[must_use]
    pub fn get(&self) -> Option<T> {
        self.slot.borrow().clone()
    }
}

fn withdraw(entry: &Cell<Option<EntryKey>>) {
    if let Some(at) = entry.take() {
        drop(remove_entry(at));
    }
}

fn protect_at(depth: usize, object: Option<Object>) -> Protected {
    let slot = Rc::new(RefCell::new(object));
    let entry = push_entry(
        depth,
        Box::new(ObjectEntry {
            slot: Rc::clone(&slot),
        }),
    );
    Protected {
        slot,
        entry: Cell::new(Some(entry)),
    }
}

fn protect_with_at<T, F>(depth: usize, value: T, finalizer: F) -> Guarded<T>
where
    T: 'static,
    F: FnOnce(T) + 'static,
{
    let slot = Rc::new(RefCell::new(Some(value)));
    let entry = push_entry(
        depth,
        Box::new(FinalizerEntry {
            slot: Rc::clone(&slot),
            finalizer,
        }),
    );
    Guarded {
        slot,
        entry: Cell::new(Some(entry)),
    }
}

/// Protects an object on the innermost region of this thread (the sentinel
/// frame when none is active).
pub fn protect(object: impl Into<Option<Object>>) -> Protected {
    protect_at(protection_depth(), object.into())
}

/// Protects a value with a finalizer on the innermost region of this thread.
pub fn protect_with<T, F>(value: T, finalizer: F) -> Guarded<T>
where
    T: 'static,
    F: FnOnce(T) + 'static,
{
    protect_with_at(protection_depth(), value, finalizer)
}

// ============================================================================
// Diagnostics
// ============================================================================

/// Describes every live protection entry of this thread, innermost first.
/// `None` marks an entry whose value is gone.
#[must_use]
pub fn protection_stack() -> Vec<Option<String>> {
    CONTEXT.with(|cx| {
        let cx = cx.borrow();
        cx.frames
            .iter()
            .rev()
            .chain(std::iter::once(&cx.sentinel))
            .flat_map(|frame| frame.entries.iter().rev())
            .map(|entry| entry.cleanup.describe())
            .collect()
    })
}

/// Writes the protection stack, innermost entry first, one line per entry.
///
/// # Errors
///
/// Returns any error from `out`.
pub fn show_protection_stack(out: &mut dyn Write) -> io::Result<()> {
    for (index, entry) in protection_stack().iter().enumerate() {
        writeln!(
            out,
            "prt[{index:4}] = {:<25}",
            entry.as_deref().unwrap_or("absent")
        )?;
    }
    Ok(())
}
