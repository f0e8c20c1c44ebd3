//! Exceptions: throwing, catching and termination.
//!
//! Exceptions travel as the error half of [`Throws<T>`]. Throwing runs the
//! protection entries of the innermost protected region and marks that
//! region as the catch target; the [`Thrown`] value is then propagated with
//! `?` until a [`Region`](crate::runtime::Region) catches it, turning it into
//! a [`Caught`]. A `Thrown` dropped without being caught is uncaught and
//! calls the terminate handler.
//!
//! The exception itself is an ordinary object (or the nil marker), so
//! handlers select on it by class with [`Caught::is_kind_of`].
//!
//! # Example
//!
//! ```rust
//! use oxicos::runtime::{ClassId, RegistryBuilder, Throws, try_protected};
//! use oxicos::throw;
//!
//! let mut builder = RegistryBuilder::new();
//! let overflow = builder.define_class("Overflow", ClassId::EXCEPTION, 0).unwrap();
//! let runtime = builder.freeze().unwrap();
//!
//! fn check(level: i64, ex: oxicos::runtime::Object) -> Throws<i64> {
//!     if level > 10 {
//!         return Err(throw!(ex, "level {} too high", level));
//!     }
//!     Ok(level)
//! }
//!
//! let caught = try_protected(|_| {
//!     let ex = runtime.allocate(overflow, 0)?;
//!     check(11, ex)
//! })
//! .unwrap_err();
//!
//! assert!(caught.is_kind_of(ClassId::EXCEPTION));
//! assert_eq!(caught.class_name(), "Overflow");
//! assert_eq!(caught.reason(), Some("level 11 too high"));
//! ```

use crate::error::Error;
use crate::runtime::protect::{self, UnwindState};
use crate::runtime::registry::Runtime;
use crate::runtime::{ClassId, Object};
use oxicos_log::{debug, fatal, trace};
use std::fmt;
use std::sync::{PoisonError, RwLock};

/// Result of an operation that may throw.
pub type Throws<T> = std::result::Result<T, Thrown>;

/// Source location of a throw or a `send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    function: &'static str,
    file: &'static str,
    line: u32,
    column: u32,
}

impl Location {
    /// Creates a location. `function` may be empty when unknown.
    #[must_use]
    pub const fn new(function: &'static str, file: &'static str, line: u32, column: u32) -> Self {
        Self {
            function,
            file,
            line,
            column,
        }
    }

    /// Location of the caller of a `#[track_caller]` function.
    #[track_caller]
    #[must_use]
    pub fn caller() -> Self {
        let caller = std::panic::Location::caller();
        Self::new("", caller.file(), caller.line(), caller.column())
    }

    /// Enclosing function path, empty when unknown.
    #[must_use]
    pub fn function(&self) -> &'static str {
        self.function
    }

    #[must_use]
    pub fn file(&self) -> &'static str {
        self.file
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    #[must_use]
    pub fn column(&self) -> u32 {
        self.column
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.function.is_empty() {
            write!(f, "{}:{}:{}", self.file, self.line, self.column)
        } else {
            write!(f, "{} ({}:{}:{})", self.function, self.file, self.line, self.column)
        }
    }
}

/// Expands to the [`Location`] of the expansion site, including the path
/// of the enclosing function.
#[macro_export]
macro_rules! here {
    () => {
        $crate::runtime::Location::new(
            {
                fn f() {}
                let name = ::std::any::type_name_of_val(&f);
                name.strip_suffix("::f").unwrap_or(name)
            },
            file!(),
            line!(),
            column!(),
        )
    };
}

/// Throws an exception object (or `None` for the nil marker), optionally
/// with a formatted reason, recording the current location.
///
/// Evaluates to the [`Thrown`] value; return it as an error.
///
/// ```rust,ignore
/// return Err(throw!(exception));
/// return Err(throw!(None, "no exception object: {}", detail));
/// ```
#[macro_export]
macro_rules! throw {
    ($exception:expr) => {
        $crate::runtime::throw(
            ::std::convert::Into::<::std::option::Option<$crate::runtime::Object>>::into($exception),
            ::std::option::Option::None,
            $crate::here!(),
        )
    };
    ($exception:expr, $($reason:tt)+) => {
        $crate::runtime::throw(
            ::std::convert::Into::<::std::option::Option<$crate::runtime::Object>>::into($exception),
            ::std::option::Option::Some(::std::format!($($reason)+)),
            $crate::here!(),
        )
    };
}

/// Everything an exception carries while in flight.
pub(crate) struct Payload {
    exception: Option<Object>,
    reason: Option<String>,
    cause: Option<Error>,
    location: Location,
    #[cfg(feature = "throw_backtrace")]
    backtrace: backtrace::Backtrace,
}

impl Payload {
    fn new(
        exception: Option<Object>,
        reason: Option<String>,
        cause: Option<Error>,
        location: Location,
    ) -> Box<Self> {
        Box::new(Self {
            exception,
            reason,
            cause,
            location,
            #[cfg(feature = "throw_backtrace")]
            backtrace: backtrace::Backtrace::new_unresolved(),
        })
    }

    fn class_name(&self) -> &'static str {
        self.exception.as_ref().map_or("Nil", Object::class_name)
    }

    fn report(&self, mid_unwind: bool) -> Termination {
        Termination {
            class_name: Some(self.class_name()),
            reason: self.reason.clone(),
            cause: self.cause.clone(),
            location: self.location,
            mid_unwind,
            #[cfg(feature = "throw_backtrace")]
            backtrace: Some(self.backtrace.clone()),
        }
    }
}

/// An exception in flight.
///
/// Propagate it with `?` or hand it to
/// [`Region::catch`](crate::runtime::Region::catch). Dropping it anywhere
/// else treats the exception as uncaught and terminates the process.
#[must_use = "an exception in flight must be propagated or caught"]
pub struct Thrown {
    payload: Option<Box<Payload>>,
}

impl Thrown {
    fn payload(&self) -> &Payload {
        match &self.payload {
            Some(payload) => payload,
            None => unreachable!("Thrown payload taken before drop"),
        }
    }

    pub(crate) fn disarm(mut self) -> Box<Payload> {
        match self.payload.take() {
            Some(payload) => payload,
            None => unreachable!("Thrown payload taken before drop"),
        }
    }

    /// Class name of the exception (`"Nil"` for the nil marker).
    #[must_use]
    pub fn class_name(&self) -> &'static str {
        self.payload().class_name()
    }

    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.payload().reason.as_deref()
    }

    #[must_use]
    pub fn location(&self) -> Location {
        self.payload().location
    }
}

impl Drop for Thrown {
    fn drop(&mut self) {
        let Some(payload) = self.payload.take() else {
            return;
        };
        if std::thread::panicking() {
            return;
        }
        terminate(&payload.report(false));
    }
}

impl fmt::Debug for Thrown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thrown")
            .field("class", &self.class_name())
            .field("reason", &self.reason())
            .field("location", &self.location())
            .finish()
    }
}

/// An exception taken by a catching region.
///
/// Dropping it releases the exception object. [`rethrow`](Self::rethrow)
/// (or `?`, through `From<Caught> for Thrown`) sends it on to the next
/// enclosing region with its identity and location preserved.
pub struct Caught {
    payload: Box<Payload>,
}

impl Caught {
    pub(crate) fn new(payload: Box<Payload>) -> Self {
        Self { payload }
    }

    /// Returns the exception object, `None` for the nil marker.
    #[must_use]
    pub fn exception(&self) -> Option<&Object> {
        self.payload.exception.as_ref()
    }

    /// Takes the exception object, `None` for the nil marker.
    #[must_use]
    pub fn into_exception(self) -> Option<Object> {
        self.payload.exception
    }

    /// Class name of the exception (`"Nil"` for the nil marker).
    #[must_use]
    pub fn class_name(&self) -> &'static str {
        self.payload.class_name()
    }

    /// Returns true if the exception is an instance of `class` or of a
    /// subclass. The nil marker is of class `Nil`.
    #[must_use]
    pub fn is_kind_of(&self, class: ClassId) -> bool {
        match &self.payload.exception {
            Some(exception) => exception.is_kind_of(class),
            None => class == ClassId::NIL || class == ClassId::OBJECT,
        }
    }

    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.payload.reason.as_deref()
    }

    /// The runtime error behind an exception raised by the runtime itself.
    #[must_use]
    pub fn cause(&self) -> Option<&Error> {
        self.payload.cause.as_ref()
    }

    /// Where the exception was (last) thrown.
    #[must_use]
    pub fn location(&self) -> Location {
        self.payload.location
    }

    /// Stack captured at the throw site.
    #[cfg(feature = "throw_backtrace")]
    #[must_use]
    pub fn backtrace(&self) -> &backtrace::Backtrace {
        &self.payload.backtrace
    }

    /// Throws the same exception again from its original location.
    pub fn rethrow(self) -> Thrown {
        trace!("rethrowing {}", self.class_name());
        propagate(self.payload)
    }

    /// Throws the same exception again, recording `location` instead.
    pub fn rethrow_at(mut self, location: Location) -> Thrown {
        self.payload.location = location;
        propagate(self.payload)
    }
}

impl From<Caught> for Thrown {
    fn from(caught: Caught) -> Self {
        caught.rethrow()
    }
}

impl fmt::Debug for Caught {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Caught")
            .field("class", &self.class_name())
            .field("reason", &self.reason())
            .field("cause", &self.cause())
            .field("location", &self.location())
            .finish()
    }
}

impl fmt::Display for Caught {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.class_name())?;
        if let Some(reason) = self.reason() {
            write!(f, ": {reason}")?;
        }
        write!(f, " at {}", self.location())
    }
}

/// Throws `exception` (`None` for the nil marker) from `location`.
///
/// The protection entries of the innermost protected region are released
/// before this returns. With no region active the exception is uncaught and
/// the process terminates.
pub fn throw(exception: Option<Object>, reason: Option<String>, location: Location) -> Thrown {
    propagate(Payload::new(exception, reason, None, location))
}

/// Raises a runtime failure as an exception of the built-in class matching
/// `error`.
pub(crate) fn raise(runtime: &'static Runtime, error: Error, location: Location) -> Thrown {
    let class = error.exception_class();
    debug!("raising {}: {}", runtime.class_info(class).name, error);
    let exception = Object::alloc(runtime, class, 0, 0).ok();
    propagate(Payload::new(
        exception,
        Some(error.to_string()),
        Some(error),
        location,
    ))
}

fn propagate(payload: Box<Payload>) -> Thrown {
    let report = payload.report(false);
    trace!("throw {} at {}", report.class_name.unwrap_or("?"), report.location);

    match protect::begin_unwind(report) {
        protect::Unwind::Nested => {
            let mut report = payload.report(true);
            report.cause = Some(Error::ThrowDuringUnwind);
            terminate(&report)
        }
        protect::Unwind::Walk { entries, at_sentinel } => {
            protect::release_entries(entries);
            if at_sentinel {
                terminate(&payload.report(false));
            }
            Thrown {
                payload: Some(payload),
            }
        }
    }
}

/// Returns true while an exception is propagating on this thread.
#[must_use]
pub fn uncaught() -> bool {
    protect::unwind_state() == UnwindState::Unwinding
}

impl Error {
    /// Built-in exception class used when this error is raised at run time.
    pub(crate) fn exception_class(&self) -> ClassId {
        match self {
            Error::OutOfMemory { .. } | Error::RefCountOverflow => ClassId::EX_BAD_ALLOC,
            Error::IllegalClassChange { .. }
            | Error::UnknownClass { .. }
            | Error::PayloadOutOfBounds { .. }
            | Error::InstanceSizeTooSmall { .. }
            | Error::InheritanceCycle { .. }
            | Error::ClassAlreadyExists { .. } => ClassId::EX_BAD_CLASS,
            Error::AmbiguousDispatch { .. } | Error::AmbiguousMethods { .. } => {
                ClassId::EX_AMBIGUOUS
            }
            _ => ClassId::EX_BAD_MESSAGE,
        }
    }
}

// ============================================================================
// Termination
// ============================================================================

/// What the terminate handler is told about a fatal condition.
#[derive(Debug, Clone)]
pub struct Termination {
    class_name: Option<&'static str>,
    reason: Option<String>,
    cause: Option<Error>,
    location: Location,
    mid_unwind: bool,
    #[cfg(feature = "throw_backtrace")]
    backtrace: Option<backtrace::Backtrace>,
}

impl Termination {
    /// A control-integrity failure with no exception object.
    pub(crate) fn fatal(cause: Error, location: Location) -> Self {
        Self {
            class_name: None,
            reason: Some(cause.to_string()),
            cause: Some(cause),
            location,
            mid_unwind: true,
            #[cfg(feature = "throw_backtrace")]
            backtrace: Some(backtrace::Backtrace::new_unresolved()),
        }
    }

    /// Class of the uncaught exception; `None` for control-integrity
    /// failures.
    #[must_use]
    pub fn class_name(&self) -> Option<&'static str> {
        self.class_name
    }

    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    #[must_use]
    pub fn cause(&self) -> Option<&Error> {
        self.cause.as_ref()
    }

    #[must_use]
    pub fn location(&self) -> Location {
        self.location
    }

    /// True when the failure happened while already unwinding; the process
    /// then aborts instead of exiting.
    #[must_use]
    pub fn mid_unwind(&self) -> bool {
        self.mid_unwind
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class_name {
            Some(class) if self.mid_unwind => {
                write!(f, "exception {class} thrown during unwinding")?;
            }
            Some(class) => write!(f, "uncaught exception {class}")?,
            None => f.write_str("fatal runtime error")?,
        }
        if let Some(reason) = &self.reason {
            write!(f, ": {reason}")?;
        }
        write!(f, " at {}", self.location)
    }
}

/// Called with the description of a fatal condition before the process
/// ends. A handler may panic to unwind instead.
pub type TerminateHandler = fn(&Termination);

static TERMINATE_HANDLER: RwLock<TerminateHandler> = RwLock::new(default_terminate);

/// Installs `handler` and returns the previous one.
pub fn set_terminate(handler: TerminateHandler) -> TerminateHandler {
    let mut current = TERMINATE_HANDLER
        .write()
        .unwrap_or_else(PoisonError::into_inner);
    std::mem::replace(&mut *current, handler)
}

/// The initial terminate handler: prints the exception class, reason and
/// throw location (and the backtrace when captured) to stderr.
pub fn default_terminate(termination: &Termination) {
    fatal!("{}", termination);
    #[cfg(feature = "throw_backtrace")]
    if let Some(backtrace) = &termination.backtrace {
        let mut backtrace = backtrace.clone();
        backtrace.resolve();
        fatal!("backtrace:\n{:?}", backtrace);
    }
}

/// Runs the terminate handler, then aborts (nested failure) or exits with
/// failure status.
pub(crate) fn terminate(termination: &Termination) -> ! {
    let handler = *TERMINATE_HANDLER
        .read()
        .unwrap_or_else(PoisonError::into_inner);
    handler(termination);

    if termination.mid_unwind {
        std::process::abort()
    }
    std::process::exit(1)
}
