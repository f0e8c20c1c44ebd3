//! A minimal, zero-dependency logging crate for the `OxiCOS` runtime.
//!
//! Messages go to standard error, prefixed with a colored level tag and the
//! module path of the call site. The minimum level is global and atomic, so
//! any thread may change it.
//!
//! # Example
//!
//! ```
//! use oxicos_log::{debug, error, info, warn, Level};
//!
//! oxicos_log::set_level(Level::Debug);
//!
//! let classes = 7;
//! info!("registry frozen with {} classes", classes);
//! debug!("candidates: {:?}", vec![1, 2, 3]);
//! warn!("object resurrected during deinit");
//! error!("deinit raised an exception");
//! ```

use std::fmt::{self, Arguments};
use std::io::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

/// Environment variable read by [`init_from_env`] when no name is given.
pub const DEFAULT_ENV_VAR: &str = "OXICOS_LOG";

/// Severity of a log message, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// Failures the runtime cannot recover from locally.
    Error = 0,
    /// Suspicious situations (resurrected objects, discarded exceptions).
    Warn = 1,
    /// Coarse lifecycle events.
    Info = 2,
    /// Registration and freeze details.
    Debug = 3,
    /// Per-dispatch and per-unwind tracing.
    Trace = 4,
}

impl Level {
    const ALL: [Level; 5] = [
        Level::Error,
        Level::Warn,
        Level::Info,
        Level::Debug,
        Level::Trace,
    ];

    const fn color_code(self) -> &'static str {
        match self {
            Level::Error => "\x1b[31m",
            Level::Warn => "\x1b[33m",
            Level::Info => "\x1b[32m",
            Level::Debug => "\x1b[36m",
            Level::Trace => "\x1b[35m",
        }
    }

    /// Returns the upper-case tag printed for this level.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    fn from_u8(raw: u8) -> Level {
        Level::ALL
            .get(usize::from(raw))
            .copied()
            .unwrap_or(Level::Info)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a level name cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLevelError {
    input: String,
}

impl fmt::Display for ParseLevelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid log level: {}", self.input)
    }
}

impl std::error::Error for ParseLevelError {}

impl FromStr for Level {
    type Err = ParseLevelError;

    /// Parses a level name, ignoring case.
    ///
    /// ```
    /// use oxicos_log::Level;
    ///
    /// assert_eq!("trace".parse::<Level>(), Ok(Level::Trace));
    /// assert!("loud".parse::<Level>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Level::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseLevelError {
                input: s.to_string(),
            })
    }
}

/// Global minimum level. Defaults to `Warn` so that a runtime embedded in a
/// host program stays quiet unless asked otherwise.
static LEVEL: AtomicU8 = AtomicU8::new(Level::Warn as u8);

/// Sets the minimum level; messages below it are discarded.
pub fn set_level(level: Level) {
    LEVEL.store(level as u8, Ordering::SeqCst);
}

/// Returns the current minimum level.
#[must_use]
pub fn level() -> Level {
    Level::from_u8(LEVEL.load(Ordering::Relaxed))
}

/// Returns true if a message at `level` would be emitted.
#[must_use]
pub fn enabled(level: Level) -> bool {
    level as u8 <= LEVEL.load(Ordering::Relaxed)
}

/// Sets the minimum level from a string such as `"debug"`.
///
/// # Errors
///
/// Returns [`ParseLevelError`] if `s` names no level; the level is unchanged.
pub fn set_level_from_str(s: &str) -> Result<(), ParseLevelError> {
    set_level(s.parse()?);
    Ok(())
}

/// Reads the minimum level from the environment variable `var`
/// ([`DEFAULT_ENV_VAR`] when `None`).
///
/// Returns the level now in effect. An unset variable leaves the level
/// untouched; an unparsable one is reported once on stderr and ignored.
pub fn init_from_env(var: Option<&str>) -> Level {
    let var = var.unwrap_or(DEFAULT_ENV_VAR);
    if let Ok(value) = std::env::var(var) {
        if let Err(err) = set_level_from_str(&value) {
            __emit("WARN", Level::Warn.color_code(), module_path!(), format_args!("{var}: {err}"));
        }
    }
    level()
}

#[doc(hidden)]
pub fn __emit(tag: &str, color: &str, target: &str, args: Arguments) {
    const RESET: &str = "\x1b[0m";

    // A closed stderr must not turn a diagnostic into a panic.
    let mut err = std::io::stderr().lock();
    let _ = writeln!(err, "{color}[{tag}]{RESET} {target}: {args}");
}

/// Emits a message after the level check; called by the macros.
#[doc(hidden)]
pub fn __log_with_target(level: Level, target: &str, args: Arguments) {
    if enabled(level) {
        __emit(level.as_str(), level.color_code(), target, args);
    }
}

/// Emits a message regardless of the configured level.
#[doc(hidden)]
pub fn __fatal_with_target(target: &str, args: Arguments) {
    __emit("FATAL", "\x1b[1;31m", target, args);
}

/// Logs at an explicit level.
///
/// ```
/// use oxicos_log::{log, Level};
///
/// log!(level: Level::Info, "sent {} messages", 42);
/// ```
#[macro_export]
macro_rules! log {
    (level: $level:expr, $($arg:tt)*) => {{
        let level = $level;
        if $crate::enabled(level) {
            $crate::__log_with_target(level, module_path!(), format_args!($($arg)*));
        }
    }};
}

/// Logs at the Error level.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => { $crate::log!(level: $crate::Level::Error, $($arg)*) };
}

/// Logs at the Warn level.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => { $crate::log!(level: $crate::Level::Warn, $($arg)*) };
}

/// Logs at the Info level.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => { $crate::log!(level: $crate::Level::Info, $($arg)*) };
}

/// Logs at the Debug level.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => { $crate::log!(level: $crate::Level::Debug, $($arg)*) };
}

/// Logs at the Trace level.
///
/// ```
/// use oxicos_log::trace;
///
/// # let generic = "area";
/// trace!("dispatching {}", generic);
/// ```
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => { $crate::log!(level: $crate::Level::Trace, $($arg)*) };
}

/// Emits a diagnostic that is never filtered, for process-terminating paths.
///
/// ```
/// use oxicos_log::fatal;
///
/// fatal!("uncaught exception {}", "ExBadAlloc");
/// ```
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::__fatal_with_target(module_path!(), format_args!($($arg)*))
    };
}
