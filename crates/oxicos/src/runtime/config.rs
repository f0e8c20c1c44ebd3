//! Runtime configuration.
//!
//! A [`Config`] is handed to [`RegistryBuilder::with_config`] and frozen
//! together with the registry; it cannot change once dispatch has started.
//!
//! [`RegistryBuilder::with_config`]: crate::runtime::RegistryBuilder::with_config

use std::fmt;
use std::str::FromStr;

/// Environment variable selecting the precedence policy.
pub const PRECEDENCE_ENV: &str = "OXICOS_PRECEDENCE";

/// Environment variable overriding the forwarding depth limit.
pub const FORWARD_DEPTH_ENV: &str = "OXICOS_MAX_FORWARD_DEPTH";

/// Default bound on nested forwarding before a loop is reported.
pub const DEFAULT_MAX_FORWARD_DEPTH: u32 = 32;

/// How the specificity of two applicable methods is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precedence {
    /// Ancestry distances compared left to right; the first argument that
    /// differs decides. Always a total order.
    #[default]
    LeftToRight,
    /// A method is more specific only if it is at least as specific on every
    /// argument. Incomparable methods tie and make the call ambiguous.
    Symmetric,
}

impl Precedence {
    /// Name accepted by [`FromStr`] and printed by `Display`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Precedence::LeftToRight => "left-to-right",
            Precedence::Symmetric => "symmetric",
        }
    }
}

impl fmt::Display for Precedence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Precedence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left-to-right" | "lexicographic" => Ok(Precedence::LeftToRight),
            "symmetric" => Ok(Precedence::Symmetric),
            other => Err(format!("Invalid precedence policy: {other}")),
        }
    }
}

/// Runtime-wide settings.
///
/// # Example
///
/// ```rust
/// use oxicos::runtime::{Config, Precedence};
///
/// let config = Config::default()
///     .precedence(Precedence::Symmetric)
///     .max_forward_depth(8);
///
/// assert_eq!(config.precedence, Precedence::Symmetric);
/// assert!(config.check_ambiguity);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Specificity policy used by dispatch and by the freeze-time check.
    pub precedence: Precedence,
    /// Maximum nesting of `Call::forward` per thread.
    pub max_forward_depth: u32,
    /// Reject method sets that can tie when the registry is frozen.
    pub check_ambiguity: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            precedence: Precedence::LeftToRight,
            max_forward_depth: DEFAULT_MAX_FORWARD_DEPTH,
            check_ambiguity: true,
        }
    }
}

impl Config {
    /// Default configuration overridden by `OXICOS_PRECEDENCE` and
    /// `OXICOS_MAX_FORWARD_DEPTH` when set. Unparsable values are logged and
    /// ignored.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(value) = std::env::var(PRECEDENCE_ENV) {
            match value.parse() {
                Ok(precedence) => config.precedence = precedence,
                Err(err) => oxicos_log::warn!("{PRECEDENCE_ENV}: {err}"),
            }
        }

        if let Ok(value) = std::env::var(FORWARD_DEPTH_ENV) {
            match value.trim().parse::<u32>() {
                Ok(depth) if depth > 0 => config.max_forward_depth = depth,
                _ => oxicos_log::warn!("{FORWARD_DEPTH_ENV}: ignoring '{value}'"),
            }
        }

        config
    }

    /// Sets the precedence policy.
    #[must_use]
    pub fn precedence(mut self, precedence: Precedence) -> Self {
        self.precedence = precedence;
        self
    }

    /// Sets the forwarding depth limit (at least 1).
    #[must_use]
    pub fn max_forward_depth(mut self, depth: u32) -> Self {
        self.max_forward_depth = depth.max(1);
        self
    }

    /// Enables or disables the freeze-time ambiguity check.
    #[must_use]
    pub fn check_ambiguity(mut self, check: bool) -> Self {
        self.check_ambiguity = check;
        self
    }
}
