//! Error types surfaced by configuration, parsing, and I/O.
//!
//! `work`/`configure` on [`crate::node::Node`] communicate end-of-stream and
//! soft failure with a plain `bool`, matching the pull-loop contract; `FlowError`
//! is reserved for errors that must be collected and reported rather than
//! silently turned into an early `eos`.

use std::fmt;

/// Errors that can be raised while assembling or reading back a network.
#[derive(thiserror::Error, Debug)]
pub enum FlowError {
    /// A node failed to configure: unknown filter, type mismatch, bad
    /// parameter, duplicate port, etc.
    #[error("node '{node}': {message}")]
    Configuration {
        /// Name of the node that raised the error.
        node: String,
        /// Human-readable description.
        message: String,
    },
    /// A filter name referenced by a network description has no registered
    /// factory.
    #[error("unknown filter '{name}'")]
    UnknownFilter {
        /// The unresolved filter name.
        name: String,
    },
    /// A datatype name has no registered factory/codec.
    #[error("unknown datatype '{name}'")]
    UnknownDatatype {
        /// The unresolved datatype name.
        name: String,
    },
    /// A registry received a second registration under the same name.
    #[error("duplicate {kind} registration: '{name}'")]
    DuplicateRegistration {
        /// `"filter"` or `"datatype"`.
        kind: &'static str,
        /// The name that was already registered.
        name: String,
    },
    /// Parameter-expression resolution failed (unknown port reference,
    /// malformed placeholder, etc.).
    #[error("parameter expression error: {0}")]
    ParamExpression(String),
    /// Underlying I/O failure from the archive backend or the network-file
    /// loader.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Underlying XML parse failure from the network or attribute reader.
    #[error(transparent)]
    Xml(#[from] quick_xml::Error),
}

/// Errors that abort the process outright: a violated structural invariant.
/// These are never returned to a caller expected to continue; they are
/// raised with [`abort_invariant`].
#[derive(Debug)]
pub struct InvariantViolation(pub String);

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invariant violation: {}", self.0)
    }
}

impl std::error::Error for InvariantViolation {}

/// Aborts the process with a structural-invariant message, matching the
/// reference implementation's `ensure`/`fatal` policy for conditions that
/// indicate a programming error rather than bad input (wrong-type packet on
/// a link, non-monotonic timestamps, an out-of-range port index).
#[macro_export]
macro_rules! abort_invariant {
    ($($arg:tt)*) => {{
        panic!("invariant violation: {}", format!($($arg)*));
    }};
}

/// A collector for configuration-time errors. Each component appends to it
/// during `configure`; the network inspects it once assembly is complete.
#[derive(Default, Debug)]
pub struct ErrorLog {
    errors: Vec<FlowError>,
}

impl ErrorLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an error.
    pub fn push(&mut self, error: FlowError) {
        self.errors.push(error);
    }

    /// True if any error has been recorded.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// All recorded errors, in the order they were pushed.
    pub fn errors(&self) -> &[FlowError] {
        &self.errors
    }

    /// Drains and returns all recorded errors.
    pub fn take(&mut self) -> Vec<FlowError> {
        std::mem::take(&mut self.errors)
    }
}
