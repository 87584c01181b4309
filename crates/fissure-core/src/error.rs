//! Error types for the fissure-core library.
//!
//! Cracking produces two structural error kinds, [`Error::CrackingFailure`]
//! and [`Error::InsufficientData`]. Both name the offending element and the
//! absolute bit position at failure time. The remaining variants cover the
//! model and the collaborators the cracker drives (transforms, constraint
//! evaluators, analyzers, stream sources).

use thiserror::Error;

/// Result type alias for fissure operations
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error type for all fissure operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The data does not fit the model
    #[error("failed to crack '{element}' at bit {position}: {message}")]
    CrackingFailure {
        /// Fully-qualified name of the element being cracked
        element: String,
        /// Absolute bit position when the failure occurred
        position: u64,
        /// Description of the mismatch
        message: String,
        /// Set once the failure has been reported in the log
        logged: bool,
    },

    /// The stream cannot grow enough to satisfy a length or offset
    #[error("not enough data to crack '{element}' at bit {position}: need {needed} bits, have {available}")]
    InsufficientData {
        /// Fully-qualified name of the element being cracked
        element: String,
        /// Absolute bit position when the failure occurred
        position: u64,
        /// Bits required, counted from the start of the current stream
        needed: u64,
        /// Bits available in the current stream
        available: u64,
        /// Set once the failure has been reported in the log
        logged: bool,
    },

    /// The model description is inconsistent
    #[error("invalid model: {0}")]
    InvalidModel(String),

    /// Two siblings would share a name
    #[error("duplicate child name '{name}' in '{parent}'")]
    DuplicateName {
        /// Fully-qualified name of the container
        parent: String,
        /// The clashing child name
        name: String,
    },

    /// A name reference could not be resolved in the tree
    #[error("unable to resolve '{name}' from '{from}'")]
    UnresolvedReference {
        /// Element the lookup started from
        from: String,
        /// The name that failed to resolve
        name: String,
    },

    /// A transform rejected its input
    #[error("transform '{name}' failed: {details}")]
    Transform {
        /// Transform name
        name: String,
        /// What went wrong
        details: String,
    },

    /// A constraint expression could not be evaluated
    #[error("constraint '{expression}' could not be evaluated: {details}")]
    Constraint {
        /// The offending expression
        expression: String,
        /// What went wrong
        details: String,
    },

    /// An analyzer failed to restructure an element
    #[error("analyzer '{name}' failed on '{element}': {details}")]
    Analyzer {
        /// Analyzer name
        name: String,
        /// Fully-qualified name of the analyzed element
        element: String,
        /// What went wrong
        details: String,
    },

    /// The stream's backing reader failed
    #[error("failed to read stream source: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates a new cracking failure
    pub fn cracking_failure(
        element: impl Into<String>,
        position: u64,
        message: impl Into<String>,
    ) -> Self {
        Self::CrackingFailure {
            element: element.into(),
            position,
            message: message.into(),
            logged: false,
        }
    }

    /// Creates a new insufficient data error
    pub fn insufficient_data(
        element: impl Into<String>,
        position: u64,
        needed: u64,
        available: u64,
    ) -> Self {
        Self::InsufficientData {
            element: element.into(),
            position,
            needed,
            available,
            logged: false,
        }
    }

    /// Creates a new unresolved reference error
    pub fn unresolved_reference(from: impl Into<String>, name: impl Into<String>) -> Self {
        Self::UnresolvedReference {
            from: from.into(),
            name: name.into(),
        }
    }

    /// Creates a new transform error
    pub fn transform(name: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Transform {
            name: name.into(),
            details: details.into(),
        }
    }

    /// Creates a new constraint evaluation error
    pub fn constraint(expression: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Constraint {
            expression: expression.into(),
            details: details.into(),
        }
    }

    /// Creates a new analyzer error
    pub fn analyzer(
        name: impl Into<String>,
        element: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self::Analyzer {
            name: name.into(),
            element: element.into(),
            details: details.into(),
        }
    }

    /// Creates a new invalid model error
    pub fn invalid_model(msg: impl Into<String>) -> Self {
        Self::InvalidModel(msg.into())
    }

    /// Creates a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true for [`Error::CrackingFailure`]
    pub fn is_cracking_failure(&self) -> bool {
        matches!(self, Self::CrackingFailure { .. })
    }

    /// Returns true for [`Error::InsufficientData`]
    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, Self::InsufficientData { .. })
    }

    /// Returns true if a selector or array may try the next alternative
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::CrackingFailure { .. } | Self::InsufficientData { .. } | Self::Transform { .. }
        )
    }

    /// Marks a cracking error as logged, returning whether it already was
    pub fn mark_logged(&mut self) -> bool {
        match self {
            Self::CrackingFailure { logged, .. } | Self::InsufficientData { logged, .. } => {
                std::mem::replace(logged, true)
            }
            _ => false,
        }
    }
}
