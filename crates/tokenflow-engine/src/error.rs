use std::fmt;

/// Result type for tokenflow-engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the engine layer
#[derive(Debug)]
pub enum Error {
    /// Scenario failed structural validation
    Validation(Vec<crate::diagnostics::ValidationIssue>),

    /// Formula could not be parsed
    FormulaParse { formula: String, message: String },

    /// Formula parsed but failed at evaluation time
    FormulaEval { formula: String, message: String },

    /// A referenced node, input or output does not exist
    UnknownReference(String),

    /// Operation not valid for the kernel's current state
    InvalidOperation(String),

    /// Types-layer error
    Types(tokenflow_types::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Validation(issues) => {
                write!(f, "Scenario validation failed with {} issue(s)", issues.len())
            }
            Error::FormulaParse { formula, message } => {
                write!(f, "Formula parse error in `{}`: {}", formula, message)
            }
            Error::FormulaEval { formula, message } => {
                write!(f, "Formula evaluation error in `{}`: {}", formula, message)
            }
            Error::UnknownReference(what) => write!(f, "Unknown reference: {}", what),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            Error::Types(err) => write!(f, "Types error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Types(err) => Some(err),
            _ => None,
        }
    }
}

impl From<tokenflow_types::Error> for Error {
    fn from(err: tokenflow_types::Error) -> Self {
        Error::Types(err)
    }
}
