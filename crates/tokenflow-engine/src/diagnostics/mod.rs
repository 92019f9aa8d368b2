// Structural diagnostics for scenarios, run before a kernel will accept one

mod validator;

pub use validator::{
    is_valid, validate, IssueCode, Severity, ValidationIssue, ValidatorOptions,
};
