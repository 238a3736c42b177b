//! Error types for expression decoding, validation and compilation.

use thiserror::Error;

/// Errors raised while decoding or compiling an expression, or while
/// validating filter inputs. Runtime evaluation of a compiled routine cannot
/// fail: the emitted code is total.
#[derive(Debug, Error)]
pub enum Error {
    /// Token not recognised, or a numeric literal that only partially parsed.
    #[error("{0}")]
    InvalidToken(String),

    /// Clip reference beyond the number of inputs.
    #[error("reference to undefined clip: {0}")]
    UndefinedClip(String),

    /// `name@` with no prior `name!` in program order.
    #[error("reference to uninitialized variable: {0}")]
    UninitializedVariable(String),

    /// An operation found fewer operands on the stack than its arity.
    #[error("insufficient values on stack: {0}")]
    StackUnderflow(String),

    /// More than one value left on the stack after evaluation.
    #[error("{count} unconsumed values on stack: {expr}")]
    StackUnconsumed { count: usize, expr: String },

    /// Empty expression where a value was required.
    #[error("empty expression: {0}")]
    EmptyExpression(String),

    /// Clips differ in geometry, or a sample format is unsupported, or the
    /// output format disagrees with the inputs.
    #[error("{0}")]
    FormatMismatch(String),

    /// Pixel access used where only frame properties are available.
    #[error("{0}")]
    PixelAccessNotAllowed(String),

    /// Property access names a property-source clip that was not supplied.
    #[error("{0}")]
    PropClipOutOfRange(String),

    /// The PropExpr dictionary callable failed or produced bad values.
    #[error("dict evaluation failed: {0}")]
    DictEvaluation(String),

    /// The code generator backend could not be configured or used.
    #[error("codegen backend error: {0}")]
    Backend(String),
}

impl Error {
    /// Interpreter-facing shorthand used by the stack checks.
    pub(crate) fn underflow(wanted: usize, have: usize) -> Error {
        Error::StackUnderflow(format!(
            "stack underflow, expecting {wanted} args, but only has {have} elements left on stack"
        ))
    }
}

/// An [`Error`] carrying the name of the filter whose construction failed.
///
/// The host surfaces `to_string()` of this directly, so the display form is
/// the user-visible message: `"Expr: <cause>"`.
#[derive(Debug, Error)]
#[error("{filter}: {source}")]
pub struct FilterError {
    pub filter: &'static str,
    #[source]
    pub source: Error,
}

impl FilterError {
    pub(crate) fn wrap(filter: &'static str) -> impl FnOnce(Error) -> FilterError {
        move |source| FilterError { filter, source }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
