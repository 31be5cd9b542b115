//! Error taxonomy for the patch pipeline.
//!
//! Every patch step validates its preconditions and fails fast with a
//! specific error kind. No step attempts best-effort recovery: a corrupt
//! output binary is worse than a refused build.

use thiserror::Error;

/// Errors produced by parsing, patching and assembly.
#[derive(Debug, Error)]
pub enum Error {
    /// Header or section-table inconsistency found while reading an
    /// executable. The build aborts; no partial output is written.
    #[error("malformed image: {0}")]
    MalformedImage(String),

    /// No fingerprint in the variant table matched the input binary.
    /// The selector is named so the table can be extended.
    #[error("no known variant fingerprint matches {selector}")]
    UnknownVariant { selector: String },

    /// The code-pattern patcher found no occurrence of the recipe's pattern.
    #[error("code pattern not found: {pattern}")]
    PatternNotFound { pattern: String },

    /// The code-pattern patcher found more than one occurrence. Patching
    /// any of them would risk corrupting the binary.
    #[error("code pattern matched {count} times (expected exactly one): {pattern}")]
    PatternAmbiguous { pattern: String, count: usize },

    /// Replacement resource data exceeds the rewritable space and the
    /// size-changing fallback path is not applicable.
    #[error("{resource} replacement needs {need} bytes but only {have} are rewritable")]
    ResourceOverflow {
        resource: &'static str,
        need: usize,
        have: usize,
    },

    /// A signature-bearing region is present but in an unrecognized
    /// sub-format, so it cannot be safely neutralized.
    #[error("cannot strip code signature: {0}")]
    SignatureStripFailure(String),

    /// The caller's title exceeds the code blob's buffer and the recipe's
    /// policy is to reject rather than truncate.
    #[error("title is {len} bytes but the patch slot holds at most {max}")]
    TitleTooLong { len: usize, max: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for [`Error::MalformedImage`] from any displayable cause.
    pub(crate) fn malformed(msg: impl std::fmt::Display) -> Self {
        Error::MalformedImage(msg.to_string())
    }
}
