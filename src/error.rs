//! Error types for the PLF extraction pipeline.
//!
//! This module defines the [`Error`] enum which represents all possible
//! failures that can occur while scanning, decompressing, and cross-linking
//! a `.plf` container. Per-record failures (a malformed XML fragment, an
//! unparseable address token, ...) are caught and logged at the point of
//! use by the owning pass; they never propagate out of that pass as an
//! `Err`. Only opening or reading the input file is allowed to propagate
//! all the way to the top-level caller.

use std::fmt;

/// Errors that can occur during `.plf` extraction.
///
/// This enum covers the failure kinds named by the extractor's design: one
/// variant per pass-level failure mode, plus the I/O failure that is the
/// only kind allowed to abort the whole run.
#[derive(Debug)]
pub enum Error {
    /// A byte range a pass needed to read fell outside the input buffer.
    TooShortBuffer {
        /// Number of bytes actually available.
        actual: usize,
        /// Minimum offset the pass needed to read.
        expected: usize,
    },

    /// A zlib stream at a candidate `0x78 0x5E` marker failed to inflate.
    MalformedZlibStream {
        /// Offset of the marker that produced this stream.
        byte_offset: usize,
    },

    /// A decompressed or raw-scanned fragment did not parse as well-formed XML.
    MalformedXmlFragment {
        /// Offset of the fragment that failed to parse.
        byte_offset: usize,
        /// Short diagnostic from the XML parser.
        reason: String,
    },

    /// A length-prefixed field pointed outside the buffer.
    TokenizationMismatch {
        /// Offset of the length prefix.
        byte_offset: usize,
        /// Which field was being decoded.
        context: &'static str,
    },

    /// A `%DB` or `PLUSBLOCK` token's numeric suffix could not be parsed.
    UnparseableAddress {
        /// Offset of the token.
        byte_offset: usize,
        /// The token text that failed to parse.
        token: String,
    },

    /// No block kind (`UDT`/`FB`/`FC`/`OB`/`DB`) could be inferred for a record.
    UnclassifiedBlock {
        /// Offset of the record.
        byte_offset: usize,
    },

    /// An element had no XML, raw-block, or reference-block link.
    UnmatchedElement {
        /// The element's id (GUID, or `scope:GUID` for members).
        id: String,
    },

    /// A `ReferenceBlock` instance's `OD/TD/T` was not `BlockType:BlockID:Name`.
    FormatViolation {
        /// Offset of the offending record.
        byte_offset: usize,
        /// Name of the malformed field.
        field: &'static str,
    },

    /// A bounded regex scan did not finish within its time budget.
    RegexTimeout {
        /// Name of the pass that started the scan.
        pass: &'static str,
    },

    /// Opening or reading the input file failed.
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::TooShortBuffer { actual, expected } => write!(
                f,
                "buffer too small: need at least {expected} bytes, got {actual}"
            ),
            Error::MalformedZlibStream { byte_offset } => {
                write!(f, "malformed zlib stream at offset {byte_offset:#x}")
            }
            Error::MalformedXmlFragment { byte_offset, reason } => write!(
                f,
                "malformed XML fragment at offset {byte_offset:#x}: {reason}"
            ),
            Error::TokenizationMismatch { byte_offset, context } => write!(
                f,
                "length-prefixed field at offset {byte_offset:#x} points outside the buffer ({context})"
            ),
            Error::UnparseableAddress { byte_offset, token } => write!(
                f,
                "unparseable address token {token:?} at offset {byte_offset:#x}"
            ),
            Error::UnclassifiedBlock { byte_offset } => {
                write!(f, "could not classify block kind at offset {byte_offset:#x}")
            }
            Error::UnmatchedElement { id } => {
                write!(f, "element {id:?} has no raw, reference, or XML link")
            }
            Error::FormatViolation { byte_offset, field } => write!(
                f,
                "reference-block record at offset {byte_offset:#x} has malformed {field}"
            ),
            Error::RegexTimeout { pass } => {
                write!(f, "regex scan in {pass} exceeded its time budget")
            }
            Error::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

/// A specialized `Result` type for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;
