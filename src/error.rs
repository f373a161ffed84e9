//! Error taxonomy for the export core.
//!
//! Every fallible core operation returns `Result<T, ExportError>`. The
//! variants mirror the failure classes that matter operationally: a scheduler
//! pass records the first fatal error on the export row and stamps it
//! `Failed`, so the variant (and its message) is what the requestor
//! ultimately sees.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    /// Malformed queue row, record-set specification, or unknown processing
    /// step.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The operation is well-formed but not expressible: string keywords into
    /// FITS images, writes on a protocol without a writer, and the like.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A type narrowing lost precision or range.
    #[error("overflow converting {value} to {dest}")]
    Overflow { value: String, dest: &'static str },

    /// BZERO/BSCALE in a segment file disagrees with the catalog scaling.
    #[error("scaling conflict in {file}: file ({file_bzero}, {file_bscale}) vs catalog ({cat_bzero}, {cat_bscale})")]
    ScalingConflict {
        file: String,
        file_bzero: f64,
        file_bscale: f64,
        cat_bzero: f64,
        cat_bscale: f64,
    },

    /// The segment file is absent and the caller asked for the on-disk form.
    #[error("missing segment file: {0}")]
    MissingFile(String),

    /// The storage unit is not on disk (tape staging failed or was refused).
    #[error("storage unit offline: {0}")]
    Offline(String),

    /// The TAR size cap was reached; the archive was terminated cleanly.
    #[error("archive truncated at {limit} bytes")]
    Truncated { limit: u64 },

    /// The SQL catalog is down or a query failed.
    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(String),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),

    /// A malformed FITS file or card.
    #[error("FITS format error: {0}")]
    FitsFormat(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ExportError>;

impl ExportError {
    /// True when a scheduler pass should leave the request row in `New` so
    /// the next pass retries, rather than stamping it `Failed`.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExportError::CatalogUnavailable(_))
    }
}
