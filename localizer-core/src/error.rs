//! Typed errors for every fallible boundary in the pipeline.
//!
//! Only [`InitError`] is ever allowed to unwind the process. Every other error is caught
//! at its boundary and turned into a counter increment or a `tracing` event.

use thiserror::Error;

/// Failure to parse or validate an inbound anchor report.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IngestError {
    #[error("malformed payload: {0}")]
    InvalidPayload(String),
    #[error("unknown anchor id {0}")]
    UnknownAnchor(u8),
    #[error("non-finite or out-of-range vector component")]
    InvalidVector,
    #[error("message bus transport error: {0}")]
    TransportError(String),
}

/// Reason a measurement was turned away by the sliding-window binner. Not an error from
/// the pipeline's perspective — expected filter behavior, counted but never escalated.
#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum BinnerRejection {
    #[error("measurement timestamp older than the current window start")]
    LateDrop,
    #[error("z-score {0:.2} exceeds outlier_sigma")]
    StatisticalOutlier(f64),
    #[error("predicted per-anchor variance {0:.1} cm^2 exceeds max_anchor_variance")]
    VarianceTooHigh(f64),
}

/// Failure modes of one PGO solve attempt.
#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum SolveError {
    #[error("solver did not converge within the iteration cap")]
    NonConvergence,
    #[error("numeric failure (NaN/Inf) in residual or Jacobian")]
    NumericFailure,
    #[error("zero anchor-tag edges and no warm start available")]
    Underconstrained,
}

/// Fatal at process startup; the only error kind permitted to terminate the process.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("bad anchor geometry: {0}")]
    BadAnchorGeometry(String),
    #[error("message bus unreachable at startup: {0}")]
    BusUnreachableAtStartup(String),
    #[error("bad configuration: {0}")]
    BadConfig(String),
}
