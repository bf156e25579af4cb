//! Error taxonomy for the integration core.
//!
//! Loader failures are `SourceError`, join failures are `JoinError`, and
//! anything that makes a whole level unusable is `IntegrationError`. The
//! Integrator decides which of them are fatal.

use std::path::PathBuf;

use thiserror::Error;

use crate::catalog::SourceKind;
use crate::config::Level;

/// A raw source could not be turned into a table.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source {kind} for {year} not found at {}", .path.display())]
    NotFound {
        kind: SourceKind,
        year: i32,
        path: PathBuf,
    },

    #[error("source {} is unreadable: {reason}", .path.display())]
    Format { path: PathBuf, reason: String },

    #[error("io error reading {}: {error}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },
}

impl SourceError {
    pub fn format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Format {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("grouping key {key} not present in input table")]
    MissingKey { key: String },
}

/// A left join could not be executed safely.
#[derive(Debug, Error)]
pub enum JoinError {
    #[error(
        "ambiguous join with {dataset} on {key}: {duplicate_keys} duplicated key value(s), e.g. {example}"
    )]
    Ambiguous {
        dataset: String,
        key: String,
        duplicate_keys: usize,
        example: String,
    },

    #[error("join key {key} missing from {side} table of {dataset}")]
    MissingKey {
        dataset: String,
        key: String,
        side: &'static str,
    },
}

/// A level could not be integrated at all.
#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("primary source {kind} unavailable for {level} level, {year}: {cause}")]
    PrimaryUnavailable {
        level: Level,
        year: i32,
        kind: SourceKind,
        #[source]
        cause: SourceError,
    },

    #[error("primary table for {level} level, {year} is unusable: {reason}")]
    PrimaryInvalid {
        level: Level,
        year: i32,
        reason: String,
    },

    #[error("join with {dataset} changed row count from {before} to {after}")]
    RowCountChanged {
        dataset: String,
        before: usize,
        after: usize,
    },
}

pub type Result<T, E = IntegrationError> = std::result::Result<T, E>;
