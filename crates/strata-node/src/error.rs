//! Errors surfaced by node composition.

use std::path::PathBuf;

use thiserror::Error;

use strata_core::error::{FatalError, StrataError};

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("configuration: {0}")] Config(#[from] config::ConfigError),
    #[error("{path}: {source}")] Io { path: PathBuf, source: std::io::Error },
    #[error("undecodable {what}: {reason}")] Decode { what: &'static str, reason: String },
    #[error(transparent)] Chain(#[from] StrataError),
    #[error("shutdown requested")] ShuttingDown,
}

impl From<FatalError> for NodeError {
    fn from(e: FatalError) -> Self {
        Self::Chain(e.into())
    }
}

impl NodeError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Chain(e) if e.is_fatal())
    }
}
