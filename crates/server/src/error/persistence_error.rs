// Copyright 2015-2024 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::{fmt, io, path::PathBuf};

use thiserror::Error;

use crate::store::RecordKind;

/// The error kind for errors that get returned in the crate
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PersistenceErrorKind {
    /// A record file could not be read
    #[error("failed to read {kind} records from {path:?}: {source}")]
    Read {
        /// The record file
        path: PathBuf,
        /// Address family stored in the file
        kind: RecordKind,
        /// The underlying failure
        source: io::Error,
    },

    /// A record file could not be written
    #[error("failed to save {kind} records for {root} to {path:?}: {source}")]
    Write {
        /// The partition root whose table was being written
        root: String,
        /// The record file
        path: PathBuf,
        /// Address family stored in the file
        kind: RecordKind,
        /// The underlying failure
        source: io::Error,
    },

    /// The periodic flush task panicked or was aborted
    #[error("flush task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// The error type for errors that get returned in the crate
#[derive(Debug)]
pub struct PersistenceError {
    kind: Box<PersistenceErrorKind>,
}

impl PersistenceError {
    /// Get the kind of the error
    pub fn kind(&self) -> &PersistenceErrorKind {
        &self.kind
    }
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)
    }
}

impl std::error::Error for PersistenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.kind.source()
    }
}

impl<E> From<E> for PersistenceError
where
    E: Into<PersistenceErrorKind>,
{
    fn from(error: E) -> Self {
        Self {
            kind: Box::new(error.into()),
        }
    }
}
