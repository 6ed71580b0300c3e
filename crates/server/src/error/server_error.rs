// Copyright 2015-2024 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;

use thiserror::Error;

/// The error kind for errors that get returned by the servers
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServerErrorKind {
    /// A listener task panicked or was aborted
    #[error("server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// A socket or listener went away while the server was not shutting down
    #[error("unexpected close of {0}")]
    UnexpectedClose(&'static str),
}

/// The error type for errors that get returned by the servers
#[derive(Debug)]
pub struct ServerError {
    kind: ServerErrorKind,
}

impl ServerError {
    /// Get the kind of the error
    pub fn kind(&self) -> &ServerErrorKind {
        &self.kind
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.kind.source()
    }
}

impl<E> From<E> for ServerError
where
    E: Into<ServerErrorKind>,
{
    fn from(error: E) -> Self {
        Self { kind: error.into() }
    }
}
