// Copyright 2015-2024 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! All defined errors for dyndns

mod config_error;
mod persistence_error;
mod server_error;

pub use self::config_error::{ConfigError, ConfigErrorKind};
pub use self::persistence_error::{PersistenceError, PersistenceErrorKind};
pub use self::server_error::{ServerError, ServerErrorKind};

/// Result for loading and writing the authentication file
pub type ConfigResult<T> = Result<T, ConfigError>;
