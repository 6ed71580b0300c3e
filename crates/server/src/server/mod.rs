// Copyright 2015-2018 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `Server` component for serving DNS queries over UDP and TCP.

mod protocol;
mod request_handler;
mod server_future;

pub use self::protocol::Protocol;
pub use self::request_handler::{Request, RequestHandler};
pub use self::server_future::ServerFuture;
