// Copyright 2015-2024 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

// LIBRARY WARNINGS
#![warn(
    clippy::default_trait_access,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::unimplemented,
    clippy::use_self,
    missing_copy_implementations,
    missing_docs,
    non_snake_case,
    non_upper_case_globals,
    rust_2018_idioms,
    unreachable_pub
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! dyndns is an authoritative name server for dynamically updated A and AAAA records.
//!
//! # Overview
//!
//! * A [`RecordStore`](store::RecordStore) holds one partition per configured root domain
//! * The [`Resolver`](resolver::Resolver) answers DNS questions out of the store
//! * The [`update`] gateway validates and applies address updates
//! * The [`persistence`](store::persistence) engine flushes changed partitions to disk
//! * [`ServerFuture`] serves DNS over UDP and TCP, [`web::WebServer`] serves updates over HTTP

pub use hickory_proto as proto;

pub mod auth;
pub mod error;
pub mod fqdn;
pub mod resolver;
pub mod server;
pub mod store;
pub mod update;
pub mod web;

pub use self::server::ServerFuture;

/// Returns the current version of dyndns
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
