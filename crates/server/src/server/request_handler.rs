// Copyright 2015-2021 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Request Handler for incoming requests

use std::net::SocketAddr;

use crate::{proto::op::Message, server::Protocol};

/// A decoded DNS message and where it came from
#[derive(Debug)]
pub struct Request {
    /// Message with the questions of the client
    message: Message,
    /// Source address of the Client
    src: SocketAddr,
    /// Protocol of the request
    protocol: Protocol,
}

impl Request {
    /// Build a new requests with the inbound message, source address, and protocol.
    pub fn new(message: Message, src: SocketAddr, protocol: Protocol) -> Self {
        Self {
            message,
            src,
            protocol,
        }
    }

    /// The IP address from which the request originated.
    pub fn src(&self) -> SocketAddr {
        self.src
    }

    /// The protocol that was used for the request
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }
}

impl std::ops::Deref for Request {
    type Target = Message;

    fn deref(&self) -> &Self::Target {
        &self.message
    }
}

/// Trait for handling incoming requests, and providing a message response.
///
/// Lookups never wait on I/O, so handlers are synchronous and run on the task that received
/// the request.
pub trait RequestHandler: Send + Sync + 'static {
    /// Builds the response to `request`, `None` to send nothing back.
    ///
    /// The returned message is encoded as is, its id should match the request's.
    fn handle_request(&self, request: &Request) -> Option<Message>;
}
