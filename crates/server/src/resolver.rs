// Copyright 2015-2024 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Answers DNS questions from the record store

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::fqdn::Fqdn;
use crate::proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use crate::proto::rr::{RData, Record};
use crate::server::{Request, RequestHandler};
use crate::store::{RecordKind, RecordStore};

/// TTL of every answer
pub const DEFAULT_TTL: u32 = 300;

/// Looks up questions in a [`RecordStore`] and builds the answer records
pub struct Resolver {
    store: Arc<RecordStore>,
    ttl: u32,
}

impl Resolver {
    /// Answers from `store` with [`DEFAULT_TTL`]
    pub fn new(store: Arc<RecordStore>) -> Self {
        Self {
            store,
            ttl: DEFAULT_TTL,
        }
    }

    /// Overrides the TTL of the answers
    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    /// The store answers are read from
    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// The answer to a single question, `None` if there is no such record.
    ///
    /// Only `A` and `AAAA` questions are answered. A stored address that does not parse for
    /// the queried type is logged and treated as absent.
    pub fn answer(&self, query: &Query) -> Option<Record> {
        let kind = RecordKind::from_record_type(query.query_type())?;
        let name = match Fqdn::try_from(query.name()) {
            Ok(name) => name,
            Err(e) => {
                debug!("unusable query name {}: {e}", query.name());
                return None;
            }
        };

        debug!("query for {} record of {name}", kind.record_type());
        let addr = self.store.lookup(&name, kind)?;

        let rdata = match kind {
            RecordKind::V4 => addr.parse::<Ipv4Addr>().map(|ip| RData::A(ip.into())).ok(),
            RecordKind::V6 => addr.parse::<Ipv6Addr>().map(|ip| RData::AAAA(ip.into())).ok(),
        };
        let Some(rdata) = rdata else {
            warn!("stored {kind} address for {name} is invalid: {addr}");
            return None;
        };

        Some(Record::from_rdata(query.name().clone(), self.ttl, rdata))
    }

    /// Answers each question independently, in order
    pub fn answers<'q>(&self, queries: impl IntoIterator<Item = &'q Query>) -> Vec<Record> {
        queries.into_iter().filter_map(|q| self.answer(q)).collect()
    }

    /// True if any of the questions is inside a configured root domain
    fn is_authoritative(&self, queries: &[Query]) -> bool {
        queries.iter().any(|q| {
            Fqdn::try_from(q.name())
                .map(|name| self.store.resolve(&name).is_some())
                .unwrap_or(false)
        })
    }

    /// Builds the response to `request`.
    ///
    /// Responses are never answered, `None` is returned for them. Queries for names outside of
    /// every root domain are refused; queries inside are answered authoritatively, possibly
    /// with an empty answer section. Other op codes receive an empty reply.
    pub fn handle_message(&self, request: &Message) -> Option<Message> {
        if request.message_type() == MessageType::Response {
            return None;
        }

        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(request.op_code())
            .set_recursion_desired(request.recursion_desired())
            .set_response_code(ResponseCode::NoError);
        response.add_queries(request.queries().iter().cloned());

        if request.op_code() != OpCode::Query {
            debug!(
                "ignoring request {} with op code {:?}",
                request.id(),
                request.op_code()
            );
            return Some(response);
        }

        if !self.is_authoritative(request.queries()) {
            response.set_response_code(ResponseCode::Refused);
            return Some(response);
        }

        response.set_authoritative(true);
        response.add_answers(self.answers(request.queries()));
        Some(response)
    }
}

impl RequestHandler for Resolver {
    fn handle_request(&self, request: &Request) -> Option<Message> {
        self.handle_message(request)
    }
}
