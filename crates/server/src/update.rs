// Copyright 2015-2024 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Validates address updates and applies them to the record store

use std::net::{Ipv4Addr, Ipv6Addr};

use enum_as_inner::EnumAsInner;
use thiserror::Error;
use tracing::debug;

use crate::fqdn::{Fqdn, FqdnError};
use crate::store::{RecordKind, RecordStore, StoreError};

/// A request to change the addresses of one name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateRequest {
    /// The name to update, in any case and with or without the trailing dot
    pub domain: String,
    /// New IPv4 address, empty is the same as absent
    pub ipv4: Option<String>,
    /// New IPv6 address, empty is the same as absent
    pub ipv6: Option<String>,
}

impl UpdateRequest {
    /// Only updates the IPv4 address of `domain`
    pub fn ipv4(domain: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ipv4: Some(addr.into()),
            ipv6: None,
        }
    }

    /// Only updates the IPv6 address of `domain`
    pub fn ipv6(domain: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ipv4: None,
            ipv6: Some(addr.into()),
        }
    }
}

/// Why an update was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error, EnumAsInner)]
#[non_exhaustive]
pub enum UpdateError {
    /// The domain is not a valid name
    #[error("invalid domain: {0}")]
    InvalidDomain(FqdnError),
    /// Neither an IPv4 nor an IPv6 address was given
    #[error("missing address")]
    MissingAddress,
    /// The address does not parse for its family
    #[error("invalid {0} address: {1}")]
    InvalidAddress(RecordKind, String),
    /// No configured root domain contains the name
    #[error("domain not found: {0}")]
    NotFound(Fqdn),
}

impl From<StoreError> for UpdateError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(name) => Self::NotFound(name),
        }
    }
}

/// What an accepted update changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// The canonical updated name
    pub name: Fqdn,
    /// Root of the partition that now holds the records
    pub root: Fqdn,
    /// The stored IPv4 address, if one was part of the request
    pub ipv4: Option<Ipv4Addr>,
    /// The stored IPv6 address, if one was part of the request
    pub ipv6: Option<Ipv6Addr>,
}

fn present(addr: &Option<String>) -> Option<&str> {
    addr.as_deref().map(str::trim).filter(|a| !a.is_empty())
}

/// Validates `request` and writes its addresses to `store`.
///
/// Nothing is written unless every given address is valid and the name belongs to a
/// configured root domain. Addresses are stored in their canonical textual form.
pub fn apply(store: &RecordStore, request: &UpdateRequest) -> Result<UpdateOutcome, UpdateError> {
    let name = Fqdn::new(&request.domain).map_err(UpdateError::InvalidDomain)?;

    let ipv4 = present(&request.ipv4);
    let ipv6 = present(&request.ipv6);
    if ipv4.is_none() && ipv6.is_none() {
        debug!("rejecting update of {name} without an address");
        return Err(UpdateError::MissingAddress);
    }

    let ipv4 = ipv4
        .map(|a| {
            a.parse::<Ipv4Addr>()
                .map_err(|_| UpdateError::InvalidAddress(RecordKind::V4, a.to_string()))
        })
        .transpose()?;
    let ipv6 = ipv6
        .map(|a| {
            a.parse::<Ipv6Addr>()
                .map_err(|_| UpdateError::InvalidAddress(RecordKind::V6, a.to_string()))
        })
        .transpose()?;

    let Some(root) = store.resolve(&name).map(|p| p.root().clone()) else {
        return Err(StoreError::NotFound(name).into());
    };

    if let Some(addr) = ipv4 {
        store.update(&name, RecordKind::V4, addr.to_string())?;
    }
    if let Some(addr) = ipv6 {
        store.update(&name, RecordKind::V6, addr.to_string())?;
    }

    Ok(UpdateOutcome {
        name,
        root,
        ipv4,
        ipv6,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RecordStore {
        RecordStore::new([Fqdn::new("example.com.").unwrap()])
    }

    fn fqdn(s: &str) -> Fqdn {
        Fqdn::new(s).unwrap()
    }

    #[test]
    fn test_apply_ipv4() {
        let store = store();
        let outcome = apply(&store, &UpdateRequest::ipv4("WWW.Example.com", "1.2.3.4")).unwrap();

        assert_eq!(outcome.name, fqdn("www.example.com."));
        assert_eq!(outcome.root, fqdn("example.com."));
        assert_eq!(outcome.ipv4, Some(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(outcome.ipv6, None);
        assert_eq!(
            store
                .lookup(&fqdn("www.example.com."), RecordKind::V4)
                .as_deref(),
            Some("1.2.3.4")
        );
        assert_eq!(store.lookup(&fqdn("www.example.com."), RecordKind::V6), None);
    }

    #[test]
    fn test_apply_both_canonicalizes() {
        let store = store();
        let request = UpdateRequest {
            domain: "host.example.com.".to_string(),
            ipv4: Some(" 10.0.0.1 ".to_string()),
            ipv6: Some("2001:DB8:0:0::1".to_string()),
        };
        apply(&store, &request).unwrap();

        let name = fqdn("host.example.com.");
        assert_eq!(store.lookup(&name, RecordKind::V4).as_deref(), Some("10.0.0.1"));
        assert_eq!(
            store.lookup(&name, RecordKind::V6).as_deref(),
            Some("2001:db8::1")
        );
    }

    #[test]
    fn test_missing_address() {
        let store = store();
        let request = UpdateRequest {
            domain: "www.example.com".to_string(),
            ipv4: Some(String::new()),
            ipv6: None,
        };

        assert!(apply(&store, &request).unwrap_err().is_missing_address());
        assert!(!store.partitions()[0].is_v4_dirty());
    }

    #[test]
    fn test_invalid_address_writes_nothing() {
        let store = store();
        let request = UpdateRequest {
            domain: "www.example.com".to_string(),
            ipv4: Some("1.2.3.4".to_string()),
            ipv6: Some("1.2.3.4".to_string()),
        };

        let err = apply(&store, &request).unwrap_err();
        assert_eq!(
            err.as_invalid_address(),
            Some((&RecordKind::V6, &"1.2.3.4".to_string()))
        );
        assert_eq!(store.lookup(&fqdn("www.example.com."), RecordKind::V4), None);
        assert!(!store.partitions()[0].is_v4_dirty());
    }

    #[test]
    fn test_not_found() {
        let store = store();
        let err = apply(&store, &UpdateRequest::ipv4("other.org", "1.2.3.4")).unwrap_err();

        assert_eq!(err, UpdateError::NotFound(fqdn("other.org.")));
        assert!(store.partitions().iter().all(|p| !p.is_v4_dirty()));
    }

    #[test]
    fn test_invalid_domain() {
        let store = store();
        let err = apply(&store, &UpdateRequest::ipv6("a..example.com", "::1")).unwrap_err();
        assert!(err.is_invalid_domain());
    }
}
