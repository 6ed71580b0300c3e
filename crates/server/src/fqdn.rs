// Copyright 2015-2024 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Canonical fully-qualified domain names used as record keys

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Maximum length of a name in its textual form, including the trailing dot
const MAX_NAME_LEN: usize = 254;
/// Maximum length of a single label
const MAX_LABEL_LEN: usize = 63;

/// A domain name could not be turned into an [`Fqdn`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum FqdnError {
    /// The name was empty
    #[error("domain name is empty")]
    Empty,
    /// Two consecutive dots, or a leading dot on a non-root name
    #[error("domain name has an empty label: {0}")]
    EmptyLabel(String),
    /// A label is longer than 63 octets
    #[error("domain name label is too long: {0}")]
    LabelTooLong(String),
    /// The whole name is longer than 253 octets
    #[error("domain name is too long: {0}")]
    TooLong(String),
    /// Whitespace, control characters or `/` in the name
    #[error("domain name contains an invalid character: {0:?}")]
    InvalidCharacter(String),
}

/// A lowercase domain name that always ends with a `.`
///
/// This is the key form for every table in the store; conversion happens once at each
/// boundary (configuration, HTTP, DNS questions, record files).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fqdn(String);

impl Fqdn {
    /// The DNS root, `.`
    pub fn root() -> Self {
        Self(".".to_string())
    }

    /// Normalizes `name`: lowercases it and appends the trailing dot when missing
    pub fn new(name: &str) -> Result<Self, FqdnError> {
        if name.is_empty() {
            return Err(FqdnError::Empty);
        }

        if name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '/')
        {
            return Err(FqdnError::InvalidCharacter(name.to_string()));
        }

        let mut normalized = name.to_ascii_lowercase();
        if !normalized.ends_with('.') {
            normalized.push('.');
        }

        if normalized == "." {
            return Ok(Self::root());
        }

        if normalized.len() > MAX_NAME_LEN {
            return Err(FqdnError::TooLong(name.to_string()));
        }

        // the trailing dot leaves one empty label at the end, which is the root
        for label in normalized[..normalized.len() - 1].split('.') {
            if label.is_empty() {
                return Err(FqdnError::EmptyLabel(name.to_string()));
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(FqdnError::LabelTooLong(name.to_string()));
            }
        }

        Ok(Self(normalized))
    }

    /// Returns true if this is the DNS root
    pub fn is_root(&self) -> bool {
        self.0 == "."
    }

    /// The textual form, with trailing dot
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if `name` is equal to or a subdomain of `self`
    ///
    /// Matching happens on label boundaries, `badexample.com.` is not in the zone
    /// `example.com.`. The root is the zone of every name.
    pub fn zone_of(&self, name: &Self) -> bool {
        if self.is_root() || self == name {
            return true;
        }

        name.0
            .strip_suffix(self.0.as_str())
            .map_or(false, |prefix| prefix.ends_with('.'))
    }
}

impl FromStr for Fqdn {
    type Err = FqdnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for Fqdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fqdn {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Fqdn {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<Fqdn> for String {
    fn from(fqdn: Fqdn) -> Self {
        fqdn.0
    }
}

impl TryFrom<&hickory_proto::rr::Name> for Fqdn {
    type Error = FqdnError;

    fn try_from(name: &hickory_proto::rr::Name) -> Result<Self, Self::Error> {
        let mut ascii = name.to_ascii();
        if !ascii.ends_with('.') {
            ascii.push('.');
        }
        Self::new(&ascii)
    }
}
