// Copyright 2015-2024 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! All persistent store implementations

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fqdn::Fqdn;
use crate::proto::rr::RecordType;

mod partition;
pub mod persistence;

pub use self::partition::Partition;

/// Address family of a stored record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// IPv4, served as `A`
    V4,
    /// IPv6, served as `AAAA`
    V6,
}

impl RecordKind {
    /// Both kinds, in the order tables are flushed
    pub const ALL: [Self; 2] = [Self::V4, Self::V6];

    /// The DNS record type answering for this kind
    pub fn record_type(self) -> RecordType {
        match self {
            Self::V4 => RecordType::A,
            Self::V6 => RecordType::AAAA,
        }
    }

    /// The kind served for `record_type`, if any
    pub fn from_record_type(record_type: RecordType) -> Option<Self> {
        match record_type {
            RecordType::A => Some(Self::V4),
            RecordType::AAAA => Some(Self::V6),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::V4 => "ipv4",
            Self::V6 => "ipv6",
        })
    }
}

/// An operation on the store could not be completed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// No configured root domain is the zone of the name
    #[error("no root found for {0}")]
    NotFound(Fqdn),
}

/// Read-only copy of a partition, for listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSnapshot {
    /// Root domain of the partition
    pub root: Fqdn,
    /// IPv4 records, sorted by name
    pub v4: BTreeMap<Fqdn, String>,
    /// IPv6 records, sorted by name
    pub v6: BTreeMap<Fqdn, String>,
}

/// All record partitions of the server.
///
/// The set of partitions is fixed at construction, only their contents change afterwards. The
/// store is meant to be built once at startup and shared behind an `Arc`.
///
/// # Overlapping roots
///
/// Names are routed to the *first* configured root that is their zone. With the roots
/// `["example.com.", "sub.example.com."]`, `x.sub.example.com.` is stored under `example.com.`
/// and the second partition only receives names that the first does not cover (none, in this
/// case). List more specific roots first if they should take precedence.
#[derive(Debug)]
pub struct RecordStore {
    partitions: Vec<Partition>,
}

impl RecordStore {
    /// Creates one empty partition per root, in the given order.
    ///
    /// Repeated roots are ignored after their first occurrence.
    pub fn new(roots: impl IntoIterator<Item = Fqdn>) -> Self {
        let mut partitions: Vec<Partition> = Vec::new();

        for root in roots {
            if partitions.iter().any(|p| p.root() == &root) {
                warn!("ignoring duplicate root domain: {root}");
                continue;
            }

            info!("added domain root: {root}");
            partitions.push(Partition::new(root));
        }

        Self { partitions }
    }

    /// The partitions in configuration order
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Number of partitions
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    /// True when no root domain is configured
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Finds the partition owning `name`, see [the type level docs](Self) for overlapping roots
    pub fn resolve(&self, name: &Fqdn) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.contains(name))
    }

    /// Stores `addr` for `name` in the owning partition
    pub fn update(
        &self,
        name: &Fqdn,
        kind: RecordKind,
        addr: impl Into<String>,
    ) -> Result<&Partition, StoreError> {
        let Some(partition) = self.resolve(name) else {
            debug!("no root found for {name}");
            return Err(StoreError::NotFound(name.clone()));
        };

        let addr = addr.into();
        info!(
            "updating {name} {rtype} {addr} in {root}",
            rtype = kind.record_type(),
            root = partition.root()
        );
        partition.set(kind, name.clone(), addr);
        Ok(partition)
    }

    /// The address of `name`, `None` if there is no owning partition or no record
    pub fn lookup(&self, name: &Fqdn, kind: RecordKind) -> Option<String> {
        self.resolve(name)?.get(kind, name)
    }

    /// Copies every partition for display
    pub fn snapshot(&self) -> Vec<PartitionSnapshot> {
        self.partitions
            .iter()
            .map(|p| PartitionSnapshot {
                root: p.root().clone(),
                v4: p.snapshot_v4(),
                v6: p.snapshot_v6(),
            })
            .collect()
    }
}
