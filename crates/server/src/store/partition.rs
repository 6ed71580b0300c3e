// Copyright 2015-2024 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Record tables for a single root domain

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use crate::fqdn::Fqdn;
use crate::store::RecordKind;

/// One address table and its dirty flag.
///
/// The flag is not guarded by the table lock, checking it never waits on readers or writers
/// of the table.
#[derive(Default)]
struct Table {
    records: RwLock<HashMap<Fqdn, String>>,
    dirty: AtomicBool,
}

impl Table {
    fn set(&self, name: Fqdn, addr: String) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, addr);

        // set after the insert, a flush that cleared the flag before this write will see it again
        self.dirty.store(true, Ordering::Release);
    }

    fn get(&self, name: &Fqdn) -> Option<String> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn extend(&self, records: impl IntoIterator<Item = (Fqdn, String)>) -> usize {
        let mut table = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let before = table.len();
        table.extend(records);
        table.len() - before
    }

    fn snapshot(&self) -> BTreeMap<Fqdn, String> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, addr)| (name.clone(), addr.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// The records of one configured root domain.
///
/// Both address families have their own lock and dirty flag, so an IPv6 update never waits for
/// IPv4 readers and vice versa.
pub struct Partition {
    root: Fqdn,
    v4: Table,
    v6: Table,
}

impl Partition {
    /// Creates an empty, clean partition for `root`
    pub fn new(root: Fqdn) -> Self {
        Self {
            root,
            v4: Table::default(),
            v6: Table::default(),
        }
    }

    /// The root domain this partition is authoritative for
    pub fn root(&self) -> &Fqdn {
        &self.root
    }

    /// Returns true if `name` is the root or one of its subdomains
    pub fn contains(&self, name: &Fqdn) -> bool {
        self.root.zone_of(name)
    }

    fn table(&self, kind: RecordKind) -> &Table {
        match kind {
            RecordKind::V4 => &self.v4,
            RecordKind::V6 => &self.v6,
        }
    }

    /// Inserts or replaces the address for `name` and marks the table as changed.
    ///
    /// The address is stored as given, validation is up to the caller.
    pub fn set(&self, kind: RecordKind, name: Fqdn, addr: impl Into<String>) {
        self.table(kind).set(name, addr.into());
    }

    /// The stored address of `name`, if any
    pub fn get(&self, kind: RecordKind, name: &Fqdn) -> Option<String> {
        self.table(kind).get(name)
    }

    /// Stores an IPv4 address for `name`
    pub fn set_v4(&self, name: Fqdn, addr: impl Into<String>) {
        self.set(RecordKind::V4, name, addr)
    }

    /// Stores an IPv6 address for `name`
    pub fn set_v6(&self, name: Fqdn, addr: impl Into<String>) {
        self.set(RecordKind::V6, name, addr)
    }

    /// Looks up the IPv4 address of `name`
    pub fn get_v4(&self, name: &Fqdn) -> Option<String> {
        self.get(RecordKind::V4, name)
    }

    /// Looks up the IPv6 address of `name`
    pub fn get_v6(&self, name: &Fqdn) -> Option<String> {
        self.get(RecordKind::V6, name)
    }

    /// True if the table has changes that were not yet written to disk
    pub fn is_dirty(&self, kind: RecordKind) -> bool {
        self.table(kind).dirty.load(Ordering::Acquire)
    }

    /// Overrides the dirty flag of the table
    pub fn mark_dirty(&self, kind: RecordKind, dirty: bool) {
        self.table(kind).dirty.store(dirty, Ordering::Release)
    }

    /// Clears the dirty flag, returning whether it was set
    pub(crate) fn take_dirty(&self, kind: RecordKind) -> bool {
        self.table(kind).dirty.swap(false, Ordering::AcqRel)
    }

    /// See [`Self::is_dirty`]
    pub fn is_v4_dirty(&self) -> bool {
        self.is_dirty(RecordKind::V4)
    }

    /// See [`Self::is_dirty`]
    pub fn is_v6_dirty(&self) -> bool {
        self.is_dirty(RecordKind::V6)
    }

    /// See [`Self::mark_dirty`]
    pub fn mark_v4_dirty(&self, dirty: bool) {
        self.mark_dirty(RecordKind::V4, dirty)
    }

    /// See [`Self::mark_dirty`]
    pub fn mark_v6_dirty(&self, dirty: bool) {
        self.mark_dirty(RecordKind::V6, dirty)
    }

    /// Adds records read from disk, leaving the dirty flag untouched.
    ///
    /// Returns the number of names that were not yet present.
    pub(crate) fn extend(
        &self,
        kind: RecordKind,
        records: impl IntoIterator<Item = (Fqdn, String)>,
    ) -> usize {
        self.table(kind).extend(records)
    }

    /// A sorted copy of one table, the lock is only held while copying
    pub fn snapshot(&self, kind: RecordKind) -> BTreeMap<Fqdn, String> {
        self.table(kind).snapshot()
    }

    /// See [`Self::snapshot`]
    pub fn snapshot_v4(&self) -> BTreeMap<Fqdn, String> {
        self.snapshot(RecordKind::V4)
    }

    /// See [`Self::snapshot`]
    pub fn snapshot_v6(&self) -> BTreeMap<Fqdn, String> {
        self.snapshot(RecordKind::V6)
    }

    /// Number of names in one table
    pub fn len(&self, kind: RecordKind) -> usize {
        self.table(kind).len()
    }

    /// True if neither table holds a record
    pub fn is_empty(&self) -> bool {
        self.v4.len() == 0 && self.v6.len() == 0
    }
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("root", &self.root)
            .field("v4_dirty", &self.is_v4_dirty())
            .field("v6_dirty", &self.is_v6_dirty())
            .finish_non_exhaustive()
    }
}
