// Copyright 2015-2024 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! All record persistence related types
//!
//! Every partition is stored in two plain text files below the data directory, one per address
//! family, named after the root domain: `example.com.v4.csv` and `example.com.v6.csv`. Each line
//! holds one record as `<name>\t<address>`.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{PersistenceError, PersistenceErrorKind};
use crate::fqdn::Fqdn;
use crate::store::{Partition, RecordKind, RecordStore};

/// Default period between two flush passes
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

const IPV4_FILE: &str = "v4.csv";
const IPV6_FILE: &str = "v6.csv";

/// Outcome of loading the record files
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Records added to the store
    pub records: usize,
    /// Lines that were ignored because they could not be used
    pub skipped_lines: usize,
    /// Files that exist but could not be read
    pub errors: Vec<PersistenceError>,
}

/// Outcome of one flush pass
#[derive(Debug, Default)]
pub struct FlushReport {
    /// Number of files that were rewritten
    pub written: usize,
    /// Tables that could not be written, they stay dirty
    pub errors: Vec<PersistenceError>,
}

impl FlushReport {
    /// True if every dirty table was written
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Reads and writes the record files of a [`RecordStore`]
pub struct Persistence {
    data_path: PathBuf,
    // serializes flush passes, e.g. a periodic one against the one at shutdown
    saving: Mutex<()>,
}

impl Persistence {
    /// Record files are kept directly in `data_path`
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
            saving: Mutex::new(()),
        }
    }

    /// The directory holding the record files
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Path of the file storing `kind` records for the partition `root`
    pub fn record_file(&self, root: &Fqdn, kind: RecordKind) -> PathBuf {
        let suffix = match kind {
            RecordKind::V4 => IPV4_FILE,
            RecordKind::V6 => IPV6_FILE,
        };

        self.data_path.join(format!("{root}{suffix}"))
    }

    /// Fills every partition of `store` from its record files.
    ///
    /// A missing file leaves the table empty. Unreadable files and unusable lines are logged and
    /// skipped, loading always continues with the next one. Dirty flags are not touched.
    pub async fn load(&self, store: &RecordStore) -> LoadReport {
        let mut report = LoadReport::default();

        for partition in store.partitions() {
            for kind in RecordKind::ALL {
                self.load_file(partition, kind, &mut report).await;
            }
        }

        report
    }

    async fn load_file(&self, partition: &Partition, kind: RecordKind, report: &mut LoadReport) {
        let root = partition.root();
        let path = self.record_file(root, kind);

        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("no {kind} records for domain {root}, {path:?} does not exist");
                return;
            }
            Err(source) => {
                warn!("could not load {kind} records for domain {root} from {path:?}: {source}");
                report.errors.push(
                    PersistenceErrorKind::Read {
                        path,
                        kind,
                        source,
                    }
                    .into(),
                );
                return;
            }
        };

        debug!("reading file: {path:?}");
        let (records, skipped) = parse_records(&data, root, kind);

        report.skipped_lines += skipped;
        report.records += partition.extend(kind, records);
        info!("read file: {path:?}");
    }

    /// Runs one flush pass: every dirty table of `store` is written to its record file.
    ///
    /// A table whose write fails stays dirty so the next pass retries it, and the pass moves on
    /// to the remaining tables.
    pub async fn flush(&self, store: &RecordStore) -> FlushReport {
        let _saving = self.saving.lock().await;
        let mut report = FlushReport::default();

        for partition in store.partitions() {
            for kind in RecordKind::ALL {
                // cleared before the snapshot, a write racing with us marks the table again
                if !partition.take_dirty(kind) {
                    continue;
                }

                let data = serialize_records(&partition.snapshot(kind));
                let path = self.record_file(partition.root(), kind);

                match write_file(&path, data.as_bytes()).await {
                    Ok(()) => {
                        debug!("saved {kind} records for {} to {path:?}", partition.root());
                        report.written += 1;
                    }
                    Err(source) => {
                        partition.mark_dirty(kind, true);

                        let err = PersistenceError::from(PersistenceErrorKind::Write {
                            root: partition.root().to_string(),
                            path,
                            kind,
                            source,
                        });
                        error!("{err}");
                        report.errors.push(err);
                    }
                }
            }
        }

        if !report.errors.is_empty() {
            error!(
                "{} errors occurred while trying to save",
                report.errors.len()
            );
        }

        report
    }
}

/// Parses the contents of a record file, returning the usable records and the number of
/// skipped lines.
fn parse_records(data: &str, root: &Fqdn, kind: RecordKind) -> (Vec<(Fqdn, String)>, usize) {
    let mut records = Vec::new();
    let mut skipped = 0;

    for (idx, line) in data.lines().enumerate() {
        let line_number = idx + 1;
        if line.trim().is_empty() {
            debug!("ignoring blank line {line_number} of {kind} addresses for domain {root}");
            continue;
        }

        let mut cols = line.split('\t');
        let (Some(name), Some(addr)) = (cols.next(), cols.next()) else {
            warn!("error reading line {line_number} of {kind} addresses for domain {root}: too few columns");
            skipped += 1;
            continue;
        };

        let name = match Fqdn::new(name) {
            Ok(name) => name,
            Err(e) => {
                warn!("error reading line {line_number} of {kind} addresses for domain {root}: {e}");
                skipped += 1;
                continue;
            }
        };

        if !root.zone_of(&name) {
            warn!("error reading line {line_number} of {kind} addresses for domain {root}: {name} is outside of the domain");
            skipped += 1;
            continue;
        }

        records.push((name, addr.to_string()));
    }

    (records, skipped)
}

fn serialize_records(records: &BTreeMap<Fqdn, String>) -> String {
    let mut data = String::with_capacity(records.len() * 32);
    for (name, addr) in records {
        data.push_str(name.as_str());
        data.push('\t');
        data.push_str(addr);
        data.push('\n');
    }
    data
}

/// Replaces the file at `path`, readers never observe a partially written file
async fn write_file(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, data).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        // best effort, the rename error is reported
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }

    Ok(())
}

/// The background task flushing a store on a fixed interval
pub struct FlushTask {
    join_handle: JoinHandle<()>,
    cancellation_token: CancellationToken,
    persistence: Arc<Persistence>,
    store: Arc<RecordStore>,
}

impl FlushTask {
    /// Starts flushing `store` every `period`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(persistence: Arc<Persistence>, store: Arc<RecordStore>, period: Duration) -> Self {
        let cancellation_token = CancellationToken::new();
        let token = cancellation_token.clone();
        let task_persistence = Arc::clone(&persistence);
        let task_store = Arc::clone(&store);

        let join_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        task_persistence.flush(&task_store).await;
                    }
                    _ = token.cancelled() => break,
                }
            }

            debug!("flush task stopped");
        });

        Self {
            join_handle,
            cancellation_token,
            persistence,
            store,
        }
    }

    /// Stops the timer, waits for a running pass to finish, then flushes one last time
    pub async fn shutdown(self) -> FlushReport {
        self.cancellation_token.cancel();

        let mut join_error = None;
        if let Err(e) = self.join_handle.await {
            error!("error from flush task: {e}");
            join_error = Some(e);
        }

        let mut report = self.persistence.flush(&self.store).await;
        if let Some(e) = join_error {
            report.errors.push(e.into());
        }

        info!("final flush wrote {} files", report.written);
        report
    }
}
