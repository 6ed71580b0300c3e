use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use dyndns_server::fqdn::Fqdn;
use dyndns_server::store::persistence::{FlushTask, Persistence};
use dyndns_server::store::{RecordKind, RecordStore};

fn fqdn(s: &str) -> Fqdn {
    Fqdn::new(s).unwrap()
}

fn store() -> RecordStore {
    RecordStore::new([fqdn("example.com."), fqdn("example.org.")])
}

#[tokio::test]
async fn test_round_trip() {
    let dir = TempDir::new().unwrap();
    let persistence = Persistence::new(dir.path());

    let original = store();
    original
        .update(&fqdn("www.example.com."), RecordKind::V4, "1.2.3.4")
        .unwrap();
    original
        .update(&fqdn("www.example.com."), RecordKind::V6, "2001:db8::1")
        .unwrap();
    original
        .update(&fqdn("mail.example.org."), RecordKind::V4, "5.6.7.8")
        .unwrap();

    let report = persistence.flush(&original).await;
    assert!(report.is_ok());
    assert_eq!(report.written, 3);
    assert!(original.partitions().iter().all(|p| !p.is_v4_dirty() && !p.is_v6_dirty()));

    assert_eq!(
        fs::read_to_string(dir.path().join("example.com.v4.csv")).unwrap(),
        "www.example.com.\t1.2.3.4\n"
    );
    // never dirty, never written
    assert!(!dir.path().join("example.org.v6.csv").exists());

    let loaded = store();
    let report = persistence.load(&loaded).await;
    assert_eq!(report.records, 3);
    assert_eq!(report.skipped_lines, 0);
    assert!(report.errors.is_empty());

    assert_eq!(loaded.snapshot(), original.snapshot());
    assert!(loaded.partitions().iter().all(|p| !p.is_v4_dirty() && !p.is_v6_dirty()));
}

#[tokio::test]
async fn test_flush_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let persistence = Persistence::new(dir.path());
    let store = store();
    store
        .update(&fqdn("www.example.com."), RecordKind::V4, "1.2.3.4")
        .unwrap();

    assert_eq!(persistence.flush(&store).await.written, 1);
    let path = dir.path().join("example.com.v4.csv");
    let first = fs::read(&path).unwrap();

    // nothing changed, nothing to write
    assert_eq!(persistence.flush(&store).await.written, 0);

    store.partitions()[0].mark_v4_dirty(true);
    assert_eq!(persistence.flush(&store).await.written, 1);
    assert_eq!(fs::read(&path).unwrap(), first);
}

#[tokio::test]
async fn test_failed_flush_stays_dirty() {
    let dir = TempDir::new().unwrap();
    let data_path = dir.path().join("not-yet-created");
    let persistence = Persistence::new(&data_path);

    let store = store();
    store
        .update(&fqdn("www.example.com."), RecordKind::V4, "1.2.3.4")
        .unwrap();

    let report = persistence.flush(&store).await;
    assert!(!report.is_ok());
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.written, 0);
    assert!(store.partitions()[0].is_v4_dirty());

    fs::create_dir(&data_path).unwrap();
    let report = persistence.flush(&store).await;
    assert!(report.is_ok());
    assert_eq!(report.written, 1);
    assert!(!store.partitions()[0].is_v4_dirty());
}

#[tokio::test]
async fn test_load_missing_and_broken_files() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("example.com.v4.csv"),
        "www.example.com.\t1.2.3.4\nno-tab-here\nwww.example.org.\t9.9.9.9\n",
    )
    .unwrap();

    let store = store();
    let report = Persistence::new(dir.path()).load(&store).await;

    assert_eq!(report.records, 1);
    assert_eq!(report.skipped_lines, 2);
    assert!(report.errors.is_empty());
    assert_eq!(
        store
            .lookup(&fqdn("www.example.com."), RecordKind::V4)
            .as_deref(),
        Some("1.2.3.4")
    );
    assert_eq!(store.lookup(&fqdn("www.example.org."), RecordKind::V4), None);
}

#[tokio::test]
async fn test_load_unreadable_file() {
    let dir = TempDir::new().unwrap();
    // a directory where the file is expected can not be read as a file
    fs::create_dir(dir.path().join("example.com.v6.csv")).unwrap();

    let store = store();
    let report = Persistence::new(dir.path()).load(&store).await;

    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.records, 0);
}

#[tokio::test]
async fn test_flush_task_periodic_and_shutdown() {
    let dir = TempDir::new().unwrap();
    let persistence = Arc::new(Persistence::new(dir.path()));
    let store = Arc::new(store());

    let task = FlushTask::spawn(
        Arc::clone(&persistence),
        Arc::clone(&store),
        Duration::from_millis(10),
    );

    store
        .update(&fqdn("www.example.com."), RecordKind::V4, "1.2.3.4")
        .unwrap();

    let path = dir.path().join("example.com.v4.csv");
    tokio::time::timeout(Duration::from_secs(5), async {
        while !path.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("the periodic flush never wrote the file");

    // changed after the last periodic pass, written by the final flush
    store
        .update(&fqdn("www.example.org."), RecordKind::V6, "::1")
        .unwrap();

    let report = task.shutdown().await;
    assert!(report.is_ok());
    assert_eq!(
        fs::read_to_string(dir.path().join("example.org.v6.csv")).unwrap(),
        "www.example.org.\t::1\n"
    );
    assert!(store.partitions().iter().all(|p| !p.is_v4_dirty() && !p.is_v6_dirty()));
}

#[tokio::test]
async fn test_failed_write_does_not_block_other_partitions() {
    let dir = TempDir::new().unwrap();
    // a non-empty directory can not be replaced by the record file
    let blocked = dir.path().join("example.com.v4.csv");
    fs::create_dir(&blocked).unwrap();
    fs::write(blocked.join("keep"), "").unwrap();

    let persistence = Persistence::new(dir.path());
    let store = store();
    store
        .update(&fqdn("www.example.com."), RecordKind::V4, "1.2.3.4")
        .unwrap();
    store
        .update(&fqdn("www.example.org."), RecordKind::V4, "5.6.7.8")
        .unwrap();

    let report = persistence.flush(&store).await;
    assert_eq!(report.written, 1);
    assert_eq!(report.errors.len(), 1);

    assert!(store.partitions()[0].is_v4_dirty());
    assert!(!store.partitions()[1].is_v4_dirty());
    assert_eq!(
        fs::read_to_string(dir.path().join("example.org.v4.csv")).unwrap(),
        "www.example.org.\t5.6.7.8\n"
    );
}

#[tokio::test]
async fn test_concurrent_flushes_are_serialized() {
    let dir = TempDir::new().unwrap();
    let persistence = Persistence::new(dir.path());
    let store = store();
    store
        .update(&fqdn("www.example.com."), RecordKind::V4, "1.2.3.4")
        .unwrap();
    store
        .update(&fqdn("www.example.org."), RecordKind::V6, "::1")
        .unwrap();

    let (first, second) = tokio::join!(persistence.flush(&store), persistence.flush(&store));
    assert!(first.is_ok());
    assert!(second.is_ok());

    // the pass holding the save lock writes everything, the other finds nothing left
    let mut written = [first.written, second.written];
    written.sort_unstable();
    assert_eq!(written, [0, 2]);

    assert_eq!(
        fs::read_to_string(dir.path().join("example.com.v4.csv")).unwrap(),
        "www.example.com.\t1.2.3.4\n"
    );
    assert_eq!(
        fs::read_to_string(dir.path().join("example.org.v6.csv")).unwrap(),
        "www.example.org.\t::1\n"
    );
    assert!(store.partitions().iter().all(|p| !p.is_v4_dirty() && !p.is_v6_dirty()));
}

#[tokio::test]
async fn test_update_after_flush_is_written_by_next_flush() {
    let dir = TempDir::new().unwrap();
    let persistence = Persistence::new(dir.path());
    let store = store();
    store
        .update(&fqdn("www.example.com."), RecordKind::V4, "1.2.3.4")
        .unwrap();
    assert_eq!(persistence.flush(&store).await.written, 1);

    store
        .update(&fqdn("www.example.com."), RecordKind::V4, "5.6.7.8")
        .unwrap();
    assert!(store.partitions()[0].is_v4_dirty());

    assert_eq!(persistence.flush(&store).await.written, 1);
    assert_eq!(
        fs::read_to_string(dir.path().join("example.com.v4.csv")).unwrap(),
        "www.example.com.\t5.6.7.8\n"
    );
}
