use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use rowmirror::codec;
use rowmirror::io::store;
use rowmirror::mirror::discovery::{
    self, ConnectionProbe, ConnectionProfile, ServiceStarter,
};
use rowmirror::mirror::{self, MirrorConfig, RelationalMirror};
use rowmirror::model::{Field, FieldKind, FieldValue, Record, Schema};
use rowmirror::resilience::RetryPolicy;
use rowmirror::sync::{MirrorStatus, SyncOrchestrator};
use rowmirror::{ErrorKind, Result, StoreError};
use tempfile::tempdir;

fn date_qty() -> Schema {
    Schema::new(vec![
        Field::new("Date", FieldKind::Date),
        Field::new("Qty", FieldKind::Integer),
    ])
}

fn record(date: &str, qty: i64) -> Record {
    Record::new(vec![
        FieldValue::Text(date.to_string()),
        FieldValue::Integer(qty),
    ])
}

fn sqlite_mirror(dir: &Path, table: &str) -> RelationalMirror {
    let url = format!("sqlite://{}?mode=rwc", dir.join("mirror.db").display());
    let config = MirrorConfig::new(url, table)
        .expect("mirror config")
        .with_retry(RetryPolicy::once());
    RelationalMirror::new(config, date_qty()).expect("mirror built")
}

#[tokio::test]
async fn single_mutations_follow_the_mirror() {
    let dir = tempdir().expect("temporary directory");
    let path = dir.path().join("entries.xlsx");
    let mirror = sqlite_mirror(dir.path(), "Data1");
    let orchestrator = SyncOrchestrator::new(&path, "Data1", date_qty()).with_mirror(mirror.clone());

    assert_eq!(orchestrator.prepare().await.expect("prepared"), MirrorStatus::Synced);

    let added = orchestrator.add(&record("2024-01-01", 10)).await.expect("added");
    assert_eq!(added.mirror, MirrorStatus::Synced);
    let id = added.id.expect("mirror id");
    let row = store::find_row(&path, "Data1", added.row_index)
        .expect("row read")
        .expect("row present");
    assert_eq!(row.record_id(), Some(id));
    assert_eq!(mirror.count().await.expect("counted"), 1);

    let updated = orchestrator
        .update(added.row_index, &record("2024-01-02", 20))
        .await
        .expect("updated")
        .expect("row present");
    assert_eq!((updated.id, updated.mirror), (Some(id), MirrorStatus::Synced));
    let stored = mirror.read_all().await.expect("mirror read");
    assert_eq!(stored, vec![(id, record("2024-01-02", 20))]);

    let deleted = orchestrator
        .delete(added.row_index)
        .await
        .expect("deleted")
        .expect("row present");
    assert_eq!(deleted.mirror, MirrorStatus::Synced);
    assert_eq!(mirror.count().await.expect("counted"), 0);
    assert!(orchestrator.rows().expect("rows read").is_empty());
}

#[tokio::test]
async fn update_reinserts_a_vanished_mirror_row() {
    let dir = tempdir().expect("temporary directory");
    let path = dir.path().join("entries.xlsx");
    let mirror = sqlite_mirror(dir.path(), "Data1");
    let orchestrator = SyncOrchestrator::new(&path, "Data1", date_qty()).with_mirror(mirror.clone());
    orchestrator.prepare().await.expect("prepared");

    let added = orchestrator.add(&record("2024-01-01", 1)).await.expect("added");
    let old_id = added.id.expect("mirror id");
    assert!(mirror.delete(old_id).await.expect("mirror delete"));

    let updated = orchestrator
        .update(added.row_index, &record("2024-01-01", 2))
        .await
        .expect("updated")
        .expect("row present");
    let new_id = updated.id.expect("new mirror id");
    assert_ne!(new_id, old_id);
    assert_eq!(updated.mirror, MirrorStatus::Synced);

    let row = store::find_row(&path, "Data1", added.row_index)
        .expect("row read")
        .expect("row present");
    assert_eq!(row.record_id(), Some(new_id));

    assert!(mirror.delete(new_id).await.expect("mirror delete"));
    let deleted = orchestrator
        .delete(added.row_index)
        .await
        .expect("deleted")
        .expect("row present");
    assert!(deleted.mirror.is_failed());
}

#[tokio::test]
async fn unreachable_mirror_never_blocks_the_workbook() {
    let dir = tempdir().expect("temporary directory");
    let path = dir.path().join("entries.xlsx");
    let url = format!("sqlite://{}?mode=ro", dir.path().join("missing/none.db").display());
    let config = MirrorConfig::new(url, "Data1")
        .expect("mirror config")
        .with_connect_timeout(Duration::from_secs(2))
        .with_retry(RetryPolicy::once());
    let mirror = RelationalMirror::new(config, date_qty()).expect("mirror built");
    let orchestrator = SyncOrchestrator::new(&path, "Data1", date_qty()).with_mirror(mirror);

    assert!(orchestrator.prepare().await.expect("prepared").is_failed());

    let added = orchestrator.add(&record("2024-01-01", 5)).await.expect("added");
    assert_eq!(added.id, None);
    assert!(added.mirror.is_failed());

    let rows = orchestrator.rows().expect("rows read");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].values, ["", "2024-01-01", "5"]);

    let err = orchestrator.push_to_mirror().await.unwrap_err();
    assert!(matches!(err, StoreError::Connection(_) | StoreError::Timeout { .. }));
}

#[tokio::test]
async fn bulk_import_stops_when_the_mirror_is_unreachable() {
    let dir = tempdir().expect("temporary directory");
    let path = dir.path().join("entries.xlsx");
    let csv = dir.path().join("entries.csv");
    std::fs::write(&csv, "2024-01-01,1\n2024-01-02,2\n").expect("CSV written");
    let url = format!("sqlite://{}?mode=ro", dir.path().join("missing/none.db").display());
    let config = MirrorConfig::new(url, "Data1")
        .expect("mirror config")
        .with_connect_timeout(Duration::from_secs(2))
        .with_retry(RetryPolicy::once());
    let mirror = RelationalMirror::new(config, date_qty()).expect("mirror built");
    let orchestrator = SyncOrchestrator::new(&path, "Data1", date_qty()).with_mirror(mirror);
    orchestrator.prepare().await.expect("prepared");

    let err = orchestrator.import_csv(&csv).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Connection | ErrorKind::Timeout));
    assert!(orchestrator.rows().expect("rows read").is_empty());
}

#[tokio::test]
async fn repeated_push_keeps_one_mirror_row_per_record() {
    let dir = tempdir().expect("temporary directory");
    let path = dir.path().join("entries.xlsx");
    let offline = SyncOrchestrator::new(&path, "Data1", date_qty());
    offline.prepare().await.expect("prepared");
    offline.add(&record("2024-01-01", 1)).await.expect("added");
    offline.add(&record("2024-01-02", 2)).await.expect("added");

    let mirror = sqlite_mirror(dir.path(), "Data1");
    let online = SyncOrchestrator::new(&path, "Data1", date_qty()).with_mirror(mirror.clone());
    let first = online.push_to_mirror().await.expect("first push");
    assert_eq!((first.succeeded, first.failed), (2, 0));
    let ids: Vec<_> = online
        .rows()
        .expect("rows read")
        .iter()
        .map(|row| row.record_id())
        .collect();
    assert!(ids.iter().all(Option::is_some));

    store::update_row(
        &path,
        "Data1",
        2,
        &codec::encode_row(ids[0], &record("2024-01-01", 11)),
    )
    .expect("row edited");
    let second = online.push_to_mirror().await.expect("second push");
    assert_eq!((second.succeeded, second.failed), (2, 0));

    assert_eq!(mirror.count().await.expect("counted"), 2);
    let again: Vec<_> = online
        .rows()
        .expect("rows read")
        .iter()
        .map(|row| row.record_id())
        .collect();
    assert_eq!(again, ids);
    let stored = mirror.read_all().await.expect("mirror read");
    assert_eq!(stored[0], (ids[0].expect("id"), record("2024-01-01", 11)));

    assert!(mirror.delete(ids[1].expect("id")).await.expect("mirror delete"));
    online.push_to_mirror().await.expect("third push");
    assert_eq!(mirror.count().await.expect("counted"), 2);
    let rows = online.rows().expect("rows read");
    assert_eq!(rows[0].record_id(), ids[0]);
    assert_ne!(rows[1].record_id(), ids[1]);
    assert!(rows[1].record_id().is_some());
}

#[tokio::test]
async fn statement_failures_are_query_errors() {
    let dir = tempdir().expect("temporary directory");
    let mirror = sqlite_mirror(dir.path(), "NeverCreated");

    let err = mirror.count().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Query);
    let err = mirror.update(1, &record("2024-01-01", 1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Query);
    let err = mirror.insert(&record("2024-01-01", 1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Query);

    mirror.ensure_schema().await.expect("table created");
    assert_eq!(mirror.count().await.expect("counted"), 0);
}

#[tokio::test]
async fn push_writes_ids_back_and_pull_replaces_rows() {
    let dir = tempdir().expect("temporary directory");
    let path = dir.path().join("entries.xlsx");
    let offline = SyncOrchestrator::new(&path, "Data1", date_qty());
    offline.prepare().await.expect("prepared");
    offline.add(&record("2024-01-01", 1)).await.expect("added");
    offline.add(&record("2024-01-02", 2)).await.expect("added");
    store::add_row(&path, "Data1", &["".to_string(), "2024-01-03".to_string()]).expect("short row");

    let err = offline.push_to_mirror().await.unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));

    let mirror = sqlite_mirror(dir.path(), "Data1");
    let online = SyncOrchestrator::new(&path, "Data1", date_qty()).with_mirror(mirror.clone());
    let summary = online.push_to_mirror().await.expect("pushed");
    assert_eq!((summary.succeeded, summary.failed), (2, 1));
    assert_eq!(summary.failures[0].row, 4);
    assert_eq!(mirror.count().await.expect("counted"), 2);

    let rows = online.rows().expect("rows read");
    assert!(rows[0].record_id().is_some());
    assert!(rows[1].record_id().is_some());
    assert_eq!(rows[2].record_id(), None);

    mirror.insert(&record("2024-02-01", 7)).await.expect("inserted");
    let pulled = online.pull_from_mirror().await.expect("pulled");
    assert_eq!(pulled, 3);

    let rows = online.rows().expect("rows read");
    let indices: Vec<u32> = rows.iter().map(|row| row.index).collect();
    assert_eq!(indices, [2, 3, 4]);
    let dates: Vec<&str> = rows.iter().map(|row| row.values[1].as_str()).collect();
    assert_eq!(dates, ["2024-01-01", "2024-01-02", "2024-02-01"]);
    assert!(rows.iter().all(|row| row.record_id().is_some()));
}

#[tokio::test]
async fn dump_writes_a_replayable_script() {
    let dir = tempdir().expect("temporary directory");
    let mirror = sqlite_mirror(dir.path(), "Line 2");
    assert_eq!(mirror.config().table(), "Line2");
    mirror.ensure_schema().await.expect("table created");
    mirror.insert(&record("2024-01-01", 3)).await.expect("inserted");
    mirror.insert(&record("not a date", 4)).await.expect("inserted");

    let stored = mirror.read_all().await.expect("mirror read");
    assert_eq!(stored[1].1, record("", 4));

    let dump = mirror.dump(&dir.path().join("backups")).await.expect("dumped");
    let name = dump.file_name().expect("file name").to_string_lossy().into_owned();
    assert!(name.starts_with("Line2_backup_"));
    assert!(name.ends_with(".sql"));

    let script = std::fs::read_to_string(&dump).expect("dump read");
    assert!(script.contains("CREATE TABLE IF NOT EXISTS `Line2`"));
    assert!(script.contains("'2024-01-01', 3);"));
    assert!(script.contains("NULL, 4);"));
}

#[tokio::test]
async fn restore_replays_a_dump() {
    let dir = tempdir().expect("temporary directory");
    let backups = dir.path().join("backups");
    let mirror = sqlite_mirror(dir.path(), "Data1");
    mirror.ensure_schema().await.expect("table created");
    mirror.insert(&record("2024-01-01", 3)).await.expect("inserted");
    let kept = mirror.insert(&record("2024-01-02", 4)).await.expect("inserted");

    assert!(mirror::dump_files(&backups, "Data1").expect("listed").is_empty());
    let dump = mirror.dump(&backups).await.expect("dumped");
    assert_eq!(mirror::dump_files(&backups, "Data1").expect("listed"), [dump.clone()]);
    let before = mirror.read_all().await.expect("mirror read");

    assert!(mirror.delete(kept).await.expect("mirror delete"));
    mirror.insert(&record("2024-03-01", 9)).await.expect("inserted");

    let summary = mirror.restore(&dump).await.expect("restored");
    assert_eq!((summary.succeeded, summary.failed), (2, 0));
    assert_eq!(mirror.read_all().await.expect("mirror read"), before);

    let mut script = std::fs::read_to_string(&dump).expect("dump read");
    script.push_str("INSERT INTO `Other` (`id`) VALUES (1);\n");
    script.push_str("INSERT INTO `Data1` (`Missing`) VALUES (1);\n");
    std::fs::write(&dump, script).expect("dump edited");

    let summary = mirror.restore(&dump).await.expect("restored");
    assert_eq!((summary.succeeded, summary.failed), (2, 2));
    assert_eq!(mirror.count().await.expect("counted"), 2);
}

#[tokio::test]
async fn server_info_reports_the_engine_version() {
    let dir = tempdir().expect("temporary directory");
    let mirror = sqlite_mirror(dir.path(), "Data1");
    let info = mirror.server_info().await.expect("server info");
    assert!(info.version.starts_with('3'));
    assert_eq!(info.database.as_deref(), Some("main"));
}

/// Accepts one profile, optionally only once the service was "started".
struct FakeProbe {
    accepted: ConnectionProfile,
    started: Arc<AtomicBool>,
    needs_start: bool,
    calls: AtomicUsize,
}

impl ConnectionProbe for FakeProbe {
    async fn probe(&self, profile: &ConnectionProfile) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let up = !self.needs_start || self.started.load(Ordering::SeqCst);
        if up && profile == &self.accepted {
            Ok(())
        } else {
            Err(StoreError::Validation(format!("rejected {profile}")))
        }
    }
}

struct FakeStarter {
    started: Arc<AtomicBool>,
    succeeds: bool,
}

impl ServiceStarter for FakeStarter {
    async fn start(&self) -> bool {
        self.started.store(self.succeeds, Ordering::SeqCst);
        self.succeeds
    }
}

fn probe_for(accepted: ConnectionProfile, started: &Arc<AtomicBool>, needs_start: bool) -> FakeProbe {
    FakeProbe {
        accepted,
        started: Arc::clone(started),
        needs_start,
        calls: AtomicUsize::new(0),
    }
}

#[tokio::test]
async fn discovery_returns_the_first_accepted_profile() {
    let candidates = discovery::common_local_profiles();
    let started = Arc::new(AtomicBool::new(false));
    let probe = probe_for(candidates[3].clone(), &started, false);

    let found = discovery::discover_connection(&candidates, &probe, None::<&FakeStarter>, Duration::ZERO)
        .await
        .expect("profile found");
    assert_eq!(found, candidates[3]);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn discovery_starts_the_service_once() {
    let candidates = vec![
        ConnectionProfile::new("localhost", 3306, "root", ""),
        ConnectionProfile::new("localhost", 3306, "root", "root"),
    ];
    let started = Arc::new(AtomicBool::new(false));
    let probe = probe_for(candidates[1].clone(), &started, true);
    let starter = FakeStarter {
        started: Arc::clone(&started),
        succeeds: true,
    };

    let found = discovery::discover_connection(&candidates, &probe, Some(&starter), Duration::ZERO).await;
    assert_eq!(found, Some(candidates[1].clone()));
    assert_eq!(probe.calls.load(Ordering::SeqCst), 4);

    let stopped = Arc::new(AtomicBool::new(false));
    let probe = probe_for(candidates[1].clone(), &stopped, true);
    let failing = FakeStarter {
        started: Arc::clone(&stopped),
        succeeds: false,
    };
    let found = discovery::discover_connection(&candidates, &probe, Some(&failing), Duration::ZERO).await;
    assert_eq!(found, None);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
}
