use std::collections::BTreeSet;
use std::thread;

use anyhow::{anyhow, Result};
use inbox_cache_api::{ChangeSource, InboxCache, InboxEvent, MutationKind};
use inbox_cache_core::{
    CacheConfig, ListOptions, MessageFilter, MessageId, RawPayload, SortOrder, StoreError,
};
use inbox_cache_store_sqlite::MigrationOutcome;
use serde_json::{json, Value};
use time::OffsetDateTime;

fn payload(value: Value) -> Result<RawPayload> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!("payload fixture must be an object: {other}")),
    }
}

fn message(id: &str, sent: i64) -> Result<RawPayload> {
    payload(json!({ "message_id": id, "message_sent": sent, "title": format!("title {id}") }))
}

fn at(secs: i64) -> Result<OffsetDateTime> {
    Ok(OffsetDateTime::from_unix_timestamp(secs)?)
}

fn id(raw: &str) -> Result<MessageId> {
    Ok(MessageId::parse(raw)?)
}

fn open_cache(dir: &tempfile::TempDir) -> Result<InboxCache> {
    Ok(InboxCache::open(&CacheConfig::new(dir.path(), "primary"))?)
}

fn listed_ids(cache: &InboxCache, options: ListOptions) -> Result<Vec<String>> {
    Ok(cache
        .query()
        .list(options)?
        .into_iter()
        .map(|record| record.id.as_str().to_string())
        .collect())
}

#[test]
fn reconcile_inserts_lists_newest_first_and_converges() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = open_cache(&dir)?;
    assert_eq!(cache.migration_outcome(), &MigrationOutcome::FreshInit);
    let reconciler = cache.reconciler();

    let batch = vec![message("A", 100)?, message("B", 200)?];
    let first = reconciler.apply(&batch, at(250)?)?;
    assert_eq!(first.inserted, 2);
    assert_eq!(listed_ids(&cache, ListOptions::default())?, vec!["B", "A"]);

    let again = reconciler.apply(&batch, at(250)?)?;
    assert_eq!(again.inserted, 0);
    assert_eq!(again.unchanged, 2);
    assert!(!again.wrote_anything());

    let shrunk = reconciler.apply(&[message("B", 200)?], at(300)?)?;
    assert_eq!(shrunk.deleted, 1);
    assert_eq!(listed_ids(&cache, ListOptions::default())?, vec!["B"]);
    Ok(())
}

#[test]
fn malformed_and_duplicate_payloads_are_counted() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = open_cache(&dir)?;

    let batch = vec![
        payload(json!({ "message_sent": 10 }))?,
        payload(json!({ "message_id": "", "message_sent": 10 }))?,
        payload(json!({ "message_id": "X", "message_sent": 100, "title": "old" }))?,
        payload(json!({ "message_id": "X", "message_sent": 100, "title": "new" }))?,
    ];
    let summary = cache.reconciler().apply(&batch, at(500)?)?;
    assert_eq!(summary.malformed, 2);
    assert_eq!(summary.duplicate, 1);
    assert_eq!(summary.inserted, 1);

    let stored = cache.query().get(&id("X")?)?.ok_or_else(|| anyhow!("X missing"))?;
    assert_eq!(stored.body_fields.get("title"), Some(&json!("new")));
    Ok(())
}

#[test]
fn content_updates_preserve_local_flags_and_server_delete_wins() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = open_cache(&dir)?;
    let reconciler = cache.reconciler();
    let query = cache.query();

    reconciler.apply(&[message("A", 100)?], at(200)?)?;
    query.mark_read(&id("A")?)?;

    let edited = payload(json!({ "message_id": "A", "message_sent": 100, "title": "edited" }))?;
    let summary = reconciler.apply(&[edited], at(210)?)?;
    assert_eq!(summary.updated, 1);
    let record = query.get(&id("A")?)?.ok_or_else(|| anyhow!("A missing"))?;
    assert!(!record.unread);
    assert!(!record.deleted);
    assert_eq!(record.body_fields.get("title"), Some(&json!("edited")));

    let removed = payload(
        json!({ "message_id": "A", "message_sent": 100, "title": "edited", "deleted": true }),
    )?;
    reconciler.apply(&[removed], at(220)?)?;
    let record = query.get(&id("A")?)?.ok_or_else(|| anyhow!("A missing"))?;
    assert!(record.deleted);
    assert!(listed_ids(&cache, ListOptions::default())?.is_empty());
    assert_eq!(
        listed_ids(&cache, ListOptions { unread_only: false, include_deleted: true })?,
        vec!["A"]
    );
    Ok(())
}

#[test]
fn records_newer_than_the_source_are_orphaned_before_deletion() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = open_cache(&dir)?;
    let reconciler = cache.reconciler();

    reconciler.apply(&[message("old", 100)?, message("fresh", 1_000)?], at(1_000)?)?;

    let stale = reconciler.apply(&[message("old", 100)?], at(500)?)?;
    assert_eq!(stale.deleted, 0);
    assert_eq!(stale.orphaned, 1);
    let orphans = cache.query().list_matching(&MessageFilter::Orphaned, SortOrder::SentAtDesc)?;
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].id.as_str(), "fresh");

    let recovered = reconciler.apply(&[message("old", 100)?, message("fresh", 1_000)?], at(1_100)?)?;
    assert_eq!(recovered.unchanged, 2);
    assert!(cache
        .query()
        .list_matching(&MessageFilter::Orphaned, SortOrder::SentAtDesc)?
        .is_empty());

    let authoritative = reconciler.apply(&[message("old", 100)?], at(2_000)?)?;
    assert_eq!(authoritative.deleted, 1);
    assert_eq!(listed_ids(&cache, ListOptions::default())?, vec!["old"]);
    Ok(())
}

#[test]
fn local_mutations_touch_only_local_flags() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = open_cache(&dir)?;
    let query = cache.query();
    cache.reconciler().apply(&[message("A", 100)?, message("B", 200)?], at(300)?)?;
    let before = query.get(&id("A")?)?.ok_or_else(|| anyhow!("A missing"))?;
    assert_eq!(query.unread_count()?, 2);

    query.mark_read(&id("A")?)?;
    assert_eq!(query.unread_count()?, 1);
    let after = query.get(&id("A")?)?.ok_or_else(|| anyhow!("A missing"))?;
    assert_eq!(after.body_fields, before.body_fields);
    assert_eq!(after.sent_at, before.sent_at);
    assert_eq!(after.raw_payload_hash, before.raw_payload_hash);

    let both: BTreeSet<MessageId> = [id("A")?, id("B")?].into_iter().collect();
    query.mark_unread(&both)?;
    assert_eq!(query.unread_count()?, 2);

    let missing: BTreeSet<MessageId> = [id("B")?, id("nope")?].into_iter().collect();
    let result = query.mark_deleted(&missing)?;
    assert_eq!(result.failed_ids(), vec![id("nope")?]);
    assert_eq!(listed_ids(&cache, ListOptions::default())?, vec!["A"]);

    assert_eq!(query.purge_deleted()?, 1);
    assert!(query.get(&id("B")?)?.is_none());

    let gone: BTreeSet<MessageId> = [id("A")?].into_iter().collect();
    query.delete(&gone)?;
    assert!(listed_ids(&cache, ListOptions::default())?.is_empty());
    Ok(())
}

#[test]
fn expired_messages_are_skipped_and_purged() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = open_cache(&dir)?;
    let batch = vec![
        payload(json!({ "message_id": "gone", "message_sent": 10, "message_expiry": 50 }))?,
        payload(json!({ "message_id": "later", "message_sent": 10, "message_expiry": 500 }))?,
    ];
    let summary = cache.reconciler().apply(&batch, at(100)?)?;
    assert_eq!(summary.inserted, 1);
    assert_eq!(summary.expired, 1);

    assert_eq!(cache.query().purge_expired(at(499)?)?, 0);
    assert_eq!(cache.query().purge_expired(at(500)?)?, 1);
    Ok(())
}

#[test]
fn sentinel_expiry_and_numeric_flags_are_accepted() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = open_cache(&dir)?;

    let batch = vec![
        payload(json!({
            "message_id": "A",
            "message_sent": 100,
            "message_expiry": "9999-12-31T23:59:59Z",
        }))?,
        payload(json!({ "message_id": "B", "message_sent": 200, "unread": 0 }))?,
        payload(json!({ "message_id": "C", "message_sent": 300, "deleted": "maybe" }))?,
    ];
    let summary = cache.reconciler().apply(&batch, at(1_000)?)?;
    assert_eq!(summary.inserted, 3);
    assert_eq!(summary.malformed, 0);
    assert_eq!(summary.expired, 0);

    let query = cache.query();
    assert!(query.get(&id("B")?)?.is_some_and(|record| !record.unread));
    assert!(query.get(&id("C")?)?.is_some_and(|record| !record.deleted));
    assert_eq!(query.purge_expired(at(4_000_000_000)?)?, 0);
    assert_eq!(listed_ids(&cache, ListOptions::default())?, vec!["C", "B", "A"]);
    Ok(())
}

#[test]
fn subscribers_hear_about_committed_changes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = open_cache(&dir)?;
    let events = cache.events().subscribe();

    cache.reconciler().apply(&[message("A", 100)?], at(200)?)?;
    match events.try_recv()? {
        InboxEvent::Changed(ChangeSource::Reconciled(summary)) => assert_eq!(summary.inserted, 1),
        other => return Err(anyhow!("unexpected event {other:?}")),
    }

    cache.reconciler().apply(&[message("A", 100)?], at(200)?)?;
    assert!(events.try_recv().is_err());

    cache.query().mark_read(&id("A")?)?;
    assert_eq!(
        events.try_recv()?,
        InboxEvent::Changed(ChangeSource::Mutated { kind: MutationKind::MarkRead, affected: 1 })
    );

    cache.events().request_close(false);
    assert!(matches!(events.try_recv()?, InboxEvent::CloseRequested(signal) if !signal.animated));
    Ok(())
}

#[test]
fn queries_run_while_a_reconcile_is_applying() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = open_cache(&dir)?;
    let reconciler = cache.reconciler();
    let query = cache.query();

    let writer = thread::spawn(move || -> Result<()> {
        for round in 1..=20_i64 {
            let batch = (0..10)
                .map(|n| message(&format!("m{n}"), round * 10 + n))
                .collect::<Result<Vec<_>>>()?;
            reconciler.apply(&batch, at(round * 10 + 100)?)?;
        }
        Ok(())
    });

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let query = query.clone();
            thread::spawn(move || -> Result<()> {
                for _ in 0..30 {
                    let listed = query.list(ListOptions::default())?;
                    assert!(listed.is_empty() || listed.len() == 10, "saw {}", listed.len());
                    let sent: Vec<_> = listed.iter().map(|record| record.sent_at).collect();
                    let mut sorted = sent.clone();
                    sorted.sort_by(|a, b| b.cmp(a));
                    assert_eq!(sent, sorted);
                }
                Ok(())
            })
        })
        .collect();

    writer.join().map_err(|_| anyhow!("writer panicked"))??;
    for reader in readers {
        reader.join().map_err(|_| anyhow!("reader panicked"))??;
    }
    assert_eq!(cache.query().list(ListOptions::default())?.len(), 10);
    Ok(())
}

#[test]
fn legacy_store_is_migrated_on_first_open() -> Result<()> {
    let dir = tempfile::tempdir()?;
    {
        let legacy = rusqlite::Connection::open(dir.path().join("inbox.db"))?;
        legacy.execute_batch(
            "CREATE TABLE messages (
               message_id TEXT PRIMARY KEY, message_sent, message_expiry,
               unread INTEGER, deleted INTEGER, payload_json TEXT
             );
             INSERT INTO messages VALUES ('L1', '2024-01-02 03:04:05', NULL, 0, 0, '{\"title\":\"kept\"}');
             INSERT INTO messages VALUES ('L2', 1700000000, NULL, 1, 0, NULL);",
        )?;
    }

    let cache = open_cache(&dir)?;
    assert_eq!(cache.migration_outcome(), &MigrationOutcome::Migrated { records: 2 });
    assert_eq!(listed_ids(&cache, ListOptions::default())?, vec!["L1", "L2"]);
    assert_eq!(cache.query().unread_count()?, 1);
    assert!(!dir.path().join("inbox.db").exists());
    cache.close()?;

    let reopened = open_cache(&dir)?;
    assert_eq!(reopened.migration_outcome(), &MigrationOutcome::NoOpReady);
    Ok(())
}

#[test]
fn closed_cache_rejects_reconcile_and_queries() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = open_cache(&dir)?;
    cache.close()?;

    let err = cache.reconciler().apply(&[message("A", 1)?], at(2)?).map(|_| ());
    assert_eq!(err, Err(StoreError::Closed));
    assert_eq!(cache.query().list(ListOptions::default()).map(|_| ()), Err(StoreError::Closed));
    assert_eq!(cache.close(), Err(StoreError::Closed));
    Ok(())
}
