//! Round trips against a live PostgreSQL database.
//!
//! These tests only run when `DATABASE_URL` is set; otherwise they return
//! early. Each test writes under its own host id so runs do not collide.

use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::Result;
use chrono::Utc;

use lightcurvedb::store::{LineageStore, PointStore, RecordStore};
use lightcurvedb::{
    config, schema, ArchiveError, Db, NaturalKey, Point, RecordIndex, RecordPatch,
};

async fn open_db() -> Result<Option<Db>> {
    // ---
    dotenvy::dotenv().ok();
    if std::env::var("DATABASE_URL").is_err() {
        eprintln!("DATABASE_URL not set; skipping");
        return Ok(None);
    }
    let mut db = Db::new(config::load_from_env()?);
    db.open().await?;
    schema::create_schema(db.pool()?).await?;
    Ok(Some(db))
}

fn unique_host() -> i64 {
    static NEXT: AtomicI64 = AtomicI64::new(0);
    Utc::now().timestamp_micros() * 16 + NEXT.fetch_add(1, Ordering::Relaxed)
}

fn points(cadences: &[i64]) -> Vec<Point> {
    cadences
        .iter()
        .map(|c| Point::at(*c).with_value(*c as f64))
        .collect()
}

#[tokio::test]
async fn flush_and_read_back_through_partitions() -> Result<()> {
    // ---
    let Some(mut db) = open_db().await? else {
        return Ok(());
    };
    let store = db.store()?;
    let host = unique_host();

    let mut index = RecordIndex::new();
    index.add(host, "Aperture_002", "KSPMagnitude", points(&[3, 1, 2]))?;
    index.add(host, "Aperture_002", "RawMagnitude", points(&[1, 2]))?;
    let report = index.flush(&store, false).await?;
    assert_eq!(report.inserted, 2);

    let key = NaturalKey::new(host, "Aperture_002", "KSPMagnitude");
    let read: Vec<i64> = store
        .get_points_by_natural_key(&key)
        .await?
        .iter()
        .map(|p| p.cadence)
        .collect();
    assert_eq!(read, vec![1, 2, 3]);

    let lengths = store.get_record_lengths(host).await?;
    assert_eq!(lengths.len(), 2);

    let id = store.resolve_id(&key).await?;
    store.append_points(id, &[Point::at(2).with_value(99.0)]).await?;
    let deduped = store.get_points_by_record_id(id).await?;
    assert_eq!(deduped.len(), 3);
    assert_eq!(deduped[1].value, 99.0);

    // Cadence 5 is stored but never seen by the index
    store.append_points(id, &points(&[5])).await?;
    index.update(&key, [RecordPatch::Merge(points(&[4]))])?;
    let report = index.flush(&store, false).await?;
    assert_eq!(report.updated, 1);

    let after: Vec<i64> = store
        .get_points_by_record_id(id)
        .await?
        .iter()
        .map(|p| p.cadence)
        .collect();
    assert_eq!(after, vec![1, 2, 3, 4, 5]);
    assert_eq!(store.get_record_lengths(host).await?.get(&id), Some(&5));

    // Merged flush leaves the index holding the stored series
    let mut late = RecordIndex::new();
    late.add(host, "Aperture_002", "KSPMagnitude", points(&[6]))?;
    assert_eq!(late.flush(&store, true).await?.merged, 1);
    let tracked = late.find(&key).map(|r| r.lightcurve.cadences());
    assert_eq!(tracked, Some(vec![1, 2, 3, 4, 5, 6]));

    for id in index.ids() {
        store.delete_record(id).await?;
    }
    db.close().await;
    Ok(())
}

#[tokio::test]
async fn duplicate_key_fails_whole_batch() -> Result<()> {
    // ---
    let Some(mut db) = open_db().await? else {
        return Ok(());
    };
    let store = db.store()?;
    let host = unique_host();

    let mut seed = RecordIndex::new();
    seed.add(host, "Aperture_000", "KSPMagnitude", points(&[1]))?;
    seed.flush(&store, false).await?;

    let mut index = RecordIndex::new();
    index.add(host, "Aperture_001", "KSPMagnitude", points(&[1]))?;
    index.add(host, "Aperture_000", "KSPMagnitude", points(&[2]))?;
    let err = index.flush(&store, false).await.unwrap_err();
    assert!(matches!(err, ArchiveError::ConstraintViolation(_)));
    assert_eq!(store.records_for_host(host).await?.len(), 1);

    let report = index.flush(&store, true).await?;
    assert_eq!(report.merged, 1);
    assert_eq!(report.inserted, 1);

    let raw = store
        .resolve_id(&NaturalKey::new(host, "Aperture_000", "KSPMagnitude"))
        .await?;
    let derived = store
        .resolve_id(&NaturalKey::new(host, "Aperture_001", "KSPMagnitude"))
        .await?;
    store.link(raw, derived).await?;
    store.link(raw, derived).await?;
    assert_eq!(store.sources_of(derived).await?.len(), 1);
    store.unlink(raw, derived).await?;
    store.unlink(raw, derived).await?;
    assert!(store.derived_from(raw).await?.is_empty());

    for id in [raw, derived] {
        store.delete_record(id).await?;
    }
    db.close().await;
    Ok(())
}

#[tokio::test]
async fn scope_closes_the_pool_it_opened() -> Result<()> {
    // ---
    dotenvy::dotenv().ok();
    if std::env::var("DATABASE_URL").is_err() {
        return Ok(());
    }
    let mut db = Db::new(config::load_from_env()?);
    let host = unique_host();

    let raw_rows = db
        .scope(|store| async move {
            schema::create_schema(store.pool()).await?;
            let mut index = RecordIndex::new();
            index.add(host, "Aperture_005", "KSPMagnitude", points(&[1, 2]))?;
            index.flush(&store, false).await?;
            let id = index.ids()[0];
            store.append_points(id, &points(&[2])).await?;

            let rows = store.dump_partition(id).await?;
            let count = rows.iter().filter(|r| r.record_id == id).count();
            store.delete_record(id).await?;
            Ok::<_, ArchiveError>(count)
        })
        .await?;

    assert_eq!(raw_rows, 3);
    assert!(!db.is_open());
    Ok(())
}
