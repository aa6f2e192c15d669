//! Database schema management for `lightcurvedb`.
//!
//! Ensures the record, point and lineage tables plus the read functions
//! exist. Point storage is range-partitioned by `record_id`; partitions are
//! created on demand from the router through [`ensure_partition`].

use sqlx::{PgConnection, PgPool};
use tracing::debug;

use crate::error::Result;
use crate::partition::{PartitionRange, POINTS_TABLE};

// ---

/// Create or update the database schema (idempotent).
///
/// Safe to call on every startup; no-op if objects already exist. Functions
/// are replaced so that their definitions track this crate.
///
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    // Concurrent IF NOT EXISTS DDL can still collide in the catalog
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext('lightcurvedb.schema'))")
        .execute(&mut *tx)
        .await?;

    // One row per (host, aperture, type) time series
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            id          BIGSERIAL   PRIMARY KEY,
            host_id     BIGINT      NOT NULL,
            aperture    TEXT        NOT NULL,
            kind        TEXT        NOT NULL,
            created_on  TIMESTAMPTZ NOT NULL DEFAULT now(),
            CONSTRAINT unique_record_key UNIQUE (host_id, aperture, kind)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_records_host_id
            ON records (host_id);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Ingestion order; the highest seq per cadence wins on read
    sqlx::query("CREATE SEQUENCE IF NOT EXISTS points_seq;")
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS points (
            seq         BIGINT           NOT NULL DEFAULT nextval('points_seq'),
            record_id   BIGINT           NOT NULL
                REFERENCES records (id) ON UPDATE CASCADE ON DELETE CASCADE,
            cadence     BIGINT           NOT NULL,
            bjd         DOUBLE PRECISION NOT NULL,
            value       DOUBLE PRECISION NOT NULL,
            error       DOUBLE PRECISION NOT NULL,
            x_position  DOUBLE PRECISION NOT NULL,
            y_position  DOUBLE PRECISION NOT NULL,
            quality     INTEGER          NOT NULL DEFAULT 0
        ) PARTITION BY RANGE (record_id);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_points_record_cadence
            ON points (record_id, cadence, seq DESC);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS lineage (
            source_id   BIGINT NOT NULL REFERENCES records (id) ON DELETE CASCADE,
            derived_id  BIGINT NOT NULL REFERENCES records (id) ON DELETE CASCADE,
            PRIMARY KEY (source_id, derived_id),
            CONSTRAINT no_self_lineage CHECK (source_id <> derived_id)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_lineage_derived_id
            ON lineage (derived_id);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Deduplicated, cadence-ordered read of one record
    sqlx::query(
        r#"
        CREATE OR REPLACE FUNCTION get_points_by_record_id(_record_id BIGINT)
        RETURNS TABLE (
            cadence     BIGINT,
            bjd         DOUBLE PRECISION,
            value       DOUBLE PRECISION,
            error       DOUBLE PRECISION,
            x_position  DOUBLE PRECISION,
            y_position  DOUBLE PRECISION,
            quality     INTEGER
        )
        LANGUAGE sql STABLE PARALLEL SAFE ROWS 10000
        AS $$
            SELECT DISTINCT ON (p.cadence)
                   p.cadence, p.bjd, p.value, p.error,
                   p.x_position, p.y_position, p.quality
              FROM points p
             WHERE p.record_id = _record_id
             ORDER BY p.cadence, p.seq DESC
        $$;
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE OR REPLACE FUNCTION get_record_lengths(_host_id BIGINT)
        RETURNS TABLE (record_id BIGINT, length BIGINT)
        LANGUAGE sql STABLE PARALLEL SAFE
        AS $$
            SELECT r.id, COUNT(DISTINCT p.cadence)
              FROM records r
              LEFT JOIN points p ON p.record_id = r.id
             WHERE r.host_id = _host_id
             GROUP BY r.id
             ORDER BY r.id
        $$;
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Create the physical partition for `range` if it does not exist yet.
///
/// Must run inside a transaction; the advisory lock is held until it ends.
pub async fn ensure_partition(conn: &mut PgConnection, range: PartitionRange) -> Result<()> {
    // ---
    let table = range.table_name(POINTS_TABLE);
    debug!("Ensuring partition {}", table);
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(&table)
        .execute(&mut *conn)
        .await?;
    sqlx::query(&range.ddl(POINTS_TABLE)).execute(&mut *conn).await?;
    Ok(())
}

/// Whether the physical partition for `range` exists.
pub async fn partition_exists(conn: &mut PgConnection, range: PartitionRange) -> Result<bool> {
    // ---
    let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
        .bind(range.table_name(POINTS_TABLE))
        .fetch_one(conn)
        .await?;
    Ok(exists)
}
