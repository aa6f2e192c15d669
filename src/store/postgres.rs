//! PostgreSQL store over the partitioned schema from `schema.rs`.
//!
//! Reads go through the `get_points_by_record_id` and `get_record_lengths`
//! functions. Each mutating call opens one transaction; returning early on
//! error drops it, which rolls the whole call back.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info};

use super::{LineageStore, PendingWrite, PersistAction, Persisted, PointStore, RecordStore};
use crate::error::{ArchiveError, Result};
use crate::lightcurve::Lightcurve;
use crate::models::{NaturalKey, Point, QualityFlags, RawPoint, Record, RecordHeader, RecordId};
use crate::partition::{PartitionRouter, POINTS_TABLE};
use crate::schema;

// ---

#[derive(Debug, sqlx::FromRow)]
struct PointRow {
    cadence: i64,
    bjd: f64,
    value: f64,
    error: f64,
    x_position: f64,
    y_position: f64,
    quality: i32,
}

impl From<PointRow> for Point {
    fn from(row: PointRow) -> Self {
        Point {
            cadence: row.cadence,
            time: row.bjd,
            value: row.value,
            error: row.error,
            x_position: row.x_position,
            y_position: row.y_position,
            // Bit pattern is preserved across the signed column
            quality: QualityFlags(row.quality as u32),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RawPointRow {
    seq: i64,
    record_id: i64,
    #[sqlx(flatten)]
    point: PointRow,
}

#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    id: i64,
    host_id: i64,
    aperture: String,
    kind: String,
    created_on: DateTime<Utc>,
}

impl RecordRow {
    fn header(&self) -> RecordHeader {
        RecordHeader {
            id: RecordId(self.id),
            key: NaturalKey::new(self.host_id, self.aperture.clone(), self.kind.clone()),
        }
    }
}

/// Column-wise point arrays for `UNNEST` inserts.
struct PointColumns {
    cadences: Vec<i64>,
    bjd: Vec<f64>,
    values: Vec<f64>,
    errors: Vec<f64>,
    x_positions: Vec<f64>,
    y_positions: Vec<f64>,
    quality: Vec<i32>,
}

impl From<&[Point]> for PointColumns {
    fn from(points: &[Point]) -> Self {
        Self {
            cadences: points.iter().map(|p| p.cadence).collect(),
            bjd: points.iter().map(|p| p.time).collect(),
            values: points.iter().map(|p| p.value).collect(),
            errors: points.iter().map(|p| p.error).collect(),
            x_positions: points.iter().map(|p| p.x_position).collect(),
            y_positions: points.iter().map(|p| p.y_position).collect(),
            quality: points.iter().map(|p| p.quality.0 as i32).collect(),
        }
    }
}

const RECORD_COLUMNS: &str = "id, host_id, aperture, kind, created_on";

/// Store backed by a PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    router: PartitionRouter,
}

impl PgStore {
    pub fn new(pool: PgPool, router: PartitionRouter) -> Self {
        Self { pool, router }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn router(&self) -> PartitionRouter {
        self.router
    }

    async fn insert_points(
        &self,
        conn: &mut PgConnection,
        id: RecordId,
        points: &[Point],
    ) -> Result<usize> {
        // ---
        if points.is_empty() {
            return Ok(0);
        }
        schema::ensure_partition(&mut *conn, self.router.partition_for(id)).await?;

        let cols = PointColumns::from(points);
        let result = sqlx::query(
            r#"
            INSERT INTO points (
                record_id, cadence, bjd, value, error,
                x_position, y_position, quality
            )
            SELECT $1, * FROM UNNEST(
                $2::BIGINT[], $3::DOUBLE PRECISION[], $4::DOUBLE PRECISION[],
                $5::DOUBLE PRECISION[], $6::DOUBLE PRECISION[],
                $7::DOUBLE PRECISION[], $8::INTEGER[]
            )
            "#,
        )
        .bind(id.0)
        .bind(&cols.cadences)
        .bind(&cols.bjd)
        .bind(&cols.values)
        .bind(&cols.errors)
        .bind(&cols.x_positions)
        .bind(&cols.y_positions)
        .bind(&cols.quality)
        .execute(&mut *conn)
        .await
        .map_err(ArchiveError::from_write)?;

        Ok(result.rows_affected() as usize)
    }

    async fn delete_points(
        &self,
        conn: &mut PgConnection,
        id: RecordId,
        cadences: Option<Vec<i64>>,
    ) -> Result<u64> {
        // ---
        let result = match cadences {
            Some(cadences) => {
                sqlx::query("DELETE FROM points WHERE record_id = $1 AND cadence = ANY($2)")
                    .bind(id.0)
                    .bind(cadences)
                    .execute(&mut *conn)
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM points WHERE record_id = $1")
                    .bind(id.0)
                    .execute(&mut *conn)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }

    async fn fetch_record_row(conn: &mut PgConnection, id: RecordId) -> Result<RecordRow> {
        sqlx::query_as::<_, RecordRow>(&format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(conn)
            .await?
            .ok_or_else(|| ArchiveError::record_not_found(id))
    }

    async fn find_by_key(conn: &mut PgConnection, key: &NaturalKey) -> Result<Vec<RecordId>> {
        // ---
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM records WHERE host_id = $1 AND aperture = $2 AND kind = $3",
        )
        .bind(key.host_id)
        .bind(&key.aperture)
        .bind(&key.kind)
        .fetch_all(conn)
        .await?;
        Ok(ids.into_iter().map(RecordId).collect())
    }

    async fn apply(
        &self,
        conn: &mut PgConnection,
        write: &PendingWrite,
        resolve_conflicts: bool,
    ) -> Result<Persisted> {
        // ---
        if let Some(id) = write.id {
            let stored = Self::fetch_record_row(&mut *conn, id).await?.header();
            if stored.key != write.key {
                return Err(ArchiveError::ConstraintViolation(format!(
                    "record {id} is stored as {} but was written as {}",
                    stored.key, write.key
                )));
            }
            self.overwrite(&mut *conn, id, write).await?;
            return Ok(Persisted {
                id,
                action: PersistAction::Updated,
            });
        }

        if resolve_conflicts {
            if let Some(id) = Self::find_by_key(&mut *conn, &write.key).await?.first().copied() {
                self.overwrite(&mut *conn, id, write).await?;
                return Ok(Persisted {
                    id,
                    action: PersistAction::Merged,
                });
            }
        }

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO records (host_id, aperture, kind, created_on)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(write.key.host_id)
        .bind(&write.key.aperture)
        .bind(&write.key.kind)
        .bind(write.created_on)
        .fetch_one(&mut *conn)
        .await
        .map_err(ArchiveError::from_write)?;

        let id = RecordId(id);
        self.insert_points(&mut *conn, id, &write.points).await?;
        Ok(Persisted {
            id,
            action: PersistAction::Inserted,
        })
    }

    /// Write `write.points` over record `id`: replace everything when the
    /// write asks for it, otherwise only the written cadences.
    async fn overwrite(
        &self,
        conn: &mut PgConnection,
        id: RecordId,
        write: &PendingWrite,
    ) -> Result<()> {
        // ---
        let cadences = (!write.replace).then(|| write.points.iter().map(|p| p.cadence).collect());
        self.delete_points(&mut *conn, id, cadences).await?;
        self.insert_points(&mut *conn, id, &write.points).await?;
        Ok(())
    }

    async fn read_points(&self, conn: &mut PgConnection, id: RecordId) -> Result<Vec<Point>> {
        // ---
        let rows = sqlx::query_as::<_, PointRow>(
            r#"
            SELECT cadence, bjd, value, error, x_position, y_position, quality
              FROM get_points_by_record_id($1)
            "#,
        )
        .bind(id.0)
        .fetch_all(conn)
        .await?;
        Ok(rows.into_iter().map(Point::from).collect())
    }

    async fn lineage_neighbours(&self, sql: &str, id: RecordId) -> Result<Vec<RecordHeader>> {
        let rows = sqlx::query_as::<_, RecordRow>(sql)
            .bind(id.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(RecordRow::header).collect())
    }
}

#[async_trait]
impl PointStore for PgStore {
    async fn get_points_by_record_id(&self, id: RecordId) -> Result<Vec<Point>> {
        // ---
        debug!("Reading record {} from partition {}", id, self.router.partition_for(id));
        let mut conn = self.pool.acquire().await?;
        self.read_points(&mut conn, id).await
    }

    async fn get_points_by_natural_key(&self, key: &NaturalKey) -> Result<Vec<Point>> {
        let id = self.resolve_id(key).await?;
        self.get_points_by_record_id(id).await
    }

    async fn get_record_lengths(&self, host_id: i64) -> Result<BTreeMap<RecordId, usize>> {
        // ---
        let rows: Vec<(i64, i64)> =
            sqlx::query_as("SELECT record_id, length FROM get_record_lengths($1)")
                .bind(host_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(id, len)| (RecordId(id), len as usize))
            .collect())
    }

    async fn dump_partition(&self, id: RecordId) -> Result<Vec<RawPoint>> {
        // ---
        let range = self.router.partition_for(id);
        let mut conn = self.pool.acquire().await?;
        if !schema::partition_exists(&mut conn, range).await? {
            debug!("Partition {} does not exist", range.table_name(POINTS_TABLE));
            return Ok(Vec::new());
        }

        // Table name is derived from integers only
        let sql = format!(
            r#"
            SELECT seq, record_id, cadence, bjd, value, error,
                   x_position, y_position, quality
              FROM {}
             ORDER BY record_id, cadence, seq
            "#,
            range.table_name(POINTS_TABLE)
        );
        let rows = sqlx::query_as::<_, RawPointRow>(&sql)
            .fetch_all(&mut *conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| RawPoint {
                seq: row.seq,
                record_id: RecordId(row.record_id),
                point: row.point.into(),
            })
            .collect())
    }

    async fn append_points(&self, id: RecordId, points: &[Point]) -> Result<usize> {
        // ---
        let mut tx = self.pool.begin().await?;
        Self::fetch_record_row(&mut tx, id).await?;
        let n = self.insert_points(&mut tx, id, points).await?;
        tx.commit().await?;
        Ok(n)
    }

    async fn merge_points(&self, id: RecordId, batches: &[Vec<Point>]) -> Result<usize> {
        // ---
        let mut tx = self.pool.begin().await?;
        Self::fetch_record_row(&mut tx, id).await?;

        let mut merged = Lightcurve::from_sorted(self.read_points(&mut tx, id).await?);
        let len = merged.merge(batches.iter().cloned());

        self.delete_points(&mut tx, id, None).await?;
        self.insert_points(&mut tx, id, merged.points()).await?;
        tx.commit().await?;

        debug!("Merged {} batches into record {}", batches.len(), id);
        Ok(len)
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn resolve_id(&self, key: &NaturalKey) -> Result<RecordId> {
        // ---
        let mut conn = self.pool.acquire().await?;
        let ids = Self::find_by_key(&mut conn, key).await?;
        match ids.as_slice() {
            [] => Err(ArchiveError::NotFound(format!("record {key}"))),
            [id] => Ok(*id),
            many => Err(ArchiveError::AmbiguousKey {
                query: key.to_string(),
                matches: many.len(),
            }),
        }
    }

    async fn get_record(&self, id: RecordId) -> Result<Record> {
        // ---
        let mut conn = self.pool.acquire().await?;
        let row = Self::fetch_record_row(&mut conn, id).await?;
        let points = self.read_points(&mut conn, id).await?;
        Ok(Record {
            id: Some(id),
            key: row.header().key,
            created_on: row.created_on,
            lightcurve: Lightcurve::from_sorted(points),
        })
    }

    async fn records_for_host(&self, host_id: i64) -> Result<Vec<Record>> {
        // ---
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE host_id = $1 ORDER BY id"
        ))
        .bind(host_id)
        .fetch_all(&mut *conn)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id = RecordId(row.id);
            let points = self.read_points(&mut conn, id).await?;
            records.push(Record {
                id: Some(id),
                key: row.header().key,
                created_on: row.created_on,
                lightcurve: Lightcurve::from_sorted(points),
            });
        }
        Ok(records)
    }

    async fn persist(
        &self,
        batch: &[PendingWrite],
        resolve_conflicts: bool,
    ) -> Result<Vec<Persisted>> {
        // ---
        let mut tx = self.pool.begin().await?;
        let mut persisted = Vec::with_capacity(batch.len());
        for write in batch {
            persisted.push(self.apply(&mut tx, write, resolve_conflicts).await?);
        }
        tx.commit().await.map_err(ArchiveError::from_write)?;

        info!("Persisted batch of {} records", persisted.len());
        Ok(persisted)
    }

    async fn delete_record(&self, id: RecordId) -> Result<()> {
        // ---
        let result = sqlx::query("DELETE FROM records WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ArchiveError::record_not_found(id));
        }
        debug!("Deleted record {}", id);
        Ok(())
    }
}

#[async_trait]
impl LineageStore for PgStore {
    async fn link(&self, source: RecordId, derived: RecordId) -> Result<()> {
        // ---
        if source == derived {
            return Err(ArchiveError::SelfLink(source));
        }
        let result = sqlx::query(
            "INSERT INTO lineage (source_id, derived_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(source.0)
        .bind(derived.0)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some("23503") => Err(
                ArchiveError::NotFound(format!("record {source} or {derived}")),
            ),
            Err(e) => Err(ArchiveError::from_write(e)),
        }
    }

    async fn unlink(&self, source: RecordId, derived: RecordId) -> Result<()> {
        sqlx::query("DELETE FROM lineage WHERE source_id = $1 AND derived_id = $2")
            .bind(source.0)
            .bind(derived.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn sources_of(&self, id: RecordId) -> Result<Vec<RecordHeader>> {
        self.lineage_neighbours(
            r#"
            SELECT r.id, r.host_id, r.aperture, r.kind, r.created_on
              FROM lineage l
              JOIN records r ON r.id = l.source_id
             WHERE l.derived_id = $1
             ORDER BY r.id
            "#,
            id,
        )
        .await
    }

    async fn derived_from(&self, id: RecordId) -> Result<Vec<RecordHeader>> {
        self.lineage_neighbours(
            r#"
            SELECT r.id, r.host_id, r.aperture, r.kind, r.created_on
              FROM lineage l
              JOIN records r ON r.id = l.derived_id
             WHERE l.source_id = $1
             ORDER BY r.id
            "#,
            id,
        )
        .await
    }
}
