#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

//! Sqlite-backed store for the trip pipeline: run registry, raw trip facts,
//! the derived aggregate, the record loader, and the ingestion orchestrator.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use trip_pipeline_core::{
    bucket_key, cell_index, format_rfc3339, format_rfc3339_offset, format_week_start, now_utc,
    parse_point, parse_rfc3339_utc, parse_trip_timestamp, BucketKey, EventBus, IngestionRun,
    PipelineError, RunEvent, RunStatus, TripRecord,
};
use ulid::Ulid;

const TRIP_MIGRATION_VERSION: i64 = 1;

/// Rows are committed to raw storage in independent batches of this size.
/// A later batch failing does not roll back earlier committed batches.
pub const BATCH_SIZE: usize = 10_000;

const SCHEMA_TRIPS_V1: &str = r"
CREATE TABLE IF NOT EXISTS ingestion_runs (
  run_id TEXT PRIMARY KEY,
  status TEXT NOT NULL CHECK (status IN ('queued', 'running', 'done', 'failed')),
  started_at TEXT NOT NULL,
  finished_at TEXT,
  rows_loaded INTEGER NOT NULL DEFAULT 0,
  error_message TEXT
);

CREATE TABLE IF NOT EXISTS trips_raw (
  region TEXT NOT NULL,
  datasource TEXT NOT NULL,
  trip_ts TEXT NOT NULL,
  origin_lng REAL NOT NULL,
  origin_lat REAL NOT NULL,
  dest_lng REAL NOT NULL,
  dest_lat REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trips_raw_region_ts
  ON trips_raw(region, trip_ts);

CREATE TABLE IF NOT EXISTS trips_agg (
  region TEXT NOT NULL,
  week_start TEXT NOT NULL,
  hour_of_day INTEGER NOT NULL CHECK (hour_of_day BETWEEN 0 AND 23),
  origin_cell_x INTEGER NOT NULL,
  origin_cell_y INTEGER NOT NULL,
  dest_cell_x INTEGER NOT NULL,
  dest_cell_y INTEGER NOT NULL,
  trips_count INTEGER NOT NULL CHECK (trips_count > 0),
  PRIMARY KEY (
    region, week_start, hour_of_day,
    origin_cell_x, origin_cell_y,
    dest_cell_x, dest_cell_y
  )
);

CREATE INDEX IF NOT EXISTS idx_trips_agg_query
  ON trips_agg(region, origin_cell_x, origin_cell_y, week_start);
";

pub struct SqliteTripStore {
    conn: Connection,
}

/// Geographic query window; min/max edges may arrive swapped and are
/// normalized at the cell level before querying.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lng: f64,
    pub max_lat: f64,
    pub max_lng: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WeeklyTotal {
    pub week_start: String,
    pub trips: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeeklyAverageReport {
    pub region: String,
    pub bbox: BoundingBox,
    pub weeks_count: usize,
    pub weekly_avg_trips: f64,
    pub weekly_totals: Vec<WeeklyTotal>,
}

#[derive(Debug, Deserialize)]
struct RawTripRow {
    region: String,
    datasource: String,
    datetime: String,
    origin_coord: String,
    destination_coord: String,
}

impl SqliteTripStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|err| {
            PipelineError::Storage(format!(
                "failed to open sqlite database at {}: {err}",
                path.display()
            ))
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_TRIPS_V1)
            .context("failed to apply trip schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![TRIP_MIGRATION_VERSION, now],
            )
            .context("failed to register trip schema migration")?;

        Ok(())
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // --- run registry: pure read/write, no business logic ---

    pub fn create_run(
        &self,
        run_id: Ulid,
        status: RunStatus,
        started_at: OffsetDateTime,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO ingestion_runs(run_id, status, started_at) VALUES (?1, ?2, ?3)",
                params![
                    run_id.to_string(),
                    status.as_str(),
                    format_rfc3339(started_at)?
                ],
            )
            .context("failed to create ingestion run")?;
        Ok(())
    }

    pub fn mark_run_running(&self, run_id: Ulid) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE ingestion_runs SET status = ?1 WHERE run_id = ?2",
                params![RunStatus::Running.as_str(), run_id.to_string()],
            )
            .context("failed to mark run running")?;
        if updated == 0 {
            return Err(PipelineError::UnknownRun(run_id.to_string()).into());
        }
        Ok(())
    }

    pub fn finish_run_done(
        &self,
        run_id: Ulid,
        finished_at: OffsetDateTime,
        rows_loaded: u64,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE ingestion_runs
                 SET status = ?1, finished_at = ?2, rows_loaded = ?3
                 WHERE run_id = ?4",
                params![
                    RunStatus::Done.as_str(),
                    format_rfc3339(finished_at)?,
                    i64::try_from(rows_loaded).context("rows_loaded overflows i64")?,
                    run_id.to_string()
                ],
            )
            .context("failed to mark run done")?;
        Ok(())
    }

    pub fn finish_run_failed(
        &self,
        run_id: Ulid,
        finished_at: OffsetDateTime,
        error_message: &str,
        rows_loaded: u64,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE ingestion_runs
                 SET status = ?1, finished_at = ?2, rows_loaded = ?3, error_message = ?4
                 WHERE run_id = ?5",
                params![
                    RunStatus::Failed.as_str(),
                    format_rfc3339(finished_at)?,
                    i64::try_from(rows_loaded).context("rows_loaded overflows i64")?,
                    error_message,
                    run_id.to_string()
                ],
            )
            .context("failed to mark run failed")?;
        Ok(())
    }

    pub fn get_run(&self, run_id: Ulid) -> Result<Option<IngestionRun>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, status, started_at, finished_at, rows_loaded, error_message
             FROM ingestion_runs
             WHERE run_id = ?1",
        )?;

        let row = stmt
            .query_row(params![run_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .optional()
            .context("failed to read ingestion run")?;

        let Some((raw_id, raw_status, raw_started, raw_finished, raw_rows, error_message)) = row
        else {
            return Ok(None);
        };

        let run_id = Ulid::from_string(&raw_id)
            .with_context(|| format!("invalid stored run_id: {raw_id}"))?;
        let status = RunStatus::parse(&raw_status)
            .ok_or_else(|| anyhow!("invalid stored run status: {raw_status}"))?;
        let started_at = parse_rfc3339_utc(&raw_started)?;
        let finished_at = raw_finished.as_deref().map(parse_rfc3339_utc).transpose()?;
        let rows_loaded =
            u64::try_from(raw_rows).with_context(|| format!("invalid rows_loaded: {raw_rows}"))?;

        Ok(Some(IngestionRun {
            run_id,
            status,
            started_at,
            finished_at,
            rows_loaded,
            error_message,
        }))
    }

    // --- record loader ---

    /// Streams the delimited source file into `trips_raw`, committing every
    /// [`BATCH_SIZE`] rows. `rows_committed` advances only after a commit, so
    /// on failure it holds exactly the durably written row count.
    pub fn load_source(&mut self, path: &Path, rows_committed: &mut u64) -> Result<()> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("failed to open source file {}", path.display()))?;

        let mut batch: Vec<TripRecord> = Vec::with_capacity(BATCH_SIZE);
        for row in reader.deserialize::<RawTripRow>() {
            let row = row.context("failed to decode source row")?;
            batch.push(trip_record_from_row(&row)?);

            if batch.len() >= BATCH_SIZE {
                self.insert_trips_batch(&batch)?;
                *rows_committed += batch.len() as u64;
                batch.clear();
            }
        }

        if !batch.is_empty() {
            self.insert_trips_batch(&batch)?;
            *rows_committed += batch.len() as u64;
        }

        Ok(())
    }

    pub fn insert_trips_batch(&mut self, records: &[TripRecord]) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start trip batch transaction")?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO trips_raw(
                    region, datasource, trip_ts,
                    origin_lng, origin_lat, dest_lng, dest_lat
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for record in records {
                // Offset-preserving form: the rebuild must see the same wall
                // clock the source file carried.
                stmt.execute(params![
                    record.region,
                    record.datasource,
                    format_rfc3339_offset(record.trip_ts)?,
                    record.origin_lng,
                    record.origin_lat,
                    record.dest_lng,
                    record.dest_lat,
                ])?;
            }
        }
        tx.commit().context("failed to commit trip batch")?;
        Ok(())
    }

    // --- aggregation engine ---

    /// Rebuilds `trips_agg` from the full raw history inside one transaction:
    /// delete everything, stream `trips_raw`, fold counts per bucket key,
    /// write one row per distinct key. A failure aborts the transaction, so
    /// old and new aggregate rows never mix. Returns the bucket count.
    pub fn rebuild_aggregate(&mut self) -> Result<usize> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start aggregate rebuild transaction")?;

        tx.execute("DELETE FROM trips_agg", [])
            .context("failed to clear aggregate table")?;

        let mut counts: BTreeMap<BucketKey, u64> = BTreeMap::new();
        {
            let mut stmt = tx.prepare(
                "SELECT region, datasource, trip_ts, origin_lng, origin_lat, dest_lng, dest_lat
                 FROM trips_raw",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let raw_ts: String = row.get(2)?;
                let record = TripRecord {
                    region: row.get(0)?,
                    datasource: row.get(1)?,
                    trip_ts: parse_trip_timestamp(&raw_ts)?,
                    origin_lng: row.get(3)?,
                    origin_lat: row.get(4)?,
                    dest_lng: row.get(5)?,
                    dest_lat: row.get(6)?,
                };
                *counts.entry(bucket_key(&record)).or_insert(0) += 1;
            }
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO trips_agg(
                    region, week_start, hour_of_day,
                    origin_cell_x, origin_cell_y,
                    dest_cell_x, dest_cell_y,
                    trips_count
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for (key, count) in &counts {
                stmt.execute(params![
                    key.region,
                    format_week_start(key.week_start)?,
                    i64::from(key.hour),
                    key.origin_x,
                    key.origin_y,
                    key.dest_x,
                    key.dest_y,
                    i64::try_from(*count).context("bucket count overflows i64")?,
                ])?;
            }
        }

        tx.commit().context("failed to commit aggregate rebuild")?;
        Ok(counts.len())
    }

    // --- analytics ---

    /// Weekly trip-count statistics for aggregate rows whose origin cell
    /// falls inside the bounding box. Region is matched exactly. An empty
    /// match yields a zero-week, zero-average report rather than an error.
    #[allow(clippy::cast_precision_loss)]
    pub fn weekly_average(&self, region: &str, bbox: BoundingBox) -> Result<WeeklyAverageReport> {
        let (x_min, x_max) = ordered(cell_index(bbox.min_lng), cell_index(bbox.max_lng));
        let (y_min, y_max) = ordered(cell_index(bbox.min_lat), cell_index(bbox.max_lat));

        let mut stmt = self.conn.prepare(
            "SELECT week_start, SUM(trips_count)
             FROM trips_agg
             WHERE region = ?1
               AND origin_cell_x BETWEEN ?2 AND ?3
               AND origin_cell_y BETWEEN ?4 AND ?5
             GROUP BY week_start
             ORDER BY week_start ASC",
        )?;

        let rows = stmt.query_map(params![region, x_min, x_max, y_min, y_max], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut weekly_totals = Vec::new();
        for row in rows {
            let (week_start, raw_trips) = row.context("failed to read weekly total")?;
            let trips = u64::try_from(raw_trips)
                .with_context(|| format!("invalid weekly total: {raw_trips}"))?;
            weekly_totals.push(WeeklyTotal { week_start, trips });
        }

        let weeks_count = weekly_totals.len();
        let weekly_avg_trips = if weekly_totals.is_empty() {
            0.0
        } else {
            let total: u64 = weekly_totals.iter().map(|item| item.trips).sum();
            total as f64 / weeks_count as f64
        };

        Ok(WeeklyAverageReport {
            region: region.to_string(),
            bbox,
            weeks_count,
            weekly_avg_trips,
            weekly_totals,
        })
    }

    pub fn list_regions(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT region FROM trips_raw ORDER BY region ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut regions = Vec::new();
        for row in rows {
            regions.push(row.context("failed to read region")?);
        }
        Ok(regions)
    }
}

fn ordered(a: i64, b: i64) -> (i64, i64) {
    if a > b {
        (b, a)
    } else {
        (a, b)
    }
}

fn trip_record_from_row(row: &RawTripRow) -> Result<TripRecord, PipelineError> {
    let (origin_lng, origin_lat) = parse_point(&row.origin_coord)?;
    let (dest_lng, dest_lat) = parse_point(&row.destination_coord)?;
    Ok(TripRecord {
        region: row.region.trim().to_string(),
        datasource: row.datasource.trim().to_string(),
        trip_ts: parse_trip_timestamp(&row.datetime)?,
        origin_lng,
        origin_lat,
        dest_lng,
        dest_lat,
    })
}

// --- ingestion orchestrator ---

/// Registers a new run in `queued` for the given source file. The file must
/// exist; a missing file fails here, before any run-state mutation.
pub fn trigger_run(store: &SqliteTripStore, source: &Path) -> Result<Ulid> {
    if !source.exists() {
        return Err(PipelineError::SourceNotFound(source.display().to_string()).into());
    }

    let run_id = Ulid::new();
    store.create_run(run_id, RunStatus::Queued, now_utc())?;
    Ok(run_id)
}

/// Executes one ingestion run to completion or failure.
///
/// Sequence: mark the run `running` and publish a running event, rebuild the
/// aggregate from prior raw history (this run's rows are not yet present, so
/// the aggregate trails by one run), then stream the source file into raw
/// storage. The terminal run update and event carry the rows-loaded count or
/// the error text; rows committed before a failure stay in raw storage.
pub fn execute_run(
    store: &mut SqliteTripStore,
    bus: &EventBus,
    run_id: Ulid,
    source: &Path,
) -> Result<u64> {
    store.mark_run_running(run_id)?;
    bus.publish(run_id, &RunEvent::running(run_id));

    let mut rows_committed = 0_u64;
    let outcome = run_pipeline(store, source, &mut rows_committed);

    match outcome {
        Ok(()) => {
            store.finish_run_done(run_id, now_utc(), rows_committed)?;
            bus.publish(run_id, &RunEvent::done(run_id, rows_committed));
            Ok(rows_committed)
        }
        Err(err) => {
            let message = format!("{err:#}");
            store.finish_run_failed(run_id, now_utc(), &message, rows_committed)?;
            bus.publish(run_id, &RunEvent::failed(run_id, message));
            Err(err)
        }
    }
}

fn run_pipeline(store: &mut SqliteTripStore, source: &Path, rows_committed: &mut u64) -> Result<()> {
    store.rebuild_aggregate()?;
    store.load_source(source, rows_committed)?;
    Ok(())
}
