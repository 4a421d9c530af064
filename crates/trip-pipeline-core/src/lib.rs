//! Domain types and pure logic for the trip ingestion pipeline.
//!
//! Everything storage-independent lives here: run lifecycle types, geometry
//! and timestamp parsing, spatial cell quantization, week bucketing, and the
//! in-process run-event channel. The sqlite store builds on these primitives.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Mutex, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, PrimitiveDateTime, UtcOffset};
use ulid::Ulid;

/// Edge length of one spatial cell, in degrees of longitude/latitude.
pub const CELL_SIZE_DEG: f64 = 0.01;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PipelineError {
    #[error("source file not found: {0}")]
    SourceNotFound(String),
    #[error("malformed geometry: {0}")]
    MalformedGeometry(String),
    #[error("malformed timestamp: {0}")]
    MalformedTimestamp(String),
    #[error("unknown run: {0}")]
    UnknownRun(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// `done` and `failed` are terminal: the orchestrator never mutates a run
    /// past either, and no further events follow for it.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// One execution of the ingestion pipeline, tracked in the run registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestionRun {
    pub run_id: Ulid,
    pub status: RunStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub rows_loaded: u64,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// A single validated trip row from the source file. Append-only once stored;
/// duplicate logical trips are accepted and counted twice.
#[derive(Debug, Clone, PartialEq)]
pub struct TripRecord {
    pub region: String,
    pub datasource: String,
    pub trip_ts: OffsetDateTime,
    pub origin_lng: f64,
    pub origin_lat: f64,
    pub dest_lng: f64,
    pub dest_lat: f64,
}

/// Grouping key of one aggregate bucket. `BTreeMap` ordering over this key
/// gives the aggregate a deterministic emission order.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BucketKey {
    pub region: String,
    pub week_start: Date,
    pub hour: u8,
    pub origin_x: i64,
    pub origin_y: i64,
    pub dest_x: i64,
    pub dest_y: i64,
}

/// Ephemeral progress notification for one run. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunEvent {
    pub run_id: Ulid,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_loaded: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunEvent {
    #[must_use]
    pub fn running(run_id: Ulid) -> Self {
        Self {
            run_id,
            status: RunStatus::Running,
            rows_loaded: None,
            error: None,
        }
    }

    #[must_use]
    pub fn done(run_id: Ulid, rows_loaded: u64) -> Self {
        Self {
            run_id,
            status: RunStatus::Done,
            rows_loaded: Some(rows_loaded),
            error: None,
        }
    }

    #[must_use]
    pub fn failed(run_id: Ulid, error: impl Into<String>) -> Self {
        Self {
            run_id,
            status: RunStatus::Failed,
            rows_loaded: None,
            error: Some(error.into()),
        }
    }
}

/// In-process, per-run fan-out of [`RunEvent`] values.
///
/// Delivery is best-effort and at-most-once: a subscriber registered after an
/// event was published never sees it, and a publish never blocks on a slow or
/// dropped consumer. Queues are unbounded; a run emits at most three events,
/// so an unread queue stays small.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<Ulid, Vec<Sender<RunEvent>>>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new queue for `run_id` and hands back its receiving end.
    pub fn subscribe(&self, run_id: Ulid) -> Receiver<RunEvent> {
        let (tx, rx) = channel();
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.entry(run_id).or_default().push(tx);
        rx
    }

    /// Delivers `event` to every queue currently registered for `run_id`.
    /// Disconnected receivers are skipped silently.
    pub fn publish(&self, run_id: Ulid, event: &RunEvent) {
        let subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(queues) = subscribers.get(&run_id) {
            for queue in queues {
                let _ = queue.send(event.clone());
            }
        }
    }
}

// Tokens stay loose (digits, dots, sign) and the f64 parse does the real
// validation, so fraction-only forms like `.5` pass.
const POINT_PATTERN: &str = r"^POINT\s*\(\s*([-+]?[0-9.]+)\s+([-+]?[0-9.]+)\s*\)$";

fn point_regex() -> &'static Regex {
    static POINT_RE: OnceLock<Regex> = OnceLock::new();
    POINT_RE.get_or_init(|| match Regex::new(POINT_PATTERN) {
        Ok(re) => re,
        Err(err) => panic!("invalid built-in point pattern: {err}"),
    })
}

/// Parses a `POINT (<lng> <lat>)` geometry string into `(lng, lat)`.
///
/// # Errors
/// Returns [`PipelineError::MalformedGeometry`] quoting the offending value
/// when the pattern or the numeric tokens do not parse.
pub fn parse_point(value: &str) -> Result<(f64, f64), PipelineError> {
    let malformed = || PipelineError::MalformedGeometry(value.to_string());
    let captures = point_regex()
        .captures(value.trim())
        .ok_or_else(malformed)?;
    let lng: f64 = captures[1].parse().map_err(|_| malformed())?;
    let lat: f64 = captures[2].parse().map_err(|_| malformed())?;
    Ok((lng, lat))
}

/// Maps a coordinate to its cell index: `floor(value / 0.01)`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn cell_index(value: f64) -> i64 {
    (value / CELL_SIZE_DEG).floor() as i64
}

const NAIVE_FORMATS: [&'static [BorrowedFormatItem<'static>]; 4] = [
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]"),
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]"),
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
];

/// Parses a trip timestamp from the source file.
///
/// Accepts RFC3339 (a trailing `Z` is normalized to an explicit `+00:00`
/// offset first) and the naive `YYYY-MM-DD[T| ]HH:MM:SS[.frac]` forms found
/// in real exports; naive values are assumed UTC. Offset-bearing values keep
/// their offset: week and hour bucketing reads the wall clock of the
/// timestamp as written, not its UTC projection.
///
/// # Errors
/// Returns [`PipelineError::MalformedTimestamp`] quoting the value when no
/// accepted form parses.
pub fn parse_trip_timestamp(value: &str) -> Result<OffsetDateTime, PipelineError> {
    let trimmed = value.trim();
    let normalized = match trimmed.strip_suffix('Z') {
        Some(prefix) => format!("{prefix}+00:00"),
        None => trimmed.to_string(),
    };

    if let Ok(parsed) = OffsetDateTime::parse(&normalized, &Rfc3339) {
        return Ok(parsed);
    }

    for format in NAIVE_FORMATS {
        if let Ok(parsed) = PrimitiveDateTime::parse(trimmed, format) {
            return Ok(parsed.assume_utc());
        }
    }

    Err(PipelineError::MalformedTimestamp(value.to_string()))
}

/// The Monday-aligned start of the ISO week containing `ts`.
#[must_use]
pub fn week_start(ts: OffsetDateTime) -> Date {
    let date = ts.date();
    let days_from_monday = i64::from(date.weekday().number_days_from_monday());
    date.saturating_sub(Duration::days(days_from_monday))
}

const WEEK_START_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]");

/// Formats a week-start date as `YYYY-MM-DD`, the textual key used by the
/// aggregate table and the analytics grouping.
///
/// # Errors
/// Returns [`PipelineError::MalformedTimestamp`] when formatting fails.
pub fn format_week_start(date: Date) -> Result<String, PipelineError> {
    date.format(WEEK_START_FORMAT).map_err(|err| {
        PipelineError::MalformedTimestamp(format!("failed to format week start: {err}"))
    })
}

/// Computes the aggregate grouping key for one trip.
#[must_use]
pub fn bucket_key(record: &TripRecord) -> BucketKey {
    BucketKey {
        region: record.region.clone(),
        week_start: week_start(record.trip_ts),
        hour: record.trip_ts.hour(),
        origin_x: cell_index(record.origin_lng),
        origin_y: cell_index(record.origin_lat),
        dest_x: cell_index(record.dest_lng),
        dest_y: cell_index(record.dest_lat),
    }
}

/// Parses an RFC3339 timestamp, normalizing the result to UTC.
///
/// # Errors
/// Returns [`PipelineError::MalformedTimestamp`] when parsing fails.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, PipelineError> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map(|parsed| parsed.to_offset(UtcOffset::UTC))
        .map_err(|err| PipelineError::MalformedTimestamp(format!("{value}: {err}")))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`PipelineError::MalformedTimestamp`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, PipelineError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|err| {
            PipelineError::MalformedTimestamp(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

/// Formats a timestamp as RFC3339 keeping its original offset, so a stored
/// trip timestamp round-trips with its wall clock intact.
///
/// # Errors
/// Returns [`PipelineError::MalformedTimestamp`] when formatting fails.
pub fn format_rfc3339_offset(value: OffsetDateTime) -> Result<String, PipelineError> {
    value.format(&Rfc3339).map_err(|err| {
        PipelineError::MalformedTimestamp(format!("failed to format RFC3339 timestamp: {err}"))
    })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::TryRecvError;

    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        must_ok(parse_trip_timestamp(value))
    }

    fn fixture_record(ts: &str, origin: (f64, f64), dest: (f64, f64)) -> TripRecord {
        TripRecord {
            region: "NYC".to_string(),
            datasource: "funky_town_source".to_string(),
            trip_ts: must_utc(ts),
            origin_lng: origin.0,
            origin_lat: origin.1,
            dest_lng: dest.0,
            dest_lat: dest.1,
        }
    }

    #[test]
    fn point_parse_round_trips_textual_form() {
        let (lng, lat) = must_ok(parse_point("POINT (-74.0021 40.7128)"));
        assert_eq!(format!("POINT ({lng} {lat})"), "POINT (-74.0021 40.7128)");
    }

    #[test]
    fn point_parse_tolerates_whitespace() {
        let (lng, lat) = must_ok(parse_point("  POINT(  7.5  -12.25 ) "));
        assert!((lng - 7.5).abs() < f64::EPSILON);
        assert!((lat + 12.25).abs() < f64::EPSILON);
    }

    #[test]
    fn point_parse_rejects_missing_parentheses_and_quotes_value() {
        let err = match parse_point("POINT 1 2") {
            Ok(_) => panic!("expected malformed geometry"),
            Err(err) => err,
        };
        assert_eq!(err, PipelineError::MalformedGeometry("POINT 1 2".to_string()));
        assert!(err.to_string().contains("POINT 1 2"));
    }

    #[test]
    fn point_parse_accepts_fraction_only_coordinates() {
        let (lng, lat) = must_ok(parse_point("POINT (.5 -.25)"));
        assert!((lng - 0.5).abs() < f64::EPSILON);
        assert!((lat + 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn point_parse_rejects_non_numeric_tokens() {
        assert!(parse_point("POINT (a b)").is_err());
        assert!(parse_point("POINT (1.2.3 4)").is_err());
        assert!(parse_point("POINT (. .)").is_err());
    }

    #[test]
    fn cell_index_floors_toward_negative_infinity() {
        assert_eq!(cell_index(0.009), 0);
        assert_eq!(cell_index(0.001), 0);
        assert_eq!(cell_index(-0.001), -1);
        assert_eq!(cell_index(0.01), 1);
        assert_eq!(cell_index(-74.0021), -7401);
    }

    #[test]
    fn timestamp_parse_accepts_z_suffix_and_naive_forms() {
        let zulu = must_utc("2018-05-28T09:03:40Z");
        let offset = must_utc("2018-05-28T09:03:40+00:00");
        let spaced = must_utc("2018-05-28 09:03:40");
        let fractional = must_utc("2018-05-28 09:03:40.5");
        assert_eq!(zulu, offset);
        assert_eq!(zulu, spaced);
        assert_eq!(fractional - zulu, Duration::milliseconds(500));
    }

    #[test]
    fn offset_timestamps_bucket_by_their_wall_clock() {
        // 01:00 local on Monday 2018-05-28; the UTC instant is still Sunday
        // evening, but bucketing reads the clock as written.
        let ts = must_utc("2018-05-28T01:00:00+05:00");
        assert_eq!(ts.hour(), 1);
        assert_eq!(must_ok(format_week_start(week_start(ts))), "2018-05-28");
        assert_eq!(
            must_ok(format_rfc3339_offset(ts)),
            "2018-05-28T01:00:00+05:00"
        );
    }

    #[test]
    fn timestamp_parse_rejects_garbage() {
        let err = match parse_trip_timestamp("not-a-timestamp") {
            Ok(_) => panic!("expected malformed timestamp"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("not-a-timestamp"));
    }

    #[test]
    fn week_start_is_the_preceding_monday() {
        // 2018-05-30 was a Wednesday; its week starts on Monday 2018-05-28.
        let wednesday = week_start(must_utc("2018-05-30 15:00:00"));
        let monday = week_start(must_utc("2018-05-28 00:00:00"));
        assert_eq!(wednesday, monday);
        assert_eq!(wednesday.weekday(), time::Weekday::Monday);
        assert_eq!(must_ok(format_week_start(wednesday)), "2018-05-28");
    }

    #[test]
    fn bucket_key_quantizes_both_endpoints() {
        let record = fixture_record("2018-05-30 09:15:00", (14.4893, 50.0041), (14.6, 50.1));
        let key = bucket_key(&record);
        assert_eq!(key.hour, 9);
        assert_eq!(key.origin_x, 1448);
        assert_eq!(key.origin_y, 5000);
        assert_eq!(key.dest_x, 1460);
        assert_eq!(key.dest_y, 5010);
        assert_eq!(must_ok(format_week_start(key.week_start)), "2018-05-28");
    }

    #[test]
    fn same_cell_iff_same_hundredth_degree_square() {
        let a = fixture_record("2018-05-30 09:15:00", (14.4891, 50.0041), (14.6, 50.1));
        let b = fixture_record("2018-05-30 09:45:00", (14.4899, 50.0049), (14.6009, 50.1001));
        assert_eq!(bucket_key(&a), bucket_key(&b));
    }

    #[test]
    fn run_status_string_round_trip() {
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Done,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("cancelled"), None);
        assert!(RunStatus::Done.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Queued.is_terminal());
    }

    #[test]
    fn event_bus_fans_out_to_all_subscribers() {
        let bus = EventBus::new();
        let run_id = Ulid::new();
        let first = bus.subscribe(run_id);
        let second = bus.subscribe(run_id);

        bus.publish(run_id, &RunEvent::running(run_id));

        assert_eq!(must_ok(first.try_recv()), RunEvent::running(run_id));
        assert_eq!(must_ok(second.try_recv()), RunEvent::running(run_id));
    }

    #[test]
    fn event_bus_does_not_replay_to_late_subscribers() {
        let bus = EventBus::new();
        let run_id = Ulid::new();

        bus.publish(run_id, &RunEvent::running(run_id));
        bus.publish(run_id, &RunEvent::done(run_id, 7));

        let late = bus.subscribe(run_id);
        assert_eq!(late.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn event_bus_isolates_runs_and_survives_dropped_receivers() {
        let bus = EventBus::new();
        let run_a = Ulid::new();
        let run_b = Ulid::new();
        let observer_a = bus.subscribe(run_a);
        let dropped = bus.subscribe(run_a);
        drop(dropped);

        bus.publish(run_a, &RunEvent::done(run_a, 3));
        bus.publish(run_b, &RunEvent::failed(run_b, "boom"));

        assert_eq!(must_ok(observer_a.try_recv()), RunEvent::done(run_a, 3));
        assert_eq!(observer_a.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn run_event_json_omits_absent_payload_fields() {
        let run_id = Ulid::new();
        let running = must_ok(serde_json::to_string(&RunEvent::running(run_id)));
        assert!(!running.contains("rows_loaded"));
        assert!(!running.contains("error"));

        let done = must_ok(serde_json::to_string(&RunEvent::done(run_id, 42)));
        assert!(done.contains("\"rows_loaded\":42"));

        let failed = must_ok(serde_json::to_string(&RunEvent::failed(run_id, "nope")));
        assert!(failed.contains("\"error\":\"nope\""));
    }
}
