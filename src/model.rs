use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` unless `start < end`.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// `self.start < other.end AND self.end > other.start`
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Time ─────────────────────────────────────────────────────────

pub fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// RFC 3339 in UTC with millisecond precision; sorts lexicographically.
pub fn format_iso(ms: Ms) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| ms.to_string())
}

/// Accepts RFC 3339, or a naive `YYYY-MM-DD[T ]HH:MM[:SS[.fff]]` read as UTC.
pub fn parse_iso(s: &str) -> Option<Ms> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    const NAIVE: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ];
    NAIVE
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc().timestamp_millis())
}

/// Deserialize a timestamp given either as ISO-8601 text or as Unix ms.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Ms, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Ms(i64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Ms(ms) => Ok(ms),
        Raw::Text(s) => parse_iso(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid datetime: {s}"))),
    }
}

// ── Enums ────────────────────────────────────────────────────────

/// Clinical priority. Informational only: allocation never looks at it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Emergency,
    Urgent,
    #[default]
    Elective,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Emergency => "emergency",
            Priority::Urgent => "urgent",
            Priority::Elective => "elective",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "emergency" => Some(Priority::Emergency),
            "urgent" => Some(Priority::Urgent),
            "elective" => Some(Priority::Elective),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    New,
    Planned,
    InProgress,
    Completed,
    Cancelled,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::New => "new",
            CaseStatus::Planned => "planned",
            CaseStatus::InProgress => "in_progress",
            CaseStatus::Completed => "completed",
            CaseStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Scheduled,
    InProgress,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

// ── Cases and tasks ──────────────────────────────────────────────

/// A time-boxed unit of work within a case. `window` carries both bounds or neither.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurgeryTask {
    pub id: String,
    pub case_id: String,
    pub name: String,
    pub status: TaskStatus,
    pub room_id: Option<String>,
    pub window: Option<Span>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurgeryCase {
    pub id: String,
    pub patient_name: String,
    pub procedure_name: String,
    pub priority: Priority,
    pub requested_at: Ms,
    pub status: CaseStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub tasks: Vec<SurgeryTask>,
}

impl SurgeryCase {
    /// `[min start, max end]` over the tasks that have a window.
    pub fn envelope(&self) -> Option<Span> {
        let mut windows = self.tasks.iter().filter_map(|t| t.window);
        let first = windows.next()?;
        Some(windows.fold(first, |acc, w| {
            Span::new(acc.start.min(w.start), acc.end.max(w.end))
        }))
    }

    /// Order tasks by (window start, id); tasks without a window come first.
    pub fn sort_tasks(&mut self) {
        self.tasks
            .sort_by(|a, b| {
                let ka = a.window.map(|w| w.start);
                let kb = b.window.map(|w| w.start);
                ka.cmp(&kb).then_with(|| a.id.cmp(&b.id))
            });
    }
}

/// What a caller supplies to register a case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCaseInput {
    pub patient_name: String,
    pub procedure_name: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(rename = "requested_datetime", deserialize_with = "deserialize_timestamp")]
    pub requested_at: Ms,
}

impl NewCaseInput {
    pub fn validate(&self) -> Result<(), String> {
        use crate::limits::*;
        if self.patient_name.trim().is_empty() {
            return Err("patient_name must not be empty".into());
        }
        if self.procedure_name.trim().is_empty() {
            return Err("procedure_name must not be empty".into());
        }
        if self.patient_name.len() > MAX_NAME_LEN || self.procedure_name.len() > MAX_NAME_LEN {
            return Err("name too long".into());
        }
        if self.requested_at < MIN_VALID_TIMESTAMP_MS || self.requested_at > MAX_VALID_TIMESTAMP_MS {
            return Err("requested_datetime out of range".into());
        }
        Ok(())
    }
}

// ── Rooms ────────────────────────────────────────────────────────

pub const ROOM_COUNT: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrRoom {
    pub id: String,
    pub name: String,
}

/// `OR-1` .. `OR-5`, in allocation order.
pub fn default_rooms() -> Vec<OrRoom> {
    (1..=ROOM_COUNT)
        .map(|n| OrRoom {
            id: format!("OR-{n}"),
            name: format!("Operating Room {n}"),
        })
        .collect()
}

/// A timed task committed to a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub task_id: String,
    pub case_id: String,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: OrRoom,
    /// Sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl RoomState {
    pub fn new(room: OrRoom) -> Self {
        Self {
            room,
            reservations: Vec::new(),
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    /// Drop every reservation held by `case_id`. Returns how many were removed.
    pub fn remove_case(&mut self, case_id: &str) -> usize {
        let before = self.reservations.len();
        self.reservations.retain(|r| r.case_id != case_id);
        before - self.reservations.len()
    }

    /// Reservations whose span overlaps the query window.
    /// Everything at index >= right_bound starts at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    pub fn is_free(&self, query: &Span) -> bool {
        self.overlapping(query).next().is_none()
    }
}

// ── Notifications ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub seq: u64,
    pub at: Ms,
    pub message: String,
}

/// Aggregate view served by the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub total_cases: usize,
    pub total_rooms: usize,
    pub cases_by_status: BTreeMap<String, usize>,
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// Full case row plus its complete task set; replaces any previous version.
    CaseUpserted { case: SurgeryCase },
    CaseDeleted { id: String },
    NotificationAdded { seq: u64, at: Ms, message: String },
}
