use tracing::{info, warn};

use crate::model::*;

use super::{Store, StoreError};

/// Why a schedule request left the case as it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unschedulable {
    NoTasks,
    NoTimedTasks,
    NoRoomAvailable,
}

impl Unschedulable {
    pub fn as_str(&self) -> &'static str {
        match self {
            Unschedulable::NoTasks => "no_tasks",
            Unschedulable::NoTimedTasks => "no_timed_tasks",
            Unschedulable::NoRoomAvailable => "no_room_available",
        }
    }
}

impl std::fmt::Display for Unschedulable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Unschedulable::NoTasks => write!(f, "case has no tasks"),
            Unschedulable::NoTimedTasks => write!(f, "case has no timed tasks"),
            Unschedulable::NoRoomAvailable => write!(f, "no operating room available"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled { case: SurgeryCase, room: OrRoom },
    Unchanged { case: SurgeryCase, reason: Unschedulable },
}

impl ScheduleOutcome {
    pub fn case(&self) -> &SurgeryCase {
        match self {
            ScheduleOutcome::Scheduled { case, .. } | ScheduleOutcome::Unchanged { case, .. } => {
                case
            }
        }
    }
}

impl Store {
    /// Whole-case first-fit: every task of the case goes into one room that is
    /// free for the case envelope. `None` when the case doesn't exist.
    pub async fn schedule_case(&self, case_id: &str) -> Result<Option<ScheduleOutcome>, StoreError> {
        self.schedule_case_at(case_id, now_ms()).await
    }

    pub async fn schedule_case_at(
        &self,
        case_id: &str,
        now: Ms,
    ) -> Result<Option<ScheduleOutcome>, StoreError> {
        let _writer = self.writer.lock().await;

        let Some(case) = self.cases.get(case_id).map(|c| c.value().clone()) else {
            warn!("schedule: case {case_id} not found");
            return Ok(None);
        };
        let mut case = self.refresh_and_persist_locked(case, now).await?;
        case.sort_tasks();

        if case.tasks.is_empty() {
            warn!("schedule: case {case_id} has no tasks");
            return Ok(Some(unchanged(case, Unschedulable::NoTasks)));
        }
        let Some(envelope) = case.envelope() else {
            warn!("schedule: case {case_id} has no timed tasks");
            return Ok(Some(unchanged(case, Unschedulable::NoTimedTasks)));
        };

        // Lookup and assignment share the writer critical section.
        let Some(room) = self.find_available_room(&envelope).await else {
            warn!(
                "schedule: no room free for case {case_id} in [{}, {})",
                format_iso(envelope.start),
                format_iso(envelope.end)
            );
            return Ok(Some(unchanged(case, Unschedulable::NoRoomAvailable)));
        };

        for task in &mut case.tasks {
            task.room_id = Some(room.id.clone());
            task.status = TaskStatus::Scheduled;
        }
        case.updated_at = now;
        self.add_or_replace_locked(case.clone()).await?;

        info!("case {case_id} scheduled in {}", room.id);
        metrics::counter!(crate::observability::CASES_SCHEDULED_TOTAL).increment(1);
        Ok(Some(ScheduleOutcome::Scheduled { case, room }))
    }
}

fn unchanged(case: SurgeryCase, reason: Unschedulable) -> ScheduleOutcome {
    metrics::counter!(crate::observability::UNSCHEDULABLE_TOTAL, "reason" => reason.as_str())
        .increment(1);
    ScheduleOutcome::Unchanged { case, reason }
}
