//! Wall-clock status derivation for cases and their tasks.
//!
//! `derive` is pure. `apply` writes the derived statuses into a case and
//! reports whether anything moved; the store persists only in that case.

use crate::model::*;

use super::{Store, StoreError};

/// Statuses derived for one case at one instant. `task_statuses[i]` belongs to `tasks[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refresh {
    pub task_statuses: Vec<TaskStatus>,
    pub case_status: CaseStatus,
}

fn task_status_at(task: &SurgeryTask, now: Ms) -> TaskStatus {
    match task.window {
        Some(w) if now >= w.end => TaskStatus::Done,
        Some(w) if w.contains_instant(now) => TaskStatus::InProgress,
        Some(_) => TaskStatus::Scheduled,
        None => task.status,
    }
}

/// Total over any task list, including an empty one.
pub fn derive(tasks: &[SurgeryTask], now: Ms) -> Refresh {
    let task_statuses: Vec<TaskStatus> = tasks.iter().map(|t| task_status_at(t, now)).collect();

    let any_running = task_statuses.contains(&TaskStatus::InProgress);
    // Untimed tasks don't count toward completeness; a list with only untimed tasks completes.
    let all_timed_done = tasks
        .iter()
        .zip(&task_statuses)
        .filter(|(t, _)| t.window.is_some())
        .all(|(_, s)| *s == TaskStatus::Done);

    let case_status = if any_running {
        CaseStatus::InProgress
    } else if !tasks.is_empty() && all_timed_done {
        CaseStatus::Completed
    } else {
        CaseStatus::Planned
    };

    Refresh {
        task_statuses,
        case_status,
    }
}

/// Returns true when any status changed. `updated_at` moves only then.
pub fn apply(case: &mut SurgeryCase, refresh: &Refresh, now: Ms) -> bool {
    let mut changed = case.status != refresh.case_status;
    case.status = refresh.case_status;
    for (task, status) in case.tasks.iter_mut().zip(&refresh.task_statuses) {
        if task.status != *status {
            task.status = *status;
            changed = true;
        }
    }
    if changed {
        case.updated_at = now;
    }
    changed
}

impl Store {
    /// Refresh a case and persist the result if it moved. Caller holds `writer`.
    pub(super) async fn refresh_and_persist_locked(
        &self,
        mut case: SurgeryCase,
        now: Ms,
    ) -> Result<SurgeryCase, StoreError> {
        let refresh = derive(&case.tasks, now);
        if apply(&mut case, &refresh, now) {
            tracing::debug!("case {} refreshed to {}", case.id, case.status.as_str());
            self.commit(Event::CaseUpserted { case: case.clone() }).await?;
        }
        Ok(case)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Ms = 1_763_197_200_000;

    fn task(id: &str, window: Option<(Ms, Ms)>, status: TaskStatus) -> SurgeryTask {
        SurgeryTask {
            id: id.into(),
            case_id: "CASE-1".into(),
            name: id.into(),
            status,
            room_id: None,
            window: window.map(|(s, e)| Span::new(s, e)),
        }
    }

    fn timed(id: &str, start: Ms, end: Ms) -> SurgeryTask {
        task(id, Some((start, end)), TaskStatus::Scheduled)
    }

    #[test]
    fn before_during_after_window() {
        let tasks = vec![timed("a", T, T + 100)];
        assert_eq!(derive(&tasks, T - 1).task_statuses, vec![TaskStatus::Scheduled]);
        assert_eq!(derive(&tasks, T - 1).case_status, CaseStatus::Planned);
        assert_eq!(derive(&tasks, T).task_statuses, vec![TaskStatus::InProgress]);
        assert_eq!(derive(&tasks, T).case_status, CaseStatus::InProgress);
        assert_eq!(derive(&tasks, T + 100).task_statuses, vec![TaskStatus::Done]);
        assert_eq!(derive(&tasks, T + 100).case_status, CaseStatus::Completed);
    }

    #[test]
    fn in_progress_wins_over_done() {
        let tasks = vec![timed("a", T - 200, T - 100), timed("b", T - 50, T + 50)];
        let r = derive(&tasks, T);
        assert_eq!(r.task_statuses, vec![TaskStatus::Done, TaskStatus::InProgress]);
        assert_eq!(r.case_status, CaseStatus::InProgress);
    }

    #[test]
    fn gap_between_tasks_is_planned() {
        let tasks = vec![timed("a", T - 200, T - 100), timed("b", T + 100, T + 200)];
        assert_eq!(derive(&tasks, T).case_status, CaseStatus::Planned);
    }

    #[test]
    fn untimed_tasks_keep_status_and_are_ignored() {
        let tasks = vec![
            task("u", None, TaskStatus::Pending),
            timed("a", T - 200, T - 100),
        ];
        let r = derive(&tasks, T);
        assert_eq!(r.task_statuses, vec![TaskStatus::Pending, TaskStatus::Done]);
        assert_eq!(r.case_status, CaseStatus::Completed);
    }

    #[test]
    fn only_untimed_tasks_completes() {
        let tasks = vec![task("u", None, TaskStatus::Scheduled)];
        assert_eq!(derive(&tasks, T).case_status, CaseStatus::Completed);
    }

    #[test]
    fn empty_task_list_is_planned() {
        let r = derive(&[], T);
        assert!(r.task_statuses.is_empty());
        assert_eq!(r.case_status, CaseStatus::Planned);
    }

    #[test]
    fn apply_bumps_updated_at_only_on_change() {
        let mut case = SurgeryCase {
            id: "CASE-1".into(),
            patient_name: "p".into(),
            procedure_name: "q".into(),
            priority: Priority::Elective,
            requested_at: T,
            status: CaseStatus::Planned,
            created_at: 1,
            updated_at: 1,
            tasks: vec![timed("a", T + 10, T + 20)],
        };
        let r = derive(&case.tasks, T);
        assert!(!apply(&mut case, &r, T));
        assert_eq!(case.updated_at, 1);

        let r = derive(&case.tasks, T + 15);
        assert!(apply(&mut case, &r, T + 15));
        assert_eq!(case.updated_at, T + 15);
        assert_eq!(case.status, CaseStatus::InProgress);
        assert_eq!(case.tasks[0].status, TaskStatus::InProgress);
    }
}
