use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::suggest::{SuggestedTask, TaskSuggester};

const PRE_OP_MINUTES: Ms = 60;
const SURGERY_MINUTES: Ms = 120;
const POST_OP_MINUTES: Ms = 60;

/// `CASE-` plus eight uppercase characters taken from the random tail of a ULID.
pub fn new_case_id() -> String {
    let ulid = Ulid::new().to_string();
    format!("CASE-{}", &ulid[ulid.len() - 8..])
}

fn scheduled_task(case_id: &str, suffix: &str, name: &str, window: Span) -> SurgeryTask {
    SurgeryTask {
        id: format!("{case_id}-{suffix}"),
        case_id: case_id.to_string(),
        name: name.to_string(),
        status: TaskStatus::Scheduled,
        room_id: None,
        window: Some(window),
    }
}

/// Pre-op, surgery and post-op around the requested time `t`.
pub fn deterministic_plan(case_id: &str, t: Ms) -> Vec<SurgeryTask> {
    let surgery_end = t + SURGERY_MINUTES * MINUTE_MS;
    vec![
        scheduled_task(
            case_id,
            "PRE",
            "Pre-operative preparation",
            Span::new(t - PRE_OP_MINUTES * MINUTE_MS, t),
        ),
        scheduled_task(case_id, "SURG", "Main procedure", Span::new(t, surgery_end)),
        scheduled_task(
            case_id,
            "POST",
            "Post-operative recovery",
            Span::new(surgery_end, surgery_end + POST_OP_MINUTES * MINUTE_MS),
        ),
    ]
}

/// Anchor suggested offsets at `t`. Ids run `T1`, `T2`, ... in suggestion order.
pub fn plan_from_suggestion(case_id: &str, t: Ms, suggested: &[SuggestedTask]) -> Vec<SurgeryTask> {
    suggested
        .iter()
        .filter_map(|s| {
            let start = s.offset_start_minutes.checked_mul(MINUTE_MS)?.checked_add(t)?;
            let end = s.duration_minutes.checked_mul(MINUTE_MS)?.checked_add(start)?;
            Span::checked(start, end).map(|w| (s, w))
        })
        .enumerate()
        .map(|(i, (s, window))| scheduled_task(case_id, &format!("T{}", i + 1), &s.name, window))
        .collect()
}

/// Suggested plan when the suggester delivers, fixed three-phase plan otherwise.
pub async fn generate_plan(
    case_id: &str,
    input: &NewCaseInput,
    suggester: &dyn TaskSuggester,
) -> Vec<SurgeryTask> {
    match suggester.suggest(input).await {
        Ok(suggested) => {
            let tasks = plan_from_suggestion(case_id, input.requested_at, &suggested);
            info!("planned {} suggested tasks for case {case_id}", tasks.len());
            tasks
        }
        Err(e) => {
            warn!("using fixed plan for case {case_id} ({}): {e}", input.procedure_name);
            metrics::counter!(crate::observability::PLAN_FALLBACKS_TOTAL, "reason" => e.label())
                .increment(1);
            deterministic_plan(case_id, input.requested_at)
        }
    }
}

/// Build a new `planned` case with its task plan. Nothing is persisted here.
pub async fn create_case(
    input: NewCaseInput,
    now: Ms,
    suggester: &dyn TaskSuggester,
) -> SurgeryCase {
    let id = new_case_id();
    let tasks = generate_plan(&id, &input, suggester).await;
    let mut case = SurgeryCase {
        id,
        patient_name: input.patient_name,
        procedure_name: input.procedure_name,
        priority: input.priority,
        requested_at: input.requested_at,
        status: CaseStatus::Planned,
        created_at: now,
        updated_at: now,
        tasks,
    };
    case.sort_tasks();
    case
}
