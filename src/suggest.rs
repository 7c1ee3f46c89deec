//! External task suggestion for new cases.
//!
//! A suggester proposes a list of relative tasks (name, offset from the
//! requested time, duration). Any failure is reported as a `SuggestError`;
//! the planner falls back to its fixed three-phase plan.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

use crate::limits::*;
use crate::model::{format_iso, NewCaseInput};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
const REQUESTED_TASKS: usize = 10;
const DEFAULT_DURATION_MINUTES: i64 = 60;

/// One proposed task, relative to the case's requested time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuggestedTask {
    pub name: String,
    pub offset_start_minutes: i64,
    pub duration_minutes: i64,
}

#[derive(Debug)]
pub enum SuggestError {
    /// No suggester configured.
    Unavailable,
    Transport(String),
    Malformed(String),
    Empty,
}

impl std::fmt::Display for SuggestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SuggestError::Unavailable => write!(f, "task suggester not configured"),
            SuggestError::Transport(e) => write!(f, "suggestion request failed: {e}"),
            SuggestError::Malformed(e) => write!(f, "malformed suggestion: {e}"),
            SuggestError::Empty => write!(f, "suggestion contained no usable tasks"),
        }
    }
}

impl std::error::Error for SuggestError {}

impl SuggestError {
    pub fn label(&self) -> &'static str {
        match self {
            SuggestError::Unavailable => "unavailable",
            SuggestError::Transport(_) => "transport",
            SuggestError::Malformed(_) => "malformed",
            SuggestError::Empty => "empty",
        }
    }
}

#[async_trait]
pub trait TaskSuggester: Send + Sync {
    async fn suggest(&self, input: &NewCaseInput) -> Result<Vec<SuggestedTask>, SuggestError>;
}

/// Used when no API key is configured.
#[derive(Debug, Default)]
pub struct Unconfigured;

#[async_trait]
impl TaskSuggester for Unconfigured {
    async fn suggest(&self, _input: &NewCaseInput) -> Result<Vec<SuggestedTask>, SuggestError> {
        Err(SuggestError::Unavailable)
    }
}

// ── Gemini ───────────────────────────────────────────────

#[derive(Serialize)]
struct GenerateRequest {
    contents: Vec<RequestContent>,
}

#[derive(Serialize)]
struct RequestContent {
    parts: Vec<RequestPart>,
}

#[derive(Serialize)]
struct RequestPart {
    text: String,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

/// Gemini `generateContent` over HTTPS.
#[derive(Clone)]
pub struct GeminiSuggester {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GeminiSuggester {
    pub fn new(api_key: String, model: String, timeout: Duration) -> Result<Self, SuggestError> {
        Self::with_base_url(GEMINI_BASE_URL, api_key, model, timeout)
    }

    pub fn with_base_url(
        base_url: &str,
        api_key: String,
        model: String,
        timeout: Duration,
    ) -> Result<Self, SuggestError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SuggestError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
        })
    }

    async fn generate(&self, prompt: String) -> Result<String, SuggestError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let request = GenerateRequest {
            contents: vec![RequestContent {
                parts: vec![RequestPart { text: prompt }],
            }],
        };

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| SuggestError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SuggestError::Transport(format!("status {status}: {body}")));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| SuggestError::Malformed(e.to_string()))?;

        let text: String = body
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(SuggestError::Malformed("response had no text".into()));
        }
        Ok(text)
    }
}

#[async_trait]
impl TaskSuggester for GeminiSuggester {
    async fn suggest(&self, input: &NewCaseInput) -> Result<Vec<SuggestedTask>, SuggestError> {
        info!(
            "requesting {REQUESTED_TASKS}-task plan from {} for '{}'",
            self.model, input.procedure_name
        );
        let raw = self.generate(build_prompt(input)).await?;
        debug!("raw suggestion: {raw}");
        let tasks = parse_suggestion(&raw)?;
        info!("suggester proposed {} tasks for '{}'", tasks.len(), input.procedure_name);
        Ok(tasks)
    }
}

pub fn build_prompt(input: &NewCaseInput) -> String {
    format!(
        "You are an expert surgical scheduler at a teaching hospital.\n\
         \n\
         Surgery details:\n\
         - Patient: {patient}\n\
         - Procedure: {procedure}\n\
         - Priority (emergency/urgent/elective): {priority}\n\
         - Requested date/time (reference): {requested}\n\
         \n\
         Produce a complete perioperative workflow tailored to this procedure.\n\
         Return EXACTLY one valid JSON object of the form:\n\
         {{\"tasks\": [{{\"name\": \"Clear clinical task name\", \"offset_start_minutes\": -120, \"duration_minutes\": 45}}]}}\n\
         \n\
         Rules:\n\
         - Return EXACTLY {count} tasks in \"tasks\".\n\
         - Cover the whole flow: pre-operative assessment, patient preparation, transfer, \
         anesthesia, main procedure, closure, transfer to recovery, initial monitoring.\n\
         - \"offset_start_minutes\" is relative to the requested time: negative before it, positive after.\n\
         - \"duration_minutes\" is a positive integer.\n\
         - Task names should mention the specific procedure.\n\
         - No text outside the JSON.",
        patient = input.patient_name,
        procedure = input.procedure_name,
        priority = input.priority.as_str(),
        requested = format_iso(input.requested_at),
        count = REQUESTED_TASKS,
    )
}

/// Strip code fences and surrounding prose, keeping the outermost `{...}`.
pub fn extract_json_block(raw: &str) -> &str {
    let mut text = raw.trim();
    if text.starts_with("```") {
        // drop the opening fence line and the closing fence
        if let Some(nl) = text.find('\n') {
            text = &text[nl + 1..];
        }
        if let Some(end) = text.rfind("```") {
            text = &text[..end];
        }
        text = text.trim();
    }
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end >= start => &text[start..=end],
        _ => text,
    }
}

fn json_int(value: Option<&Json>, default: i64) -> Option<i64> {
    match value {
        None | Some(Json::Null) => Some(default),
        Some(Json::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Json::String(s)) => s.trim().parse().ok(),
        Some(_) => None,
    }
}

fn json_name(value: Option<&Json>) -> String {
    match value {
        Some(Json::String(s)) => s.trim().to_string(),
        Some(Json::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// Turn a raw suggestion into validated tasks. Unusable entries are skipped.
pub fn parse_suggestion(raw: &str) -> Result<Vec<SuggestedTask>, SuggestError> {
    let cleaned = extract_json_block(raw);
    let parsed: Json =
        serde_json::from_str(cleaned).map_err(|e| SuggestError::Malformed(e.to_string()))?;

    let entries = match parsed.get("tasks") {
        Some(Json::Array(entries)) if !entries.is_empty() => entries,
        _ => return Err(SuggestError::Malformed("missing or empty \"tasks\" array".into())),
    };

    let mut tasks = Vec::new();
    for entry in entries {
        let name = json_name(entry.get("name"));
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            continue;
        }
        let Some(offset) = json_int(entry.get("offset_start_minutes"), 0) else {
            continue;
        };
        let Some(duration) = json_int(entry.get("duration_minutes"), DEFAULT_DURATION_MINUTES)
        else {
            continue;
        };
        if !(-MAX_OFFSET_MINUTES..=MAX_OFFSET_MINUTES).contains(&offset)
            || !(1..=MAX_DURATION_MINUTES).contains(&duration)
        {
            continue;
        }
        tasks.push(SuggestedTask {
            name,
            offset_start_minutes: offset,
            duration_minutes: duration,
        });
        if tasks.len() == MAX_SUGGESTED_TASKS {
            break;
        }
    }

    if tasks.is_empty() {
        return Err(SuggestError::Empty);
    }
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Priority;

    #[test]
    fn extract_from_fenced_block() {
        let raw = "```json\n{\"tasks\": []}\n```";
        assert_eq!(extract_json_block(raw), "{\"tasks\": []}");
    }

    #[test]
    fn extract_from_surrounding_prose() {
        let raw = "Here is the plan: {\"tasks\": [{\"name\": \"x\"}]} Good luck!";
        assert_eq!(extract_json_block(raw), "{\"tasks\": [{\"name\": \"x\"}]}");
    }

    #[test]
    fn extract_without_braces_returns_trimmed_text() {
        assert_eq!(extract_json_block("  nothing here "), "nothing here");
    }

    #[test]
    fn parse_applies_defaults_and_skips_blank_names() {
        let raw = r#"{"tasks": [
            {"name": "  Anesthesia  ", "offset_start_minutes": -30, "duration_minutes": 30},
            {"name": "", "offset_start_minutes": 0, "duration_minutes": 10},
            {"name": "Main procedure"},
            {"name": "Recovery", "offset_start_minutes": "120", "duration_minutes": 45.0}
        ]}"#;
        let tasks = parse_suggestion(raw).unwrap();
        assert_eq!(
            tasks,
            vec![
                SuggestedTask { name: "Anesthesia".into(), offset_start_minutes: -30, duration_minutes: 30 },
                SuggestedTask { name: "Main procedure".into(), offset_start_minutes: 0, duration_minutes: 60 },
                SuggestedTask { name: "Recovery".into(), offset_start_minutes: 120, duration_minutes: 45 },
            ]
        );
    }

    #[test]
    fn parse_rejects_bad_durations_and_offsets() {
        let raw = r#"{"tasks": [
            {"name": "zero", "duration_minutes": 0},
            {"name": "negative", "duration_minutes": -5},
            {"name": "far", "offset_start_minutes": 100000}
        ]}"#;
        assert!(matches!(parse_suggestion(raw), Err(SuggestError::Empty)));
    }

    #[test]
    fn parse_rejects_extreme_offsets() {
        let raw = r#"{"tasks": [
            {"name": "min", "offset_start_minutes": -9223372036854775808, "duration_minutes": 30},
            {"name": "huge float", "offset_start_minutes": -1e300, "duration_minutes": 30},
            {"name": "max", "offset_start_minutes": 9223372036854775807}
        ]}"#;
        assert!(matches!(parse_suggestion(raw), Err(SuggestError::Empty)));
    }

    #[test]
    fn parse_caps_list_length() {
        let entries: Vec<String> = (0..MAX_SUGGESTED_TASKS + 5)
            .map(|i| format!("{{\"name\": \"t{i}\"}}"))
            .collect();
        let raw = format!("{{\"tasks\": [{}]}}", entries.join(","));
        assert_eq!(parse_suggestion(&raw).unwrap().len(), MAX_SUGGESTED_TASKS);
    }

    #[test]
    fn parse_malformed_inputs() {
        assert!(matches!(parse_suggestion("not json"), Err(SuggestError::Malformed(_))));
        assert!(matches!(parse_suggestion("{\"tasks\": []}"), Err(SuggestError::Malformed(_))));
        assert!(matches!(parse_suggestion("{\"plan\": [1]}"), Err(SuggestError::Malformed(_))));
    }

    #[test]
    fn prompt_mentions_case_details() {
        let input = NewCaseInput {
            patient_name: "Ana".into(),
            procedure_name: "Knee replacement".into(),
            priority: Priority::Urgent,
            requested_at: 1_763_197_200_000,
        };
        let prompt = build_prompt(&input);
        assert!(prompt.contains("Knee replacement"));
        assert!(prompt.contains("urgent"));
        assert!(prompt.contains("2025-11-15T09:00:00.000Z"));
        assert!(prompt.contains("EXACTLY 10 tasks"));
    }

    #[tokio::test]
    async fn unconfigured_is_unavailable() {
        let input = NewCaseInput {
            patient_name: "Ana".into(),
            procedure_name: "X".into(),
            priority: Priority::Elective,
            requested_at: 1_763_197_200_000,
        };
        assert!(matches!(
            Unconfigured.suggest(&input).await,
            Err(SuggestError::Unavailable)
        ));
    }
}
