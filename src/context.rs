use std::sync::Arc;

use serde_json::{json, Value as Json};
use tracing::{info, warn};

use crate::agents::Bus;
use crate::model::*;
use crate::protocol::*;
use crate::store::{Store, StoreError};
use crate::suggest::TaskSuggester;

/// Request-level failures, each mapped to one SQLSTATE at the wire boundary.
#[derive(Debug)]
pub enum AppError {
    InvalidInput(String),
    NotFound(String),
    Unschedulable(String),
    Store(StoreError),
    /// An agent replied with something the caller could not use.
    Protocol(String),
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            AppError::NotFound(id) => write!(f, "case not found: {id}"),
            AppError::Unschedulable(reason) => write!(f, "{reason}"),
            AppError::Store(e) => write!(f, "{e}"),
            AppError::Protocol(msg) => write!(f, "agent protocol error: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidInput(msg) => AppError::InvalidInput(msg),
            other => AppError::Store(other),
        }
    }
}

/// Everything a request handler needs. Built once in `main` and shared by `Arc`.
pub struct AppContext {
    pub store: Arc<Store>,
    pub bus: Bus,
}

fn decode_case(reply: &Envelope) -> Result<SurgeryCase, AppError> {
    serde_json::from_value(reply.payload()["case"].clone())
        .map_err(|e| AppError::Protocol(format!("reply {} carried no case: {e}", reply.id)))
}

impl AppContext {
    pub fn new(store: Arc<Store>, suggester: Arc<dyn TaskSuggester>) -> Self {
        let bus = Bus::with_default_agents(store.clone(), suggester);
        Self { store, bus }
    }

    /// Tell the notifier that `kind` happened to `case_id`.
    async fn inform_notifier(&self, kind: &str, case_id: &str) -> Result<(), AppError> {
        let message = build_message(
            Performative::Inform,
            AgentRole::Ui,
            AgentRole::Notifier,
            typed_content(kind, json!({ "case_id": case_id })),
            Some(vec![ProtocolName::A2A, ProtocolName::ACP, ProtocolName::MCP]),
            None,
        );
        self.bus.send(&message).await?;
        Ok(())
    }

    /// NEW_CASE through the planner, then a NEW_CASE_CREATED event for the notifier.
    pub async fn submit_case(&self, input: NewCaseInput) -> Result<SurgeryCase, AppError> {
        let payload =
            serde_json::to_value(&input).map_err(|e| AppError::InvalidInput(e.to_string()))?;
        let request = build_message(
            Performative::Request,
            AgentRole::Ui,
            AgentRole::Planner,
            typed_content(NEW_CASE, payload),
            Some(vec![
                ProtocolName::AgUi,
                ProtocolName::ACP,
                ProtocolName::MCP,
                ProtocolName::A2A,
            ]),
            None,
        );

        let Some(reply) = self.bus.send(&request).await? else {
            return Err(AppError::Protocol("planner did not reply".into()));
        };
        if reply.performative == Performative::Failure {
            let reason = reply.metadata.get("reason").and_then(Json::as_str).unwrap_or("rejected");
            return Err(AppError::InvalidInput(reason.to_string()));
        }
        let case = decode_case(&reply)?;
        self.inform_notifier(NEW_CASE_CREATED, &case.id).await?;
        Ok(case)
    }

    /// SCHEDULE_CASE through the executor. An unplaceable case is an error here.
    pub async fn schedule_case(&self, case_id: &str) -> Result<SurgeryCase, AppError> {
        let mut content = serde_json::Map::new();
        content.insert("type".into(), json!(SCHEDULE_CASE));
        content.insert("case_id".into(), json!(case_id));
        let request = build_message(
            Performative::Request,
            AgentRole::Ui,
            AgentRole::Executor,
            content,
            Some(vec![ProtocolName::A2A, ProtocolName::ACP, ProtocolName::MCP]),
            None,
        );

        let Some(reply) = self.bus.send(&request).await? else {
            return Err(AppError::NotFound(case_id.to_string()));
        };
        if reply.metadata.get("scheduled").and_then(Json::as_bool) != Some(true) {
            let reason = reply
                .metadata
                .get("reason")
                .and_then(Json::as_str)
                .unwrap_or("unschedulable");
            warn!("case {case_id} not scheduled: {reason}");
            return Err(AppError::Unschedulable(unschedulable_message(reason)));
        }
        let case = decode_case(&reply)?;
        self.inform_notifier(CASE_SCHEDULED, case_id).await?;
        Ok(case)
    }

    /// Idempotent. A notification is recorded either way.
    pub async fn delete_case(&self, case_id: &str) -> Result<bool, AppError> {
        let removed = self.store.delete_case(case_id).await?;
        self.store
            .add_notification(&format!("case {case_id} deleted"))
            .await?;
        info!("delete {case_id}: removed={removed}");
        Ok(removed)
    }

    pub async fn snapshot(&self) -> Result<Snapshot, AppError> {
        let query = build_message(
            Performative::Query,
            AgentRole::Ui,
            AgentRole::Monitor,
            serde_json::Map::new(),
            Some(vec![ProtocolName::AgUi, ProtocolName::MCP]),
            None,
        );
        let Some(reply) = self.bus.send(&query).await? else {
            return Err(AppError::Protocol("monitor did not reply".into()));
        };
        serde_json::from_value(reply.payload().clone())
            .map_err(|e| AppError::Protocol(format!("bad snapshot: {e}")))
    }
}

fn unschedulable_message(reason: &str) -> String {
    match reason {
        "no_room_available" => "no operating room available".into(),
        "no_tasks" => "case has no tasks".into(),
        "no_timed_tasks" => "case has no timed tasks".into(),
        other => other.to_string(),
    }
}
