//! In-process agents and the bus that routes envelopes to them by role.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Map, Value as Json};
use tracing::{info, warn};

use crate::model::*;
use crate::planner;
use crate::protocol::*;
use crate::store::{ScheduleOutcome, Store, StoreError};
use crate::suggest::TaskSuggester;

const REPLY_PROTOCOLS: [ProtocolName; 3] = [ProtocolName::A2A, ProtocolName::ACP, ProtocolName::MCP];

pub enum Agent {
    Planner {
        store: Arc<Store>,
        suggester: Arc<dyn TaskSuggester>,
    },
    Executor {
        store: Arc<Store>,
    },
    Notifier {
        store: Arc<Store>,
    },
    Monitor {
        store: Arc<Store>,
    },
}

fn reply(
    to: &Envelope,
    sender: AgentRole,
    performative: Performative,
    content: Map<String, Json>,
    metadata: Option<Map<String, Json>>,
) -> Envelope {
    build_message(
        performative,
        sender,
        to.sender,
        content,
        Some(REPLY_PROTOCOLS.to_vec()),
        metadata,
    )
}

fn case_json(case: &SurgeryCase) -> Json {
    json!({ "case": case })
}

fn unhandled(role: AgentRole, message: &Envelope) -> Option<Envelope> {
    warn!(
        "{} has no handler for {} {} (type {:?})",
        role.as_str(),
        message.id,
        message.performative.as_str(),
        message.content_type()
    );
    None
}

impl Agent {
    pub fn role(&self) -> AgentRole {
        match self {
            Agent::Planner { .. } => AgentRole::Planner,
            Agent::Executor { .. } => AgentRole::Executor,
            Agent::Notifier { .. } => AgentRole::Notifier,
            Agent::Monitor { .. } => AgentRole::Monitor,
        }
    }

    /// `Ok(None)` means the message was understood but warrants no reply, or was not understood.
    pub async fn handle(&self, message: &Envelope) -> Result<Option<Envelope>, StoreError> {
        info!(
            "{} received {} {}",
            self.role().as_str(),
            message.id,
            message.performative.as_str()
        );
        match self {
            Agent::Planner { store, suggester } => {
                if message.performative != Performative::Request
                    || message.content_type() != Some(NEW_CASE)
                {
                    return Ok(unhandled(self.role(), message));
                }
                plan_new_case(store, suggester.as_ref(), message).await.map(Some)
            }
            Agent::Executor { store } => {
                if message.performative != Performative::Request
                    || message.content_type() != Some(SCHEDULE_CASE)
                {
                    return Ok(unhandled(self.role(), message));
                }
                schedule(store, message).await
            }
            Agent::Notifier { store } => {
                if message.performative != Performative::Inform {
                    return Ok(unhandled(self.role(), message));
                }
                let event_type = message.event_type().to_string();
                let note = store
                    .add_notification(&format!("event received: {event_type}"))
                    .await?;
                info!("notification {} recorded: {}", note.seq, note.message);
                Ok(Some(reply(
                    message,
                    AgentRole::Notifier,
                    Performative::Inform,
                    typed_content(
                        NOTIFICATION_RECORDED,
                        json!({ "event_type": event_type, "seq": note.seq }),
                    ),
                    None,
                )))
            }
            Agent::Monitor { store } => {
                let snapshot = store.snapshot().await?;
                info!("snapshot: {} cases, {} rooms", snapshot.total_cases, snapshot.total_rooms);
                Ok(Some(reply(
                    message,
                    AgentRole::Monitor,
                    Performative::Inform,
                    typed_content(SNAPSHOT, json!(snapshot)),
                    None,
                )))
            }
        }
    }
}

async fn plan_new_case(
    store: &Store,
    suggester: &dyn TaskSuggester,
    message: &Envelope,
) -> Result<Envelope, StoreError> {
    let input = serde_json::from_value::<NewCaseInput>(message.payload().clone())
        .map_err(|e| e.to_string())
        .and_then(|input| input.validate().map(|()| input));
    let input = match input {
        Ok(input) => input,
        Err(reason) => {
            warn!("rejecting NEW_CASE {}: {reason}", message.id);
            let mut metadata = Map::new();
            metadata.insert("reason".into(), Json::String(reason));
            return Ok(reply(
                message,
                AgentRole::Planner,
                Performative::Failure,
                typed_content(NEW_CASE, Json::Null),
                Some(metadata),
            ));
        }
    };

    let case = planner::create_case(input, now_ms(), suggester).await;
    store.add_or_replace_case(case.clone()).await?;
    info!(
        "case {} created for {} ({}, {} tasks)",
        case.id,
        case.patient_name,
        case.priority.as_str(),
        case.tasks.len()
    );
    metrics::counter!(crate::observability::CASES_CREATED_TOTAL).increment(1);

    Ok(reply(
        message,
        AgentRole::Planner,
        Performative::Inform,
        typed_content(NEW_CASE_CREATED, case_json(&case)),
        None,
    ))
}

async fn schedule(store: &Store, message: &Envelope) -> Result<Option<Envelope>, StoreError> {
    let case_id = message
        .content
        .get("case_id")
        .or_else(|| message.payload().get("case_id"))
        .and_then(Json::as_str);
    let Some(case_id) = case_id else {
        warn!("SCHEDULE_CASE {} without case_id", message.id);
        return Ok(None);
    };

    let Some(outcome) = store.schedule_case(case_id).await? else {
        return Ok(None);
    };

    let mut metadata = Map::new();
    match &outcome {
        ScheduleOutcome::Scheduled { room, .. } => {
            metadata.insert("scheduled".into(), Json::Bool(true));
            metadata.insert("room_id".into(), Json::String(room.id.clone()));
        }
        ScheduleOutcome::Unchanged { reason, .. } => {
            metadata.insert("scheduled".into(), Json::Bool(false));
            metadata.insert("reason".into(), Json::String(reason.as_str().to_string()));
        }
    }
    Ok(Some(reply(
        message,
        AgentRole::Executor,
        Performative::Inform,
        typed_content(CASE_SCHEDULED, case_json(outcome.case())),
        Some(metadata),
    )))
}

/// Role-keyed dispatch table.
pub struct Bus {
    agents: HashMap<AgentRole, Agent>,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
        }
    }

    /// Planner, executor, notifier and monitor over one store.
    pub fn with_default_agents(store: Arc<Store>, suggester: Arc<dyn TaskSuggester>) -> Self {
        let mut bus = Self::new();
        bus.register(Agent::Planner {
            store: store.clone(),
            suggester,
        });
        bus.register(Agent::Executor {
            store: store.clone(),
        });
        bus.register(Agent::Notifier {
            store: store.clone(),
        });
        bus.register(Agent::Monitor { store });
        bus
    }

    /// Replaces any agent already registered for the same role.
    pub fn register(&mut self, agent: Agent) {
        info!("agent registered: {}", agent.role().as_str());
        self.agents.insert(agent.role(), agent);
    }

    pub async fn send(&self, message: &Envelope) -> Result<Option<Envelope>, StoreError> {
        let Some(agent) = self.agents.get(&message.receiver) else {
            warn!(
                "no agent for role {}; message {} dropped",
                message.receiver.as_str(),
                message.id
            );
            return Ok(None);
        };
        agent.handle(message).await
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::notify::NotifyHub;
    use crate::suggest::Unconfigured;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("orsched_test_agents");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn bus(name: &str) -> (Bus, Arc<Store>) {
        let store = Arc::new(
            Store::new(test_wal_path(name), default_rooms(), Arc::new(NotifyHub::new())).unwrap(),
        );
        (Bus::with_default_agents(store.clone(), Arc::new(Unconfigured)), store)
    }

    fn request(receiver: AgentRole, content: Map<String, Json>) -> Envelope {
        build_message(Performative::Request, AgentRole::Ui, receiver, content, None, None)
    }

    fn new_case_request(requested: &str) -> Envelope {
        request(
            AgentRole::Planner,
            typed_content(
                NEW_CASE,
                json!({
                    "patient_name": "Ana",
                    "procedure_name": "Appendectomy",
                    "priority": "urgent",
                    "requested_datetime": requested,
                }),
            ),
        )
    }

    fn schedule_request(case_id: &str) -> Envelope {
        let mut content = Map::new();
        content.insert("type".into(), json!(SCHEDULE_CASE));
        content.insert("case_id".into(), json!(case_id));
        request(AgentRole::Executor, content)
    }

    fn case_of(reply: &Envelope) -> SurgeryCase {
        serde_json::from_value(reply.payload()["case"].clone()).unwrap()
    }

    #[tokio::test]
    async fn new_case_then_schedule() {
        let (bus, store) = bus("new_then_schedule.wal");
        let created = bus.send(&new_case_request("2099-06-01T09:00:00Z")).await.unwrap().unwrap();
        assert_eq!(created.performative, Performative::Inform);
        assert_eq!(created.content_type(), Some(NEW_CASE_CREATED));
        assert_eq!(created.receiver, AgentRole::Ui);
        let case = case_of(&created);
        assert_eq!(case.status, CaseStatus::Planned);
        assert_eq!(case.tasks.len(), 3);
        assert_eq!(store.case_count(), 1);

        let scheduled = bus.send(&schedule_request(&case.id)).await.unwrap().unwrap();
        assert_eq!(scheduled.content_type(), Some(CASE_SCHEDULED));
        assert_eq!(scheduled.metadata["scheduled"], true);
        assert_eq!(scheduled.metadata["room_id"], "OR-1");
        let case = case_of(&scheduled);
        assert!(case.tasks.iter().all(|t| t.room_id.as_deref() == Some("OR-1")));
    }

    #[tokio::test]
    async fn sixth_overlapping_case_reports_reason() {
        let (bus, _store) = bus("sixth_case.wal");
        let mut last = None;
        for _ in 0..=ROOM_COUNT {
            let created = bus.send(&new_case_request("2099-06-01T09:00:00Z")).await.unwrap().unwrap();
            let id = case_of(&created).id;
            last = bus.send(&schedule_request(&id)).await.unwrap();
        }
        let last = last.unwrap();
        assert_eq!(last.metadata["scheduled"], false);
        assert_eq!(last.metadata["reason"], "no_room_available");
        assert!(case_of(&last).tasks.iter().all(|t| t.room_id.is_none()));
    }

    #[tokio::test]
    async fn malformed_new_case_gets_failure() {
        let (bus, store) = bus("malformed.wal");
        let env = request(
            AgentRole::Planner,
            typed_content(NEW_CASE, json!({ "patient_name": "Ana" })),
        );
        let reply = bus.send(&env).await.unwrap().unwrap();
        assert_eq!(reply.performative, Performative::Failure);
        assert!(reply.metadata["reason"].as_str().unwrap().contains("procedure_name"));
        assert_eq!(store.case_count(), 0);
    }

    #[tokio::test]
    async fn unknown_case_and_missing_id_get_no_reply() {
        let (bus, _store) = bus("unknown_case.wal");
        assert!(bus.send(&schedule_request("CASE-NOPE")).await.unwrap().is_none());
        let env = request(AgentRole::Executor, typed_content(SCHEDULE_CASE, Json::Null));
        assert!(bus.send(&env).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unhandled_messages_get_no_reply() {
        let (bus, _store) = bus("unhandled.wal");
        let wrong_type = request(AgentRole::Planner, typed_content("DISCHARGE", Json::Null));
        assert!(bus.send(&wrong_type).await.unwrap().is_none());
        let unregistered = request(AgentRole::KnowledgeBase, Map::new());
        assert!(bus.send(&unregistered).await.unwrap().is_none());
        let notifier_request = request(AgentRole::Notifier, Map::new());
        assert!(bus.send(&notifier_request).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn notifier_records_inform_events() {
        let (bus, store) = bus("notifier.wal");
        let event = build_message(
            Performative::Inform,
            AgentRole::Planner,
            AgentRole::Notifier,
            typed_content(NEW_CASE_CREATED, json!({})),
            None,
            None,
        );
        let reply = bus.send(&event).await.unwrap().unwrap();
        assert_eq!(reply.content_type(), Some(NOTIFICATION_RECORDED));
        assert_eq!(reply.payload()["event_type"], NEW_CASE_CREATED);

        let untyped = build_message(
            Performative::Inform,
            AgentRole::Ui,
            AgentRole::Notifier,
            Map::new(),
            None,
            None,
        );
        bus.send(&untyped).await.unwrap();

        let notes = store.list_notifications(10).await;
        assert_eq!(notes[0].message, "event received: UNSPECIFIED_EVENT");
        assert_eq!(notes[1].message, "event received: NEW_CASE_CREATED");
    }

    #[tokio::test]
    async fn monitor_replies_with_snapshot() {
        let (bus, _store) = bus("monitor.wal");
        bus.send(&new_case_request("2099-06-01T09:00:00Z")).await.unwrap();
        let env = build_message(
            Performative::Query,
            AgentRole::Ui,
            AgentRole::Monitor,
            Map::new(),
            None,
            None,
        );
        let reply = bus.send(&env).await.unwrap().unwrap();
        assert_eq!(reply.content_type(), Some(SNAPSHOT));
        assert_eq!(reply.payload()["total_cases"], 1);
        assert_eq!(reply.payload()["total_rooms"], 5);
        assert_eq!(reply.payload()["cases_by_status"]["planned"], 1);
    }
}
