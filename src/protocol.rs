//! Message envelope exchanged between agents.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::debug;
use ulid::Ulid;

use crate::model::{now_ms, Ms};

#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolName {
    A2A,
    #[serde(rename = "AG-UI")]
    AgUi,
    ACP,
    MCP,
}

impl ProtocolName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolName::A2A => "A2A",
            ProtocolName::AgUi => "AG-UI",
            ProtocolName::ACP => "ACP",
            ProtocolName::MCP => "MCP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Performative {
    Request,
    Inform,
    Propose,
    Agree,
    Refuse,
    Query,
    Failure,
}

impl Performative {
    pub fn as_str(&self) -> &'static str {
        match self {
            Performative::Request => "REQUEST",
            Performative::Inform => "INFORM",
            Performative::Propose => "PROPOSE",
            Performative::Agree => "AGREE",
            Performative::Refuse => "REFUSE",
            Performative::Query => "QUERY",
            Performative::Failure => "FAILURE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Planner,
    Executor,
    Notifier,
    KnowledgeBase,
    Monitor,
    Ui,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Planner => "planner",
            AgentRole::Executor => "executor",
            AgentRole::Notifier => "notifier",
            AgentRole::KnowledgeBase => "knowledge_base",
            AgentRole::Monitor => "monitor",
            AgentRole::Ui => "ui",
        }
    }
}

// Content `type` values.
pub const NEW_CASE: &str = "NEW_CASE";
pub const NEW_CASE_CREATED: &str = "NEW_CASE_CREATED";
pub const SCHEDULE_CASE: &str = "SCHEDULE_CASE";
pub const CASE_SCHEDULED: &str = "CASE_SCHEDULED";
pub const CASE_DELETED: &str = "CASE_DELETED";
pub const NOTIFICATION_RECORDED: &str = "NOTIFICATION_RECORDED";
pub const SNAPSHOT: &str = "SNAPSHOT";
const UNSPECIFIED_EVENT: &str = "UNSPECIFIED_EVENT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub created_at: Ms,
    pub protocols: Vec<ProtocolName>,
    pub performative: Performative,
    pub sender: AgentRole,
    pub receiver: AgentRole,
    pub content: Map<String, Json>,
    pub metadata: Map<String, Json>,
}

impl Envelope {
    /// `content.type`, if present and a string.
    pub fn content_type(&self) -> Option<&str> {
        self.content.get("type").and_then(Json::as_str)
    }

    /// `content.payload`, or `Null` when absent.
    pub fn payload(&self) -> &Json {
        self.content.get("payload").unwrap_or(&Json::Null)
    }

    /// `content.type` with a stand-in for untyped events.
    pub fn event_type(&self) -> &str {
        self.content_type().unwrap_or(UNSPECIFIED_EVENT)
    }
}

/// Build an envelope with a fresh id. Protocols default to `[A2A]`.
pub fn build_message(
    performative: Performative,
    sender: AgentRole,
    receiver: AgentRole,
    content: Map<String, Json>,
    protocols: Option<Vec<ProtocolName>>,
    metadata: Option<Map<String, Json>>,
) -> Envelope {
    let envelope = Envelope {
        id: Ulid::new().to_string(),
        created_at: now_ms(),
        protocols: protocols.unwrap_or_else(|| vec![ProtocolName::A2A]),
        performative,
        sender,
        receiver,
        content,
        metadata: metadata.unwrap_or_default(),
    };
    debug!(
        "envelope {} {} {} -> {} [{}]",
        envelope.id,
        envelope.performative.as_str(),
        envelope.sender.as_str(),
        envelope.receiver.as_str(),
        envelope
            .protocols
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(",")
    );
    envelope
}

/// `{"type": <kind>, "payload": <payload>}`
pub fn typed_content(kind: &str, payload: Json) -> Map<String, Json> {
    let mut content = Map::new();
    content.insert("type".into(), Json::String(kind.to_string()));
    content.insert("payload".into(), payload);
    content
}
