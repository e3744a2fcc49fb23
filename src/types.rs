use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Generic metadata container
pub type Metadata = HashMap<String, Value>;

/// Kind of user action being dispatched to a backend worker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    UserMessage,
    ActionIntent,
    FunctionTrigger,
    GitSync,
    AbilityExecution,
    RuneInstall,
    TaskControl,
    RelationCreate,
    Custom(String),
}

impl RequestKind {
    /// Message type published on the bus for this kind
    pub fn wire_type(&self) -> &str {
        match self {
            Self::UserMessage => "user_input",
            Self::ActionIntent => "action_intent",
            Self::FunctionTrigger => "function_trigger",
            Self::GitSync => "git_sync",
            Self::AbilityExecution => "execute_ability",
            Self::RuneInstall => "install_rune",
            Self::TaskControl => "task_control",
            Self::RelationCreate => "create_relation",
            Self::Custom(name) => name,
        }
    }

    /// Prefix used for correlation IDs; readability only
    pub fn id_prefix(&self) -> &str {
        match self {
            Self::UserMessage => "req",
            Self::ActionIntent => "action",
            Self::FunctionTrigger => "func",
            Self::GitSync => "git",
            Self::AbilityExecution => "ability",
            Self::RuneInstall => "rune",
            Self::TaskControl => "task",
            Self::RelationCreate => "relation",
            Self::Custom(_) => "custom",
        }
    }

    /// Whether dispatching this kind shows an optimistic placeholder by default
    pub fn shows_placeholder(&self) -> bool {
        matches!(self, Self::UserMessage)
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom(name) => write!(f, "custom:{}", name),
            other => write!(f, "{}", other.wire_type()),
        }
    }
}

/// Persisted entity categories that publish change notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    ConversationRecord,
    Ability,
    Rune,
    Task,
    TaskStep,
    Relation,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        Self::ConversationRecord,
        Self::Ability,
        Self::Rune,
        Self::Task,
        Self::TaskStep,
        Self::Relation,
    ];

    /// Event name prefix; the bus event is `{prefix}_{change}`
    pub fn event_prefix(self) -> &'static str {
        match self {
            Self::ConversationRecord => "knowledge_record",
            Self::Ability => "ability",
            Self::Rune => "rune",
            Self::Task => "task",
            Self::TaskStep => "task_step",
            Self::Relation => "relation",
        }
    }

    pub fn event_name(self, change: EntityChange) -> String {
        format!("{}_{}", self.event_prefix(), change.as_str())
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.event_prefix())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityChange {
    Insert,
    Update,
    Delete,
}

impl EntityChange {
    pub const ALL: [EntityChange; 3] = [Self::Insert, Self::Update, Self::Delete];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}
