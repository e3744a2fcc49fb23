// src/ambient.rs

//! Suggestion and status updates that do not belong to any correlated
//! operation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionUpdate {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub suggestions: Option<Vec<Value>>,
    #[serde(default)]
    pub knowledge_results: Option<Vec<Value>>,
    #[serde(default)]
    pub is_loading_suggestions: Option<bool>,
    #[serde(default)]
    pub is_loading_knowledge: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    #[serde(default)]
    pub user_id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AmbientUpdate {
    Suggestions(SuggestionUpdate),
    Status(StatusUpdate),
}

impl AmbientUpdate {
    pub fn suggestions(payload: &Value) -> Result<Self> {
        serde_json::from_value(payload.clone())
            .map(Self::Suggestions)
            .map_err(|e| Error::validation("payload", format!("malformed suggestion update: {}", e)))
    }

    pub fn status(payload: &Value) -> Result<Self> {
        serde_json::from_value(payload.clone())
            .map(Self::Status)
            .map_err(|e| Error::validation("payload", format!("malformed status update: {}", e)))
    }

    fn user_id(&self) -> Option<&str> {
        match self {
            Self::Suggestions(update) => update.user_id.as_deref(),
            Self::Status(update) => update.user_id.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusLine {
    pub status: String,
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AmbientState {
    pub suggestions: Vec<Value>,
    pub knowledge_results: Vec<Value>,
    pub is_loading_suggestions: bool,
    pub is_loading_knowledge: bool,
    pub status: Option<StatusLine>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl AmbientState {
    /// Applies `update` unless it is addressed to another user. Fields the
    /// update leaves out keep their current value.
    pub fn apply(&mut self, update: AmbientUpdate, session_user: Option<&str>) -> bool {
        if let (Some(target), Some(session)) = (update.user_id(), session_user) {
            if target != session {
                tracing::trace!(target_user = %target, "Ignoring ambient update for another user");
                return false;
            }
        }

        match update {
            AmbientUpdate::Suggestions(update) => {
                if let Some(suggestions) = update.suggestions {
                    self.suggestions = suggestions;
                }
                if let Some(knowledge_results) = update.knowledge_results {
                    self.knowledge_results = knowledge_results;
                }
                if let Some(loading) = update.is_loading_suggestions {
                    self.is_loading_suggestions = loading;
                }
                if let Some(loading) = update.is_loading_knowledge {
                    self.is_loading_knowledge = loading;
                }
            }
            AmbientUpdate::Status(update) => {
                self.status = Some(StatusLine {
                    status: update.status,
                    message: update.message,
                    at: Utc::now(),
                });
            }
        }

        self.updated_at = Some(Utc::now());
        true
    }
}
