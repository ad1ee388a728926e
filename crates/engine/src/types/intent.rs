//! Typed intents parsed from user utterances
//!
//! Intents are immutable. Supersession (e.g. a clarified request) creates a
//! new intent pointing at its predecessor via `parent_intent_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::IntentId;

/// Classification of a parsed user utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentType {
    Schedule,
    Search,
    Action,
    Query,
    Planning,
    Analysis,
    Unknown,
    ClarificationRequired,
    ServiceDegraded,
}

impl IntentType {
    /// Whether this intent class produces a saga execution (as opposed to a
    /// purely conversational response).
    pub fn is_saga_class(&self) -> bool {
        matches!(
            self,
            IntentType::Schedule | IntentType::Action | IntentType::Planning
        )
    }
}

impl std::fmt::Display for IntentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IntentType::Schedule => "SCHEDULE",
            IntentType::Search => "SEARCH",
            IntentType::Action => "ACTION",
            IntentType::Query => "QUERY",
            IntentType::Planning => "PLANNING",
            IntentType::Analysis => "ANALYSIS",
            IntentType::Unknown => "UNKNOWN",
            IntentType::ClarificationRequired => "CLARIFICATION_REQUIRED",
            IntentType::ServiceDegraded => "SERVICE_DEGRADED",
        };
        write!(f, "{}", s)
    }
}

/// Provenance metadata attached to every intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentMetadata {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
}

/// A typed intent parsed from a user utterance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub id: IntentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_intent_id: Option<IntentId>,
    #[serde(rename = "type")]
    pub intent_type: IntentType,
    /// Parser confidence in [0, 1]
    pub confidence: f64,
    /// Open parameter map; tool-level schemas validate at the execution boundary
    pub parameters: HashMap<String, serde_json::Value>,
    pub raw_text: String,
    pub metadata: IntentMetadata,
}

impl Intent {
    /// Build a new root intent (no parent).
    pub fn new(intent_type: IntentType, raw_text: impl Into<String>, source: &str) -> Self {
        Self {
            id: IntentId::new(),
            parent_intent_id: None,
            intent_type,
            confidence: 1.0,
            parameters: HashMap::new(),
            raw_text: raw_text.into(),
            metadata: IntentMetadata {
                version: "1".to_string(),
                timestamp: Utc::now(),
                source: source.to_string(),
                model_id: None,
            },
        }
    }

    /// Create a superseding intent linked back to this one.
    pub fn supersede(&self, intent_type: IntentType, raw_text: impl Into<String>) -> Self {
        Self {
            id: IntentId::new(),
            parent_intent_id: Some(self.id),
            intent_type,
            confidence: self.confidence,
            parameters: self.parameters.clone(),
            raw_text: raw_text.into(),
            metadata: IntentMetadata {
                version: self.metadata.version.clone(),
                timestamp: Utc::now(),
                source: self.metadata.source.clone(),
                model_id: self.metadata.model_id.clone(),
            },
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_parameter(mut self, key: &str, value: serde_json::Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saga_class_intents() {
        assert!(IntentType::Schedule.is_saga_class());
        assert!(IntentType::Action.is_saga_class());
        assert!(!IntentType::Query.is_saga_class());
        assert!(!IntentType::ClarificationRequired.is_saga_class());
    }

    #[test]
    fn test_supersession_links_parent() {
        let root = Intent::new(IntentType::Action, "book a table", "chat");
        let next = root.supersede(IntentType::Action, "book a table at 8pm");
        assert_eq!(next.parent_intent_id, Some(root.id));
        assert_ne!(next.id, root.id);
    }

    #[test]
    fn test_confidence_clamped() {
        let intent = Intent::new(IntentType::Search, "find sushi", "chat").with_confidence(1.7);
        assert_eq!(intent.confidence, 1.0);
    }

    #[test]
    fn test_intent_type_wire_format() {
        let json = serde_json::to_string(&IntentType::ClarificationRequired).unwrap();
        assert_eq!(json, "\"CLARIFICATION_REQUIRED\"");
    }
}
