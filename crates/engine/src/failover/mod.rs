//! Failover policy engine
//!
//! Classifies a step failure against an ordered policy table and recommends
//! an action. Classification is deterministic: structured error codes first,
//! then keyword matching on the message. Policies are ordered by
//! specificity and the first match wins.

use serde::{Deserialize, Serialize};

use crate::types::{IntentType, StepError};

pub mod replanner;

pub use replanner::{Planner, PlanningConstraints, ReplanMarker, Replanner};

/// Recognized failure reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    RestaurantFull,
    PartySizeTooLarge,
    PaymentFailed,
    Timeout,
    ValidationFailed,
    DeliveryUnavailable,
    ServiceError,
}

impl FailureReason {
    /// Map a structured error code to a reason, when the code is one of ours.
    fn from_code(code: &str) -> Option<Self> {
        match code {
            "RESTAURANT_FULL" => Some(Self::RestaurantFull),
            "PARTY_SIZE_TOO_LARGE" => Some(Self::PartySizeTooLarge),
            "PAYMENT_FAILED" => Some(Self::PaymentFailed),
            "TIMEOUT" => Some(Self::Timeout),
            "VALIDATION_FAILED" => Some(Self::ValidationFailed),
            "DELIVERY_UNAVAILABLE" => Some(Self::DeliveryUnavailable),
            "SERVICE_ERROR" => Some(Self::ServiceError),
            _ => None,
        }
    }

    /// Keyword classification for free-text tool errors.
    fn from_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("full") || lower.contains("no availability") || lower.contains("fully booked")
        {
            Self::RestaurantFull
        } else if lower.contains("party size") || lower.contains("too large") {
            Self::PartySizeTooLarge
        } else if lower.contains("payment") || lower.contains("card declined") {
            Self::PaymentFailed
        } else if lower.contains("timeout") || lower.contains("timed out") {
            Self::Timeout
        } else if lower.contains("validation") || lower.contains("invalid") {
            Self::ValidationFailed
        } else if lower.contains("delivery unavailable") || lower.contains("no couriers") {
            Self::DeliveryUnavailable
        } else {
            Self::ServiceError
        }
    }

    /// Classify a structured step error.
    pub fn classify(error: &StepError) -> Self {
        Self::from_code(&error.code).unwrap_or_else(|| Self::from_message(&error.message))
    }
}

/// Recommended follow-up action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    SuggestAlternativeTime,
    SuggestAlternativeRestaurant,
    SuggestAlternativeDate,
    TriggerDelivery,
    TriggerWaitlist,
    EscalateToHuman,
    Retry,
}

/// Recommendation emitted by a matched policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendedAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub message_template: String,
}

/// A structured suggestion the replanner can apply to plan parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    /// Parameter the suggestion targets (e.g. `time`, `restaurant_id`)
    pub parameter: String,
    pub value: serde_json::Value,
}

/// Input to classification
#[derive(Debug, Clone)]
pub struct FailoverContext {
    pub intent_type: IntentType,
    pub error: StepError,
    pub confidence: f64,
    pub attempt_count: u32,
    pub metadata: serde_json::Value,
}

/// One entry of the ordered policy table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverPolicy {
    pub name: String,
    /// Restrict to intent types; `None` applies to all
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_types: Option<Vec<IntentType>>,
    pub reasons: Vec<FailureReason>,
    pub action: RecommendedAction,
    /// Whether the recommended action can be executed automatically via replan
    pub recoverable: bool,
}

impl FailoverPolicy {
    fn matches(&self, context: &FailoverContext, reason: FailureReason) -> bool {
        if let Some(types) = &self.intent_types {
            if !types.contains(&context.intent_type) {
                return false;
            }
        }
        self.reasons.contains(&reason)
    }
}

/// Outcome of classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverDecision {
    pub matched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    pub reason: FailureReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommended_action: Option<RecommendedAction>,
    pub recoverable: bool,
    #[serde(default)]
    pub suggestions: Vec<Suggestion>,
}

/// Ordered first-match-wins policy engine.
pub struct FailoverPolicyEngine {
    policies: Vec<FailoverPolicy>,
}

impl FailoverPolicyEngine {
    pub fn new(policies: Vec<FailoverPolicy>) -> Self {
        Self { policies }
    }

    /// Default policy table, most specific first.
    pub fn with_defaults() -> Self {
        let policies = vec![
            FailoverPolicy {
                name: "restaurant-full-alternative-time".into(),
                intent_types: None,
                reasons: vec![FailureReason::RestaurantFull],
                action: RecommendedAction {
                    action_type: ActionType::SuggestAlternativeTime,
                    message_template:
                        "That time is fully booked. I can try {alternative_time} instead.".into(),
                },
                recoverable: true,
            },
            FailoverPolicy {
                name: "party-size-waitlist".into(),
                intent_types: None,
                reasons: vec![FailureReason::PartySizeTooLarge],
                action: RecommendedAction {
                    action_type: ActionType::TriggerWaitlist,
                    message_template:
                        "The party is too large for online booking. Joining the waitlist.".into(),
                },
                recoverable: true,
            },
            FailoverPolicy {
                name: "delivery-unavailable-alternative-restaurant".into(),
                intent_types: None,
                reasons: vec![FailureReason::DeliveryUnavailable],
                action: RecommendedAction {
                    action_type: ActionType::SuggestAlternativeRestaurant,
                    message_template:
                        "Delivery is unavailable there. Trying a nearby alternative.".into(),
                },
                recoverable: true,
            },
            FailoverPolicy {
                name: "timeout-retry".into(),
                intent_types: None,
                reasons: vec![FailureReason::Timeout],
                action: RecommendedAction {
                    action_type: ActionType::Retry,
                    message_template: "The service was slow to respond. Retrying.".into(),
                },
                recoverable: true,
            },
            FailoverPolicy {
                name: "payment-escalate".into(),
                intent_types: None,
                reasons: vec![FailureReason::PaymentFailed],
                action: RecommendedAction {
                    action_type: ActionType::EscalateToHuman,
                    message_template: "Payment failed. A human needs to take a look.".into(),
                },
                recoverable: false,
            },
            FailoverPolicy {
                name: "validation-escalate".into(),
                intent_types: None,
                reasons: vec![FailureReason::ValidationFailed],
                action: RecommendedAction {
                    action_type: ActionType::EscalateToHuman,
                    message_template: "The request could not be validated.".into(),
                },
                recoverable: false,
            },
        ];
        Self::new(policies)
    }

    /// Classify a failure. Unmatched reasons (notably SERVICE_ERROR) come
    /// back unmatched and non-recoverable, which routes to compensation.
    pub fn evaluate(&self, context: &FailoverContext) -> FailoverDecision {
        let reason = FailureReason::classify(&context.error);
        for policy in &self.policies {
            if policy.matches(context, reason) {
                return FailoverDecision {
                    matched: true,
                    policy: Some(policy.name.clone()),
                    reason,
                    recommended_action: Some(policy.action.clone()),
                    recoverable: policy.recoverable,
                    suggestions: self.build_suggestions(&policy.action, context),
                };
            }
        }
        FailoverDecision {
            matched: false,
            policy: None,
            reason,
            recommended_action: None,
            recoverable: false,
            suggestions: Vec::new(),
        }
    }

    fn build_suggestions(
        &self,
        action: &RecommendedAction,
        context: &FailoverContext,
    ) -> Vec<Suggestion> {
        match action.action_type {
            ActionType::SuggestAlternativeTime => {
                let requested = context
                    .metadata
                    .get("time")
                    .and_then(|v| v.as_str())
                    .unwrap_or("19:00");
                vec![Suggestion {
                    parameter: "time".into(),
                    value: serde_json::Value::String(shift_time_one_hour(requested)),
                }]
            }
            ActionType::SuggestAlternativeDate => vec![Suggestion {
                parameter: "date".into(),
                value: serde_json::Value::String("next_day".into()),
            }],
            ActionType::TriggerWaitlist => vec![Suggestion {
                parameter: "waitlist".into(),
                value: serde_json::Value::Bool(true),
            }],
            ActionType::TriggerDelivery => vec![Suggestion {
                parameter: "fulfillment".into(),
                value: serde_json::Value::String("delivery".into()),
            }],
            _ => Vec::new(),
        }
    }
}

/// Shift an `HH:MM` time one hour later, wrapping at midnight.
fn shift_time_one_hour(time: &str) -> String {
    let mut parts = time.splitn(2, ':');
    let hour: u32 = parts.next().and_then(|h| h.parse().ok()).unwrap_or(19);
    let minute = parts.next().unwrap_or("00");
    format!("{:02}:{}", (hour + 1) % 24, minute)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(code: &str, message: &str) -> FailoverContext {
        FailoverContext {
            intent_type: IntentType::Action,
            error: StepError {
                code: code.into(),
                message: message.into(),
            },
            confidence: 0.9,
            attempt_count: 1,
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn test_structured_code_beats_keywords() {
        // Message mentions "payment" but the code is authoritative.
        let reason = FailureReason::classify(&StepError {
            code: "RESTAURANT_FULL".into(),
            message: "payment backend said the restaurant is closed".into(),
        });
        assert_eq!(reason, FailureReason::RestaurantFull);
    }

    #[test]
    fn test_keyword_classification() {
        assert_eq!(
            FailureReason::from_message("restaurant is full"),
            FailureReason::RestaurantFull
        );
        assert_eq!(
            FailureReason::from_message("request timed out"),
            FailureReason::Timeout
        );
        assert_eq!(
            FailureReason::from_message("backend exploded"),
            FailureReason::ServiceError
        );
    }

    #[test]
    fn test_restaurant_full_recommends_alternative_time() {
        let engine = FailoverPolicyEngine::with_defaults();
        let decision = engine.evaluate(&context("TOOL_ERROR", "restaurant is full"));
        assert!(decision.matched);
        assert!(decision.recoverable);
        assert_eq!(
            decision.recommended_action.unwrap().action_type,
            ActionType::SuggestAlternativeTime
        );
    }

    #[test]
    fn test_service_error_is_unmatched_and_terminal() {
        let engine = FailoverPolicyEngine::with_defaults();
        let decision = engine.evaluate(&context("SERVICE_ERROR", "backend exploded"));
        assert!(!decision.matched);
        assert!(!decision.recoverable);
        assert_eq!(decision.reason, FailureReason::ServiceError);
    }

    #[test]
    fn test_first_matching_policy_wins() {
        let engine = FailoverPolicyEngine::new(vec![
            FailoverPolicy {
                name: "first".into(),
                intent_types: None,
                reasons: vec![FailureReason::Timeout],
                action: RecommendedAction {
                    action_type: ActionType::Retry,
                    message_template: String::new(),
                },
                recoverable: true,
            },
            FailoverPolicy {
                name: "second".into(),
                intent_types: None,
                reasons: vec![FailureReason::Timeout],
                action: RecommendedAction {
                    action_type: ActionType::EscalateToHuman,
                    message_template: String::new(),
                },
                recoverable: false,
            },
        ]);
        let decision = engine.evaluate(&context("TIMEOUT", "timed out"));
        assert_eq!(decision.policy.as_deref(), Some("first"));
    }

    #[test]
    fn test_alternative_time_suggestion_shifts_hour() {
        let engine = FailoverPolicyEngine::with_defaults();
        let mut ctx = context("RESTAURANT_FULL", "full");
        ctx.metadata = serde_json::json!({"time": "19:00"});
        let decision = engine.evaluate(&ctx);
        assert_eq!(decision.suggestions.len(), 1);
        assert_eq!(decision.suggestions[0].parameter, "time");
        assert_eq!(decision.suggestions[0].value, serde_json::json!("20:00"));
    }

    #[test]
    fn test_intent_type_restriction() {
        let engine = FailoverPolicyEngine::new(vec![FailoverPolicy {
            name: "schedule-only".into(),
            intent_types: Some(vec![IntentType::Schedule]),
            reasons: vec![FailureReason::Timeout],
            action: RecommendedAction {
                action_type: ActionType::Retry,
                message_template: String::new(),
            },
            recoverable: true,
        }]);
        let decision = engine.evaluate(&context("TIMEOUT", "timed out"));
        assert!(!decision.matched);
    }
}
