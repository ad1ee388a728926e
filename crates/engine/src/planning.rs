//! Intent parsing and plan synthesis seams
//!
//! Both concerns live outside the engine (an LLM service in production); the
//! engine owns only the contracts plus small built-in implementations that
//! keep single-node deployments and tests self-contained.

use async_trait::async_trait;
use std::sync::Arc;

use crate::failover::{Planner, PlanningConstraints};
use crate::types::{Intent, IntentType, Plan, PlanStep};

/// Turns a raw utterance into a typed intent.
#[async_trait]
pub trait IntentParser: Send + Sync {
    async fn parse(&self, raw_text: &str) -> Result<Intent, String>;
}

/// Keyword-driven parser for standalone operation. Production routes through
/// the LLM parser service; the engine only needs the typed result.
pub struct HeuristicIntentParser;

#[async_trait]
impl IntentParser for HeuristicIntentParser {
    async fn parse(&self, raw_text: &str) -> Result<Intent, String> {
        let lower = raw_text.to_lowercase();
        let (intent_type, confidence) = if lower.contains("book")
            || lower.contains("reserve")
            || lower.contains("order")
        {
            (IntentType::Action, 0.85)
        } else if lower.contains("schedule") || lower.contains("calendar") {
            (IntentType::Schedule, 0.8)
        } else if lower.contains("find") || lower.contains("search") {
            (IntentType::Search, 0.75)
        } else if lower.contains("plan") {
            (IntentType::Planning, 0.7)
        } else if lower.trim().is_empty() {
            (IntentType::ClarificationRequired, 0.3)
        } else {
            (IntentType::Query, 0.6)
        };
        Ok(Intent::new(intent_type, raw_text, "chat").with_confidence(confidence))
    }
}

/// Planner that reads pre-structured steps out of the intent parameters
/// (`steps: [{tool_name, parameters, description?, timeout_ms?}]`). This is
/// the shape the external planning service produces; the engine validates
/// and executes, it does not invent plans.
pub struct StructuredStepPlanner;

#[async_trait]
impl Planner for StructuredStepPlanner {
    async fn plan(
        &self,
        intent: &Intent,
        constraints: &PlanningConstraints,
    ) -> Result<Plan, String> {
        let steps_value = intent
            .parameters
            .get("steps")
            .ok_or_else(|| "intent carries no structured steps".to_string())?;
        let raw_steps = steps_value
            .as_array()
            .ok_or_else(|| "steps parameter must be an array".to_string())?;

        let mut steps = Vec::with_capacity(raw_steps.len());
        let mut previous_id = None;
        for (index, raw) in raw_steps.iter().enumerate() {
            let tool_name = raw
                .get("tool_name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| format!("step {index} is missing tool_name"))?;
            let parameters = raw
                .get("parameters")
                .cloned()
                .unwrap_or_else(|| serde_json::json!({}));
            let mut step = PlanStep::new(index as u32, tool_name, parameters);
            if let Some(description) = raw.get("description").and_then(|v| v.as_str()) {
                step = step.with_description(description);
            }
            if let Some(timeout_ms) = raw.get("timeout_ms").and_then(|v| v.as_u64()) {
                step = step.with_timeout_ms(timeout_ms);
            }
            if let Some(previous) = previous_id {
                step = step.with_dependencies(vec![previous]);
            }
            previous_id = Some(step.id);
            steps.push(step);
        }

        Plan::new(
            intent.id,
            steps,
            constraints.base.clone(),
            &format!("plan for: {}", intent.raw_text),
        )
        .map_err(|e| e.to_string())
    }
}

/// Composite planner: initial planning reads structured steps, replanning
/// rebuilds the previous plan with suggestions applied.
pub struct DefaultPlanner {
    initial: StructuredStepPlanner,
    replan: crate::failover::replanner::SuggestionPlanner,
}

impl DefaultPlanner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            initial: StructuredStepPlanner,
            replan: crate::failover::replanner::SuggestionPlanner,
        })
    }
}

#[async_trait]
impl Planner for DefaultPlanner {
    async fn plan(
        &self,
        intent: &Intent,
        constraints: &PlanningConstraints,
    ) -> Result<Plan, String> {
        if constraints.previous_plan.is_some() {
            self.replan.plan(intent, constraints).await
        } else {
            self.initial.plan(intent, constraints).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PlanConstraints;

    #[tokio::test]
    async fn test_heuristic_parser_classification() {
        let parser = HeuristicIntentParser;
        let intent = parser.parse("book a table for four").await.unwrap();
        assert_eq!(intent.intent_type, IntentType::Action);
        let intent = parser.parse("what is on my calendar").await.unwrap();
        assert_eq!(intent.intent_type, IntentType::Schedule);
        let intent = parser.parse("").await.unwrap();
        assert_eq!(intent.intent_type, IntentType::ClarificationRequired);
    }

    #[tokio::test]
    async fn test_structured_planner_builds_sequential_plan() {
        let intent = Intent::new(IntentType::Action, "dinner", "test").with_parameter(
            "steps",
            serde_json::json!([
                {"tool_name": "geocode_location", "parameters": {"query": "Union Sq"}},
                {"tool_name": "add_calendar_event", "parameters": {"title": "Dinner"}}
            ]),
        );
        let constraints = PlanningConstraints {
            base: PlanConstraints::default(),
            suggestions: Vec::new(),
            previous_plan: None,
        };
        let plan = StructuredStepPlanner.plan(&intent, &constraints).await.unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[1].dependencies, vec![plan.steps[0].id]);
    }

    #[tokio::test]
    async fn test_structured_planner_rejects_missing_steps() {
        let intent = Intent::new(IntentType::Action, "dinner", "test");
        let constraints = PlanningConstraints {
            base: PlanConstraints::default(),
            suggestions: Vec::new(),
            previous_plan: None,
        };
        assert!(StructuredStepPlanner.plan(&intent, &constraints).await.is_err());
    }
}
