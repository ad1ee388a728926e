//! Plans and plan steps
//!
//! A plan is a totally ordered list of steps with backward-pointing
//! dependency edges. Structural validation happens at ingestion: a plan that
//! fails validation is never written to the state store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use super::{IntentId, PlanError, PlanId, StepId};

/// Hard ceiling on steps per plan, independent of per-plan constraints.
pub const MAX_PLAN_STEPS: usize = 100;

/// Default per-step tool timeout.
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 30_000;

/// Retry policy for a single step's technical failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 250,
        }
    }
}

/// A single step of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: StepId,
    pub step_number: u32,
    pub tool_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_version: Option<String>,
    pub parameters: serde_json::Value,
    /// Ids of steps that must complete before this one becomes ready
    #[serde(default)]
    pub dependencies: Vec<StepId>,
    pub description: String,
    #[serde(default)]
    pub requires_confirmation: bool,
    pub timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

impl PlanStep {
    pub fn new(step_number: u32, tool_name: &str, parameters: serde_json::Value) -> Self {
        Self {
            id: StepId::new(),
            step_number,
            tool_name: tool_name.to_string(),
            tool_version: None,
            parameters,
            dependencies: Vec::new(),
            description: String::new(),
            requires_confirmation: false,
            timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
            retry_policy: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<StepId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// Resource and policy limits attached to a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PlanConstraints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_total_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_execution_time_ms: Option<u64>,
    /// If set, plan steps may only reference these tools
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    /// Tool names that force `requires_confirmation` on their steps
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_confirmation_for: Option<Vec<String>>,
}

/// Provenance metadata for a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanMetadata {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub planning_model_id: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extras: HashMap<String, serde_json::Value>,
}

impl Default for PlanMetadata {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            created_at: Utc::now(),
            planning_model_id: "unknown".to_string(),
            extras: HashMap::new(),
        }
    }
}

/// A validated multi-step plan compiled from an intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub intent_id: IntentId,
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub constraints: PlanConstraints,
    pub metadata: PlanMetadata,
    pub summary: String,
}

impl Plan {
    /// Build and validate a plan. Steps are sorted by `step_number`; structural
    /// problems (cycles, forward edges, duplicate numbers, disallowed tools)
    /// reject the plan before it can reach the store.
    pub fn new(
        intent_id: IntentId,
        mut steps: Vec<PlanStep>,
        constraints: PlanConstraints,
        summary: &str,
    ) -> Result<Self, PlanError> {
        steps.sort_by_key(|s| s.step_number);
        let plan = Self {
            id: PlanId::new(),
            intent_id,
            steps,
            constraints,
            metadata: PlanMetadata::default(),
            summary: summary.to_string(),
        };
        plan.validate()?;
        Ok(plan)
    }

    /// Structural validation: size limits, unique step numbers, known
    /// backward-pointing dependencies, no cycles, allowed tools, sane timeouts.
    pub fn validate(&self) -> Result<(), PlanError> {
        let max = self
            .constraints
            .max_steps
            .map(|m| m.min(MAX_PLAN_STEPS))
            .unwrap_or(MAX_PLAN_STEPS);
        if self.steps.len() > max {
            return Err(PlanError::TooManySteps {
                count: self.steps.len(),
                max,
            });
        }

        let mut numbers = HashSet::new();
        for step in &self.steps {
            if !numbers.insert(step.step_number) {
                return Err(PlanError::DuplicateStepNumber {
                    step_number: step.step_number,
                });
            }
            if step.timeout_ms == 0 {
                return Err(PlanError::InvalidTimeout(step.timeout_ms));
            }
        }

        let by_id: HashMap<StepId, &PlanStep> = self.steps.iter().map(|s| (s.id, s)).collect();
        for step in &self.steps {
            for dep in &step.dependencies {
                let dep_step = by_id
                    .get(dep)
                    .ok_or(PlanError::UnknownDependency {
                        step_id: step.id,
                        dependency: *dep,
                    })?;
                if dep_step.step_number >= step.step_number {
                    return Err(PlanError::ForwardDependency {
                        step_id: step.id,
                        dependency: *dep,
                    });
                }
            }
        }

        // Backward-pointing edges over unique step numbers cannot cycle, but a
        // plan arriving over the wire is validated before the sort invariant
        // can be trusted. Walk the graph anyway.
        self.check_acyclic(&by_id)?;

        if let Some(allowed) = &self.constraints.allowed_tools {
            for step in &self.steps {
                if !allowed.iter().any(|t| t == &step.tool_name) {
                    return Err(PlanError::ToolNotAllowed {
                        tool_name: step.tool_name.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    fn check_acyclic(&self, by_id: &HashMap<StepId, &PlanStep>) -> Result<(), PlanError> {
        let mut visited: HashSet<StepId> = HashSet::new();
        let mut in_stack: HashSet<StepId> = HashSet::new();

        fn visit(
            id: StepId,
            by_id: &HashMap<StepId, &PlanStep>,
            visited: &mut HashSet<StepId>,
            in_stack: &mut HashSet<StepId>,
        ) -> Result<(), PlanError> {
            if in_stack.contains(&id) {
                return Err(PlanError::DependencyCycle { step_id: id });
            }
            if visited.contains(&id) {
                return Ok(());
            }
            in_stack.insert(id);
            if let Some(step) = by_id.get(&id) {
                for dep in &step.dependencies {
                    visit(*dep, by_id, visited, in_stack)?;
                }
            }
            in_stack.remove(&id);
            visited.insert(id);
            Ok(())
        }

        for step in &self.steps {
            visit(step.id, by_id, &mut visited, &mut in_stack)?;
        }
        Ok(())
    }

    /// Find a step by its id.
    pub fn step(&self, step_id: StepId) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Find a step by its number.
    pub fn step_by_number(&self, step_number: u32) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.step_number == step_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(n: u32, tool: &str) -> PlanStep {
        PlanStep::new(n, tool, serde_json::json!({}))
    }

    #[test]
    fn test_plan_sorts_steps_by_number() {
        let plan = Plan::new(
            IntentId::new(),
            vec![step(2, "c"), step(0, "a"), step(1, "b")],
            PlanConstraints::default(),
            "ordering",
        )
        .unwrap();
        let numbers: Vec<u32> = plan.steps.iter().map(|s| s.step_number).collect();
        assert_eq!(numbers, vec![0, 1, 2]);
    }

    #[test]
    fn test_duplicate_step_number_rejected() {
        let result = Plan::new(
            IntentId::new(),
            vec![step(0, "a"), step(0, "b")],
            PlanConstraints::default(),
            "dup",
        );
        assert!(matches!(
            result,
            Err(PlanError::DuplicateStepNumber { step_number: 0 })
        ));
    }

    #[test]
    fn test_forward_dependency_rejected() {
        let late = step(1, "b");
        let mut early = step(0, "a");
        early.dependencies = vec![late.id];
        let result = Plan::new(
            IntentId::new(),
            vec![early, late],
            PlanConstraints::default(),
            "forward",
        );
        assert!(matches!(result, Err(PlanError::ForwardDependency { .. })));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let mut s = step(0, "a");
        s.dependencies = vec![StepId::new()];
        let result = Plan::new(IntentId::new(), vec![s], PlanConstraints::default(), "orphan");
        assert!(matches!(result, Err(PlanError::UnknownDependency { .. })));
    }

    #[test]
    fn test_dependency_cycle_rejected() {
        let mut a = step(0, "a");
        let mut b = step(1, "b");
        // Hand-built cycle; bypasses the constructor sort by mutating after.
        a.dependencies = vec![b.id];
        b.dependencies = vec![a.id];
        let plan = Plan {
            id: PlanId::new(),
            intent_id: IntentId::new(),
            steps: vec![a, b],
            constraints: PlanConstraints::default(),
            metadata: PlanMetadata::default(),
            summary: "cycle".into(),
        };
        assert!(matches!(
            plan.validate(),
            Err(PlanError::DependencyCycle { .. }) | Err(PlanError::ForwardDependency { .. })
        ));
    }

    #[test]
    fn test_disallowed_tool_rejected() {
        let constraints = PlanConstraints {
            allowed_tools: Some(vec!["geocode_location".into()]),
            ..Default::default()
        };
        let result = Plan::new(
            IntentId::new(),
            vec![step(0, "book_restaurant_table")],
            constraints,
            "denied",
        );
        assert!(matches!(result, Err(PlanError::ToolNotAllowed { .. })));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut s = step(0, "a");
        s.timeout_ms = 0;
        let result = Plan::new(IntentId::new(), vec![s], PlanConstraints::default(), "t0");
        assert!(matches!(result, Err(PlanError::InvalidTimeout(0))));
    }

    #[test]
    fn test_step_count_cap() {
        let steps: Vec<PlanStep> = (0..101).map(|n| step(n, "noop")).collect();
        let result = Plan::new(IntentId::new(), steps, PlanConstraints::default(), "big");
        assert!(matches!(result, Err(PlanError::TooManySteps { .. })));
    }
}
