//! Named tool collections (toolsets) and planned multi-step skills.
//!
//! A skill compiles to an immutable `Plan` before execution: step ids must be
//! unique, tool ids non-empty, and — when the skill is bound to a toolset —
//! every step must invoke a member tool. Guards run against the compiled
//! plan; `MaxStepsGuard` is built in.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{ErrorKind, ErrorObject};
use crate::middleware::ToolCall;
use crate::runner::{ChainOutcome, ChainRunner, ChainStep};

/// A named set of tools. Skills bound to a toolset may only invoke its members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Toolset {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillStep {
    pub id: String,
    pub tool_id: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub use_previous: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Optional binding; constrains step tools to the toolset's members.
    #[serde(default)]
    pub toolset: Option<String>,
    pub steps: Vec<SkillStep>,
}

/// A compiled, immutable execution plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    skill_id: String,
    steps: Vec<SkillStep>,
}

impl Plan {
    pub fn skill_id(&self) -> &str {
        &self.skill_id
    }

    pub fn steps(&self) -> &[SkillStep] {
        &self.steps
    }
}

/// A validation rule applied to compiled plans.
pub trait PlanGuard: Send + Sync {
    fn name(&self) -> &str;
    fn check(&self, plan: &Plan) -> Result<(), ErrorObject>;
}

pub struct MaxStepsGuard {
    max: usize,
}

impl MaxStepsGuard {
    pub fn new(max: usize) -> Self {
        Self { max }
    }
}

impl PlanGuard for MaxStepsGuard {
    fn name(&self) -> &str {
        "max_steps"
    }

    fn check(&self, plan: &Plan) -> Result<(), ErrorObject> {
        if plan.steps.len() > self.max {
            return Err(ErrorObject::new(
                ErrorKind::ValidationInput,
                format!(
                    "skill '{}' has {} steps, exceeding the limit of {}",
                    plan.skill_id,
                    plan.steps.len(),
                    self.max
                ),
            ));
        }
        Ok(())
    }
}

/// Default execution limits; caller overrides clamp against these
/// (whichever is tighter wins).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillLimits {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: usize,
    #[serde(default = "default_timeout", with = "crate::config::humantime_duration")]
    pub timeout: Duration,
}

fn default_max_steps() -> usize {
    20
}
fn default_max_tool_calls() -> usize {
    20
}
fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Default for SkillLimits {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_tool_calls: default_max_tool_calls(),
            timeout: default_timeout(),
        }
    }
}

/// Caller-supplied per-run overrides.
#[derive(Debug, Clone, Default)]
pub struct SkillOverrides {
    pub max_steps: Option<usize>,
    pub max_tool_calls: Option<usize>,
    pub timeout_ms: Option<u64>,
}

/// The configured catalog of toolsets and skills.
pub struct SkillCatalog {
    toolsets: HashMap<String, Toolset>,
    skills: HashMap<String, Skill>,
    guards: Vec<Arc<dyn PlanGuard>>,
    limits: SkillLimits,
}

impl SkillCatalog {
    pub fn new(toolsets: Vec<Toolset>, skills: Vec<Skill>, limits: SkillLimits) -> Arc<Self> {
        let guards: Vec<Arc<dyn PlanGuard>> =
            vec![Arc::new(MaxStepsGuard::new(limits.max_steps))];
        Arc::new(Self {
            toolsets: toolsets.into_iter().map(|t| (t.id.clone(), t)).collect(),
            skills: skills.into_iter().map(|s| (s.id.clone(), s)).collect(),
            guards,
            limits,
        })
    }

    pub fn toolsets(&self) -> Vec<Toolset> {
        let mut all: Vec<Toolset> = self.toolsets.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn toolset(&self, id: &str) -> Option<Toolset> {
        self.toolsets.get(id).cloned()
    }

    pub fn skills(&self) -> Vec<Skill> {
        let mut all: Vec<Skill> = self.skills.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn skill(&self, id: &str) -> Option<Skill> {
        self.skills.get(id).cloned()
    }

    /// Compile a skill into a plan. Idempotent: planning the same skill twice
    /// yields an identical plan.
    pub fn plan(&self, skill_id: &str) -> Result<Plan, ErrorObject> {
        let skill = self.skills.get(skill_id).ok_or_else(|| {
            ErrorObject::new(
                ErrorKind::ValidationInput,
                format!("unknown skill '{skill_id}'"),
            )
        })?;

        let mut seen: HashSet<&str> = HashSet::new();
        for step in &skill.steps {
            if step.id.is_empty() {
                return Err(ErrorObject::new(
                    ErrorKind::ValidationInput,
                    format!("skill '{skill_id}' has a step with an empty id"),
                ));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(ErrorObject::new(
                    ErrorKind::ValidationInput,
                    format!("skill '{skill_id}' has duplicate step id '{}'", step.id),
                ));
            }
            if step.tool_id.is_empty() {
                return Err(ErrorObject::new(
                    ErrorKind::ValidationInput,
                    format!("step '{}' of skill '{skill_id}' has an empty tool id", step.id),
                ));
            }
        }

        if let Some(toolset_id) = &skill.toolset {
            let toolset = self.toolsets.get(toolset_id).ok_or_else(|| {
                ErrorObject::new(
                    ErrorKind::ValidationInput,
                    format!("skill '{skill_id}' references unknown toolset '{toolset_id}'"),
                )
            })?;
            for step in &skill.steps {
                if !toolset.tools.contains(&step.tool_id) {
                    return Err(ErrorObject::new(
                        ErrorKind::ValidationInput,
                        format!(
                            "step '{}' invokes '{}' which is not in toolset '{toolset_id}'",
                            step.id, step.tool_id
                        ),
                    ));
                }
            }
        }

        let plan = Plan {
            skill_id: skill_id.to_string(),
            steps: skill.steps.clone(),
        };
        for guard in &self.guards {
            guard.check(&plan)?;
        }
        Ok(plan)
    }

    /// Plan and execute a skill through the chain orchestrator.
    pub async fn run(
        &self,
        skill_id: &str,
        chains: &ChainRunner,
        template: &ToolCall,
        overrides: &SkillOverrides,
    ) -> Result<ChainOutcome, ErrorObject> {
        let plan = self.plan(skill_id)?;

        let max_steps = tighter(overrides.max_steps, self.limits.max_steps);
        let max_tool_calls = tighter(overrides.max_tool_calls, self.limits.max_tool_calls);
        if plan.steps.len() > max_steps {
            return Err(ErrorObject::new(
                ErrorKind::ValidationInput,
                format!(
                    "skill '{skill_id}' needs {} steps but max_steps is {max_steps}",
                    plan.steps.len()
                ),
            ));
        }
        if plan.steps.len() > max_tool_calls {
            return Err(ErrorObject::new(
                ErrorKind::ValidationInput,
                format!(
                    "skill '{skill_id}' needs {} tool calls but max_tool_calls is {max_tool_calls}",
                    plan.steps.len()
                ),
            ));
        }

        let timeout = overrides
            .timeout_ms
            .map(Duration::from_millis)
            .map(|t| t.min(self.limits.timeout))
            .unwrap_or(self.limits.timeout);

        let steps: Vec<ChainStep> = plan
            .steps
            .iter()
            .map(|s| ChainStep {
                tool_id: s.tool_id.clone(),
                args: s.inputs.clone(),
                use_previous: s.use_previous,
            })
            .collect();

        match tokio::time::timeout(timeout, chains.run_chain(&steps, template)).await {
            Ok(outcome) => Ok(outcome),
            Err(_) => Err(ErrorObject::new(
                ErrorKind::Timeout,
                format!("skill '{skill_id}' exceeded its {timeout:?} deadline"),
            )),
        }
    }
}

fn tighter(requested: Option<usize>, configured: usize) -> usize {
    requested.map(|r| r.min(configured)).unwrap_or(configured)
}
