//! Prompt rendering for sandboxes and the reasoning collaborator.

use std::path::Path;

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::context::ContextWindow;
use crate::core::types::{Checkpoint, DecisionAction, Draft, Instance, PassCriterion, Task};

const CHECKPOINT_TEMPLATE: &str = include_str!("prompts/checkpoint.md");
const DECISION_TEMPLATE: &str = include_str!("prompts/decision.md");
const BREAKDOWN_TEMPLATE: &str = include_str!("prompts/breakdown.md");
const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");

/// The only checkpoint fields a sandbox brief may carry.
#[derive(Debug, Serialize)]
struct BriefCheckpoint<'a> {
    name: &'a str,
    objective: &'a str,
    instructions: &'a [String],
    criteria: &'a [PassCriterion],
}

#[derive(Debug, Serialize)]
struct InstanceSummary<'a> {
    id: &'a str,
    kind: &'a str,
    status: &'a str,
    decision_count: u32,
}

pub struct DecisionPromptInput<'a> {
    pub instance: &'a Instance,
    pub parent: Option<&'a str>,
    pub children: Vec<&'a str>,
    pub checkpoint: Option<&'a Checkpoint>,
    pub window: &'a ContextWindow,
}

/// Template engine wrapper around minijinja.
pub struct PromptRenderer {
    env: Environment<'static>,
}

impl Default for PromptRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("checkpoint", CHECKPOINT_TEMPLATE)
            .expect("checkpoint template should be valid");
        env.add_template("decision", DECISION_TEMPLATE)
            .expect("decision template should be valid");
        env.add_template("breakdown", BREAKDOWN_TEMPLATE)
            .expect("breakdown template should be valid");
        env.add_template("plan", PLAN_TEMPLATE)
            .expect("plan template should be valid");
        Self { env }
    }

    /// Brief for a fresh checkpoint sandbox: working directory, description,
    /// numbered instructions and pass criteria. Nothing else.
    pub fn render_checkpoint(&self, checkpoint: &Checkpoint, working_dir: &Path) -> Result<String> {
        let brief = BriefCheckpoint {
            name: &checkpoint.name,
            objective: &checkpoint.objective,
            instructions: &checkpoint.instructions,
            criteria: &checkpoint.pass_criteria,
        };
        let template = self.env.get_template("checkpoint")?;
        Ok(template.render(context! {
            checkpoint => brief,
            working_dir => working_dir.display().to_string(),
        })?)
    }

    pub fn render_decision(&self, input: &DecisionPromptInput<'_>) -> Result<String> {
        let kind = serde_json::to_value(input.instance.kind)?;
        let instance = InstanceSummary {
            id: &input.instance.id,
            kind: kind.as_str().unwrap_or("worker"),
            status: input.instance.status.as_str(),
            decision_count: input.instance.decision_count,
        };
        let recent_actions: Vec<&str> = input
            .instance
            .decisions
            .iter()
            .rev()
            .take(6)
            .rev()
            .map(|d| d.action.as_str())
            .collect();
        let allowed_actions: Vec<&str> = DecisionAction::ALL.iter().map(|a| a.as_str()).collect();
        let template = self.env.get_template("decision")?;
        Ok(template.render(context! {
            instance => instance,
            parent => input.parent,
            children => input.children,
            checkpoint => input.checkpoint,
            recent_actions => recent_actions,
            repeating_pattern => input.instance.repeating_pattern,
            messages => input.window.messages,
            dropped => input.window.dropped,
            allowed_actions => allowed_actions,
        })?)
    }

    pub fn render_breakdown(&self, draft: &Draft) -> Result<String> {
        let template = self.env.get_template("breakdown")?;
        Ok(template.render(context! { draft => draft })?)
    }

    /// Numbered checkpoint plan forwarded to a worker by `decompose_task`.
    pub fn render_plan(&self, task: &Task, checkpoints: &[Checkpoint]) -> Result<String> {
        let template = self.env.get_template("plan")?;
        Ok(template.render(context! { task => task, checkpoints => checkpoints })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::checkpoint;

    #[test]
    fn checkpoint_brief_numbers_instructions_and_criteria() {
        let mut cp = checkpoint("cp-1", "task-1");
        cp.name = "Add changelog".to_string();
        cp.objective = "Record the release".to_string();
        cp.instructions = vec!["create file".to_string(), "commit".to_string()];
        cp.pass_criteria = vec![PassCriterion {
            command: Some("git log -1".to_string()),
            ..PassCriterion::described("commit exists")
        }];
        let brief = PromptRenderer::new()
            .render_checkpoint(&cp, Path::new("/work/repo"))
            .expect("render");
        assert!(brief.contains("`/work/repo`"));
        assert!(brief.contains("1. create file"));
        assert!(brief.contains("2. commit"));
        assert!(brief.contains("1. commit exists (verify with `git log -1`)"));
        assert!(!brief.contains("cp-1"));
        assert!(!brief.contains("task-1"));
    }

    #[test]
    fn decision_prompt_flags_repeating_pattern() {
        let mut instance = crate::test_support::instance("inst-1");
        instance.repeating_pattern = true;
        let window = ContextWindow {
            messages: vec!["tests green".to_string()],
            dropped: 3,
            truncated: false,
        };
        let prompt = PromptRenderer::new()
            .render_decision(&DecisionPromptInput {
                instance: &instance,
                parent: Some("inst-0"),
                children: Vec::new(),
                checkpoint: None,
                window: &window,
            })
            .expect("render");
        assert!(prompt.contains("Prefer `escalate` or `wait`"));
        assert!(prompt.contains("3 older omitted"));
        assert!(prompt.contains("tests green"));
        assert!(prompt.contains("decompose_task"));
    }
}
