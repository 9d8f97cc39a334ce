//! 规划器：创建与细化计划
//!
//! create_plan 通过结构化预测把任务拆成有依赖的子任务；输出不合法时退化为单子任务计划，
//! 保证编排器总有事可做。refine_plan 根据已完成子任务的输出请求新计划，任何失败都返回 None，
//! 编排器继续执行旧计划。PlannerState 只由 Planner 修改，且只做整份计划替换。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::core::AgentError;
use crate::llm::{structured_predict, LlmClient, StructuredError};
use crate::memory::{Message, Role};
use crate::workflow::graph::{ready_sub_tasks, remaining_sub_tasks, validate_plan};
use crate::workflow::{Plan, SubTask};

const INITIAL_PLAN_PROMPT: &str = "\
Think step-by-step. Given a conversation, a set of tools and a user request, create a plan to complete the task.
The plan must follow the user request and the conversation.
Split the task into sub tasks only when it needs several tools or steps; every sub task needs a unique name, \
and its dependencies must name other sub tasks of the same plan.

The tools available are:
{tools_str}

Conversation: {chat_history}

Overall Task: {task}
";

const REFINE_PLAN_PROMPT: &str = "\
Think step-by-step. Given an overall task, a set of tools, and completed sub tasks, update (if needed) the remaining sub tasks so that the overall task can still be completed.
The plan should end with a sub task that can satisfy the overall task.
If the remaining sub tasks are sufficient, return them unchanged.

The tools available are:
{tools_str}

Overall Task: {task}

Completed Sub Tasks + Outputs:
{completed_outputs}

Remaining Sub Tasks:
{remaining_sub_tasks}
";

/// 每次编排运行一份：plan_id -> Plan，以及每个 plan 已完成的子任务（按完成顺序）
#[derive(Debug, Default, Clone)]
pub struct PlannerState {
    plans: HashMap<String, Plan>,
    completed: HashMap<String, Vec<String>>,
}

impl PlannerState {
    pub fn plan(&self, plan_id: &str) -> Option<&Plan> {
        self.plans.get(plan_id)
    }

    pub fn plan_ids(&self) -> Vec<&str> {
        self.plans.keys().map(String::as_str).collect()
    }

    /// 已完成子任务名（按完成顺序）
    pub fn completed(&self, plan_id: &str) -> &[String] {
        self.completed.get(plan_id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn completed_set(&self, plan_id: &str) -> HashSet<String> {
        self.completed(plan_id).iter().cloned().collect()
    }

    /// 依赖已全部完成、自身未完成的子任务（按计划顺序）
    pub fn next_sub_tasks(&self, plan_id: &str) -> Vec<SubTask> {
        let Some(plan) = self.plans.get(plan_id) else {
            return Vec::new();
        };
        ready_sub_tasks(plan, &self.completed_set(plan_id))
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn remaining_sub_tasks(&self, plan_id: &str) -> Vec<SubTask> {
        let Some(plan) = self.plans.get(plan_id) else {
            return Vec::new();
        };
        remaining_sub_tasks(plan, &self.completed_set(plan_id))
            .into_iter()
            .cloned()
            .collect()
    }

    fn add_completed(&mut self, plan_id: &str, name: &str) {
        let done = self.completed.entry(plan_id.to_string()).or_default();
        if !done.iter().any(|n| n == name) {
            done.push(name.to_string());
        }
    }
}

pub struct Planner {
    llm: Arc<dyn LlmClient>,
    tools_str: String,
    state: PlannerState,
}

impl Planner {
    /// `tools_str`：工具目录，每行 `name: description`
    pub fn new(llm: Arc<dyn LlmClient>, tools_str: impl Into<String>) -> Self {
        Self {
            llm,
            tools_str: tools_str.into(),
            state: PlannerState::default(),
        }
    }

    pub fn state(&self) -> &PlannerState {
        &self.state
    }

    /// 标记子任务完成；不属于当前计划的名字被忽略
    pub fn mark_completed(&mut self, plan_id: &str, name: &str) {
        let known = self
            .state
            .plan(plan_id)
            .is_some_and(|p| p.get(name).is_some());
        if known {
            self.state.add_completed(plan_id, name);
        }
    }

    /// 退化计划：一个名为 default 的子任务，输入即原任务
    pub fn fallback_plan(task: &str) -> Plan {
        Plan::new(vec![SubTask::new("default", task)])
    }

    pub async fn create_plan(
        &mut self,
        task: &str,
        history: &[Message],
    ) -> Result<(String, Plan), AgentError> {
        let prompt = INITIAL_PLAN_PROMPT
            .replace("{tools_str}", &self.tools_str)
            .replace("{chat_history}", &format_history(history))
            .replace("{task}", task);

        let plan = match structured_predict::<Plan>(self.llm.as_ref(), &prompt).await {
            Ok(plan) => match validate_plan(&plan) {
                Ok(()) => plan,
                Err(e) => {
                    tracing::info!(error = %e, "invalid plan predicted, defaulting to a single task plan");
                    Self::fallback_plan(task)
                }
            },
            Err(StructuredError::Validation(e)) => {
                tracing::info!(error = %e, "no complex plan predicted, defaulting to a single task plan");
                Self::fallback_plan(task)
            }
            Err(StructuredError::Llm(e)) => return Err(AgentError::Llm(e)),
        };

        let plan_id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(plan_id = %plan_id, sub_tasks = ?plan.names(), "initial plan");
        self.state.plans.insert(plan_id.clone(), plan.clone());
        Ok((plan_id, plan))
    }

    /// `completed_outputs`：(子任务名, 输出文本)，按完成顺序
    pub async fn refine_plan(
        &mut self,
        task: &str,
        plan_id: &str,
        completed_outputs: &[(String, String)],
    ) -> Option<Plan> {
        let current = self.state.plan(plan_id)?.clone();
        let prompt = self.refine_prompt(task, plan_id, completed_outputs);

        let predicted = match structured_predict::<Plan>(self.llm.as_ref(), &prompt).await {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(error = %e, "no new plan predicted");
                return None;
            }
        };

        let merged = merge_completed(&current, predicted, self.state.completed(plan_id));
        if let Err(e) = validate_plan(&merged) {
            tracing::warn!(error = %e, "refined plan rejected");
            return None;
        }

        tracing::debug!(plan_id = %plan_id, sub_tasks = ?merged.names(), "refined plan");
        self.state.plans.insert(plan_id.to_string(), merged.clone());
        Some(merged)
    }

    fn refine_prompt(&self, task: &str, plan_id: &str, completed_outputs: &[(String, String)]) -> String {
        let completed: String = completed_outputs
            .iter()
            .map(|(name, output)| format!("{}:\n\t{}\n", name, output))
            .collect();

        let remaining = self.state.remaining_sub_tasks(plan_id);
        let remaining_str = if remaining.is_empty() {
            "None".to_string()
        } else {
            remaining
                .iter()
                .map(|t| {
                    format!(
                        "SubTask(name='{}', input='{}', expected_output='{}', dependencies='{:?}')\n",
                        t.name, t.input, t.expected_output, t.dependencies
                    )
                })
                .collect()
        };

        REFINE_PLAN_PROMPT
            .replace("{tools_str}", self.tools_str.trim())
            .replace("{task}", task.trim())
            .replace("{completed_outputs}", completed.trim())
            .replace("{remaining_sub_tasks}", remaining_str.trim())
    }
}

/// 新计划缺少的已完成子任务按原计划顺序补在最前，保证已完成集合始终是计划名的子集
fn merge_completed(current: &Plan, mut predicted: Plan, completed: &[String]) -> Plan {
    let present: HashSet<String> = predicted.sub_tasks.iter().map(|t| t.name.clone()).collect();
    let missing: Vec<SubTask> = current
        .sub_tasks
        .iter()
        .filter(|t| completed.contains(&t.name) && !present.contains(&t.name))
        .cloned()
        .collect();
    if !missing.is_empty() {
        let mut sub_tasks = missing;
        sub_tasks.append(&mut predicted.sub_tasks);
        predicted.sub_tasks = sub_tasks;
    }
    predicted
}

fn format_history(history: &[Message]) -> String {
    if history.is_empty() {
        return "None".to_string();
    }
    history
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            format!("{}: {}", role, m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, ScriptedLlmClient};

    const TWO_STEP_PLAN: &str = r#"{"sub_tasks": [
        {"name": "research", "input": "find facts", "expected_output": "facts", "dependencies": []},
        {"name": "write", "input": "write post", "expected_output": "post", "dependencies": ["research"]}
    ]}"#;

    #[tokio::test]
    async fn test_create_plan_parses_prediction() {
        let llm = Arc::new(ScriptedLlmClient::from_texts([TWO_STEP_PLAN]));
        let mut planner = Planner::new(llm.clone(), "call_a: does a\n");
        let (plan_id, plan) = planner
            .create_plan("blog post", &[Message::user("earlier")])
            .await
            .unwrap();
        assert_eq!(plan.names(), vec!["research", "write"]);
        assert_eq!(planner.state().plan(&plan_id), Some(&plan));

        let prompt = &llm.calls()[0][0].content;
        assert!(prompt.contains("call_a: does a"));
        assert!(prompt.contains("Overall Task: blog post"));
        assert!(prompt.contains("user: earlier"));
    }

    #[tokio::test]
    async fn test_malformed_prediction_falls_back() {
        let llm = Arc::new(ScriptedLlmClient::from_texts(["I cannot plan this"]));
        let mut planner = Planner::new(llm, "");
        let (_, plan) = planner.create_plan("X", &[]).await.unwrap();
        assert_eq!(plan.sub_tasks.len(), 1);
        assert_eq!(plan.sub_tasks[0].name, "default");
        assert_eq!(plan.sub_tasks[0].input, "X");
        assert_eq!(plan.sub_tasks[0].expected_output, "");
        assert!(plan.sub_tasks[0].dependencies.is_empty());
    }

    #[tokio::test]
    async fn test_dangling_dependency_falls_back() {
        let bad = r#"{"sub_tasks": [{"name": "a", "input": "x", "dependencies": ["ghost"]}]}"#;
        let llm = Arc::new(ScriptedLlmClient::from_texts([bad]));
        let mut planner = Planner::new(llm, "");
        let (_, plan) = planner.create_plan("X", &[]).await.unwrap();
        assert_eq!(plan, Planner::fallback_plan("X"));
    }

    #[tokio::test]
    async fn test_llm_failure_is_fatal() {
        let llm = Arc::new(ScriptedLlmClient::new([]));
        llm.push_error(LlmError::ApiError("down".to_string()));
        let mut planner = Planner::new(llm, "");
        assert!(matches!(planner.create_plan("X", &[]).await, Err(AgentError::Llm(_))));
    }

    #[tokio::test]
    async fn test_refine_keeps_completed_tasks_in_plan() {
        let refined = r#"{"sub_tasks": [{"name": "edit", "input": "polish", "dependencies": ["research"]}]}"#;
        let llm = Arc::new(ScriptedLlmClient::from_texts([TWO_STEP_PLAN, refined]));
        let mut planner = Planner::new(llm.clone(), "tools");
        let (plan_id, _) = planner.create_plan("blog", &[]).await.unwrap();
        planner.mark_completed(&plan_id, "research");

        let outputs = vec![("research".to_string(), "some facts".to_string())];
        let new_plan = planner.refine_plan("blog", &plan_id, &outputs).await.unwrap();
        assert_eq!(new_plan.names(), vec!["research", "edit"]);
        assert_eq!(planner.state().next_sub_tasks(&plan_id)[0].name, "edit");

        let prompt = &llm.calls()[1][0].content;
        assert!(prompt.contains("research:\n\tsome facts"));
        assert!(prompt.contains("SubTask(name='write', input='write post'"));
    }

    #[tokio::test]
    async fn test_refine_failure_keeps_previous_plan() {
        let llm = Arc::new(ScriptedLlmClient::from_texts([TWO_STEP_PLAN, "nonsense"]));
        let mut planner = Planner::new(llm, "");
        let (plan_id, plan) = planner.create_plan("blog", &[]).await.unwrap();
        assert!(planner.refine_plan("blog", &plan_id, &[]).await.is_none());
        assert_eq!(planner.state().plan(&plan_id), Some(&plan));
    }

    #[tokio::test]
    async fn test_mark_completed_ignores_unknown_names() {
        let llm = Arc::new(ScriptedLlmClient::from_texts([TWO_STEP_PLAN]));
        let mut planner = Planner::new(llm, "");
        let (plan_id, _) = planner.create_plan("blog", &[]).await.unwrap();
        planner.mark_completed(&plan_id, "nope");
        planner.mark_completed(&plan_id, "research");
        planner.mark_completed(&plan_id, "research");
        assert_eq!(planner.state().completed(&plan_id), ["research".to_string()]);
    }
}
