//! 计划依赖图
//!
//! 使用邻接表和入度表做 DAG 校验（Kahn 拓扑排序），并计算就绪 / 剩余子任务

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use crate::workflow::types::{Plan, SubTask};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan has no sub tasks")]
    Empty,

    #[error("duplicate sub task name: {0}")]
    DuplicateName(String),

    #[error("sub task {task} depends on unknown sub task {dependency}")]
    DanglingDependency { task: String, dependency: String },

    #[error("dependency cycle among: {0:?}")]
    Cycle(Vec<String>),
}

/// 计划依赖图
pub struct PlanGraph {
    /// 邻接表：子任务名 -> 依赖它的子任务
    pub adjacency: HashMap<String, Vec<String>>,
    /// 入度表：子任务名 -> 依赖数
    pub in_degree: HashMap<String, usize>,
    order: Vec<String>,
}

impl PlanGraph {
    /// 建图；名称重复或依赖悬空时报错
    pub fn new(plan: &Plan) -> Result<Self, PlanError> {
        if plan.sub_tasks.is_empty() {
            return Err(PlanError::Empty);
        }
        let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
        let mut in_degree: HashMap<String, usize> = HashMap::new();
        let mut order = Vec::with_capacity(plan.sub_tasks.len());

        for task in &plan.sub_tasks {
            if in_degree.insert(task.name.clone(), 0).is_some() {
                return Err(PlanError::DuplicateName(task.name.clone()));
            }
            adjacency.insert(task.name.clone(), Vec::new());
            order.push(task.name.clone());
        }

        for task in &plan.sub_tasks {
            let deps: HashSet<&String> = task.dependencies.iter().collect();
            for dep in deps {
                let Some(dependents) = adjacency.get_mut(dep) else {
                    return Err(PlanError::DanglingDependency {
                        task: task.name.clone(),
                        dependency: dep.clone(),
                    });
                };
                dependents.push(task.name.clone());
                *in_degree.entry(task.name.clone()).or_insert(0) += 1;
            }
        }

        Ok(Self {
            adjacency,
            in_degree,
            order,
        })
    }

    /// 拓扑序（同层保持计划中的顺序）；有环时返回环上（及其下游）的子任务
    pub fn topological_order(&self) -> Result<Vec<String>, PlanError> {
        let mut degree = self.in_degree.clone();
        let mut queue: VecDeque<&String> = self
            .order
            .iter()
            .filter(|name| degree.get(*name) == Some(&0))
            .collect();
        let mut sorted = Vec::with_capacity(self.order.len());

        while let Some(name) = queue.pop_front() {
            sorted.push(name.clone());
            if let Some(dependents) = self.adjacency.get(name) {
                for dependent in dependents {
                    if let Some(d) = degree.get_mut(dependent) {
                        *d -= 1;
                        if *d == 0 {
                            queue.push_back(dependent);
                        }
                    }
                }
            }
        }

        if sorted.len() == self.order.len() {
            Ok(sorted)
        } else {
            let done: HashSet<&String> = sorted.iter().collect();
            let stuck = self
                .order
                .iter()
                .filter(|n| !done.contains(n))
                .cloned()
                .collect();
            Err(PlanError::Cycle(stuck))
        }
    }
}

/// 校验计划：非空、名称唯一、无悬空依赖、无环
pub fn validate_plan(plan: &Plan) -> Result<(), PlanError> {
    PlanGraph::new(plan)?.topological_order().map(|_| ())
}

/// 就绪子任务（按计划顺序）：未完成，且全部依赖已完成
pub fn ready_sub_tasks<'a>(plan: &'a Plan, completed: &HashSet<String>) -> Vec<&'a SubTask> {
    plan.sub_tasks
        .iter()
        .filter(|t| !completed.contains(&t.name))
        .filter(|t| t.dependencies.iter().all(|d| completed.contains(d)))
        .collect()
}

/// 剩余（未完成）子任务
pub fn remaining_sub_tasks<'a>(plan: &'a Plan, completed: &HashSet<String>) -> Vec<&'a SubTask> {
    plan.sub_tasks
        .iter()
        .filter(|t| !completed.contains(&t.name))
        .collect()
}
