//! 计划追踪与步骤匹配
//!
//! PlanState 由保留动作 set_plan 声明；步骤只有在「执行的动作与当前步骤意图吻合且成功」
//! 时才推进，避免顺手的查询类调用误推计划。
//!
//! 匹配打分为启发式（类别关键词 + 参数字面值 + 兜底动词表），阈值 0.4 为经验调参的
//! 默认值而非推导常量，可按领域调整；关键词表亦非穷尽。

use serde::Serialize;

use crate::actions::{ActionMeta, ActionRequest};

/// 步骤匹配置信度阈值（可调默认值）
pub const STEP_MATCH_THRESHOLD: f32 = 0.4;

/// 兜底动词表：类别未命中时，动作名词元与步骤文本同时含有其一即给基础分
const GENERIC_VERBS: &[&str] = &[
    "create", "add", "set", "remove", "update", "open", "save", "run", "generate", "write",
];

/// 步骤状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
}

/// 计划状态：步骤描述 + 平行的状态列表 + 当前步索引
///
/// 不变式：索引单调不减且 <= 步数；同一时刻至多一个 InProgress。
#[derive(Clone, Debug, Serialize)]
pub struct PlanState {
    steps: Vec<String>,
    statuses: Vec<StepStatus>,
    current: usize,
}

impl PlanState {
    pub fn new(steps: Vec<String>) -> Self {
        let mut statuses = vec![StepStatus::Pending; steps.len()];
        if let Some(first) = statuses.first_mut() {
            *first = StepStatus::InProgress;
        }
        Self {
            steps,
            statuses,
            current: 0,
        }
    }

    pub fn current_step(&self) -> Option<&str> {
        self.steps.get(self.current).map(String::as_str)
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.current >= self.steps.len()
    }

    pub fn statuses(&self) -> &[StepStatus] {
        &self.statuses
    }

    /// 完成当前步并推进到下一步
    pub fn advance(&mut self) {
        if self.current < self.steps.len() {
            self.statuses[self.current] = StepStatus::Completed;
            self.current += 1;
            if let Some(next) = self.statuses.get_mut(self.current) {
                *next = StepStatus::InProgress;
            }
        }
    }

    /// 动作执行成功后调用：置信度达标才推进，返回是否推进
    pub fn maybe_advance(
        &mut self,
        action: &ActionRequest,
        meta: Option<&ActionMeta>,
        succeeded: bool,
    ) -> bool {
        if !succeeded || self.is_finished() {
            return false;
        }
        let step = match self.current_step() {
            Some(s) => s.to_string(),
            None => return false,
        };
        if step_match_score(&step, action, meta) >= STEP_MATCH_THRESHOLD {
            self.advance();
            true
        } else {
            false
        }
    }

    /// 计划段落（注入每轮上下文）
    pub fn summary(&self) -> String {
        let done = self
            .statuses
            .iter()
            .filter(|s| **s == StepStatus::Completed)
            .count();
        let current = self
            .current_step()
            .map(|s| format!("; current: {}", s))
            .unwrap_or_else(|| "; all steps completed".to_string());
        format!("Plan: {}/{} steps done{}", done, self.steps.len(), current)
    }
}

/// 步骤匹配打分
///
/// (a) 动作语义类别的关键词出现在步骤文本中记 0.5，参数字面值也出现再加 0.3；
/// (b) 类别未命中时退回兜底动词表（动作名词元与步骤文本同含其一）记 0.4。
pub fn step_match_score(
    step_text: &str,
    action: &ActionRequest,
    meta: Option<&ActionMeta>,
) -> f32 {
    let text = step_text.to_lowercase();
    let mut score = 0.0f32;

    let category_hit = meta
        .map(|m| m.category.keywords().iter().any(|k| text.contains(k)))
        .unwrap_or(false);
    if category_hit {
        score += 0.5;
    }

    if param_literals(action).iter().any(|v| text.contains(v)) {
        score += 0.3;
    }

    if !category_hit {
        let name_lower = action.name.to_lowercase();
        let generic_hit = GENERIC_VERBS
            .iter()
            .any(|v| name_lower.contains(v) && text.contains(v));
        if generic_hit {
            score += 0.4;
        }
    }

    score.min(1.0)
}

/// 取出长度 >= 3 的字符串参数字面值（小写化），供步骤文本比对
fn param_literals(action: &ActionRequest) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(obj) = action.params.as_object() {
        for v in obj.values() {
            if let Some(s) = v.as_str() {
                if s.len() >= 3 {
                    out.push(s.to_lowercase());
                }
            }
        }
    }
    out
}
