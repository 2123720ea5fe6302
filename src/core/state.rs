//! 任务状态与上下文
//!
//! TaskContext 由 TaskLoop 独占持有与修改：状态机、动作计数、用户回答、产物追踪与错误日志。
//! Completed / Failed 对单个任务实例是终态，新任务重置为 Idle -> Running。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 任务状态机：Idle -> Running -> {WaitingUser, Completed, Failed}；WaitingUser -> Running
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum TaskState {
    Idle,
    Running,
    WaitingUser,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

/// 产物追踪：有序去重的列表，按动作类型分别记录
/// attempt_completion 的 artifacts 参数也反序列化为该结构
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Artifacts {
    pub created_resources: Vec<String>,
    pub modified_resources: Vec<String>,
    pub added_entities: Vec<String>,
    pub executed_commands: Vec<String>,
}

fn push_dedup(list: &mut Vec<String>, item: &str) {
    if !item.is_empty() && !list.iter().any(|x| x == item) {
        list.push(item.to_string());
    }
}

impl Artifacts {
    pub fn record_created(&mut self, name: &str) {
        push_dedup(&mut self.created_resources, name);
    }

    pub fn record_modified(&mut self, name: &str) {
        push_dedup(&mut self.modified_resources, name);
    }

    pub fn record_entity(&mut self, name: &str) {
        push_dedup(&mut self.added_entities, name);
    }

    pub fn record_command(&mut self, name: &str) {
        push_dedup(&mut self.executed_commands, name);
    }

    /// 合并 attempt_completion 上报的产物（保持有序去重）
    pub fn merge(&mut self, other: &Artifacts) {
        for x in &other.created_resources {
            push_dedup(&mut self.created_resources, x);
        }
        for x in &other.modified_resources {
            push_dedup(&mut self.modified_resources, x);
        }
        for x in &other.added_entities {
            push_dedup(&mut self.added_entities, x);
        }
        for x in &other.executed_commands {
            push_dedup(&mut self.executed_commands, x);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.created_resources.is_empty()
            && self.modified_resources.is_empty()
            && self.added_entities.is_empty()
            && self.executed_commands.is_empty()
    }

    /// 进度段落（注入每轮上下文）
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.created_resources.is_empty() {
            parts.push(format!("created: {}", self.created_resources.join(", ")));
        }
        if !self.modified_resources.is_empty() {
            parts.push(format!("modified: {}", self.modified_resources.join(", ")));
        }
        if !self.added_entities.is_empty() {
            parts.push(format!("entities: {}", self.added_entities.join(", ")));
        }
        if !self.executed_commands.is_empty() {
            parts.push(format!("commands: {}", self.executed_commands.join(", ")));
        }
        parts.join("; ")
    }
}

/// 单条错误日志
#[derive(Clone, Debug, Serialize)]
pub struct ErrorLog {
    pub at: DateTime<Utc>,
    pub action: String,
    pub message: String,
    pub recoverable: bool,
}

/// 任务上下文：每个任务实例一份，仅 TaskLoop 修改
#[derive(Clone, Debug)]
pub struct TaskContext {
    pub task_id: String,
    pub state: TaskState,
    /// 本任务已执行的动作数（硬上限预算）
    pub actions_executed: usize,
    /// 连续无动作回复的计数
    pub no_action_rounds: usize,
    /// context_key -> 用户回答
    pub answers: std::collections::HashMap<String, String>,
    pub artifacts: Artifacts,
    pub errors: Vec<ErrorLog>,
}

impl TaskContext {
    pub fn new() -> Self {
        Self {
            task_id: format!("task_{}", uuid::Uuid::new_v4()),
            state: TaskState::Idle,
            actions_executed: 0,
            no_action_rounds: 0,
            answers: std::collections::HashMap::new(),
            artifacts: Artifacts::default(),
            errors: Vec::new(),
        }
    }

    /// 多轮续聊：保留会话历史，但重置本次调用的计数 / 产物 / 错误
    pub fn reset_counters(&mut self) {
        self.actions_executed = 0;
        self.no_action_rounds = 0;
        self.artifacts = Artifacts::default();
        self.errors.clear();
    }

    pub fn log_error(&mut self, action: &str, message: &str, recoverable: bool) {
        self.errors.push(ErrorLog {
            at: Utc::now(),
            action: action.to_string(),
            message: message.to_string(),
            recoverable,
        });
    }
}

impl Default for TaskContext {
    fn default() -> Self {
        Self::new()
    }
}
