//! 宿主协作方契约
//!
//! 核心作为库被宿主进程（编辑器插件等）调用，这里定义它消费的回调边界：
//! 审批门控、diff 预览、用户提问、环境探针、任务事件通知。全部可单独替换为测试假件。

use async_trait::async_trait;

use crate::actions::ActionRequest;
use crate::core::state::{Artifacts, TaskState};

/// 门控动作的人工审批回调
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    /// 返回 false 表示拒绝，动作以 Cancelled 结果返回且执行器不会被调用
    async fn request_approval(&self, action: &ActionRequest) -> bool;
}

/// 可选的 diff 预览回调，不影响控制流
#[async_trait]
pub trait DiffPreview: Send + Sync {
    async fn preview(&self, action: &ActionRequest);
}

/// 向用户提出的问题
#[derive(Debug, Clone)]
pub struct UserQuestion {
    pub question: String,
    /// 回答存入 TaskContext.answers 的键
    pub context_key: String,
    pub default: Option<String>,
    pub allow_skip: bool,
}

/// 人工输入回调：返回 None 表示暂时无回答（走默认值 / 跳过 / 挂起等待 resume）
#[async_trait]
pub trait UserPrompter: Send + Sync {
    async fn ask(&self, question: &UserQuestion) -> Option<String>;
}

/// 受控环境的只读探针；探针失败一律按「未知/false」处理，绝不致命
#[async_trait]
pub trait EnvProbe: Send + Sync {
    /// 当前是否有可编辑场景打开
    async fn scene_open(&self) -> bool;

    /// 环境概况（已打开的场景、存在的资源等），注入任务起始上下文
    async fn snapshot(&self) -> String {
        String::new()
    }
}

/// fire-and-forget 的任务事件通知，核心不消费返回值
pub trait TaskEvents: Send + Sync {
    fn on_progress(&self, _message: &str) {}
    fn on_state_changed(&self, _state: &TaskState) {}
    fn on_completed(&self, _result: &str, _artifacts: &Artifacts) {}
    fn on_error(&self, _message: &str) {}
}

/// 默认事件接收器：全部丢弃
#[derive(Debug, Default)]
pub struct NullEvents;

impl TaskEvents for NullEvents {}

/// 默认审批：全部放行（宿主未接管门控时）
#[derive(Debug, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn request_approval(&self, _action: &ActionRequest) -> bool {
        true
    }
}

/// 默认提问回调：永远无回答（有默认值用默认值，否则按 allow_skip 处理）
#[derive(Debug, Default)]
pub struct NoPrompter;

#[async_trait]
impl UserPrompter for NoPrompter {
    async fn ask(&self, _question: &UserQuestion) -> Option<String> {
        None
    }
}

/// 默认探针：环境未知，一律 false / 空
#[derive(Debug, Default)]
pub struct NullProbe;

#[async_trait]
impl EnvProbe for NullProbe {
    async fn scene_open(&self) -> bool {
        false
    }
}
