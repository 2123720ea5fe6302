//! 动作类型与执行器边界
//!
//! ActionRequest 由 Oracle 产出（{name, params}，一经产生不可变），ActionResult 由外部执行器
//! 或 RecoveryEngine 产出；ActionExecutor 是宿主注入的统一「按名执行」契约。

pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use registry::{ActionCategory, ActionMeta, ActionRegistry, ArtifactKind};

/// 保留动作：结束任务并上报结果
pub const ACTION_COMPLETE: &str = "attempt_completion";
/// 保留动作：向用户提问并等待回答
pub const ACTION_ASK_USER: &str = "ask_followup_question";
/// 保留动作：声明多步计划（params.steps: [string]），只在循环内处理
pub const ACTION_SET_PLAN: &str = "set_plan";

/// Oracle 提出的一次动作请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub name: String,
    #[serde(default)]
    pub params: Value,
}

impl ActionRequest {
    pub fn new(name: impl Into<String>, params: Value) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    /// 取字符串参数（缺失或非字符串时返回 None）
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// 动作失败的错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// 被取消（含审批拒绝）
    Cancelled,
    /// 前置条件不满足
    PreconditionFailed,
    /// 执行超时
    Timeout,
    /// 执行器报告的失败
    ExecutionFailed,
}

/// 动作执行的归一化结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub data: Option<Value>,
    pub message: String,
    pub code: Option<ErrorCode>,
    pub recoverable: bool,
}

impl ActionResult {
    pub fn ok(data: Option<Value>, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data,
            message: message.into(),
            code: None,
            recoverable: true,
        }
    }

    pub fn failed(code: ErrorCode, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            success: false,
            data: None,
            message: message.into(),
            code: Some(code),
            recoverable,
        }
    }

    /// 审批拒绝 / 取消：不可恢复，且保证执行器未被调用
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::failed(ErrorCode::Cancelled, message, false)
    }
}

/// 外部动作执行器契约：按名执行，原始返回值可能自带 {"success": false, "error": ...}
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, name: &str, params: &Value) -> Result<Value, String>;
}
