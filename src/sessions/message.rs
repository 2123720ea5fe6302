//! 会话总线的消息协议
//!
//! 智能体目录条目（AgentInfo）与追加式消息记录（SessionMessage）；消息 id 为总线内
//! 单调递增整数，保证按发送顺序分配。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 目录中的一个智能体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    /// 角色描述（如 coordinator / scene_agent / asset_agent）
    pub role: String,
    /// 当前状态（如 idle / running / waiting_user）
    pub state: String,
}

impl AgentInfo {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: role.into(),
            state: "idle".to_string(),
        }
    }
}

/// 消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// 状态上报（任务开始 / 等待用户 / 完成 / 失败）
    Status,
    Request,
    Response,
    Broadcast,
    Error,
}

/// 单条总线消息；追加后不再修改
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub id: u64,
    pub from: String,
    pub to: String,
    pub content: String,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub reply_to: Option<u64>,
    pub payload: Option<Value>,
}

/// 接收方处理回调：同步调用，Err 只记日志不影响投递其它消息
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, msg: &SessionMessage) -> Result<(), String>;
}
