//! 决策 Oracle 抽象
//!
//! 循环每轮通过 consult(context, attachments) 咨询外部决策服务，得到自由文本回复与
//! 建议动作列表；传输错误区分「限流（可退避重试）」与「其它（立即失败）」。

pub mod mock;

use async_trait::async_trait;
use thiserror::Error;

use crate::actions::ActionRequest;

pub use mock::MockOracle;

/// 随消息附带的二进制附件（如用户拖入的参考图）
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub mime: String,
    pub data: Vec<u8>,
}

/// Oracle 单轮回复：自由文本 + 建议动作 + 可选思考过程
#[derive(Debug, Clone, Default)]
pub struct OracleReply {
    pub text: String,
    pub actions: Vec<ActionRequest>,
    pub thinking: Option<String>,
}

impl OracleReply {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_actions(text: impl Into<String>, actions: Vec<ActionRequest>) -> Self {
        Self {
            text: text.into(),
            actions,
            thinking: None,
        }
    }
}

/// Oracle 传输错误
#[derive(Error, Debug, Clone)]
pub enum OracleError {
    /// 限流（429 / quota），循环按指数退避重试
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// 其它传输错误，任务立即失败
    #[error("transport: {0}")]
    Transport(String),
}

/// 决策 Oracle 契约：consult 为唯一请求/响应入口，摘要也通过它完成
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn consult(
        &self,
        context: &str,
        attachments: &[Attachment],
    ) -> Result<OracleReply, OracleError>;
}
