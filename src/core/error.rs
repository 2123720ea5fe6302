//! Agent 错误类型
//!
//! 只承载真正跨出任务循环边界的错误：入口调用在错误状态上被拒绝、任务被取消，
//! 以及 Oracle 咨询的两类传输失败（限流走退避重试，其它立即失败）。
//! 动作层面的失败不在此表达——它们经 RecoveryEngine 归一为 ActionResult
//! 折叠进历史，用户未作答则以 WaitingUser 状态挂起。

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    /// Oracle 被限流（429 / quota），按指数退避重试，不消耗动作预算
    #[error("Oracle rate limited: {0}")]
    RateLimited(String),

    /// Oracle 其它传输错误（网络 / 超时 / 协议），任务立即失败
    #[error("Oracle transport error: {0}")]
    Transport(String),

    /// 用户或外部取消，终止且不可恢复
    #[error("Cancelled")]
    Cancelled,

    /// 在错误的状态上调用入口（如非 WaitingUser 时 resume_with_answer）
    #[error("Invalid state: {0}")]
    InvalidState(String),
}
