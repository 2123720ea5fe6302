//! Mancer - 编辑器智能体编排核心
//!
//! 模块划分：
//! - **actions**: 动作类型、注册表（门控 / 预览 / 前置条件 / 产物归类）与执行器契约
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务状态机、计划追踪、前置条件、恢复分类、门控执行队列、主循环
//! - **host**: 宿主回调边界（审批、diff 预览、用户提问、环境探针、任务事件）
//! - **memory**: 任务转录与 token 估算 / 压缩
//! - **oracle**: 决策方抽象（consult 契约）与脚本化 Mock
//! - **sessions**: 多智能体会话总线（目录 + 有界消息日志）

pub mod actions;
pub mod config;
pub mod core;
pub mod host;
pub mod memory;
pub mod observability;
pub mod oracle;
pub mod sessions;

pub use self::config::{load_config, reload_config, AppConfig};
pub use self::core::{AgentError, TaskLoop, TaskState};
