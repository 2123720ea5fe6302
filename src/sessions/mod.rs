//! 会话总线：智能体目录 + 有界消息日志
//!
//! 独立运行的智能体实例通过它异步交换状态；尽力而为投递，无持久化、无重投。

pub mod message;
pub mod registry;

pub use message::{AgentInfo, MessageHandler, MessageKind, SessionMessage};
pub use registry::{SessionsRegistry, DEFAULT_MAX_MESSAGES};
