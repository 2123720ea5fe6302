//! 任务转录（对话历史）
//!
//! 按执行顺序追加 role 标记的消息，供每轮上下文重建；token 估算用简单的字符计数近似，
//! 超过预算阈值时由循环发起一次 Oracle 摘要并整体替换。

use serde::{Deserialize, Serialize};

/// 消息角色
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Token 估算（字符计数近似）：ASCII 约 4 字符/token，非 ASCII 约 1.5 字符/token
pub fn estimate_tokens(text: &str) -> usize {
    let mut ascii_chars = 0usize;
    let mut non_ascii_chars = 0usize;
    for c in text.chars() {
        if c.is_ascii() {
            ascii_chars += 1;
        } else {
            non_ascii_chars += 1;
        }
    }
    (ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize).max(1)
}

/// 任务转录：严格按执行顺序追加，重放即可重建上下文
#[derive(Clone, Debug, Default)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// 当前转录的估算 token 总量
    pub fn estimated_tokens(&self) -> usize {
        self.messages
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum()
    }

    /// 用一条摘要型 system 消息整体替换历史（上下文压缩）
    pub fn replace_with_summary(&mut self, summary: &str) {
        self.messages = vec![Message::system(format!(
            "Previous conversation summary:\n\n{}",
            summary
        ))];
    }

    /// 拼接为 Oracle 可读的上下文段
    pub fn render(&self) -> String {
        let mut out = String::new();
        for m in &self.messages {
            let tag = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::System => "System",
            };
            out.push_str(&format!("[{}] {}\n", tag, m.content));
        }
        out
    }
}
