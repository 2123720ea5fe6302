//! Mock Oracle（用于测试，无需外部服务）
//!
//! 按脚本顺序吐出预设回复或传输错误，耗尽后返回空回复，便于本地跑通任务循环。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::oracle::{Attachment, Oracle, OracleError, OracleReply};

/// 脚本化 Mock：每次 consult 弹出队首，记录收到的上下文
pub struct MockOracle {
    script: Mutex<VecDeque<Result<OracleReply, OracleError>>>,
    seen_contexts: Mutex<Vec<String>>,
}

impl MockOracle {
    pub fn new(script: Vec<Result<OracleReply, OracleError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            seen_contexts: Mutex::new(Vec::new()),
        }
    }

    /// 所有 consult 收到的上下文快照（断言摘要 / 警告注入用）
    pub fn seen_contexts(&self) -> Vec<String> {
        self.seen_contexts.lock().expect("lock poisoned").clone()
    }

    pub fn consult_count(&self) -> usize {
        self.seen_contexts.lock().expect("lock poisoned").len()
    }
}

#[async_trait]
impl Oracle for MockOracle {
    async fn consult(
        &self,
        context: &str,
        _attachments: &[Attachment],
    ) -> Result<OracleReply, OracleError> {
        self.seen_contexts
            .lock()
            .expect("lock poisoned")
            .push(context.to_string());
        self.script
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .unwrap_or_else(|| Ok(OracleReply::text_only("(script exhausted)")))
    }
}
