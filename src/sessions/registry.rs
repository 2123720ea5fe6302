//! 会话注册表（消息总线）
//!
//! 智能体目录 + 有界追加式消息日志：点对点 send / reply、broadcast 扇出、
//! history / conversation 派生视图。日志的追加与裁剪在同一把锁内完成，
//! 并发发送方下仍保持顺序与全局容量不变式；处理回调在锁外同步调用，
//! 回调错误只记日志，不影响对其它接收方的投递。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;

use crate::sessions::message::{AgentInfo, MessageHandler, MessageKind, SessionMessage};

/// 默认全局消息容量
pub const DEFAULT_MAX_MESSAGES: usize = 200;

struct Inner {
    agents: HashMap<String, AgentInfo>,
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
    log: VecDeque<SessionMessage>,
    next_id: u64,
}

/// 会话注册表：跨任务实例共享，内部互斥保护
pub struct SessionsRegistry {
    inner: Mutex<Inner>,
    max_messages: usize,
}

impl SessionsRegistry {
    pub fn new(max_messages: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                agents: HashMap::new(),
                handlers: HashMap::new(),
                log: VecDeque::new(),
                next_id: 1,
            }),
            max_messages: max_messages.max(1),
        }
    }

    pub fn register_agent(&self, info: AgentInfo) {
        let mut inner = self.lock();
        tracing::debug!(agent = %info.id, role = %info.role, "agent registered");
        inner.agents.insert(info.id.clone(), info);
    }

    pub fn unregister_agent(&self, id: &str) {
        let mut inner = self.lock();
        inner.agents.remove(id);
        inner.handlers.remove(id);
    }

    /// 更新目录条目；目标不存在时返回 false
    pub fn update_agent(&self, info: AgentInfo) -> bool {
        let mut inner = self.lock();
        if inner.agents.contains_key(&info.id) {
            inner.agents.insert(info.id.clone(), info);
            true
        } else {
            false
        }
    }

    /// 仅更新状态字段的便捷入口（任务循环上报 running / waiting_user 等）
    pub fn set_agent_state(&self, id: &str, state: &str) -> bool {
        let mut inner = self.lock();
        match inner.agents.get_mut(id) {
            Some(a) => {
                a.state = state.to_string();
                true
            }
            None => false,
        }
    }

    /// 每个智能体至多一个处理回调，重复注册覆盖旧回调
    pub fn set_handler(&self, agent_id: &str, handler: Arc<dyn MessageHandler>) {
        self.lock().handlers.insert(agent_id.to_string(), handler);
    }

    pub fn list_agents(&self) -> Vec<AgentInfo> {
        let mut agents: Vec<AgentInfo> = self.lock().agents.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// 点对点发送；未知 id 记警告但不阻断投递
    pub fn send(
        &self,
        from: &str,
        to: &str,
        content: &str,
        kind: MessageKind,
        payload: Option<Value>,
    ) -> u64 {
        self.send_inner(from, to, content, kind, None, payload)
    }

    /// 回复某条消息；原消息已被裁剪或不存在时返回 None
    pub fn reply(
        &self,
        original_id: u64,
        from: &str,
        content: &str,
        kind: MessageKind,
        payload: Option<Value>,
    ) -> Option<u64> {
        let to = {
            let inner = self.lock();
            inner
                .log
                .iter()
                .find(|m| m.id == original_id)
                .map(|m| m.from.clone())?
        };
        Some(self.send_inner(from, &to, content, kind, Some(original_id), payload))
    }

    /// 广播：向除发送方与排除列表外的所有已注册智能体逐一发送
    pub fn broadcast(
        &self,
        from: &str,
        content: &str,
        kind: MessageKind,
        exclude: &[&str],
    ) -> Vec<u64> {
        let targets: Vec<String> = {
            let inner = self.lock();
            let mut t: Vec<String> = inner
                .agents
                .keys()
                .filter(|id| id.as_str() != from && !exclude.contains(&id.as_str()))
                .cloned()
                .collect();
            t.sort();
            t
        };
        targets
            .iter()
            .map(|to| self.send_inner(from, to, content, kind, None, None))
            .collect()
    }

    /// 某智能体参与的最近 limit 条消息，窗口内按由旧到新排列
    pub fn history(&self, agent_id: &str, limit: usize) -> Vec<SessionMessage> {
        let inner = self.lock();
        let matched: Vec<SessionMessage> = inner
            .log
            .iter()
            .filter(|m| m.from == agent_id || m.to == agent_id)
            .cloned()
            .collect();
        let skip = matched.len().saturating_sub(limit);
        matched.into_iter().skip(skip).collect()
    }

    /// 仅限 a 与 b 之间往来的最近 limit 条消息
    pub fn conversation(&self, a: &str, b: &str, limit: usize) -> Vec<SessionMessage> {
        let inner = self.lock();
        let matched: Vec<SessionMessage> = inner
            .log
            .iter()
            .filter(|m| (m.from == a && m.to == b) || (m.from == b && m.to == a))
            .cloned()
            .collect();
        let skip = matched.len().saturating_sub(limit);
        matched.into_iter().skip(skip).collect()
    }

    /// 当前日志长度（测试与诊断用）
    pub fn message_count(&self) -> usize {
        self.lock().log.len()
    }

    fn send_inner(
        &self,
        from: &str,
        to: &str,
        content: &str,
        kind: MessageKind,
        reply_to: Option<u64>,
        payload: Option<Value>,
    ) -> u64 {
        let (id, handler) = {
            let mut inner = self.lock();
            if !inner.agents.contains_key(from) {
                tracing::warn!(agent = from, "send from unknown agent");
            }
            if !inner.agents.contains_key(to) {
                tracing::warn!(agent = to, "send to unknown agent");
            }

            let id = inner.next_id;
            inner.next_id += 1;
            inner.log.push_back(SessionMessage {
                id,
                from: from.to_string(),
                to: to.to_string(),
                content: content.to_string(),
                kind,
                timestamp: Utc::now(),
                reply_to,
                payload,
            });
            // 追加后立即裁剪，保证容量不变式
            while inner.log.len() > self.max_messages {
                inner.log.pop_front();
            }

            (id, inner.handlers.get(to).cloned())
        };

        // 锁外调用处理回调，允许回调内再 send / reply
        if let Some(handler) = handler {
            let msg = {
                let inner = self.lock();
                inner.log.iter().find(|m| m.id == id).cloned()
            };
            if let Some(msg) = msg {
                if let Err(e) = handler.on_message(&msg) {
                    tracing::warn!(agent = to, error = %e, "message handler failed");
                }
            }
        }
        id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // 处理回调在锁外执行，锁内不会 panic；中毒锁直接恢复内层数据
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for SessionsRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGES)
    }
}
