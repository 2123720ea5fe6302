//! 前置条件检查
//!
//! 部分动作只有在特定环境状态下才有意义（如「有可编辑场景打开」）。提交前重新探测，
//! 最多重试 3 次以吸收异步状态变化；结果带时间戳缓存，恢复分类命中相关错误时由
//! 任务循环失效缓存，迫使下次重新探测。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::host::EnvProbe;

/// 前置条件标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Precondition {
    /// 有可编辑场景打开
    SceneOpen,
}

impl Precondition {
    /// 失败时注入历史的可执行指引
    pub fn guidance(&self) -> &'static str {
        match self {
            Precondition::SceneOpen => {
                "No editable scene is open. Open an existing scene (open_scene) or create one (create_scene), then retry."
            }
        }
    }
}

/// 探测重试次数与间隔
const PROBE_RETRIES: usize = 3;
const PROBE_RETRY_DELAY: Duration = Duration::from_millis(150);
/// 缓存有效期：超过后重新探测
const CACHE_TTL: Duration = Duration::from_secs(5);

/// 前置条件检查器：每个任务实例一份，缓存不跨任务共享
pub struct PreconditionChecker {
    probe: Arc<dyn EnvProbe>,
    cache: HashMap<Precondition, (bool, Instant)>,
}

impl PreconditionChecker {
    pub fn new(probe: Arc<dyn EnvProbe>) -> Self {
        Self {
            probe,
            cache: HashMap::new(),
        }
    }

    /// 检查前置条件：缓存命中且为真时直接放行；否则重探（最多 PROBE_RETRIES 次）。
    /// 返回 Err(指引文本) 表示重试耗尽仍不满足，动作不应进入执行队列。
    pub async fn check(&mut self, pre: Precondition) -> Result<(), String> {
        if let Some((ok, at)) = self.cache.get(&pre) {
            if *ok && at.elapsed() < CACHE_TTL {
                return Ok(());
            }
        }

        let mut ok = false;
        for attempt in 0..PROBE_RETRIES {
            ok = self.probe_once(pre).await;
            if ok {
                break;
            }
            if attempt + 1 < PROBE_RETRIES {
                tokio::time::sleep(PROBE_RETRY_DELAY).await;
            }
        }
        self.cache.insert(pre, (ok, Instant::now()));

        if ok {
            Ok(())
        } else {
            tracing::warn!(precondition = ?pre, "precondition not satisfied after retries");
            Err(pre.guidance().to_string())
        }
    }

    /// 失效某个前置条件的缓存（恢复分类命中相关错误时调用）
    pub fn invalidate(&mut self, pre: Precondition) {
        self.cache.remove(&pre);
    }

    async fn probe_once(&self, pre: Precondition) -> bool {
        match pre {
            Precondition::SceneOpen => self.probe.scene_open().await,
        }
    }
}
