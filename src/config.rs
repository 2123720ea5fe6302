//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `MANCER__*` 覆盖（双下划线表示嵌套，
//! 如 `MANCER__TASK__MAX_ACTIONS=50`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub task: TaskSection,
    pub queue: QueueSection,
    pub oracle: OracleSection,
    pub sessions: SessionsSection,
}

/// [task] 段：任务循环的预算与节流
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaskSection {
    /// 单任务动作数硬上限，达到即失败
    pub max_actions: usize,
    /// 连续无动作回复多少轮后注入催促
    pub max_no_action_rounds: usize,
    /// 迭代间最小延迟（毫秒），约束外呼频率
    pub throttle_ms: u64,
    /// 限流退避基数（毫秒）：等待 base * 2^(level-1)
    pub backoff_base_ms: u64,
    /// 连续限流失败上限，达到即永久失败
    pub max_rate_limit_failures: u32,
    /// 上下文 token 上限
    pub context_max_tokens: usize,
    /// 超过上限的该比例时触发 Oracle 摘要压缩
    pub compact_ratio: f32,
    /// 动作结果写入历史前的截断长度（字符）
    pub result_preview_chars: usize,
    /// 可选：注入任务起始上下文的程序性指引文本
    pub guidance: Option<String>,
}

impl Default for TaskSection {
    fn default() -> Self {
        Self {
            max_actions: 25,
            max_no_action_rounds: 3,
            throttle_ms: 500,
            backoff_base_ms: 2000,
            max_rate_limit_failures: 5,
            context_max_tokens: 128_000,
            compact_ratio: 0.75,
            result_preview_chars: 2000,
            guidance: None,
        }
    }
}

/// [queue] 段：执行队列超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    /// 单次动作执行超时（秒）
    pub action_timeout_secs: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            action_timeout_secs: 30,
        }
    }
}

/// [oracle] 段：咨询超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OracleSection {
    /// 单次 consult 超时（秒），超时按传输错误处理
    pub request_timeout_secs: u64,
}

impl Default for OracleSection {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
        }
    }
}

/// [sessions] 段：会话总线容量
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionsSection {
    /// 全局消息容量，超出按 FIFO 裁剪最老消息
    pub max_messages: usize,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self { max_messages: 200 }
    }
}

/// 从 config 目录加载配置，环境变量 MANCER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 MANCER__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("MANCER")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置（配置热更新：调用方决定是否用新配置重建组件）
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = AppConfig::default();
        assert!(cfg.task.max_actions > 0);
        assert!(cfg.task.compact_ratio > 0.0 && cfg.task.compact_ratio <= 1.0);
        assert!(cfg.queue.action_timeout_secs > 0);
        assert!(cfg.sessions.max_messages > 0);
    }

    #[test]
    fn test_load_without_files_uses_defaults() {
        let cfg = load_config(Some(PathBuf::from("/nonexistent/mancer.toml"))).unwrap();
        assert_eq!(cfg.task.max_no_action_rounds, 3);
        assert_eq!(cfg.oracle.request_timeout_secs, 60);
    }
}
