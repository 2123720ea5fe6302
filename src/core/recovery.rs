//! 错误恢复分类器
//!
//! 静态有序策略表 {失败签名, 错误类型, 指引, 可恢复}，首个命中生效；未命中时给出
//! 通用指引且默认可恢复。表只读，可被所有任务实例无锁共享；对前置条件缓存的失效
//! 由持有缓存的任务循环依据返回的错误类型执行。

use regex::Regex;
use serde::Serialize;

use crate::core::precondition::Precondition;

/// 已知失败的错误类型标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorType {
    NoSceneOpen,
    NodeMissing,
    FileMissing,
    AlreadyExists,
    BadParams,
    PermissionDenied,
    RateLimited,
    Timeout,
    Cancelled,
    Unknown,
}

impl ErrorType {
    /// 该错误意味着哪个前置条件的缓存已不可信
    pub fn invalidates(&self) -> Option<Precondition> {
        match self {
            ErrorType::NoSceneOpen => Some(Precondition::SceneOpen),
            _ => None,
        }
    }
}

/// 单条恢复策略
struct RecoveryStrategy {
    pattern: Regex,
    error_type: ErrorType,
    hint: &'static str,
    recoverable: bool,
}

/// 分类结果：富化后的消息 + 可恢复判定 + 错误类型
#[derive(Debug, Clone)]
pub struct Classified {
    pub message: String,
    pub recoverable: bool,
    pub error_type: ErrorType,
}

/// 恢复引擎：加载一次，跨任务只读共享
pub struct RecoveryEngine {
    strategies: Vec<RecoveryStrategy>,
}

impl RecoveryEngine {
    pub fn new() -> Self {
        let table: &[(&str, ErrorType, &str, bool)] = &[
            (
                r"(?i)no (active|open|edited) scene|scene (is )?not open",
                ErrorType::NoSceneOpen,
                "Open or create a scene first (open_scene / create_scene), then retry the action.",
                true,
            ),
            (
                r"(?i)node not found|invalid node path|no node at",
                ErrorType::NodeMissing,
                "List the scene tree (get_scene_tree) to confirm the node path before retrying.",
                true,
            ),
            (
                r"(?i)file (not found|does not exist)|no such file",
                ErrorType::FileMissing,
                "Check the path with list_scenes or read_file on a known file before retrying.",
                true,
            ),
            (
                r"(?i)already exists",
                ErrorType::AlreadyExists,
                "Use a different name, or modify the existing resource instead of creating it.",
                true,
            ),
            (
                r"(?i)invalid (parameter|argument|type)|missing required",
                ErrorType::BadParams,
                "Re-check the action parameters against the expected schema and retry.",
                true,
            ),
            (
                r"(?i)permission denied|read-?only|access (denied|restricted)",
                ErrorType::PermissionDenied,
                "The target is not writable; choose a different target or stop.",
                false,
            ),
            (
                r"(?i)rate.?limit|too many requests|429|quota",
                ErrorType::RateLimited,
                "The environment is rate limiting; wait before issuing further actions.",
                true,
            ),
            (
                r"(?i)timed? ?out",
                ErrorType::Timeout,
                "The action timed out; retry once, or choose a smaller operation.",
                true,
            ),
            (
                r"(?i)cancell?ed|denied by user",
                ErrorType::Cancelled,
                "The user declined this action; do not retry it, choose another approach or ask.",
                false,
            ),
        ];

        let strategies = table
            .iter()
            .map(|(pat, ty, hint, rec)| RecoveryStrategy {
                // 表为静态常量，模式合法性由单测保证
                pattern: Regex::new(pat).expect("invalid recovery pattern"),
                error_type: *ty,
                hint: *hint,
                recoverable: *rec,
            })
            .collect();

        Self { strategies }
    }

    /// 对失败消息分类：首个命中条目生效，未命中给通用指引且默认可恢复
    pub fn classify(&self, failure: &str) -> Classified {
        for s in &self.strategies {
            if s.pattern.is_match(failure) {
                return Classified {
                    message: format!("{} Hint: {}", failure, s.hint),
                    recoverable: s.recoverable,
                    error_type: s.error_type,
                };
            }
        }
        Classified {
            message: format!(
                "{} Hint: inspect the editor diagnostics output for details.",
                failure
            ),
            recoverable: true,
            error_type: ErrorType::Unknown,
        }
    }
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new()
    }
}
