//! 门控执行队列
//!
//! submit(action) 一次一个：门控动作先走人工审批（拒绝即 Cancelled 结果，执行器不会被调用），
//! 预览动作可选地触发 diff 回调（不影响控制流），随后在超时与取消信号约束下转发给外部
//! 执行器；失败消息统一经 RecoveryEngine 富化。每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::actions::{ActionExecutor, ActionRegistry, ActionRequest, ActionResult, ErrorCode};
use crate::core::recovery::RecoveryEngine;
use crate::host::{ApprovalGate, DiffPreview};

/// 执行队列：持有执行器、注册表、审批回调与统一超时
pub struct ExecutionQueue {
    executor: Arc<dyn ActionExecutor>,
    registry: Arc<ActionRegistry>,
    approval: Arc<dyn ApprovalGate>,
    preview: Option<Arc<dyn DiffPreview>>,
    recovery: Arc<RecoveryEngine>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl ExecutionQueue {
    pub fn new(
        executor: Arc<dyn ActionExecutor>,
        registry: Arc<ActionRegistry>,
        approval: Arc<dyn ApprovalGate>,
        recovery: Arc<RecoveryEngine>,
        timeout_secs: u64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            executor,
            registry,
            approval,
            preview: None,
            recovery,
            timeout: Duration::from_secs(timeout_secs),
            cancel,
        }
    }

    pub fn with_preview(mut self, preview: Arc<dyn DiffPreview>) -> Self {
        self.preview = Some(preview);
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 提交单个动作并返回归一化结果；取消信号会立刻中止在途执行
    pub async fn submit(&self, action: &ActionRequest) -> ActionResult {
        let start = Instant::now();

        if self.cancel.is_cancelled() {
            return ActionResult::cancelled("Cancelled before execution");
        }

        if self.registry.is_gated(&action.name) {
            let approved = tokio::select! {
                _ = self.cancel.cancelled() => false,
                a = self.approval.request_approval(action) => a,
            };
            if !approved {
                let result =
                    ActionResult::cancelled(format!("Approval denied for '{}'", action.name));
                self.audit(action, &result, "denied", start);
                return result;
            }
        }

        if self.registry.wants_preview(&action.name) {
            if let Some(preview) = &self.preview {
                preview.preview(action).await;
            }
        }

        let result = tokio::select! {
            _ = self.cancel.cancelled() => {
                ActionResult::cancelled(format!("Cancelled while executing '{}'", action.name))
            }
            outcome = timeout(self.timeout, self.executor.execute(&action.name, &action.params)) => {
                match outcome {
                    Ok(raw) => self.normalize(&action.name, raw),
                    Err(_) => {
                        let classified = self
                            .recovery
                            .classify(&format!("Action '{}' timed out", action.name));
                        ActionResult::failed(ErrorCode::Timeout, classified.message, classified.recoverable)
                    }
                }
            }
        };

        let outcome = if result.success {
            "ok"
        } else if result.code == Some(ErrorCode::Cancelled) {
            "cancelled"
        } else if result.code == Some(ErrorCode::Timeout) {
            "timeout"
        } else {
            "error"
        };
        self.audit(action, &result, outcome, start);
        result
    }

    /// 把执行器的原始返回归一化为 ActionResult；
    /// 原始值自带 {"success": false} 时其消息同样走恢复分类
    fn normalize(&self, name: &str, raw: Result<Value, String>) -> ActionResult {
        match raw {
            Ok(value) => {
                let reported_failure = value
                    .get("success")
                    .and_then(Value::as_bool)
                    .map(|ok| !ok)
                    .unwrap_or(false);
                if reported_failure {
                    let msg = value
                        .get("error")
                        .or_else(|| value.get("message"))
                        .and_then(Value::as_str)
                        .unwrap_or("action reported failure")
                        .to_string();
                    let classified = self.recovery.classify(&msg);
                    ActionResult::failed(
                        ErrorCode::ExecutionFailed,
                        classified.message,
                        classified.recoverable,
                    )
                } else {
                    let msg = value
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("ok")
                        .to_string();
                    ActionResult::ok(Some(value), msg)
                }
            }
            Err(e) => {
                let classified = self.recovery.classify(&e);
                tracing::warn!(action = name, error = %e, "action execution failed");
                ActionResult::failed(
                    ErrorCode::ExecutionFailed,
                    classified.message,
                    classified.recoverable,
                )
            }
        }
    }

    fn audit(&self, action: &ActionRequest, result: &ActionResult, outcome: &str, start: Instant) {
        let params_preview = params_preview(&action.params);
        let audit = serde_json::json!({
            "event": "action_audit",
            "action": action.name,
            "ok": result.success,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "params_preview": params_preview,
        });
        tracing::info!(audit = %audit.to_string(), "action");
    }
}

fn params_preview(params: &Value) -> String {
    let s = params.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 记录调用次数的探子执行器
    struct SpyExecutor {
        calls: AtomicUsize,
        reply: Result<Value, String>,
    }

    impl SpyExecutor {
        fn ok(reply: Value) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                reply: Ok(reply),
            }
        }

        fn err(msg: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                reply: Err(msg.to_string()),
            }
        }
    }

    #[async_trait]
    impl ActionExecutor for SpyExecutor {
        async fn execute(&self, _name: &str, _params: &Value) -> Result<Value, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone()
        }
    }

    struct Deny;

    #[async_trait]
    impl ApprovalGate for Deny {
        async fn request_approval(&self, _action: &ActionRequest) -> bool {
            false
        }
    }

    fn queue_with(executor: Arc<SpyExecutor>, approval: Arc<dyn ApprovalGate>) -> ExecutionQueue {
        ExecutionQueue::new(
            executor,
            Arc::new(ActionRegistry::with_defaults()),
            approval,
            Arc::new(RecoveryEngine::new()),
            5,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_denied_gated_action_never_reaches_executor() {
        let spy = Arc::new(SpyExecutor::ok(json!({"success": true})));
        let queue = queue_with(spy.clone(), Arc::new(Deny));
        let result = queue
            .submit(&ActionRequest::new("remove_node", json!({"path": "Player"})))
            .await;
        assert!(!result.success);
        assert!(!result.recoverable);
        assert_eq!(result.code, Some(ErrorCode::Cancelled));
        assert_eq!(spy.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ungated_action_skips_approval() {
        // Deny 审批对非门控动作不生效
        let spy = Arc::new(SpyExecutor::ok(json!({"success": true, "message": "created"})));
        let queue = queue_with(spy.clone(), Arc::new(Deny));
        let result = queue
            .submit(&ActionRequest::new("create_scene", json!({"path": "res://a.tscn"})))
            .await;
        assert!(result.success);
        assert_eq!(result.message, "created");
        assert_eq!(spy.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_raw_failure_is_classified() {
        let spy = Arc::new(SpyExecutor::ok(
            json!({"success": false, "error": "no active scene"}),
        ));
        let queue = queue_with(spy, Arc::new(crate::host::AutoApprove));
        let result = queue
            .submit(&ActionRequest::new("list_scenes", json!({})))
            .await;
        assert!(!result.success);
        assert!(result.recoverable);
        assert!(result.message.contains("open_scene"));
    }

    #[tokio::test]
    async fn test_executor_error_is_classified_unrecoverable() {
        let spy = Arc::new(SpyExecutor::err("Permission denied: res://x"));
        let queue = queue_with(spy, Arc::new(crate::host::AutoApprove));
        let result = queue
            .submit(&ActionRequest::new("list_scenes", json!({})))
            .await;
        assert!(!result.success);
        assert!(!result.recoverable);
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let spy = Arc::new(SpyExecutor::ok(json!({"success": true})));
        let queue = queue_with(spy.clone(), Arc::new(crate::host::AutoApprove));
        queue.cancel_token().cancel();
        let result = queue
            .submit(&ActionRequest::new("list_scenes", json!({})))
            .await;
        assert_eq!(result.code, Some(ErrorCode::Cancelled));
        assert_eq!(spy.calls.load(Ordering::SeqCst), 0);
    }
}
