//! 任务主循环（编排器）
//!
//! 状态机 Idle -> Running -> {WaitingUser, Completed, Failed}；每轮：预算检查 -> 节流/退避 ->
//! 可选上下文压缩 -> 咨询 Oracle -> 校验并按序执行动作（先过前置条件，再进执行队列）->
//! 产物与计划推进 -> 死循环与限流检测。可恢复失败折叠进历史供 Oracle 下一轮自救，
//! 不可恢复失败与传输耗尽转 Failed 并触发错误回调；异常不穿出公共 API。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::actions::{
    ActionExecutor, ActionRegistry, ActionRequest, ACTION_ASK_USER, ACTION_COMPLETE,
    ACTION_SET_PLAN,
};
use crate::config::AppConfig;
use crate::core::error::AgentError;
use crate::core::plan::PlanState;
use crate::core::precondition::PreconditionChecker;
use crate::core::queue::ExecutionQueue;
use crate::core::recovery::RecoveryEngine;
use crate::core::state::{Artifacts, TaskContext, TaskState};
use crate::host::{
    ApprovalGate, AutoApprove, DiffPreview, EnvProbe, NoPrompter, NullEvents, NullProbe,
    TaskEvents, UserPrompter, UserQuestion,
};
use crate::memory::{Message, Transcript};
use crate::oracle::{Attachment, Oracle, OracleError, OracleReply};
use crate::sessions::{MessageKind, SessionsRegistry};

/// 死循环检测滑动窗口长度
const LOOP_WINDOW: usize = 5;
/// 窗口内最近多少条签名完全相同则判定为死循环
const LOOP_REPEAT: usize = 3;

/// 注入历史的一次性死循环警告
const LOOP_WARNING: &str = "You appear to be repeating the same actions without making progress. \
Change strategy: try a different action, inspect the environment first, or ask the user.";

/// 连续空轮后的催促
const NO_ACTION_NUDGE: &str = "You proposed no actions. You must either propose a concrete next \
action, finish with attempt_completion, or ask the user with ask_followup_question.";

/// 任务循环：每个任务实例一份；取消后实例作废，新任务另建实例
pub struct TaskLoop {
    cfg: AppConfig,
    oracle: Arc<dyn Oracle>,
    executor: Arc<dyn ActionExecutor>,
    registry: Arc<ActionRegistry>,
    recovery: Arc<RecoveryEngine>,
    approval: Arc<dyn ApprovalGate>,
    preview: Option<Arc<dyn DiffPreview>>,
    prompter: Arc<dyn UserPrompter>,
    probe: Arc<dyn EnvProbe>,
    events: Arc<dyn TaskEvents>,
    /// (总线, 本智能体 id, 协调方 id)：设置后循环向协调方上报状态
    sessions: Option<(Arc<SessionsRegistry>, String, String)>,
    cancel: CancellationToken,

    ctx: TaskContext,
    transcript: Transcript,
    plan: Option<PlanState>,
    preconditions: PreconditionChecker,
    /// 连续限流失败级别，驱动指数退避；仅本实例持有
    backoff_level: u32,
    /// 死循环检测：最近几轮的动作名签名
    signature_window: VecDeque<String>,
    /// 每会话只注入一次死循环警告
    loop_warning_injected: bool,
    /// 待发附件：随下一次 consult 发出后清空
    attachments: Vec<Attachment>,
}

impl TaskLoop {
    pub fn new(
        cfg: AppConfig,
        oracle: Arc<dyn Oracle>,
        executor: Arc<dyn ActionExecutor>,
        registry: Arc<ActionRegistry>,
    ) -> Self {
        let probe: Arc<dyn EnvProbe> = Arc::new(NullProbe);
        Self {
            cfg,
            oracle,
            executor,
            registry,
            recovery: Arc::new(RecoveryEngine::new()),
            approval: Arc::new(AutoApprove),
            preview: None,
            prompter: Arc::new(NoPrompter),
            probe: probe.clone(),
            events: Arc::new(NullEvents),
            sessions: None,
            cancel: CancellationToken::new(),
            ctx: TaskContext::new(),
            transcript: Transcript::new(),
            plan: None,
            preconditions: PreconditionChecker::new(probe),
            backoff_level: 0,
            signature_window: VecDeque::new(),
            loop_warning_injected: false,
            attachments: Vec::new(),
        }
    }

    pub fn with_approval(mut self, approval: Arc<dyn ApprovalGate>) -> Self {
        self.approval = approval;
        self
    }

    pub fn with_preview(mut self, preview: Arc<dyn DiffPreview>) -> Self {
        self.preview = Some(preview);
        self
    }

    pub fn with_prompter(mut self, prompter: Arc<dyn UserPrompter>) -> Self {
        self.prompter = prompter;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn EnvProbe>) -> Self {
        self.preconditions = PreconditionChecker::new(probe.clone());
        self.probe = probe;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn TaskEvents>) -> Self {
        self.events = events;
        self
    }

    /// 接入会话总线：任务状态变化将上报给协调方
    pub fn with_sessions(
        mut self,
        bus: Arc<SessionsRegistry>,
        agent_id: impl Into<String>,
        coordinator_id: impl Into<String>,
    ) -> Self {
        self.sessions = Some((bus, agent_id.into(), coordinator_id.into()));
        self
    }

    /// 外部取消句柄：循环挂起（等 Oracle / 等用户）期间唯一可安全调用的外部操作
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 取消任务：中止在途提交并强制 Failed
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        if !self.ctx.state.is_terminal() {
            self.fail("Cancelled by user");
        }
    }

    pub fn state(&self) -> &TaskState {
        &self.ctx.state
    }

    pub fn context(&self) -> &TaskContext {
        &self.ctx
    }

    pub fn plan(&self) -> Option<&PlanState> {
        self.plan.as_ref()
    }

    /// 启动任务
    ///
    /// reset_history=true 清空全部历史/上下文/计划（新会话）；false 保留会话历史，
    /// 只重置本次调用的计数、产物与错误（多轮续聊）。随后注入环境快照与程序性指引，
    /// 追加用户消息并进入循环。返回本次运行结束时的状态（含 WaitingUser 挂起）。
    pub async fn start_task(
        &mut self,
        message: &str,
        reset_history: bool,
        attachments: Vec<Attachment>,
    ) -> Result<TaskState, AgentError> {
        if self.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        if matches!(self.ctx.state, TaskState::Running | TaskState::WaitingUser) {
            return Err(AgentError::InvalidState(format!(
                "cannot start a task while {:?}",
                self.ctx.state
            )));
        }

        if reset_history {
            self.transcript.clear();
            self.ctx = TaskContext::new();
            self.plan = None;
            self.signature_window.clear();
            self.loop_warning_injected = false;
            self.backoff_level = 0;
        } else {
            self.ctx.reset_counters();
            self.ctx.state = TaskState::Idle;
        }
        self.attachments = attachments;

        let snapshot = self.probe.snapshot().await;
        if !snapshot.is_empty() {
            self.transcript
                .push(Message::system(format!("Environment:\n{}", snapshot)));
        }
        if let Some(guidance) = self.cfg.task.guidance.clone() {
            self.transcript.push(Message::system(guidance));
        }
        self.transcript.push(Message::user(message));

        self.set_state(TaskState::Running);
        self.run_loop().await
    }

    /// 以用户回答恢复：仅 WaitingUser 状态可调用
    pub async fn resume_with_answer(
        &mut self,
        answer: &str,
        key: &str,
    ) -> Result<TaskState, AgentError> {
        if self.ctx.state != TaskState::WaitingUser {
            return Err(AgentError::InvalidState(format!(
                "resume_with_answer requires WaitingUser, current {:?}",
                self.ctx.state
            )));
        }
        self.store_answer(key, answer);
        self.set_state(TaskState::Running);
        self.run_loop().await
    }

    /// 主循环；仅在等 Oracle 与等用户两处挂起
    async fn run_loop(&mut self) -> Result<TaskState, AgentError> {
        let queue = ExecutionQueue::new(
            self.executor.clone(),
            self.registry.clone(),
            self.approval.clone(),
            self.recovery.clone(),
            self.cfg.queue.action_timeout_secs,
            self.cancel.clone(),
        );
        let queue = match &self.preview {
            Some(p) => queue.with_preview(p.clone()),
            None => queue,
        };

        let mut first_iteration = true;

        while self.ctx.state == TaskState::Running {
            if self.cancel.is_cancelled() {
                self.fail("Cancelled by user");
                break;
            }

            // 1. 动作预算硬上限
            if self.ctx.actions_executed >= self.cfg.task.max_actions {
                self.fail(&format!(
                    "Action budget exhausted ({} actions)",
                    self.cfg.task.max_actions
                ));
                break;
            }

            // 2. 节流与限流退避
            if self.backoff_level >= self.cfg.task.max_rate_limit_failures {
                self.fail(&format!(
                    "Oracle rate limited {} consecutive times, giving up",
                    self.backoff_level
                ));
                break;
            }
            if !first_iteration {
                tokio::time::sleep(Duration::from_millis(self.cfg.task.throttle_ms)).await;
            }
            first_iteration = false;
            if self.backoff_level > 0 {
                let wait = self.cfg.task.backoff_base_ms
                    * 2u64.saturating_pow(self.backoff_level - 1);
                tracing::info!(level = self.backoff_level, wait_ms = wait, "rate-limit backoff");
                tokio::time::sleep(Duration::from_millis(wait)).await;
            }

            // 3. 上下文压缩
            let budget =
                (self.cfg.task.context_max_tokens as f32 * self.cfg.task.compact_ratio) as usize;
            if self.transcript.estimated_tokens() > budget {
                self.compact_context().await;
            }

            // 4. 咨询 Oracle
            let reply = match self.consult_oracle().await {
                Ok(reply) => reply,
                Err(AgentError::RateLimited(msg)) => {
                    self.backoff_level += 1;
                    tracing::warn!(level = self.backoff_level, %msg, "oracle rate limited");
                    // 不消耗动作预算，回到循环顶部退避重试
                    continue;
                }
                Err(AgentError::Cancelled) => {
                    self.fail("Cancelled by user");
                    break;
                }
                Err(e) => {
                    self.fail(&e.to_string());
                    break;
                }
            };

            // 5. 退避归零，文本入历史，丢弃无名动作
            self.backoff_level = 0;
            if !reply.text.is_empty() {
                self.transcript.push(Message::assistant(reply.text.clone()));
            }
            let actions: Vec<ActionRequest> = reply
                .actions
                .into_iter()
                .filter(|a| !a.name.trim().is_empty())
                .collect();

            // 6. 空轮催促
            if actions.is_empty() {
                self.ctx.no_action_rounds += 1;
                if self.ctx.no_action_rounds >= self.cfg.task.max_no_action_rounds {
                    self.transcript.push(Message::system(NO_ACTION_NUDGE));
                    self.ctx.no_action_rounds = 0;
                }
                continue;
            }
            self.ctx.no_action_rounds = 0;

            // 7. 死循环检测：本轮动作名签名进入滑动窗口
            let signature = actions
                .iter()
                .map(|a| a.name.as_str())
                .collect::<Vec<_>>()
                .join(",");
            self.signature_window.push_back(signature);
            while self.signature_window.len() > LOOP_WINDOW {
                self.signature_window.pop_front();
            }
            if !self.loop_warning_injected && self.last_signatures_identical() {
                self.transcript.push(Message::system(LOOP_WARNING));
                self.loop_warning_injected = true;
                tracing::warn!(task = %self.ctx.task_id, "action loop detected");
            }

            // 8. 按序执行本批动作
            let mut batch_failed = false;
            for action in &actions {
                if self.cancel.is_cancelled() {
                    self.fail("Cancelled by user");
                    return Ok(self.ctx.state.clone());
                }

                match action.name.as_str() {
                    ACTION_COMPLETE => {
                        self.complete(action);
                        return Ok(self.ctx.state.clone());
                    }
                    ACTION_ASK_USER => {
                        if batch_failed {
                            // 失败后不再追问，避免在失败语境下征求反馈
                            self.transcript.push(Message::system(
                                "Skipped follow-up question because an earlier action in this batch failed.",
                            ));
                            continue;
                        }
                        if !self.ask_user(action).await? {
                            // 无法立刻得到回答：挂起等待 resume_with_answer
                            return Ok(self.ctx.state.clone());
                        }
                        // 已得到回答（或走默认/跳过），剩余批次丢弃，重新咨询
                        break;
                    }
                    ACTION_SET_PLAN => {
                        self.declare_plan(action);
                    }
                    _ => {
                        let outcome = self.execute_action(&queue, action).await;
                        match outcome {
                            ActionOutcome::Ok => {}
                            ActionOutcome::RecoverableFailure => batch_failed = true,
                            ActionOutcome::Fatal => return Ok(self.ctx.state.clone()),
                        }
                    }
                }
            }
        }

        Ok(self.ctx.state.clone())
    }

    /// 执行单个普通动作：前置条件 -> 队列提交 -> 历史/产物/计划更新
    async fn execute_action(
        &mut self,
        queue: &ExecutionQueue,
        action: &ActionRequest,
    ) -> ActionOutcome {
        // 前置条件：不满足则动作不进入队列，指引折叠进历史
        if let Some(pre) = self.registry.precondition(&action.name) {
            if let Err(guidance) = self.preconditions.check(pre).await {
                self.transcript.push(Message::system(format!(
                    "Precondition failed for '{}': {}",
                    action.name, guidance
                )));
                self.ctx.log_error(&action.name, &guidance, true);
                return ActionOutcome::RecoverableFailure;
            }
        }

        let result = queue.submit(action).await;
        self.ctx.actions_executed += 1;

        // 结果截断后写回历史，供下一轮重建上下文
        let mut summary = format!("Action '{}': {}", action.name, result.message);
        if let Some(data) = &result.data {
            summary.push_str(&format!(" | data: {}", data));
        }
        summary.truncate_chars(self.cfg.task.result_preview_chars);
        self.transcript.push(Message::user(summary));

        if result.success {
            self.track_artifacts(action);
            if let Some(plan) = &mut self.plan {
                if plan.maybe_advance(action, self.registry.get(&action.name), true) {
                    self.events.on_progress(&plan.summary());
                }
            }
            self.events
                .on_progress(&format!("{} ok", action.name));
            ActionOutcome::Ok
        } else {
            // 为缓存失效再分类一次：错误类型指明哪类前置状态已不可信
            let classified = self.recovery.classify(&result.message);
            if let Some(pre) = classified.error_type.invalidates() {
                self.preconditions.invalidate(pre);
            }
            self.ctx
                .log_error(&action.name, &result.message, result.recoverable);

            if result.recoverable {
                ActionOutcome::RecoverableFailure
            } else {
                self.fail(&format!(
                    "Action '{}' failed: {}",
                    action.name, result.message
                ));
                ActionOutcome::Fatal
            }
        }
    }

    /// 保留动作 attempt_completion：合并上报产物，置 Completed，回调最终结果
    fn complete(&mut self, action: &ActionRequest) {
        if let Some(extra) = action.params.get("artifacts") {
            if let Ok(extra) = serde_json::from_value::<Artifacts>(extra.clone()) {
                self.ctx.artifacts.merge(&extra);
            }
        }
        let result = action.str_param("result").unwrap_or("Task completed");
        self.transcript
            .push(Message::assistant(format!("[completed] {}", result)));
        self.set_state(TaskState::Completed);
        self.events.on_completed(result, &self.ctx.artifacts);
        tracing::info!(task = %self.ctx.task_id, "task completed");
    }

    /// 保留动作 ask_followup_question：返回 true 表示已拿到回答（或默认/跳过）可继续，
    /// false 表示挂起在 WaitingUser 等待 resume_with_answer
    async fn ask_user(&mut self, action: &ActionRequest) -> Result<bool, AgentError> {
        let question = UserQuestion {
            question: action
                .str_param("question")
                .unwrap_or("The agent needs your input to continue.")
                .to_string(),
            context_key: action.str_param("context_key").unwrap_or("answer").to_string(),
            default: action.str_param("default").map(String::from),
            allow_skip: action
                .params
                .get("allow_skip")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false),
        };

        self.set_state(TaskState::WaitingUser);
        let answer = self.prompter.ask(&question).await;

        match answer {
            Some(answer) => {
                self.store_answer(&question.context_key, &answer);
                self.set_state(TaskState::Running);
                Ok(true)
            }
            None => {
                if let Some(default) = &question.default {
                    self.store_answer(&question.context_key, default);
                    self.transcript
                        .push(Message::system("No answer given, using the default."));
                    self.set_state(TaskState::Running);
                    Ok(true)
                } else if question.allow_skip {
                    self.transcript
                        .push(Message::system("The user skipped the question."));
                    self.set_state(TaskState::Running);
                    Ok(true)
                } else {
                    // 留在 WaitingUser；宿主稍后 resume_with_answer
                    Ok(false)
                }
            }
        }
    }

    /// 保留动作 set_plan：声明多步计划，循环内处理，不进队列
    fn declare_plan(&mut self, action: &ActionRequest) {
        let steps: Vec<String> = action
            .params
            .get("steps")
            .and_then(serde_json::Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        if steps.is_empty() {
            self.transcript
                .push(Message::system("set_plan ignored: no steps given."));
            return;
        }
        self.transcript.push(Message::system(format!(
            "Plan declared with {} steps.",
            steps.len()
        )));
        self.plan = Some(PlanState::new(steps));
    }

    /// 组装完整上下文（历史 + 进度 + 计划 + 已存回答）并咨询 Oracle；
    /// 咨询受超时与取消约束，超时按传输错误处理，取消单独成类
    async fn consult_oracle(&mut self) -> Result<OracleReply, AgentError> {
        let context = self.assemble_context();
        let attachments = std::mem::take(&mut self.attachments);
        let deadline = Duration::from_secs(self.cfg.oracle.request_timeout_secs);

        tokio::select! {
            _ = self.cancel.cancelled() => Err(AgentError::Cancelled),
            outcome = timeout(deadline, self.oracle.consult(&context, &attachments)) => {
                match outcome {
                    Ok(Ok(reply)) => Ok(reply),
                    Ok(Err(OracleError::RateLimited(msg))) => Err(AgentError::RateLimited(msg)),
                    Ok(Err(OracleError::Transport(msg))) => Err(AgentError::Transport(msg)),
                    Err(_) => Err(AgentError::Transport("consult timed out".to_string())),
                }
            }
        }
    }

    fn assemble_context(&self) -> String {
        let mut context = self.transcript.render();
        if !self.ctx.artifacts.is_empty() {
            context.push_str(&format!("\n[Progress] {}", self.ctx.artifacts.summary()));
        }
        if let Some(plan) = &self.plan {
            context.push_str(&format!("\n[Plan] {}", plan.summary()));
        }
        if !self.ctx.answers.is_empty() {
            let mut pairs: Vec<_> = self.ctx.answers.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));
            let answers = pairs
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("; ");
            context.push_str(&format!("\n[Answers] {}", answers));
        }
        context
    }

    /// 历史超出 token 预算时用 Oracle 摘要整体替换；摘要咨询与普通咨询一样
    /// 受超时与取消约束。摘要失败 / 超时 / 被取消都不致命，继续用原历史
    /// （取消随后在本轮咨询处收口为 Cancelled）。
    async fn compact_context(&mut self) {
        let prompt = format!(
            "Summarize the following task transcript for continued work. \
Keep the goal, created or modified resources, open questions and the current plan state.\n\n{}",
            self.transcript.render()
        );
        let deadline = Duration::from_secs(self.cfg.oracle.request_timeout_secs);

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => None,
            outcome = timeout(deadline, self.oracle.consult(&prompt, &[])) => Some(outcome),
        };
        match outcome {
            Some(Ok(Ok(reply))) if !reply.text.is_empty() => {
                tracing::info!(task = %self.ctx.task_id, "context compacted");
                self.transcript.replace_with_summary(&reply.text);
            }
            Some(Ok(Ok(_))) => {}
            Some(Ok(Err(e))) => {
                tracing::warn!(error = %e, "context compaction failed, keeping history");
            }
            Some(Err(_)) => {
                tracing::warn!("context compaction timed out, keeping history");
            }
            None => {
                tracing::info!(task = %self.ctx.task_id, "cancelled during compaction");
            }
        }
    }

    fn track_artifacts(&mut self, action: &ActionRequest) {
        use crate::actions::ArtifactKind;
        let Some(meta) = self.registry.get(&action.name) else {
            return;
        };
        let value = meta
            .artifact_param
            .and_then(|p| action.str_param(p))
            .unwrap_or(&action.name)
            .to_string();
        match meta.artifact {
            ArtifactKind::CreatedResource => self.ctx.artifacts.record_created(&value),
            ArtifactKind::ModifiedResource => self.ctx.artifacts.record_modified(&value),
            ArtifactKind::AddedEntity => self.ctx.artifacts.record_entity(&value),
            ArtifactKind::ExecutedCommand => self.ctx.artifacts.record_command(&value),
            ArtifactKind::None => {}
        }
    }

    fn last_signatures_identical(&self) -> bool {
        if self.signature_window.len() < LOOP_REPEAT {
            return false;
        }
        let mut tail = self.signature_window.iter().rev().take(LOOP_REPEAT);
        let first = match tail.next() {
            Some(s) => s,
            None => return false,
        };
        tail.all(|s| s == first)
    }

    fn store_answer(&mut self, key: &str, answer: &str) {
        self.ctx.answers.insert(key.to_string(), answer.to_string());
        self.transcript
            .push(Message::user(format!("Answer ({}): {}", key, answer)));
    }

    fn set_state(&mut self, state: TaskState) {
        if self.ctx.state == state {
            return;
        }
        self.ctx.state = state.clone();
        self.events.on_state_changed(&state);
        self.report_status(&state);
    }

    /// 失败收口：置 Failed、记错误日志、错误回调恰好触发一次
    fn fail(&mut self, message: &str) {
        if self.ctx.state == TaskState::Failed {
            return;
        }
        tracing::error!(task = %self.ctx.task_id, %message, "task failed");
        self.ctx.log_error("task", message, false);
        self.set_state(TaskState::Failed);
        self.events.on_error(message);
    }

    /// 向协调方上报状态（接入总线时）
    fn report_status(&self, state: &TaskState) {
        let Some((bus, agent_id, coordinator_id)) = &self.sessions else {
            return;
        };
        let state_str = match state {
            TaskState::Idle => "idle",
            TaskState::Running => "running",
            TaskState::WaitingUser => "waiting_user",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        };
        bus.set_agent_state(agent_id, state_str);
        bus.send(
            agent_id,
            coordinator_id,
            state_str,
            MessageKind::Status,
            Some(serde_json::json!({ "task_id": self.ctx.task_id })),
        );
    }
}

/// 单个动作的循环内结局
enum ActionOutcome {
    Ok,
    /// 可恢复失败：折叠进历史，抑制同批追问，继续后续动作
    RecoverableFailure,
    /// 不可恢复：任务已转 Failed，停止处理剩余批次
    Fatal,
}

/// 按字符数截断（String::truncate 按字节会切坏多字节字符）
trait TruncateChars {
    fn truncate_chars(&mut self, max: usize);
}

impl TruncateChars for String {
    fn truncate_chars(&mut self, max: usize) {
        if self.chars().count() > max {
            let truncated: String = self.chars().take(max).collect();
            *self = format!("{}...", truncated);
        }
    }
}
