//! 任务循环集成测试：公开 API 端到端跑通编排核心

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use mancer::actions::{ActionExecutor, ActionRegistry, ActionRequest, ACTION_COMPLETE};
use mancer::config::AppConfig;
use mancer::core::{Artifacts, TaskLoop, TaskState};
use mancer::host::{ApprovalGate, EnvProbe, TaskEvents};
use mancer::oracle::{MockOracle, OracleError, OracleReply};
use mancer::sessions::{AgentInfo, MessageKind, SessionsRegistry};

/// 记录调用次数、全部成功的执行器
struct SpyExecutor {
    calls: AtomicUsize,
}

impl SpyExecutor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ActionExecutor for SpyExecutor {
    async fn execute(&self, _name: &str, _params: &Value) -> Result<Value, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"success": true, "message": "ok"}))
    }
}

struct Deny;

#[async_trait]
impl ApprovalGate for Deny {
    async fn request_approval(&self, _action: &ActionRequest) -> bool {
        false
    }
}

struct OpenSceneProbe;

#[async_trait]
impl EnvProbe for OpenSceneProbe {
    async fn scene_open(&self) -> bool {
        true
    }

    async fn snapshot(&self) -> String {
        "Open scene: res://main.tscn".to_string()
    }
}

struct ClosedSceneProbe;

#[async_trait]
impl EnvProbe for ClosedSceneProbe {
    async fn scene_open(&self) -> bool {
        false
    }
}

/// 捕获完成回调内容的事件接收器
#[derive(Default)]
struct CapturingEvents {
    completed: Mutex<Option<(String, Artifacts)>>,
    errors: AtomicUsize,
}

impl TaskEvents for CapturingEvents {
    fn on_completed(&self, result: &str, artifacts: &Artifacts) {
        *self.completed.lock().unwrap() = Some((result.to_string(), artifacts.clone()));
    }
    fn on_error(&self, _message: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}

fn fast_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.task.throttle_ms = 0;
    cfg.task.backoff_base_ms = 100;
    cfg
}

fn action(name: &str, params: Value) -> ActionRequest {
    ActionRequest::new(name, params)
}

#[tokio::test(start_paused = true)]
async fn test_create_then_complete_tracks_artifacts() {
    let script = vec![
        Ok(OracleReply::with_actions(
            "creating the scene",
            vec![action("create_scene", json!({"path": "res://level.tscn"}))],
        )),
        Ok(OracleReply::with_actions(
            "all done",
            vec![action(
                ACTION_COMPLETE,
                json!({
                    "result": "Scene created",
                    "artifacts": {"executed_commands": ["run_game"]}
                }),
            )],
        )),
    ];
    let executor = SpyExecutor::new();
    let events = Arc::new(CapturingEvents::default());
    let mut task = TaskLoop::new(
        fast_config(),
        Arc::new(MockOracle::new(script)),
        executor.clone(),
        Arc::new(ActionRegistry::with_defaults()),
    )
    .with_events(events.clone());

    let state = task.start_task("create a level scene", true, Vec::new()).await.unwrap();

    assert_eq!(state, TaskState::Completed);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

    // 执行器产物与 attempt_completion 上报的产物合并后通过完成回调交付
    let completed = events.completed.lock().unwrap().clone().unwrap();
    assert_eq!(completed.0, "Scene created");
    assert!(completed.1.created_resources.contains(&"res://level.tscn".to_string()));
    assert!(completed.1.executed_commands.contains(&"run_game".to_string()));
    assert!(task
        .context()
        .artifacts
        .created_resources
        .contains(&"res://level.tscn".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_denied_gated_action_fails_without_executing() {
    // remove_node 是门控动作：审批拒绝即 Cancelled（不可恢复），执行器不被调用
    let script = vec![Ok(OracleReply::with_actions(
        "removing",
        vec![action("remove_node", json!({"path": "Player"}))],
    ))];
    let executor = SpyExecutor::new();
    let events = Arc::new(CapturingEvents::default());
    let mut task = TaskLoop::new(
        fast_config(),
        Arc::new(MockOracle::new(script)),
        executor.clone(),
        Arc::new(ActionRegistry::with_defaults()),
    )
    .with_approval(Arc::new(Deny))
    .with_probe(Arc::new(OpenSceneProbe))
    .with_events(events.clone());

    let state = task.start_task("remove the player node", true, Vec::new()).await.unwrap();

    assert_eq!(state, TaskState::Failed);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    assert_eq!(events.errors.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_precondition_keeps_action_out_of_queue() {
    // 场景未打开：add_node 被前置条件挡下（可恢复），指引进历史后任务仍可正常收尾
    let script = vec![
        Ok(OracleReply::with_actions(
            "adding a node",
            vec![action("add_node", json!({"name": "Player", "type": "Node2D"}))],
        )),
        Ok(OracleReply::with_actions(
            "cannot proceed without a scene",
            vec![action(ACTION_COMPLETE, json!({"result": "Blocked: no scene open"}))],
        )),
    ];
    let executor = SpyExecutor::new();
    let mut task = TaskLoop::new(
        fast_config(),
        Arc::new(MockOracle::new(script)),
        executor.clone(),
        Arc::new(ActionRegistry::with_defaults()),
    )
    .with_probe(Arc::new(ClosedSceneProbe));

    let state = task.start_task("add a player node", true, Vec::new()).await.unwrap();

    assert_eq!(state, TaskState::Completed);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    let errors = &task.context().errors;
    assert_eq!(errors.len(), 1);
    assert!(errors[0].recoverable);
    assert!(errors[0].message.contains("open_scene"));
}

#[tokio::test(start_paused = true)]
async fn test_status_reported_to_coordinator_over_bus() {
    let bus = Arc::new(SessionsRegistry::new(50));
    bus.register_agent(AgentInfo::new("coordinator", "Coordinator", "coordinator"));
    bus.register_agent(AgentInfo::new("scene_agent", "Scene Agent", "scene_agent"));

    let script = vec![Ok(OracleReply::with_actions(
        "done",
        vec![action(ACTION_COMPLETE, json!({"result": "nothing to do"}))],
    ))];
    let mut task = TaskLoop::new(
        fast_config(),
        Arc::new(MockOracle::new(script)),
        SpyExecutor::new(),
        Arc::new(ActionRegistry::with_defaults()),
    )
    .with_sessions(bus.clone(), "scene_agent", "coordinator");

    let state = task.start_task("noop", true, Vec::new()).await.unwrap();
    assert_eq!(state, TaskState::Completed);

    // 目录状态跟随任务状态，协调方按序收到 running / completed 上报
    let agents = bus.list_agents();
    let me = agents.iter().find(|a| a.id == "scene_agent").unwrap();
    assert_eq!(me.state, "completed");

    let reports = bus.conversation("scene_agent", "coordinator", 10);
    let contents: Vec<&str> = reports.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["running", "completed"]);
    assert!(reports.iter().all(|m| m.kind == MessageKind::Status));
    assert!(reports
        .iter()
        .all(|m| m.payload.as_ref().unwrap()["task_id"] == task.context().task_id.as_str()));
}

#[tokio::test(start_paused = true)]
async fn test_backoff_waits_double_per_failure() {
    // 退避等待按 base * 2^(level-1) 递增；第 3 次限流后不再等待，直接失败
    let mut cfg = fast_config();
    cfg.task.max_rate_limit_failures = 3;
    let script = vec![
        Err(OracleError::RateLimited("429".into())),
        Err(OracleError::RateLimited("429".into())),
        Err(OracleError::RateLimited("429".into())),
    ];
    let mut task = TaskLoop::new(
        cfg,
        Arc::new(MockOracle::new(script)),
        SpyExecutor::new(),
        Arc::new(ActionRegistry::with_defaults()),
    );

    let start = tokio::time::Instant::now();
    let state = task.start_task("go", true, Vec::new()).await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(state, TaskState::Failed);
    // 100ms (level 1) + 200ms (level 2)，level 3 触发失败不等待
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_millis(700));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_handle_aborts_waiting_task() {
    // Oracle 永不返回：取消句柄应能中止挂起中的咨询并转 Failed
    struct NeverOracle;

    #[async_trait]
    impl mancer::oracle::Oracle for NeverOracle {
        async fn consult(
            &self,
            _context: &str,
            _attachments: &[mancer::oracle::Attachment],
        ) -> Result<OracleReply, OracleError> {
            std::future::pending().await
        }
    }

    let mut task = TaskLoop::new(
        fast_config(),
        Arc::new(NeverOracle),
        SpyExecutor::new(),
        Arc::new(ActionRegistry::with_defaults()),
    );
    let handle = task.cancel_handle();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
    });

    let state = task.start_task("wait forever", true, Vec::new()).await.unwrap();
    canceller.await.unwrap();

    assert_eq!(state, TaskState::Failed);
    // 取消后实例作废，新任务必须另建实例
    assert!(task.start_task("again", true, Vec::new()).await.is_err());
}
